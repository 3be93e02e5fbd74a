/*
 * Copyright (C) 2024 The Sandboxd Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::sandboxd::k8s::store::StoreError;
use std::error::Error;
use std::fmt;

/// How the runtime treats a failed reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Stale version token: re-read and retry immediately.
    Conflict,
    /// The object went away mid-reconcile: nothing left to do.
    NotFound,
    /// Retry with capped exponential backoff.
    Transient,
    /// Retrying cannot help. Surfaced on status and dropped.
    Terminal,
}

#[derive(Debug)]
pub enum ControllerError {
    Store(StoreError),
    Dependency(String),
    TemplateNotFound { namespace: String, name: String },
    /// Data-model inconsistency such as a pod name owned by another object.
    InvariantViolation(String),
    /// Some members of a batch failed; the rest were processed.
    Partial(String),
    /// Waiting on another object to settle, such as one still terminating.
    Pending(String),
}

impl ControllerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ControllerError::Store(err) => match err {
                StoreError::Conflict { .. } => ErrorClass::Conflict,
                StoreError::NotFound { .. } => ErrorClass::NotFound,
                StoreError::AlreadyExists { .. } | StoreError::Unavailable(_) => {
                    ErrorClass::Transient
                }
                StoreError::Invalid(_) | StoreError::Serialization(_) => ErrorClass::Terminal,
            },
            ControllerError::Dependency(_) => ErrorClass::Terminal,
            ControllerError::TemplateNotFound { .. } => ErrorClass::Transient,
            ControllerError::InvariantViolation(_) => ErrorClass::Terminal,
            ControllerError::Partial(_) | ControllerError::Pending(_) => ErrorClass::Transient,
        }
    }
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Store(err) => write!(f, "{err}"),
            ControllerError::Dependency(msg) => write!(f, "missing dependency: {msg}"),
            ControllerError::TemplateNotFound { namespace, name } => {
                write!(f, "sandbox template {namespace}/{name} not found")
            }
            ControllerError::InvariantViolation(msg) => write!(f, "invariant violated: {msg}"),
            ControllerError::Partial(msg) => write!(f, "{msg}"),
            ControllerError::Pending(msg) => write!(f, "waiting: {msg}"),
        }
    }
}

impl Error for ControllerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ControllerError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ControllerError {
    fn from(err: StoreError) -> Self {
        ControllerError::Store(err)
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(err: serde_json::Error) -> Self {
        ControllerError::Store(StoreError::Serialization(err))
    }
}
