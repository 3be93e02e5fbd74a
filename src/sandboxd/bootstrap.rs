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

//! Seeds the object store from a JSON manifest at startup.

use crate::sandboxd::k8s::claim::SandboxClaim;
use crate::sandboxd::k8s::store::{Client, Resource, StoreError};
use crate::sandboxd::k8s::template::SandboxTemplate;
use crate::sandboxd::k8s::warmpool::SandboxWarmPool;
use crate::sandboxd::logger::{log_info, log_warn};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Objects to create at startup, applied templates first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub templates: Vec<SandboxTemplate>,
    #[serde(default)]
    pub warm_pools: Vec<SandboxWarmPool>,
    #[serde(default)]
    pub claims: Vec<SandboxClaim>,
}

#[derive(Debug)]
pub enum ManifestError {
    Read { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    Store(StoreError),
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::Read { path, source } => {
                write!(f, "failed to read manifest {}: {source}", path.display())
            }
            ManifestError::Parse { path, source } => {
                write!(f, "failed to parse manifest {}: {source}", path.display())
            }
            ManifestError::Store(err) => write!(f, "failed to apply manifest: {err}"),
        }
    }
}

impl Error for ManifestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ManifestError::Read { source, .. } => Some(source),
            ManifestError::Parse { source, .. } => Some(source),
            ManifestError::Store(err) => Some(err),
        }
    }
}

impl From<StoreError> for ManifestError {
    fn from(err: StoreError) -> Self {
        ManifestError::Store(err)
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Creates every object. Objects that already exist are left alone.
    /// Returns how many were created.
    pub fn apply(&self, client: &Client) -> Result<usize, ManifestError> {
        let mut created = 0;
        for template in &self.templates {
            created += create_if_absent(client, template)?;
        }
        for pool in &self.warm_pools {
            created += create_if_absent(client, pool)?;
        }
        for claim in &self.claims {
            created += create_if_absent(client, claim)?;
        }
        Ok(created)
    }
}

fn create_if_absent<T: Resource>(client: &Client, object: &T) -> Result<usize, ManifestError> {
    let meta = object.metadata();
    let kind = T::KIND.as_str();
    match client.create(object) {
        Ok(_) => {
            log_info(
                "bootstrap",
                "created object",
                &[("kind", kind), ("namespace", &meta.namespace), ("name", &meta.name)],
            );
            Ok(1)
        }
        Err(err) if err.is_already_exists() => {
            log_warn(
                "bootstrap",
                "object already exists",
                &[("kind", kind), ("namespace", &meta.namespace), ("name", &meta.name)],
            );
            Ok(0)
        }
        Err(err) => Err(err.into()),
    }
}
