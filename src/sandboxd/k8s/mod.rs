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

//! Object model for templates, warm pools, sandboxes, claims, pods and the
//! networking objects derived from them, plus the object API the controllers
//! talk to.

pub mod claim;
pub mod condition;
pub mod naming;
pub mod networkpolicy;
pub mod pod;
pub mod sandbox;
pub mod service;
pub mod store;
pub mod template;
pub mod warmpool;

/// API group and version of the sandbox kinds.
pub const API_VERSION: &str = "agents.x-k8s.io/v1alpha1";
