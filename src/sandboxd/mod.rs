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

//! Reconciliation core for pooled agent sandboxes: warm pools, claims and the
//! 1:1 sandbox/pod relationship, running against a declarative object API.

pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod controller;
pub mod k8s;
pub mod kubelet;
pub mod logger;
pub mod metadata;
pub mod observability;
pub mod server;
pub mod test_support;
