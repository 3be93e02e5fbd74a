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

//! Three-way merge of labels and annotations.
//!
//! Desired keys come from the template and the claim, with claim values
//! winning on collision. Keys already present on the live object are kept
//! unless an earlier merge wrote them and they have since left the desired
//! set; the set of keys written by the previous merge is carried in
//! [`AppliedKeys`] and persisted by the caller.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Label and annotation maps projected onto sandboxes and pods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new(
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        Self {
            labels,
            annotations,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

/// Keys written by the most recent merge into a given target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedKeys {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub annotations: BTreeSet<String>,
}

impl AppliedKeys {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub metadata: Metadata,
    pub applied: AppliedKeys,
}

impl MergeOutcome {
    /// Whether writing the merged metadata would change `live`.
    pub fn differs_from(&self, live: &Metadata) -> bool {
        self.metadata != *live
    }
}

/// Merges template and claim metadata onto the live object's metadata.
pub fn merge(
    live: &Metadata,
    template: &Metadata,
    claim: &Metadata,
    last_applied: &AppliedKeys,
) -> MergeOutcome {
    let (labels, applied_labels) = merge_map(
        &live.labels,
        &template.labels,
        &claim.labels,
        &last_applied.labels,
    );
    let (annotations, applied_annotations) = merge_map(
        &live.annotations,
        &template.annotations,
        &claim.annotations,
        &last_applied.annotations,
    );

    MergeOutcome {
        metadata: Metadata {
            labels,
            annotations,
        },
        applied: AppliedKeys {
            labels: applied_labels,
            annotations: applied_annotations,
        },
    }
}

fn merge_map(
    live: &BTreeMap<String, String>,
    template: &BTreeMap<String, String>,
    claim: &BTreeMap<String, String>,
    previous: &BTreeSet<String>,
) -> (BTreeMap<String, String>, BTreeSet<String>) {
    let mut merged = live.clone();
    let mut desired = BTreeSet::new();

    // Claim entries come last so they override the template on collision.
    for (key, value) in template.iter().chain(claim.iter()) {
        merged.insert(key.clone(), value.clone());
        desired.insert(key.clone());
    }

    for stale in previous.difference(&desired) {
        merged.remove(stale);
    }

    (merged, desired)
}
