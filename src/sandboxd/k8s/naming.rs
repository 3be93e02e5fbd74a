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

//! Well-known label, annotation and finalizer keys plus the naming helpers
//! that derive them.

use rand::Rng;
use serde::Serialize;
use sha1::{Digest, Sha1};

/// FNV-1a hash of the sandbox name, stamped on its pod.
pub const LABEL_SANDBOX_NAME_HASH: &str = "agents.x-k8s.io/sandbox-name-hash";
/// Name hash of the warm pool an idle sandbox belongs to.
pub const LABEL_POOL: &str = "agents.x-k8s.io/pool";
/// Name hash of the template a sandbox was stamped from.
pub const LABEL_TEMPLATE_REF_HASH: &str = "agents.x-k8s.io/sandbox-template-ref-hash";
/// Revision of the template spec a pool member was stamped from.
pub const LABEL_POD_TEMPLATE_HASH: &str = "agents.x-k8s.io/pod-template-hash";

/// Back-reference from a sandbox to its pod.
pub const ANNOTATION_POD_NAME: &str = "agents.x-k8s.io/pod-name";
/// `warm` or `cold`, stamped when a claim binds the sandbox.
pub const ANNOTATION_LAUNCH_TYPE: &str = "agents.x-k8s.io/launch-type";
/// Pool a sandbox was adopted from.
pub const ANNOTATION_ADOPTED_FROM: &str = "agents.x-k8s.io/adopted-from";
/// Time the sandbox was first seen ready; guards the creation latency sample.
pub const ANNOTATION_READINESS_OBSERVED: &str = "agents.x-k8s.io/readiness-observed";
/// Serialized trace propagation carrier.
pub const ANNOTATION_TRACE_CONTEXT: &str = "opentelemetry.io/trace-context";

pub const FINALIZER_SANDBOX: &str = "agents.x-k8s.io/sandbox-protection";

const MAX_NAME_LENGTH: usize = 63;
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const REVISION_HASH_LENGTH: usize = 10;

/// 32-bit FNV-1a of `name`, rendered as eight hex digits. Keeps label values
/// short and valid regardless of the source name.
pub fn name_hash(name: &str) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{hash:08x}")
}

pub fn random_suffix(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// Name for a new pool member: `<pool>-<suffix>`, truncating the pool name
/// so the result stays within the object name limit.
pub fn member_name(pool: &str, suffix: &str) -> String {
    let budget = MAX_NAME_LENGTH.saturating_sub(suffix.len() + 1);
    let prefix: String = pool.chars().take(budget).collect();
    let prefix = prefix.trim_end_matches('-');
    format!("{prefix}-{suffix}")
}

/// Short content hash used to detect members stamped from an older template.
pub fn revision_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let payload = serde_json::to_vec(value)?;
    let digest = Sha1::digest(&payload);
    let full = format!("{:x}", digest);
    Ok(full[..REVISION_HASH_LENGTH.min(full.len())].to_string())
}
