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

//! Trace identifiers for the controllers. Spans are backed by the `tracing`
//! crate; a task-local [`TraceContext`] lets the logger stamp `trace_id` and
//! `span_id` on every line. Because a claim is created, adopted and marked
//! ready by different reconciles, the context is also persisted on objects
//! as a W3C `traceparent` inside a JSON carrier annotation.

use crate::sandboxd::k8s::naming::ANNOTATION_TRACE_CONTEXT;
use rand::{rngs::OsRng, RngCore};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::future::Future;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::task_local;
use tracing::Instrument;
use tracing_subscriber::registry::Registry;

const TRACEPARENT_KEY: &str = "traceparent";
const TRACEPARENT_VERSION: &str = "00";
const SAMPLED_FLAGS: &str = "01";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: Arc<str>,
    span_id: Arc<str>,
}

impl TraceContext {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Serializes the context as a JSON map carrier.
    pub fn to_carrier(&self) -> String {
        let mut carrier = HashMap::new();
        carrier.insert(
            TRACEPARENT_KEY,
            format!(
                "{TRACEPARENT_VERSION}-{}-{}-{SAMPLED_FLAGS}",
                self.trace_id, self.span_id
            ),
        );
        serde_json::to_string(&carrier).unwrap_or_default()
    }

    /// Parses a carrier written by [`TraceContext::to_carrier`]. Anything
    /// malformed yields `None`.
    pub fn from_carrier(carrier: &str) -> Option<Self> {
        let map: HashMap<String, String> = serde_json::from_str(carrier).ok()?;
        let traceparent = map.get(TRACEPARENT_KEY)?;
        let mut parts = traceparent.split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let _flags = parts.next()?;
        if parts.next().is_some() || version != TRACEPARENT_VERSION {
            return None;
        }
        if !is_hex_id(trace_id, 32) || !is_hex_id(span_id, 16) {
            return None;
        }
        Some(Self {
            trace_id: Arc::from(trace_id),
            span_id: Arc::from(span_id),
        })
    }
}

fn is_hex_id(value: &str, len: usize) -> bool {
    value.len() == len
        && value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && value.bytes().any(|b| b != b'0')
}

task_local! {
    static ACTIVE_TRACE: TraceContext;
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber exactly once.
pub fn init() {
    TRACING_INIT.get_or_init(|| {
        let subscriber = Registry::default();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Returns the currently active [`TraceContext`], if any.
pub fn current_context() -> Option<TraceContext> {
    ACTIVE_TRACE.try_with(|ctx| ctx.clone()).ok()
}

/// Reads the carrier annotation from an object's annotations.
pub fn extract(annotations: &BTreeMap<String, String>) -> Option<TraceContext> {
    annotations
        .get(ANNOTATION_TRACE_CONTEXT)
        .and_then(|carrier| TraceContext::from_carrier(carrier))
}

/// Writes the active context into `annotations` unless a valid one is
/// already there. Returns whether the map changed.
pub fn inject_if_absent(annotations: &mut BTreeMap<String, String>) -> bool {
    if extract(annotations).is_some() {
        return false;
    }
    let Some(ctx) = current_context() else {
        return false;
    };
    annotations.insert(ANNOTATION_TRACE_CONTEXT.to_string(), ctx.to_carrier());
    true
}

fn child_of(parent: Option<&TraceContext>) -> TraceContext {
    let trace_id = parent
        .map(|ctx| ctx.trace_id.clone())
        .unwrap_or_else(|| Arc::<str>::from(generate_trace_id()));
    TraceContext {
        trace_id,
        span_id: Arc::<str>::from(generate_span_id()),
    }
}

/// Execute `fut` while publishing a tracing span whose identifiers are
/// propagated through the [`TraceContext`].
pub async fn with_span<T>(
    component: &'static str,
    span_name: impl Into<String>,
    fut: impl Future<Output = T>,
) -> T {
    let existing = current_context();
    let context = child_of(existing.as_ref());
    let name = span_name.into();
    let span = tracing::info_span!(
        "sandboxd",
        component = component,
        span = name.as_str(),
        trace_id = context.trace_id(),
        span_id = context.span_id(),
    );

    ACTIVE_TRACE.scope(context, fut.instrument(span)).await
}

/// Synchronous span scope. `parent` (usually extracted from an annotation)
/// wins over the active context; with neither a root trace is started.
pub fn in_span<T>(
    parent: Option<TraceContext>,
    component: &'static str,
    span_name: &str,
    f: impl FnOnce() -> T,
) -> T {
    let parent = parent.or_else(current_context);
    let context = child_of(parent.as_ref());
    let span = tracing::info_span!(
        "sandboxd",
        component = component,
        span = span_name,
        trace_id = context.trace_id(),
        span_id = context.span_id(),
    );
    ACTIVE_TRACE.sync_scope(context, || {
        let _guard = span.enter();
        f()
    })
}

fn generate_trace_id() -> String {
    random_hex(16)
}

fn generate_span_id() -> String {
    random_hex(8)
}

fn random_hex(bytes: usize) -> String {
    let mut data = vec![0u8; bytes];
    OsRng.fill_bytes(&mut data);
    let mut output = String::with_capacity(bytes * 2);
    for byte in data {
        let _ = write!(&mut output, "{:02x}", byte);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carrier_round_trips_trace_identity() {
        let ctx = child_of(None);
        let decoded = TraceContext::from_carrier(&ctx.to_carrier()).expect("valid carrier");
        assert_eq!(decoded, ctx);
    }

    #[test]
    fn malformed_carriers_are_ignored() {
        for carrier in [
            "",
            "not json",
            "{}",
            r#"{"traceparent":"00-abc-def-01"}"#,
            r#"{"traceparent":"00-00000000000000000000000000000000-0000000000000001-01"}"#,
            r#"{"traceparent":"ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"}"#,
        ] {
            assert!(TraceContext::from_carrier(carrier).is_none(), "{carrier}");
        }
        assert!(TraceContext::from_carrier(
            r#"{"traceparent":"00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"}"#
        )
        .is_some());
    }

    #[test]
    fn spans_inherit_parent_trace() {
        let parent = child_of(None);
        let (trace_id, span_id) = in_span(Some(parent.clone()), "test", "child", || {
            let ctx = current_context().expect("active context");
            (ctx.trace_id().to_string(), ctx.span_id().to_string())
        });
        assert_eq!(trace_id, parent.trace_id());
        assert_ne!(span_id, parent.span_id());
        assert!(current_context().is_none());
    }

    #[test]
    fn inject_keeps_existing_context() {
        let mut annotations = BTreeMap::new();
        assert!(!inject_if_absent(&mut annotations));

        let first = in_span(None, "test", "root", || {
            assert!(inject_if_absent(&mut annotations));
            current_context().expect("context")
        });
        let stored = extract(&annotations).expect("stored context");
        assert_eq!(stored.trace_id(), first.trace_id());

        in_span(None, "test", "other", || {
            assert!(!inject_if_absent(&mut annotations));
        });
        assert_eq!(extract(&annotations).expect("unchanged"), stored);
    }

    #[tokio::test]
    async fn async_spans_nest_under_sync_parent() {
        let root = child_of(None);
        let inner = ACTIVE_TRACE
            .scope(root.clone(), async {
                with_span("test", "nested", async { current_context() }).await
            })
            .await
            .expect("context");
        assert_eq!(inner.trace_id(), root.trace_id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn span_context_survives_suspension_points() {
        let (before, after) = with_span("test", "suspended", async {
            let before = current_context().expect("context before yield");
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            (before, current_context().expect("context after yield"))
        })
        .await;
        assert_eq!(before, after);
        assert!(current_context().is_none());
    }
}
