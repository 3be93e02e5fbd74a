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

use std::error::Error;
use std::sync::OnceLock;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::sandboxd::k8s::claim::LaunchType;

/// Claim startup buckets in milliseconds, from 50ms up to four minutes.
pub const CLAIM_STARTUP_BUCKETS_MS: [f64; 12] = [
    50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0, 120000.0,
    240000.0,
];

/// Sandbox creation buckets in milliseconds, from 50ms up to thirty seconds.
pub const SANDBOX_CREATION_BUCKETS_MS: [f64; 16] = [
    50.0, 100.0, 200.0, 300.0, 500.0, 700.0, 1000.0, 1500.0, 2000.0, 3000.0, 4500.0, 6000.0,
    9000.0, 12000.0, 18000.0, 30000.0,
];

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static SANDBOX_CREATION_LATENCY: OnceLock<HistogramVec> = OnceLock::new();
static CLAIM_STARTUP_LATENCY: OnceLock<HistogramVec> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CLAIM_ADOPTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static WARMPOOL_SANDBOXES: OnceLock<IntGaugeVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("agent_sandbox".to_string()), None)
            .expect("failed to initialise agent_sandbox metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register agent_sandbox metric collector");
    collector
}

fn claim_startup_latency() -> &'static HistogramVec {
    CLAIM_STARTUP_LATENCY.get_or_init(|| {
        let opts = HistogramOpts::new(
            "claim_startup_latency_ms",
            "Milliseconds from claim creation until its sandbox became ready or failed",
        )
        .buckets(CLAIM_STARTUP_BUCKETS_MS.to_vec());
        let histogram = HistogramVec::new(opts, &["launch_type", "status", "sandbox_template"])
            .expect("failed to build claim startup latency histogram");
        register_collector(histogram)
    })
}

fn sandbox_creation_latency() -> &'static HistogramVec {
    SANDBOX_CREATION_LATENCY.get_or_init(|| {
        let opts = HistogramOpts::new(
            "sandbox_creation_latency_ms",
            "Milliseconds from sandbox creation until it was first observed ready",
        )
        .buckets(SANDBOX_CREATION_BUCKETS_MS.to_vec());
        let histogram = HistogramVec::new(opts, &["sandbox_template"])
            .expect("failed to build sandbox creation latency histogram");
        register_collector(histogram)
    })
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Controller reconciliation attempts grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn claim_adoptions_total() -> &'static IntCounterVec {
    CLAIM_ADOPTIONS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "claim_adoptions_total",
            "Warm pool adoption attempts made by claims grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("failed to build claim adoption counter");
        register_collector(counter)
    })
}

fn warmpool_sandboxes() -> &'static IntGaugeVec {
    WARMPOOL_SANDBOXES.get_or_init(|| {
        let opts = Opts::new(
            "warmpool_sandboxes",
            "Sandboxes held by a warm pool grouped by readiness",
        );
        let gauge = IntGaugeVec::new(opts, &["namespace", "pool", "state"])
            .expect("failed to build warm pool gauge");
        register_collector(gauge)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStatus {
    Success,
    Failure,
}

impl StartupStatus {
    pub fn as_label(self) -> &'static str {
        match self {
            StartupStatus::Success => "success",
            StartupStatus::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerReconcileResult {
    Success,
    Requeue,
    Conflict,
    Error,
}

impl ControllerReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Requeue => "requeue",
            ControllerReconcileResult::Conflict => "conflict",
            ControllerReconcileResult::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdoptionResult {
    Adopted,
    Conflict,
    Cold,
}

impl AdoptionResult {
    fn as_label(self) -> &'static str {
        match self {
            AdoptionResult::Adopted => "adopted",
            AdoptionResult::Conflict => "conflict",
            AdoptionResult::Cold => "cold",
        }
    }
}

pub fn record_claim_startup_latency(
    launch_type: LaunchType,
    status: StartupStatus,
    template: &str,
    elapsed_ms: u64,
) {
    claim_startup_latency()
        .with_label_values(&[launch_type.as_label(), status.as_label(), template])
        .observe(elapsed_ms as f64);
}

/// Number of startup samples recorded for one label combination.
pub fn claim_startup_sample_count(
    launch_type: LaunchType,
    status: StartupStatus,
    template: &str,
) -> u64 {
    claim_startup_latency()
        .with_label_values(&[launch_type.as_label(), status.as_label(), template])
        .get_sample_count()
}

pub fn record_sandbox_creation_latency(template: &str, elapsed_ms: u64) {
    sandbox_creation_latency()
        .with_label_values(&[template])
        .observe(elapsed_ms as f64);
}

pub fn sandbox_creation_sample_count(template: &str) -> u64 {
    sandbox_creation_latency()
        .with_label_values(&[template])
        .get_sample_count()
}

pub fn record_controller_reconcile(controller: &str, result: ControllerReconcileResult) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
}

pub fn record_claim_adoption(result: AdoptionResult) {
    claim_adoptions_total()
        .with_label_values(&[result.as_label()])
        .inc();
}

pub fn set_warmpool_sandboxes(namespace: &str, pool: &str, total: u32, ready: u32) {
    let gauge = warmpool_sandboxes();
    gauge
        .with_label_values(&[namespace, pool, "total"])
        .set(i64::from(total));
    gauge
        .with_label_values(&[namespace, pool, "ready"])
        .set(i64::from(ready));
}

pub fn clear_warmpool(namespace: &str, pool: &str) {
    let gauge = warmpool_sandboxes();
    for state in ["total", "ready"] {
        let _ = gauge.remove_label_values(&[namespace, pool, state]);
    }
}

pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_latency_is_labelled_and_bucketed() {
        let template = "metrics-test-template";
        let before = claim_startup_sample_count(LaunchType::Warm, StartupStatus::Success, template);
        record_claim_startup_latency(LaunchType::Warm, StartupStatus::Success, template, 420);
        record_claim_startup_latency(LaunchType::Cold, StartupStatus::Failure, template, 240_001);

        assert_eq!(
            claim_startup_sample_count(LaunchType::Warm, StartupStatus::Success, template),
            before + 1
        );

        let body = gather().expect("metrics encoded");
        let text = String::from_utf8(body).expect("utf8");
        assert!(text.contains("agent_sandbox_claim_startup_latency_ms_bucket"));
        assert!(text.contains("launch_type=\"warm\""));
        assert!(text.contains("status=\"failure\""));
        assert!(text.contains("sandbox_template=\"metrics-test-template\""));
        assert!(text.contains("le=\"240000\""));
    }

    #[test]
    fn creation_latency_uses_its_own_buckets() {
        let template = "metrics-creation-template";
        record_sandbox_creation_latency(template, 650);
        assert_eq!(sandbox_creation_sample_count(template), 1);

        let text = String::from_utf8(gather().expect("metrics encoded")).expect("utf8");
        assert!(text.contains("agent_sandbox_sandbox_creation_latency_ms_bucket"));
        assert!(text.contains("le=\"700\""));
        assert!(text.contains("le=\"30000\""));
    }

    #[test]
    fn warmpool_gauges_can_be_cleared() {
        set_warmpool_sandboxes("ns", "metrics-pool", 3, 2);
        let text = String::from_utf8(gather().expect("metrics encoded")).expect("utf8");
        assert!(text.contains("pool=\"metrics-pool\""));

        clear_warmpool("ns", "metrics-pool");
        let text = String::from_utf8(gather().expect("metrics encoded")).expect("utf8");
        assert!(!text.contains("pool=\"metrics-pool\""));
    }

    #[test]
    fn reconcile_and_adoption_counters_render() {
        record_controller_reconcile("claim", ControllerReconcileResult::Conflict);
        record_claim_adoption(AdoptionResult::Conflict);
        let text = String::from_utf8(gather().expect("metrics encoded")).expect("utf8");
        assert!(text.contains("agent_sandbox_controller_reconciles_total"));
        assert!(text.contains("agent_sandbox_claim_adoptions_total"));
        assert!(text.contains("result=\"conflict\""));
    }
}
