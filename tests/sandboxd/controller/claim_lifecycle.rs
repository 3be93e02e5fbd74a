use sandboxd::sandboxd::config::ControllerConfig;
use sandboxd::sandboxd::k8s::claim::{
    LaunchType, SandboxClaim, REASON_SANDBOX_NOT_READY, REASON_SANDBOX_READY, REASON_STARTUP_TIMEOUT,
};
use sandboxd::sandboxd::k8s::condition::{find_condition, ConditionStatus, CONDITION_READY};
use sandboxd::sandboxd::k8s::naming::LABEL_POOL;
use sandboxd::sandboxd::k8s::pod::Pod;
use sandboxd::sandboxd::k8s::sandbox::Sandbox;
use sandboxd::sandboxd::k8s::warmpool::SandboxWarmPool;
use sandboxd::sandboxd::observability::metrics::{claim_startup_sample_count, StartupStatus};
use sandboxd::sandboxd::test_support::{sample_template, Harness};
use std::time::Duration;

const NAMESPACE: &str = "default";

fn claim(harness: &Harness, name: &str) -> SandboxClaim {
    harness.client.get(NAMESPACE, name).expect("claim")
}

fn ready_reason(claim: &SandboxClaim) -> Option<(ConditionStatus, String)> {
    find_condition(&claim.status.conditions, CONDITION_READY)
        .map(|condition| (condition.status, condition.reason.clone()))
}

fn idle_members(harness: &Harness) -> Vec<Sandbox> {
    harness
        .client
        .list::<Sandbox>(Some(NAMESPACE))
        .expect("list sandboxes")
        .into_iter()
        .filter(|sandbox| {
            !sandbox.metadata.is_deleting() && sandbox.metadata.label(LABEL_POOL).is_some()
        })
        .collect()
}

#[test]
fn scenario_warm_claim_then_cold_claim_then_replenish() {
    let template = "lifecycle-python";
    let harness = Harness::new();
    harness
        .client
        .create(&sample_template(NAMESPACE, template))
        .expect("template");
    harness
        .client
        .create(&SandboxWarmPool::new(NAMESPACE, "pool", template, 1))
        .expect("pool");
    harness.settle(2);
    harness.mark_all_pods_ready();
    harness.settle(1);

    let members = idle_members(&harness);
    assert_eq!(members.len(), 1);
    assert!(members[0].is_ready());
    let member = members[0].metadata.name.clone();

    harness
        .client
        .create(&SandboxClaim::new(NAMESPACE, "c1", template))
        .expect("claim c1");
    harness.reconcile_claim(NAMESPACE, "c1").expect("c1 reconcile");

    let c1 = claim(&harness, "c1");
    assert_eq!(c1.status.launch_type, Some(LaunchType::Warm));
    assert_eq!(c1.status.sandbox_name(), Some(member.as_str()));
    assert_eq!(
        ready_reason(&c1),
        Some((ConditionStatus::True, REASON_SANDBOX_READY.to_string()))
    );
    let pod: Pod = harness.client.get(NAMESPACE, &member).expect("pod named after sandbox");
    assert!(pod.is_ready());

    harness
        .client
        .create(&SandboxClaim::new(NAMESPACE, "c2", template))
        .expect("claim c2");
    harness.reconcile_claim(NAMESPACE, "c2").expect("c2 reconcile");
    let c2 = claim(&harness, "c2");
    assert_eq!(c2.status.launch_type, Some(LaunchType::Cold));
    assert_eq!(c2.status.sandbox_name(), Some("c2"));
    assert_eq!(
        ready_reason(&c2).map(|(_, reason)| reason),
        Some(REASON_SANDBOX_NOT_READY.to_string())
    );

    harness.settle(3);
    let replenished = idle_members(&harness);
    assert_eq!(replenished.len(), 1, "pool refills to its target");
    assert_ne!(replenished[0].metadata.name, member);

    harness.mark_all_pods_ready();
    harness.settle(2);
    let c2 = claim(&harness, "c2");
    assert_eq!(
        ready_reason(&c2),
        Some((ConditionStatus::True, REASON_SANDBOX_READY.to_string()))
    );
    let pod: Pod = harness.client.get(NAMESPACE, "c2").expect("cold pod");
    assert!(pod.is_ready());

    assert_eq!(
        claim_startup_sample_count(LaunchType::Warm, StartupStatus::Success, template),
        1
    );
    assert_eq!(
        claim_startup_sample_count(LaunchType::Cold, StartupStatus::Success, template),
        1
    );
}

#[test]
fn scenario_startup_timeout_is_terminal_until_conditions_cleared() {
    let template = "lifecycle-timeout";
    let harness = Harness::with_config(ControllerConfig {
        ready_timeout: Duration::from_secs(30),
        ..ControllerConfig::default()
    });
    harness
        .client
        .create(&sample_template(NAMESPACE, template))
        .expect("template");
    harness
        .client
        .create(&SandboxClaim::new(NAMESPACE, "slow", template))
        .expect("claim");
    harness.settle(2);
    assert_eq!(
        ready_reason(&claim(&harness, "slow")).map(|(_, reason)| reason),
        Some(REASON_SANDBOX_NOT_READY.to_string())
    );

    harness.clock.advance(Duration::from_secs(31));
    harness.reconcile_claim(NAMESPACE, "slow").expect("timeout pass");
    let timed_out = claim(&harness, "slow");
    assert!(timed_out.status.is_terminal());
    assert_eq!(
        ready_reason(&timed_out),
        Some((ConditionStatus::False, REASON_STARTUP_TIMEOUT.to_string()))
    );
    assert_eq!(
        claim_startup_sample_count(LaunchType::Cold, StartupStatus::Failure, template),
        1
    );

    harness.mark_all_pods_ready();
    harness.settle(2);
    let held = claim(&harness, "slow");
    assert_eq!(held.status, timed_out.status);
    assert_eq!(
        claim_startup_sample_count(LaunchType::Cold, StartupStatus::Success, template),
        0
    );

    let mut cleared = held;
    cleared.status.conditions.clear();
    harness.client.update(&cleared).expect("clear conditions");
    harness.reconcile_claim(NAMESPACE, "slow").expect("retriggered pass");
    let recovered = claim(&harness, "slow");
    assert_eq!(
        ready_reason(&recovered),
        Some((ConditionStatus::True, REASON_SANDBOX_READY.to_string()))
    );
    assert_eq!(
        claim_startup_sample_count(LaunchType::Cold, StartupStatus::Success, template),
        0,
        "one startup sample per claim"
    );
}

#[test]
fn scenario_pool_converges_without_overshoot() {
    let template = "lifecycle-pool";
    let harness = Harness::new();
    harness
        .client
        .create(&sample_template(NAMESPACE, template))
        .expect("template");
    harness
        .client
        .create(&SandboxWarmPool::new(NAMESPACE, "pool", template, 3))
        .expect("pool");

    for _ in 0..5 {
        harness.reconcile_pool(NAMESPACE, "pool").expect("pool pass");
        assert_eq!(idle_members(&harness).len(), 3);
    }

    harness.settle(1);
    harness.mark_all_pods_ready();
    harness.settle(2);
    let pool: SandboxWarmPool = harness.client.get(NAMESPACE, "pool").expect("pool");
    assert_eq!(pool.status.replicas, 3);
    assert_eq!(pool.status.ready_replicas, 3);

    let mut shrunk = pool;
    shrunk.spec.replicas = 1;
    harness.client.update(&shrunk).expect("scale down");
    harness.reconcile_pool(NAMESPACE, "pool").expect("scale down pass");
    assert_eq!(idle_members(&harness).len(), 1);
}

#[test]
fn scenario_pool_recovers_once_template_appears() {
    let template = "lifecycle-late-template";
    let harness = Harness::new();
    harness
        .client
        .create(&SandboxWarmPool::new(NAMESPACE, "late", template, 2))
        .expect("pool");

    assert!(harness.reconcile_pool(NAMESPACE, "late").is_err());
    assert!(idle_members(&harness).is_empty());

    harness
        .client
        .create(&sample_template(NAMESPACE, template))
        .expect("template");
    harness.reconcile_pool(NAMESPACE, "late").expect("pool pass");
    assert_eq!(idle_members(&harness).len(), 2);

    let pool: SandboxWarmPool = harness.client.get(NAMESPACE, "late").expect("pool");
    let ready = find_condition(&pool.status.conditions, CONDITION_READY).expect("ready condition");
    assert_ne!(ready.reason, "TemplateNotFound");
}
