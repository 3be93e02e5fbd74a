use sandboxd::sandboxd::controller::claim::ClaimController;
use sandboxd::sandboxd::controller::reconcile::Reconciler;
use sandboxd::sandboxd::controller::runtime::ControllerTarget;
use sandboxd::sandboxd::k8s::claim::{LaunchType, SandboxClaim};
use sandboxd::sandboxd::k8s::naming::LABEL_POOL;
use sandboxd::sandboxd::k8s::sandbox::Sandbox;
use sandboxd::sandboxd::k8s::warmpool::SandboxWarmPool;
use sandboxd::sandboxd::test_support::{sample_template, Harness};
use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;

const NAMESPACE: &str = "default";

fn seeded(replicas: u32) -> Harness {
    let harness = Harness::new();
    harness
        .client
        .create(&sample_template(NAMESPACE, "python"))
        .expect("template");
    harness
        .client
        .create(&SandboxWarmPool::new(NAMESPACE, "py-pool", "python", replicas))
        .expect("pool");
    harness.reconcile_pool(NAMESPACE, "py-pool").expect("fill pool");
    harness
}

fn create_claims(harness: &Harness, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let name = format!("claim-{i}");
            harness
                .client
                .create(&SandboxClaim::new(NAMESPACE, &name, "python"))
                .expect("claim");
            name
        })
        .collect()
}

fn race(harness: &Harness, claims: &[String]) {
    let barrier = Barrier::new(claims.len());
    thread::scope(|scope| {
        for name in claims {
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                harness.reconcile_claim(NAMESPACE, name).expect("claim reconcile");
            });
        }
    });
}

fn launches(harness: &Harness, claims: &[String]) -> Vec<(String, LaunchType, String)> {
    claims
        .iter()
        .map(|name| {
            let claim: SandboxClaim = harness.client.get(NAMESPACE, name).expect("claim");
            (
                name.clone(),
                claim.status.launch_type.expect("launch type recorded"),
                claim.status.sandbox_name().expect("sandbox bound").to_string(),
            )
        })
        .collect()
}

#[test]
fn scenario_many_claims_race_for_one_idle_sandbox() {
    let harness = seeded(1);
    let member = harness
        .client
        .list::<Sandbox>(Some(NAMESPACE))
        .expect("list")
        .remove(0);
    let claims = create_claims(&harness, 8);

    race(&harness, &claims);

    let results = launches(&harness, &claims);
    let warm: Vec<_> = results.iter().filter(|(_, launch, _)| *launch == LaunchType::Warm).collect();
    assert_eq!(warm.len(), 1, "exactly one claim adopts the idle sandbox");
    assert_eq!(warm[0].2, member.metadata.name);
    for (claim, launch, sandbox) in &results {
        if *launch == LaunchType::Cold {
            assert_eq!(sandbox, claim, "cold sandboxes are named after their claim");
        }
    }

    let adopted: Sandbox = harness
        .client
        .get(NAMESPACE, &member.metadata.name)
        .expect("adopted sandbox");
    let winner: SandboxClaim = harness.client.get(NAMESPACE, &warm[0].0).expect("winner");
    assert!(adopted
        .metadata
        .is_controlled_by(winner.metadata.uid.as_deref().expect("uid")));
    assert_eq!(adopted.metadata.owner_references.len(), 1);
    assert!(adopted.metadata.label(LABEL_POOL).is_none());

    let bound: HashSet<&String> = results.iter().map(|(_, _, sandbox)| sandbox).collect();
    assert_eq!(bound.len(), claims.len(), "no sandbox is bound twice");
}

#[test]
fn scenario_claims_share_a_pool_without_double_adoption() {
    let harness = seeded(3);
    let members: HashSet<String> = harness
        .client
        .list::<Sandbox>(Some(NAMESPACE))
        .expect("list")
        .into_iter()
        .map(|s| s.metadata.name)
        .collect();
    let claims = create_claims(&harness, 6);

    race(&harness, &claims);

    let results = launches(&harness, &claims);
    let warm: HashSet<String> = results
        .iter()
        .filter(|(_, launch, _)| *launch == LaunchType::Warm)
        .map(|(_, _, sandbox)| sandbox.clone())
        .collect();
    assert_eq!(warm, members, "every idle member goes to exactly one claim");
    assert_eq!(
        results.iter().filter(|(_, launch, _)| *launch == LaunchType::Cold).count(),
        3
    );
}

#[test]
fn scenario_stale_candidate_view_falls_back_to_cold() {
    let harness = seeded(1);
    let claims = create_claims(&harness, 2);
    let controller = ClaimController::new();
    let ctx = harness.runtime.context();

    let first = ControllerTarget::claim(NAMESPACE, &claims[0]);
    let stale_plan = controller
        .reconcile(&ctx, &first)
        .expect("plan")
        .expect("claim exists");
    assert_eq!(stale_plan.candidates.len(), 1);

    harness.reconcile_claim(NAMESPACE, &claims[1]).expect("second claim adopts");
    controller
        .apply(&ctx, &first, stale_plan)
        .expect("first claim falls back");

    let results = launches(&harness, &claims);
    assert_eq!(results[0].1, LaunchType::Cold);
    assert_eq!(results[0].2, claims[0]);
    assert_eq!(results[1].1, LaunchType::Warm);
}
