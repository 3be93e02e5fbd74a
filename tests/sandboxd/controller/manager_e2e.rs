use sandboxd::sandboxd::clock::SystemClock;
use sandboxd::sandboxd::config::ControllerConfig;
use sandboxd::sandboxd::controller::manager::ControllerManager;
use sandboxd::sandboxd::k8s::claim::{LaunchType, SandboxClaim};
use sandboxd::sandboxd::k8s::condition::{is_condition_true, CONDITION_READY};
use sandboxd::sandboxd::k8s::naming::LABEL_POOL;
use sandboxd::sandboxd::k8s::sandbox::Sandbox;
use sandboxd::sandboxd::k8s::store::{Client, InMemoryApi};
use sandboxd::sandboxd::k8s::warmpool::SandboxWarmPool;
use sandboxd::sandboxd::kubelet::SimulatedKubelet;
use sandboxd::sandboxd::test_support::sample_template;
use std::sync::Arc;
use std::time::Duration;

const NAMESPACE: &str = "default";

async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn ready_idle_members(client: &Client) -> usize {
    client
        .list::<Sandbox>(Some(NAMESPACE))
        .expect("list sandboxes")
        .iter()
        .filter(|sandbox| {
            !sandbox.metadata.is_deleting()
                && sandbox.metadata.label(LABEL_POOL).is_some()
                && sandbox.is_ready()
        })
        .count()
}

fn claim_ready(client: &Client, name: &str) -> bool {
    client
        .get::<SandboxClaim>(NAMESPACE, name)
        .map(|claim| is_condition_true(&claim.status.conditions, CONDITION_READY))
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_manager_serves_warm_and_cold_claims() {
    let client = Client::new(Arc::new(InMemoryApi::new()));
    let manager = ControllerManager::new(
        client.clone(),
        ControllerConfig {
            workers: 2,
            resync_interval: Duration::from_secs(1),
            ..ControllerConfig::default()
        },
        Arc::new(SystemClock),
    );
    let handles = manager.start();
    let kubelet = SimulatedKubelet::new(client.clone(), Duration::from_millis(20))
        .spawn(manager.shutdown_token());

    client
        .create(&sample_template(NAMESPACE, "e2e-python"))
        .expect("template");
    client
        .create(&sample_template(NAMESPACE, "e2e-unpooled"))
        .expect("template");
    client
        .create(&SandboxWarmPool::new(NAMESPACE, "e2e-pool", "e2e-python", 1))
        .expect("pool");
    eventually("pool member ready", || ready_idle_members(&client) == 1).await;

    client
        .create(&SandboxClaim::new(NAMESPACE, "warm", "e2e-python"))
        .expect("warm claim");
    client
        .create(&SandboxClaim::new(NAMESPACE, "cold", "e2e-unpooled"))
        .expect("cold claim");
    eventually("warm claim ready", || claim_ready(&client, "warm")).await;
    eventually("cold claim ready", || claim_ready(&client, "cold")).await;

    let warm: SandboxClaim = client.get(NAMESPACE, "warm").expect("warm");
    assert_eq!(warm.status.launch_type, Some(LaunchType::Warm));
    let cold: SandboxClaim = client.get(NAMESPACE, "cold").expect("cold");
    assert_eq!(cold.status.launch_type, Some(LaunchType::Cold));
    assert_eq!(cold.status.sandbox_name(), Some("cold"));

    eventually("pool replenished", || ready_idle_members(&client) == 1).await;

    client
        .delete::<SandboxClaim>(NAMESPACE, "cold")
        .expect("delete claim");
    eventually("cold sandbox removed", || {
        client
            .get_opt::<Sandbox>(NAMESPACE, "cold")
            .map(|sandbox| sandbox.is_none())
            .unwrap_or(false)
    })
    .await;

    manager.shutdown();
    for handle in handles {
        handle.await.expect("controller task exits cleanly");
    }
    kubelet.await.expect("kubelet exits cleanly");
}
