use sandboxd::sandboxd::k8s::claim::SandboxClaim;
use sandboxd::sandboxd::k8s::pod::Pod;
use sandboxd::sandboxd::k8s::sandbox::Sandbox;
use sandboxd::sandboxd::k8s::template::SandboxTemplate;
use sandboxd::sandboxd::k8s::warmpool::SandboxWarmPool;
use sandboxd::sandboxd::metadata::Metadata;
use sandboxd::sandboxd::test_support::{sample_template, Harness};

const NAMESPACE: &str = "default";

fn labelled_template(name: &str) -> SandboxTemplate {
    let mut template = sample_template(NAMESPACE, name);
    template.spec.sandbox_metadata = Metadata::default()
        .with_label("team", "infra")
        .with_label("tier", "gold");
    template
}

fn labelled_claim(name: &str, template: &str) -> SandboxClaim {
    let mut claim = SandboxClaim::new(NAMESPACE, name, template);
    claim.spec.sandbox_metadata = Metadata::default()
        .with_label("team", "billing")
        .with_label("cost-center", "cc-42")
        .with_annotation("owner", "alice");
    claim.spec.pod_metadata = Metadata::default().with_label("cost-center", "cc-42");
    claim
}

fn label<'a>(labels: &'a std::collections::BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    labels.get(key).map(String::as_str)
}

#[test]
fn scenario_claim_metadata_reaches_sandbox_and_pod() {
    let harness = Harness::new();
    harness.client.create(&labelled_template("meta")).expect("template");
    harness
        .client
        .create(&labelled_claim("analysis", "meta"))
        .expect("claim");
    harness.settle(2);

    let sandbox: Sandbox = harness.client.get(NAMESPACE, "analysis").expect("sandbox");
    assert_eq!(sandbox.metadata.label("team"), Some("billing"), "claim wins over template");
    assert_eq!(sandbox.metadata.label("tier"), Some("gold"));
    assert_eq!(sandbox.metadata.label("cost-center"), Some("cc-42"));
    assert_eq!(sandbox.metadata.annotation("owner"), Some("alice"));

    let pod: Pod = harness.client.get(NAMESPACE, "analysis").expect("pod");
    assert_eq!(pod.metadata.label("cost-center"), Some("cc-42"));
    assert_eq!(pod.metadata.label("app"), Some("agent-sandbox"));
}

#[test]
fn scenario_removed_claim_labels_are_retracted_and_foreign_labels_kept() {
    let harness = Harness::new();
    harness.client.create(&labelled_template("retract")).expect("template");
    harness
        .client
        .create(&labelled_claim("session", "retract"))
        .expect("claim");
    harness.settle(2);

    let mut sandbox: Sandbox = harness.client.get(NAMESPACE, "session").expect("sandbox");
    sandbox
        .metadata
        .labels
        .insert("injected-by".to_string(), "sidecar".to_string());
    harness.client.update(&sandbox).expect("external sandbox label");
    let mut pod: Pod = harness.client.get(NAMESPACE, "session").expect("pod");
    pod.metadata
        .labels
        .insert("injected-by".to_string(), "sidecar".to_string());
    harness.client.update(&pod).expect("external pod label");

    let mut claim: SandboxClaim = harness.client.get(NAMESPACE, "session").expect("claim");
    claim.spec.sandbox_metadata.labels.remove("cost-center");
    claim.spec.pod_metadata.labels.remove("cost-center");
    harness.client.update(&claim).expect("claim edit");
    harness.settle(2);

    let sandbox: Sandbox = harness.client.get(NAMESPACE, "session").expect("sandbox");
    assert_eq!(sandbox.metadata.label("cost-center"), None);
    assert_eq!(sandbox.metadata.label("injected-by"), Some("sidecar"));
    assert_eq!(sandbox.metadata.label("team"), Some("billing"));
    assert_eq!(label(&sandbox.spec.pod_template.metadata.labels, "cost-center"), None);

    let pod: Pod = harness.client.get(NAMESPACE, "session").expect("pod");
    assert_eq!(pod.metadata.label("cost-center"), None);
    assert_eq!(pod.metadata.label("injected-by"), Some("sidecar"));
    assert_eq!(pod.metadata.label("app"), Some("agent-sandbox"));

    let claim: SandboxClaim = harness.client.get(NAMESPACE, "session").expect("claim");
    assert!(!claim.status.applied_sandbox_metadata.labels.contains("cost-center"));
    assert!(!claim.status.applied_pod_metadata.labels.contains("cost-center"));
}

#[test]
fn scenario_adopted_pod_is_relabelled_in_place() {
    let harness = Harness::new();
    harness.client.create(&labelled_template("warm-meta")).expect("template");
    harness
        .client
        .create(&SandboxWarmPool::new(NAMESPACE, "warm", "warm-meta", 1))
        .expect("pool");
    harness.settle(2);
    harness.mark_all_pods_ready();
    harness.settle(1);

    let member = harness
        .client
        .list::<Sandbox>(Some(NAMESPACE))
        .expect("list")
        .remove(0);
    assert_eq!(member.metadata.label("team"), Some("infra"));
    let before: Pod = harness
        .client
        .get(NAMESPACE, &member.metadata.name)
        .expect("member pod");
    assert_eq!(before.metadata.label("cost-center"), None);

    harness
        .client
        .create(&labelled_claim("warm-claim", "warm-meta"))
        .expect("claim");
    harness.reconcile_claim(NAMESPACE, "warm-claim").expect("adopt");
    harness
        .reconcile_sandbox(NAMESPACE, &member.metadata.name)
        .expect("pod sync");

    let sandbox: Sandbox = harness
        .client
        .get(NAMESPACE, &member.metadata.name)
        .expect("adopted sandbox");
    assert_eq!(sandbox.metadata.label("team"), Some("billing"));
    assert_eq!(sandbox.metadata.label("tier"), Some("gold"));

    let after: Pod = harness
        .client
        .get(NAMESPACE, &member.metadata.name)
        .expect("adopted pod");
    assert_eq!(after.metadata.uid, before.metadata.uid, "pod is not recreated");
    assert_eq!(after.metadata.label("cost-center"), Some("cc-42"));
    assert!(after.is_ready());
}
