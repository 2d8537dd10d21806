//! Round-trip stability: loading a document set from disk, resolving every
//! selector, reloading, and resolving again must produce identical
//! fingerprints.

use std::path::Path;
use std::sync::Arc;

use fleetd_core::resolve::{ConfigValidator, Resolver};
use fleetd_core::store::ConfigStore;

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn seed_repository(dir: &Path) {
    write(
        dir,
        "base/collector.yaml",
        "receivers:\n  otlp:\n    protocols:\n      grpc: {}\nexporters:\n  debug: {}\nservice:\n  pipelines:\n    metrics:\n      receivers: [otlp]\n      exporters: [debug]\n",
    );
    write(
        dir,
        "overlays/production/collector.yaml",
        "exporters:\n  otlp/gateway:\n    endpoint: gateway.prod:4317\n",
    );
    write(
        dir,
        "overlays/staging/collector.yaml",
        "exporters:\n  otlp/gateway:\n    endpoint: gateway.staging:4317\n",
    );
    write(
        dir,
        "agents/kubernetes/daemonset.yaml",
        "service:\n  pipelines:\n    metrics:\n      receivers: [otlp]\n      exporters: [otlp/gateway]\n",
    );
    write(
        dir,
        "agents/linux/default.yaml",
        "processors:\n  batch: {}\nservice:\n  pipelines:\n    metrics:\n      receivers: [otlp]\n      processors: [batch]\n      exporters: [debug]\n",
    );
    write(
        dir,
        "agents/_selectors.yaml",
        "selectors:\n  - name: kubernetes-daemonset\n    match:\n      labels:\n        deployment: kubernetes\n        role: daemonset\n    config: kubernetes/daemonset.yaml\n    overlay: production\n  - name: kubernetes-staging\n    match:\n      labels:\n        deployment: kubernetes\n    config: kubernetes/daemonset.yaml\n    overlay: staging\n  - name: default-linux\n    match:\n      labels:\n        os: linux\n    config: linux/default.yaml\n",
    );
}

#[test]
fn per_selector_fingerprints_survive_reload() {
    let dir = tempfile::tempdir().unwrap();
    seed_repository(dir.path());

    let resolver = Resolver::new(
        Arc::new(ConfigStore::new()),
        Some(ConfigValidator::new(false)),
    );
    resolver.reload(dir.path()).unwrap();

    let selectors = resolver.selectors();
    assert_eq!(selectors.len(), 3);

    let before: Vec<(String, String)> = selectors
        .iter()
        .map(|s| {
            let cfg = resolver.resolve_selector(&s.name).unwrap();
            assert_eq!(cfg.fingerprint, fleetd_core::fingerprint(&cfg.content));
            (s.name.clone(), cfg.fingerprint)
        })
        .collect();

    // Distinct overlays must produce distinct effective configurations.
    assert_ne!(before[0].1, before[1].1);

    resolver.reload(dir.path()).unwrap();
    for (name, fingerprint) in &before {
        let cfg = resolver.resolve_selector(name).unwrap();
        assert_eq!(&cfg.fingerprint, fingerprint, "fingerprint drifted for {name}");
    }
}
