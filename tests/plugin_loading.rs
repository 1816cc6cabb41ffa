mod common;

use chainops::error::{DispatchError, PluginLoadError, RegistryError};
use command_plugin::message::CapabilityKind;
use semver::Version;

use common::{install_pair, install_plugin, loader, scratch_root};

#[tokio::test]
async fn discovery_loads_highest_version_and_skips_broken_plugins() {
    let root = scratch_root();
    let plugins = root.path().join("plugins");
    install_plugin(&plugins, "ldap", Some("1.2.0"), "ldap");
    install_plugin(&plugins, "ldap", Some("1.10.0"), "ldap");
    install_plugin(&plugins, "mock-backend", None, "mock-backend");
    install_plugin(&plugins, "dual-ambiguous", None, "dual-ambiguous");
    std::fs::create_dir_all(plugins.join("empty")).unwrap();

    let loader = loader();
    let report = loader.discover(&plugins).await.unwrap();

    let names: Vec<_> = report.loaded.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["ldap", "mock-backend"]);

    let ldap = &report.loaded[0];
    assert_eq!(ldap.kind, CapabilityKind::Handler);
    assert_eq!(ldap.version, Some(Version::new(1, 10, 0)));
    assert!(ldap.binary_path.ends_with("1.10.0/ldap"));
    assert_eq!(ldap.command_names, vec!["ldap.step", "ldap.echo"]);
    assert_eq!(ldap.backend_name, "mock-backend");
    assert_eq!(report.loaded[1].kind, CapabilityKind::Backend);

    assert_eq!(report.skipped.len(), 2);
    assert!(report
        .skipped
        .iter()
        .any(|s| matches!(s.error, PluginLoadError::MultipleCapabilities { count: 2, .. })));
    assert!(report.skipped.iter().any(|s| matches!(s.error, PluginLoadError::NoBinary(_))));

    assert_eq!(loader.registry().command_names(), vec!["ldap.echo", "ldap.step"]);
    loader.shutdown().await;
    assert!(loader.registry().unit_ids().is_empty());
}

#[tokio::test]
async fn failing_on_loaded_leaves_nothing_registered() {
    let root = scratch_root();
    let plugins = root.path().join("plugins");
    install_plugin(&plugins, "gate-unready", None, "gate-unready");

    let loader = loader();
    let err = loader.load_dir(&plugins.join("gate-unready")).await.unwrap_err();
    assert!(
        matches!(&err, PluginLoadError::Introspection { stage: "onLoaded", details, .. } if details.contains("refuses")),
        "{err}"
    );
    assert!(matches!(
        loader.registry().resolve("gate-unready.step"),
        Err(DispatchError::CommandNotFound(_))
    ));
    assert!(loader.registry().unit_ids().is_empty());
}

#[tokio::test]
async fn second_plugin_claiming_the_same_command_is_rejected() {
    let root = scratch_root();
    let plugins = root.path().join("plugins");
    install_plugin(&plugins, "ldap", None, "ldap");
    install_plugin(&plugins, "ldap-copy", None, "ldap");

    let loader = loader();
    let first = loader.load_dir(&plugins.join("ldap")).await.unwrap();
    let err = loader.load_dir(&plugins.join("ldap-copy")).await.unwrap_err();
    assert!(matches!(
        err,
        PluginLoadError::Registry(RegistryError::CommandTaken { ref owner, .. }) if owner == "ldap"
    ));

    // the original binding is untouched
    let resolved = loader.registry().resolve("ldap.step").unwrap();
    assert_eq!(resolved.lease.unit_id(), first.unit_id);
    drop(resolved);
    loader.shutdown().await;
}

#[tokio::test]
async fn unload_then_reload_gives_a_fresh_unit() {
    let root = scratch_root();
    let plugins = root.path().join("plugins");
    install_pair(&plugins, "vm");

    let loader = loader();
    let report = loader.discover(&plugins).await.unwrap();
    let vm = report.loaded.iter().find(|d| d.name == "vm").unwrap().clone();

    assert!(loader.unload(vm.unit_id).await);
    assert!(!loader.unload(vm.unit_id).await);
    assert!(matches!(loader.registry().resolve("vm.step"), Err(DispatchError::CommandNotFound(_))));

    let reloaded = loader.reload(&plugins.join("vm")).await.unwrap().unwrap();
    assert_ne!(reloaded.unit_id, vm.unit_id);
    assert!(loader.registry().resolve("vm.step").is_ok());

    std::fs::remove_dir_all(plugins.join("vm")).unwrap();
    assert!(loader.reload(&plugins.join("vm")).await.unwrap().is_none());
    assert!(loader.registry().resolve("vm.step").is_err());
    assert_eq!(loader.unload_plugin("mock-backend").await, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn silent_plugin_does_not_hold_up_discovery() {
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    let root = scratch_root();
    let plugins = root.path().join("plugins");
    let silent = plugins.join("aaa-silent");
    std::fs::create_dir_all(&silent).unwrap();
    let script = silent.join("aaa-silent");
    std::fs::write(&script, "#!/bin/sh\nexec sleep 60\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    install_plugin(&plugins, "mock-backend", None, "mock-backend");

    let loader = loader();
    let report = tokio::time::timeout(Duration::from_secs(10), loader.discover(&plugins))
        .await
        .expect("discovery stalled on a silent plugin")
        .unwrap();

    let names: Vec<_> = report.loaded.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["mock-backend"]);
    assert_eq!(report.skipped.len(), 1);
    assert!(matches!(
        &report.skipped[0].error,
        PluginLoadError::Introspection { stage: "describe", .. }
    ));
    loader.shutdown().await;
}
