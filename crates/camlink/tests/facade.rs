use std::sync::Arc;

use camlink::prelude::*;
use camlink::session_core::SessionFault;

#[tokio::test]
async fn test_registry_from_toml_config() {
    let config = CamlinkConfig::from_toml(
        r#"
        [session]
        drain_grace_ms = 500

        [command]
        max_attempts = 2
        "#,
    )
    .unwrap();
    assert_eq!(config.session.drain_grace_ms, 500);
    assert_eq!(config.command.max_attempts, 2);
    // another test binary may already own the global subscriber
    let _ = config.init_logging();

    let directory = Arc::new(StaticDirectory::new().with(DeviceRecord::camera(DeviceAddress::new("CAM-1"))));
    let registry = SessionRegistry::with_network(config, directory, None).unwrap();
    assert!(registry.lookup("CAM-1").is_none());

    let err = registry
        .open("CAM-2", SessionKind::Watch, 0, OpenParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Session(SessionFault::NotFound(_))));
    registry.shutdown().await;
}

#[test]
fn test_invalid_config_rejected() {
    let err = CamlinkConfig::from_toml("[session]\nnegotiation_timeout_ms = 0\n").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(!camlink::VERSION.is_empty());
}
