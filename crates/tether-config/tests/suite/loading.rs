use std::collections::HashMap;

use tether_config::{
    ConfigError, RouterConfig, TetherConfig, TETHER_MAX_MESSAGE_SIZE_ENV_VAR,
    TETHER_TESTING_MODE_ENV_VAR,
};
use tether_proto::MAX_MESSAGE_BYTES;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn empty_toml_yields_defaults() {
    let config = TetherConfig::from_toml_str("").unwrap();
    assert_eq!(config, TetherConfig::default());
}

#[test]
fn partial_sections_keep_remaining_defaults() {
    let config = TetherConfig::from_toml_str(
        r#"
[router]
max_pending_messages_per_endpoint = 8

[logging]
level = "debug"
"#,
    )
    .unwrap();
    assert_eq!(config.router.max_pending_messages_per_endpoint, 8);
    assert_eq!(config.router.max_message_len, RouterConfig::default().max_message_len);
    assert_eq!(config.logging.level, "debug");
    assert!(!config.logging.json);
}

#[test]
fn unknown_keys_are_rejected() {
    let err = TetherConfig::from_toml_str("[router]\nmax_frames = 3\n").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)), "{err:?}");
}

#[test]
fn load_reads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tether.toml");
    std::fs::write(&path, "[router]\ntesting_mode = true\n").unwrap();
    let config = TetherConfig::load(&path).unwrap();
    assert!(config.router.testing_mode);

    let missing = TetherConfig::load(dir.path().join("missing.toml")).unwrap_err();
    assert!(matches!(missing, ConfigError::Io { .. }));
}

#[test]
fn env_overrides_apply_and_clamp() {
    let mut config = TetherConfig::default();
    config
        .apply_overrides_from(lookup(&[
            (TETHER_MAX_MESSAGE_SIZE_ENV_VAR, "4096"),
            (TETHER_TESTING_MODE_ENV_VAR, "true"),
        ]))
        .unwrap();
    assert_eq!(config.router.max_message_len, 4096);
    assert!(config.router.testing_mode);

    let huge = (MAX_MESSAGE_BYTES * 2).to_string();
    config
        .apply_overrides_from(lookup(&[(TETHER_MAX_MESSAGE_SIZE_ENV_VAR, huge.as_str())]))
        .unwrap();
    assert_eq!(config.router.max_message_len, MAX_MESSAGE_BYTES);
}

#[test]
fn invalid_env_values_are_reported() {
    let mut config = TetherConfig::default();
    let err = config
        .apply_overrides_from(lookup(&[(TETHER_MAX_MESSAGE_SIZE_ENV_VAR, "lots")]))
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InvalidEnv {
            key: TETHER_MAX_MESSAGE_SIZE_ENV_VAR,
            ..
        }
    ));

    let err = config
        .apply_overrides_from(lookup(&[(TETHER_TESTING_MODE_ENV_VAR, "maybe")]))
        .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidEnv { .. }));
}
