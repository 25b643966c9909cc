use std::io::Write;
use std::time::Duration;

use serial_test::serial;

use super::load_config;
use super::settings::{PartialSettings, Settings};
use crate::utils::error::SettingsError;

fn toml_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.host, "rabbitmq");
    assert_eq!(settings.broker.port, 5672);
    assert_eq!(settings.queue.name, "first_names");
    assert!(settings.queue.durable);
    assert!(!settings.queue.exclusive);
    assert!(!settings.queue.auto_delete);
    assert_eq!(settings.publisher.stop_word, "q");
    assert_eq!(settings.publisher.interval_ms, 5000);
    assert_eq!(settings.consumer.tick_ms, 7500);

    let policy = settings.retry.policy();
    assert_eq!(policy.max_retries, 5);
    assert_eq!(policy.base_delay, Duration::from_secs(1));
    assert!(settings.validate().is_ok());
}

#[test]
fn test_empty_partial_merges_to_defaults() {
    let merged = PartialSettings::default().merge(Settings::default());
    assert_eq!(merged, Settings::default());
}

#[test]
#[serial]
fn test_load_without_overrides_matches_defaults() {
    temp_env::with_vars_unset(["RELAY_BROKER__HOST", "RELAY_QUEUE__NAME"], || {
        assert_eq!(load_config(None).unwrap(), Settings::default());
    });
}

#[test]
#[serial]
fn test_file_overrides_only_what_it_sets() {
    let file = toml_file(
        r#"
[broker]
host = "localhost"

[consumer]
max_in_flight = 2
"#,
    );

    let settings = load_config(Some(file.path())).unwrap();

    assert_eq!(settings.broker.host, "localhost");
    assert_eq!(settings.broker.port, 5672);
    assert_eq!(settings.consumer.max_in_flight, 2);
    assert_eq!(settings.consumer.prefetch, 16);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = toml_file("[broker]\nhost = \"localhost\"\n");

    temp_env::with_vars(
        [
            ("RELAY_BROKER__HOST", Some("broker.internal")),
            ("RELAY_BROKER__PORT", Some("5673")),
            ("RELAY_PUBLISHER__INTERVAL_MS", Some("250")),
        ],
        || {
            let settings = load_config(Some(file.path())).unwrap();
            assert_eq!(settings.broker.host, "broker.internal");
            assert_eq!(settings.broker.port, 5673);
            assert_eq!(settings.publisher.interval_ms, 250);
        },
    );
}

#[test]
#[serial]
fn test_invalid_values_are_rejected() {
    let file = toml_file("[consumer]\nmax_in_flight = 0\n");

    match load_config(Some(file.path())) {
        Err(SettingsError::Invalid { key, .. }) => assert_eq!(key, "consumer.max_in_flight"),
        other => panic!("expected a validation error, got {other:?}"),
    }
}

#[test]
fn test_validate_checks_each_section() {
    let mut settings = Settings::default();
    settings.queue.name = " ".to_string();
    assert!(matches!(
        settings.validate(),
        Err(SettingsError::Invalid { key: "queue.name", .. })
    ));

    let mut settings = Settings::default();
    settings.retry.multiplier = 0.5;
    assert!(matches!(
        settings.validate(),
        Err(SettingsError::Invalid { key: "retry.multiplier", .. })
    ));

    let mut settings = Settings::default();
    settings.broker.port = 0;
    assert!(settings.validate().is_err());
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    let missing = std::path::Path::new("does/not/exist.toml");
    assert!(matches!(
        load_config(Some(missing)),
        Err(SettingsError::Load(_))
    ));
}
