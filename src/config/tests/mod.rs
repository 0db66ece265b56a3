//! Unit tests for config module
//!
//! Defaults, serialization and validation. No filesystem access.

#![allow(clippy::panic)]

use crate::{
    config::{ConfigError, CoreConfig, LogLevel},
    resample::ResampleMethod,
};

#[test]
fn config_default() {
    let config = CoreConfig::default();

    assert!(config.volume.flat_volumes);
    assert!(config.volume.deferred_volume);
    assert_eq!(config.volume.deferred_volume_safety_margin_usec, 8_000);
    assert_eq!(config.devices.max_streams_per_device, 256);
    assert_eq!(config.devices.alternate_sample_rate, 48_000);
    assert!(config.validate().is_ok());
}

#[test]
fn config_serialize_toml() {
    let toml_str = toml::to_string(&CoreConfig::default()).unwrap();

    assert!(toml_str.contains("[general]"));
    assert!(toml_str.contains("[volume]"));
    assert!(toml_str.contains("[devices]"));
}

#[test]
fn config_deserialize_partial_toml() {
    let config = CoreConfig::from_toml_str(
        r#"
        [general]
        log_level = "debug"

        [volume]
        flat_volumes = false

        [resample]
        method = "trivial"
    "#,
    )
    .unwrap();

    assert_eq!(config.general.log_level, LogLevel::Debug);
    assert!(!config.volume.flat_volumes);
    assert!(config.volume.deferred_volume);
    assert_eq!(config.resample.method, ResampleMethod::Trivial);
    assert_eq!(config.devices.cycle_usec, 10_000);
}

#[test]
fn config_serialize_roundtrip() {
    let original = CoreConfig::default();
    let toml_str = toml::to_string(&original).unwrap();
    let deserialized = CoreConfig::from_toml_str(&toml_str).unwrap();

    assert_eq!(original, deserialized);
}

#[test]
fn config_empty_document_is_default() {
    assert_eq!(CoreConfig::from_toml_str("").unwrap(), CoreConfig::default());
}

#[test]
fn rejects_out_of_range_rate() {
    let err = CoreConfig::from_toml_str("[devices]\nalternate_sample_rate = 1000\n").unwrap_err();

    match err {
        ConfigError::InvalidField { field, .. } => {
            assert_eq!(field, "devices.alternate_sample_rate");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn rejects_zero_cycle() {
    assert!(CoreConfig::from_toml_str("[devices]\ncycle_usec = 0\n").is_err());
}

#[test]
fn rejects_malformed_toml() {
    let err = CoreConfig::from_toml_str("[volume\nflat_volumes = ").unwrap_err();
    assert!(matches!(err, ConfigError::TomlParse { .. }));
}

#[test]
fn json_schema_lists_sections() {
    let schema = CoreConfig::json_schema();
    let text = schema.to_string();

    assert!(text.contains("volume"));
    assert!(text.contains("deferred_volume_safety_margin_usec"));
}

#[test]
fn log_level_display_matches_serde() {
    assert_eq!(LogLevel::Warn.to_string(), "warn");
    assert_eq!(LogLevel::Trace.as_tracing_level(), tracing::Level::TRACE);
}
