//! Configuration loading from JSON files.

use std::io::Write;

use sinenet_inference::config::{
    BackendKind, DEFAULT_PROFILING_CAPACITY, MIN_PROFILING_CAPACITY, PowerPreference,
};
use sinenet_inference::network::LAUNCHES_PER_PASS;
use sinenet_inference::errors::ConfigError;
use sinenet_inference::{HostBackend, PipelineConfig};
use tempfile::NamedTempFile;

fn write_temp(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_config() {
    let file = write_temp(
        r#"{
            "backend": "host",
            "power_preference": "low_power",
            "profiling_capacity": 128
        }"#,
    );

    let config = PipelineConfig::load(file.path()).unwrap();
    assert_eq!(config.backend, BackendKind::Host);
    assert_eq!(config.power_preference, PowerPreference::LowPower);
    assert_eq!(config.profiling_capacity, 128);
    assert_eq!(config.kernel_source, None);
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::load(&dir.path().join("absent.json")).unwrap();
    assert_eq!(config, PipelineConfig::default());
    assert_eq!(config.backend, BackendKind::Wgpu);
    assert_eq!(config.profiling_capacity, DEFAULT_PROFILING_CAPACITY);
}

#[test]
fn test_malformed_file_is_a_parse_error() {
    let file = write_temp(r#"{"backend": "tpu"}"#);
    assert!(matches!(
        PipelineConfig::load(file.path()),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn test_zero_capacity_fails_validation() {
    let file = write_temp(r#"{"profiling_capacity": 0}"#);
    assert!(matches!(
        PipelineConfig::load(file.path()),
        Err(ConfigError::Validation { ref field, .. }) if field == "profiling_capacity"
    ));
}

#[test]
fn test_capacity_must_hold_a_whole_pass() {
    assert_eq!(MIN_PROFILING_CAPACITY, LAUNCHES_PER_PASS);

    let file = write_temp(r#"{"profiling_capacity": 4}"#);
    assert!(matches!(
        PipelineConfig::load(file.path()),
        Err(ConfigError::Validation { ref field, .. }) if field == "profiling_capacity"
    ));

    let file = write_temp(&format!(r#"{{"profiling_capacity": {LAUNCHES_PER_PASS}}}"#));
    let config = PipelineConfig::load(file.path()).unwrap();
    assert_eq!(config.profiling_capacity, 8);
}

#[test]
fn test_unreadable_config_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        PipelineConfig::load(dir.path()),
        Err(ConfigError::Io { .. })
    ));
}

#[test]
fn test_kernel_source_override_is_read() {
    let kernels = write_temp(sinenet_inference::kernels::DENSE_KERNEL_SOURCE);
    let config = PipelineConfig {
        kernel_source: Some(kernels.path().to_path_buf()),
        ..PipelineConfig::default()
    };

    let catalog = config.kernel_catalog().unwrap();
    assert_eq!(
        catalog.source(),
        sinenet_inference::kernels::DENSE_KERNEL_SOURCE
    );
    assert!(HostBackend::initialize(&catalog).is_ok());
    let file_name = kernels
        .path()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    assert!(config.kernel_source_name().ends_with(file_name.as_str()));
}

#[test]
fn test_empty_kernel_source_is_rejected() {
    let kernels = write_temp("   \n");
    let config = PipelineConfig {
        kernel_source: Some(kernels.path().to_path_buf()),
        ..PipelineConfig::default()
    };
    assert!(matches!(
        config.kernel_catalog(),
        Err(ConfigError::Validation { .. })
    ));
}

#[test]
fn test_unreadable_kernel_source() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        kernel_source: Some(dir.path().join("missing.wgsl")),
        ..PipelineConfig::default()
    };
    assert!(matches!(
        config.kernel_catalog(),
        Err(ConfigError::Io { .. })
    ));
}

#[test]
fn test_config_round_trips_through_json() {
    let config = PipelineConfig {
        backend: BackendKind::Host,
        profiling_capacity: 16,
        ..PipelineConfig::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    assert!(!json.contains("kernel_source"));
    let parsed: PipelineConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, config);
}
