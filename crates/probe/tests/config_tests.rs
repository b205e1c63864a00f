//! Integration tests for configuration parsing
//!
//! Tests probe configuration parsing, including:
//! - Minimal and full documents
//! - Session option defaults
//! - Save/load round trip through a file
//! - Invalid configuration handling

use probe::config::ProbeConfig;

mod probe_config {
    use super::*;

    const MINIMAL_CONFIG: &str = r#"
[probe]
log_level = "info"

[usb]
"#;

    const FULL_CONFIG: &str = r#"
[probe]
log_level = "debug"
report_capacity = 64

[usb]
filters = ["0x046d:*", "0x1234:0x5678"]
interfaces = [0, 2]

[session]
event_timeout_ms = 50
drain_timeout_ms = 1000
control_timeout_ms = 250
language_id = 0x0409
"#;

    const INVALID_FILTER_CONFIG: &str = r#"
[probe]
log_level = "info"

[usb]
filters = ["046d:c077"]
"#;

    const INVALID_LEVEL_CONFIG: &str = r#"
[probe]
log_level = "verbose"

[usb]
"#;

    #[test]
    fn test_minimal_config() {
        let config = ProbeConfig::parse(MINIMAL_CONFIG).unwrap();
        assert_eq!(config.probe.log_level, "info");
        assert_eq!(config.probe.report_capacity, 256);
        assert!(config.usb.filters.is_empty());
        assert!(config.usb.interfaces.is_empty());
        assert_eq!(config.session.event_timeout_ms, 100);
        assert_eq!(config.session.drain_timeout_ms, 2000);
        assert_eq!(config.session.language_id, 0);
    }

    #[test]
    fn test_full_config() {
        let config = ProbeConfig::parse(FULL_CONFIG).unwrap();
        assert_eq!(config.probe.log_level, "debug");
        assert_eq!(config.probe.report_capacity, 64);
        assert_eq!(config.usb.filters, vec!["0x046d:*", "0x1234:0x5678"]);
        assert_eq!(config.usb.interfaces, vec![0, 2]);
        assert_eq!(config.session.event_timeout_ms, 50);
        assert_eq!(config.session.control_timeout_ms, 250);
        assert_eq!(config.session.language_id, 0x0409);
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let err = ProbeConfig::parse(INVALID_FILTER_CONFIG).unwrap_err();
        assert!(format!("{:#}", err).contains("must start with '0x'"));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let err = ProbeConfig::parse(INVALID_LEVEL_CONFIG).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid log level"));
    }

    #[test]
    fn test_missing_section_rejected() {
        assert!(ProbeConfig::parse("[probe]\nlog_level = \"info\"\n").is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("probe.toml");

        let mut config = ProbeConfig::default();
        config.usb.filters = vec!["0x1234:*".to_string()];
        config.session.drain_timeout_ms = 750;
        config.save(&path).unwrap();

        let loaded = ProbeConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.usb.filters, config.usb.filters);
        assert_eq!(loaded.session, config.session);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProbeConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }
}
