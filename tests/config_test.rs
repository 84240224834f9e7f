//! Configuration loading: file, environment overrides and validation.
//!
//! Every test runs inside a `figment::Jail` so environment variables never leak
//! between tests.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use figment::Jail;
use scanrig::config::{ConfigError, RigConfig, StatusMode};
use scanrig::scan::FocusDirective;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn load(path: &Path) -> Result<RigConfig, figment::Error> {
    RigConfig::load_from(path).map_err(|e| figment::Error::from(e.to_string()))
}

#[test]
fn test_shipped_config_loads() {
    Jail::expect_with(|_jail| {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/scanrig.toml");
        let config = load(&path)?;

        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.protocol.status_mode, StatusMode::Auto);
        assert_eq!(config.protocol.motion_timeout, Duration::from_secs(60));
        assert!(!config.axes.c.has_feedback);
        assert!(config.axes.x.has_feedback);
        assert_eq!(config.scan.default_focus, FocusDirective::AutoOnce);
        Ok(())
    });
}

#[test]
fn test_file_values_override_defaults() {
    Jail::expect_with(|_jail| {
        let file = write_config(
            r#"
            [serial]
            port = "/dev/ttyACM0"

            [protocol]
            status_mode = "poll"
            status_interval = "200ms"
            motion_start_grace = "400ms"

            [axes.y]
            min = 0.0
            max = 400.0

            [calibration.turntable_to_origin]
            x = 150.0
            y = 12.5

            [scan]
            feedrate = 1500.0
            default_focus = { mode = "manual", value = 9.5 }
            "#,
        );
        let config = load(file.path())?;

        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.protocol.status_mode, StatusMode::Poll);
        assert_eq!(config.protocol.status_interval, Duration::from_millis(200));
        assert_eq!(config.protocol.ack_timeout, Duration::from_millis(500));
        assert_eq!(config.axes.y.max, 400.0);
        assert_eq!(config.axes.x.max, 300.0);
        assert_eq!(config.calibration.turntable_to_origin.x, 150.0);
        assert_eq!(config.scan_feedrate(), 1500.0);
        assert_eq!(config.scan.default_focus, FocusDirective::Manual(9.5));
        Ok(())
    });
}

#[test]
fn test_environment_overrides_file() {
    Jail::expect_with(|jail| {
        let file = write_config(
            r#"
            [serial]
            port = "/dev/ttyUSB3"

            [protocol]
            max_retries = 2
            "#,
        );
        jail.set_env("SCANRIG_SERIAL__PORT", "/dev/ttyACM7");
        jail.set_env("SCANRIG_PROTOCOL__MAX_RETRIES", "6");
        jail.set_env("SCANRIG_SCAN__SETTLE_DELAY", "750ms");
        jail.set_env("SCANRIG_AXES__C__MAX", "45.0");

        let config = load(file.path())?;

        assert_eq!(config.serial.port, "/dev/ttyACM7");
        assert_eq!(config.protocol.max_retries, 6);
        assert_eq!(config.scan.settle_delay, Duration::from_millis(750));
        assert_eq!(config.axes.c.max, 45.0);
        assert_eq!(config.axes.c.min, -90.0);
        Ok(())
    });
}

#[test]
fn test_missing_file_uses_defaults() {
    Jail::expect_with(|jail| {
        let path = jail.directory().join("absent.toml");
        let config = load(&path)?;
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.motion.default_feedrate, 3000.0);
        Ok(())
    });
}

#[test]
fn test_validation_rejects_bad_values() {
    Jail::expect_with(|jail| {
        let cases = [
            ("[application]\nlog_level = \"loud\"", "log_level"),
            ("[axes.x]\nmin = 10.0\nmax = 5.0", "Axis X"),
            ("[axes.c]\nmin = -10.0\nmax = 10.0\nhome = 20.0", "home position"),
            ("[motion]\ndefault_feedrate = 0.0", "default_feedrate"),
            ("[scan]\ncalibration_intensity = 2.0", "calibration_intensity"),
            ("[scan]\ndefault_focus = { mode = \"stack\", value = [] }", "stack"),
            ("[protocol]\nunlock_timeout = \"0s\"", "unlock_timeout"),
            (
                "[protocol]\nstatus_interval = \"200ms\"\nmotion_start_grace = \"40ms\"",
                "motion_start_grace",
            ),
        ];

        for (toml, expected) in cases {
            let file = write_config(toml);
            match RigConfig::load_from(file.path()) {
                Err(ConfigError::ValidationError(message)) => {
                    assert!(
                        message.contains(expected),
                        "{toml:?}: '{message}' does not mention '{expected}'"
                    );
                }
                other => panic!("{toml:?}: expected validation error, got {other:?}"),
            }
        }

        jail.set_env("SCANRIG_SCAN__CAPTURE_INTENSITY", "-0.5");
        assert!(matches!(
            RigConfig::load_from(jail.directory().join("absent.toml")),
            Err(ConfigError::ValidationError(_))
        ));
        Ok(())
    });
}

#[test]
fn test_malformed_values_are_load_errors() {
    Jail::expect_with(|_jail| {
        let file = write_config("[protocol]\nack_timeout = \"soon\"");
        assert!(matches!(
            RigConfig::load_from(file.path()),
            Err(ConfigError::LoadError(_))
        ));

        let file = write_config("[protocol]\nstatus_mode = \"sometimes\"");
        assert!(matches!(
            RigConfig::load_from(file.path()),
            Err(ConfigError::LoadError(_))
        ));
        Ok(())
    });
}
