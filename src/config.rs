/*
 * This file is part of Dimmwatch.
 *
 * Copyright (C) 2025 Dimmwatch contributors
 *
 * Dimmwatch is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Dimmwatch is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Dimmwatch. If not, see <https://www.gnu.org/licenses/>.
 */

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use dw_core::constants::{paths, service, smbus};
use dw_core::{DimmwatchError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dimmwatch/config.json";
/// Highest base whose register block still fits in the I/O port space
pub const MAX_SMBUS_BASE: u16 = u16::MAX - smbus::AUX_CONTROL;

fn default_poll_interval_ms() -> u64 { service::DEFAULT_POLL_INTERVAL_MS }
fn default_poll_iterations() -> u32 { smbus::MAX_POLL_ITERATIONS }
fn default_lock_file() -> Option<PathBuf> { Some(PathBuf::from(paths::SMBUS_LOCK_FILE)) }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overrides the platform's SMBus base; 0 keeps the bus off
    #[serde(default)]
    pub smbus_base: Option<u16>,
    /// Status polls allowed per transaction
    #[serde(default = "default_poll_iterations")]
    pub poll_iterations: u32,
    /// Cross-process bus lock; `null` leaves only the in-process lock
    #[serde(default = "default_lock_file")]
    pub lock_file: Option<PathBuf>,
    #[serde(default)]
    pub enable_thermal_sensor: bool,
    /// JSON dump of the memory-device table, used instead of firmware
    #[serde(default)]
    pub platform_tables: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            smbus_base: None,
            poll_iterations: default_poll_iterations(),
            lock_file: default_lock_file(),
            enable_thermal_sensor: false,
            platform_tables: None,
        }
    }
}

pub fn config_path(cli_override: Option<&Path>) -> PathBuf {
    cli_override
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load and validate a config file. A missing file means defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(e.into()),
    };
    let cfg: Config = serde_json::from_str(&data)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    let interval = service::MIN_POLL_INTERVAL_MS..=service::MAX_POLL_INTERVAL_MS;
    if !interval.contains(&cfg.poll_interval_ms) {
        return Err(DimmwatchError::invalid_config(
            "poll_interval_ms",
            format!("{} not in {}..={}", cfg.poll_interval_ms, interval.start(), interval.end()),
        ));
    }
    let iterations = service::MIN_POLL_ITERATIONS..=service::MAX_POLL_ITERATIONS;
    if !iterations.contains(&cfg.poll_iterations) {
        return Err(DimmwatchError::invalid_config(
            "poll_iterations",
            format!("{} not in {}..={}", cfg.poll_iterations, iterations.start(), iterations.end()),
        ));
    }
    if let Some(base) = cfg.smbus_base {
        if base > MAX_SMBUS_BASE {
            return Err(DimmwatchError::invalid_config(
                "smbus_base",
                format!("0x{:04X} above 0x{:04X}", base, MAX_SMBUS_BASE),
            ));
        }
    }
    if let Some(lock) = &cfg.lock_file {
        if lock.as_os_str().is_empty() {
            return Err(DimmwatchError::invalid_config("lock_file", "empty path"));
        }
    }
    if let Some(tables) = &cfg.platform_tables {
        if tables.as_os_str().is_empty() {
            return Err(DimmwatchError::invalid_config("platform_tables", "empty path"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.poll_interval_ms, 1000);
        assert_eq!(cfg.poll_iterations, 1000);
        assert_eq!(cfg.lock_file, Some(PathBuf::from("/run/lock/dimmwatch-smbus.lock")));
        assert!(!cfg.enable_thermal_sensor);
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let cfg = load_config(Path::new("/nonexistent/dimmwatch/config.json")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_empty_object_gives_defaults() {
        let file = write_config("{}");
        assert_eq!(load_config(file.path()).unwrap(), Config::default());
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"{
                "poll_interval_ms": 250,
                "smbus_base": 2816,
                "poll_iterations": 500,
                "lock_file": null,
                "enable_thermal_sensor": true,
                "platform_tables": "/tmp/tables.json"
            }"#,
        );
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.poll_interval_ms, 250);
        assert_eq!(cfg.smbus_base, Some(0x0B00));
        assert_eq!(cfg.poll_iterations, 500);
        assert_eq!(cfg.lock_file, None);
        assert!(cfg.enable_thermal_sensor);
        assert_eq!(cfg.platform_tables, Some(PathBuf::from("/tmp/tables.json")));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let file = write_config(r#"{"poll_interval": 250}"#);
        assert!(matches!(load_config(file.path()), Err(DimmwatchError::JsonParse(_))));
    }

    #[test]
    fn test_poll_interval_out_of_range() {
        for bad in [0, 99, 60_001] {
            let cfg = Config { poll_interval_ms: bad, ..Config::default() };
            match validate_config(&cfg) {
                Err(DimmwatchError::InvalidConfig { field, .. }) => {
                    assert_eq!(field, "poll_interval_ms")
                }
                other => panic!("expected InvalidConfig, got {:?}", other),
            }
        }
        let edge = Config { poll_interval_ms: 100, ..Config::default() };
        assert!(validate_config(&edge).is_ok());
    }

    #[test]
    fn test_poll_iterations_out_of_range() {
        let cfg = Config { poll_iterations: 0, ..Config::default() };
        assert!(matches!(validate_config(&cfg), Err(DimmwatchError::InvalidConfig { .. })));
        let cfg = Config { poll_iterations: 100_001, ..Config::default() };
        assert!(matches!(validate_config(&cfg), Err(DimmwatchError::InvalidConfig { .. })));
    }

    #[test]
    fn test_smbus_base_must_fit_register_block() {
        let cfg = Config { smbus_base: Some(0xFFFF), ..Config::default() };
        match validate_config(&cfg) {
            Err(DimmwatchError::InvalidConfig { field, .. }) => assert_eq!(field, "smbus_base"),
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
        let edge = Config { smbus_base: Some(MAX_SMBUS_BASE), ..Config::default() };
        assert!(validate_config(&edge).is_ok());
        let off = Config { smbus_base: Some(0), ..Config::default() };
        assert!(validate_config(&off).is_ok());
    }

    #[test]
    fn test_invalid_file_fails_to_load() {
        let file = write_config(r#"{"poll_iterations": 0}"#);
        assert!(matches!(load_config(file.path()), Err(DimmwatchError::InvalidConfig { .. })));
    }

    #[test]
    fn test_config_path_override() {
        assert_eq!(config_path(None), PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(config_path(Some(Path::new("/tmp/x.json"))), PathBuf::from("/tmp/x.json"));
    }
}
