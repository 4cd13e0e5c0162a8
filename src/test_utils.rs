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

//! Shared test helpers

use std::fs;
use std::path::PathBuf;

use mockall::mock;
use tempfile::TempDir;

use dw_core::{PlatformTables, PortIo};

use crate::config::Config;

mock! {
    pub Port {}

    impl PortIo for Port {
        fn read_port(&self, port: u16) -> u8;
        fn write_port(&self, port: u16, value: u8);
    }
}

/// Write `tables` as JSON into a temp dir and point a default config at it.
/// Keep the returned dir alive for as long as the config is used.
pub fn config_with_tables(tables: &PlatformTables) -> (TempDir, Config) {
    let dir = TempDir::new().expect("temp dir");
    let path: PathBuf = dir.path().join("tables.json");
    let json = serde_json::to_string_pretty(tables).expect("serialize tables");
    fs::write(&path, json).expect("write tables");
    let cfg = Config {
        platform_tables: Some(path),
        lock_file: None,
        ..Config::default()
    };
    (dir, cfg)
}
