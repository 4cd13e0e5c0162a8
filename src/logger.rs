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

//! Optional JSON event log (`--logging`)
//!
//! One object per line: `{"ts_ms": .., "event": .., "data": ..}`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use serde_json::{json, Value};

pub const DEFAULT_LOG_PATH: &str = "/var/log/dimmwatch/events.json";
pub const FALLBACK_LOG_PATH: &str = "/tmp/dimmwatch_events.json";

lazy_static! {
    static ref LOG_FILE: Mutex<Option<(PathBuf, File)>> = Mutex::new(None);
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn open_append(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}

/// Open the event log, falling back to /tmp when /var/log is not writable.
/// Returns the path in use.
pub fn init_logging() -> Option<PathBuf> {
    init_logging_at(Path::new(DEFAULT_LOG_PATH), Path::new(FALLBACK_LOG_PATH))
}

pub fn init_logging_at(primary: &Path, fallback: &Path) -> Option<PathBuf> {
    let (path, file) = match open_append(primary) {
        Some(f) => (primary.to_path_buf(), f),
        None => (fallback.to_path_buf(), open_append(fallback)?),
    };
    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some((path.clone(), file));
    }
    Some(path)
}

/// Close the event log; later events are dropped
pub fn shutdown_logging() {
    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = None;
    }
}

pub fn is_enabled() -> bool {
    LOG_FILE.lock().map(|g| g.is_some()).unwrap_or(false)
}

/// Append one event. A no-op until [`init_logging`] succeeds.
pub fn log_event(event: &str, data: Value) {
    let line = json!({
        "ts_ms": now_millis(),
        "event": event,
        "data": data,
    })
    .to_string();

    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some((_, f)) = guard.as_mut() {
            let _ = writeln!(f, "{}", line);
        }
    }
}
