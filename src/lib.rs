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

//! Dimmwatch - DDR5 memory module monitor for Linux
//!
//! The binary side of Dimmwatch: configuration, the optional JSON event log
//! and the polling service built on `dw-core`.

pub mod config;
pub mod logger;
pub mod service;

#[cfg(test)]
pub mod test_utils;
