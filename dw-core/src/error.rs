//! Error types, re-exported from `dw-error` so every module can use `crate::error::Result`.

pub use dw_error::{DimmwatchError, Result};
