//! Purpose: Map pool names to filesystem locations.
//! Exports: `default_pool_dir`, `path_for_name`, `POOL_FILE_EXTENSION`.
//! Role: The only place that knows where named pools live; everything else
//! Role: works with explicit paths.

use std::env;
use std::path::PathBuf;

use crate::core::error::Error;
use crate::core::name::validate_pool_name;

pub const POOL_FILE_EXTENSION: &str = "cistern";

/// Where named pools live: `$CISTERN_POOL_DIR` when set, otherwise
/// `$HOME/.cistern/pools`, falling back to a relative directory for
/// environments without a home.
pub fn default_pool_dir() -> PathBuf {
    if let Some(dir) = env::var_os("CISTERN_POOL_DIR") {
        return PathBuf::from(dir);
    }
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".cistern").join("pools"),
        None => PathBuf::from(".cistern").join("pools"),
    }
}

/// Filesystem home of a named pool. Validates the name first, so the result
/// is always safely inside the pool directory.
pub fn path_for_name(name: &str) -> Result<PathBuf, Error> {
    validate_pool_name(name)?;
    Ok(default_pool_dir().join(format!("{name}.{POOL_FILE_EXTENSION}")))
}
