//! Purpose: Centralize pool format versioning and migration guidance.
//! Exports: `POOL_FORMAT_VERSION`, `SUPPORTED_POOL_FORMAT_VERSIONS`, `pool_version_error`.
//! Role: Shared policy for gating on-disk compatibility across open paths.
//! Invariants: Version list is additive; bump only for incompatible on-disk changes.

use crate::core::error::{Error, ErrorKind};

pub const POOL_FORMAT_VERSION: u32 = 1;
pub const SUPPORTED_POOL_FORMAT_VERSIONS: &[u32] = &[0, POOL_FORMAT_VERSION];

pub fn pool_version_error(detected: u32) -> Error {
    let supported = SUPPORTED_POOL_FORMAT_VERSIONS
        .iter()
        .map(|version| version.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Error::new(ErrorKind::WrongVersion)
        .with_message(format!(
            "unsupported pool format version {detected} (supported: {supported})"
        ))
        .with_hint("upgrade cistern, or migrate the pool by replaying it into a new one")
}
