//! Purpose: Memory-mapped circular pool storage with multi-process access.
//! Exports: `core` (pools, hoses, records, errors) plus `pool_paths`.
//! Role: Library crate; pools are plain files, hoses are cursors over them.
//! Invariants: Records are immutable once deposited; readers never block the
//! Invariants: single writer, and a stomped read is detected, never returned.
pub mod core;
pub mod pool_paths;

pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::format::{POOL_FORMAT_VERSION, SUPPORTED_POOL_FORMAT_VERSIONS};
pub use crate::core::hose::{
    invalidate_all_hoses, open_hose_count, AwaitOutcome, Hose, OptionToggles, Record, Timeout,
    WakeupHandle,
};
pub use crate::core::name::{validate_pool_name, MAX_POOL_NAME_LEN};
pub use crate::core::pool::{Pool, PoolOptions};
pub use crate::core::protein::Protein;
pub use crate::core::store::{RetryHook, TimeBound};
