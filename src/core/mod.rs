// Core modules implementing storage, record framing, and error modeling.
pub mod error;
pub mod format;
pub mod hose;
pub(crate) mod layout;
pub(crate) mod lock;
pub mod name;
pub(crate) mod notify;
pub(crate) mod plan;
pub mod pool;
pub mod protein;
pub(crate) mod region;
pub(crate) mod resize;
pub mod store;
pub(crate) mod toc;
pub(crate) mod validate;
