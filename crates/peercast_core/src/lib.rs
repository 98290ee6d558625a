//! Shared application plumbing for peercast: on-disk layout and logging.

pub mod logging;
pub mod paths;

pub use paths::AppPaths;
