//! Shared types, configuration and logging for vmexec.

#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod logging;
pub mod types;
pub mod util;

pub use config::{ConfigError, Settings};
pub use errors::{ErrorCategory, ErrorCode, ErrorEntry};
pub use logging::{LogConfig, LogFormat, LoggingError, init_logging};
pub use types::{
    GuestCredentials, PosixFileAttributes, ProcessId, ProcessInfo, ProcessStatus, RunRequest,
    VmTarget,
};
