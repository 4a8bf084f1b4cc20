//! Configuration system for vmexec.
//!
//! This module provides:
//! - Environment variable parsing with type safety
//! - .env file support
//! - Source tracking for debugging
//! - Validation on startup

pub mod dotenv;
pub mod env;
pub mod settings;
pub mod source;
pub mod validate;

pub use dotenv::{DotEnv, DotenvError};
pub use env::{EnvError, EnvParser};
pub use settings::{ConfigError, LogSettings, RunSettings, Settings, VcenterSettings};
pub use source::{ConfigSource, Sourced};
pub use validate::{ConfigWarning, Severity, validate_config};
