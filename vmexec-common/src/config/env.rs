//! Environment variable parsing with type safety.
//!
//! Provides a type-safe parser for vmexec environment variables with
//! validation, error collection, and source tracking. Values are looked up in
//! the process environment first and then in the loaded `.env` file.

use super::dotenv::DotEnv;
use super::source::{ConfigSource, Sourced};
use std::env;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Required variable is not set (or empty).
    #[error("Required variable {var} is not set")]
    Missing { var: String },

    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
    dotenv: DotEnv,
    process_env: bool,
}

impl EnvParser {
    /// Create a new parser with the VMEXEC_ prefix.
    pub fn new() -> Self {
        Self::with_prefix("VMEXEC_")
    }

    /// Create a parser for variables with another prefix (`""` for none).
    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
            dotenv: DotEnv::empty(),
            process_env: true,
        }
    }

    /// Consult `dotenv` for variables missing from the process environment.
    pub fn with_dotenv(mut self, dotenv: DotEnv) -> Self {
        self.dotenv = dotenv;
        self
    }

    /// Ignore the process environment entirely (only `.env` values are read).
    pub fn without_process_env(mut self) -> Self {
        self.process_env = false;
        self
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Check if any errors occurred.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Get the full variable name with prefix.
    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn lookup(&self, var_name: &str) -> Option<(String, ConfigSource)> {
        if self.process_env
            && let Ok(value) = env::var(var_name)
        {
            return Some((value, ConfigSource::Environment));
        }
        self.dotenv
            .get(var_name)
            .map(|value| (value.to_string(), ConfigSource::DotEnv))
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) => Sourced::new(value, source, Some(var_name)),
            None => Sourced::default_value(default.to_string()),
        }
    }

    /// Get a required, non-empty string. Records [`EnvError::Missing`] when
    /// absent and returns an empty value.
    pub fn require_string(&mut self, name: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) if !value.is_empty() => {
                Sourced::new(value, source, Some(var_name))
            }
            _ => {
                self.errors.push(EnvError::Missing { var: var_name });
                Sourced::default_value(String::new())
            }
        }
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) => {
                let parsed = match value.to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" | "" => false,
                    _ => {
                        self.errors.push(EnvError::InvalidValue {
                            var: var_name.clone(),
                            expected: "boolean (true/false/1/0/yes/no)".to_string(),
                            value: value.clone(),
                        });
                        default
                    }
                };
                Sourced::new(parsed, source, Some(var_name))
            }
            None => Sourced::default_value(default),
        }
    }

    /// Get a u64 value with default and range validation.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) => match value.trim().parse::<u64>() {
                Ok(n) if n >= min && n <= max => Sourced::new(n, source, Some(var_name)),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::new(default, source, Some(var_name))
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: "unsigned 64-bit integer".to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            None => Sourced::default_value(default),
        }
    }

    /// Get a path value with ~ expansion.
    pub fn get_path(&mut self, name: &str, default: &str) -> Sourced<PathBuf> {
        let var_name = self.var_name(name);
        let (value, source) = self
            .lookup(&var_name)
            .unwrap_or_else(|| (default.to_string(), ConfigSource::Default));

        let expanded = if let Some(stripped) = value.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                home.join(stripped)
            } else {
                PathBuf::from(&value)
            }
        } else {
            PathBuf::from(&value)
        };

        if source == ConfigSource::Default {
            Sourced::default_value(expanded)
        } else {
            Sourced::new(expanded, source, Some(var_name))
        }
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) => {
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                        Sourced::new(lower, source, Some(var_name))
                    }
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name.clone(),
                            value: value.clone(),
                        });
                        Sourced::new(default.to_string(), source, Some(var_name))
                    }
                }
            }
            None => Sourced::default_value(default.to_string()),
        }
    }

    /// Get an optional string (None if not set or empty).
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some((value, source)) if value.is_empty() => Sourced::new(None, source, Some(var_name)),
            Some((value, source)) => Sourced::new(Some(value), source, Some(var_name)),
            None => Sourced::default_value(None),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
