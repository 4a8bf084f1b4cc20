//! Source tracking for configuration values.

use serde::Serialize;
use std::fmt;

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// Process environment.
    Environment,
    /// `.env` file in the working directory.
    DotEnv,
    /// Command-line flag.
    CommandLine,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Environment => write!(f, "environment"),
            Self::DotEnv => write!(f, ".env"),
            Self::CommandLine => write!(f, "command line"),
        }
    }
}

/// A value together with the source it was read from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Variable name when read from the environment or `.env`.
    pub env_var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn new(value: T, source: ConfigSource, env_var: Option<String>) -> Self {
        Self {
            value,
            source,
            env_var,
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self::new(value, ConfigSource::Environment, Some(var.into()))
    }

    pub fn default_value(value: T) -> Self {
        Self::new(value, ConfigSource::Default, None)
    }

    pub fn from_cli(value: T) -> Self {
        Self::new(value, ConfigSource::CommandLine, None)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            value: f(self.value),
            source: self.source,
            env_var: self.env_var,
        }
    }

    /// Human-readable origin, e.g. `VM_NAME (.env)`.
    pub fn describe(&self) -> String {
        match &self.env_var {
            Some(var) => format!("{var} ({})", self.source),
            None => self.source.to_string(),
        }
    }
}
