//! `.env` file support.
//!
//! Values are parsed into a map that [`EnvParser`](super::EnvParser) consults
//! after the process environment. The process environment itself is never
//! modified, so variables that are already exported always win.
//!
//! Format:
//! - `KEY=VALUE`, optionally prefixed with `export `
//! - `#` starts a comment on otherwise empty lines, or after whitespace in an
//!   unquoted value
//! - values may be wrapped in single or double quotes; double-quoted values
//!   understand `\n`, `\t`, `\"` and `\\`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading a `.env` file.
#[derive(Debug, Error)]
pub enum DotenvError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: expected KEY=VALUE")]
    Syntax { path: PathBuf, line: usize },
}

/// Parsed contents of a `.env` file.
#[derive(Debug, Clone, Default)]
pub struct DotEnv {
    vars: HashMap<String, String>,
    path: Option<PathBuf>,
}

impl DotEnv {
    /// An empty set of variables.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load `path`. A missing file yields an empty set, like an absent `.env`.
    pub fn load(path: &Path) -> Result<Self, DotenvError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::empty()),
            Err(source) => {
                return Err(DotenvError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let vars = parse_content(&content).map_err(|line| DotenvError::Syntax {
            path: path.to_path_buf(),
            line,
        })?;

        Ok(Self {
            vars,
            path: Some(path.to_path_buf()),
        })
    }

    /// Parse `.env` content that did not come from a file.
    pub fn from_content(content: &str) -> Result<Self, DotenvError> {
        let vars = parse_content(content).map_err(|line| DotenvError::Syntax {
            path: PathBuf::from("<inline>"),
            line,
        })?;
        Ok(Self { vars, path: None })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// The file the variables were loaded from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Parse content into a map; on error returns the 1-based offending line.
fn parse_content(content: &str) -> Result<HashMap<String, String>, usize> {
    let mut vars = HashMap::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

        let Some((key, value)) = line.split_once('=') else {
            return Err(idx + 1);
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(idx + 1);
        }

        vars.insert(key.to_string(), parse_value(value.trim()));
    }

    Ok(vars)
}

fn parse_value(value: &str) -> String {
    if let Some(inner) = value.strip_prefix('"')
        && let Some(end) = find_closing_quote(inner, '"')
    {
        return unescape_double(&inner[..end]);
    }
    if let Some(inner) = value.strip_prefix('\'')
        && let Some(end) = find_closing_quote(inner, '\'')
    {
        return inner[..end].to_string();
    }

    // Unquoted: strip an inline comment introduced by whitespace.
    let mut end = value.len();
    let bytes = value.as_bytes();
    for i in 1..bytes.len() {
        if bytes[i] == b'#' && bytes[i - 1].is_ascii_whitespace() {
            end = i;
            break;
        }
    }
    value[..end].trim_end().to_string()
}

fn find_closing_quote(s: &str, quote: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' && quote == '"' {
            escaped = true;
            continue;
        }
        if c == quote {
            return Some(i);
        }
    }
    None
}

fn unescape_double(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
