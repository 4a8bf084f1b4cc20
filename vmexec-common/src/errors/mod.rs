//! Error catalog and definitions for vmexec.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                          |
//! |------------|-------------|--------------------------------------|
//! | E001-E099  | Config      | Configuration and local input errors |
//! | E100-E199  | Auth        | Session and guest credentials        |
//! | E200-E299  | Transfer    | Guest file upload/download           |
//! | E300-E399  | Guest       | Guest process and file operations    |
//! | E400-E499  | Run         | Timeouts, budget, cancellation       |

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};
