//! Common types and utilities shared by the Taro crates.

pub mod error;
pub mod utils;

pub use error::{Result, TaroError};
pub use utils::{is_valid_name, local_ip};

/// Default namespace used when a request leaves the namespace empty.
pub const DEFAULT_NAMESPACE: &str = "public";
