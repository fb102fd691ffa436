//! Shared types for blob-relay

pub mod error;
pub mod key;

pub use error::{FetchError, RelayError, Result};
pub use key::{ContentKey, KEY_HEX_LEN};
