//! Common types shared across the TarotSync crates.
//!
//! This crate holds the error taxonomy, the records that flow through the
//! storage backends, and the authentication state observed by the router.

pub mod auth;
pub mod error;
pub mod types;

pub use auth::{parse_expires_in, AuthState, Credentials, UserInfo};
pub use error::{Error, MigrationFailure, Result};
pub use types::{Memos, Session, SessionDate, SpreadRecord, HOURS_PER_DAY};
