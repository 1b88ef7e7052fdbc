//! Reverie Core - Types, errors, and keys shared by the engine and continuity layers

pub mod error;
pub mod time;
pub mod types;

pub use error::{Error, InvalidTransition, PersistenceError, RefusalReason, Refused, Result};
pub use types::*;
