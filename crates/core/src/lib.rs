//! # requeue-core
//!
//! Types shared by every requeue crate: the [`ObjectKey`] identity used to
//! address and deduplicate work, and the core [`Error`] type.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod error;
pub mod key;

pub use error::{Error, Result};
pub use key::ObjectKey;
