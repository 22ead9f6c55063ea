//! Error utilities shared by the exchange-core workspace.
//!
//! # Type erasure
//!
//! The [`BoxError`] type alias is a boxed `std::error::Error` trait object.
//! It is used at abstraction boundaries where the concrete error type does
//! not matter, only the fact that something failed: connection engines,
//! pool callbacks, upgrade coordinators.
//!
//! # Error extension
//!
//! [`ErrorExt`] adds context to any error convertible into [`BoxError`]:
//!
//! - unkeyed or keyed context via [`ErrorExt::context`] / [`ErrorExt::context_field`]
//! - lazy variants via [`ErrorExt::with_context`] / [`ErrorExt::with_context_field`]
//! - a captured backtrace via [`ErrorExt::backtrace`]
//!
//! Context is rendered in a logfmt-like style: always quoted, escaped for
//! control characters, space separated.
//!
//! [`ErrorContext`] extends `Result` and `Option` with the same vocabulary,
//! so `?` can be used to produce a context-enriched [`BoxError`] at the call
//! site.

#![warn(clippy::print_stdout, clippy::dbg_macro)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

use std::error::Error as StdError;

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn StdError + Send + Sync>;

mod ext;
pub use ext::{ErrorContext, ErrorExt};
