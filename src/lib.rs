//! Webreplay - deterministic web page record-replay proxy
//!
//! Records the HTTP traffic a browser generates against live origins and
//! replays it byte-for-byte under emulated network conditions.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::missing_panics_doc,
    clippy::multiple_crate_versions
)]

pub mod archive;
pub mod config;
pub mod dns;
pub mod error;
pub mod fingerprint;
pub mod platform;
pub mod proxy;
pub mod shaper;
pub mod summary;
pub mod supervisor;

pub use error::{ReplayError, Result};
