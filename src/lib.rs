#![cfg_attr(test, deny(rust_2018_idioms))]

//! # cockpit-bridge
//!
//! The Cockpit agent core: a per-user process on each managed host
//! speaking a framed, multiplexed control protocol on stdio.
//!
//! The pieces:
//!
//! - [`frame`]: the length-prefixed frame codec.
//! - [`transport`]: decoded frames in, queued frames out, over stdio
//!   or the `--interact` boundary framing.
//! - [`router`]: control dispatch, channel lifecycle, rules matching
//!   and external bridges.
//! - [`channel`]: the payload implementations, most notably the HTTP
//!   request/response channel with its keep-alive connection pool.
//! - [`packages`]: the on-disk package listing, its checksums, and the
//!   internal HTTP server that serves package files.
//! - [`session`]: the authorize challenge/response bootstrap shared by
//!   the askpass helper and session spawning.

pub use crate::error::{Error, Result};

pub mod channel;
mod error;
pub mod frame;
pub mod helper;
pub mod json;
pub mod os_release;
pub mod packages;
pub mod protocol;
pub mod router;
pub mod secret;
pub mod session;
pub mod transport;
