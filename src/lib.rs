//! Network front end to an embedded statistical interpreter.
//!
//! Clients connect over a reliable stream, receive a 32-octet ID banner and
//! then exchange QAP1 frames: source text goes in, value trees and file data
//! come back. Each connection is served in isolation (by a forked process
//! by default) because the interpreter keeps process-wide mutable state.

pub mod client;
pub mod engine;
pub mod interp;
pub mod proto;
pub mod server;
pub mod session;
pub mod sexp;
pub mod transport;

pub use client::Client;
pub use interp::Interp;
pub use server::{Config, Isolation, Server};
