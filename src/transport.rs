//! Transport seam between a session and its octet stream.
//!
//! The default transport is a plain TCP stream. A replacement backend (an
//! encrypting wrapper, an in-memory duplex in tests) only has to provide
//! equivalent stream semantics; once a session holds one, nothing else in
//! the system may touch the underlying descriptor.

use std::io::{Read, Write};

/// A bidirectional octet stream able to carry a QAP1 session.
pub trait Transport: Read + Write {}

impl<T: Read + Write> Transport for T {}
