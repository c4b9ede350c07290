//! This module contains utilities for testing code that runs a session: a simulated host side
//!  of the channel. They are used for testing the session itself, but they are also exported
//!  for application testing and for demos, which is why they are part of the crate's regular
//!  (non-#[cfg(test)]) code.

pub mod host_peer;
