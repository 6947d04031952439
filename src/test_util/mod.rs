//! Utilities for testing code that uses the transport: an in-memory socket standing in for UDP,
//!  and helpers for building client-side datagrams. They are used by the crate's own tests, but
//!  they are also exported for application testing.

pub mod memory_socket;
pub mod client;
