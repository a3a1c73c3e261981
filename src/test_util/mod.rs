//! Utilities for testing code that sends packets. They are used for testing the engine itself,
//!  and they are exported for application testing.

pub mod send_socket;
