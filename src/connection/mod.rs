//! Client connection management.
//!
//! One task per connection: accumulate bytes, decode complete RESP
//! commands, execute them against the shared engine, write replies back.
//! Partial commands wait in the buffer; pipelined commands drain in one
//! pass.

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
