//! RESP wire protocol.
//!
//! RESP2: binary-safe, prefix-typed, CRLF-framed. [`types`] holds the value
//! model and serializer, [`parser`] the incremental decoder used by the
//! connection loop.

pub mod parser;
pub mod types;

pub use parser::{decode, ProtoError};
pub use types::RespValue;
