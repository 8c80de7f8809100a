//! Serial bridge to the IO board.
//!
//! # Architecture
//!
//! - **protocol**: Line format and frame types (KeyPress, CardRead, Tamper, Ping, ...)
//! - **codec**: Newline framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
