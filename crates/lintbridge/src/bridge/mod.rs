//! Wire layer between the parent and the lint worker.
//!
//! - **codec**: marker framing of JSON payloads inside a noisy byte stream
//! - **protocol**: handshake constants, lint request and response types

pub mod codec;
pub mod protocol;
