//! Wire layer between the dispatcher and the analysis engine.
//!
//! - **framer**: splits a byte stream into complete newline-terminated records
//! - **codec**: newline-delimited JSON for `FramedRead`/`FramedWrite`
//! - **protocol**: request, notification and response envelopes

pub mod codec;
pub mod framer;
pub mod protocol;
