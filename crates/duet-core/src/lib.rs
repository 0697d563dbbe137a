//! duet-core: pure types, wire protocol, and text processing.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod protocol;
pub mod text_prep;
pub mod types;
pub mod wav;
