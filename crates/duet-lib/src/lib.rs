//! duet-lib: voice conversation engine.
//!
//! Vendor adapters for speech recognition, language models and speech
//! synthesis, the stages guarding them, the per-turn coordinator, and the
//! websocket server. Depends on duet-core for pure types and text handling.

pub mod config;
pub mod context;
pub mod error;
pub mod framing;
pub mod ingest;
pub mod llm;
pub mod mock;
pub mod mux;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod session;
pub mod signing;
pub mod stt;
pub mod tts;

// Re-export duet-core for convenience
pub use duet_core;
