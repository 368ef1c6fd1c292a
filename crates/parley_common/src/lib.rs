//! Parley Common - shared types and pure logic for the chat gateway.
//!
//! Everything here is free of I/O and runtime concerns: the deterministic
//! quick-answer evaluator, the response normalizer, configuration, and the
//! error/disposition taxonomy. The daemon crate (`parleyd`) owns all
//! processes, sockets, and shared state.

pub mod config;
pub mod error;
pub mod normalize;
pub mod quick_answer;
pub mod types;

pub use config::GatewayConfig;
pub use error::{CapacityScope, Denial, Disposition};
pub use types::{
    AnswerMeta, CallerAnswer, ChatRecord, ChatRequest, NormalizedAnswer, SessionEvent,
};
