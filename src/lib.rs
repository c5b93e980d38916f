//! Session driver for the coqidetop XML ide protocol.
//!
//! Drives one interactive prover process over its stdio: splits
//! proof-script text into `.`-terminated statements, submits them one at
//! a time, tracks the prover's committed state id, recovers from false
//! splits by merging adjacent statements, and renders goals, diagnostics
//! and errors as plain text.
//!
//! The owning host is responsible for process teardown, for serializing
//! `eval` calls on a session, and for installing a `tracing` subscriber
//! if it wants the wire-level logs.

pub mod codec;

pub(crate) mod protocol;
pub(crate) mod render;
pub(crate) mod xml;

mod error;
mod session;

pub use error::ProtocolError;
pub use protocol::StateId;
pub use session::{AnomalyMatcher, EvalOutcome, Session, SessionOptions};
