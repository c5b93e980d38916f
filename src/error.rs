//! Protocol-level error type.
//!
//! `ProtocolError` covers setup failures (locating, spawning, or version-
//! gating the prover binary) and protocol desyncs (malformed envelopes,
//! unexpected failure replies). Rejections of user proof script are *not*
//! errors — `eval` captures those and reports them through its outcome.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to locate 'coqidetop' or 'coqtop' executables")]
    BinaryNotFound,

    #[error("could not parse a version number from prover banner: {0:?}")]
    UnrecognizedBanner(String),

    /// `coqtop` dropped its ide toploop in 8.9; `coqidetop` is required.
    #[error("'coqtop' {version} found, but 'coqidetop' is required since Coq 8.9")]
    UnsupportedVersion { version: String },

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("prover channel i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("prover closed its output stream before a complete reply")]
    UnexpectedEof,

    #[error("malformed reply envelope: {0}")]
    Malformed(String),

    /// Terminal `fail` reply on a command that was not marked fail-tolerant.
    #[error("unexpected failure reply: {0}")]
    UnexpectedFailure(String),
}
