//! Fatal conditions of a leak run.
//!
//! Oracle noise and scheduling jitter never show up here, the leak loop
//! absorbs them by retrying. Everything below ends the run.

use std::io;

/// Rejected configuration value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?} as an unsigned integer")]
    Unparsable { var: &'static str, value: String },

    #[error("recursion depth {depth} is below the assumed return stack size {rsb_size}")]
    DepthBelowHistory { depth: usize, rsb_size: usize },

    #[error("recursion depth {depth} exceeds the maximum of {max}")]
    DepthTooLarge { depth: usize, max: usize },

    #[error("core {core} is outside the {max}-entry CPU set")]
    CoreOutOfRange { core: usize, max: usize },

    #[error("attempt cap must be at least 1")]
    ZeroAttemptCap,
}

#[derive(Debug, thiserror::Error)]
pub enum Ret2SpecError {
    /// The retry loop gave up on one offset.
    #[error("Does not converge at offset {offset} after {attempts} attempts, best guess {best_guess:#04x}")]
    NonConvergence { offset: usize, attempts: usize, best_guess: u8 },

    #[error("offset {offset} is outside the {len}-byte secret")]
    OffsetOutOfRange { offset: usize, len: usize },

    #[error("CPU affinity setup failed for core {core}: {source}")]
    Affinity { core: usize, #[source] source: io::Error },

    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("writing leaked bytes failed: {0}")]
    Output(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Ret2SpecError>;
