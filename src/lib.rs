//! Return stack buffer poisoning (ret2spec) demonstration.
//!
//! A bounded-depth recursion overwrites the return predictor so the returns
//! of another recursion are mispredicted into code that can never run
//! architecturally. That code reads a cache line chosen by a secret byte, and
//! a flush+reload oracle recovers the byte from the cache footprint.
//!
//! Two variants share this library: the predictor is polluted either by the
//! victim's own call stack ([`Poisoning::SameStack`]) or by a second process
//! pinned to the same core ([`Poisoning::CoScheduled`]).

pub mod config;
pub mod engine;
pub mod error;
pub mod frames;
pub mod instr;
pub mod leak;
pub mod process;
pub mod sidechannel;

pub use config::Config;
pub use engine::{Engine, Poisoning};
pub use error::{ConfigError, Result, Ret2SpecError};
pub use leak::{leak_all, leak_byte};
pub use sidechannel::{CacheSideChannel, LeakResult, Oracle, OracleHandle};

use tracing_subscriber::EnvFilter;

/// The string both demos leak from their own address space.
pub const PRIVATE_DATA: &[u8] = b"It's a s3kr3t!!!";

/// Diagnostics go to stderr, filtered by `RUST_LOG` (default `warn`).
pub fn init_tracing()
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
