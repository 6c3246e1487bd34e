//! Run parameters. There are no command-line flags; every knob has a default
//! that works on common x86 parts and can be overridden from the environment.

use crate::error::ConfigError;

// Recursion depth should be equal or greater than the RSB size, but not
// excessively high because of the possibility of stack overflow.
pub const DEFAULT_RECURSION_DEPTH: usize = 64;
pub const DEFAULT_RSB_SIZE: usize = 16;
pub const MAX_RECURSION_DEPTH: usize = 4096;
pub const MAX_CORES: usize = libc::CPU_SETSIZE as usize;
pub const DEFAULT_ATTEMPT_CAP: usize = 100_000;

pub const DEPTH_VAR: &str = "RET2SPEC_DEPTH";
pub const RSB_SIZE_VAR: &str = "RET2SPEC_RSB_SIZE";
pub const ATTEMPT_CAP_VAR: &str = "RET2SPEC_ATTEMPT_CAP";
pub const CORE_VAR: &str = "RET2SPEC_CORE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Nesting depth of both recursions.
    pub recursion_depth: usize,
    /// Assumed depth of the return predictor history on the target part.
    pub rsb_size: usize,
    /// Attempts per offset before giving up is `attempt_cap + 1`.
    pub attempt_cap: usize,
    /// Logical core the cross-process variant pins both roles to.
    pub core: usize,
}

impl Default for Config {
    fn default() -> Self
    {
        Config {
            recursion_depth: DEFAULT_RECURSION_DEPTH,
            rsb_size: DEFAULT_RSB_SIZE,
            attempt_cap: DEFAULT_ATTEMPT_CAP,
            core: 0,
        }
    }
}

impl Config {
    /// Defaults overridden by the `RET2SPEC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError>
    {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`Config::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let read = |var: &'static str, default: usize| -> Result<usize, ConfigError> {
            match lookup(var) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Unparsable { var, value }),
            }
        };

        let defaults = Config::default();
        let config = Config {
            recursion_depth: read(DEPTH_VAR, defaults.recursion_depth)?,
            rsb_size: read(RSB_SIZE_VAR, defaults.rsb_size)?,
            attempt_cap: read(ATTEMPT_CAP_VAR, defaults.attempt_cap)?,
            core: read(CORE_VAR, defaults.core)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError>
    {
        if self.recursion_depth < self.rsb_size {
            return Err(ConfigError::DepthBelowHistory {
                depth: self.recursion_depth,
                rsb_size: self.rsb_size,
            });
        }
        if self.recursion_depth > MAX_RECURSION_DEPTH {
            return Err(ConfigError::DepthTooLarge {
                depth: self.recursion_depth,
                max: MAX_RECURSION_DEPTH,
            });
        }
        if self.core >= MAX_CORES {
            return Err(ConfigError::CoreOutOfRange { core: self.core, max: MAX_CORES });
        }
        if self.attempt_cap == 0 {
            return Err(ConfigError::ZeroAttemptCap);
        }
        Ok(())
    }
}
