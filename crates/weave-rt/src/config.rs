// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.
//!
//! Values are resolved in this order (highest priority first):
//!
//! 1. Builder methods on [`SchedulerConfig`]
//! 2. `WEAVE_*` environment variables via [`SchedulerConfig::from_env`]
//! 3. Defaults
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `WEAVE_SEED` | `u64` | `seed` |
//! | `WEAVE_CLOCK` | `virtual` \| `wall` | `clock` |
//! | `WEAVE_MAX_STEPS` | `u64` | `max_steps` |

use crate::error::ConfigError;

pub const ENV_SEED: &str = "WEAVE_SEED";
pub const ENV_CLOCK: &str = "WEAVE_CLOCK";
pub const ENV_MAX_STEPS: &str = "WEAVE_MAX_STEPS";

/// How timers measure delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// Logical time. When nothing is runnable the clock jumps straight to
    /// the next timer deadline.
    #[default]
    Virtual,
    /// Wall-clock time. The idle loop really waits for deadlines.
    Wall,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchedulerConfig {
    /// Seed for `select` tie-breaking. `None` seeds from OS entropy.
    pub seed: Option<u64>,
    pub clock: ClockMode,
    /// Upper bound on task polls per `run`. `None` disables the limit.
    pub max_steps: Option<u64>,
}

impl SchedulerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub const fn clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn max_steps(mut self, steps: u64) -> Self {
        self.max_steps = Some(steps);
        self
    }

    /// Defaults overridden by any `WEAVE_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(val) = lookup(ENV_SEED) {
            self.seed = Some(parse_u64(ENV_SEED, &val)?);
        }
        if let Some(val) = lookup(ENV_CLOCK) {
            self.clock = match val.trim().to_ascii_lowercase().as_str() {
                "virtual" => ClockMode::Virtual,
                "wall" => ClockMode::Wall,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: ENV_CLOCK,
                        value: val,
                        reason: "expected `virtual` or `wall`".to_string(),
                    })
                }
            };
        }
        if let Some(val) = lookup(ENV_MAX_STEPS) {
            self.max_steps = Some(parse_u64(ENV_MAX_STEPS, &val)?);
        }
        Ok(())
    }
}

fn parse_u64(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        })
}
