// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber runtime configuration.
//!
//! Settings come from the builder or from `RASK_FIBER_*` environment
//! variables:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `RASK_FIBER_STACK_SIZE` | Stack region size in bytes | 131072 (128 KiB) |
//! | `RASK_FIBER_GUARD_PAGES` | Put a guard page under each stack | true |
//! | `RASK_FIBER_POOL_CAPACITY` | Regions kept by a pooled allocator | 16 |
//!
//! The process-wide config is installed at most once. The first read
//! without an explicit `init` falls back to the environment.

use std::env;
use std::sync::OnceLock;

use crate::error::FiberError;
use crate::stack::MIN_STACK_SIZE;

const DEFAULT_STACK_SIZE: usize = 128 * 1024;
const DEFAULT_POOL_CAPACITY: usize = 16;

/// Configuration consulted when a fiber is created without an explicit
/// allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberConfig {
    /// Size of each stack region in bytes, control block included.
    pub stack_size: usize,
    /// Whether the default allocator maps a guard page below each stack.
    pub guard_pages: bool,
    /// Number of free regions a `PooledFixedSizeStack` retains.
    pub pool_capacity: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            guard_pages: true,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl FiberConfig {
    pub fn builder() -> FiberConfigBuilder {
        FiberConfigBuilder::default()
    }

    /// Load from `RASK_FIBER_*` variables on top of the defaults.
    ///
    /// Unparseable or out-of-range values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize(&lookup, "RASK_FIBER_STACK_SIZE") {
            if val >= MIN_STACK_SIZE {
                config.stack_size = val;
            } else {
                tracing::warn!(
                    value = val,
                    min = MIN_STACK_SIZE,
                    "RASK_FIBER_STACK_SIZE below minimum, ignoring"
                );
            }
        }

        if let Some(val) = parse_env_bool(&lookup, "RASK_FIBER_GUARD_PAGES") {
            config.guard_pages = val;
        }

        if let Some(val) = parse_env_usize(&lookup, "RASK_FIBER_POOL_CAPACITY") {
            config.pool_capacity = val;
        }

        config
    }

    fn validate(&self) -> Result<(), FiberError> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(FiberError::InvalidStackSize {
                size: self.stack_size,
                min: MIN_STACK_SIZE,
            });
        }
        Ok(())
    }
}

/// Builder for [`FiberConfig`].
#[derive(Debug, Clone, Default)]
pub struct FiberConfigBuilder {
    config: FiberConfig,
}

impl FiberConfigBuilder {
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = size;
        self
    }

    pub fn guard_pages(mut self, enabled: bool) -> Self {
        self.config.guard_pages = enabled;
        self
    }

    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.config.pool_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<FiberConfig, FiberError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

static CONFIG: OnceLock<FiberConfig> = OnceLock::new();

/// Install the process-wide configuration.
///
/// Returns `false` if a configuration was already installed (or already
/// read), in which case `config` is discarded.
pub fn init(config: FiberConfig) -> bool {
    let installed = CONFIG.set(config).is_ok();
    if !installed {
        tracing::warn!("fiber configuration already initialized, ignoring");
    }
    installed
}

/// The process-wide configuration.
pub fn current() -> &'static FiberConfig {
    CONFIG.get_or_init(FiberConfig::from_env)
}

fn parse_env_usize(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<usize> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(val) => Some(val),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "expected an integer, ignoring");
            None
        }
    }
}

fn parse_env_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let raw = lookup(name)?;
    match parse_bool(&raw) {
        Some(val) => Some(val),
        None => {
            tracing::warn!(variable = name, value = %raw, "expected a boolean, ignoring");
            None
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
