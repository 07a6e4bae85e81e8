//! Embedder-tunable engine configuration.
//!
//! Follows the non-consuming builder style the host runtime uses for its
//! own construction knobs: every `with_*` method takes and returns `Self`
//! by value, so callers chain `EngineConfig::default().with_foo(..)` without
//! ever fighting the borrow checker over a half-built config.

use crate::compiler::OptimizeOptions;

/// Default cap on the number of compiled [`RegCode`](crate::regcode::RegCode)
/// bodies the call bridge keeps cached before evicting to make room.
const DEFAULT_REGCODE_CACHE_CAPACITY: usize = 4096;

/// Default cap on a single RegCode body's register file.
const DEFAULT_MAX_REGISTER_COUNT: u32 = 4096;

/// Tunables for an [`Engine`](crate::engine::Engine): which optimization
/// passes the compiler runs, how large the RegCode cache may grow, and the
/// largest register file a single compiled body may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    optimize: OptimizeOptions,
    regcode_cache_capacity: usize,
    max_register_count: u32,
}

impl EngineConfig {
    /// Selects which optimization passes `compile` runs.
    pub fn with_optimize_options(mut self, optimize: OptimizeOptions) -> Self {
        self.optimize = optimize;
        self
    }

    /// Caps how many compiled RegCode bodies the call bridge keeps cached.
    /// Once full, resolving a new callable evicts an arbitrary entry rather
    /// than growing without bound.
    pub fn with_regcode_cache_capacity(mut self, capacity: usize) -> Self {
        self.regcode_cache_capacity = capacity;
        self
    }

    /// Caps the register file a single RegCode body may declare. `Engine::run`
    /// rejects anything over this as an internal error before allocating the
    /// register file, so a pathological or adversarial code object can't be
    /// used to force an unbounded allocation.
    pub fn with_max_register_count(mut self, max: u32) -> Self {
        self.max_register_count = max;
        self
    }

    /// Currently selected optimization passes.
    pub const fn optimize(&self) -> OptimizeOptions {
        self.optimize
    }

    /// Currently configured RegCode cache capacity.
    pub const fn regcode_cache_capacity(&self) -> usize {
        self.regcode_cache_capacity
    }

    /// Currently configured register file ceiling.
    pub const fn max_register_count(&self) -> u32 {
        self.max_register_count
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            optimize: OptimizeOptions::default(),
            regcode_cache_capacity: DEFAULT_REGCODE_CACHE_CAPACITY,
            max_register_count: DEFAULT_MAX_REGISTER_COUNT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_the_documented_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.regcode_cache_capacity(), DEFAULT_REGCODE_CACHE_CAPACITY);
        assert_eq!(config.max_register_count(), DEFAULT_MAX_REGISTER_COUNT);
        assert_eq!(config.optimize(), OptimizeOptions::default());
    }

    #[test]
    fn builder_methods_chain_without_disturbing_other_fields() {
        let config = EngineConfig::default()
            .with_regcode_cache_capacity(16)
            .with_max_register_count(64)
            .with_optimize_options(OptimizeOptions::none());

        assert_eq!(config.regcode_cache_capacity(), 16);
        assert_eq!(config.max_register_count(), 64);
        assert_eq!(config.optimize(), OptimizeOptions::none());
    }
}
