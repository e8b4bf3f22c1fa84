//! Bridge configuration
//!
//! [`BridgeConfig`] controls how async wrappers validate their const
//! argument positions and what they forward to the host engine. The
//! defaults reproduce the plain bridge behaviour: strict validation,
//! priority 0 and anonymous engine operations.

use std::sync::RwLock;

use crate::error::BridgeResult;

/// How const argument positions are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConstLocPolicy {
    /// Reject negative, duplicate and out-of-range positions, and positions
    /// that do not hold a framework tensor
    #[default]
    Strict,
    /// Drop duplicates silently and ignore positions that do not hold a
    /// framework tensor
    Lenient,
}

/// Configuration for async wrappers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Validation applied to const argument positions
    pub const_loc_policy: ConstLocPolicy,

    /// Priority forwarded to the engine push
    pub engine_priority: i32,

    /// Forward the registry name as the engine operation name
    pub tag_engine_ops: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            const_loc_policy: ConstLocPolicy::Strict,
            engine_priority: 0,
            tag_engine_ops: false,
        }
    }
}

impl BridgeConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the const position policy
    pub fn with_const_loc_policy(mut self, policy: ConstLocPolicy) -> Self {
        self.const_loc_policy = policy;
        self
    }

    /// Set the engine priority
    pub fn with_engine_priority(mut self, priority: i32) -> Self {
        self.engine_priority = priority;
        self
    }

    /// Enable or disable engine operation names
    pub fn with_tag_engine_ops(mut self, tag: bool) -> Self {
        self.tag_engine_ops = tag;
        self
    }
}

static GLOBAL: RwLock<BridgeConfig> = RwLock::new(BridgeConfig {
    const_loc_policy: ConstLocPolicy::Strict,
    engine_priority: 0,
    tag_engine_ops: false,
});

/// Replace the configuration used by wrappers built through the C ABI
///
/// Wrappers already in the registry keep the configuration they were
/// built with.
pub fn set_global(config: BridgeConfig) -> BridgeResult<()> {
    *GLOBAL.write()? = config;
    Ok(())
}

/// Configuration used by wrappers built through the C ABI
pub fn global() -> BridgeResult<BridgeConfig> {
    Ok(GLOBAL.read()?.clone())
}
