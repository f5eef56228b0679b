//! Region configuration
//!
//! The transactional core itself is constructed with explicit arguments
//! (`Region::create(size, align)`), matching the ABI in `abi`. This module
//! exists for callers that want the usual defaults-plus-overrides loading
//! (the sample driver and tests), layered with `figment`: built-in defaults,
//! an optional `OmenStm.toml`, then `OMEN_STM_`-prefixed environment
//! variables.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Defaults for region creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Size in bytes of the region's first (non-freeable) segment.
    pub first_segment_size: usize,
    /// Alignment in bytes; must be a power of two and divide `first_segment_size`.
    pub alignment: usize,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            first_segment_size: 4096,
            alignment: 8,
        }
    }
}

impl RegionConfig {
    /// Load configuration by layering defaults, `OmenStm.toml` (if present),
    /// and `OMEN_STM_`-prefixed environment variables.
    pub fn load() -> figment::error::Result<Self> {
        Figment::from(Serialized::defaults(RegionConfig::default()))
            .merge(Toml::file("OmenStm.toml"))
            .merge(Env::prefixed("OMEN_STM_"))
            .extract()
    }
}
