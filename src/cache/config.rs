//! Cache configuration.
//!
//! Controls the keyspace bound, the feed window length and the page-size
//! bounds via `feedline.toml`.

use std::num::NonZeroUsize;

use serde::Deserialize;

use crate::application::pagination::PageLimits;

const DEFAULT_LIST_LIMIT: usize = 1000;
const DEFAULT_PAGE_SIZE: u32 = 10;
const DEFAULT_MAX_PAGE_SIZE: u32 = 20;
const DEFAULT_MATERIALIZE_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_KEYS: usize = 100_000;

/// Cache configuration from `feedline.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries kept in one subscriber's feed window.
    pub list_limit: usize,
    /// Page size used when a reader does not ask for one.
    pub default_page_size: u32,
    /// Upper bound for requested page sizes.
    pub max_page_size: u32,
    /// How often a window load is retried when pushes race with it.
    pub materialize_attempts: u32,
    /// Keys held before the least recently used one is evicted.
    pub max_keys: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            list_limit: DEFAULT_LIST_LIMIT,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            materialize_attempts: DEFAULT_MATERIALIZE_ATTEMPTS,
            max_keys: DEFAULT_MAX_KEYS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            list_limit: settings.list_limit.get(),
            default_page_size: settings.default_page_size.get(),
            max_page_size: settings.max_page_size.get(),
            materialize_attempts: settings.materialize_attempts.get(),
            max_keys: settings.max_keys.get(),
        }
    }
}

impl CacheConfig {
    /// Returns the window length as NonZeroUsize, clamping to 1 if zero.
    pub fn list_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.list_limit).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the keyspace bound as NonZeroUsize, clamping to 1 if zero.
    pub fn max_keys_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_keys).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.list_limit, 1000);
        assert_eq!(config.default_page_size, 10);
        assert_eq!(config.max_page_size, 20);
        assert_eq!(config.materialize_attempts, 3);
        assert_eq!(config.max_keys, 100_000);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            list_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.list_limit_non_zero().get(), 1);

        let config = CacheConfig {
            max_keys: 0,
            ..Default::default()
        };
        assert_eq!(config.max_keys_non_zero().get(), 1);
    }
}
