//! Memory manager configuration

use crate::chunk::{DEFAULT_CHUNK_SIZE, PAGE_SIZE};
use crate::error::{MmError, MmResult};

/// Environment variable enabling stress mode (collect before every allocation).
pub const ENV_AGGRESSIVE_GC: &str = "V4_MM_AGGRESSIVE_GC";
/// Environment variable enabling payload poisoning of freed slots.
pub const ENV_POISON_FREED: &str = "V4_MM_POISON_FREED";
/// Environment variable enabling per-type freed-object statistics.
pub const ENV_STATS: &str = "V4_MM_STATS";
/// Environment variable overriding the chunk size in bytes.
pub const ENV_CHUNK_SIZE: &str = "V4_MM_CHUNK_SIZE";

/// How the root enumerator discovers values held on the execution stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackScanMode {
    /// Only walk frames registered through `alloc_stack_frame`
    #[default]
    Precise,
    /// Additionally scan every word of the native call stack
    #[cfg(feature = "conservative-stack")]
    Conservative,
}

/// Memory manager configuration
#[derive(Debug, Clone)]
pub struct MmConfig {
    /// Minimum size of a freshly reserved chunk (default: 64KB)
    pub chunk_size: usize,
    /// Run a full collection before every allocation
    pub aggressive_gc: bool,
    /// Overwrite the payload of freed slots with [`POISON_BYTE`](crate::chunk::POISON_BYTE)
    pub poison_freed: bool,
    /// Track freed-object counts per type name
    pub collect_stats: bool,
    /// Stack root discovery strategy
    pub stack_scan: StackScanMode,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            aggressive_gc: false,
            poison_freed: false,
            collect_stats: false,
            stack_scan: StackScanMode::default(),
        }
    }
}

impl MmConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> MmResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Boolean switches are enabled by the presence of a non-empty value.
    pub fn from_lookup<F>(lookup: F) -> MmResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).is_some_and(|v| !v.is_empty());

        let mut config = Self {
            aggressive_gc: flag(ENV_AGGRESSIVE_GC),
            poison_freed: flag(ENV_POISON_FREED),
            collect_stats: flag(ENV_STATS),
            ..Self::default()
        };

        if let Some(raw) = lookup(ENV_CHUNK_SIZE) {
            let chunk_size = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|&size| size > 0)
                .ok_or(MmError::InvalidConfig {
                    key: ENV_CHUNK_SIZE,
                    value: raw.clone(),
                })?;
            config.chunk_size = chunk_size;
        }

        Ok(config)
    }

    /// Chunk size rounded up to page granularity
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1).next_multiple_of(PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = MmConfig::default();
        assert_eq!(config.chunk_size, 64 * 1024);
        assert!(!config.aggressive_gc);
        assert!(!config.poison_freed);
        assert_eq!(config.stack_scan, StackScanMode::Precise);
    }

    #[test]
    fn test_from_lookup_flags() {
        let config = MmConfig::from_lookup(lookup_from(&[
            (ENV_AGGRESSIVE_GC, "1"),
            (ENV_POISON_FREED, ""),
            (ENV_STATS, "yes"),
        ]))
        .unwrap();
        assert!(config.aggressive_gc);
        assert!(!config.poison_freed);
        assert!(config.collect_stats);
    }

    #[test]
    fn test_from_lookup_chunk_size() {
        let config = MmConfig::from_lookup(lookup_from(&[(ENV_CHUNK_SIZE, "10000")])).unwrap();
        assert_eq!(config.chunk_size, 10000);
        assert_eq!(config.effective_chunk_size(), 12288);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = MmConfig::from_lookup(lookup_from(&[(ENV_CHUNK_SIZE, "big")])).unwrap_err();
        assert_eq!(
            err,
            MmError::InvalidConfig {
                key: ENV_CHUNK_SIZE,
                value: "big".to_string()
            }
        );

        assert!(MmConfig::from_lookup(lookup_from(&[(ENV_CHUNK_SIZE, "0")])).is_err());
    }
}
