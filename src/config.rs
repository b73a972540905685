// ThinLisp Config - Runtime Settings
//
// Sizes and printing options, loadable from JSON.

use crate::arena::{Bistack, MAX_CAPACITY, MIN_CAPACITY};
use crate::cell::MAX_WALK_DEPTH;
use crate::printer::PrintOptions;
use crate::reader::{ReaderOptions, DEFAULT_MAX_DEPTH};
use crate::store::{NvMem, StoreError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("arena_size {0} outside {MIN_CAPACITY}..={MAX_CAPACITY}")]
    ArenaSize(u32),
    #[error("max_depth {0} outside 1..={MAX_WALK_DEPTH}")]
    MaxDepth(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Arena size in bytes.
    pub arena_size: u32,
    /// Non-volatile store size in bytes (0 = no store).
    pub store_size: u32,
    pub max_depth: u8,
    pub print: PrintOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arena_size: 4096,
            store_size: 2048,
            max_depth: DEFAULT_MAX_DEPTH,
            print: PrintOptions::default(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&(self.arena_size as usize)) {
            return Err(ConfigError::ArenaSize(self.arena_size));
        }
        if !(1..=MAX_WALK_DEPTH).contains(&self.max_depth) {
            return Err(ConfigError::MaxDepth(self.max_depth));
        }
        Ok(())
    }

    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            max_depth: self.max_depth,
        }
    }

    pub fn arena(&self) -> Result<Bistack, ConfigError> {
        Bistack::new(self.arena_size as usize).map_err(|_| ConfigError::ArenaSize(self.arena_size))
    }

    pub fn store(&self) -> Result<Option<NvMem>, StoreError> {
        match self.store_size {
            0 => Ok(None),
            n => NvMem::new(n as usize).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = Config::from_json(r#"{ "arena_size": 1024 }"#).unwrap();
        assert_eq!(config.arena_size, 1024);
        assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(config.print, PrintOptions::default());
        assert_eq!(config.arena().unwrap().capacity(), 1024);
    }

    #[test]
    fn test_print_section() {
        let config = Config::from_json(r#"{ "print": { "wrap_after": 3, "explicit_sign": false } }"#).unwrap();
        assert_eq!(config.print.wrap_after, 3);
        assert_eq!(config.print.indent, 2);
        assert!(!config.print.explicit_sign);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            Config::from_json(r#"{ "arena_size": 100000 }"#),
            Err(ConfigError::ArenaSize(100000))
        ));
        assert!(matches!(Config::from_json(r#"{ "max_depth": 0 }"#), Err(ConfigError::MaxDepth(0))));
        assert!(matches!(Config::from_json(r#"{ "max_depth": 40 }"#), Err(ConfigError::MaxDepth(40))));
        assert!(matches!(Config::from_json("{"), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_deepest_accepted_depth_still_walks() {
        let config = Config::from_json(&format!(r#"{{ "max_depth": {} }}"#, MAX_WALK_DEPTH)).unwrap();
        let mut arena = config.arena().unwrap();
        let mut reader = crate::reader::Reader::new(config.reader_options());
        let depth = MAX_WALK_DEPTH as usize;
        let text = format!("{}x{}", "(".repeat(depth), ")".repeat(depth));
        let status = reader.read(&mut arena, &mut crate::streams::StrSource::new(&text)).unwrap();
        let crate::reader::ReadStatus::Done(at) = status else {
            panic!("expected a value");
        };
        let end = crate::cell::advance(&mut arena, &(), at).unwrap();
        assert_eq!(end.offset, arena.forward());
        let printed = crate::printer::print_to_string(&mut arena, &(), at, config.print).unwrap();
        assert_eq!(printed, text);
    }

    #[test]
    fn test_store_optional() {
        let mut config = Config::default();
        assert!(config.store().unwrap().is_some());
        config.store_size = 0;
        assert!(config.store().unwrap().is_none());
    }
}
