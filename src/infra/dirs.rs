//! Platform-specific directory management
//!
//! Provides the cache directory (where downloaded images are staged for the
//! lifetime of a run) and the config directory (where `config.toml` lives).
//!
//! Environment variables can override default directories:
//! - `FLASHPIPE_CACHE_DIR` - Override cache directory
//! - `FLASHPIPE_CONFIG_DIR` - Override config directory

use std::env;
use std::path::PathBuf;

/// Environment variable names for directory overrides
pub const ENV_CACHE_DIR: &str = "FLASHPIPE_CACHE_DIR";
pub const ENV_CONFIG_DIR: &str = "FLASHPIPE_CONFIG_DIR";

/// Application name used in directory paths
const APP_NAME: &str = "flashpipe";

/// Subdirectory for staged downloads
const DOWNLOADS_SUBDIR: &str = "downloads";

/// Platform-specific directory provider
#[derive(Debug, Clone)]
pub struct FlashpipeDirs {
    cache_dir: PathBuf,
    config_dir: PathBuf,
}

impl FlashpipeDirs {
    /// Create a new `FlashpipeDirs` instance
    ///
    /// Checks environment variables first, then falls back to platform defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache_dir: resolve(ENV_CACHE_DIR, dirs::cache_dir, ".cache"),
            config_dir: resolve(ENV_CONFIG_DIR, dirs::config_dir, ".config"),
        }
    }

    /// Build an instance rooted at explicit directories
    #[must_use]
    pub fn with_roots(cache_dir: PathBuf, config_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            config_dir,
        }
    }

    /// Get the cache directory path
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    /// Get the config directory path
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    /// Directory under which each run stages its download
    #[must_use]
    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir.join(DOWNLOADS_SUBDIR)
    }

    /// Get the global config file path
    #[must_use]
    pub fn global_config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }
}

impl Default for FlashpipeDirs {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a directory from an override variable, the platform default, or
/// a dot-directory under home as a last resort
fn resolve(var: &str, platform: fn() -> Option<PathBuf>, home_fallback: &str) -> PathBuf {
    if let Ok(path) = env::var(var) {
        return PathBuf::from(path);
    }

    platform().map(|p| p.join(APP_NAME)).unwrap_or_else(|| {
        dirs::home_dir()
            .map(|h| h.join(home_fallback).join(APP_NAME))
            .unwrap_or_else(|| PathBuf::from(".").join(home_fallback).join(APP_NAME))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_new_creates_instance() {
        let dirs = FlashpipeDirs::new();
        assert!(!dirs.cache_dir().as_os_str().is_empty());
        assert!(!dirs.config_dir().as_os_str().is_empty());
    }

    #[test]
    fn test_downloads_dir_is_under_cache_dir() {
        let dirs = FlashpipeDirs::new();
        assert!(dirs.downloads_dir().starts_with(dirs.cache_dir()));
    }

    #[test]
    fn test_global_config_path_is_under_config_dir() {
        let dirs = FlashpipeDirs::with_roots(PathBuf::from("/c"), PathBuf::from("/cfg"));
        assert_eq!(dirs.global_config_path(), PathBuf::from("/cfg/config.toml"));
        assert_eq!(dirs.downloads_dir(), PathBuf::from("/c/downloads"));
    }
}
