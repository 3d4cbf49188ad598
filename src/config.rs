//! Environment-driven configuration helpers
//!
//! Each subsystem exposes its own `XxxConfig` with a `from_environment`
//! factory; the shared parsing and path conventions live here. Malformed
//! values never abort a build: they fall back to the default with a warning.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Directory under the workspace root holding all persistent build state
pub const CACHE_DIR_NAME: &str = ".builder-cache";

/// Resolve the on-disk state directory for a workspace
pub fn cache_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join(CACHE_DIR_NAME)
}

/// Read and parse an environment variable, warning on malformed values
pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = key, value = %raw, "ignoring malformed environment variable");
            None
        }
    }
}

/// Read an environment variable as a plain string
pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_dir_layout() {
        let dir = cache_dir(Path::new("/workspace"));
        assert_eq!(dir, PathBuf::from("/workspace/.builder-cache"));
    }

    #[test]
    fn test_env_parse_malformed_falls_back() {
        std::env::set_var("FORGE_TEST_BAD_NUMBER", "not-a-number");
        assert_eq!(env_parse::<u64>("FORGE_TEST_BAD_NUMBER"), None);
        std::env::remove_var("FORGE_TEST_BAD_NUMBER");
    }

    #[test]
    fn test_env_parse_valid() {
        std::env::set_var("FORGE_TEST_GOOD_NUMBER", "42");
        assert_eq!(env_parse::<u64>("FORGE_TEST_GOOD_NUMBER"), Some(42));
        std::env::remove_var("FORGE_TEST_GOOD_NUMBER");
    }
}
