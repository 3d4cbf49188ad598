//! Build targets
//!
//! A target is the immutable unit of build configuration: identity,
//! sources, dependencies, and the attributes the handler needs. Targets are
//! owned by the configuration frontend and never change during a build.

use crate::handler::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Target identity in `//path:name` form
pub type TargetId = String;

/// What kind of output a target produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetType {
    /// A runnable binary
    Executable,
    /// A linkable or importable library
    Library,
    /// A test suite
    Test,
    /// Anything driven by a custom rule
    Custom,
}

impl TargetType {
    /// Canonical lowercase name, as used in queries
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Executable => "executable",
            TargetType::Library => "library",
            TargetType::Test => "test",
            TargetType::Custom => "custom",
        }
    }
}

impl std::str::FromStr for TargetType {
    type Err = crate::error::BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "executable" | "binary" => Ok(TargetType::Executable),
            "library" => Ok(TargetType::Library),
            "test" => Ok(TargetType::Test),
            "custom" => Ok(TargetType::Custom),
            other => Err(crate::error::BuildError::InvalidTarget(format!(
                "unknown target type '{other}'"
            ))),
        }
    }
}

/// One named build unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Identity, `//path:name`
    pub id: TargetId,
    /// Output kind
    pub target_type: TargetType,
    /// Language whose handler builds this target
    pub language: Language,
    /// Workspace-relative source paths, in declaration order
    pub sources: Vec<PathBuf>,
    /// Ids of targets this one depends on
    pub deps: Vec<TargetId>,
    /// Handler-specific flags
    pub flags: Vec<String>,
    /// Environment overrides for the handler
    pub env: HashMap<String, String>,
    /// Declared output location, if the rule pins one
    pub output_path: Option<PathBuf>,
}

impl Target {
    /// Create a target with no sources, deps, or flags
    pub fn new(id: impl Into<TargetId>, target_type: TargetType, language: Language) -> Self {
        Self {
            id: id.into(),
            target_type,
            language,
            sources: Vec::new(),
            deps: Vec::new(),
            flags: Vec::new(),
            env: HashMap::new(),
            output_path: None,
        }
    }

    /// Set the source list
    pub fn with_sources(mut self, sources: Vec<PathBuf>) -> Self {
        self.sources = sources;
        self
    }

    /// Set the dependency list
    pub fn with_deps(mut self, deps: Vec<TargetId>) -> Self {
        self.deps = deps;
        self
    }

    /// Set handler flags
    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    /// Set handler environment overrides
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Pin the output path
    pub fn with_output_path(mut self, path: PathBuf) -> Self {
        self.output_path = Some(path);
        self
    }

    /// The package part of the id (`//app/core:main` -> `app/core`)
    pub fn package(&self) -> &str {
        let body = self.id.strip_prefix("//").unwrap_or(&self.id);
        body.split(':').next().unwrap_or(body)
    }

    /// The name part of the id (`//app/core:main` -> `main`)
    pub fn name(&self) -> &str {
        self.id
            .rsplit(':')
            .next()
            .unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_parts() {
        let t = Target::new("//app/core:main", TargetType::Executable, Language::Rust);
        assert_eq!(t.package(), "app/core");
        assert_eq!(t.name(), "main");
    }

    #[test]
    fn test_builder_chain() {
        let t = Target::new("//lib:a", TargetType::Library, Language::Cpp)
            .with_sources(vec![PathBuf::from("lib/a.cc")])
            .with_deps(vec!["//lib:b".to_string()])
            .with_flags(vec!["-O2".to_string()]);
        assert_eq!(t.sources.len(), 1);
        assert_eq!(t.deps, vec!["//lib:b".to_string()]);
        assert_eq!(t.flags, vec!["-O2".to_string()]);
    }

    #[test]
    fn test_target_type_parse() {
        assert_eq!("library".parse::<TargetType>().unwrap(), TargetType::Library);
        assert!("widget".parse::<TargetType>().is_err());
    }
}
