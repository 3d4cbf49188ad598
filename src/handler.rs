//! Language handler contract
//!
//! Language toolchains are external collaborators: the core hands a handler
//! one target and a workspace root and receives either an output hash or an
//! error. Nothing else about a language is visible to the core.

use crate::error::{BuildError, BuildResult};
use crate::graph::Target;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Languages the core can route to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Language {
    Python,
    Rust,
    Go,
    Cpp,
    Java,
    Ruby,
    Php,
    JavaScript,
    TypeScript,
    D,
    Zig,
    Swift,
    Kotlin,
    CSharp,
    Scala,
    Elixir,
    Nim,
    Lua,
    R,
    Perl,
    FSharp,
    Css,
}

impl Language {
    /// Canonical lowercase name, as used in build descriptions
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Rust => "rust",
            Language::Go => "go",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Ruby => "ruby",
            Language::Php => "php",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::D => "d",
            Language::Zig => "zig",
            Language::Swift => "swift",
            Language::Kotlin => "kotlin",
            Language::CSharp => "csharp",
            Language::Scala => "scala",
            Language::Elixir => "elixir",
            Language::Nim => "nim",
            Language::Lua => "lua",
            Language::R => "r",
            Language::Perl => "perl",
            Language::FSharp => "fsharp",
            Language::Css => "css",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Language {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "rust" | "rs" => Ok(Language::Rust),
            "go" => Ok(Language::Go),
            "cpp" | "c++" | "cxx" | "c" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            "ruby" | "rb" => Ok(Language::Ruby),
            "php" => Ok(Language::Php),
            "javascript" | "js" => Ok(Language::JavaScript),
            "typescript" | "ts" => Ok(Language::TypeScript),
            "d" => Ok(Language::D),
            "zig" => Ok(Language::Zig),
            "swift" => Ok(Language::Swift),
            "kotlin" | "kt" => Ok(Language::Kotlin),
            "csharp" | "c#" | "cs" => Ok(Language::CSharp),
            "scala" => Ok(Language::Scala),
            "elixir" | "ex" => Ok(Language::Elixir),
            "nim" => Ok(Language::Nim),
            "lua" => Ok(Language::Lua),
            "r" => Ok(Language::R),
            "perl" | "pl" => Ok(Language::Perl),
            "fsharp" | "f#" | "fs" => Ok(Language::FSharp),
            "css" | "web" => Ok(Language::Css),
            other => Err(BuildError::InvalidTarget(format!(
                "unknown language '{other}'"
            ))),
        }
    }
}

/// How an import resolves relative to the workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportKind {
    /// Another module inside the workspace
    Local,
    /// A third-party package
    External,
    /// A toolchain or standard-library module
    System,
}

/// One import statement discovered by a language analyzer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    /// The imported module as written in source
    pub module_name: String,
    /// Resolution category
    pub kind: ImportKind,
    /// Source file the import appears in
    pub location: PathBuf,
}

/// The single contract a language toolchain exposes to the core
///
/// # Errors
///
/// `build` returns `CompileFailure` for user errors and the transient kinds
/// (`TransientIo`, `Network`, `Timeout`) for environmental ones; the retry
/// orchestrator uses the classification to decide whether to call again.
pub trait LanguageHandler: Send + Sync {
    /// The language this handler builds
    fn language(&self) -> Language;

    /// Build one target, returning the hex hash of its output
    fn build(&self, target: &Target, workspace: &Path) -> BuildResult<String>;

    /// Discover the imports of a set of source files
    ///
    /// The default is a handler with no analyzer: no imports.
    fn analyze_imports(&self, _sources: &[PathBuf]) -> BuildResult<Vec<Import>> {
        Ok(Vec::new())
    }
}

/// Registry mapping languages to their handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Language, Arc<dyn LanguageHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for its language
    pub fn register(&mut self, handler: Arc<dyn LanguageHandler>) {
        self.handlers.insert(handler.language(), handler);
    }

    /// Look up the handler for a language
    pub fn get(&self, language: Language) -> Option<Arc<dyn LanguageHandler>> {
        self.handlers.get(&language).cloned()
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
