use std::path::PathBuf;

use serde::Deserialize;

use crate::parser::DEFAULT_MAX_ERRORS;

/// Engine limits and include resolution. Every field has a default, so a
/// JSON config file only lists what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Nested user calls and includes allowed before a fatal error.
    pub max_recursion_depth: usize,
    /// Live variable slots allowed before a fatal out-of-memory error.
    pub max_values: Option<usize>,
    /// Parse errors collected before compilation gives up.
    pub max_compile_errors: usize,
    /// Searched in order for relative include paths, before the working
    /// directory.
    pub include_paths: Vec<PathBuf>,
    pub report_notices: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_recursion_depth: 256,
            max_values: None,
            max_compile_errors: DEFAULT_MAX_ERRORS,
            include_paths: Vec::new(),
            report_notices: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
