///
/// # Bridge Configuration
///
/// Settings applied to handles when they are opened, read from a TOML file.
/// Every field is optional; an empty document yields the defaults.
///
/// ```toml
/// busy_timeout_ms = 250
///
/// [trace]
/// expanded = true
///
/// [tokenizer]
/// module = "naml"
/// ```
///
/// `busy_timeout_ms` replaces the 5 second timeout rusqlite installs at open.
/// `trace.expanded` selects whether trace callbacks receive SQL with bound
/// parameters substituted. `tokenizer.module` is the FTS3 module name the
/// host runtime binds tokenizers under when the caller passes none.
///

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_TOKENIZER_MODULE: &str = "naml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TraceConfig {
    #[serde(default = "default_true")]
    pub expanded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TokenizerConfig {
    #[serde(default = "default_module")]
    pub module: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self { expanded: true }
    }
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            module: DEFAULT_TOKENIZER_MODULE.to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_module() -> String {
    DEFAULT_TOKENIZER_MODULE.to_string()
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.busy_timeout_ms, None);
        assert!(config.trace.expanded);
        assert_eq!(config.tokenizer.module, "naml");
    }

    #[test]
    fn test_full_document() {
        let config = BridgeConfig::from_toml_str(
            r#"
busy_timeout_ms = 250

[trace]
expanded = false

[tokenizer]
module = "words"
"#,
        )
        .unwrap();
        assert_eq!(config.busy_timeout_ms, Some(250));
        assert!(!config.trace.expanded);
        assert_eq!(config.tokenizer.module, "words");
    }

    #[test]
    fn test_partial_table_keeps_field_defaults() {
        let config = BridgeConfig::from_toml_str("[trace]\n").unwrap();
        assert!(config.trace.expanded);
    }

    #[test]
    fn test_invalid_document_is_config_error() {
        let err = BridgeConfig::from_toml_str("busy_timeout_ms = \"soon\"").unwrap_err();
        assert!(err.to_string().contains("Failed to parse bridge config"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "busy_timeout_ms = 10\n").unwrap();
        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.busy_timeout_ms, Some(10));

        let missing = BridgeConfig::load(&dir.path().join("missing.toml"));
        assert!(missing.is_err());
    }
}
