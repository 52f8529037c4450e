use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const CONFIG_FILE_NAME: &str = "pylower.toml";

/// Knobs that change how a module is lowered.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoweringOptions {
    /// 0 keeps asserts and docstrings, 1 drops asserts, 2 also drops docstrings.
    pub optimize: u8,
    /// Nesting limit for recursive lowering of statements, expressions and patterns.
    pub max_recursion_depth: usize,
    /// Limit on simultaneously active frame blocks in one unit.
    pub max_block_depth: usize,
    /// Allow comprehensions marked inlinable by the resolver to be lowered in place.
    pub inline_comprehensions: bool,
    /// Print the value of module-level expression statements.
    pub interactive: bool,
}

impl Default for LoweringOptions {
    fn default() -> Self {
        Self {
            optimize: 0,
            max_recursion_depth: 200,
            max_block_depth: 20,
            inline_comprehensions: true,
            interactive: false,
        }
    }
}

/// Raw TOML structure for deserialization.
#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    lowering: LoweringOptions,
}

/// Errors that can occur when loading a `pylower.toml`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no pylower.toml found (searched from {0})")]
    NotFound(String),
    #[error("failed to read pylower.toml: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid pylower.toml: {0}")]
    ParseError(String),
    #[error("invalid pylower.toml: [lowering] {0} must be at least 1")]
    Invalid(&'static str),
}

/// Walk up from `start_dir` looking for `pylower.toml`.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();
    loop {
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            return None;
        }
    }
}

pub fn load_config(path: &Path) -> Result<LoweringOptions, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate the `[lowering]` table. Missing keys take defaults.
pub fn parse_config(content: &str) -> Result<LoweringOptions, ConfigError> {
    let raw: RawConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    let options = raw.lowering;
    if options.max_recursion_depth == 0 {
        return Err(ConfigError::Invalid("max_recursion_depth"));
    }
    if options.max_block_depth == 0 {
        return Err(ConfigError::Invalid("max_block_depth"));
    }
    Ok(options)
}

/// Find and load the config starting from an input file's directory.
/// A missing file is reported as [`ConfigError::NotFound`]; callers usually
/// fall back to defaults.
pub fn find_and_load_config(input_file: &Path) -> Result<LoweringOptions, ConfigError> {
    let start_dir = input_file.parent().unwrap_or_else(|| Path::new("."));
    let path = find_config(start_dir)
        .ok_or_else(|| ConfigError::NotFound(start_dir.display().to_string()))?;
    load_config(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let options = parse_config("").unwrap();
        assert_eq!(options, LoweringOptions::default());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[lowering]
optimize = 2
max_recursion_depth = 50
max_block_depth = 10
inline_comprehensions = false
interactive = true
"#;
        let options = parse_config(toml).unwrap();
        assert_eq!(options.optimize, 2);
        assert_eq!(options.max_recursion_depth, 50);
        assert_eq!(options.max_block_depth, 10);
        assert!(!options.inline_comprehensions);
        assert!(options.interactive);
    }

    #[test]
    fn partial_table_keeps_other_defaults() {
        let options = parse_config("[lowering]\noptimize = 1\n").unwrap();
        assert_eq!(options.optimize, 1);
        assert_eq!(options.max_recursion_depth, 200);
        assert!(options.inline_comprehensions);
    }

    #[test]
    fn zero_depth_is_rejected() {
        let err = parse_config("[lowering]\nmax_recursion_depth = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("max_recursion_depth")));
    }

    #[test]
    fn unknown_key_is_a_parse_error() {
        let err = parse_config("[lowering]\nfoo = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn find_config_walks_up() {
        let root = std::env::temp_dir().join(format!("pylower-config-{}", std::process::id()));
        let nested = root.join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.join(CONFIG_FILE_NAME), "[lowering]\noptimize = 1\n").unwrap();

        let found = find_config(&nested).unwrap();
        assert_eq!(found, root.join(CONFIG_FILE_NAME));
        let options = find_and_load_config(&nested.join("input.json")).unwrap();
        assert_eq!(options.optimize, 1);

        std::fs::remove_dir_all(&root).unwrap();
    }
}
