//! Agent prompts: embedded YAML defaults with an optional directory
//! override.
//!
//! Canonical text lives in `src/agent/prompts/*.yaml`, embedded at compile
//! time. A `PROMPTS_DIR` environment variable (or explicit directory) can
//! override individual files at runtime; missing files fall back to the
//! embedded copy.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

macro_rules! embed_prompt_yaml {
    ($name:literal) => {
        include_str!(concat!("prompts/", $name))
    };
}

const EMBED_PLANNER: &str = embed_prompt_yaml!("planner.yaml");
const EMBED_REACT: &str = embed_prompt_yaml!("react.yaml");
const EMBED_RELATION: &str = embed_prompt_yaml!("relation.yaml");
const EMBED_CODING: &str = embed_prompt_yaml!("coding.yaml");
const EMBED_FORMATTER: &str = embed_prompt_yaml!("formatter.yaml");

#[derive(Debug, Error)]
pub enum PromptLoadError {
    #[error("failed to read prompts file {path}: {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse YAML in {path}: {message}")]
    ParseYaml { path: String, message: String },
}

#[derive(Deserialize)]
struct PromptFile {
    system: String,
}

/// System prompts for every agent of one process.
#[derive(Clone, Debug)]
pub struct AgentPrompts {
    pub planner: String,
    pub react: String,
    pub relation: String,
    pub coding: String,
    pub formatter: String,
}

fn parse(source: &str, path: &str) -> Result<String, PromptLoadError> {
    let file: PromptFile =
        serde_yaml::from_str(source).map_err(|e| PromptLoadError::ParseYaml {
            path: path.to_string(),
            message: e.to_string(),
        })?;
    Ok(file.system)
}

fn load_one(dir: &Path, name: &str, embedded: &str) -> Result<String, PromptLoadError> {
    let path = dir.join(name);
    match std::fs::read_to_string(&path) {
        Ok(content) => parse(&content, &path.display().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => parse(embedded, name),
        Err(e) => Err(PromptLoadError::ReadFile {
            path: path.display().to_string(),
            message: e.to_string(),
        }),
    }
}

impl AgentPrompts {
    /// Compile-time defaults.
    pub fn embedded() -> Self {
        // The embedded assets are validated by tests; parse cannot fail for
        // a shipped build.
        Self {
            planner: parse(EMBED_PLANNER, "planner.yaml").unwrap_or_default(),
            react: parse(EMBED_REACT, "react.yaml").unwrap_or_default(),
            relation: parse(EMBED_RELATION, "relation.yaml").unwrap_or_default(),
            coding: parse(EMBED_CODING, "coding.yaml").unwrap_or_default(),
            formatter: parse(EMBED_FORMATTER, "formatter.yaml").unwrap_or_default(),
        }
    }

    /// Loads from `dir` (or `PROMPTS_DIR` when `None`), falling back to the
    /// embedded text per file.
    pub fn load(dir: Option<&Path>) -> Result<Self, PromptLoadError> {
        let dir = match dir.map(Path::to_path_buf).or_else(|| {
            std::env::var("PROMPTS_DIR")
                .ok()
                .map(std::path::PathBuf::from)
        }) {
            Some(d) if d.is_dir() => d,
            _ => return Ok(Self::embedded()),
        };
        Ok(Self {
            planner: load_one(&dir, "planner.yaml", EMBED_PLANNER)?,
            react: load_one(&dir, "react.yaml", EMBED_REACT)?,
            relation: load_one(&dir, "relation.yaml", EMBED_RELATION)?,
            coding: load_one(&dir, "coding.yaml", EMBED_CODING)?,
            formatter: load_one(&dir, "formatter.yaml", EMBED_FORMATTER)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_prompts_parse_and_are_non_empty() {
        let prompts = AgentPrompts::embedded();
        for (name, text) in [
            ("planner", &prompts.planner),
            ("react", &prompts.react),
            ("relation", &prompts.relation),
            ("coding", &prompts.coding),
            ("formatter", &prompts.formatter),
        ] {
            assert!(!text.is_empty(), "{name} prompt is empty");
        }
        assert!(prompts.react.contains("one tool per turn"));
    }

    #[test]
    fn directory_override_wins_per_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("react.yaml"),
            "system: |\n  custom react prompt\n",
        )
        .unwrap();
        let prompts = AgentPrompts::load(Some(dir.path())).unwrap();
        assert_eq!(prompts.react.trim(), "custom react prompt");
        // Untouched files keep the embedded text.
        assert_eq!(prompts.planner, AgentPrompts::embedded().planner);
    }

    #[test]
    fn invalid_override_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("coding.yaml"), "nope [[[").unwrap();
        assert!(matches!(
            AgentPrompts::load(Some(dir.path())),
            Err(PromptLoadError::ParseYaml { .. })
        ));
    }
}
