//! Env-driven settings for the execution core.
//!
//! Everything the supervisor needs is read once by [`Settings::from_env`]
//! and injected at construction; no module reads the environment afterwards.
//! `.env` loading is the binary's job (the library only sees the process
//! environment).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Chat model provider selection (`AI_PROVIDER`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AiProvider {
    OpenAi,
    OpenAiCompatible,
    Anthropic,
    AzureOpenAi,
    /// Driven through the OpenAI-compatible surface; set `AI_API_BASE` to the
    /// Vertex endpoint.
    VertexAi,
}

impl std::str::FromStr for AiProvider {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "openai_compatible" => Ok(Self::OpenAiCompatible),
            "anthropic" => Ok(Self::Anthropic),
            "azure_openai" => Ok(Self::AzureOpenAi),
            "vertex_ai" => Ok(Self::VertexAi),
            other => Err(SettingsError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("unknown AI_PROVIDER: {0} (use openai, openai_compatible, anthropic, azure_openai, vertex_ai)")]
    UnknownProvider(String),
    #[error("missing required env var: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {message}")]
    InvalidVar { var: &'static str, message: String },
}

/// All tunables for one supervisor, resolved from the environment.
///
/// Defaults follow the documented contract: `preview_cap` 3, step execution
/// timeout 300 s. Fields are public so tests can construct settings directly.
#[derive(Clone, Debug)]
pub struct Settings {
    pub provider: AiProvider,
    /// Model id for the reasoning profile (planner, ReAct, relation analysis).
    pub reasoning_model: String,
    /// Model id for the coding profile (final script synthesis).
    pub coding_model: String,
    pub api_key: String,
    /// Base URL override for openai_compatible / vertex_ai, or the Azure
    /// resource endpoint for azure_openai.
    pub api_base: Option<String>,
    /// Azure API version; ignored by other providers.
    pub azure_api_version: String,
    /// Opaque headers forwarded on every provider request.
    pub custom_http_headers: HashMap<String, String>,

    pub okta_org_url: String,
    pub okta_api_token: String,
    /// SQLite snapshot of the tenant, opened read-only by SQL steps.
    pub okta_db_path: PathBuf,
    /// Query-history store; `None` disables history.
    pub history_db_path: Option<PathBuf>,

    pub sandbox_interpreter: String,
    pub api_concurrent_limit: usize,
    pub api_rate_per_second: u32,
    pub sql_row_cap: usize,
    /// Rows kept in a stored step sample and returned by test executions.
    pub preview_cap: usize,
    /// Byte cap on the single-row preview shown to the model.
    pub preview_max_bytes: usize,
    pub max_stored_bytes_per_step: usize,
    pub max_output_bytes: usize,

    pub step_execution_timeout: Duration,
    pub final_execution_timeout: Duration,
    pub process_timeout: Duration,
    pub cancel_grace: Duration,
    pub llm_call_timeout: Duration,

    pub max_turns: usize,
    pub llm_max_retries: u32,

    pub log_level_console: String,
    pub log_level_file: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: AiProvider::OpenAi,
            reasoning_model: "gpt-4o".to_string(),
            coding_model: "gpt-4o".to_string(),
            api_key: String::new(),
            api_base: None,
            azure_api_version: "2024-06-01".to_string(),
            custom_http_headers: HashMap::new(),
            okta_org_url: String::new(),
            okta_api_token: String::new(),
            okta_db_path: PathBuf::from("okta_snapshot.db"),
            history_db_path: None,
            sandbox_interpreter: "python3".to_string(),
            api_concurrent_limit: 4,
            api_rate_per_second: 10,
            sql_row_cap: 1000,
            preview_cap: 3,
            preview_max_bytes: 2048,
            max_stored_bytes_per_step: 262_144,
            max_output_bytes: 1_048_576,
            step_execution_timeout: Duration::from_secs(300),
            final_execution_timeout: Duration::from_secs(600),
            process_timeout: Duration::from_secs(1800),
            cancel_grace: Duration::from_secs(10),
            llm_call_timeout: Duration::from_secs(120),
            max_turns: 20,
            llm_max_retries: 3,
            log_level_console: "info".to_string(),
            log_level_file: "debug".to_string(),
        }
    }
}

fn var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, SettingsError>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| SettingsError::InvalidVar {
                var: name,
                message: e.to_string(),
            }),
    }
}

fn parse_secs(name: &'static str) -> Result<Option<Duration>, SettingsError> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_secs))
}

impl Settings {
    /// Reads settings from the process environment. Unset knobs keep their
    /// defaults; `AI_API_KEY` falls back to the provider-conventional var
    /// (`OPENAI_API_KEY` / `ANTHROPIC_API_KEY`).
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut s = Settings::default();

        if let Some(p) = var("AI_PROVIDER") {
            s.provider = p.parse()?;
        }
        if let Some(m) = var("REASONING_MODEL") {
            s.reasoning_model = m;
        }
        if let Some(m) = var("CODING_MODEL") {
            s.coding_model = m;
        }
        s.api_key = var("AI_API_KEY")
            .or_else(|| match s.provider {
                AiProvider::Anthropic => var("ANTHROPIC_API_KEY"),
                _ => var("OPENAI_API_KEY"),
            })
            .unwrap_or_default();
        s.api_base = var("AI_API_BASE");
        if let Some(v) = var("AZURE_API_VERSION") {
            s.azure_api_version = v;
        }
        if let Some(raw) = var("CUSTOM_HTTP_HEADERS") {
            s.custom_http_headers =
                serde_json::from_str(&raw).map_err(|e| SettingsError::InvalidVar {
                    var: "CUSTOM_HTTP_HEADERS",
                    message: format!("expected a JSON object of strings: {e}"),
                })?;
        }

        if let Some(v) = var("OKTA_ORG_URL") {
            s.okta_org_url = v;
        }
        if let Some(v) = var("OKTA_API_TOKEN") {
            s.okta_api_token = v;
        }
        if let Some(v) = var("OKTA_DB_PATH") {
            s.okta_db_path = PathBuf::from(v);
        }
        s.history_db_path = var("HISTORY_DB_PATH").map(PathBuf::from);
        if let Some(v) = var("SANDBOX_INTERPRETER") {
            s.sandbox_interpreter = v;
        }

        if let Some(v) = parse_var("API_CONCURRENT_LIMIT")? {
            s.api_concurrent_limit = v;
        }
        if let Some(v) = parse_var("API_RATE_PER_SECOND")? {
            s.api_rate_per_second = v;
        }
        if let Some(v) = parse_var("SQL_ROW_CAP")? {
            s.sql_row_cap = v;
        }
        if let Some(v) = parse_var("PREVIEW_CAP")? {
            s.preview_cap = v;
        }
        if let Some(v) = parse_var("PREVIEW_MAX_BYTES")? {
            s.preview_max_bytes = v;
        }
        if let Some(v) = parse_var("MAX_STORED_BYTES_PER_STEP")? {
            s.max_stored_bytes_per_step = v;
        }
        if let Some(v) = parse_var("MAX_OUTPUT_BYTES")? {
            s.max_output_bytes = v;
        }

        if let Some(v) = parse_secs("STEP_EXECUTION_TIMEOUT_S")? {
            s.step_execution_timeout = v;
        }
        if let Some(v) = parse_secs("FINAL_EXECUTION_TIMEOUT_S")? {
            s.final_execution_timeout = v;
        }
        if let Some(v) = parse_secs("PROCESS_TIMEOUT_S")? {
            s.process_timeout = v;
        }
        if let Some(v) = parse_secs("CANCEL_GRACE_S")? {
            s.cancel_grace = v;
        }
        if let Some(v) = parse_secs("LLM_CALL_TIMEOUT_S")? {
            s.llm_call_timeout = v;
        }

        if let Some(v) = parse_var("MAX_TURNS")? {
            s.max_turns = v;
        }
        if let Some(v) = parse_var("LLM_MAX_RETRIES")? {
            s.llm_max_retries = v;
        }

        if let Some(v) = var("LOG_LEVEL_CONSOLE") {
            s.log_level_console = v;
        }
        if let Some(v) = var("LOG_LEVEL_FILE") {
            s.log_level_file = v;
        }

        s.validate()?;
        Ok(s)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.preview_cap == 0 {
            return Err(SettingsError::InvalidVar {
                var: "PREVIEW_CAP",
                message: "must be at least 1".into(),
            });
        }
        if self.api_concurrent_limit == 0 {
            return Err(SettingsError::InvalidVar {
                var: "API_CONCURRENT_LIMIT",
                message: "must be at least 1".into(),
            });
        }
        if self.sql_row_cap == 0 {
            return Err(SettingsError::InvalidVar {
                var: "SQL_ROW_CAP",
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, MutexGuard};

    // The environment is process-global; tests that touch it serialize.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_guard() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn restore_var(key: &str, prev: Option<String>) {
        match prev {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn defaults_match_documented_contract() {
        let s = Settings::default();
        assert_eq!(s.preview_cap, 3);
        assert_eq!(s.step_execution_timeout, Duration::from_secs(300));
        assert_eq!(s.provider, AiProvider::OpenAi);
    }

    #[test]
    fn provider_parses_all_known_values() {
        for (raw, expected) in [
            ("openai", AiProvider::OpenAi),
            ("openai_compatible", AiProvider::OpenAiCompatible),
            ("anthropic", AiProvider::Anthropic),
            ("azure_openai", AiProvider::AzureOpenAi),
            ("vertex_ai", AiProvider::VertexAi),
        ] {
            assert_eq!(raw.parse::<AiProvider>().unwrap(), expected);
        }
        assert!(matches!(
            "gemini".parse::<AiProvider>(),
            Err(SettingsError::UnknownProvider(_))
        ));
    }

    #[test]
    fn custom_headers_parse_from_json_object() {
        let _guard = env_guard();
        let prev = env::var("CUSTOM_HTTP_HEADERS").ok();
        env::set_var("CUSTOM_HTTP_HEADERS", r#"{"x-team":"iam","x-trace":"1"}"#);
        let s = Settings::from_env().unwrap();
        restore_var("CUSTOM_HTTP_HEADERS", prev);
        assert_eq!(s.custom_http_headers.get("x-team").map(String::as_str), Some("iam"));
    }

    #[test]
    fn malformed_numeric_var_is_a_typed_error() {
        let _guard = env_guard();
        let prev = env::var("PREVIEW_CAP").ok();
        env::set_var("PREVIEW_CAP", "three");
        let err = Settings::from_env().unwrap_err();
        restore_var("PREVIEW_CAP", prev);
        assert!(matches!(err, SettingsError::InvalidVar { var: "PREVIEW_CAP", .. }));
    }

    #[test]
    fn zero_preview_cap_rejected() {
        let _guard = env_guard();
        let prev = env::var("PREVIEW_CAP").ok();
        env::set_var("PREVIEW_CAP", "0");
        let err = Settings::from_env().unwrap_err();
        restore_var("PREVIEW_CAP", prev);
        assert!(matches!(err, SettingsError::InvalidVar { var: "PREVIEW_CAP", .. }));
    }
}
