//! Configuration resolution for the provider connection.
//!
//! Three sources feed the resolved [`ProviderConfig`], in precedence
//! order: explicit flags from the host CLI, environment variables, then
//! built-in defaults. Config-file loading belongs to the host and arrives
//! here as flags.
//!
//! | Value | Flag wins over | Env var | Default |
//! |-------|----------------|---------|---------|
//! | model | yes | `PANPAN_MODEL` | none (required) |
//! | base URL | yes | `PANPAN_BASE_URL` | `http://localhost:1234/v1` |
//! | API key | yes | `PANPAN_API_KEY`, then `OPENAI_API_KEY` | `not-needed` |

use crate::{Error, Result};

/// Environment variable holding the API key.
pub const ENV_API_KEY: &str = "PANPAN_API_KEY";

/// Provider-specific API key fallback honored when [`ENV_API_KEY`] is
/// unset.
pub const ENV_API_KEY_FALLBACK: &str = "OPENAI_API_KEY";

/// Environment variable holding the model name.
pub const ENV_MODEL: &str = "PANPAN_MODEL";

/// Environment variable holding the base URL override.
pub const ENV_BASE_URL: &str = "PANPAN_BASE_URL";

/// Default endpoint; most local OpenAI-compatible servers listen here.
pub const DEFAULT_BASE_URL: &str = "http://localhost:1234/v1";

/// Default API key; local servers generally ignore it.
pub const DEFAULT_API_KEY: &str = "not-needed";

/// Default HTTP timeout for provider calls, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Resolves the model name: flag, then `PANPAN_MODEL`.
pub fn resolve_model(flag: Option<&str>) -> Option<String> {
    flag.map(str::to_string).or_else(|| env_nonempty(ENV_MODEL))
}

/// Resolves the base URL: flag, then `PANPAN_BASE_URL`, then the default.
pub fn resolve_base_url(flag: Option<&str>) -> String {
    flag.map(str::to_string)
        .or_else(|| env_nonempty(ENV_BASE_URL))
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

/// Resolves the API key: flag, then `PANPAN_API_KEY`, then
/// `OPENAI_API_KEY`, then the local-server default.
pub fn resolve_api_key(flag: Option<&str>) -> String {
    flag.map(str::to_string)
        .or_else(|| env_nonempty(ENV_API_KEY))
        .or_else(|| env_nonempty(ENV_API_KEY_FALLBACK))
        .unwrap_or_else(|| DEFAULT_API_KEY.to_string())
}

/// Resolved provider connection settings.
#[derive(Clone)]
pub struct ProviderConfig {
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ProviderConfig {
    /// Resolves a configuration from flags and the environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no model is supplied by flag or
    /// `PANPAN_MODEL`, or when the base URL has no http(s) scheme.
    pub fn resolve(model_flag: Option<&str>, base_url_flag: Option<&str>, api_key_flag: Option<&str>) -> Result<Self> {
        let model = resolve_model(model_flag)
            .ok_or_else(|| Error::config(format!("model is required (set {} or pass --model)", ENV_MODEL)))?;

        let base_url = resolve_base_url(base_url_flag);
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::invalid_input(
                "base_url must start with http:// or https://",
            ));
        }

        Ok(Self {
            model,
            base_url,
            api_key: resolve_api_key(api_key_flag),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_tokens: None,
            temperature: None,
        })
    }

    /// Overrides the HTTP timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Caps completion length.
    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Swaps the model, keeping connection settings. Used when a subagent
    /// config names its own model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            model: "test-model".to_string(),
            base_url: "http://localhost:1234/v1".to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            timeout_secs: 5,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Masks the API key in debug output.
impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}
