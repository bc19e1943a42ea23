use crate::errors::ConfigError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4-1106-preview";
pub const DEFAULT_ASSISTANT_NAME: &str = "Page Navigator";

/// Connection and assistant parameters for the thread service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Assistants are looked up by this name and created when missing.
    pub assistant_name: String,
}

impl AssistantConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            assistant_name: DEFAULT_ASSISTANT_NAME.to_string(),
        }
    }

    /// Read `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `NAVIGATOR_MODEL` and
    /// `NAVIGATOR_ASSISTANT`. Only the key is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = var("OPENAI_API_KEY").ok_or(ConfigError::MissingVar("OPENAI_API_KEY"))?;
        let mut config = Self::new(api_key);
        if let Some(base_url) = var("OPENAI_BASE_URL") {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(model) = var("NAVIGATOR_MODEL") {
            config.model = model;
        }
        if let Some(name) = var("NAVIGATOR_ASSISTANT") {
            config.assistant_name = name;
        }
        Ok(config)
    }
}
