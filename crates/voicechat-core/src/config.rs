use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// How inbox messages are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Push,
    Poll,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Push => "push",
            Transport::Poll => "poll",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "push" | "sse" => Some(Transport::Push),
            "poll" | "polling" => Some(Transport::Poll),
            _ => None,
        }
    }
}

/// Customer details passed to the assistant as template variables.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendly_link: Option<String>,
}

impl Profile {
    /// Non-empty fields as `(name, value)` pairs, for query strings.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        [
            ("customer_name", &self.customer_name),
            ("customer_email", &self.customer_email),
            ("customer_domain", &self.customer_domain),
            ("company_name", &self.company_name),
            ("calendly_link", &self.calendly_link),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            value
                .as_ref()
                .filter(|v| !v.is_empty())
                .map(|v| (name, v.clone()))
        })
        .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub base_url: Option<String>,
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub transport: Transport,
    /// Reuse this session instead of starting a fresh one.
    pub session_id: Option<String>,
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub profile: Profile,
}

impl Config {
    pub fn new() -> Self {
        Self {
            base_url: Some(DEFAULT_BASE_URL.to_string()),
            assistant_id: None,
            transport: Transport::Push,
            session_id: None,
            data_dir: None,
            profile: Profile::default(),
        }
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if !config_path.exists() {
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&config_content)?;
        Ok(config)
    }

    /// Like [`Config::load`], with environment variables taking precedence.
    ///
    /// An unreadable file falls back to the defaults; its error is handed
    /// back so the caller can report it once logging is up.
    pub fn load_with_env() -> (Self, Option<anyhow::Error>) {
        Self::with_env(Self::load(), |key| std::env::var(key).ok())
    }

    fn with_env<F>(loaded: Result<Self>, lookup: F) -> (Self, Option<anyhow::Error>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let (mut config, error) = match loaded {
            Ok(config) => (config, None),
            Err(e) => (Self::new(), Some(e)),
        };
        config.apply_env(lookup);
        (config, error)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("VOICECHAT_BASE_URL") {
            self.base_url = Some(url);
        }
        if let Some(id) = lookup("VOICECHAT_ASSISTANT_ID") {
            self.assistant_id = Some(id);
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;

        // Create config directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, config_content)?;
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .unwrap_or(DEFAULT_BASE_URL)
    }

    /// Where transcripts and the log file live.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?;
        Ok(data_dir.join("voicechat"))
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("voicechat").join("config.json"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
