//! HTTP client for the demo backend that fronts the voice assistant.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::Profile;
use crate::delivery::poll::InboxFetcher;
use crate::delivery::sse::{ByteStream, EventStreamOpener};
use crate::state::ChatMessage;
use crate::transcript::ConversationContext;

/// Tool calls behind a chat reply can take minutes.
const CHAT_TIMEOUT: Duration = Duration::from_secs(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{endpoint} failed with status {status}: {body}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("{endpoint} reported failure: {message}")]
    Rejected { endpoint: String, message: String },
    #[error("{endpoint} returned no {field}")]
    Missing { endpoint: String, field: &'static str },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    pub assistant_id: String,
    pub browser_session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub chat_history: String,
    pub conversation_context: String,
    pub source: String,
    #[serde(flatten)]
    pub profile: Profile,
}

impl ChatRequest {
    pub fn new(
        message: &str,
        assistant_id: &str,
        browser_session_id: &str,
        context: ConversationContext,
    ) -> Self {
        Self {
            message: message.to_string(),
            assistant_id: assistant_id.to_string(),
            browser_session_id: browser_session_id.to_string(),
            session_id: None,
            chat_history: context.chat_history,
            conversation_context: context.conversation_context,
            source: "chat".to_string(),
            profile: Profile::default(),
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ChatReply {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct BrowserSessionRequest {
    pub browser_session_id: String,
    pub user_agent: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub profile: Profile,
}

impl BrowserSessionRequest {
    pub fn new(browser_session_id: &str, profile: Profile) -> Self {
        Self {
            browser_session_id: browser_session_id.to_string(),
            user_agent: format!("voicechat/{}", env!("CARGO_PKG_VERSION")),
            timestamp: Utc::now().to_rfc3339(),
            profile,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigStatus {
    pub is_complete: bool,
    #[serde(default)]
    pub missing_items: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub redis: serde_json::Value,
}

/// SaaS branding shown on the public landing page and chat widget.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SaasBranding {
    pub company_name: String,
    pub logo_url: String,
    pub website_url: String,
    pub support_email: String,
    pub impressum_url: String,
    pub privacy_policy_url: String,
    pub terms_url: String,
    pub hero_title: String,
    pub hero_text: String,
    pub welcome_message: String,
    pub cta_text: String,
    pub first_message: String,
    pub calendly_link: String,
    pub auto_color_extraction: bool,
    pub primary_color: String,
    pub secondary_color: String,
    pub accent_color: String,
    pub powered_by_text: String,
    pub powered_by_url: String,
    pub powered_by_company: String,
}

impl SaasBranding {
    /// Sets one field by its form name.
    pub fn set_field(&mut self, name: &str, value: &str) -> Result<()> {
        let slot = match name {
            "company_name" => &mut self.company_name,
            "logo_url" => &mut self.logo_url,
            "website_url" => &mut self.website_url,
            "support_email" => &mut self.support_email,
            "impressum_url" => &mut self.impressum_url,
            "privacy_policy_url" => &mut self.privacy_policy_url,
            "terms_url" => &mut self.terms_url,
            "hero_title" => &mut self.hero_title,
            "hero_text" => &mut self.hero_text,
            "welcome_message" => &mut self.welcome_message,
            "cta_text" => &mut self.cta_text,
            "first_message" => &mut self.first_message,
            "calendly_link" => &mut self.calendly_link,
            "primary_color" => &mut self.primary_color,
            "secondary_color" => &mut self.secondary_color,
            "accent_color" => &mut self.accent_color,
            "powered_by_text" => &mut self.powered_by_text,
            "powered_by_url" => &mut self.powered_by_url,
            "powered_by_company" => &mut self.powered_by_company,
            "auto_color_extraction" => {
                self.auto_color_extraction = matches!(value, "true" | "1" | "yes" | "on");
                return Ok(());
            }
            _ => return Err(anyhow!("Unknown branding field: {}", name)),
        };
        *slot = value.to_string();
        Ok(())
    }

    /// Form fields in the snake_case names the save endpoint expects.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("company_name", self.company_name.clone()),
            ("logo_url", self.logo_url.clone()),
            ("website_url", self.website_url.clone()),
            ("support_email", self.support_email.clone()),
            ("impressum_url", self.impressum_url.clone()),
            ("privacy_policy_url", self.privacy_policy_url.clone()),
            ("terms_url", self.terms_url.clone()),
            ("hero_title", self.hero_title.clone()),
            ("hero_text", self.hero_text.clone()),
            ("welcome_message", self.welcome_message.clone()),
            ("cta_text", self.cta_text.clone()),
            ("first_message", self.first_message.clone()),
            ("calendly_link", self.calendly_link.clone()),
            ("auto_color_extraction", self.auto_color_extraction.to_string()),
            ("primary_color", self.primary_color.clone()),
            ("secondary_color", self.secondary_color.clone()),
            ("accent_color", self.accent_color.clone()),
            ("powered_by_text", self.powered_by_text.clone()),
            ("powered_by_url", self.powered_by_url.clone()),
            ("powered_by_company", self.powered_by_company.clone()),
        ]
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    messages: Vec<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: Option<String>,
}

#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                endpoint: endpoint.to_string(),
                status,
                body,
            }
            .into());
        }
        Ok(response.json().await?)
    }

    /// All queued inbox messages for a session, newest first.
    pub async fn fetch_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let endpoint = format!("/api/messages/{}", session_id);
        let response = self
            .client
            .get(self.url(&endpoint))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let body: MessagesResponse = Self::decode(&endpoint, response).await?;
        if !body.success {
            return Err(ApiError::Rejected {
                endpoint,
                message: body.error.unwrap_or_else(|| "unknown error".to_string()),
            }
            .into());
        }

        Ok(parse_inbox(body.messages))
    }

    pub async fn clear_messages(&self, session_id: &str) -> Result<()> {
        let endpoint = format!("/api/messages/{}", session_id);
        let response = self
            .client
            .delete(self.url(&endpoint))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let body: SuccessResponse = Self::decode(&endpoint, response).await?;
        if !body.success {
            return Err(ApiError::Rejected {
                endpoint,
                message: body
                    .error
                    .or(body.message)
                    .unwrap_or_else(|| "unknown error".to_string()),
            }
            .into());
        }
        Ok(())
    }

    /// Starts a voice assistant session and returns its id.
    pub async fn create_session(&self, profile: &Profile, context: Option<&ConversationContext>) -> Result<String> {
        let endpoint = "/api/create-session";
        let mut query = profile.pairs();
        if let Some(context) = context {
            query.push(("chat_history", context.chat_history.clone()));
            query.push(("conversation_context", context.conversation_context.clone()));
        }

        let response = self
            .client
            .post(self.url(endpoint))
            .query(&query)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let body: CreateSessionResponse = Self::decode(endpoint, response).await?;
        body.session_id.ok_or_else(|| {
            ApiError::Missing {
                endpoint: endpoint.to_string(),
                field: "sessionId",
            }
            .into()
        })
    }

    pub async fn register_browser_session(&self, request: &BrowserSessionRequest) -> Result<()> {
        let endpoint = "/api/register-browser-session";
        let response = self
            .client
            .post(self.url(endpoint))
            .json(request)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let body: SuccessResponse = Self::decode(endpoint, response).await?;
        if !body.success {
            return Err(ApiError::Rejected {
                endpoint: endpoint.to_string(),
                message: body.message.unwrap_or_else(|| "unknown error".to_string()),
            }
            .into());
        }
        Ok(())
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatReply> {
        let endpoint = "/api/chat";
        log::debug!("Sending chat message for session {}", request.browser_session_id);

        let response = self
            .client
            .post(self.url(endpoint))
            .json(request)
            .timeout(CHAT_TIMEOUT)
            .send()
            .await?;

        Self::decode(endpoint, response).await
    }

    pub async fn config_status(&self) -> Result<ConfigStatus> {
        let endpoint = "/api/config-status";
        let response = self
            .client
            .get(self.url(endpoint))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::decode(endpoint, response).await
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        let endpoint = "/health";
        let response = self
            .client
            .get(self.url(endpoint))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::decode(endpoint, response).await
    }

    pub async fn saas_config(&self) -> Result<SaasBranding> {
        let endpoint = "/api/saas-config";
        let response = self
            .client
            .get(self.url(endpoint))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::decode(endpoint, response).await
    }

    pub async fn save_saas_config(&self, branding: &SaasBranding) -> Result<()> {
        let endpoint = "/api/saas-config";
        let response = self
            .client
            .post(self.url(endpoint))
            .form(&branding.form_fields())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let body: SuccessResponse = Self::decode(endpoint, response).await?;
        if !body.success {
            return Err(ApiError::Rejected {
                endpoint: endpoint.to_string(),
                message: body.message.unwrap_or_else(|| "unknown error".to_string()),
            }
            .into());
        }
        Ok(())
    }

    /// Opens the server-sent event stream of inbox messages.
    pub async fn open_message_stream(&self, session_id: &str) -> Result<ByteStream> {
        let endpoint = format!("/api/message-stream/{}", session_id);
        let response = self
            .client
            .get(self.url(&endpoint))
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                endpoint,
                status,
                body,
            }
            .into());
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(anyhow::Error::from))
            .boxed())
    }
}

/// Decodes inbox entries one by one so a single bad entry does not hide
/// the rest.
fn parse_inbox(raw: Vec<serde_json::Value>) -> Vec<ChatMessage> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value::<ChatMessage>(value) {
            Ok(message) => Some(message),
            Err(e) => {
                log::warn!("Skipping malformed inbox entry: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl InboxFetcher for BackendClient {
    async fn fetch_inbox(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        self.fetch_messages(session_id).await
    }
}

#[async_trait]
impl EventStreamOpener for BackendClient {
    async fn open(&self, session_id: &str) -> Result<ByteStream> {
        self.open_message_stream(session_id).await
    }
}
