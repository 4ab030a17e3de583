//! Cloud Code `v1internal` envelope and project-discovery shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::gemini::{GenerateContentRequest, GenerateContentResponse};

/// Wrapper the `v1internal:generateContent` endpoints expect around a plain
/// Gemini request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentEnvelope {
    pub model: String,
    pub project: String,
    pub user_agent: String,
    pub request_type: String,
    pub request_id: String,
    pub request: GenerateContentRequest,
}

/// One-shot responses arrive either bare or wrapped in `{"response": ...}`
/// depending on the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GenerateContentReply {
    Wrapped { response: GenerateContentResponse },
    Bare(GenerateContentResponse),
}

impl GenerateContentReply {
    pub fn into_response(self) -> GenerateContentResponse {
        match self {
            GenerateContentReply::Wrapped { response } => response,
            GenerateContentReply::Bare(response) => response,
        }
    }
}

/// The `Client-Metadata` header payload and the discovery request metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetadata {
    pub ide_type: String,
    pub platform: String,
    pub plugin_type: String,
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            ide_type: "ANTIGRAVITY".to_string(),
            platform: "PLATFORM_UNSPECIFIED".to_string(),
            plugin_type: "GEMINI".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadCodeAssistRequest {
    pub metadata: ClientMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadCodeAssistResponse {
    #[serde(default)]
    pub cloudaicompanion_project: Option<String>,
    #[serde(default)]
    pub current_tier: Option<JsonValue>,
    #[serde(default)]
    pub allowed_tiers: Vec<TierInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub is_default: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardUserRequest {
    pub tier_id: String,
    pub metadata: ClientMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardUserResponse {
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub response: Option<OnboardUserPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardUserPayload {
    #[serde(default)]
    pub cloudaicompanion_project: Option<CompanionProject>,
}

/// The project shows up as a bare string or an `{id}` object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CompanionProject {
    Id(String),
    Object {
        #[serde(default)]
        id: Option<String>,
    },
}

impl CompanionProject {
    pub fn into_id(self) -> Option<String> {
        match self {
            CompanionProject::Id(id) => Some(id),
            CompanionProject::Object { id } => id,
        }
    }
}

/// OAuth refresh-token grant response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}
