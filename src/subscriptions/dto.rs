use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct UnsubscribeQuery {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct UnsubscribeResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePreferencesRequest {
    pub weekly_digest_enabled: bool,
    #[serde(default)]
    pub skills_wanted: Vec<String>,
    #[serde(default)]
    pub skills_wanted_custom: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PreferencesResponse {
    pub user_id: Uuid,
    pub weekly_digest_enabled: bool,
    pub skills_wanted: Vec<String>,
    pub skills_wanted_custom: Vec<String>,
    pub last_digest_sent_at: Option<OffsetDateTime>,
}
