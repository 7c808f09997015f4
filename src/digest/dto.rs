use serde::{Deserialize, Serialize};

/// Body of `POST /jobs/digest`, sent by the external scheduler or an operator.
#[derive(Debug, Deserialize)]
pub struct DigestRequest {
    /// Single test-address mode: one email to this address, no subscriber
    /// selection, no state mutation.
    pub test_email: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    /// Allow-list of recipient addresses.
    pub only_emails: Option<Vec<String>>,
    /// Deny-list of recipient addresses, case-insensitive.
    pub exclude_emails: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct DigestResponse {
    pub success: bool,
    pub sent: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct DigestErrorResponse {
    pub success: bool,
    pub error: String,
}
