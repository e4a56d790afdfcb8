//! Central store of known unlock passwords for PDF and ZIP files.

use serde::{Deserialize, Serialize};
use tracing::error;

use super::client::ApiClient;
use super::error::ApiResult;

/// Password pool a password belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordType {
    Pdf,
    Zip,
}

impl PasswordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Zip => "zip",
        }
    }
}

/// API client for the password table.
#[derive(Clone)]
pub struct PasswordsApi {
    client: ApiClient,
}

impl PasswordsApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Active passwords of the given type.
    pub async fn get_passwords(&self, password_type: PasswordType) -> ApiResult<Vec<String>> {
        let params = [("type", password_type.as_str().to_string())];
        let response = match self.client.get("/passwords", &params).await {
            Ok(r) => r,
            Err(e) => {
                error!("Fehler beim Laden der {}-Passwoerter: {}", password_type.as_str(), e);
                return Err(e);
            }
        };
        if response.get("success").and_then(serde_json::Value::as_bool) != Some(true) {
            return Ok(Vec::new());
        }
        Ok(response["data"]["passwords"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}
