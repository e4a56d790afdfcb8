//! Authentication: login, logout, token verification and the
//! re-authentication path used by the 401 refresh ladder.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::client::{ApiClient, ForcedLogoutCallback};
use super::credentials::{CredentialStore, StoredCredentials};
use super::error::{ApiError, ApiResult};

/// Logged-in user with account type and permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_account_type")]
    pub account_type: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

fn default_account_type() -> String {
    "user".to_string()
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.account_type == "admin"
    }

    /// Admins implicitly hold every permission.
    pub fn has_permission(&self, perm: &str) -> bool {
        self.is_admin() || self.permissions.iter().any(|p| p == perm)
    }
}

/// Authentication outcome.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub is_authenticated: bool,
    pub user: Option<User>,
    pub expires_in: u64,
}

impl AuthState {
    fn unauthenticated() -> Self {
        Self { is_authenticated: false, user: None, expires_in: 0 }
    }
}

/// Authentication API over the HTTP core.
#[derive(Clone)]
pub struct AuthApi {
    client: ApiClient,
    store: Arc<CredentialStore>,
    current_user: Arc<RwLock<Option<User>>>,
}

impl AuthApi {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            store: Arc::new(CredentialStore::new()),
            current_user: Arc::new(RwLock::new(None)),
        }
    }

    pub fn current_user(&self) -> Option<User> {
        self.current_user.read().unwrap().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.client.is_authenticated() && self.current_user().is_some()
    }

    /// Log in with username and password. With `remember` the token is
    /// persisted for auto-login.
    pub async fn login(&self, username: &str, password: &str, remember: bool) -> ApiResult<AuthState> {
        let response = self
            .client
            .post(
                "/auth/login",
                &serde_json::json!({ "username": username, "password": password }),
            )
            .await?;

        if response.get("success").and_then(Value::as_bool) != Some(true) {
            warn!("Login fehlgeschlagen: {:?}", response.get("error"));
            return Ok(AuthState::unauthenticated());
        }

        let data = &response["data"];
        let token = data
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::api(500, "Login-Antwort ohne Token"))?
            .to_string();
        let user: User = serde_json::from_value(data["user"].clone())
            .map_err(|e| ApiError::api(500, format!("Login-Antwort nicht lesbar: {}", e)))?;
        let expires_in = data.get("expires_in").and_then(Value::as_u64).unwrap_or(1800);

        self.client.set_token(&token);
        *self.current_user.write().unwrap() = Some(user.clone());

        if remember {
            let stored = StoredCredentials { token, user: data["user"].clone() };
            if let Err(e) = self.store.save(&stored) {
                warn!("{}", e);
            }
        }

        info!("Login erfolgreich: {}", username);
        Ok(AuthState { is_authenticated: true, user: Some(user), expires_in })
    }

    /// Log out and wipe the stored token from both backends.
    pub async fn logout(&self) {
        if self.is_authenticated() {
            let _ = self.client.post("/auth/logout", &serde_json::json!({})).await;
        }
        self.client.clear_token();
        *self.current_user.write().unwrap() = None;
        self.store.delete();
        info!("Logout erfolgreich");
    }

    /// Check whether the current token is still accepted.
    pub async fn verify_token(&self) -> bool {
        if !self.client.is_authenticated() {
            return false;
        }
        match self.client.get("/auth/verify", &[]).await {
            Ok(response) => response.get("valid").and_then(Value::as_bool).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Fetch current user info from the server.
    pub async fn current_user_info(&self) -> Option<Value> {
        if !self.is_authenticated() {
            return None;
        }
        match self.client.get("/auth/me", &[]).await {
            Ok(response) if response.get("success").and_then(Value::as_bool) == Some(true) => {
                response.get("data").and_then(|d| d.get("user")).cloned()
            }
            _ => None,
        }
    }

    /// Verify the token and return extended identity data.
    async fn verify_with_permissions(&self) -> Option<User> {
        if !self.client.is_authenticated() {
            return None;
        }
        let response = self.client.get("/auth/verify", &[]).await.ok()?;
        if response.get("valid").and_then(Value::as_bool) != Some(true) {
            return None;
        }
        Some(User {
            id: response.get("user_id").and_then(Value::as_i64)?,
            username: response.get("username").and_then(Value::as_str)?.to_string(),
            email: None,
            account_type: response
                .get("account_type")
                .and_then(Value::as_str)
                .unwrap_or("user")
                .to_string(),
            permissions: response
                .get("permissions")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        })
    }

    /// Try logging in with the persisted token.
    pub async fn try_auto_login(&self) -> AuthState {
        let Some(saved) = self.store.load() else {
            return AuthState::unauthenticated();
        };
        if saved.token.is_empty() {
            return AuthState::unauthenticated();
        }

        self.client.set_token(&saved.token);

        match self.verify_with_permissions().await {
            Some(user) => {
                info!("Auto-Login erfolgreich: {}", user.username);
                *self.current_user.write().unwrap() = Some(user.clone());
                AuthState { is_authenticated: true, user: Some(user), expires_in: 0 }
            }
            None => {
                self.client.clear_token();
                self.store.delete();
                info!("Auto-Login fehlgeschlagen: Token abgelaufen");
                AuthState::unauthenticated()
            }
        }
    }

    /// Re-authentication used as the 401 refresh callback: reload the
    /// stored token and verify it against the server.
    pub async fn re_authenticate(&self) -> bool {
        info!("Versuche automatische Re-Authentifizierung...");

        let Some(saved) = self.store.load() else {
            warn!("Kein gespeicherter Token vorhanden");
            return false;
        };
        if saved.token.is_empty() {
            warn!("Gespeicherte Token-Daten unvollstaendig");
            return false;
        }

        self.client.set_token(&saved.token);

        match self.verify_with_permissions().await {
            Some(user) => {
                info!("Re-Authentifizierung erfolgreich: {}", user.username);
                *self.current_user.write().unwrap() = Some(user);
                true
            }
            None => {
                self.client.clear_token();
                warn!("Re-Authentifizierung fehlgeschlagen: Token ungueltig");
                false
            }
        }
    }

    /// Wire this instance into the HTTP core as refresh handler and
    /// register the forced-logout notification.
    pub fn install_refresh_handler(&self, on_forced_logout: ForcedLogoutCallback) {
        let auth = self.clone();
        self.client.set_auth_refresh_callback(Arc::new(move || {
            let auth = auth.clone();
            Box::pin(async move { auth.re_authenticate().await })
        }));
        self.client.set_forced_logout_callback(on_forced_logout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_has_all_permissions() {
        let admin = User {
            id: 1,
            username: "root".into(),
            email: None,
            account_type: "admin".into(),
            permissions: vec![],
        };
        assert!(admin.is_admin());
        assert!(admin.has_permission("documents_manage"));

        let user = User {
            id: 2,
            username: "clerk".into(),
            email: None,
            account_type: "user".into(),
            permissions: vec!["documents_history".into()],
        };
        assert!(!user.is_admin());
        assert!(user.has_permission("documents_history"));
        assert!(!user.has_permission("documents_manage"));
    }

    #[test]
    fn test_user_deserialization_defaults() {
        let user: User = serde_json::from_value(serde_json::json!({
            "id": 5,
            "username": "maria"
        }))
        .unwrap();
        assert_eq!(user.account_type, "user");
        assert!(user.permissions.is_empty());
    }
}
