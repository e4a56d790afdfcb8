//! REST API surface: HTTP core, credentials and the typed endpoints.

pub mod auth;
pub mod client;
pub mod credentials;
pub mod documents;
pub mod error;
pub mod history;
pub mod passwords;
pub mod settings;

pub use auth::{AuthApi, AuthState, User};
pub use client::{ApiClient, ApiConfig, AuthRefreshCallback, ForcedLogoutCallback};
pub use credentials::{CredentialStore, StoredCredentials};
pub use documents::{
    AiData, DocumentFilter, DocumentUpdate, DocumentsApi, UploadOptions,
};
pub use error::{ApiError, ApiResult};
pub use history::{HistoryEntry, ProcessingHistoryApi};
pub use passwords::{PasswordType, PasswordsApi};
pub use settings::{
    AiSettings, DocumentRules, DuplicateAction, FullEmptyAction, PartialEmptyAction,
    ProcessingSettingsApi,
};
