use serde::{Deserialize, Serialize};

pub const API_ARG_HEADER: &str = "Dropbox-API-Arg";

#[derive(Debug, Clone, Serialize)]
pub struct StartSessionArg {
    pub close: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadCursor {
    pub session_id: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppendArg {
    pub cursor: UploadCursor,
    pub close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Add,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitInfo {
    pub path: String,
    pub mode: WriteMode,
    pub autorename: bool,
    pub mute: bool,
    pub strict_conflict: bool,
}

impl CommitInfo {
    /// Never overwrites; collisions are renamed by the provider.
    pub fn add(path: String) -> Self {
        Self {
            path,
            mode: WriteMode::Add,
            autorename: true,
            mute: false,
            strict_conflict: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FinishArg {
    pub cursor: UploadCursor,
    pub commit: CommitInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Body of a non-2xx response from the Dropbox API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub error_summary: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountName {
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub name: AccountName,
    #[serde(default)]
    pub email: Option<String>,
}
