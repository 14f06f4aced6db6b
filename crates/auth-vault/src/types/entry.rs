use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Whether a vault entry holds a session-bound refresh token or an
/// `offline_access` token valid across logouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Refresh,
    Offline,
}

/// Lifecycle state of an offline entry. Refresh entries only ever use
/// `Active` or `None` (I2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Active,
    Failed,
    None,
}

/// A single row of the token vault (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultEntry {
    pub id: Uuid,
    pub user_id: String,
    pub token_type: TokenType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_state_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_state: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl VaultEntry {
    /// I5: a read MUST reject any entry whose `expiresAt` has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= OffsetDateTime::now_utc()
    }

    /// I1: active entries must carry ciphertext, IV, and a hash.
    pub fn has_ciphertext(&self) -> bool {
        self.encrypted_token.is_some() && self.iv.is_some() && self.token_hash.is_some()
    }
}
