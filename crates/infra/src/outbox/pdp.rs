//! Policy Decision Point client boundary.
//!
//! The HTTP client lives with the deployment; the worker only sees this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pdpsync_core::{AllowListUpdate, GrantDuration, SchemaId};

/// Remote PDP operations used by the worker.
#[async_trait]
pub trait PdpClient: Send + Sync {
    async fn create_policy_metadata(
        &self,
        schema_id: &SchemaId,
        sdl: &str,
    ) -> Result<PolicyMetadataCreateResponse, PdpError>;

    async fn update_allow_list(
        &self,
        request: &AllowListUpdateRequest,
    ) -> Result<AllowListUpdateResponse, PdpError>;

    async fn health_check(&self) -> Result<(), PdpError>;
}

/// Remote call failure. The worker never retries or classifies these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PdpError {
    #[error("PDP request failed: {0}")]
    Request(String),
    #[error("PDP returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("PDP request timed out")]
    Timeout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetadataRecord {
    pub id: String,
    pub schema_id: String,
    pub field_name: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMetadataCreateResponse {
    pub records: Vec<PolicyMetadataRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowListUpdateRequestRecord {
    pub field_name: String,
    pub schema_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowListUpdateRequest {
    pub application_id: String,
    pub records: Vec<AllowListUpdateRequestRecord>,
    pub grant_duration: GrantDuration,
}

impl From<&AllowListUpdate> for AllowListUpdateRequest {
    fn from(update: &AllowListUpdate) -> Self {
        Self {
            application_id: update.application_id.to_string(),
            records: update
                .selected_fields
                .iter()
                .map(|field| AllowListUpdateRequestRecord {
                    field_name: field.field_name.clone(),
                    schema_id: field.schema_id.clone(),
                })
                .collect(),
            grant_duration: update.grant_duration,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowListUpdateResponseRecord {
    pub field_name: String,
    pub schema_id: String,
    pub expires_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowListUpdateResponse {
    pub records: Vec<AllowListUpdateResponseRecord>,
}
