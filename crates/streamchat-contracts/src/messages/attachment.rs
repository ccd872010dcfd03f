use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data_url::estimate_data_url_bytes;

/// Output of the attachment optimizer: an encoded image that fits the
/// configured ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizedImageAttachment {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub data_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAttachment {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    pub data_url: String,
}

impl ChatAttachment {
    /// `size` is always re-measured from the stored payload.
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data_url: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            mime_type: mime_type.into(),
            size: estimate_data_url_bytes(&data_url),
            data_url,
        }
    }
}

impl From<OptimizedImageAttachment> for ChatAttachment {
    fn from(value: OptimizedImageAttachment) -> Self {
        Self::new(value.name, value.mime_type, value.data_url)
    }
}
