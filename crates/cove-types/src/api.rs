use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MessageId;

// -- Sends --

/// Draft of a message handed to the backend write API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub body: String,
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub attachments: Vec<NewFile>,
    /// Client-generated correlation nonce. The backend echoes it on the
    /// committed row so the sender can replace its provisional copy.
    pub nonce: Uuid,
}

/// Attachment draft: the upload already happened out of band, the draft
/// only names the stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFile {
    pub name: String,
    pub url: String,
}
