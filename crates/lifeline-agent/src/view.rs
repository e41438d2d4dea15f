use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Public snapshot of a stream, as returned by list/get/create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamView {
    pub id: Uuid,
    pub name: String,
    pub tcp_port: u16,
    pub created_at: DateTime<Utc>,
    pub last_connection_at: DateTime<Utc>,
    /// Only set while disconnected, and only once a disconnect was seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_disconnection_at: Option<DateTime<Utc>>,
}
