use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::MessageId;
use crate::value::VariableMap;

/// A message received before any matching subscription existed, held
/// under TTL (§3.7, Glossary).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub message_id: MessageId,
    pub name: String,
    pub correlation_key: String,
    pub variables: VariableMap,
    pub published_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

/// Default buffer TTL (§4.C `Publish`): 60 seconds, configurable per-message.
pub const DEFAULT_BUFFER_TTL_SECS: i64 = 60;
