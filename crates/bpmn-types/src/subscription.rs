use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SubscriptionId, TokenId};

/// A registered interest in a named message (§3.6). `token_id` is bound
/// once the subscription is mid-flow (an `intermediateCatchEvent`); a
/// process-start subscription has none yet.
///
/// `created_at` is not in the original §3.6 field list but is required by
/// §4.C's tie-break rule ("deliver to the earliest `created_at`") when
/// more than one subscription matches a published message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageSubscription {
    pub subscription_id: SubscriptionId,
    pub process_definition_key: String,
    pub element_id: String,
    pub message_name: String,
    pub correlation_key: Option<String>,
    pub token_id: Option<TokenId>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}
