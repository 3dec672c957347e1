use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, RaceId, TokenId};
use crate::token::WaitHandle;

/// One sibling catcher installed by an `eventBasedGateway` fork.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaceSibling {
    pub token_id: TokenId,
    pub element_id: String,
    pub handle: WaitHandle,
}

/// Tracks the sibling catchers an `eventBasedGateway` installs
/// simultaneously, so the first to fire can cancel the rest (§4.E
/// "install all outgoing event catchers ... simultaneously; first to
/// fire cancels the others"). Keyed the same way `JoinState` is: a
/// deterministic composite id, never a secondary index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewayRace {
    pub race_id: RaceId,
    pub instance_id: InstanceId,
    pub gateway_element_id: String,
    pub siblings: BTreeMap<String, RaceSibling>,
    pub created_at: DateTime<Utc>,
}

impl GatewayRace {
    pub fn composite_id(instance_id: &InstanceId, gateway_element_id: &str) -> RaceId {
        RaceId::from_raw(format!("{instance_id}:{gateway_element_id}"))
    }

    pub fn new(
        instance_id: InstanceId,
        gateway_element_id: impl Into<String>,
        siblings: Vec<RaceSibling>,
        now: DateTime<Utc>,
    ) -> Self {
        let gateway_element_id = gateway_element_id.into();
        Self {
            race_id: Self::composite_id(&instance_id, &gateway_element_id),
            instance_id,
            gateway_element_id,
            siblings: siblings.into_iter().map(|s| (s.token_id.to_string(), s)).collect(),
            created_at: now,
        }
    }

    /// The siblings other than `winner_token_id` — the ones to cancel.
    pub fn losers(&self, winner_token_id: &TokenId) -> Vec<&RaceSibling> {
        self.siblings
            .values()
            .filter(|s| &s.token_id != winner_token_id)
            .collect()
    }
}
