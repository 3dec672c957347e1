use chrono::{DateTime, Utc};

use bpmn_storage::{KvStore, StorageGateway};
use bpmn_types::{
    Incident, IncidentFilter, IncidentId, IncidentStats, IncidentStatus, Resolution,
    ResolutionAction, SystemEvent, SystemEventType,
};

use crate::error::IncidentError;
use crate::sink::{IncidentSink, NewIncident};

/// Storage-backed incident subsystem (§4.incidents). Owns no in-memory
/// state beyond the gateway handle — every operation reads/writes
/// through it, so restart needs no recovery pass here (Design Notes §9
/// "readers on restart re-derive in-memory indices from storage scans"
/// trivially holds: there is nothing to re-derive).
pub struct IncidentStore<K: KvStore> {
    gateway: StorageGateway<K>,
}

impl<K: KvStore> Clone for IncidentStore<K> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
        }
    }
}

impl<K: KvStore> IncidentStore<K> {
    pub fn new(gateway: StorageGateway<K>) -> Self {
        Self { gateway }
    }

    pub fn get(&self, incident_id: &str) -> Result<Incident, IncidentError> {
        self.gateway
            .get_incident(incident_id)?
            .ok_or_else(|| IncidentError::NotFound(incident_id.to_string()))
    }

    pub fn list(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, IncidentError> {
        Ok(self.gateway.list_incidents(filter)?)
    }

    /// Apply a resolution action, enforcing `OPEN -> {RESOLVED, DISMISSED}`
    /// (§4.incidents).
    pub fn resolve(
        &self,
        incident_id: &str,
        action: ResolutionAction,
        resolved_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Incident, IncidentError> {
        let mut incident = self.get(incident_id)?;
        if !incident.is_open() {
            return Err(IncidentError::NotOpen(incident_id.to_string()));
        }

        incident.status = match action {
            ResolutionAction::Retry { .. } => IncidentStatus::Resolved,
            ResolutionAction::Dismiss => IncidentStatus::Dismissed,
        };
        incident.resolution = Some(Resolution {
            resolved_at: now,
            resolved_by: resolved_by.into(),
            action,
        });
        self.gateway.save_incident(&incident)?;
        Ok(incident)
    }

    /// Aggregate counts for the incident list view (§4.incidents "stats").
    pub fn stats(&self, now: DateTime<Utc>) -> Result<IncidentStats, IncidentError> {
        let all = self.gateway.list_incidents(&IncidentFilter::default())?;
        let day_ago = now - chrono::Duration::hours(24);

        let mut stats = IncidentStats::default();
        for incident in &all {
            match incident.status {
                IncidentStatus::Open => stats.open_count += 1,
                IncidentStatus::Resolved => stats.resolved_count += 1,
                IncidentStatus::Dismissed => stats.dismissed_count += 1,
            }
            if incident.created_at >= day_ago {
                stats.last_24h_count += 1;
            }
        }
        Ok(stats)
    }
}

impl<K: KvStore> IncidentSink for IncidentStore<K> {
    fn raise(&self, new: NewIncident, now: DateTime<Utc>) -> Result<IncidentId, IncidentError> {
        let incident = Incident {
            incident_id: IncidentId::generate(),
            incident_type: new.incident_type,
            status: IncidentStatus::Open,
            message: new.message,
            instance_id: new.instance_id,
            element_id: new.element_id,
            token_id: new.token_id,
            job_key: new.job_key,
            timer_id: new.timer_id,
            message_name: new.message_name,
            worker_id: new.worker_id,
            created_at: now,
            resolution: None,
        };
        self.gateway.save_incident(&incident)?;
        self.gateway.append_system_event(&SystemEvent::new(
            SystemEventType::IncidentCreated,
            "open",
            incident.message.clone(),
            now,
        ))?;
        Ok(incident.incident_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmn_storage::InMemoryKvStore;
    use bpmn_types::IncidentType;
    use std::sync::Arc;

    fn store() -> IncidentStore<InMemoryKvStore> {
        IncidentStore::new(StorageGateway::new(Arc::new(InMemoryKvStore::new())))
    }

    #[test]
    fn raise_then_get_round_trips() {
        let store = store();
        let now = Utc::now();
        let id = store
            .raise(
                NewIncident::new(IncidentType::TimerError, "bad duration").element("timer-1"),
                now,
            )
            .unwrap();

        let incident = store.get(id.as_str()).unwrap();
        assert!(incident.is_open());
        assert_eq!(incident.incident_type, IncidentType::TimerError);
        assert_eq!(incident.element_id.as_deref(), Some("timer-1"));
    }

    #[test]
    fn resolve_retry_transitions_to_resolved() {
        let store = store();
        let now = Utc::now();
        let id = store
            .raise(NewIncident::new(IncidentType::JobFailure, "boom"), now)
            .unwrap();

        let resolved = store
            .resolve(id.as_str(), ResolutionAction::Retry { new_retries: 3 }, "operator", now)
            .unwrap();
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert!(!resolved.is_open());
    }

    #[test]
    fn resolving_twice_is_rejected() {
        let store = store();
        let now = Utc::now();
        let id = store
            .raise(NewIncident::new(IncidentType::JobFailure, "boom"), now)
            .unwrap();

        store
            .resolve(id.as_str(), ResolutionAction::Dismiss, "operator", now)
            .unwrap();
        let second = store.resolve(id.as_str(), ResolutionAction::Dismiss, "operator", now);
        assert!(matches!(second, Err(IncidentError::NotOpen(_))));
    }

    #[test]
    fn stats_counts_by_status_and_recency() {
        let store = store();
        let now = Utc::now();
        let old = now - chrono::Duration::hours(48);

        let id1 = store
            .raise(NewIncident::new(IncidentType::TimerError, "a"), now)
            .unwrap();
        store
            .raise(NewIncident::new(IncidentType::JobFailure, "b"), old)
            .unwrap();
        store
            .resolve(id1.as_str(), ResolutionAction::Dismiss, "op", now)
            .unwrap();

        let stats = store.stats(now).unwrap();
        assert_eq!(stats.dismissed_count, 1);
        assert_eq!(stats.open_count, 1);
        assert_eq!(stats.last_24h_count, 1);
    }
}
