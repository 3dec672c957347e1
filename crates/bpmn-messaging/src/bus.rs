use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use bpmn_incidents::{IncidentSink, NewIncident};
use bpmn_storage::{KvStore, StorageGateway};
use bpmn_types::{
    BufferedMessage, ExpressionEvaluator, IncidentType, MessageDeliveredCallback, MessageId,
    MessageSubscription, SubscriptionId, TokenId, Value, VariableMap,
    merge_variables,
};

use crate::error::MessageError;

/// A message to publish (§3.7, §4.C `Publish`). `ttl` overrides the
/// default 60s buffer lifetime when set, per "configurable per-message".
pub struct NewMessage {
    pub name: String,
    pub correlation_key: String,
    pub variables: VariableMap,
    pub ttl: Option<chrono::Duration>,
}

/// A subscription to register (§3.6, §4.C `Subscribe`). `correlation_key`
/// is the raw template: empty/`None` matches any key, a leading `=`
/// marks a FEEL expression evaluated against the bound token's variables.
pub struct NewSubscription {
    pub process_definition_key: String,
    pub element_id: String,
    pub message_name: String,
    pub correlation_key: Option<String>,
    pub token_id: Option<TokenId>,
}

/// Sweep cadence and default TTL knobs (§4.C, §5).
#[derive(Clone, Copy, Debug)]
pub struct MessageBusConfig {
    pub eviction_interval: StdDuration,
    pub default_ttl: chrono::Duration,
    pub callback_channel_capacity: usize,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            eviction_interval: StdDuration::from_secs(5),
            default_ttl: chrono::Duration::seconds(bpmn_types::DEFAULT_BUFFER_TTL_SECS),
            callback_channel_capacity: 100,
        }
    }
}

impl MessageBusConfig {
    pub fn build<K: KvStore + 'static>(
        &self,
        gateway: StorageGateway<K>,
        incidents: Arc<dyn IncidentSink>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> (MessageBus<K>, Receiver<MessageDeliveredCallback>) {
        let (sender, receiver) = sync_channel(self.callback_channel_capacity);
        let inner = Arc::new(MessageBusInner {
            gateway,
            incidents,
            evaluator,
            callbacks: sender,
            default_ttl: self.default_ttl,
            // Lock Audit: this mutex serializes "install subscription,
            // then scan buffered" against "publish, then scan
            // subscriptions" (§5) so the two sequences never interleave.
            // Held only across gateway scans, never across the callback
            // channel send.
            lock: Mutex::new(()),
        });

        let evict_inner = Arc::downgrade(&inner);
        let evict_interval = self.eviction_interval;
        thread::spawn(move || {
            loop {
                thread::sleep(evict_interval);
                match evict_inner.upgrade() {
                    Some(inner) => inner.evict_expired(Utc::now()),
                    None => break,
                }
            }
        });

        (MessageBus { inner }, receiver)
    }
}

struct MessageBusInner<K: KvStore> {
    gateway: StorageGateway<K>,
    incidents: Arc<dyn IncidentSink>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    callbacks: SyncSender<MessageDeliveredCallback>,
    default_ttl: chrono::Duration,
    lock: Mutex<()>,
}

impl<K: KvStore> MessageBusInner<K> {
    fn emit(&self, callback: MessageDeliveredCallback) {
        match self.callbacks.try_send(callback) {
            Ok(()) => {}
            Err(TrySendError::Full(cb)) => {
                warn!(subscription_id = %cb.subscription_id, "outbound message callback channel full, dropping");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("no consumer for message callbacks");
            }
        }
    }

    /// Resolve a subscription's correlation key template to the value it
    /// should be compared against, or `None` for "matches any key"
    /// (§4.C matching rule 2, Design Notes §9(c)).
    fn resolve_correlation_key(
        &self,
        sub: &MessageSubscription,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let template = sub.correlation_key.as_deref().unwrap_or("");
        if template.is_empty() {
            return None;
        }
        if let Some(expr) = template.strip_prefix('=') {
            let token_vars = sub
                .token_id
                .as_ref()
                .and_then(|id| self.gateway.get_token(id.as_str()).ok().flatten())
                .map(|t| t.variables)
                .unwrap_or_default();
            let scope = Value::Map(token_vars.into_iter().collect());
            match self.evaluator.evaluate(expr, &scope) {
                Ok(value) => Some(value_to_key_string(&value)),
                Err(err) => {
                    warn!(subscription_id = %sub.subscription_id, error = %err, "correlation key expression failed, falling back to literal");
                    let _ = self.incidents.raise(
                        NewIncident::new(IncidentType::MessageError, err.to_string())
                            .element(sub.element_id.clone())
                            .message_name(sub.message_name.clone()),
                        now,
                    );
                    Some(template.trim().to_string())
                }
            }
        } else {
            Some(template.trim().to_string())
        }
    }

    /// Deliver `message` to `subscription`: merge variables into the
    /// bound token, mark the subscription inactive, emit a resume
    /// callback (§4.C "Delivery").
    fn deliver(
        &self,
        mut sub: MessageSubscription,
        message_name: String,
        variables: VariableMap,
        now: DateTime<Utc>,
    ) -> Result<(), MessageError> {
        let instance_id = if let Some(token_id) = sub.token_id.clone() {
            if let Some(mut token) = self.gateway.get_token(token_id.as_str())? {
                merge_variables(&mut token.variables, &variables);
                token.variables.insert(
                    "_message_correlated".to_string(),
                    bpmn_types::Value::Bool(true),
                );
                token.resume(now);
                self.gateway.save_token(&token)?;
                Some(token.instance_id.clone())
            } else {
                // Token canceled in the interim; the delivery is simply
                // dropped (mirrors the time wheel's "unknown token" rule).
                None
            }
        } else {
            None
        };

        sub.is_active = false;
        self.gateway.save_subscription(&sub)?;

        self.emit(MessageDeliveredCallback {
            subscription_id: sub.subscription_id,
            element_id: sub.element_id,
            token_id: sub.token_id,
            process_instance_id: instance_id,
            message_name,
            variables,
            delivered_at: now,
        });
        Ok(())
    }

    fn evict_expired(&self, now: DateTime<Utc>) {
        let _guard = self.lock.lock().expect("message bus lock poisoned");
        match self.gateway.list_all_buffered() {
            Ok(buffered) => {
                for message in buffered {
                    if !message.consumed && message.expires_at <= now {
                        if let Err(err) = self.gateway.delete_buffered_message(message.message_id.as_str()) {
                            warn!(message_id = %message.message_id, error = %err, "failed to evict expired message");
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "eviction sweep failed to scan buffered messages"),
        }
    }
}

/// Handle to the message correlation bus (§4.C). The eviction sweeper
/// holds only a `Weak` reference and exits once every clone is dropped.
pub struct MessageBus<K: KvStore> {
    inner: Arc<MessageBusInner<K>>,
}

impl<K: KvStore> Clone for MessageBus<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: KvStore> MessageBus<K> {
    /// Deliver immediately to the earliest-created matching subscription,
    /// or buffer under TTL if none matches (§4.C `Publish`).
    pub fn publish(&self, new: NewMessage, now: DateTime<Utc>) -> Result<Option<MessageId>, MessageError> {
        let _guard = self.inner.lock.lock().expect("message bus lock poisoned");

        let candidates = self.inner.gateway.list_subscriptions_by_message_name(&new.name)?;
        let best = candidates
            .into_iter()
            .filter(|sub| self.matches(sub, &new.correlation_key, now))
            .min_by_key(|sub| sub.created_at);

        if let Some(sub) = best {
            self.inner.deliver(sub, new.name, new.variables, now)?;
            return Ok(None);
        }

        let ttl = new.ttl.unwrap_or(self.inner.default_ttl);
        let message = BufferedMessage {
            message_id: MessageId::generate(),
            name: new.name,
            correlation_key: new.correlation_key,
            variables: new.variables,
            published_at: now,
            expires_at: now + ttl,
            consumed: false,
        };
        self.inner.gateway.save_buffered_message(&message)?;
        Ok(Some(message.message_id))
    }

    /// Persist a subscription, then immediately scan buffered messages for
    /// a match, delivering synchronously within this call if one is found
    /// (§4.C `Subscribe`).
    pub fn subscribe(&self, new: NewSubscription, now: DateTime<Utc>) -> Result<SubscriptionId, MessageError> {
        let _guard = self.inner.lock.lock().expect("message bus lock poisoned");

        let sub = MessageSubscription {
            subscription_id: SubscriptionId::generate(),
            process_definition_key: new.process_definition_key,
            element_id: new.element_id,
            message_name: new.message_name,
            correlation_key: new.correlation_key,
            token_id: new.token_id,
            is_active: true,
            created_at: now,
        };
        self.inner.gateway.save_subscription(&sub)?;
        let subscription_id = sub.subscription_id.clone();

        let buffered = self.inner.gateway.list_buffered_by_name(&sub.message_name)?;
        let earliest = buffered
            .into_iter()
            .filter(|msg| self.matches(&sub, &msg.correlation_key, now))
            .min_by_key(|msg| msg.published_at);

        if let Some(mut message) = earliest {
            message.consumed = true;
            self.inner.gateway.save_buffered_message(&message)?;
            self.inner.deliver(sub, message.name, message.variables, now)?;
        }
        Ok(subscription_id)
    }

    /// Clear a subscription; any pending delivery targeting it is simply
    /// dropped since delivery here is synchronous, not queued (§4.C
    /// `Unsubscribe`).
    pub fn unsubscribe(&self, subscription_id: &str) -> Result<(), MessageError> {
        let _guard = self.inner.lock.lock().expect("message bus lock poisoned");
        if self.inner.gateway.get_subscription(subscription_id)?.is_none() {
            return Err(MessageError::SubscriptionNotFound(subscription_id.to_string()));
        }
        self.inner.gateway.delete_subscription(subscription_id)?;
        Ok(())
    }

    fn matches(&self, sub: &MessageSubscription, message_key: &str, now: DateTime<Utc>) -> bool {
        match self.inner.resolve_correlation_key(sub, now) {
            None => true,
            Some(resolved) => resolved == message_key.trim(),
        }
    }
}

fn value_to_key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => serde_json::Value::from(other.clone()).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmn_incidents::IncidentStore;
    use bpmn_storage::InMemoryKvStore;
    use bpmn_types::{ExpressionError, Token};

    struct EchoEvaluator;
    impl ExpressionEvaluator for EchoEvaluator {
        fn evaluate(&self, expression: &str, variables: &Value) -> Result<Value, ExpressionError> {
            Ok(variables.get_path(expression).cloned().unwrap_or(Value::Null))
        }
    }

    fn harness() -> (MessageBus<InMemoryKvStore>, Receiver<MessageDeliveredCallback>, StorageGateway<InMemoryKvStore>) {
        let gateway = StorageGateway::new(Arc::new(InMemoryKvStore::new()));
        let incidents: Arc<dyn IncidentSink> = Arc::new(IncidentStore::new(gateway.clone()));
        let evaluator: Arc<dyn ExpressionEvaluator> = Arc::new(EchoEvaluator);
        let (bus, rx) = MessageBusConfig::default().build(gateway.clone(), incidents, evaluator);
        (bus, rx, gateway)
    }

    #[test]
    fn publish_with_no_subscription_buffers_under_ttl() {
        let (bus, _rx, gateway) = harness();
        let now = Utc::now();
        let result = bus
            .publish(
                NewMessage {
                    name: "order_created".to_string(),
                    correlation_key: "ORD-1".to_string(),
                    variables: VariableMap::new(),
                    ttl: None,
                },
                now,
            )
            .unwrap();
        assert!(result.is_some());

        let buffered = gateway.list_buffered_by_name("order_created").unwrap();
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].expires_at, now + chrono::Duration::seconds(60));
    }

    #[test]
    fn subscribe_consumes_a_matching_buffered_message() {
        let (bus, rx, gateway) = harness();
        let now = Utc::now();

        bus.publish(
            NewMessage {
                name: "order_created".to_string(),
                correlation_key: "ORD-1".to_string(),
                variables: VariableMap::new(),
                ttl: None,
            },
            now,
        )
        .unwrap();

        let token = Token::new_at(bpmn_types::InstanceId::generate(), "catch-1", None, now);
        gateway.save_token(&token).unwrap();

        bus.subscribe(
            NewSubscription {
                process_definition_key: "p:v1".to_string(),
                element_id: "catch-1".to_string(),
                message_name: "order_created".to_string(),
                correlation_key: Some("ORD-1".to_string()),
                token_id: Some(token.token_id.clone()),
            },
            now,
        )
        .unwrap();

        let callback = rx.try_recv().expect("expected synchronous delivery");
        assert_eq!(callback.message_name, "order_created");

        // Buffered entry is gone (consumed, not just expired).
        assert!(gateway.list_buffered_by_name("order_created").unwrap().is_empty());
    }

    #[test]
    fn publish_delivers_directly_to_matching_active_subscription() {
        let (bus, rx, gateway) = harness();
        let now = Utc::now();
        let token = Token::new_at(bpmn_types::InstanceId::generate(), "catch-1", None, now);
        gateway.save_token(&token).unwrap();

        bus.subscribe(
            NewSubscription {
                process_definition_key: "p:v1".to_string(),
                element_id: "catch-1".to_string(),
                message_name: "order_created".to_string(),
                correlation_key: Some("ORD-1".to_string()),
                token_id: Some(token.token_id.clone()),
            },
            now,
        )
        .unwrap();

        bus.publish(
            NewMessage {
                name: "order_created".to_string(),
                correlation_key: "ORD-1".to_string(),
                variables: VariableMap::new(),
                ttl: None,
            },
            now,
        )
        .unwrap();

        let callback = rx.try_recv().expect("expected synchronous delivery");
        assert_eq!(callback.token_id, Some(token.token_id));

        // Immediate delivery never touches the buffered-message table.
        assert!(gateway.list_buffered_by_name("order_created").unwrap().is_empty());
    }

    #[test]
    fn non_matching_key_leaves_message_buffered() {
        let (bus, rx, gateway) = harness();
        let now = Utc::now();
        let token = Token::new_at(bpmn_types::InstanceId::generate(), "catch-1", None, now);
        gateway.save_token(&token).unwrap();

        bus.subscribe(
            NewSubscription {
                process_definition_key: "p:v1".to_string(),
                element_id: "catch-1".to_string(),
                message_name: "order_created".to_string(),
                correlation_key: Some("ORD-1".to_string()),
                token_id: Some(token.token_id),
            },
            now,
        )
        .unwrap();

        bus.publish(
            NewMessage {
                name: "order_created".to_string(),
                correlation_key: "ORD-2".to_string(),
                variables: VariableMap::new(),
                ttl: None,
            },
            now,
        )
        .unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(gateway.list_buffered_by_name("order_created").unwrap().len(), 1);
    }

    #[test]
    fn empty_template_matches_any_key() {
        let (bus, rx, gateway) = harness();
        let now = Utc::now();
        let token = Token::new_at(bpmn_types::InstanceId::generate(), "catch-1", None, now);
        gateway.save_token(&token).unwrap();

        bus.subscribe(
            NewSubscription {
                process_definition_key: "p:v1".to_string(),
                element_id: "catch-1".to_string(),
                message_name: "ping".to_string(),
                correlation_key: None,
                token_id: Some(token.token_id),
            },
            now,
        )
        .unwrap();

        bus.publish(
            NewMessage {
                name: "ping".to_string(),
                correlation_key: "anything".to_string(),
                variables: VariableMap::new(),
                ttl: None,
            },
            now,
        )
        .unwrap();

        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn evict_expired_removes_only_past_ttl_entries() {
        let (bus, _rx, gateway) = harness();
        let now = Utc::now();
        bus.publish(
            NewMessage {
                name: "order_created".to_string(),
                correlation_key: "ORD-1".to_string(),
                variables: VariableMap::new(),
                ttl: Some(chrono::Duration::seconds(1)),
            },
            now,
        )
        .unwrap();

        bus.inner.evict_expired(now + chrono::Duration::milliseconds(500));
        assert_eq!(gateway.list_buffered_by_name("order_created").unwrap().len(), 1);

        bus.inner.evict_expired(now + chrono::Duration::seconds(2));
        assert!(gateway.list_buffered_by_name("order_created").unwrap().is_empty());
    }

    #[test]
    fn subscription_delivers_at_most_once() {
        let (bus, rx, gateway) = harness();
        let now = Utc::now();
        let token = Token::new_at(bpmn_types::InstanceId::generate(), "catch-1", None, now);
        gateway.save_token(&token).unwrap();

        bus.subscribe(
            NewSubscription {
                process_definition_key: "p:v1".to_string(),
                element_id: "catch-1".to_string(),
                message_name: "order_created".to_string(),
                correlation_key: Some("ORD-1".to_string()),
                token_id: Some(token.token_id),
            },
            now,
        )
        .unwrap();

        bus.publish(
            NewMessage {
                name: "order_created".to_string(),
                correlation_key: "ORD-1".to_string(),
                variables: VariableMap::new(),
                ttl: None,
            },
            now,
        )
        .unwrap();
        rx.try_recv().unwrap();

        // A second publish with the same key finds the subscription
        // already inactive and buffers instead of delivering again.
        bus.publish(
            NewMessage {
                name: "order_created".to_string(),
                correlation_key: "ORD-1".to_string(),
                variables: VariableMap::new(),
                ttl: None,
            },
            now,
        )
        .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(gateway.list_buffered_by_name("order_created").unwrap().len(), 1);
    }
}
