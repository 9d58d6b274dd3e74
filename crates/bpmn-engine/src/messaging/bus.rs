//! Message Bus (C6): subscription correlation, publish/buffer/match, and
//! the buffered-message expiry sweep driven by the timing wheel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{
    BufferedMessage, MessageSubscription, ProcessInstance, RuntimeEvent, Token, TokenState,
    VariableMap,
};
use crate::store::{StoreTransaction, TokenStore};
use crate::timing::MessageSweeper;

/// Input to [`MessageBus::publish`] (§4.5 "Publish algorithm").
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub name: String,
    pub correlation_key: String,
    pub tenant_id: String,
    pub variables: VariableMap,
    pub ttl_seconds: Option<i64>,
}

/// What the caller (the execution engine) must do after a publish commits.
/// The bus never steps tokens or resolves process graphs itself — it hands
/// the ids back so C9 can enqueue them on the per-instance dispatch queue.
#[derive(Debug, Clone, Default)]
pub struct PublishOutcome {
    pub woken_tokens: Vec<Uuid>,
    pub started_instances: Vec<Uuid>,
    pub buffered: bool,
}

/// Outcome of registering a new intermediate subscription (a token reaching
/// a receive element). Mirrors the buffered-match flow in §4.5.
#[derive(Debug, Clone)]
pub enum SubscribeOutcome {
    /// A buffered message already satisfied the subscription; the token is
    /// woken immediately with message variables merged into its scope.
    MatchedImmediately { merged_variables: VariableMap },
    /// No buffered match; the subscription is now persisted and waiting.
    Pending { subscription_id: Uuid },
}

pub struct MessageBus {
    store: Arc<dyn TokenStore>,
}

impl MessageBus {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    /// §4.5 "Publish algorithm", steps 1-5, applied as a single commit so
    /// match, token-wake, subscription-delete, and buffered-message-delete
    /// are all atomic together.
    pub async fn publish(&self, req: PublishRequest) -> Result<PublishOutcome, EngineError> {
        let candidates = self
            .store
            .find_subscriptions(&req.tenant_id, &req.name)
            .await?
            .into_iter()
            .filter(|s| s.correlation_key == req.correlation_key)
            .collect::<Vec<_>>();

        let (starts, intermediates): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|s| s.is_start());

        let mut tx = StoreTransaction::new();
        let mut outcome = PublishOutcome::default();

        for sub in &intermediates {
            let Some(token_id) = sub.token_id else { continue };
            let Some(mut token) = self.store.load_token(token_id).await? else { continue };
            if token.state != TokenState::Waiting {
                continue;
            }
            for (k, v) in &req.variables {
                token.scope_variables.insert(k.clone(), v.clone());
            }
            token.state = TokenState::Active;
            token.waiting_for = None;
            token.updated_at = Utc::now();

            tx = tx
                .put_token(token.clone())
                .delete_subscription(sub.subscription_id)
                .append_event(
                    token.instance_id,
                    RuntimeEvent::MessageCorrelated { subscription_id: sub.subscription_id, message_id: None },
                );
            outcome.woken_tokens.push(token_id);
        }

        for sub in &starts {
            let instance = ProcessInstance::new(sub.process_key.clone(), sub.version, sub.tenant_id.clone(), req.variables.clone());
            let start_element_id = sub
                .start_element_id
                .clone()
                .ok_or_else(|| EngineError::Internal("start subscription missing start_element_id".into()))?;
            let token = Token::spawn(instance.instance_id, start_element_id, None);

            tx = tx
                .put_instance(instance.clone())
                .put_token(token)
                .append_event(
                    instance.instance_id,
                    RuntimeEvent::InstanceStarted {
                        instance_id: instance.instance_id,
                        process_key: instance.process_key.clone(),
                        version: instance.version,
                    },
                );
            outcome.started_instances.push(instance.instance_id);
        }

        let message_id = Uuid::now_v7();
        let matched = !outcome.woken_tokens.is_empty() || !outcome.started_instances.is_empty();
        if !matched {
            if let Some(ttl) = req.ttl_seconds.filter(|t| *t > 0) {
                let now = Utc::now();
                let buffered = BufferedMessage {
                    message_id,
                    name: req.name.clone(),
                    correlation_key: req.correlation_key.clone(),
                    tenant_id: req.tenant_id.clone(),
                    variables: req.variables.clone(),
                    published_at: now,
                    expires_at: Some(now + chrono::Duration::seconds(ttl)),
                    element_id: None,
                };
                tx = tx.put_buffered_message(buffered);
                outcome.buffered = true;
            }
        }

        tx = tx.append_event(
            Uuid::nil(),
            RuntimeEvent::MessagePublished { message_id, name: req.name, matched },
        );

        self.store.commit(tx).await?;
        Ok(outcome)
    }

    /// Register an intermediate subscription for `token`, checking the
    /// buffered table first (§4.5 "Buffered-match flow").
    pub async fn create_intermediate_subscription(
        &self,
        token: &Token,
        process_key: &str,
        version: u32,
        message_name: &str,
        correlation_key: &str,
        tenant_id: &str,
    ) -> Result<SubscribeOutcome, EngineError> {
        if let Some(buffered) = self
            .store
            .find_buffered_message(tenant_id, message_name, correlation_key)
            .await?
        {
            let mut merged = token.scope_variables.clone();
            for (k, v) in &buffered.variables {
                merged.insert(k.clone(), v.clone());
            }
            let tx = StoreTransaction::new()
                .delete_buffered_message(buffered.message_id)
                .append_event(
                    token.instance_id,
                    RuntimeEvent::MessageCorrelated { subscription_id: Uuid::nil(), message_id: Some(buffered.message_id) },
                );
            self.store.commit(tx).await?;
            return Ok(SubscribeOutcome::MatchedImmediately { merged_variables: merged });
        }

        let sub = MessageSubscription {
            subscription_id: Uuid::now_v7(),
            process_key: process_key.to_string(),
            version,
            start_element_id: None,
            message_name: message_name.to_string(),
            correlation_key: correlation_key.to_string(),
            token_id: Some(token.token_id),
            tenant_id: tenant_id.to_string(),
            active: true,
            created_at: Utc::now(),
        };
        let subscription_id = sub.subscription_id;
        self.store.commit(StoreTransaction::new().put_subscription(sub)).await?;
        Ok(SubscribeOutcome::Pending { subscription_id })
    }

    /// Register a message-start subscription at deployment time (§4.5).
    pub async fn register_start_subscription(
        &self,
        process_key: &str,
        version: u32,
        start_element_id: &str,
        message_name: &str,
        tenant_id: &str,
    ) -> Result<(), EngineError> {
        let sub = MessageSubscription {
            subscription_id: Uuid::now_v7(),
            process_key: process_key.to_string(),
            version,
            start_element_id: Some(start_element_id.to_string()),
            message_name: message_name.to_string(),
            correlation_key: String::new(),
            token_id: None,
            tenant_id: tenant_id.to_string(),
            active: true,
            created_at: Utc::now(),
        };
        self.store.commit(StoreTransaction::new().put_subscription(sub)).await?;
        Ok(())
    }

    /// Remove every expired buffered message, invoked periodically by the
    /// timing wheel's sweep hook.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let expired = self.store.list_expired_buffered_messages(now).await?;
        if expired.is_empty() {
            return Ok(0);
        }
        let mut tx = StoreTransaction::new();
        for msg in &expired {
            tx = tx.delete_buffered_message(msg.message_id);
        }
        self.store.commit(tx).await?;
        Ok(expired.len())
    }
}

#[async_trait::async_trait]
impl MessageSweeper for MessageBus {
    async fn sweep_expired(&self, now: DateTime<Utc>) {
        if let Err(err) = MessageBus::sweep_expired(self, now).await {
            tracing::warn!(error = %err, "buffered message sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn bus() -> (MessageBus, Arc<dyn TokenStore>) {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
        (MessageBus::new(store.clone()), store)
    }

    #[tokio::test]
    async fn publish_wakes_matching_intermediate_subscription() {
        let (bus, store) = bus();
        let instance = ProcessInstance::new("order".into(), 1, "t1".into(), BTreeMap::new());
        let mut token = Token::spawn(instance.instance_id, "receive1", None);
        token.state = TokenState::Waiting;
        store.save_instance(&instance).await.unwrap();
        store.commit(StoreTransaction::new().put_token(token.clone())).await.unwrap();

        let outcome = bus
            .create_intermediate_subscription(&token, "order", 1, "OrderPaid", "order-42", "t1")
            .await
            .unwrap();
        assert!(matches!(outcome, SubscribeOutcome::Pending { .. }));

        let result = bus
            .publish(PublishRequest {
                name: "OrderPaid".into(),
                correlation_key: "order-42".into(),
                tenant_id: "t1".into(),
                variables: BTreeMap::from([("paid".to_string(), serde_json::json!(true))]),
                ttl_seconds: None,
            })
            .await
            .unwrap();

        assert_eq!(result.woken_tokens, vec![token.token_id]);
        let woken = store.load_token(token.token_id).await.unwrap().unwrap();
        assert_eq!(woken.state, TokenState::Active);
        assert_eq!(woken.scope_variables.get("paid"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn publish_buffers_unmatched_message_with_positive_ttl() {
        let (bus, store) = bus();
        let outcome = bus
            .publish(PublishRequest {
                name: "Unseen".into(),
                correlation_key: "x".into(),
                tenant_id: "t1".into(),
                variables: BTreeMap::new(),
                ttl_seconds: Some(60),
            })
            .await
            .unwrap();
        assert!(outcome.buffered);
        assert!(store.find_buffered_message("t1", "Unseen", "x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn subscription_created_after_buffered_message_matches_immediately() {
        let (bus, store) = bus();
        bus.publish(PublishRequest {
            name: "Late".into(),
            correlation_key: "key-1".into(),
            tenant_id: "t1".into(),
            variables: BTreeMap::from([("x".to_string(), serde_json::json!(1))]),
            ttl_seconds: Some(3600),
        })
        .await
        .unwrap();

        let instance = ProcessInstance::new("p".into(), 1, "t1".into(), BTreeMap::new());
        let token = Token::spawn(instance.instance_id, "receive1", None);
        let outcome = bus
            .create_intermediate_subscription(&token, "p", 1, "Late", "key-1", "t1")
            .await
            .unwrap();

        match outcome {
            SubscribeOutcome::MatchedImmediately { merged_variables } => {
                assert_eq!(merged_variables.get("x"), Some(&serde_json::json!(1)));
            }
            SubscribeOutcome::Pending { .. } => panic!("expected immediate match"),
        }
        assert!(store.find_buffered_message("t1", "Late", "key-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_messages() {
        let (bus, store) = bus();
        let now = Utc::now();
        store
            .commit(StoreTransaction::new().put_buffered_message(BufferedMessage {
                message_id: Uuid::now_v7(),
                name: "Expired".into(),
                correlation_key: "a".into(),
                tenant_id: "t1".into(),
                variables: BTreeMap::new(),
                published_at: now - chrono::Duration::hours(2),
                expires_at: Some(now - chrono::Duration::hours(1)),
                element_id: None,
            }))
            .await
            .unwrap();

        let removed = bus.sweep_expired(now).await.unwrap();
        assert_eq!(removed, 1);
    }
}
