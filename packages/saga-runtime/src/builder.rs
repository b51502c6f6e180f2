//! Effect builder: pure factory for effect descriptions.
//!
//! Every description it produces carries the builder's transaction id.
//! Building an effect has no side effects; nothing happens until the
//! description is performed.

use std::time::Duration;

use serde_json::Value;

use crate::action::{Action, TransactionId};
use crate::buffer::{ActionChannelBuffer, SharedBuffer};
use crate::effect::{
    ActionChannel, Callable, CombinatorKind, CompensationConfig, CompensationPlan,
    EffectDescription, EffectSet, TopicPattern,
};
use crate::router::ActionObserver;

/// Factory for [`EffectDescription`]s bound to one transaction.
#[derive(Debug, Clone)]
pub struct EffectBuilder {
    transaction_id: TransactionId,
}

impl EffectBuilder {
    pub fn new(transaction_id: TransactionId) -> Self {
        Self { transaction_id }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Publish `payload` on `topic`.
    pub fn put(&self, topic: impl Into<String>, payload: Value) -> EffectDescription {
        EffectDescription::Put {
            transaction_id: self.transaction_id.clone(),
            pattern: topic.into(),
            payload,
        }
    }

    /// Wait for the next action on any of the topics, using a fresh
    /// [`ActionChannelBuffer`].
    pub fn take(&self, pattern: impl Into<TopicPattern>) -> EffectDescription {
        self.take_with_buffer(pattern, ActionChannelBuffer::shared())
    }

    pub fn take_with_buffer(
        &self,
        pattern: impl Into<TopicPattern>,
        buffer: SharedBuffer,
    ) -> EffectDescription {
        let patterns = pattern.into();
        EffectDescription::Take {
            transaction_id: self.transaction_id.clone(),
            topics: patterns.topics(),
            observer: ActionObserver::into_buffer(buffer.clone()),
            patterns,
            buffer,
        }
    }

    pub fn call(&self, effect: Callable, args: Vec<Value>) -> EffectDescription {
        EffectDescription::Call {
            transaction_id: self.transaction_id.clone(),
            effect,
            args,
        }
    }

    pub fn delay(&self, duration: Duration) -> EffectDescription {
        EffectDescription::Delay {
            transaction_id: self.transaction_id.clone(),
            duration,
            payload: None,
        }
    }

    /// Delay that resolves with `payload`. Handy as the timeout arm of a race.
    pub fn delay_with(&self, duration: Duration, payload: Value) -> EffectDescription {
        EffectDescription::Delay {
            transaction_id: self.transaction_id.clone(),
            duration,
            payload: Some(payload),
        }
    }

    /// Open a channel that can be taken from repeatedly.
    pub fn action_channel(&self, pattern: impl Into<TopicPattern>) -> EffectDescription {
        self.action_channel_with_buffer(pattern, ActionChannelBuffer::shared())
    }

    pub fn action_channel_with_buffer(
        &self,
        pattern: impl Into<TopicPattern>,
        buffer: SharedBuffer,
    ) -> EffectDescription {
        let observer = ActionObserver::into_buffer(buffer.clone());
        self.channel_effect(pattern.into(), buffer, observer)
    }

    /// Open a channel that only buffers actions matching `predicate`.
    pub fn action_channel_filtered<P>(
        &self,
        pattern: impl Into<TopicPattern>,
        predicate: P,
    ) -> EffectDescription
    where
        P: Fn(&Action) -> bool + Send + Sync + 'static,
    {
        let buffer = ActionChannelBuffer::shared();
        let observer = ActionObserver::into_buffer_filtered(buffer.clone(), predicate);
        self.channel_effect(pattern.into(), buffer, observer)
    }

    fn channel_effect(
        &self,
        pattern: TopicPattern,
        buffer: SharedBuffer,
        observer: ActionObserver,
    ) -> EffectDescription {
        EffectDescription::ActionChannel {
            transaction_id: self.transaction_id.clone(),
            topics: pattern.topics(),
            pattern,
            buffer,
            observer,
        }
    }

    pub fn take_action_channel(&self, channel: &ActionChannel) -> EffectDescription {
        EffectDescription::TakeActionChannel {
            transaction_id: self.transaction_id.clone(),
            buffer: channel.buffer().clone(),
            topics: channel.topics().to_vec(),
        }
    }

    pub fn race(&self, effects: impl Into<EffectSet>) -> EffectDescription {
        self.combinator(effects.into(), CombinatorKind::Race)
    }

    pub fn all(&self, effects: impl Into<EffectSet>) -> EffectDescription {
        self.combinator(effects.into(), CombinatorKind::All)
    }

    fn combinator(&self, effects: EffectSet, combinator: CombinatorKind) -> EffectDescription {
        EffectDescription::Combinator {
            transaction_id: self.transaction_id.clone(),
            effects,
            combinator,
        }
    }

    pub fn add_compensation(&self, plan: CompensationPlan) -> EffectDescription {
        EffectDescription::AddCompensation {
            transaction_id: self.transaction_id.clone(),
            plan,
        }
    }

    pub fn run_compensation(&self, config: CompensationConfig) -> EffectDescription {
        EffectDescription::RunCompensation {
            transaction_id: self.transaction_id.clone(),
            config,
        }
    }

    pub fn clear_compensation(&self) -> EffectDescription {
        EffectDescription::ClearCompensation {
            transaction_id: self.transaction_id.clone(),
        }
    }

    pub fn view_compensation_chain(&self) -> EffectDescription {
        EffectDescription::ViewCompensationChain {
            transaction_id: self.transaction_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::effect::EffectKind;
    use serde_json::json;

    fn builder() -> EffectBuilder {
        EffectBuilder::new(TransactionId::from("tx-42"))
    }

    #[test]
    fn test_every_effect_carries_transaction_id() {
        let b = builder();
        let channel = ActionChannel::new(vec!["t".into()], ActionChannelBuffer::shared());
        let effects = vec![
            b.put("t", json!(1)),
            b.take("t"),
            b.call(Callable::new("noop", |_| crate::effect::Invocation::value(json!(null))), vec![]),
            b.delay(Duration::from_millis(1)),
            b.action_channel("t"),
            b.take_action_channel(&channel),
            b.race(vec![b.delay(Duration::from_millis(1))]),
            b.all(Vec::<EffectDescription>::new()),
            b.add_compensation(CompensationPlan::remote("undo", json!(1))),
            b.run_compensation(CompensationConfig::default()),
            b.clear_compensation(),
            b.view_compensation_chain(),
        ];

        for effect in &effects {
            assert_eq!(effect.transaction_id().as_str(), "tx-42");
        }
        assert_eq!(effects[0].kind(), EffectKind::Put);
        assert_eq!(effects[11].kind(), EffectKind::ViewCompensationChain);
    }

    #[tokio::test]
    async fn test_take_bridges_observer_into_its_buffer() {
        let effect = builder().take(["a", "b"]);
        let EffectDescription::Take {
            topics,
            buffer,
            observer,
            ..
        } = effect
        else {
            panic!("expected a take effect");
        };

        assert_eq!(topics, vec!["a".to_string(), "b".to_string()]);
        assert!(buffer.is_empty());
        observer.notify(Action::new("b", TransactionId::from("tx-42"), json!("hi")));
        assert_eq!(buffer.take().await.unwrap().payload(), &json!("hi"));
    }

    #[tokio::test]
    async fn test_filtered_channel_only_buffers_matches() {
        let effect = builder().action_channel_filtered("orders", |action: &Action| {
            action.payload()["priority"] == json!("high")
        });
        let EffectDescription::ActionChannel {
            buffer, observer, ..
        } = effect
        else {
            panic!("expected an action channel effect");
        };

        let tx = TransactionId::from("tx-42");
        observer.notify(Action::new("orders", tx.clone(), json!({"priority": "low"})));
        assert!(buffer.is_empty());
        observer.notify(Action::new("orders", tx, json!({"priority": "high"})));
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_delay_with_payload() {
        match builder().delay_with(Duration::from_secs(2), json!("timeout")) {
            EffectDescription::Delay {
                duration, payload, ..
            } => {
                assert_eq!(duration, Duration::from_secs(2));
                assert_eq!(payload, Some(json!("timeout")));
            }
            other => panic!("unexpected effect {:?}", other.kind()),
        }
    }
}
