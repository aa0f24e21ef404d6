//! Structured event stream for operational monitoring
//!
//! Every state transition the orchestrator makes (credential switches, model
//! fallbacks, parameter adjustments, completed or failed generations) is
//! published as a typed [`Event`] on a broadcast channel. Transport of these
//! events is the subscriber's concern; the orchestrator only guarantees the
//! names and payloads.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Why a credential switch happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchReason {
    /// Automatic failover after a classified credential failure.
    Fallback,
    /// Operator-requested switch.
    Manual,
}

/// Events emitted by the orchestrator.
///
/// Serialized with camelCase event tags (`apiKeySwitched`, `modelFallback`,
/// ...) so external log/monitoring pipelines see stable names.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    Initialized {
        model: String,
        credential: String,
        total_credentials: usize,
    },
    ApiKeySwitched {
        from: String,
        to: String,
        reason: SwitchReason,
    },
    ApiKeyAdded {
        name: String,
        daily_limit: u32,
        total_credentials: usize,
    },
    ApiKeyRemoved {
        name: String,
        total_credentials: usize,
    },
    ApiKeyStatusReset {
        name: String,
        previous_status: String,
    },
    ModelFallback {
        from: String,
        to: String,
    },
    ModelUpgraded {
        from: String,
        to: String,
    },
    ModelMigrated {
        from: String,
        to: String,
    },
    ParametersAdjusted {
        temperature: f64,
        max_output_tokens: u32,
    },
    ContentGenerated {
        model: String,
        credential: String,
        chars: usize,
        attempt: u32,
    },
    GenerationError {
        model: String,
        attempt: u32,
        error: String,
    },
    GenerationFailed {
        model: String,
        retries: u32,
        last_error: String,
    },
    RequestCountReset,
    RequestLimitUpdated {
        limit: u64,
    },
}

/// Broadcast fan-out for [`Event`]s.
///
/// Publishing is best-effort: with no live subscribers the event is dropped,
/// and a slow subscriber that overflows its buffer loses the oldest events
/// rather than back-pressuring the orchestrator.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // Err means no receivers are currently subscribed.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::default();
        bus.publish(Event::RequestCountReset);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut stream = bus.subscribe();

        bus.publish(Event::ModelFallback {
            from: "alpha".into(),
            to: "beta".into(),
        });

        match stream.next().await {
            Some(Ok(Event::ModelFallback { from, to })) => {
                assert_eq!(from, "alpha");
                assert_eq!(to, "beta");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_camel_case_tags() {
        let json = serde_json::to_value(Event::ApiKeySwitched {
            from: "primary".into(),
            to: "backup".into(),
            reason: SwitchReason::Fallback,
        })
        .unwrap();
        assert_eq!(json["event"], "apiKeySwitched");
        assert_eq!(json["reason"], "fallback");

        let json = serde_json::to_value(Event::ParametersAdjusted {
            temperature: 0.2,
            max_output_tokens: 2048,
        })
        .unwrap();
        assert_eq!(json["event"], "parametersAdjusted");
    }
}
