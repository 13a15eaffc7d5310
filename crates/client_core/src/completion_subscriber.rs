use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{domain::SystemStatus, protocol::StatusMessage};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    error::ShutdownError,
    transport::{MessageChannel, MessageHandler},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberState {
    Pending,
    Resolved,
    Rejected(ShutdownError),
}

impl SubscriberState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A non-terminal status seen while waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub status: String,
    pub previous_status: Option<String>,
    pub observed_at: DateTime<Utc>,
}

struct SubscriberInner {
    state: SubscriberState,
    completion: Option<oneshot::Sender<Result<(), ShutdownError>>>,
    channel: Option<Arc<dyn MessageChannel>>,
    channel_url: Option<String>,
    progress: Vec<ProgressRecord>,
    ignored_after_terminal: usize,
}

/// Turns the status stream of one operation into exactly one outcome.
///
/// `READY_TO_SHUTDOWN` resolves and `ERROR` rejects; anything else is progress.
/// Every terminal transition closes the bound channel before the outcome is
/// published, and later events are ignored.
pub struct CompletionSubscriber {
    operation: String,
    inner: Mutex<SubscriberInner>,
}

/// Awaitable side of a [`CompletionSubscriber`]. Consumed by waiting on it.
pub struct CompletionOutcome {
    rx: oneshot::Receiver<Result<(), ShutdownError>>,
}

impl CompletionOutcome {
    pub async fn wait(self) -> Result<(), ShutdownError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // The subscriber was dropped while still pending.
            Err(_) => Err(ShutdownError::Cancelled),
        }
    }
}

impl CompletionSubscriber {
    pub fn new(operation: impl Into<String>) -> (Arc<Self>, CompletionOutcome) {
        let (tx, rx) = oneshot::channel();
        let subscriber = Arc::new(Self {
            operation: operation.into(),
            inner: Mutex::new(SubscriberInner {
                state: SubscriberState::Pending,
                completion: Some(tx),
                channel: None,
                channel_url: None,
                progress: Vec::new(),
                ignored_after_terminal: 0,
            }),
        });
        (subscriber, CompletionOutcome { rx })
    }

    fn lock(&self) -> MutexGuard<'_, SubscriberInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Binds the channel to close on completion. A channel bound after the
    /// outcome is already settled is closed immediately.
    pub fn bind_channel(&self, channel: Arc<dyn MessageChannel>) {
        let late = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                Some(channel)
            } else {
                inner.channel_url = Some(channel.url().to_string());
                inner.channel = Some(channel);
                None
            }
        };
        if let Some(channel) = late {
            channel.close();
        }
    }

    pub fn state(&self) -> SubscriberState {
        self.lock().state.clone()
    }

    pub fn progress(&self) -> Vec<ProgressRecord> {
        self.lock().progress.clone()
    }

    pub fn ignored_after_terminal(&self) -> usize {
        self.lock().ignored_after_terminal
    }

    pub fn cancel(&self) -> bool {
        self.settle(Err(ShutdownError::Cancelled))
    }

    pub fn time_out(&self, limit: Duration) -> bool {
        self.settle(Err(ShutdownError::TimedOut(limit)))
    }

    /// Moves out of `Pending`. Returns false, changing nothing, when already terminal.
    fn settle(&self, outcome: Result<(), ShutdownError>) -> bool {
        let (completion, channel) = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                inner.ignored_after_terminal += 1;
                return false;
            }
            inner.state = match &outcome {
                Ok(()) => SubscriberState::Resolved,
                Err(err) => SubscriberState::Rejected(err.clone()),
            };
            (inner.completion.take(), inner.channel.take())
        };

        match &outcome {
            Ok(()) => info!(operation = %self.operation, "completion: resolved"),
            Err(err) => warn!(operation = %self.operation, %err, "completion: rejected"),
        }
        if let Some(channel) = channel {
            channel.close();
        }
        if let Some(completion) = completion {
            let _ = completion.send(outcome);
        }
        true
    }

    fn record_progress(&self, message: &StatusMessage) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            inner.ignored_after_terminal += 1;
            debug!(
                operation = %self.operation,
                status = %message.status,
                "completion: ignoring event after outcome"
            );
            return;
        }
        inner.progress.push(ProgressRecord {
            status: message.status.clone(),
            previous_status: message.previous_status.clone(),
            observed_at: Utc::now(),
        });
        info!(
            operation = %self.operation,
            status = %message.status,
            previous_status = message.previous_status.as_deref().unwrap_or("-"),
            "completion: progress"
        );
    }
}

/// Best-effort diagnostic for an `ERROR` publication. Never empty.
fn describe_remote_error(message: &StatusMessage) -> String {
    let described = serde_json::to_string(message).unwrap_or_else(|_| format!("{message:?}"));
    if described.trim().is_empty() {
        "remote system reported ERROR without details".to_string()
    } else {
        described
    }
}

impl MessageHandler for CompletionSubscriber {
    fn on_message(&self, message: StatusMessage) {
        match message.system_status() {
            SystemStatus::ReadyToShutdown => {
                self.settle(Ok(()));
            }
            SystemStatus::Error => {
                let description = describe_remote_error(&message);
                self.settle(Err(ShutdownError::RemoteReported(description)));
            }
            _ => self.record_progress(&message),
        }
    }

    fn on_disconnect(&self, reason: &str) {
        let url = self
            .lock()
            .channel_url
            .clone()
            .unwrap_or_else(|| "<unbound>".to_string());
        self.settle(Err(ShutdownError::connection(
            url,
            format!("{} channel closed before completion: {reason}", self.operation),
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingChannel {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl MessageChannel for CountingChannel {
        async fn subscribe(
            &self,
            _channel: &str,
            _handler: Arc<dyn MessageHandler>,
        ) -> Result<(), ShutdownError> {
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closes.load(Ordering::SeqCst) > 0
        }

        fn url(&self) -> &str {
            "ws://test/events"
        }
    }

    fn bound_subscriber() -> (Arc<CompletionSubscriber>, CompletionOutcome, Arc<CountingChannel>) {
        let (subscriber, outcome) = CompletionSubscriber::new("system-stop");
        let channel = Arc::new(CountingChannel::default());
        subscriber.bind_channel(channel.clone());
        (subscriber, outcome, channel)
    }

    fn message(params: serde_json::Value) -> StatusMessage {
        StatusMessage::from_parts(params, None)
    }

    #[tokio::test]
    async fn ready_to_shutdown_resolves_and_closes_channel() {
        let (subscriber, outcome, channel) = bound_subscriber();

        subscriber.on_message(message(serde_json::json!({ "status": "READY_TO_SHUTDOWN" })));

        assert_eq!(subscriber.state(), SubscriberState::Resolved);
        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        outcome.wait().await.expect("resolved");
    }

    #[tokio::test]
    async fn error_rejects_with_serialized_details() {
        let (subscriber, outcome, channel) = bound_subscriber();

        subscriber.on_message(message(
            serde_json::json!({ "status": "ERROR", "detail": "disk full" }),
        ));

        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        match outcome.wait().await {
            Err(ShutdownError::RemoteReported(description)) => {
                assert!(description.contains("disk full"), "{description}")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn progress_events_keep_waiting() {
        let (subscriber, _outcome, channel) = bound_subscriber();

        subscriber.on_message(message(
            serde_json::json!({ "status": "STOPPING", "prevStatus": "RUNNING" }),
        ));
        subscriber.on_message(message(serde_json::json!({ "status": "PREPARING" })));

        assert_eq!(subscriber.state(), SubscriberState::Pending);
        assert_eq!(channel.closes.load(Ordering::SeqCst), 0);
        let progress = subscriber.progress();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].status, "STOPPING");
        assert_eq!(progress[0].previous_status.as_deref(), Some("RUNNING"));
    }

    #[tokio::test]
    async fn terminal_state_absorbs_later_events() {
        let (subscriber, outcome, channel) = bound_subscriber();

        subscriber.on_message(message(serde_json::json!({ "status": "READY_TO_SHUTDOWN" })));
        subscriber.on_message(message(serde_json::json!({ "status": "ERROR" })));
        subscriber.on_message(message(serde_json::json!({ "status": "STOPPING" })));
        subscriber.on_disconnect("late");
        assert!(!subscriber.cancel());

        assert_eq!(subscriber.state(), SubscriberState::Resolved);
        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        assert_eq!(subscriber.ignored_after_terminal(), 4);
        assert!(subscriber.progress().is_empty());
        outcome.wait().await.expect("first outcome wins");
    }

    #[tokio::test]
    async fn malformed_error_still_has_diagnostic() {
        let (subscriber, outcome, _channel) = bound_subscriber();

        let mut malformed = message(serde_json::json!(null));
        malformed.status = "ERROR".to_string();
        subscriber.on_message(malformed);

        match outcome.wait().await {
            Err(ShutdownError::RemoteReported(description)) => {
                assert!(!description.trim().is_empty())
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_rejects_with_connection_error() {
        let (subscriber, outcome, channel) = bound_subscriber();

        subscriber.on_disconnect("closed by server");

        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        match outcome.wait().await {
            Err(ShutdownError::Connection { url, message }) => {
                assert_eq!(url, "ws://test/events");
                assert!(message.contains("closed by server"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_and_timeout_reject() {
        let (subscriber, outcome, channel) = bound_subscriber();
        assert!(subscriber.cancel());
        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.wait().await, Err(ShutdownError::Cancelled));

        let (subscriber, outcome, _channel) = bound_subscriber();
        assert!(subscriber.time_out(Duration::from_secs(3)));
        assert_eq!(
            outcome.wait().await,
            Err(ShutdownError::TimedOut(Duration::from_secs(3)))
        );
    }

    #[tokio::test]
    async fn channel_bound_after_outcome_is_closed_immediately() {
        let (subscriber, outcome) = CompletionSubscriber::new("system-stop");
        subscriber.on_message(message(serde_json::json!({ "status": "READY_TO_SHUTDOWN" })));

        let channel = Arc::new(CountingChannel::default());
        subscriber.bind_channel(channel.clone());

        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        outcome.wait().await.expect("resolved");
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_hang_waiter() {
        let (subscriber, outcome) = CompletionSubscriber::new("system-stop");
        drop(subscriber);
        assert_eq!(outcome.wait().await, Err(ShutdownError::Cancelled));
    }
}
