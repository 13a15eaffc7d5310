use std::sync::Arc;

use shared::domain::{SystemState, SystemStatus};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod auth;
pub mod completion_subscriber;
pub mod config;
pub mod error;
pub mod protocol_client;
pub mod transport;

pub use auth::{Credential, CredentialSource, PasswordLogin, StaticCredential};
pub use completion_subscriber::{
    CompletionOutcome, CompletionSubscriber, ProgressRecord, SubscriberState,
};
pub use config::{load_settings, Settings};
pub use error::ShutdownError;
pub use protocol_client::{RemoteStateClient, SystemApi};
pub use transport::{ChannelConnector, MessageChannel, MessageHandler, WebSocketConnector};

const STOP_OPERATION: &str = "system-stop";

/// Where to listen for status changes, resolved from a state snapshot's links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventChannelTarget {
    pub url: String,
    pub channel: String,
}

impl EventChannelTarget {
    pub fn resolve(state: &SystemState, relation: &str) -> Result<Self, ShutdownError> {
        let link = state.link(relation).ok_or_else(|| {
            ShutdownError::Configuration(format!("system state has no `{relation}` link"))
        })?;
        if link.href.trim().is_empty() {
            return Err(ShutdownError::Configuration(format!(
                "`{relation}` link has an empty href"
            )));
        }
        let channel = link.channel_name().ok_or_else(|| {
            ShutdownError::Configuration(format!(
                "`{relation}` link carries no channel name parameter"
            ))
        })?;
        Ok(Self {
            url: link.href.clone(),
            channel: channel.to_string(),
        })
    }
}

/// Drives one graceful stop of the remote system. Nothing is shared between
/// calls: each call owns its own subscriber and channel.
pub struct SystemCoordinator {
    api: Arc<dyn SystemApi>,
    connector: Arc<dyn ChannelConnector>,
    credential: Credential,
    settings: Settings,
}

impl SystemCoordinator {
    pub fn new(server_url: impl Into<String>, credential: Credential, settings: Settings) -> Self {
        let api = RemoteStateClient::new(server_url, credential.clone())
            .with_request_timeout(settings.request_timeout);
        Self::new_with_dependencies(
            Arc::new(api),
            Arc::new(WebSocketConnector),
            credential,
            settings,
        )
    }

    pub fn new_with_dependencies(
        api: Arc<dyn SystemApi>,
        connector: Arc<dyn ChannelConnector>,
        credential: Credential,
        settings: Settings,
    ) -> Self {
        Self {
            api,
            connector,
            credential,
            settings,
        }
    }

    pub async fn status(&self) -> Result<SystemState, ShutdownError> {
        self.api.get_state().await
    }

    pub async fn graceful_stop(&self) -> Result<SystemState, ShutdownError> {
        self.graceful_stop_with_cancel(CancellationToken::new()).await
    }

    /// Stops the system and waits for it to report `READY_TO_SHUTDOWN`.
    ///
    /// Only a `RUNNING` system gets a stop command; any other non-ready status
    /// means a stop is already under way and is only observed. Firing `cancel`
    /// closes the event channel and fails the call with
    /// [`ShutdownError::Cancelled`]. The channel is closed on every exit path.
    pub async fn graceful_stop_with_cancel(
        &self,
        cancel: CancellationToken,
    ) -> Result<SystemState, ShutdownError> {
        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ShutdownError::Cancelled),
            state = self.api.get_state() => state?,
        };
        if state.status == SystemStatus::ReadyToShutdown {
            info!("system: already ready to shut down");
            return Ok(state);
        }

        let call_stop = state.status == SystemStatus::Running;
        let target = EventChannelTarget::resolve(&state, &self.settings.channel_relation)?;
        info!(
            status = %state.status,
            call_stop,
            channel = %target.channel,
            "system: starting graceful stop"
        );

        let channel = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ShutdownError::Cancelled),
            channel = self.connector.connect(&target.url, &self.credential) => channel?,
        };
        let (subscriber, outcome) = CompletionSubscriber::new(STOP_OPERATION);
        subscriber.bind_channel(Arc::clone(&channel));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                subscriber.cancel();
                Err(ShutdownError::Cancelled)
            }
            result = self.stop_and_wait(channel.as_ref(), &subscriber, outcome, &target, call_stop) => result,
        };
        if !channel.is_closed() {
            channel.close();
        }
        result?;

        let final_state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ShutdownError::Cancelled),
            state = self.api.get_state() => state?,
        };
        info!(status = %final_state.status, "system: graceful stop finished");
        Ok(final_state)
    }

    async fn stop_and_wait(
        &self,
        channel: &dyn MessageChannel,
        subscriber: &Arc<CompletionSubscriber>,
        outcome: CompletionOutcome,
        target: &EventChannelTarget,
        call_stop: bool,
    ) -> Result<(), ShutdownError> {
        let handler: Arc<dyn MessageHandler> = subscriber.clone();
        channel.subscribe(&target.channel, handler).await?;

        let wait = outcome.wait();
        tokio::pin!(wait);
        // The channel never acknowledges a subscription. Give the server time to
        // register it before triggering the event we are waiting for.
        let settle = tokio::time::sleep(self.settings.settle_delay);
        tokio::pin!(settle);

        // A rejection during the delay ends the call before any stop command.
        let resolved_early = tokio::select! {
            biased;
            result = &mut wait => {
                result?;
                settle.await;
                true
            }
            _ = &mut settle => false,
        };

        if call_stop {
            self.api.request_stop().await?;
        } else {
            info!("system: stop already in progress, observing");
        }
        if resolved_early {
            return Ok(());
        }

        match self.settings.completion_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut wait).await {
                Ok(result) => result,
                Err(_) => {
                    subscriber.time_out(limit);
                    Err(ShutdownError::TimedOut(limit))
                }
            },
            None => wait.await,
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
