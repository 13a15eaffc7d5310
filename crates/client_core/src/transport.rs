use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ChannelFrame, ChannelRequest, StatusMessage};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{auth::Credential, error::ShutdownError};

pub const TOKEN_QUERY_PARAM: &str = "token";

/// Receives messages published on one subscribed channel. Called from the
/// channel's reader task, so implementations must not block.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: StatusMessage);

    /// The connection went away without a local `close()`.
    fn on_disconnect(&self, _reason: &str) {}
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Registers `handler` and sends the subscribe request. Returning only
    /// means the request was sent; the server may not be publishing yet.
    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ShutdownError>;

    /// Idempotent. Safe to call from inside a handler.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Where the channel is connected, without the credential.
    fn url(&self) -> &str;
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(
        &self,
        channel_url: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn MessageChannel>, ShutdownError>;
}

/// Appends the credential as the `token` query parameter, keeping existing
/// query pairs. `http(s)` links are mapped onto `ws(s)`.
pub fn channel_url_with_token(
    channel_url: &str,
    credential: &Credential,
) -> Result<Url, ShutdownError> {
    let mut url = Url::parse(channel_url).map_err(|err| {
        ShutdownError::Configuration(format!("invalid event channel url {channel_url}: {err}"))
    })?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(ShutdownError::Configuration(format!(
                "event channel url must use ws:// or wss://, got {other}://"
            )))
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(ShutdownError::Configuration(format!(
            "cannot use {scheme}:// for event channel url {channel_url}"
        )));
    }
    url.query_pairs_mut()
        .append_pair(TOKEN_QUERY_PARAM, credential.expose());
    Ok(url)
}

/// The url without its query string, safe to log.
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

pub struct WebSocketConnector;

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(
        &self,
        channel_url: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn MessageChannel>, ShutdownError> {
        let url = channel_url_with_token(channel_url, credential)?;
        let display_url = redacted(&url);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ShutdownError::connection(&display_url, err))?;
        info!(url = %display_url, "channel: connected");
        Ok(Arc::new(WebSocketChannel::spawn(display_url, ws_stream)))
    }
}

struct ChannelShared {
    url: String,
    closed: AtomicBool,
    handlers: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl ChannelShared {
    fn handler(&self, channel: &str) -> Option<Arc<dyn MessageHandler>> {
        let guard = match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get(channel).cloned()
    }

    fn register(&self, channel: &str, handler: Arc<dyn MessageHandler>) {
        let mut guard = match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(channel.to_string(), handler);
    }

    fn all_handlers(&self) -> Vec<Arc<dyn MessageHandler>> {
        let guard = match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.values().cloned().collect()
    }

    fn clear(&self) {
        let mut guard = match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clear();
    }

    fn dispatch(&self, text: &str) {
        let frame = match serde_json::from_str::<ChannelFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(url = %self.url, %err, "channel: dropping unparseable frame");
                return;
            }
        };
        let Some(channel) = frame.channel_name().map(str::to_string) else {
            debug!(url = %self.url, "channel: dropping frame without channel");
            return;
        };
        match self.handler(&channel) {
            Some(handler) => handler.on_message(frame.into_status_message()),
            None => debug!(url = %self.url, %channel, "channel: no handler for frame"),
        }
    }
}

pub struct WebSocketChannel {
    shared: Arc<ChannelShared>,
    outbound: mpsc::UnboundedSender<Message>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketChannel {
    fn spawn(url: String, ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let shared = Arc::new(ChannelShared {
            url,
            closed: AtomicBool::new(false),
            handlers: Mutex::new(HashMap::new()),
        });

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        reader_shared.dispatch(&text);
                        if reader_shared.closed.load(Ordering::SeqCst) {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!(
                                "closed by server: {} {}",
                                u16::from(frame.code),
                                frame.reason
                            ),
                            None => "closed by server".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break format!("receive failed: {err}"),
                    None => break "connection ended".to_string(),
                }
            };
            if reader_shared.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            warn!(url = %reader_shared.url, %reason, "channel: disconnected");
            for handler in reader_shared.all_handlers() {
                handler.on_disconnect(&reason);
            }
            reader_shared.clear();
        });

        Self {
            shared,
            outbound,
            reader: Mutex::new(Some(reader)),
        }
    }
}

#[async_trait]
impl MessageChannel for WebSocketChannel {
    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ShutdownError> {
        if self.is_closed() {
            return Err(ShutdownError::connection(&self.shared.url, "channel is closed"));
        }
        // Register first so nothing published right after the request is lost.
        self.shared.register(channel, handler);
        let text = serde_json::to_string(&ChannelRequest::subscribe(channel))
            .map_err(|err| ShutdownError::connection(&self.shared.url, err))?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| ShutdownError::connection(&self.shared.url, "writer has stopped"))?;
        info!(url = %self.shared.url, %channel, "channel: subscribe request sent");
        Ok(())
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(Message::Close(None));
        let reader = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        self.shared.clear();
        info!(url = %self.shared.url, "channel: closed");
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn url(&self) -> &str {
        &self.shared.url
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
