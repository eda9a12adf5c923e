//! Kite Ticker WebSocket Client
//!
//! [`StreamTransport`] adapter for the Zerodha Kite ticker.
//!
//! # Stream URL
//!
//! `wss://ws.kite.trade?api_key=...&access_token=...`
//!
//! # Protocol
//!
//! - Requests are JSON text frames: `{"a":"subscribe","v":[tokens]}` followed
//!   by `{"a":"mode","v":["quote",[tokens]]}`
//! - Market data arrives as binary frames (see [`super::codec`])
//! - The server sends a 1-byte heartbeat every second. A read gap longer than
//!   the idle timeout is treated as a dropped connection

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, ControlMessage, KiteCodec, TickMode};
use crate::application::ports::{Credentials, StreamTransport, TransportError, TransportEvent};
use crate::domain::market::Instrument;
use crate::infrastructure::metrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production ticker endpoint.
pub const KITE_TICKER_URL: &str = "wss://ws.kite.trade";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Kite ticker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KiteTickerConfig {
    /// WebSocket base URL, without credentials.
    pub url: String,
    /// Detail level requested on subscribe.
    pub mode: TickMode,
    /// Read gap after which the connection counts as dropped.
    pub idle_timeout: Duration,
    /// Handshake timeout.
    pub connect_timeout: Duration,
}

impl Default for KiteTickerConfig {
    fn default() -> Self {
        Self {
            url: KITE_TICKER_URL.to_string(),
            mode: TickMode::Quote,
            idle_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

struct Session {
    writer: SplitSink<WsStream, Message>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

/// Kite ticker client.
pub struct KiteTicker {
    config: KiteTickerConfig,
    codec: KiteCodec,
    session: Mutex<Option<Session>>,
}

impl KiteTicker {
    /// Create a client. Nothing connects until [`StreamTransport::connect`].
    #[must_use]
    pub fn new(config: KiteTickerConfig) -> Self {
        Self {
            config,
            codec: KiteCodec::new(),
            session: Mutex::new(None),
        }
    }

    fn session_url(&self, credentials: &Credentials) -> Result<String, TransportError> {
        reqwest::Url::parse_with_params(
            &self.config.url,
            &[
                ("api_key", credentials.api_key()),
                ("access_token", credentials.access_token()),
            ],
        )
        .map(String::from)
        .map_err(|e| TransportError::ConnectionFailed(format!("invalid ticker URL: {e}")))
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(TransportError::NotConnected)?;
        session
            .writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}

/// Numeric tokens for the instruments that have one.
fn tokens(instruments: &[Instrument]) -> Vec<u32> {
    instruments
        .iter()
        .filter_map(|instrument| {
            let token = instrument.token();
            if token.is_none() {
                tracing::warn!(%instrument, "Kite subscribes by numeric token only, skipping");
            }
            token
        })
        .collect()
}

#[async_trait]
impl StreamTransport for KiteTicker {
    async fn connect(
        &self,
        credentials: &Credentials,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        self.disconnect().await;

        let url = self.session_url(credentials)?;
        tracing::info!(url = %self.config.url, "Connecting to Kite ticker");

        let (ws_stream, _response) =
            tokio::time::timeout(self.config.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| TransportError::ConnectionFailed("handshake timed out".to_string()))?
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (writer, reader) = ws_stream.split();

        events
            .send(TransportEvent::Connected)
            .await
            .map_err(|_| TransportError::Closed)?;

        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            reader,
            events,
            cancel.clone(),
            self.config.idle_timeout,
            self.codec.clone(),
        ));

        *self.session.lock().await = Some(Session {
            writer,
            cancel,
            reader,
        });

        Ok(())
    }

    async fn subscribe(&self, instruments: &[Instrument]) -> Result<(), TransportError> {
        let tokens = tokens(instruments);
        if tokens.is_empty() {
            return Ok(());
        }

        let subscribe = self.codec.subscribe(&tokens).map_err(codec_error)?;
        let mode = self
            .codec
            .mode(self.config.mode, &tokens)
            .map_err(codec_error)?;

        tracing::debug!(?tokens, mode = self.config.mode.as_str(), "Sending subscribe request");
        self.send_text(subscribe).await?;
        self.send_text(mode).await
    }

    async fn unsubscribe(&self, instruments: &[Instrument]) -> Result<(), TransportError> {
        let tokens = tokens(instruments);
        if tokens.is_empty() {
            return Ok(());
        }

        let request = self.codec.unsubscribe(&tokens).map_err(codec_error)?;
        tracing::debug!(?tokens, "Sending unsubscribe request");
        self.send_text(request).await
    }

    async fn disconnect(&self) {
        let Some(mut session) = self.session.lock().await.take() else {
            return;
        };

        session.cancel.cancel();
        if let Err(e) = session.writer.close().await {
            tracing::debug!(error = %e, "Close handshake failed");
        }
        if let Err(e) = session.reader.await {
            tracing::debug!(error = %e, "Reader task ended abnormally");
        }
        tracing::info!("Kite ticker disconnected");
    }
}

fn codec_error(e: CodecError) -> TransportError {
    TransportError::Codec(e.to_string())
}

// =============================================================================
// Reader
// =============================================================================

/// Read frames until the session ends, reporting exactly one terminal event
/// unless cancelled.
async fn read_loop(
    mut reader: SplitStream<WsStream>,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    idle_timeout: Duration,
    codec: KiteCodec,
) {
    let terminal = loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return,
            next = tokio::time::timeout(idle_timeout, reader.next()) => next,
        };

        let message = match next {
            Err(_) => {
                tracing::warn!(timeout_ms = idle_timeout.as_millis(), "Kite ticker idle");
                break TransportEvent::Disconnected {
                    reason: format!("no data for {}s", idle_timeout.as_secs()),
                };
            }
            Ok(None) => {
                break TransportEvent::Disconnected {
                    reason: "stream ended".to_string(),
                };
            }
            Ok(Some(Err(e))) => {
                break TransportEvent::Disconnected {
                    reason: e.to_string(),
                };
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Binary(data) => match codec.decode_binary(&data, Utc::now()) {
                Ok(ticks) if ticks.is_empty() => {}
                Ok(ticks) => {
                    if !deliver(&events, &cancel, TransportEvent::Ticks(ticks)).await {
                        return;
                    }
                }
                Err(e) => {
                    metrics::record_frame_error(e.kind());
                    tracing::warn!(error = %e, "Dropping undecodable frame");
                }
            },
            Message::Text(text) => match codec.decode_text(&text) {
                Ok(ControlMessage::Error(message)) => {
                    tracing::error!(%message, "Kite ticker error");
                    break TransportEvent::Error(message);
                }
                Ok(ControlMessage::Message(message)) => {
                    tracing::info!(%message, "Kite ticker message");
                }
                Ok(ControlMessage::Order(order)) => {
                    tracing::debug!(%order, "Order postback");
                }
                Ok(ControlMessage::Other { kind, .. }) => {
                    tracing::trace!(%kind, "Ignoring control message");
                }
                Err(e) => {
                    metrics::record_frame_error(e.kind());
                    tracing::warn!(error = %e, "Dropping undecodable text frame");
                }
            },
            Message::Close(frame) => {
                let reason = frame.map_or_else(
                    || "server closed the connection".to_string(),
                    |f| format!("server closed the connection: {} {}", f.code, f.reason.as_str()),
                );
                break TransportEvent::Disconnected { reason };
            }
            _ => {}
        }
    };

    deliver(&events, &cancel, terminal).await;
}

/// Send an event unless the session is cancelled first. Returns false when the
/// event was not delivered.
async fn deliver(
    events: &mpsc::Sender<TransportEvent>,
    cancel: &CancellationToken,
    event: TransportEvent,
) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

// =============================================================================
// Tests
// =============================================================================
