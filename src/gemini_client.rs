//! Gemini Live transport
//!
//! Opens the WebSocket, performs the setup handshake and then splits the
//! socket: a writer task drains the bounded outbound queue, a reader task
//! turns server frames into [`TransportEvent`]s for the session.

use crate::codec::EncodedChunk;
use crate::events::{Connector, Transport, TransportEvent};
use crate::gemini::{
    parse_server_message, ApiResponse, ClientMessage, GeminiClientConfig, GeminiError, Result,
};
use crate::ws_writer::{run_writer, OutboundQueue, OverflowPolicy, DEFAULT_QUEUE_CAPACITY};

use futures_util::{SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Opens Gemini Live sessions for the voice controller.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    config: GeminiClientConfig,
    queue_capacity: usize,
    overflow_policy: OverflowPolicy,
}

impl GeminiConnector {
    pub fn new(config: GeminiClientConfig) -> Self {
        Self {
            config,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
        }
    }

    /// Create a connector from an API key and optional configuration.
    pub fn from_api_key(api_key: &str, config: Option<GeminiClientConfig>) -> Self {
        Self::new(GeminiClientConfig::from_api_key(api_key, config))
    }

    /// Bound the outbound queue and choose what happens when it fills up.
    pub fn with_outbound_queue(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.queue_capacity = capacity;
        self.overflow_policy = policy;
        self
    }

    pub fn config(&self) -> &GeminiClientConfig {
        &self.config
    }

    async fn open(&self, events: mpsc::Sender<TransportEvent>) -> Result<GeminiTransport> {
        let endpoint = self.config.url.split('?').next().unwrap_or_default();
        info!("Connecting to Gemini Live at {}", endpoint);

        let (ws_stream, resp) = connect_async(self.config.url.as_str()).await?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (mut sink, mut stream) = ws_stream.split();

        let setup = ClientMessage::Setup {
            setup: self.config.setup_message(),
        };
        info!("Sending setup message with model: {}", self.config.model);
        sink.send(Message::Text(setup.to_json()?.into())).await?;

        tokio::time::timeout(self.config.setup_timeout, wait_for_setup_complete(&mut stream))
            .await
            .map_err(|_| {
                error!("Timeout waiting for setup complete message");
                GeminiError::Timeout
            })??;
        info!("Gemini session setup complete");

        let queue = Arc::new(OutboundQueue::new(self.queue_capacity, self.overflow_policy));
        let tx_task = tokio::spawn(run_writer(queue.clone(), sink));

        if events.send(TransportEvent::Open).await.is_err() {
            queue.close();
            return Err(GeminiError::ChannelClosed);
        }

        let rx_task = tokio::spawn(run_reader(stream, events, queue.clone()));

        Ok(GeminiTransport {
            queue,
            _tx_task: tx_task,
            rx_task,
        })
    }
}

impl Connector for GeminiConnector {
    type Transport = GeminiTransport;

    fn connect(
        &self,
        events: mpsc::Sender<TransportEvent>,
    ) -> impl std::future::Future<Output = Result<GeminiTransport>> + Send {
        self.open(events)
    }
}

/// Live connection handle. Sending only enqueues; the writer task does the I/O.
pub struct GeminiTransport {
    queue: Arc<OutboundQueue>,
    _tx_task: JoinHandle<()>,
    rx_task: JoinHandle<()>,
}

impl Transport for GeminiTransport {
    fn send(&self, chunk: EncodedChunk) {
        self.queue.push(chunk);
    }

    fn close(&self) {
        if self.queue.is_closed() {
            return;
        }
        info!("Closing Gemini Live connection ({} chunks dropped)", self.queue.dropped());
        // The writer drains what is queued, then sends the Close frame.
        self.queue.close();
    }
}

impl Drop for GeminiTransport {
    fn drop(&mut self) {
        self.queue.close();
        self.rx_task.abort();
    }
}

/// Read frames until `setupComplete` arrives.
async fn wait_for_setup_complete<S>(stream: &mut S) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text.to_string(),
            Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(frame) => {
                error!("WebSocket closed during setup: {:?}", frame);
                return Err(GeminiError::ConnectionClosed);
            }
            _ => continue,
        };

        match parse_server_message(&text)? {
            ApiResponse::SetupComplete => return Ok(()),
            other => debug!("Ignoring message before setup complete: {:?}", other),
        }
    }
    Err(GeminiError::SetupNotComplete)
}

/// Forward server frames to the session until the socket ends.
async fn run_reader<S>(
    mut stream: S,
    events: mpsc::Sender<TransportEvent>,
    queue: Arc<OutboundQueue>,
) where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    info!("Inbound message task started");

    let terminal = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text.to_string(),
            // The Live API delivers JSON in binary frames as well.
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Received non-UTF-8 binary message ({} bytes)", bytes.len());
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                info!("WebSocket closed: {:?}", frame);
                break if queue.is_closed() {
                    TransportEvent::Closed
                } else {
                    TransportEvent::Error(format!("connection closed by server: {:?}", frame))
                };
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!("WebSocket error: {:?}", e);
                break TransportEvent::Error(GeminiError::WebSocket(e).to_string());
            }
            None => {
                break if queue.is_closed() {
                    TransportEvent::Closed
                } else {
                    TransportEvent::Error(GeminiError::ConnectionClosed.to_string())
                };
            }
        };

        match parse_server_message(&text) {
            Ok(ApiResponse::Content(event)) => {
                if event.is_empty() {
                    continue;
                }
                debug!("📥 Server content: {} audio part(s)", event.audio.len());
                if events.send(TransportEvent::Message(event)).await.is_err() {
                    debug!("Session stopped listening, ending reader");
                    break TransportEvent::Closed;
                }
            }
            Ok(ApiResponse::GoAway) => {
                warn!("📥 Gemini connection closing (goAway)");
                break TransportEvent::Error("server requested disconnect (goAway)".to_string());
            }
            Ok(ApiResponse::SetupComplete) | Ok(ApiResponse::Ignored) => {}
            Err(GeminiError::Server(message)) => {
                error!("Gemini API error: {}", message);
                break TransportEvent::Error(message);
            }
            Err(e) => {
                error!("Failed to parse server message: {:?}", e);
                debug!("Raw message: {}", text);
            }
        }
    };

    queue.close();
    let _ = events.send(terminal).await;
    info!("Inbound message task terminated");
}
