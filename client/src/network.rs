//! Transport layer: persistent WebSocket channels and one-shot HTTP calls
//!
//! A [`StreamChannel`] owns one persistent connection. Its receive loop runs
//! on its own task and hands every inbound event to an [`EventSink`]; it
//! never interprets frame contents. Sends are fire-and-forget and fail fast
//! with [`ClientError::NotConnected`] unless the channel is `Open`.
//!
//! [`HttpChannel`] is the request/response companion: one request, one
//! response, bounded by a timeout.

use crate::error::ClientError;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Close code reported for a close frame that carried no status.
const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code reported when the stream ends without a close handshake.
const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }

    /// States from which a new `connect` may start.
    fn can_connect(self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Errored
        )
    }
}

/// Everything a persistent channel reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Close {
        code: u16,
        reason: String,
        was_clean: bool,
    },
}

/// Receives transport events on whatever task the receive loop runs on.
pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(gate: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    gate.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(gate: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    gate.write().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    label: String,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Set by `close`. Every delivery holds the read side for the whole
    /// sink call, so `close` waits out in-flight events and silences later ones.
    closed_locally: RwLock<bool>,
}

impl Shared {
    fn emit(&self, sink: &EventSink, event: TransportEvent) {
        let closed = read(&self.closed_locally);
        if *closed {
            debug!("{}: dropping {:?} after local close", self.label, event);
            return;
        }
        sink(event);
    }

    /// Terminal transition driven by the remote side or the network.
    fn finish(&self, sink: &EventSink, state: ConnectionState, event: TransportEvent) {
        lock(&self.outbound).take();
        let closed = read(&self.closed_locally);
        if *closed {
            return;
        }
        self.state.send_replace(state);
        sink(event);
    }

    /// Publishes the writer and moves to `Open` unless a local close got
    /// there first. Returns false if the connection must be dropped.
    fn open(&self, sink: &EventSink, tx: mpsc::UnboundedSender<Message>) -> bool {
        let closed = read(&self.closed_locally);
        if *closed {
            return false;
        }
        *lock(&self.outbound) = Some(tx);
        self.state.send_replace(ConnectionState::Open);
        info!("{}: connected", self.label);
        sink(TransportEvent::Open);
        true
    }
}

/// One persistent bidirectional connection. Cloning yields another handle
/// to the same connection.
#[derive(Clone)]
pub struct StreamChannel {
    shared: Arc<Shared>,
}

impl StreamChannel {
    pub fn new(label: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                state,
                outbound: Mutex::new(None),
                reader: Mutex::new(None),
                closed_locally: RwLock::new(false),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observes state transitions; used by the liveness monitor.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Starts connecting in the background and returns immediately.
    ///
    /// Emits `Open` on success or `Error` on failure through `sink`.
    /// Ignored while a connection is already in progress or open.
    pub fn connect(&self, url: &str, sink: EventSink) {
        let current = self.state();
        if !current.can_connect() {
            warn!(
                "{}: connect ignored, channel is {:?}",
                self.shared.label, current
            );
            return;
        }

        *write(&self.shared.closed_locally) = false;
        self.shared.state.send_replace(ConnectionState::Connecting);

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        let url = url.to_string();

        let reader = tokio::spawn(async move {
            run_connection(shared, url, sink, tx, rx).await;
        });
        *lock(&self.shared.reader) = Some(reader);
    }

    /// Transmits `payload` verbatim as a text frame. No delivery guarantee.
    pub fn send(&self, payload: &str) -> Result<(), ClientError> {
        self.enqueue(Message::Text(payload.to_owned().into()))?;
        debug!("{} => {}", self.shared.label, payload);
        Ok(())
    }

    /// Sends a no-op ping frame.
    pub fn ping(&self) -> Result<(), ClientError> {
        self.enqueue(Message::Ping(Default::default()))
    }

    fn enqueue(&self, message: Message) -> Result<(), ClientError> {
        if !self.state().is_open() {
            return Err(ClientError::NotConnected);
        }

        // The channel may leave `Open` between the check above and here.
        let outbound = lock(&self.shared.outbound);
        let sender = outbound.as_ref().ok_or(ClientError::NotConnected)?;
        sender.send(message).map_err(|_| ClientError::NotConnected)
    }

    /// Closes the connection. Safe to call repeatedly or on a channel that
    /// never connected. No further events are emitted once this returns.
    ///
    /// Must not be called from inside this channel's own sink.
    pub fn close(&self) {
        let mut closed = write(&self.shared.closed_locally);
        let current = self.state();
        if matches!(current, ConnectionState::Idle | ConnectionState::Closed) {
            return;
        }

        *closed = true;
        self.shared.state.send_replace(ConnectionState::Closing);

        if let Some(sender) = lock(&self.shared.outbound).take() {
            let _ = sender.send(Message::Close(None));
        }
        if let Some(reader) = lock(&self.shared.reader).take() {
            reader.abort();
        }

        self.shared.state.send_replace(ConnectionState::Closed);
        info!("{}: channel closed", self.shared.label);
    }
}

async fn run_connection(
    shared: Arc<Shared>,
    url: String,
    sink: EventSink,
    tx: mpsc::UnboundedSender<Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    info!("{}: connecting to {}", shared.label, url);

    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            error!("{}: failed to connect to {}: {}", shared.label, url, e);
            shared.finish(
                &sink,
                ConnectionState::Errored,
                TransportEvent::Error(e.to_string()),
            );
            return;
        }
    };

    if !shared.open(&sink, tx) {
        debug!("{}: closed locally during handshake", shared.label);
        return;
    }

    let (mut write, mut read) = ws_stream.split();
    let label = shared.label.clone();

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = write.send(message).await {
                warn!("{}: write failed: {}", label, e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                debug!("{} <= {}", shared.label, text.as_str());
                shared.emit(&sink, TransportEvent::Message(text.as_str().to_owned()));
            }
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                    .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                info!("{}: closed by remote (code={})", shared.label, code);
                shared.finish(
                    &sink,
                    ConnectionState::Closed,
                    TransportEvent::Close {
                        code,
                        reason,
                        was_clean: true,
                    },
                );
                return;
            }
            // Pings are answered by tungstenite; binary frames carry nothing we read.
            Ok(_) => {}
            Err(e) => {
                warn!("{}: read error: {}", shared.label, e);
                shared.finish(
                    &sink,
                    ConnectionState::Errored,
                    TransportEvent::Error(e.to_string()),
                );
                return;
            }
        }
    }

    shared.finish(
        &sink,
        ConnectionState::Closed,
        TransportEvent::Close {
            code: ABNORMAL_CLOSURE,
            reason: "stream ended".to_string(),
            was_clean: false,
        },
    );
}

/// Short-lived request/response calls against a REST base URL.
#[derive(Debug, Clone)]
pub struct HttpChannel {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpChannel {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ClientError::InvalidEndpoint(format!("{}: {}", base_url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(ClientError::InvalidEndpoint(base_url.to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: parsed,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Appends `segments` to the base path, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidEndpoint(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// POSTs `body` as JSON and returns the raw response body on 2xx.
    pub async fn post<B>(&self, segments: &[&str], body: &B) -> Result<String, ClientError>
    where
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(segments)?;
        debug!("POST {}", url);
        self.execute(self.client.post(url).json(body)).await
    }

    pub async fn get(&self, segments: &[&str]) -> Result<String, ClientError> {
        let url = self.endpoint(segments)?;
        debug!("GET {}", url);
        self.execute(self.client.get(url)).await
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<String, ClientError> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.unreachable(e))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(ClientError::RemoteRejected {
                status: Some(status.as_u16()),
                body,
            })
        }
    }

    fn unreachable(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Unreachable(format!("timed out after {:?}", self.timeout))
        } else {
            ClientError::Unreachable(e.to_string())
        }
    }
}
