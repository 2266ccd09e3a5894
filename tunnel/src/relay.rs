//! Persistent websocket to the relay.
//!
//! One writer task owns the socket sink and drains three sources: explicit
//! sends, the log queue, and tail-file lines. One reader task owns the stream
//! and hands each frame to the registered [`InboundHandler`] in arrival order.
//! A read failure marks the connection lost; the session treats that as fatal.

use async_trait::async_trait;
use devtunnel_protocol::{Envelope, TYPE_LOG};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{
    self, Message,
    client::IntoClientRequest,
    http::{HeaderValue, StatusCode, header::AUTHORIZATION},
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::RelayError;
use crate::logsink::LogReceiver;
use crate::tail::{self, EventTailer};

/// Query marker telling the relay which side of the room is connecting.
pub const SESSION_TYPE_PARAM: (&str, &str) = ("from", "cli");

const OUTBOUND_CAPACITY: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives every inbound frame, one at a time.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, frame: &str) -> anyhow::Result<()>;
}

/// Relay endpoint for a session: socket scheme, session id and type marker in the query.
pub fn relay_url(base: &str, session_id: &str) -> Result<Url, RelayError> {
    let mut url = Url::parse(base).map_err(|e| RelayError::InvalidUrl(format!("{base}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RelayError::InvalidUrl(format!(
                "unsupported scheme {other:?} in {base}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RelayError::InvalidUrl(format!("cannot use {scheme} for {base}")))?;
    url.query_pairs_mut()
        .append_pair("id", session_id)
        .append_pair(SESSION_TYPE_PARAM.0, SESSION_TYPE_PARAM.1);
    Ok(url)
}

fn is_auth_denied(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

struct OutboundFrame {
    text: String,
    ack: oneshot::Sender<Result<(), RelayError>>,
}

/// Cloneable send handle. Every envelope it produces carries the session id.
#[derive(Clone)]
pub struct RelaySender {
    session_id: String,
    tx: mpsc::Sender<OutboundFrame>,
}

impl RelaySender {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Marshals and performs a single write through the writer task. No retry.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        r#type: &str,
    ) -> Result<(), RelayError> {
        let payload = serde_json::to_value(payload)?;
        let envelope = Envelope::new(self.session_id.as_str(), r#type, payload);
        let text = serde_json::to_string(&envelope)?;
        tracing::trace!(kind = %r#type, "sending message");

        let (ack, done) = oneshot::channel();
        self.tx
            .send(OutboundFrame { text, ack })
            .await
            .map_err(|_| RelayError::Closed)?;
        done.await.map_err(|_| RelayError::Closed)?
    }
}

pub struct ConnectOptions {
    pub session_id: String,
    pub relay_url: String,
    pub api_key: String,
    pub events_file: PathBuf,
    pub logs: LogReceiver,
}

type SharedHandler = Arc<RwLock<Option<Arc<dyn InboundHandler>>>>;

pub struct RelayConnection {
    sender: RelaySender,
    handler: SharedHandler,
    shutdown: CancellationToken,
    lost: CancellationToken,
    lost_reason: Arc<StdMutex<Option<String>>>,
    tasks: Mutex<JoinSet<Result<(), RelayError>>>,
    tailer: StdMutex<Option<EventTailer>>,
}

impl RelayConnection {
    /// Single attempt; a rejected credential surfaces as [`RelayError::InvalidCredential`].
    pub async fn connect(opts: ConnectOptions) -> Result<Self, RelayError> {
        let url = relay_url(&opts.relay_url, &opts.session_id)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Handshake(Box::new(e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", opts.api_key))
            .map_err(|_| RelayError::InvalidCredential)?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        tracing::debug!(url=%url, "dialing relay");
        let (ws, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(ok) => ok,
            Err(tungstenite::Error::Http(resp)) if is_auth_denied(resp.status()) => {
                return Err(RelayError::InvalidCredential);
            }
            Err(err) => return Err(RelayError::Handshake(Box::new(err))),
        };
        tracing::info!(session_id=%opts.session_id, "connected to relay");

        let (tailer, tail_lines) = EventTailer::spawn(&opts.events_file).map_err(RelayError::Tail)?;
        let (sink, stream) = ws.split();

        let shutdown = CancellationToken::new();
        let lost = CancellationToken::new();
        let lost_reason = Arc::new(StdMutex::new(None));
        let handler: SharedHandler = Arc::new(RwLock::new(None));
        let (tx, outbound) = mpsc::channel(OUTBOUND_CAPACITY);

        let mut tasks = JoinSet::new();
        tasks.spawn(write_loop(
            sink,
            opts.session_id.clone(),
            outbound,
            opts.logs,
            tail_lines,
            shutdown.clone(),
        ));
        tasks.spawn(read_loop(
            stream,
            handler.clone(),
            shutdown.clone(),
            lost.clone(),
            lost_reason.clone(),
        ));

        Ok(Self {
            sender: RelaySender {
                session_id: opts.session_id,
                tx,
            },
            handler,
            shutdown,
            lost,
            lost_reason,
            tasks: Mutex::new(tasks),
            tailer: StdMutex::new(Some(tailer)),
        })
    }

    pub fn session_id(&self) -> &str {
        self.sender.session_id()
    }

    pub fn sender(&self) -> RelaySender {
        self.sender.clone()
    }

    pub async fn send<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        r#type: &str,
    ) -> Result<(), RelayError> {
        self.sender.send(payload, r#type).await
    }

    /// Replaces the handler that receives inbound frames.
    pub fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }

    /// Resolves once the reader has given up on the socket.
    pub async fn lost(&self) -> RelayError {
        self.lost.cancelled().await;
        let reason = self
            .lost_reason
            .lock()
            .ok()
            .and_then(|r| r.clone())
            .unwrap_or_else(|| "connection lost".into());
        RelayError::Lost(reason)
    }

    /// Closes the socket and stops the tail watch, attempting both. Returns the first error.
    pub async fn close(&self) -> Result<(), RelayError> {
        self.shutdown.cancel();
        let mut first_err: Option<RelayError> = None;

        {
            let mut tasks = self.tasks.lock().await;
            let joined = tokio::time::timeout(CLOSE_TIMEOUT, async {
                let mut errors = Vec::new();
                while let Some(res) = tasks.join_next().await {
                    match res {
                        Ok(Err(RelayError::Lost(_))) | Ok(Ok(())) => {}
                        Ok(Err(err)) => errors.push(err),
                        Err(err) if err.is_cancelled() => {}
                        Err(err) => errors.push(RelayError::Lost(err.to_string())),
                    }
                }
                errors
            })
            .await;
            match joined {
                Ok(errors) => first_err = errors.into_iter().next(),
                Err(_) => {
                    tracing::debug!("relay tasks did not stop in time; aborting");
                    tasks.abort_all();
                }
            }
        }

        let tailer = self.tailer.lock().ok().and_then(|mut t| t.take());
        if let Some(tailer) = tailer {
            if let Err(err) = tailer.stop() {
                first_err.get_or_insert(RelayError::Tail(err));
            }
        }

        if let Ok(mut slot) = self.handler.write() {
            slot.take();
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn write_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), RelayError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(envelope)?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| RelayError::Write(Box::new(e)))
}

async fn forward_log<S>(sink: &mut S, session_id: &str, line: String)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let payload: Value = match serde_json::from_str(&line) {
        Ok(v) => v,
        Err(err) => {
            tracing::debug!(error=%err, "skipping malformed log entry");
            return;
        }
    };
    if let Err(err) = write_envelope(sink, &Envelope::new(session_id, TYPE_LOG, payload)).await {
        tracing::debug!(error=%err, "failed to forward log entry");
    }
}

async fn forward_tail_line<S>(sink: &mut S, session_id: &str, line: &str)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let envelopes = match tail::envelopes_for_line(session_id, line) {
        Ok(envelopes) => envelopes,
        Err(err) => {
            tracing::debug!(error=%err, "skipping undecodable events line");
            return;
        }
    };
    for envelope in envelopes {
        if let Err(err) = write_envelope(sink, &envelope).await {
            tracing::debug!(error=%err, kind=%envelope.r#type, "failed to forward session event");
        }
    }
}

async fn write_loop<S>(
    mut sink: S,
    session_id: String,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    mut logs: LogReceiver,
    mut tail_lines: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) -> Result<(), RelayError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(frame) = outbound.recv() => {
                let res = sink
                    .send(Message::Text(frame.text.into()))
                    .await
                    .map_err(|e| RelayError::Write(Box::new(e)));
                let _ = frame.ack.send(res);
            }
            Some(line) = logs.recv() => forward_log(&mut sink, &session_id, line).await,
            Some(line) = tail_lines.recv() => forward_tail_line(&mut sink, &session_id, &line).await,
            else => break,
        }
    }

    match sink.close().await {
        Ok(()) => Ok(()),
        Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
        Err(err) => Err(RelayError::Write(Box::new(err))),
    }
}

async fn read_loop<S>(
    mut stream: S,
    handler: SharedHandler,
    shutdown: CancellationToken,
    lost: CancellationToken,
    lost_reason: Arc<StdMutex<Option<String>>>,
) -> Result<(), RelayError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = stream.next() => next,
        };

        let failure = match next {
            Some(Ok(Message::Text(text))) => {
                dispatch(&handler, text.as_str()).await;
                continue;
            }
            Some(Ok(Message::Binary(bytes))) => {
                match std::str::from_utf8(&bytes) {
                    Ok(text) => dispatch(&handler, text).await,
                    Err(_) => tracing::debug!("dropping non-utf8 binary frame"),
                }
                continue;
            }
            Some(Ok(Message::Close(frame))) => match frame {
                Some(frame) => format!("relay closed the connection: {} {}", frame.code, frame.reason),
                None => "relay closed the connection".to_string(),
            },
            Some(Ok(_)) => continue,
            Some(Err(err)) => format!("failed to read message: {err}"),
            None => "relay connection ended".to_string(),
        };

        if shutdown.is_cancelled() {
            return Ok(());
        }
        tracing::error!(reason=%failure, "relay connection lost");
        if let Ok(mut slot) = lost_reason.lock() {
            *slot = Some(failure.clone());
        }
        lost.cancel();
        return Err(RelayError::Lost(failure));
    }
}

async fn dispatch(handler: &SharedHandler, frame: &str) {
    tracing::trace!(frame, "recv");
    let current = handler.read().ok().and_then(|h| h.clone());
    let Some(current) = current else {
        tracing::trace!("no inbound handler registered; dropping frame");
        return;
    };
    if let Err(err) = current.handle(frame).await {
        tracing::debug!(error=%err, "inbound message handler failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_url_rewrites_scheme_and_appends_session() {
        let url = relay_url("https://relay.example.com/ws/devmode", "abc123").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://relay.example.com/ws/devmode?id=abc123&from=cli"
        );

        let url = relay_url("http://127.0.0.1:8787/ws?x=1", "s1").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8787/ws?x=1&id=s1&from=cli");

        let url = relay_url("ws://localhost:9000", "s1").unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn relay_url_rejects_unknown_schemes() {
        assert!(matches!(
            relay_url("ftp://example.com", "s1"),
            Err(RelayError::InvalidUrl(_))
        ));
        assert!(matches!(
            relay_url("not a url", "s1"),
            Err(RelayError::InvalidUrl(_))
        ));
    }

    #[test]
    fn auth_denied_statuses() {
        assert!(is_auth_denied(StatusCode::UNAUTHORIZED));
        assert!(is_auth_denied(StatusCode::FORBIDDEN));
        assert!(!is_auth_denied(StatusCode::BAD_GATEWAY));
    }

    async fn accepting_relay() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });
        format!("http://{addr}/ws/devmode")
    }

    #[tokio::test]
    async fn close_stops_the_tail_even_after_a_task_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_queue, logs) = crate::logsink::log_queue(4);
        let conn = RelayConnection::connect(ConnectOptions {
            session_id: "s1".into(),
            relay_url: accepting_relay().await,
            api_key: "k".into(),
            events_file: dir.path().join("events.log"),
            logs,
        })
        .await
        .unwrap();

        conn.tasks
            .lock()
            .await
            .spawn(async { Err(RelayError::Write(Box::new(tungstenite::Error::AlreadyClosed))) });

        let err = conn.close().await.unwrap_err();
        assert!(matches!(err, RelayError::Write(_)));
        assert!(conn.tailer.lock().unwrap().is_none());
        assert!(matches!(
            conn.send(&serde_json::json!({}), "log").await,
            Err(RelayError::Closed)
        ));
    }

    #[tokio::test]
    async fn send_on_a_closed_writer_reports_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = RelaySender {
            session_id: "s1".into(),
            tx,
        };
        assert!(matches!(
            sender.send(&serde_json::json!({}), "log").await,
            Err(RelayError::Closed)
        ));
    }
}
