//! Runtime control plane: version negotiation, keep-alive, input forwarding
//! (spec.md §2 component G, §4.G, §5).
//!
//! Generic over the byte stream so tests can drive it over an in-memory
//! `tokio::io::duplex` pair instead of a real TCP socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

use crate::error::Error;
use crate::quit::QuitReason;
use crate::wire::control::{ControlFrame, MessageType, HEADER_LEN};

/// Maximum INPUT payload the control plane will forward (spec.md §4.G:
/// "forward only when...payload <= 1020 bytes").
pub const MAX_INPUT_PAYLOAD: usize = 1020;
const CLIENT_VERSION: &str = "rpsession/1";
const MAX_FRAME: usize = 1024;

/// Events surfaced from the background read loop up to the session machine.
#[derive(Debug, Clone)]
pub enum ControlPlaneEvent {
    VersionNegotiated(String),
    Quit(QuitReason),
    /// A SESSION_CTRL payload the core does not interpret further (rumble,
    /// keyboard prompts, etc. are opaque bytes at this layer; the
    /// surrounding application decodes them).
    SessionCtrl(Vec<u8>),
    ConnectionLost,
}

/// Point-in-time counters (spec.md §4.G "Exposes stats").
#[derive(Debug, Clone, Default)]
pub struct ControlPlaneStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bangs_sent: u64,
    pub last_bang_time: Option<Instant>,
    pub last_rtt: Option<Duration>,
    pub negotiated_version: Option<String>,
}

struct Shared {
    stats: Mutex<ControlPlaneStats>,
    input_enabled: std::sync::atomic::AtomicBool,
}

/// A connected control-plane channel. `S` is the underlying byte stream.
pub struct ControlPlane<S> {
    writer_tx: mpsc::Sender<Vec<u8>>,
    shared: Arc<Shared>,
    _stream_marker: std::marker::PhantomData<S>,
}

impl ControlPlane<TcpStream> {
    /// Connects over TCP, negotiates VERSION_REQ/RSP, and starts the
    /// background keep-alive/read loop (spec.md §4.F step 8).
    pub async fn connect(
        addr: impl ToSocketAddrs,
        connect_timeout: Duration,
        bang_interval: Duration,
        connection_lost_threshold: Duration,
    ) -> Result<(Self, mpsc::Receiver<ControlPlaneEvent>), Error> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout("control-plane connect timed out"))??;
        Self::from_stream(stream, bang_interval, connection_lost_threshold).await
    }
}

impl<S> ControlPlane<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Builds a control plane over an already-connected stream (used for
    /// TCP in production and an in-memory duplex in tests).
    pub async fn from_stream(
        mut stream: S,
        bang_interval: Duration,
        connection_lost_threshold: Duration,
    ) -> Result<(Self, mpsc::Receiver<ControlPlaneEvent>), Error> {
        let version_req = ControlFrame::new(
            MessageType::VersionReq,
            0,
            CLIENT_VERSION.as_bytes().to_vec(),
        )
        .encode(MAX_FRAME)?;
        stream.write_all(&version_req).await?;

        let mut read_buf = Vec::new();
        let negotiated_version = read_version_rsp(&mut stream, &mut read_buf).await?;

        let shared = Arc::new(Shared {
            stats: Mutex::new(ControlPlaneStats {
                negotiated_version: Some(negotiated_version.clone()),
                ..Default::default()
            }),
            input_enabled: std::sync::atomic::AtomicBool::new(true),
        });

        let (writer_tx, writer_rx) = mpsc::channel::<Vec<u8>>(64);
        let (event_tx, event_rx) = mpsc::channel(32);

        let _ = event_tx
            .send(ControlPlaneEvent::VersionNegotiated(negotiated_version))
            .await;

        tokio::spawn(run_loop(
            stream,
            read_buf,
            writer_rx,
            event_tx,
            Arc::clone(&shared),
            bang_interval,
            connection_lost_threshold,
        ));

        Ok((
            Self {
                writer_tx,
                shared,
                _stream_marker: std::marker::PhantomData,
            },
            event_rx,
        ))
    }

    pub fn stats(&self) -> ControlPlaneStats {
        self.shared.stats.lock().clone()
    }

    pub fn set_input_enabled(&self, enabled: bool) {
        self.shared
            .input_enabled
            .store(enabled, std::sync::atomic::Ordering::SeqCst);
    }

    /// Forwards an INPUT message. Silently drops the payload (not an error)
    /// when input is disabled or the payload exceeds the cap, per spec.md
    /// §4.G: "forward only when enabled and when payload <= 1020 bytes;
    /// drop otherwise".
    pub async fn send_input(&self, payload: Vec<u8>) -> Result<(), Error> {
        if !self
            .shared
            .input_enabled
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Ok(());
        }
        if payload.len() > MAX_INPUT_PAYLOAD {
            debug!(target: "rpsession::control_plane", len = payload.len(), "dropping oversized input payload");
            return Ok(());
        }
        let frame = ControlFrame::new(MessageType::Input, 0, payload).encode(MAX_FRAME)?;
        self.writer_tx
            .send(frame)
            .await
            .map_err(|_| Error::not_connected("control-plane writer task has exited"))?;
        let mut stats = self.shared.stats.lock();
        stats.messages_sent += 1;
        Ok(())
    }
}

async fn read_version_rsp<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
) -> Result<String, Error> {
    loop {
        if let Some((frame, consumed)) = ControlFrame::try_decode(buf, MAX_FRAME)? {
            buf.drain(..consumed);
            if frame.message_type == MessageType::VersionRsp {
                return Ok(String::from_utf8_lossy(&frame.payload).into_owned());
            }
            continue;
        }
        let mut chunk = [0u8; 512];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::network("connection closed before VERSION_RSP"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop<S>(
    mut stream: S,
    mut read_buf: Vec<u8>,
    mut writer_rx: mpsc::Receiver<Vec<u8>>,
    event_tx: mpsc::Sender<ControlPlaneEvent>,
    shared: Arc<Shared>,
    bang_interval: Duration,
    connection_lost_threshold: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut bang_ticker = interval(bang_interval);
    let connected_at = Instant::now();
    let mut last_inbound = connected_at;
    let mut last_bang_sent: Option<Instant> = None;
    let mut chunk = [0u8; 1024];

    loop {
        let idle = Instant::now().saturating_duration_since(last_inbound);
        if idle >= connection_lost_threshold {
            let _ = event_tx.send(ControlPlaneEvent::ConnectionLost).await;
            return;
        }

        tokio::select! {
            _ = bang_ticker.tick() => {
                let ts = (connected_at.elapsed().as_millis() as u32).to_be_bytes();
                if let Ok(frame) = ControlFrame::new(MessageType::Bang, 0, ts.to_vec()).encode(MAX_FRAME) {
                    if stream.write_all(&frame).await.is_err() {
                        let _ = event_tx.send(ControlPlaneEvent::ConnectionLost).await;
                        return;
                    }
                    let sent_at = Instant::now();
                    last_bang_sent = Some(sent_at);
                    let mut stats = shared.stats.lock();
                    stats.bangs_sent += 1;
                    stats.last_bang_time = Some(sent_at);
                }
            }
            outbound = writer_rx.recv() => {
                match outbound {
                    Some(bytes) => {
                        if stream.write_all(&bytes).await.is_err() {
                            let _ = event_tx.send(ControlPlaneEvent::ConnectionLost).await;
                            return;
                        }
                    }
                    None => return,
                }
            }
            result = read_frame(&mut stream, &mut read_buf, connection_lost_threshold) => {
                match result {
                    Ok(Some(frame)) => {
                        last_inbound = Instant::now();
                        let mut stats = shared.stats.lock();
                        stats.messages_received += 1;
                        // RTT estimate from BANG cadence (spec.md §4.G): the
                        // time from the most recent BANG send to the next
                        // inbound frame after it. Consumed once per BANG so
                        // later frames don't keep stretching the same sample.
                        if let Some(sent_at) = last_bang_sent.take() {
                            stats.last_rtt = Some(last_inbound.saturating_duration_since(sent_at));
                        }
                        drop(stats);
                        if !dispatch(frame, &event_tx).await {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(target: "rpsession::control_plane", error = %err, "read loop failed");
                        let _ = event_tx.send(ControlPlaneEvent::ConnectionLost).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    tick_bound: Duration,
) -> Result<Option<ControlFrame>, Error> {
    if let Some((frame, consumed)) = ControlFrame::try_decode(buf, MAX_FRAME)? {
        buf.drain(..consumed);
        return Ok(Some(frame));
    }
    let mut chunk = [0u8; 512];
    match timeout(tick_bound.min(Duration::from_millis(100)), stream.read(&mut chunk)).await {
        Ok(Ok(0)) => Err(Error::network("control-plane peer closed the connection")),
        Ok(Ok(n)) => {
            buf.extend_from_slice(&chunk[..n]);
            if let Some((frame, consumed)) = ControlFrame::try_decode(buf, MAX_FRAME)? {
                buf.drain(..consumed);
                Ok(Some(frame))
            } else {
                Ok(None)
            }
        }
        Ok(Err(err)) => Err(Error::from(err)),
        Err(_) => Ok(None),
    }
}

async fn dispatch(frame: ControlFrame, event_tx: &mpsc::Sender<ControlPlaneEvent>) -> bool {
    match frame.message_type {
        MessageType::Bang => true,
        MessageType::SessionCtrl => event_tx
            .send(ControlPlaneEvent::SessionCtrl(frame.payload))
            .await
            .is_ok(),
        MessageType::Error => {
            let reason = QuitReason::Other(String::from_utf8_lossy(&frame.payload).into_owned());
            event_tx.send(ControlPlaneEvent::Quit(reason)).await.is_ok()
        }
        _ => true,
    }
}
