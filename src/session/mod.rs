//! Session attempt orchestrator (spec.md §2 component F, §4.F, §5).
//!
//! Drives one remote-play attempt end to end: precondition gate, freeze,
//! discovery/wake, session-init, control-plane start, media-feeder start,
//! and the steady-state event relay while STREAMING. Generic over the
//! credential store and decoder sink so callers inject both as a capability
//! bundle rather than reaching for globals.
//!
//! **Design decision (not in spec.md, recorded in DESIGN.md):** `ERROR` is
//! sticky — reaching it tears down the control plane and feeder but does
//! not auto-reset to `IDLE`; callers call [`SessionMachine::stop`] to
//! acknowledge and return to `IDLE` before starting another attempt. A
//! graceful quit (`Normal`/`Stopped`) during `STREAMING` *does* walk itself
//! back to `IDLE` automatically, since there is nothing to acknowledge.

pub mod context;
pub mod state;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::cache::RegistrationCache;
use crate::config::RuntimeConfig;
use crate::control_plane::{ControlPlane, ControlPlaneEvent, ControlPlaneStats};
use crate::credentials::{ConsoleRegistration, CredentialStore};
use crate::crypto;
use crate::discovery::DiscoveryEngine;
use crate::error::{Error, ErrorKind};
use crate::feeder::{DecoderSink, FeederStats, MediaFeeder};
use crate::quit::QuitReason;
use crate::wire::discovery::ConsoleState;
use crate::wire::session_init::{build_session_init_request, parse_session_init_response, SessionInitResponse};

pub use context::SessionContext;
pub use state::SessionState;
use state::StateCell;

/// Events the session machine surfaces to its caller (spec.md §4.F).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// An opaque SESSION_CTRL payload relayed from the control plane
    /// (rumble, keyboard prompts, etc; this crate does not interpret it).
    SessionCtrl(Vec<u8>),
    Error(ErrorSummary),
    Quit(QuitReason),
}

/// A cloneable summary of an [`Error`] suitable for an event channel.
#[derive(Debug, Clone)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ErrorSummary {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

struct Inner<S: CredentialStore, D: DecoderSink> {
    cache: Arc<RegistrationCache<S>>,
    discovery: Arc<DiscoveryEngine>,
    decoder: Arc<D>,
    config: RuntimeConfig,
    state: Mutex<StateCell>,
    context: Mutex<Option<SessionContext>>,
    control_plane: Mutex<Option<Arc<ControlPlane<TcpStream>>>>,
    feeder: Mutex<Option<MediaFeeder>>,
    destroying: AtomicBool,
    /// Set by `stop()` so an in-flight attempt (wake-settle sleep, wake
    /// confirm poll) can abort promptly instead of running to the end of
    /// its budget before the state machine notices cancellation.
    cancel_requested: AtomicBool,
    events_tx: mpsc::Sender<SessionEvent>,
}

/// Orchestrates one session attempt at a time (spec.md §4.F).
///
/// Cheaply `Clone`: every clone shares the same underlying state, so the
/// steady-state supervisor task can hold its own handle without borrowing
/// from the caller.
pub struct SessionMachine<S: CredentialStore, D: DecoderSink> {
    inner: Arc<Inner<S, D>>,
}

impl<S: CredentialStore, D: DecoderSink> Clone for SessionMachine<S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, D> SessionMachine<S, D>
where
    S: CredentialStore + 'static,
    D: DecoderSink + 'static,
{
    /// Builds a new, idle session machine. The returned receiver is the
    /// caller's only feed of session events; drop it and events are
    /// silently discarded (the channel is bounded and non-blocking on send).
    pub fn new(
        cache: Arc<RegistrationCache<S>>,
        discovery: Arc<DiscoveryEngine>,
        decoder: Arc<D>,
        config: RuntimeConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let inner = Arc::new(Inner {
            cache,
            discovery,
            decoder,
            config,
            state: Mutex::new(StateCell::new()),
            context: Mutex::new(None),
            control_plane: Mutex::new(None),
            feeder: Mutex::new(None),
            destroying: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            events_tx,
        });
        (Self { inner }, events_rx)
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.lock().get()
    }

    pub fn control_plane_stats(&self) -> Option<ControlPlaneStats> {
        self.inner
            .control_plane
            .lock()
            .as_ref()
            .map(|plane| plane.stats())
    }

    pub fn feeder_stats(&self) -> Option<FeederStats> {
        self.inner.feeder.lock().as_ref().map(|feeder| feeder.stats())
    }

    fn transition(&self, next: SessionState) -> Result<(), Error> {
        self.inner.state.lock().transition(next)?;
        self.emit(SessionEvent::StateChanged(next));
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events_tx.try_send(event);
    }

    /// Polls `cancel_requested` at `control_tick_interval` cadence and
    /// returns once `stop()` has set it. Used to race the wake-phase waits
    /// so cancellation lands within one tick instead of the full budget.
    async fn wait_for_cancel(&self) {
        let poll = self.inner.config.control_tick_interval.max(Duration::from_millis(1));
        loop {
            if self.inner.cancel_requested.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn sleep_cancellable(&self, duration: Duration) -> Result<(), Error> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.wait_for_cancel() => Err(Error::invalid_state("attempt cancelled by stop()")),
        }
    }

    async fn run_cancellable<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        tokio::select! {
            res = fut => res,
            _ = self.wait_for_cancel() => Err(Error::invalid_state("attempt cancelled by stop()")),
        }
    }

    /// Runs spec.md §4.F steps 1-9 of one session attempt: precondition
    /// gate, freeze, discovery/wake, session-init, and control-plane/feeder
    /// start. Returns once the attempt has reached `AUTHENTICATING` with
    /// both running; the first-frame -> `STREAMING` transition (step 10)
    /// and the steady-state relay (step 11) continue in a spawned task, so
    /// this future resolves without waiting on the console's first frame.
    pub async fn start_attempt(&self, console_ip: &str, account_id_b64: &str) -> Result<(), Error> {
        if self.state() != SessionState::Idle {
            return Err(Error::invalid_state("a session attempt is already active"));
        }
        self.inner.destroying.store(false, Ordering::SeqCst);
        self.inner.cancel_requested.store(false, Ordering::SeqCst);
        self.transition(SessionState::Connecting)?;

        if let Err(err) = self.run_setup(console_ip, account_id_b64).await {
            if self.inner.cancel_requested.load(Ordering::SeqCst) {
                // stop() already tore the attempt down and returned to IDLE.
                return Err(err);
            }
            self.emit(SessionEvent::Error((&err).into()));
            let _ = self.transition(SessionState::Error);
            self.teardown().await;
            return Err(err);
        }
        Ok(())
    }

    async fn run_setup(&self, console_ip: &str, account_id_b64: &str) -> Result<(), Error> {
        // Step 1: precondition gate, before any packet is sent.
        let registration = self
            .inner
            .cache
            .get_registration(console_ip)
            .await?
            .ok_or_else(|| Error::not_registered(format!("{console_ip} has no usable registration")))?;

        // Step 2: freeze the account id for the duration of the attempt.
        let context = SessionContext::new(
            console_ip,
            registration.regkey_hex8().to_string(),
            registration.account_id_le8(),
            account_id_b64.to_string(),
            registration.target,
        );
        *self.inner.context.lock() = Some(context);

        // Step 3/4: discovery probe, waking the console only if needed.
        let state = self
            .inner
            .discovery
            .check_single(console_ip)
            .await
            .unwrap_or(ConsoleState::Unknown);
        if state != ConsoleState::Ready {
            self.inner
                .discovery
                .wake(console_ip, registration.wake_credential())
                .await?;
            self.sleep_cancellable(self.inner.config.wake_settle_delay).await?;
            let budget = self.inner.config.wake_probe_interval * self.inner.config.wake_probe_count;
            self.run_cancellable(self.inner.discovery.wait_for_ready(
                console_ip,
                budget,
                self.inner.config.wake_probe_interval,
            ))
            .await?;
        }

        // Step 5: port selection.
        let port = self
            .inner
            .discovery
            .get_host_request_port(console_ip)
            .unwrap_or(self.inner.config.default_host_request_port);

        // Step 6: suspend background scanning for the session-init and
        // control-plane window; always resumed regardless of outcome.
        self.inner.discovery.pause();
        let result = self.establish(console_ip, port, &registration).await;
        self.inner.discovery.resume();
        result
    }

    async fn establish(
        &self,
        console_ip: &str,
        port: u16,
        registration: &ConsoleRegistration,
    ) -> Result<(), Error> {
        self.transition(SessionState::Authenticating)?;

        let constants = registration.target.constants();
        let addr = format!("{console_ip}:{port}");

        // Step 7: session-init HTTP exchange, exactly one POST per attempt.
        let mut stream = tokio::time::timeout(self.inner.config.session_init_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| Error::timeout("session-init connect timed out"))??;

        let request = build_session_init_request(
            console_ip,
            constants.session_init_path,
            constants.protocol_version,
            registration.rp_key_type,
            registration.regkey_hex8(),
            registration.account_id_b64(),
        );
        let response = tokio::time::timeout(
            self.inner.config.session_init_timeout,
            send_session_init_request(&mut stream, &request),
        )
        .await
        .map_err(|_| Error::timeout("session-init response timed out"))??;

        // The session-init response carries the only server-chosen value
        // this crate has to mix into the KDF; a missing `rp-session-id`
        // header falls back to a fixed context string (see DESIGN.md).
        let nonce_client: [u8; 16] = rand::random();
        let nonce_server = response
            .session_id()
            .map(|id| id.as_bytes().to_vec())
            .unwrap_or_else(|| b"rpsession-default-server-nonce".to_vec());
        let keys = crypto::derive_session_keys(&registration.morning, &nonce_client, &nonce_server)?;

        // Step 8: control plane start; negotiates VERSION_REQ/RSP before returning.
        let (plane, cp_events) = ControlPlane::connect(
            addr,
            self.inner.config.connect_timeout,
            self.inner.config.bang_interval,
            self.inner.config.connection_lost_threshold,
        )
        .await?;
        *self.inner.control_plane.lock() = Some(Arc::new(plane));

        // Step 9: media feeder start; ingest is idle until the console pushes frames.
        let feeder = MediaFeeder::bind(unspecified_addr_for(console_ip), self.inner.config.feeder_queue_depth).await?;
        let first_frame_rx = feeder.run(keys, Arc::clone(&self.inner.decoder), self.inner.config.control_tick_interval);
        *self.inner.feeder.lock() = Some(feeder);

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.run_steady_state(cp_events, first_frame_rx).await;
        });

        Ok(())
    }

    /// Steps 10-11: transitions to `STREAMING` on the first decoded frame
    /// and relays control-plane events (SESSION_CTRL, quit, connection
    /// loss) for the rest of the attempt's life.
    async fn run_steady_state(
        self,
        mut cp_events: mpsc::Receiver<ControlPlaneEvent>,
        mut first_frame_rx: oneshot::Receiver<()>,
    ) {
        let mut first_frame_done = false;
        loop {
            tokio::select! {
                event = cp_events.recv() => {
                    match event {
                        Some(event) => self.handle_control_plane_event(event).await,
                        None => {
                            if !self.inner.destroying.load(Ordering::SeqCst) {
                                self.handle_control_plane_event(ControlPlaneEvent::ConnectionLost).await;
                            }
                            return;
                        }
                    }
                }
                res = &mut first_frame_rx, if !first_frame_done => {
                    first_frame_done = true;
                    if res.is_ok() && self.state() == SessionState::Authenticating {
                        let _ = self.transition(SessionState::Streaming);
                    }
                }
            }

            if matches!(self.state(), SessionState::Idle | SessionState::Error) {
                return;
            }
        }
    }

    async fn handle_control_plane_event(&self, event: ControlPlaneEvent) {
        match event {
            ControlPlaneEvent::VersionNegotiated(version) => {
                debug!(target: "rpsession::session", %version, "control plane negotiated");
            }
            ControlPlaneEvent::SessionCtrl(payload) => self.emit(SessionEvent::SessionCtrl(payload)),
            ControlPlaneEvent::Quit(reason) => self.handle_quit(reason).await,
            ControlPlaneEvent::ConnectionLost => {
                if self.inner.destroying.load(Ordering::SeqCst) {
                    return;
                }
                if matches!(
                    self.state(),
                    SessionState::Connecting
                        | SessionState::Authenticating
                        | SessionState::Streaming
                        | SessionState::Paused
                ) {
                    let _ = self.transition(SessionState::Error);
                    self.emit(SessionEvent::Error(ErrorSummary {
                        kind: ErrorKind::Network,
                        message: "control plane connection lost".to_string(),
                    }));
                    self.teardown().await;
                }
            }
        }
    }

    /// Quit-reason classification (spec.md §4.F "Quit handling"): critical
    /// during setup promotes to `ERROR`; non-critical during setup is
    /// logged and otherwise ignored; any error reason during `STREAMING`
    /// promotes to `ERROR`, a graceful one walks back to `IDLE`.
    async fn handle_quit(&self, reason: QuitReason) {
        self.emit(SessionEvent::Quit(reason.clone()));
        match self.state() {
            SessionState::Connecting | SessionState::Authenticating => {
                if reason.is_critical_during_setup() {
                    let _ = self.transition(SessionState::Error);
                    self.teardown().await;
                } else {
                    debug!(target: "rpsession::session", ?reason, "non-critical quit during setup, ignored");
                }
            }
            SessionState::Streaming | SessionState::Paused => {
                if reason.is_error_during_streaming() {
                    let _ = self.transition(SessionState::Error);
                } else {
                    let _ = self.transition(SessionState::Disconnecting);
                    let _ = self.transition(SessionState::Idle);
                }
                self.teardown().await;
            }
            _ => {}
        }
    }

    /// Forwards an INPUT payload to the control plane (component G), if one
    /// is active.
    pub async fn send_input(&self, payload: Vec<u8>) -> Result<(), Error> {
        let plane = self.inner.control_plane.lock().clone();
        match plane {
            Some(plane) => plane.send_input(payload).await,
            None => Err(Error::not_connected("no active control plane")),
        }
    }

    pub fn pause_streaming(&self) -> Result<(), Error> {
        self.transition(SessionState::Paused)?;
        if let Some(plane) = self.inner.control_plane.lock().clone() {
            plane.set_input_enabled(false);
        }
        Ok(())
    }

    pub fn resume_streaming(&self) -> Result<(), Error> {
        self.transition(SessionState::Streaming)?;
        if let Some(plane) = self.inner.control_plane.lock().clone() {
            plane.set_input_enabled(true);
        }
        Ok(())
    }

    /// User-initiated cancellation/stop. Tears down the control plane and
    /// feeder (bounded join), destroys the frozen context, and returns to
    /// `IDLE` regardless of the state `stop` was called from — including
    /// `ERROR`, which is otherwise sticky.
    pub async fn stop(&self) -> Result<(), Error> {
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
        match self.state() {
            SessionState::Idle => return Ok(()),
            SessionState::Error | SessionState::Disconnecting => {}
            _ => self.transition(SessionState::Disconnecting)?,
        }
        self.teardown().await;
        self.transition(SessionState::Idle)
    }

    async fn teardown(&self) {
        self.inner.destroying.store(true, Ordering::SeqCst);
        if let Some(plane) = self.inner.control_plane.lock().take() {
            drop(plane);
        }
        if let Some(feeder) = self.inner.feeder.lock().take() {
            feeder.join(self.inner.config.stop_join_timeout).await;
        }
        if let Some(ctx) = self.inner.context.lock().take() {
            ctx.destroy();
        }
    }
}

async fn send_session_init_request(stream: &mut TcpStream, request: &[u8]) -> Result<SessionInitResponse, Error> {
    stream.write_all(request).await?;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        if let Some(end) = find_header_terminator(&buf) {
            return parse_session_init_response(&buf[..end]);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::network("console closed connection before session-init response"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn unspecified_addr_for(console_ip: &str) -> SocketAddr {
    if console_ip.parse::<std::net::Ipv6Addr>().is_ok() {
        "[::]:0".parse().expect("well-formed literal")
    } else {
        "0.0.0.0:0".parse().expect("well-formed literal")
    }
}
