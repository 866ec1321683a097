//! End-to-end session-attempt scenarios (spec.md §8 seed tests 1, 2, 4, 5)
//! driven against an in-process fake console speaking the real discovery
//! and control-plane wire formats over loopback UDP/TCP rather than an
//! in-memory duplex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;

use rpsession::wire::control::{ControlFrame, MessageType};
use rpsession::{
    ConsoleRegistration, ConsoleTarget, CredentialStore, DecoderSink, DiscoveryEngine, Error,
    ProcessOutcome, RegistrationCache, RuntimeConfig, SessionMachine, SessionState,
};

/// Routes `tracing` output through the test harness's captured writer so
/// `cargo test -- --nocapture` shows the session/control/wake events.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Every scenario below binds the fixed PS5 discovery/wake port (9302) to
/// speak to its fake console, so they cannot run concurrently against each
/// other even though `cargo test` runs test functions in parallel by
/// default. Each test holds this lock for its full duration.
static DISCOVERY_PORT_LOCK: OnceLock<AsyncMutex<()>> = OnceLock::new();

fn discovery_port_lock() -> &'static AsyncMutex<()> {
    DISCOVERY_PORT_LOCK.get_or_init(|| AsyncMutex::new(()))
}

#[derive(Default)]
struct MemoryStore {
    records: StdMutex<HashMap<String, ConsoleRegistration>>,
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<ConsoleRegistration>, Error> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }
    async fn save(&self, record: ConsoleRegistration) -> Result<(), Error> {
        self.records
            .lock()
            .unwrap()
            .insert(record.console_ip.clone(), record);
        Ok(())
    }
    async fn find_by_ip(&self, ip: &str) -> Result<Option<ConsoleRegistration>, Error> {
        Ok(self.records.lock().unwrap().get(ip).cloned())
    }
    async fn delete(&self, ip: &str) -> Result<(), Error> {
        self.records.lock().unwrap().remove(ip);
        Ok(())
    }
    async fn is_initialised(&self) -> bool {
        true
    }
}

struct NullDecoder;

impl DecoderSink for NullDecoder {
    fn process_packet(&self, _bytes: &[u8], _frames_lost: u32, _recovered: u32) -> ProcessOutcome {
        ProcessOutcome::Ok
    }
}

/// Short timeouts so the wake-settle/probe path in scenario 2 doesn't make
/// the test suite wait on spec.md §5's real 12s/22s budgets.
fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        session_init_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        bang_interval: Duration::from_millis(50),
        connection_lost_threshold: Duration::from_secs(30),
        wake_settle_delay: Duration::from_millis(20),
        wake_probe_interval: Duration::from_millis(10),
        wake_probe_count: 50,
        cache_ttl: Duration::from_secs(300),
        registration_attempt_cap: 3,
        stop_join_timeout: Duration::from_secs(1),
        control_tick_interval: Duration::from_millis(20),
        feeder_queue_depth: 8,
        default_host_request_port: 9295,
        max_control_payload: 1024,
    }
}

fn sample_registration(ip: &str) -> ConsoleRegistration {
    ConsoleRegistration::new(
        ip,
        "Living Room PS5",
        ConsoleTarget::Ps5V1,
        1,
        "8830739c",
        [9u8; 16],
        "nD1Ho0mY7wY=",
        true,
        true,
    )
    .unwrap()
}

fn has_header_terminator(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

/// Serves exactly one session-init POST, then one control-plane connection:
/// VERSION_REQ -> VERSION_RSP, optionally followed by a non-critical ERROR
/// quit frame, then drains the connection until the client tears it down.
async fn run_tcp_responder(listener: TcpListener, post_count: Arc<AtomicU32>, send_quit: bool) {
    let (mut session_init_sock, _) = match listener.accept().await {
        Ok(pair) => pair,
        Err(_) => return,
    };
    {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 512];
        while !has_header_terminator(&buf) {
            match session_init_sock.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        post_count.fetch_add(1, Ordering::SeqCst);
        let _ = session_init_sock
            .write_all(b"HTTP/1.1 200 OK\r\nRP-Session-Id: test-session-id\r\n\r\n")
            .await;
    }
    drop(session_init_sock);

    let (mut control_sock, _) = match listener.accept().await {
        Ok(pair) => pair,
        Err(_) => return,
    };

    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    let request = loop {
        if let Ok(Some((frame, consumed))) = ControlFrame::try_decode(&buf, 1024) {
            buf.drain(..consumed);
            break frame;
        }
        match control_sock.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };
    assert_eq!(request.message_type, MessageType::VersionReq);

    let rsp = ControlFrame::new(MessageType::VersionRsp, 0, b"console-v1".to_vec())
        .encode(1024)
        .unwrap();
    if control_sock.write_all(&rsp).await.is_err() {
        return;
    }

    if send_quit {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let quit = ControlFrame::new(MessageType::Error, 0, b"vendor_specific_glitch".to_vec())
            .encode(1024)
            .unwrap();
        if control_sock.write_all(&quit).await.is_err() {
            return;
        }
    }

    let mut sink = [0u8; 512];
    loop {
        match control_sock.read(&mut sink).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

/// Advertises STANDBY until a WAKEUP datagram is observed (or always READY,
/// for the already-awake scenarios), always carrying `host-request-port`.
async fn run_udp_responder(socket: UdpSocket, host_request_port: u16, ready_initially: bool) {
    let mut ready = ready_initially;
    let mut buf = [0u8; 2048];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        let text = String::from_utf8_lossy(&buf[..len]);
        if text.starts_with("WAKEUP") {
            ready = true;
        }
        let response = if ready {
            format!("HTTP/1.1 200 Ok\r\nhost-request-port:{host_request_port}\r\nhost-name:Test PS5\r\n\r\n")
        } else {
            format!("HTTP/1.1 620 Server Standby\r\nhost-request-port:{host_request_port}\r\n\r\n")
        };
        if socket.send_to(response.as_bytes(), from).await.is_err() {
            return;
        }
    }
}

struct FakeConsole {
    post_count: Arc<AtomicU32>,
    udp_task: tokio::task::JoinHandle<()>,
    tcp_task: tokio::task::JoinHandle<()>,
}

impl FakeConsole {
    /// Binds a TCP listener (session-init + control plane) and a UDP socket
    /// on the PS5 discovery/wake port (9302), wiring the TCP port into the
    /// UDP responder's `host-request-port` advertisement.
    async fn spawn(ready_initially: bool, send_quit: bool) -> Self {
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_port = tcp_listener.local_addr().unwrap().port();
        let post_count = Arc::new(AtomicU32::new(0));
        let tcp_task = tokio::spawn(run_tcp_responder(
            tcp_listener,
            Arc::clone(&post_count),
            send_quit,
        ));

        let udp_socket = UdpSocket::bind("127.0.0.1:9302").await.unwrap();
        let udp_task = tokio::spawn(run_udp_responder(udp_socket, tcp_port, ready_initially));

        Self {
            post_count,
            udp_task,
            tcp_task,
        }
    }

    /// Tears down both responder tasks and waits briefly so the UDP port is
    /// free again before the next scenario binds it.
    async fn shutdown(self) {
        self.udp_task.abort();
        self.tcp_task.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn build_machine(
    config: RuntimeConfig,
) -> (
    SessionMachine<MemoryStore, NullDecoder>,
    tokio::sync::mpsc::Receiver<rpsession::SessionEvent>,
) {
    let store = Arc::new(MemoryStore::default());
    store.save(sample_registration("127.0.0.1")).await.unwrap();
    let cache = Arc::new(RegistrationCache::new(store, config.cache_ttl));
    let discovery = Arc::new(
        DiscoveryEngine::bind(ConsoleTarget::Ps5V1, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let decoder = Arc::new(NullDecoder);
    SessionMachine::new(cache, discovery, decoder, config)
}

/// spec.md §8 scenario 1: console already READY. Exactly one session-init
/// POST is observed and the control plane negotiates its version before the
/// attempt reports success.
#[tokio::test]
async fn happy_path_reaches_authenticating_with_one_post() {
    init_tracing();
    let _guard = discovery_port_lock().lock().await;
    let console = FakeConsole::spawn(true, false).await;
    let (machine, _events) = build_machine(fast_config()).await;

    machine
        .start_attempt("127.0.0.1", "nD1Ho0mY7wY=")
        .await
        .unwrap();

    assert_eq!(machine.state(), SessionState::Authenticating);
    assert_eq!(console.post_count.load(Ordering::SeqCst), 1);
    let stats = machine.control_plane_stats().unwrap();
    assert_eq!(stats.negotiated_version.as_deref(), Some("console-v1"));

    machine.stop().await.unwrap();
    assert_eq!(machine.state(), SessionState::Idle);
    console.shutdown().await;
}

/// spec.md §8 scenario 2: console starts in STANDBY. The wake datagram
/// flips the fake console to READY mid-attempt and the rest of the sequence
/// proceeds exactly as the happy path, with still only one POST.
#[tokio::test]
async fn wake_path_wakes_standby_console_before_session_init() {
    init_tracing();
    let _guard = discovery_port_lock().lock().await;
    let console = FakeConsole::spawn(false, false).await;
    let (machine, _events) = build_machine(fast_config()).await;

    machine
        .start_attempt("127.0.0.1", "nD1Ho0mY7wY=")
        .await
        .unwrap();

    assert_eq!(machine.state(), SessionState::Authenticating);
    assert_eq!(console.post_count.load(Ordering::SeqCst), 1);

    machine.stop().await.unwrap();
    console.shutdown().await;
}

/// spec.md §8 scenario 5: a non-critical quit reason delivered during
/// AUTHENTICATING is logged and does not promote the session to ERROR.
#[tokio::test]
async fn non_critical_quit_during_setup_does_not_error() {
    init_tracing();
    let _guard = discovery_port_lock().lock().await;
    let console = FakeConsole::spawn(true, true).await;
    let (machine, _events) = build_machine(fast_config()).await;

    machine
        .start_attempt("127.0.0.1", "nD1Ho0mY7wY=")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(machine.state(), SessionState::Authenticating);

    machine.stop().await.unwrap();
    console.shutdown().await;
}

/// spec.md §8 scenario 4 (duplicate-POST prevention, partial): a session-init
/// failure (here, the fake console refusing the TCP connection outright)
/// surfaces as `Network` and leaves the machine ready for a fresh attempt
/// rather than stuck mid-attempt.
#[tokio::test]
async fn session_init_connection_refused_surfaces_network_error() {
    init_tracing();
    let _guard = discovery_port_lock().lock().await;
    // No fake console listening at all on the advertised port: bind and
    // immediately drop a listener to reserve a port number that nothing
    // accepts on, then advertise it.
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp_port = reserved.local_addr().unwrap().port();
    drop(reserved);

    let udp_socket = UdpSocket::bind("127.0.0.1:9302").await.unwrap();
    let udp_task = tokio::spawn(run_udp_responder(udp_socket, tcp_port, true));

    let (machine, _events) = build_machine(fast_config()).await;
    let err = machine
        .start_attempt("127.0.0.1", "nD1Ho0mY7wY=")
        .await
        .unwrap_err();
    assert_eq!(err.kind, rpsession::ErrorKind::Network);
    assert_eq!(machine.state(), SessionState::Error);

    machine.stop().await.unwrap();
    assert_eq!(machine.state(), SessionState::Idle);

    udp_task.abort();
    tokio::time::sleep(Duration::from_millis(20)).await;
}
