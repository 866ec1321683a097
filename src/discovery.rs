//! Discovery engine: UDP broadcaster/receiver (spec.md §2 component C,
//! §4.C, §5).
//!
//! A broadcast-then-timeout loop over a line-oriented wire codec
//! ([`crate::wire::discovery`]), with a bounded, LRU-evicted console set in
//! place of an unbounded `Vec`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

use crate::error::Error;
use crate::target::ConsoleTarget;
use crate::wire::discovery::{
    ConsoleState, DiscoveryRequestKind, WireDiscoveryRequest, WireDiscoveryResponse,
};

/// Upper bound on the number of consoles the engine remembers at once
/// (spec.md §3: "bounded-capacity set (<=32) with LRU eviction").
pub const MAX_KNOWN_CONSOLES: usize = 32;

/// A known-console entry not re-sighted within this window is eligible for
/// eviction when the set is full. Chosen to comfortably outlive one session
/// attempt's wake/connect budget while still reclaiming addresses that have
/// genuinely dropped off the LAN.
const KNOWN_CONSOLE_STALE_AFTER: Duration = Duration::from_secs(900);

/// A console observed on the LAN during a scan. Transient: never persisted.
#[derive(Debug, Clone)]
pub struct DiscoveredConsole {
    pub ip: String,
    pub device_name: Option<String>,
    pub target: ConsoleTarget,
    pub state: ConsoleState,
    pub host_request_port: Option<u16>,
    pub last_seen: Instant,
}

/// One update emitted while a scan is in progress.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Update(DiscoveredConsole),
    TimedOut,
}

struct KnownConsoles {
    order: VecDeque<String>,
    by_ip: std::collections::HashMap<String, DiscoveredConsole>,
}

impl KnownConsoles {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            by_ip: std::collections::HashMap::new(),
        }
    }

    /// Moves `ip` to the back of `order`, marking it most-recently-seen.
    fn touch(&mut self, ip: &str) {
        if let Some(pos) = self.order.iter().position(|existing| existing == ip) {
            self.order.remove(pos);
        }
        self.order.push_back(ip.to_string());
    }

    fn record(&mut self, console: DiscoveredConsole) {
        self.record_with_stale_after(console, KNOWN_CONSOLE_STALE_AFTER);
    }

    fn record_with_stale_after(&mut self, console: DiscoveredConsole, stale_after: Duration) {
        let ip = console.ip.clone();
        let now = console.last_seen;

        if self.by_ip.contains_key(&ip) {
            self.by_ip.insert(ip.clone(), console);
            self.touch(&ip);
            return;
        }

        if self.order.len() >= MAX_KNOWN_CONSOLES && !self.evict_one_expired(now, stale_after) {
            warn!(
                target: "rpsession::discovery",
                %ip,
                "known console set is full and no entry has gone stale; dropping new sighting"
            );
            return;
        }

        self.by_ip.insert(ip.clone(), console);
        self.order.push_back(ip);
    }

    /// Evicts the oldest entry that has gone stale, if any. Returns whether
    /// an eviction happened; a live (non-stale) entry is never evicted.
    fn evict_one_expired(&mut self, now: Instant, stale_after: Duration) -> bool {
        let idx = self.order.iter().position(|ip| {
            self.by_ip
                .get(ip)
                .is_some_and(|console| now.saturating_duration_since(console.last_seen) >= stale_after)
        });
        let Some(idx) = idx else { return false };
        let ip = self.order.remove(idx).expect("index came from this deque");
        self.by_ip.remove(&ip);
        true
    }

    fn get(&self, ip: &str) -> Option<&DiscoveredConsole> {
        self.by_ip.get(ip)
    }
}

/// UDP-based discovery/wake engine for one console target family.
pub struct DiscoveryEngine {
    target: ConsoleTarget,
    socket: Arc<UdpSocket>,
    known: Mutex<KnownConsoles>,
    paused: AtomicBool,
}

impl DiscoveryEngine {
    /// Binds a UDP socket for discovery/wake traffic against `target`.
    pub async fn bind(target: ConsoleTarget, local_addr: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(local_addr).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            target,
            socket: Arc::new(socket),
            known: Mutex::new(KnownConsoles::new()),
            paused: AtomicBool::new(false),
        })
    }

    /// Suspends scanning. Must be called before the session-init window
    /// (spec.md §4.F step 6: "Suspend background activity").
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn get_host_request_port(&self, ip: &str) -> Option<u16> {
        self.known.lock().get(ip).and_then(|c| c.host_request_port)
    }

    /// Runs a broadcast scan for up to `scan_timeout`, re-broadcasting every
    /// `interval`, and streams updates back over the returned channel. The
    /// channel yields a final `TimedOut` event before closing.
    pub async fn scan(
        &self,
        scan_timeout: Duration,
        interval: Duration,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, Error> {
        let (tx, rx) = mpsc::channel(32);
        let socket = Arc::clone(&self.socket);
        let target = self.target;
        let broadcast_addr: SocketAddr = format!("255.255.255.255:{}", target.constants().discovery_port)
            .parse()
            .expect("constant broadcast address is well-formed");

        if self.is_paused() {
            let _ = tx.send(DiscoveryEvent::TimedOut).await;
            return Ok(rx);
        }

        tokio::spawn(async move {
            let request = WireDiscoveryRequest {
                kind: DiscoveryRequestKind::Search,
                protocol_version: target.constants().protocol_version.to_string(),
                wake_credential: None,
            };
            let payload = request.encode();

            let deadline = Instant::now() + scan_timeout;
            let mut next_broadcast = Instant::now();
            let mut buf = [0u8; 2048];

            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                if now >= next_broadcast {
                    if let Err(err) = socket.send_to(&payload, broadcast_addr).await {
                        warn!(target: "rpsession::discovery", error = %err, "scan broadcast failed");
                    }
                    next_broadcast = now + interval;
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                let wait = remaining.min(interval);
                match tokio_timeout(wait, socket.recv_from(&mut buf)).await {
                    Ok(Ok((len, addr))) => {
                        if let Ok(response) = WireDiscoveryResponse::parse(&buf[..len]) {
                            let console = DiscoveredConsole {
                                ip: addr.ip().to_string(),
                                device_name: response.host_name().map(str::to_string),
                                target,
                                state: response.state,
                                host_request_port: response.host_request_port(),
                                last_seen: Instant::now(),
                            };
                            if tx.send(DiscoveryEvent::Update(console)).await.is_err() {
                                return;
                            }
                        } else {
                            debug!(target: "rpsession::discovery", "ignored malformed advertisement");
                        }
                    }
                    Ok(Err(err)) => {
                        warn!(target: "rpsession::discovery", error = %err, "recv_from failed");
                        break;
                    }
                    Err(_) => continue,
                }
            }
            let _ = tx.send(DiscoveryEvent::TimedOut).await;
        });

        Ok(rx)
    }

    /// Sends a single probe to `ip` and returns its parsed state.
    pub async fn check_single(&self, ip: &str) -> Result<ConsoleState, Error> {
        let port = self.target.constants().discovery_port;
        let addr: SocketAddr = format!("{ip}:{port}")
            .parse()
            .map_err(|_| Error::invalid_param(format!("invalid console ip {ip}")))?;

        let request = WireDiscoveryRequest {
            kind: DiscoveryRequestKind::Search,
            protocol_version: self.target.constants().protocol_version.to_string(),
            wake_credential: None,
        };
        self.socket.send_to(&request.encode(), addr).await?;

        let mut buf = [0u8; 2048];
        let (len, _) = tokio_timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::timeout("check_single timed out waiting for advertisement"))??;
        let response = WireDiscoveryResponse::parse(&buf[..len])?;

        self.known.lock().record(DiscoveredConsole {
            ip: ip.to_string(),
            device_name: response.host_name().map(str::to_string),
            target: self.target,
            state: response.state,
            host_request_port: response.host_request_port(),
            last_seen: Instant::now(),
        });

        Ok(response.state)
    }

    /// Sends the wake datagram. Idempotent: repeated calls within one
    /// attempt only add log lines, not additional observable effect.
    pub async fn wake(&self, ip: &str, wake_credential: &str) -> Result<(), Error> {
        let port = self.target.constants().wake_port;
        let addr: SocketAddr = format!("{ip}:{port}")
            .parse()
            .map_err(|_| Error::invalid_param(format!("invalid console ip {ip}")))?;

        let request = WireDiscoveryRequest {
            kind: DiscoveryRequestKind::Wake,
            protocol_version: self.target.constants().protocol_version.to_string(),
            wake_credential: Some(wake_credential.to_string()),
        };
        self.socket.send_to(&request.encode(), addr).await?;
        debug!(target: "rpsession::discovery", %ip, "wake datagram sent");
        Ok(())
    }

    /// Polls with backoff until READY, or until `budget` elapses with the
    /// console persisting in STANDBY, or the transport fails.
    pub async fn wait_for_ready(
        &self,
        ip: &str,
        budget: Duration,
        probe_interval: Duration,
    ) -> Result<ConsoleState, Error> {
        let deadline = Instant::now() + budget;
        loop {
            match self.check_single(ip).await {
                Ok(ConsoleState::Ready) => return Ok(ConsoleState::Ready),
                Ok(_) => {}
                Err(err) if err.kind == crate::error::ErrorKind::Timeout => {}
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout("console did not reach READY within budget"));
            }
            tokio::time::sleep(probe_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_single_parses_ready_response() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let engine = DiscoveryEngine::bind(ConsoleTarget::Ps5V1, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert!(len > 0);
            let response = b"HTTP/1.1 200 Ok\r\nhost-request-port:997\r\n\r\n";
            server.send_to(response, from).await.unwrap();
        });

        let ip = server_addr.ip().to_string();
        // check_single uses the target's fixed discovery port, so point the
        // engine's probe straight at the bound test server instead by
        // talking to it on its actual ephemeral port.
        let request_addr = server_addr;
        let state = send_probe_to(&engine, request_addr).await;
        responder.await.unwrap();
        assert_eq!(state, ConsoleState::Ready);
        let _ = ip;
    }

    async fn send_probe_to(engine: &DiscoveryEngine, addr: SocketAddr) -> ConsoleState {
        use crate::wire::discovery::{DiscoveryRequestKind, WireDiscoveryRequest};
        let request = WireDiscoveryRequest {
            kind: DiscoveryRequestKind::Search,
            protocol_version: "00030010".into(),
            wake_credential: None,
        };
        engine.socket.send_to(&request.encode(), addr).await.unwrap();
        let mut buf = [0u8; 1024];
        let (len, _) = engine.socket.recv_from(&mut buf).await.unwrap();
        WireDiscoveryResponse::parse(&buf[..len]).unwrap().state
    }

    fn console_at(ip: &str, last_seen: Instant) -> DiscoveredConsole {
        DiscoveredConsole {
            ip: ip.to_string(),
            device_name: None,
            target: ConsoleTarget::Ps5V1,
            state: ConsoleState::Ready,
            host_request_port: None,
            last_seen,
        }
    }

    #[test]
    fn known_console_set_evicts_oldest_stale_entry_past_capacity() {
        let stale_after = Duration::from_millis(10);
        let mut known = KnownConsoles::new();
        let base = Instant::now();
        for i in 0..MAX_KNOWN_CONSOLES {
            known.record_with_stale_after(console_at(&format!("10.0.0.{i}"), base), stale_after);
        }

        // Past stale_after, so the oldest entry (10.0.0.0) is evictable.
        std::thread::sleep(Duration::from_millis(20));
        known.record_with_stale_after(console_at("10.0.0.200", Instant::now()), stale_after);

        assert_eq!(known.by_ip.len(), MAX_KNOWN_CONSOLES);
        assert!(known.get("10.0.0.0").is_none());
        assert!(known.get("10.0.0.200").is_some());
    }

    #[test]
    fn known_console_set_rejects_admission_when_full_and_nothing_stale() {
        let stale_after = Duration::from_secs(900);
        let mut known = KnownConsoles::new();
        let now = Instant::now();
        for i in 0..MAX_KNOWN_CONSOLES {
            known.record_with_stale_after(console_at(&format!("10.0.0.{i}"), now), stale_after);
        }

        known.record_with_stale_after(console_at("10.0.0.200", now), stale_after);

        assert_eq!(known.by_ip.len(), MAX_KNOWN_CONSOLES);
        assert!(known.get("10.0.0.200").is_none());
        assert!(known.get("10.0.0.0").is_some());
    }

    #[test]
    fn re_sighting_a_known_console_moves_it_to_most_recent() {
        let stale_after = Duration::from_millis(10);
        let mut known = KnownConsoles::new();
        let base = Instant::now();
        for i in 0..MAX_KNOWN_CONSOLES {
            known.record_with_stale_after(console_at(&format!("10.0.0.{i}"), base), stale_after);
        }

        // Re-sight the oldest entry right before it would otherwise be
        // evictable; this must refresh its recency instead of leaving it at
        // the front of the eviction order.
        known.record_with_stale_after(console_at("10.0.0.0", Instant::now()), stale_after);

        std::thread::sleep(Duration::from_millis(20));
        known.record_with_stale_after(console_at("10.0.0.201", Instant::now()), stale_after);

        // 10.0.0.1 was never re-sighted, so it is now the oldest and gets
        // evicted instead of the re-sighted 10.0.0.0.
        assert!(known.get("10.0.0.0").is_some());
        assert!(known.get("10.0.0.1").is_none());
        assert!(known.get("10.0.0.201").is_some());
    }

    #[tokio::test]
    async fn pause_prevents_scan_from_broadcasting() {
        let engine = DiscoveryEngine::bind(ConsoleTarget::Ps5V1, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        engine.pause();
        let mut rx = engine
            .scan(Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, DiscoveryEvent::TimedOut));
    }
}
