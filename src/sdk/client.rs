use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cache::RegistrationCache;
use crate::config::RuntimeConfig;
use crate::control_plane::ControlPlaneStats;
use crate::credentials::CredentialStore;
use crate::discovery::{DiscoveryEngine, DiscoveryEvent};
use crate::error::Error;
use crate::feeder::{DecoderSink, FeederStats};
use crate::registration::{RegistrationEngine, RegistrationEvent, RegistrationTransport};
use crate::session::{SessionEvent, SessionMachine, SessionState};
use crate::target::ConsoleTarget;

/// No distinct error taxonomy is needed at this layer — every failure
/// already funnels through [`Error`] by the time it reaches the client.
pub type RemotePlayClientError = Error;

/// Bundles discovery, the registration cache, and one session machine
/// behind a small, capability-injected surface (spec.md §1).
///
/// `S` is the caller's credential store and `D` its decoder sink; both are
/// injected once at construction rather than resolved from global state.
pub struct RemotePlayClient<S: CredentialStore, D: DecoderSink> {
    cache: Arc<RegistrationCache<S>>,
    discovery: Arc<DiscoveryEngine>,
    session: SessionMachine<S, D>,
    config: RuntimeConfig,
}

impl<S, D> RemotePlayClient<S, D>
where
    S: CredentialStore + 'static,
    D: DecoderSink + 'static,
{
    /// Binds the discovery socket and wires up the cache and session
    /// machine. The returned receiver is the client's session event feed.
    pub async fn bind(
        target: ConsoleTarget,
        local_discovery_addr: SocketAddr,
        store: Arc<S>,
        decoder: Arc<D>,
        config: RuntimeConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), Error> {
        let discovery = Arc::new(DiscoveryEngine::bind(target, local_discovery_addr).await?);
        let cache = Arc::new(RegistrationCache::new(store, config.cache_ttl));
        let (session, events) = SessionMachine::new(Arc::clone(&cache), Arc::clone(&discovery), decoder, config);
        Ok((
            Self {
                cache,
                discovery,
                session,
                config,
            },
            events,
        ))
    }

    /// Broadcasts a discovery scan for `scan_timeout`, re-broadcasting every
    /// `interval`.
    pub async fn scan(
        &self,
        scan_timeout: Duration,
        interval: Duration,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, Error> {
        self.discovery.scan(scan_timeout, interval).await
    }

    pub async fn is_registered(&self, console_ip: &str) -> Result<bool, Error> {
        self.cache.is_registered(console_ip).await
    }

    /// Runs a bounded PIN-registration attempt and, on success, writes the
    /// canonicalised record into the cache so the next [`RemotePlayClient::start_streaming`]
    /// call finds it (spec.md §2 components D/E/I working together).
    pub async fn register<T: RegistrationTransport>(
        &self,
        console_ip: &str,
        target: ConsoleTarget,
        rp_key_type: u8,
        pin: &str,
        account_id_b64: &str,
        transport: T,
    ) -> Result<RegistrationEvent, Error> {
        let engine = RegistrationEngine::new(transport, self.config.registration_attempt_cap);
        let event = engine
            .register(console_ip, target, rp_key_type, pin, account_id_b64)
            .await;
        if let RegistrationEvent::Success(ref record) = event {
            self.cache.add_registration(record.clone()).await?;
        }
        Ok(event)
    }

    /// Starts a session attempt against an already-registered console
    /// (spec.md §4.F steps 1-9; see [`SessionMachine::start_attempt`]).
    pub async fn start_streaming(&self, console_ip: &str, account_id_b64: &str) -> Result<(), Error> {
        self.session.start_attempt(console_ip, account_id_b64).await
    }

    pub async fn stop_streaming(&self) -> Result<(), Error> {
        self.session.stop().await
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub async fn send_input(&self, payload: Vec<u8>) -> Result<(), Error> {
        self.session.send_input(payload).await
    }

    pub fn pause_streaming(&self) -> Result<(), Error> {
        self.session.pause_streaming()
    }

    pub fn resume_streaming(&self) -> Result<(), Error> {
        self.session.resume_streaming()
    }

    pub fn control_plane_stats(&self) -> Option<ControlPlaneStats> {
        self.session.control_plane_stats()
    }

    pub fn feeder_stats(&self) -> Option<FeederStats> {
        self.session.feeder_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ConsoleRegistration;
    use crate::feeder::ProcessOutcome;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

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
            self.records.lock().unwrap().insert(record.console_ip.clone(), record);
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

    struct AlwaysSucceeds;

    #[async_trait]
    impl RegistrationTransport for AlwaysSucceeds {
        async fn exchange(
            &self,
            _console_ip: &str,
            _pin: &str,
        ) -> Result<crate::registration::RawRegistrationResult, Error> {
            Ok(crate::registration::RawRegistrationResult {
                server_nickname: "Living Room PS5".into(),
                rp_regist_key: b"8830739c".to_vec(),
                rp_key: [4u8; crate::credentials::MORNING_LEN],
                console_pin: "12345678".into(),
            })
        }
    }

    #[tokio::test]
    async fn registering_populates_the_cache_for_streaming() {
        let (client, _events) = RemotePlayClient::bind(
            ConsoleTarget::Ps5V1,
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(MemoryStore::default()),
            Arc::new(NullDecoder),
            RuntimeConfig::default(),
        )
        .await
        .unwrap();

        assert!(!client.is_registered("192.168.1.50").await.unwrap());

        let event = client
            .register(
                "192.168.1.50",
                ConsoleTarget::Ps5V1,
                1,
                "12345678",
                "nD1Ho0mY7wY=",
                AlwaysSucceeds,
            )
            .await
            .unwrap();
        assert!(matches!(event, RegistrationEvent::Success(_)));
        assert!(client.is_registered("192.168.1.50").await.unwrap());
    }
}
