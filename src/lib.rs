//! `rpsession`: the session pipeline for a PlayStation remote-play client.
//!
//! Covers discovery/wake, PIN-driven registration, the encrypted
//! control/stream handshake, and the runtime control plane plus media
//! feeder that carry a session once it is live. Persistence, video/audio
//! decoding, and the actual PIN-exchange wire conversation are injected by
//! the surrounding application through the traits in [`credentials`],
//! [`registration`], and [`feeder`].

pub mod cache;
pub mod config;
pub mod control_plane;
pub mod credentials;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod feeder;
pub mod quit;
pub mod registration;
pub mod sdk;
pub mod session;
pub mod target;
pub mod wire;

pub use cache::{CacheStats, RegistrationCache};
pub use config::RuntimeConfig;
pub use control_plane::{ControlPlane, ControlPlaneEvent, ControlPlaneStats};
pub use credentials::{ConsoleRegistration, CredentialStore};
pub use crypto::{SessionKeys, StreamId};
pub use discovery::{DiscoveredConsole, DiscoveryEngine, DiscoveryEvent};
pub use error::{Error, ErrorKind};
pub use feeder::{DecoderSink, FeederStats, MediaFeeder, ProcessOutcome};
pub use quit::QuitReason;
pub use registration::{
    RawRegistrationResult, RegistrationEngine, RegistrationEvent, RegistrationFailure,
    RegistrationTransport,
};
pub use sdk::{RemotePlayClient, RemotePlayClientError};
pub use session::{SessionContext, SessionEvent, SessionMachine, SessionState};
pub use target::{ConsoleTarget, TargetConstants};
