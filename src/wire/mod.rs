//! Stateless wire codecs (spec.md §4.A / §6).
//!
//! Every codec here is a pure function pair: no sockets, no state, no
//! allocation beyond the declared payload size. Transport components
//! (`discovery`, `control_plane`, `feeder`) own the sockets and call into
//! these codecs.

pub mod control;
pub mod discovery;
pub mod session_init;
pub mod stream;

pub use control::{ControlFrame, MessageType};
pub use discovery::{ConsoleState, DiscoveryRequestKind, WireDiscoveryRequest, WireDiscoveryResponse};
pub use session_init::{build_session_init_request, parse_session_init_response};
pub use stream::StreamSampleHeader;
