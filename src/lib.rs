//! # Brivas TCAP
//!
//! Production-ready implementation of the Transaction Capabilities
//! Application Part (ITU-T Q.771-Q.775):
//!
//! - **Messages** - Begin / Continue / End / Abort framing
//! - **Dialogue** - application-context negotiation (AARQ / AARE / ABRT)
//! - **Components** - Invoke, ReturnResult, ReturnError, Reject
//! - **Transactions** - concurrent transaction manager with invocation
//!   timers, driving both the initiating and responding sides
//!
//! Operation parameter codecs plug in through the [`registry`], and the
//! underlying datagram transport (SCCP connectionless service or an
//! equivalent) plugs in through the [`transport::Transport`] trait.
//!
//! ## Example
//! ```rust,ignore
//! use brivas_tcap::{TcapConfig, TcapEndpoint};
//!
//! let endpoint = TcapEndpoint::new(transport, registry, TcapConfig::default());
//!
//! // open a dialogue and wait for the peer's answer
//! let (dialogue, components, terminal) =
//!     endpoint.begin(context, peer, vec![invoke]).await?;
//! ```

pub mod asn1;
pub mod components;
pub mod config;
pub mod dialogue;
pub mod errors;
pub mod messages;
pub mod registry;
pub mod transaction;
pub mod transport;
pub mod types;

// Re-exports
pub use components::Component;
pub use config::TcapConfig;
pub use dialogue::{AbortSource, DialoguePdu, DialogueResult, Diagnostic, DiagnosticSource};
pub use errors::{DecodeError, Result, TcapError, TransportError};
pub use messages::{AbortCause, TcapMessage};
pub use registry::OperationRegistry;
pub use transaction::{
    ComponentHandler, Continuation, ContinuationEvent, DialogueHook, HandlerReply,
    ResponderHandle, TcapDialogue, TcapEndpoint,
};
pub use transport::{Direction, TraceHook, Transport};
pub use types::{
    ApplicationContext, PeerAddress, Problem, ProblemCategory, ProtocolCause, TransactionId,
};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Subsystem Numbers commonly addressed above this layer
pub mod ssn {
    pub const HLR: u8 = 6;
    pub const VLR: u8 = 7;
    pub const MSC: u8 = 8;
    pub const SMSC: u8 = 8;
    pub const GSMSCF: u8 = 147;
    pub const USSD: u8 = 147;
}
