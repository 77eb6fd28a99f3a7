//! Kaisha session runtime
//!
//! Runs a [`kaisha_cache::ReconcileDriver`] inside a tokio actor and wires it
//! to a [`CompanyTransport`]: mutations go out as round trips, push events
//! come in through a forwarder task, and observers watch [`SessionEvent`]s.
//!
//! [`MemoryServer`] is an in-process transport with fault injection, used by
//! the tests and the `kaisha` CLI.

pub mod config;
pub mod constants;
pub mod events;
pub mod memory;
pub mod session;
pub mod transport;

pub use config::{ConfigError, SessionConfig};
pub use events::{SessionEvent, SessionStatus};
pub use memory::{Fault, MemoryServer};
pub use session::{SessionError, SessionHandle, spawn_session};
pub use transport::{CompanyTransport, TransportError};
