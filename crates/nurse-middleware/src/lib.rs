//! `nurse-middleware` – message plumbing for the governance gate.
//!
//! Moves bytes between producers, the gate and the execution engine without
//! caring what they mean.
//!
//! # Modules
//!
//! - [`bus`] – subject-based publish/subscribe bus with NATS-style wildcards
//!   and request-reply, with a bounded Tokio mpsc queue per subscription.
//! - [`trace`] – W3C trace-context extraction from message headers.
//! - [`ws_gateway`] – JSON-over-WebSocket access to the bus for
//!   out-of-process clients.

pub mod bus;
pub mod trace;
pub mod ws_gateway;

pub use bus::{BusError, Headers, Message, SubjectBus, SubjectPattern, Subscription};
pub use trace::{HeaderExtractor, extract_parent};
pub use ws_gateway::BusGateway;
