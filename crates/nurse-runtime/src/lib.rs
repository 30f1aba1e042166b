//! `nurse-runtime` – the running gate.
//!
//! Wires the decision logic in `nurse-kernel` to the bus and the stores.
//!
//! # Modules
//!
//! - [`interceptor`] – [`Interceptor`]: consumes intents, judges them,
//!   publishes approved signals and queues one audit record per intent.
//! - [`heartbeat`] – [`HeartbeatResponder`]: request/reply liveness with
//!   concurrent dependency probes.
//! - [`policy_sync`] – [`PolicySync`]: applies pushed policy and regime
//!   updates to the cache.
//! - [`telemetry`] – `tracing` subscriber and OTLP export setup.

pub mod heartbeat;
pub mod interceptor;
pub mod policy_sync;
pub mod telemetry;

pub use heartbeat::{HeartbeatConfig, HeartbeatResponder};
pub use interceptor::{GateOutcome, Interceptor, InterceptorConfig};
pub use policy_sync::{DEFAULT_UPDATE_SUBJECT, PolicyAck, PolicySync, seed_from_json};
