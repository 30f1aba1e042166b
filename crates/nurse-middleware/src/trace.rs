//! W3C trace-context plumbing for bus headers.
//!
//! Producers put `traceparent` (and optionally `tracestate`) into the message
//! headers. The gate never rewrites either value; it only reads them to parent
//! its own spans and echoes them on whatever it publishes.

use opentelemetry::Context;
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry_sdk::propagation::TraceContextPropagator;

use nurse_types::TraceContext;

use crate::bus::Headers;

pub const TRACEPARENT: &str = "traceparent";
pub const TRACESTATE: &str = "tracestate";

/// Read-only view of [`Headers`] for OpenTelemetry propagators.
pub struct HeaderExtractor<'a>(pub &'a Headers);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().collect()
    }
}

impl Headers {
    /// The inbound trace-context token, byte-for-byte.
    pub fn trace_context(&self) -> Option<TraceContext> {
        self.get(TRACEPARENT).map(|traceparent| TraceContext {
            traceparent: traceparent.to_string(),
            tracestate: self.get(TRACESTATE).map(str::to_string),
        })
    }
}

/// Remote parent context carried by `headers`.
///
/// Returns an empty context when no valid `traceparent` is present, so spans
/// built on it simply become new roots.
pub fn extract_parent(headers: &Headers) -> Context {
    TraceContextPropagator::new().extract(&HeaderExtractor(headers))
}
