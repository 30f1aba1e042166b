//! Headless, subject-based publish/subscribe bus with request-reply.
//!
//! Every [`Subscription`] owns a bounded [`tokio::sync::mpsc`] queue, so a
//! busy subscriber never costs another one messages. Subjects are dot-separated tokens
//! (`cio.intent.momentum`); subscriptions take NATS-style patterns:
//!
//! | Pattern | Matches |
//! |---|---|
//! | `signals.trading` | exactly that subject |
//! | `cio.intent.*` | one token after `cio.intent.` |
//! | `cio.intent.>` | one or more tokens after `cio.intent.` |
//!
//! Each live [`Subscription`] registers its pattern so that
//! [`SubjectBus::publish`] can report how many subscribers were interested,
//! and fail with [`BusError::NoSubscribers`] when nobody was.
//!
//! Delivery is lossless or refused: if any interested subscriber's queue is
//! full, `publish` delivers to nobody and returns [`BusError::SlowConsumer`],
//! leaving the retry decision with the producer.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use nurse_types::NurseError;

/// Default per-subscription queue capacity.
const DEFAULT_CAPACITY: usize = 4096;

/// Prefix of the private reply subjects created by [`SubjectBus::request`].
pub const INBOX_PREFIX: &str = "_INBOX";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("no subscribers for subject {0}")]
    NoSubscribers(String),
    #[error("subscriber {0} is not keeping up; message refused")]
    SlowConsumer(String),
    #[error("invalid subject or pattern: {0:?}")]
    InvalidSubject(String),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("message has no reply subject")]
    NoReplySubject,
    #[error("bus closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<BusError> for NurseError {
    fn from(e: BusError) -> Self {
        NurseError::Bus(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Headers and messages
// ---------------------------------------------------------------------------

/// Message headers. Keys are stored lowercase; values are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn with(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        Ok(raw.into_iter().collect())
    }
}

/// One unit of traffic on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply_to: Option<String>,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            reply_to: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Subject matching
// ---------------------------------------------------------------------------

/// A validated subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPattern {
    raw: String,
    tokens: Vec<String>,
}

impl SubjectPattern {
    /// # Errors
    ///
    /// [`BusError::InvalidSubject`] for empty tokens or a `>` that is not last.
    pub fn parse(raw: &str) -> Result<Self, BusError> {
        let tokens: Vec<String> = raw.split('.').map(str::to_string).collect();
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            if token.is_empty() || (token == ">" && i != last) {
                return Err(BusError::InvalidSubject(raw.to_string()));
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, subject: &str) -> bool {
        let mut parts = subject.split('.');
        for token in &self.tokens {
            match (token.as_str(), parts.next()) {
                (">", Some(_)) => return true,
                ("*", Some(_)) => {}
                (literal, Some(part)) if literal == part => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }
}

/// Concrete subjects must be non-empty tokens without wildcards.
fn validate_subject(subject: &str) -> Result<(), BusError> {
    let valid = subject
        .split('.')
        .all(|t| !t.is_empty() && t != "*" && t != ">");
    if valid {
        Ok(())
    } else {
        Err(BusError::InvalidSubject(subject.to_string()))
    }
}

// ---------------------------------------------------------------------------
// SubjectBus
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Route {
    pattern: SubjectPattern,
    sender: mpsc::Sender<Message>,
}

type Routes = RwLock<HashMap<u64, Route>>;

/// Shared bus handle. Clone it cheaply – all clones share the same routes.
#[derive(Clone, Debug)]
pub struct SubjectBus {
    routes: Arc<Routes>,
    capacity: usize,
    next_id: Arc<AtomicU64>,
}

impl SubjectBus {
    /// Create a new bus whose subscriptions buffer up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: Arc::default(),
            capacity: capacity.max(1),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Publish `message` to every subscription whose pattern matches.
    ///
    /// Returns the number of interested subscriptions.
    ///
    /// # Errors
    ///
    /// - [`BusError::InvalidSubject`] – the subject contains wildcards.
    /// - [`BusError::NoSubscribers`] – nobody is listening on the subject.
    /// - [`BusError::SlowConsumer`] – an interested subscriber's queue is
    ///   full; the message was delivered to nobody.
    pub fn publish(&self, message: Message) -> Result<usize, BusError> {
        validate_subject(&message.subject)?;
        // Exclusive, so no other publisher can fill a queue between the
        // capacity check and the sends below.
        let routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let targets: Vec<&Route> = routes
            .values()
            .filter(|r| r.pattern.matches(&message.subject))
            .collect();
        if targets.is_empty() {
            return Err(BusError::NoSubscribers(message.subject));
        }
        if let Some(full) = targets.iter().find(|r| r.sender.capacity() == 0) {
            warn!(pattern = %full.pattern.as_str(), subject = %message.subject, "subscriber queue full; publish refused");
            return Err(BusError::SlowConsumer(full.pattern.as_str().to_string()));
        }
        let mut delivered = 0;
        for route in targets {
            if route.sender.try_send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            return Err(BusError::NoSubscribers(message.subject));
        }
        Ok(delivered)
    }

    /// Convenience wrapper around [`publish`][Self::publish].
    pub fn publish_to(
        &self,
        subject: &str,
        headers: Headers,
        payload: impl Into<Vec<u8>>,
    ) -> Result<usize, BusError> {
        self.publish(Message::new(subject, payload).with_headers(headers))
    }

    /// Subscribe to every subject matching `pattern`.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidSubject`] when the pattern is malformed.
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        let pattern = SubjectPattern::parse(pattern)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Route {
                    pattern: pattern.clone(),
                    sender,
                },
            );
        Ok(Subscription {
            id,
            pattern,
            receiver,
            routes: Arc::downgrade(&self.routes),
        })
    }

    /// Publish a request and wait up to `timeout` for the first reply.
    ///
    /// # Errors
    ///
    /// - [`BusError::NoSubscribers`] – no responder is listening.
    /// - [`BusError::Timeout`] – nobody replied in time.
    pub async fn request(
        &self,
        subject: &str,
        headers: Headers,
        payload: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        let inbox = format!("{INBOX_PREFIX}.{}", Uuid::new_v4().simple());
        let mut replies = self.subscribe(&inbox)?;
        self.publish(
            Message::new(subject, payload)
                .with_headers(headers)
                .with_reply_to(inbox),
        )?;
        match tokio::time::timeout(timeout, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    /// Reply to `request` on its `reply_to` subject.
    ///
    /// # Errors
    ///
    /// [`BusError::NoReplySubject`] if the request did not ask for a reply,
    /// otherwise whatever [`publish`][Self::publish] returns.
    pub fn respond(
        &self,
        request: &Message,
        headers: Headers,
        payload: impl Into<Vec<u8>>,
    ) -> Result<usize, BusError> {
        let reply_to = request.reply_to.as_deref().ok_or(BusError::NoReplySubject)?;
        self.publish_to(reply_to, headers, payload)
    }

    /// Number of live subscriptions (all patterns).
    pub fn subscription_count(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for SubjectBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receives the messages whose subject matches one pattern.
///
/// Dropping the subscription withdraws its interest from the bus.
pub struct Subscription {
    id: u64,
    pattern: SubjectPattern,
    receiver: mpsc::Receiver<Message>,
    routes: Weak<Routes>,
}

impl Subscription {
    /// Wait for the next matching message.
    ///
    /// Returns `None` once every handle to the bus is gone and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(routes) = self.routes.upgrade() {
            routes
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}
