//! Core value types: subjects, sequences, timestamps and messages.

use crate::error::{HandlerError, Result, StreamError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved subject type for synthetic "caught up" control messages.
pub const CAUGHT_UP: &str = "caughtup";

/// Position of a message in a durable domain log.
///
/// Zero means "not assigned", which is always the case for messages that
/// travel over an in-process stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }

    pub fn is_assigned(self) -> bool {
        self.0 > 0
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A `domain[:type]` name.
///
/// The domain routes a message to a transport and its subscriptions; the type
/// is only used for consumer-side filtering. A subject always formats back to
/// exactly the text it was parsed from.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subject {
    domain: String,
    kind: String,
}

impl Subject {
    /// Build a subject from its parts, validating the canonical form.
    pub fn new(domain: impl Into<String>, kind: impl Into<String>) -> Result<Self> {
        let domain = domain.into();
        let kind = kind.into();
        let input = if kind.is_empty() {
            domain.clone()
        } else {
            format!("{}:{}", domain, kind)
        };
        let subject = Self::canonical(&domain, &kind);
        if subject.domain.is_empty() || subject.domain.contains(':') || subject.to_string() != input {
            return Err(StreamError::InvalidSubject(input));
        }
        Ok(subject)
    }

    /// Domain-only subject (interest in every type of the domain).
    pub fn domain_only(domain: impl Into<String>) -> Result<Self> {
        Self::new(domain, "")
    }

    /// Parse `domain` or `domain:type`.
    pub fn parse(s: &str) -> Result<Self> {
        let (domain, kind) = match s.split_once(':') {
            Some((domain, kind)) => (domain, kind),
            None => (s, ""),
        };
        let subject = Self::canonical(domain, kind);
        if subject.domain.is_empty() || subject.to_string() != s {
            return Err(StreamError::InvalidSubject(s.to_string()));
        }
        Ok(subject)
    }

    /// Validate a bare domain name as used by streams and the mux.
    pub fn validate_domain(domain: &str) -> Result<()> {
        let subject = Self::parse(domain)?;
        if !subject.kind.is_empty() {
            return Err(StreamError::InvalidSubject(domain.to_string()));
        }
        Ok(())
    }

    fn canonical(domain: &str, kind: &str) -> Self {
        Self {
            domain: domain.trim().to_string(),
            kind: kind.trim().to_string(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The type part; empty for domain-only subjects.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_caught_up(&self) -> bool {
        self.kind == CAUGHT_UP
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_empty() {
            write!(f, "{}", self.domain)
        } else {
            write!(f, "{}:{}", self.domain, self.kind)
        }
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subject({})", self)
    }
}

impl FromStr for Subject {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Subject {
    type Error = StreamError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        subject.to_string()
    }
}

/// A message travelling through a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    subject: Subject,
    sequence: Sequence,
    time: Timestamp,
    body: Vec<u8>,
    meta: Vec<u8>,
}

impl Message {
    /// Create an empty message for a subject, stamped with the current time.
    pub fn new(subject: Subject) -> Self {
        Self {
            subject,
            sequence: Sequence::default(),
            time: Timestamp::now(),
            body: Vec::new(),
            meta: Vec::new(),
        }
    }

    /// Create a message with raw body bytes.
    pub fn raw(subject: Subject, body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::new(subject)
        }
    }

    /// Create a message with a JSON body.
    pub fn json(subject: Subject, body: &impl Serialize) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self::raw(subject, serde_json::to_vec(body)?))
    }

    /// The synthetic control message announcing that `domain` is caught up.
    pub fn caught_up(domain: &str) -> Result<Self> {
        Ok(Self::new(Subject::new(domain, CAUGHT_UP)?))
    }

    /// Attach raw meta bytes.
    pub fn with_meta(mut self, meta: Vec<u8>) -> Self {
        self.meta = meta;
        self
    }

    /// Attach JSON meta.
    pub fn with_json_meta(mut self, meta: &impl Serialize) -> std::result::Result<Self, serde_json::Error> {
        self.meta = serde_json::to_vec(meta)?;
        Ok(self)
    }

    pub fn with_time(mut self, time: Timestamp) -> Self {
        self.time = time;
        self
    }

    /// Sequences are owned by transports.
    pub(crate) fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn domain(&self) -> &str {
        self.subject.domain()
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn time(&self) -> Timestamp {
        self.time
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn meta(&self) -> &[u8] {
        &self.meta
    }

    /// True for the synthetic caught-up marker.
    pub fn is_caught_up(&self) -> bool {
        self.subject.is_caught_up()
    }

    /// Decode the body as JSON.
    pub fn decode_body<T: DeserializeOwned>(&self) -> std::result::Result<T, HandlerError> {
        serde_json::from_slice(&self.body).map_err(|e| HandlerError::Decode(e.to_string()))
    }

    /// Decode the meta as JSON.
    pub fn decode_meta<T: DeserializeOwned>(&self) -> std::result::Result<T, HandlerError> {
        serde_json::from_slice(&self.meta).map_err(|e| HandlerError::Decode(e.to_string()))
    }

    pub(crate) fn into_parts(self) -> (Subject, Timestamp, Vec<u8>, Vec<u8>) {
        (self.subject, self.time, self.body, self.meta)
    }
}
