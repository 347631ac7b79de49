//! Event envelope and wire codec.
//!
//! Every message that travels over the bus is an [`Event`]: an opaque payload,
//! a type tag collaborators use for routing, and a publish-time timestamp.
//!
//! # Wire Format
//!
//! ```text
//! ┌─────────┬──────────────────────────────────────────┐
//! │ version │ bincode(Event { event_type, payload, ts })│
//! │ 1 byte  │                                          │
//! └─────────┴──────────────────────────────────────────┘
//! ```
//!
//! The leading version byte lets the envelope layout evolve: decoders reject
//! versions they do not understand instead of misreading them.
//!
//! # Evolving the Envelope
//!
//! The bincode body is positional, so any change to [`Event`]'s fields needs
//! a new version. A new version gets its own arm in [`Event::decode`] and an
//! entry in [`SUPPORTED_VERSIONS`]; the version-1 arm stays so that records
//! already on the broker, and producers not yet upgraded, keep decoding.
//! [`CODEC_VERSION`] is bumped only after every consumer decodes the new
//! version.
//!
//! Payloads are
//! opaque to the bus; [`Event::with_data`] and [`Event::data`] are helpers for
//! the common case of a bincode-encoded domain struct.
//!
//! # Example
//!
//! ```
//! use spider_bus_core::event::Event;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct PageFetched {
//!     url: String,
//!     status: u16,
//! }
//!
//! let event = Event::with_data(
//!     "PageFetched",
//!     &PageFetched { url: "https://example.com".to_string(), status: 200 },
//! ).unwrap();
//!
//! let bytes = event.encode().unwrap();
//! let decoded = Event::decode(&bytes).unwrap();
//! let page: PageFetched = decoded.data().unwrap();
//! assert_eq!(page.status, 200);
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Current envelope format version written by [`Event::encode`].
pub const CODEC_VERSION: u8 = 1;

/// Envelope versions [`Event::decode`] accepts.
pub const SUPPORTED_VERSIONS: &[u8] = &[1];

/// Error types for event encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize an event or payload to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize an event or payload from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The envelope was written by a codec version this build cannot read.
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    /// The buffer holds no bytes at all.
    #[error("Empty event buffer")]
    Empty,
}

/// Event envelope exchanged between spiders and downloader agents.
///
/// `timestamp_millis` is owned by the publisher: whatever the caller puts
/// there is overwritten with the wall-clock time at send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Type tag used by collaborators to route the payload (e.g. `"Request"`).
    pub event_type: String,

    /// Opaque serialized payload.
    pub payload: Vec<u8>,

    /// Publish time in milliseconds since the Unix epoch.
    pub timestamp_millis: i64,
}

impl Event {
    /// Create a new event with an unset timestamp.
    ///
    /// # Examples
    ///
    /// ```
    /// use spider_bus_core::event::Event;
    ///
    /// let event = Event::new("Heartbeat", vec![1, 2, 3]);
    /// assert_eq!(event.timestamp_millis, 0);
    /// ```
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp_millis: 0,
        }
    }

    /// Create an event whose payload is the bincode encoding of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if `data` cannot be serialized.
    pub fn with_data<T: Serialize>(
        event_type: impl Into<String>,
        data: &T,
    ) -> Result<Self, EventError> {
        let payload =
            bincode::serialize(data).map_err(|e| EventError::SerializationError(e.to_string()))?;
        Ok(Self::new(event_type, payload))
    }

    /// Decode the payload as a bincode-encoded `T`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the payload does not
    /// hold a `T`.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        bincode::deserialize(&self.payload)
            .map_err(|e| EventError::DeserializationError(e.to_string()))
    }

    /// Encode the envelope into its wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the envelope cannot be
    /// serialized.
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        let body =
            bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))?;
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(CODEC_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode an envelope from its wire representation.
    ///
    /// # Errors
    ///
    /// - [`EventError::Empty`] for a zero-length buffer
    /// - [`EventError::UnsupportedVersion`] for an unknown version byte
    /// - [`EventError::DeserializationError`] for a corrupt body
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        let Some((&version, body)) = bytes.split_first() else {
            return Err(EventError::Empty);
        };

        match version {
            1 => Self::decode_v1(body),
            other => Err(EventError::UnsupportedVersion(other)),
        }
    }

    fn decode_v1(body: &[u8]) -> Result<Self, EventError> {
        bincode::deserialize(body).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event {{ type: {}, size: {} bytes, timestamp: {} }}",
            self.event_type,
            self.payload.len(),
            self.timestamp_millis
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Request {
        url: String,
        depth: u32,
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if serialization fails
    fn encoded_envelope_starts_with_version() {
        let event = Event::new("Request", vec![7, 8, 9]);
        let bytes = event.encode().expect("encoding should succeed");

        assert_eq!(bytes[0], CODEC_VERSION);
        assert_eq!(Event::decode(&bytes), Ok(event));
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if serialization fails
    fn typed_payload_survives_the_envelope() {
        let request = Request {
            url: "https://example.com/a".to_string(),
            depth: 2,
        };
        let mut event = Event::with_data("Request", &request).expect("payload should encode");
        event.timestamp_millis = 1_700_000_000_000;

        let decoded = Event::decode(&event.encode().expect("encoding should succeed"))
            .expect("decoding should succeed");

        assert_eq!(decoded.timestamp_millis, 1_700_000_000_000);
        assert_eq!(decoded.data::<Request>(), Ok(request));
    }

    #[test]
    fn version_one_records_keep_decoding() {
        // A version-1 record as written to the broker.
        let record = [
            1, // version
            4, 0, 0, 0, 0, 0, 0, 0, b'P', b'i', b'n', b'g', // event_type
            2, 0, 0, 0, 0, 0, 0, 0, 1, 2, // payload
            5, 0, 0, 0, 0, 0, 0, 0, // timestamp_millis
        ];

        let decoded = Event::decode(&record);

        assert_eq!(
            decoded,
            Ok(Event {
                event_type: "Ping".to_string(),
                payload: vec![1, 2],
                timestamp_millis: 5,
            })
        );
        assert!(SUPPORTED_VERSIONS.contains(&1));
        assert!(SUPPORTED_VERSIONS.contains(&CODEC_VERSION));
    }

    #[test]
    fn decode_rejects_empty_buffer() {
        assert_eq!(Event::decode(&[]), Err(EventError::Empty));
    }

    #[test]
    fn decode_rejects_unknown_version() {
        assert_eq!(
            Event::decode(&[42, 0, 0]),
            Err(EventError::UnsupportedVersion(42))
        );
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let result = Event::decode(&[CODEC_VERSION, 200]);
        assert!(matches!(result, Err(EventError::DeserializationError(_))));
    }

    #[test]
    fn event_display() {
        let event = Event::new("Response", vec![1, 2, 3, 4, 5]);

        let display = format!("{event}");
        assert!(display.contains("Response"));
        assert!(display.contains("5 bytes"));
    }
}
