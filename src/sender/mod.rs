//! Wire format of dispatched requests and the HTTP publisher transport.

pub mod envelope;
pub mod http;

pub use envelope::{AckCode, AckResponse, AckStatus, EnvelopeError, EventRecord, RequestEnvelope};
pub use http::{HttpPublisher, PublisherConfig};
