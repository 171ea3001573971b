//! # Omerta Wire
//!
//! The envelope layer of the Omerta mesh: signed message carriers, the
//! payload tagged union, two interchangeable wire forms (canonical JSON
//! and a compact binary codec), the network-key cipher and the message-id
//! deduplication window.
//!
//! A datagram on the wire is `cipher(network_key, envelope_bytes)`; the
//! envelope bytes start with `{` for JSON or a version byte for binary,
//! and [`Envelope::decode`] tells them apart.

pub mod binary;
pub mod cipher;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod message;

// Re-export main types
pub use binary::{decode_binary, encode_binary, BINARY_VERSION};
pub use cipher::MessageCipher;
pub use dedup::{MessageDeduplicator, DEFAULT_DEDUP_TTL};
pub use envelope::{validate_channel, Envelope, CORE_CHANNEL, MAX_CHANNEL_LEN};
pub use error::{WireError, WireResult};
pub use message::{MeshMessage, MessageKind};
