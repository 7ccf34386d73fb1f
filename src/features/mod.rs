//! Field encoders -- turn one flow field into a fixed-size numeric vector.
//!
//! Two families live here:
//! - stateless encoders (`ip`, `scale`) used by both the online and batch paths;
//! - the append-only [`LabelVocabulary`] that gives categorical labels a stable
//!   embedding row for the lifetime of the process.

pub mod ip;
pub mod scale;
pub mod vocab;

use thiserror::Error;

pub use ip::{encode_ip, IpMode, IP_FEATURE_SIZE};
pub use scale::{encode_bool, hash_encode, label_hash, normalize_numbers};
pub use vocab::{LabelKind, LabelVocabulary, VocabularyError};

/// Errors raised by the stateless field encoders.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The string is neither dotted-quad IPv4 nor colon-hex IPv6.
    #[error("invalid IP address format: {0:?}")]
    InvalidAddressFormat(String),
}
