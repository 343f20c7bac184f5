// Wire contract for the query service: the multipart client envelope, the
// stable reply codes, bit-prefix filters and the per-command payload codecs.
//
// Everything in this crate is part of the protocol a client sees. Byte
// layouts here must not change without a protocol version bump.

mod code;
mod envelope;
pub mod payload;
mod prefix;

pub use code::ErrorCode;
pub use envelope::{checksum, Envelope, Route, SIGNAL_ID};
pub use prefix::BitPrefix;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("bad frame: {0}")]
    BadFrame(&'static str),
    #[error("payload checksum mismatch")]
    BadChecksum,
}
