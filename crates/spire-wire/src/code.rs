// Stable reply codes shared with clients.
use std::fmt;

/// Error code carried in the first four bytes of every reply payload.
///
/// The numeric values are part of the wire contract and are serialized
/// little-endian.
///
/// ```
/// use spire_wire::ErrorCode;
///
/// assert_eq!(ErrorCode::NotFound.to_bytes(), [0x02, 0x00, 0x00, 0x00]);
/// assert_eq!(ErrorCode::from_u32(0), Some(ErrorCode::Success));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    BadStream = 1,
    NotFound = 2,
    BadChecksum = 3,
    PeerGone = 4,
    SubscriptionLimit = 5,
    ValidationError = 6,
    ServiceStopped = 7,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    // Little-endian wire form, ready to prepend to a reply payload.
    pub fn to_bytes(self) -> [u8; 4] {
        (self as u32).to_le_bytes()
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Success,
            1 => Self::BadStream,
            2 => Self::NotFound,
            3 => Self::BadChecksum,
            4 => Self::PeerGone,
            5 => Self::SubscriptionLimit,
            6 => Self::ValidationError,
            7 => Self::ServiceStopped,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::BadStream => "bad_stream",
            Self::NotFound => "not_found",
            Self::BadChecksum => "bad_checksum",
            Self::PeerGone => "peer_gone",
            Self::SubscriptionLimit => "subscription_limit",
            Self::ValidationError => "validation_error",
            Self::ServiceStopped => "service_stopped",
        };
        write!(f, "{name}")
    }
}
