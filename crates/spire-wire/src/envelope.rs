// Multipart client envelope: [ dest? ][ delimiter ][ command ][ id:4 ][ data ][ checksum:4 ].
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Correlation id reserved for one-part signal frames.
pub const SIGNAL_ID: u32 = u32::MAX;

// Double-SHA256 checksum over the data frame, compared little-endian.
pub fn checksum(data: &[u8]) -> u32 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    u32::from_le_bytes([second[0], second[1], second[2], second[3]])
}

/// Reply address for a client request: the router identity frame plus the
/// caller-chosen correlation id. Notifications re-use the route of the
/// subscription request that created them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub dest: Bytes,
    pub id: u32,
}

/// Decoded wire envelope.
///
/// ```
/// use bytes::Bytes;
/// use spire_wire::Envelope;
///
/// let request = Envelope::request("blockchain.fetch_last_height", 1, Bytes::new());
/// let parts = request.encode();
/// let decoded = Envelope::decode(&parts).expect("decode");
/// assert_eq!(decoded, request);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub dest: Option<Bytes>,
    pub command: String,
    pub id: u32,
    pub data: Bytes,
}

impl Envelope {
    // Dealer-side request constructor; the router prepends the identity.
    pub fn request(command: impl Into<String>, id: u32, data: Bytes) -> Self {
        Self {
            dest: None,
            command: command.into(),
            id,
            data,
        }
    }

    /// Build the reply to a request: same destination, command and id, new
    /// payload.
    pub fn reply(request: &Envelope, data: Bytes) -> Self {
        Self {
            dest: request.dest.clone(),
            command: request.command.clone(),
            id: request.id,
            data,
        }
    }

    /// Build a server-initiated notification addressed to a stored route.
    pub fn notification(route: &Route, command: impl Into<String>, data: Bytes) -> Self {
        Self {
            dest: Some(route.dest.clone()),
            command: command.into(),
            id: route.id,
            data,
        }
    }

    pub fn is_signal(&self) -> bool {
        self.id == SIGNAL_ID
    }

    pub fn route(&self) -> Route {
        Route {
            dest: self.dest.clone().unwrap_or_default(),
            id: self.id,
        }
    }

    /// Parse a multipart message.
    ///
    /// One part is a signal; five parts is a dealer-side message; six parts
    /// carries the router identity first. Anything else is rejected. The
    /// delimiter part is accepted either empty (current form) or as a single
    /// zero-sized-meaning byte (legacy peers emit `0x00`).
    pub fn decode(parts: &[Bytes]) -> Result<Self> {
        if parts.len() == 1 {
            return Ok(Self {
                dest: None,
                command: String::from_utf8_lossy(&parts[0]).into_owned(),
                id: SIGNAL_ID,
                data: Bytes::new(),
            });
        }
        if parts.len() != 5 && parts.len() != 6 {
            return Err(Error::BadFrame("unrecognized part count"));
        }

        let mut it = parts.iter();
        let dest = if parts.len() == 6 {
            Some(it.next().expect("dest part").clone())
        } else {
            None
        };

        let delimiter = it.next().expect("delimiter part");
        if delimiter.len() > 1 {
            return Err(Error::BadFrame("oversized delimiter"));
        }

        let command = String::from_utf8_lossy(it.next().expect("command part")).into_owned();

        let raw_id = it.next().expect("id part");
        if raw_id.len() != 4 {
            return Err(Error::BadFrame("correlation id must be 4 bytes"));
        }
        let id = u32::from_le_bytes([raw_id[0], raw_id[1], raw_id[2], raw_id[3]]);

        let data = it.next().expect("data part").clone();

        let raw_checksum = it.next().expect("checksum part");
        if raw_checksum.len() != 4 {
            return Err(Error::BadFrame("checksum must be 4 bytes"));
        }
        let wire = u32::from_le_bytes([
            raw_checksum[0],
            raw_checksum[1],
            raw_checksum[2],
            raw_checksum[3],
        ]);
        if wire != checksum(&data) {
            return Err(Error::BadChecksum);
        }

        Ok(Self {
            dest,
            command,
            id,
            data,
        })
    }

    /// Serialize to multipart form. The delimiter is emitted empty; decode
    /// accepts both the empty and the legacy one-byte form.
    pub fn encode(&self) -> Vec<Bytes> {
        let mut parts = Vec::with_capacity(6);
        if let Some(dest) = &self.dest {
            if !dest.is_empty() {
                parts.push(dest.clone());
            }
        }
        parts.push(Bytes::new());
        parts.push(Bytes::copy_from_slice(self.command.as_bytes()));
        parts.push(Bytes::copy_from_slice(&self.id.to_le_bytes()));
        parts.push(self.data.clone());
        parts.push(Bytes::copy_from_slice(&checksum(&self.data).to_le_bytes()));
        parts
    }
}
