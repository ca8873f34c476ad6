//! Purpose: Encode/decode the self-length-prefixed binary record ("protein") format.
//! Exports: `Protein`, `PROTEIN_TAG`, `wire_len`, `span`.
//! Role: The storage engine treats record contents as opaque; it only needs
//! Role: "how long is the record at this position" and "is this plausibly one".
//! Invariants: Encoded length always fits 48 bits and is at least the descriptor.
//! Invariants: `span` is the 8-aligned footprint; `wire_len` is the exact length.

use crate::core::error::{Error, ErrorKind};

/// Top 16 bits of the descriptor word.
pub const PROTEIN_TAG: u64 = 0x50EE;

const LEN_MASK: u64 = (1 << 48) - 1;
pub const DESCRIPTOR_LEN: u64 = 8;
pub const MAX_PROTEIN_LEN: u64 = LEN_MASK;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Protein {
    payload: Vec<u8>,
}

impl Protein {
    pub fn from_payload(payload: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let payload = payload.into();
        if payload.len() as u64 > MAX_PROTEIN_LEN - DESCRIPTOR_LEN {
            return Err(Error::new(ErrorKind::TooBig).with_message("record payload exceeds 48-bit length"));
        }
        Ok(Self { payload })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Exact encoded length in bytes, descriptor included, before padding.
    pub fn wire_len(&self) -> u64 {
        DESCRIPTOR_LEN + self.payload.len() as u64
    }

    /// On-disk footprint: wire length rounded up to the 8-byte grid.
    pub fn span(&self) -> u64 {
        align8(self.wire_len())
    }

    pub fn encode(&self) -> Vec<u8> {
        let descriptor = (PROTEIN_TAG << 48) | self.wire_len();
        let mut out = Vec::with_capacity(self.span() as usize);
        out.extend_from_slice(&descriptor.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.resize(self.span() as usize, 0u8);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let wire = decode_descriptor_bytes(buf)?;
        if buf.len() < wire as usize {
            return Err(Error::new(ErrorKind::Corrupt).with_message("record truncated"));
        }
        Ok(Self {
            payload: buf[DESCRIPTOR_LEN as usize..wire as usize].to_vec(),
        })
    }
}

/// Parse a descriptor word into the exact wire length, rejecting anything
/// that cannot be a record.
pub fn decode_descriptor(word: u64) -> Result<u64, Error> {
    if word >> 48 != PROTEIN_TAG {
        return Err(Error::new(ErrorKind::Corrupt).with_message("bad record descriptor tag"));
    }
    let wire = word & LEN_MASK;
    if wire < DESCRIPTOR_LEN {
        return Err(Error::new(ErrorKind::Corrupt).with_message("record length below descriptor size"));
    }
    Ok(wire)
}

fn decode_descriptor_bytes(buf: &[u8]) -> Result<u64, Error> {
    if buf.len() < DESCRIPTOR_LEN as usize {
        return Err(Error::new(ErrorKind::Corrupt).with_message("record descriptor truncated"));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[..8]);
    decode_descriptor(u64::from_le_bytes(word))
}

pub fn align8(len: u64) -> u64 {
    (len + 7) & !7
}
