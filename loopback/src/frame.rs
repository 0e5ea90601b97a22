//! In-memory frame layout shared by every device.
//!
//! A frame is a 6-byte destination, a 6-byte source, a big-endian ethertype, and a payload. Frames
//! shorter than [MIN_FRAME_LEN] are zero-padded on submission.

use crate::Error;
use std::{borrow::Cow, fmt};

/// Length of the hardware-address header (destination, source, ethertype).
pub const HEADER_LEN: usize = 14;

/// Minimum length of a frame on the medium (excluding any trailer).
pub const MIN_FRAME_LEN: usize = 60;

/// Maximum length of a frame on the medium (header plus a 1500-byte payload).
pub const MAX_FRAME_LEN: usize = 1514;

/// Ethertype of an IPv4 payload.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// Minimum length of an IPv4 header (no options).
const IPV4_HEADER_LEN: usize = 20;

/// Offset of the checksum within an IPv4 header.
const IPV4_CHECKSUM: usize = 10;

/// Offset of the source address within an IPv4 header.
const IPV4_SOURCE: usize = 12;

/// Offset of the destination address within an IPv4 header.
const IPV4_DESTINATION: usize = 16;

/// A 6-byte hardware address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 6]);

impl Address {
    /// The address of a device that has never been opened.
    pub const ZERO: Self = Self([0; 6]);

    /// Create an address from raw bytes.
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Derive the address assigned to the device at `index` when it is opened.
    ///
    /// The first octet is locally administered and unicast, so the address can never be mistaken
    /// for a multicast group.
    pub fn for_index(index: usize) -> Self {
        let [a, b, c, d] = (index as u32).to_be_bytes();
        Self([0x02, 0x00, a, b, c, d])
    }

    /// Raw bytes of the address.
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub destination: Address,
    pub source: Address,
    pub ethertype: u16,
}

impl Header {
    /// Parse the header at the start of `frame`, if it is long enough to hold one.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < HEADER_LEN {
            return None;
        }
        let mut destination = [0; 6];
        destination.copy_from_slice(&frame[0..6]);
        let mut source = [0; 6];
        source.copy_from_slice(&frame[6..12]);
        Some(Self {
            destination: Address(destination),
            source: Address(source),
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
        })
    }

    /// Append the encoded header to `buf`.
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.destination.0);
        buf.extend_from_slice(&self.source.0);
        buf.extend_from_slice(&self.ethertype.to_be_bytes());
    }
}

/// Build a frame from its parts.
pub fn compose(destination: Address, source: Address, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    Header {
        destination,
        source,
        ethertype,
    }
    .write(&mut frame);
    frame.extend_from_slice(payload);
    frame
}

/// Validate a submitted frame and zero-pad it to [MIN_FRAME_LEN].
///
/// Frames that already meet the minimum are returned without copying.
pub fn pad(frame: &[u8]) -> Result<Cow<'_, [u8]>, Error> {
    if frame.len() < HEADER_LEN {
        return Err(Error::FrameTooShort(frame.len()));
    }
    if frame.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(frame.len()));
    }
    if frame.len() >= MIN_FRAME_LEN {
        return Ok(Cow::Borrowed(frame));
    }
    let mut padded = vec![0; MIN_FRAME_LEN];
    padded[..frame.len()].copy_from_slice(frame);
    Ok(Cow::Owned(padded))
}

/// Compute the RFC 1071 checksum of an IPv4 header.
///
/// Summing a header that already carries a valid checksum yields zero.
pub fn checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = header.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Move an IPv4 frame between the two simulated address ranges.
///
/// Flips the low bit of the third octet of both the source and destination addresses and
/// rebuilds the header checksum. Frames that do not carry a well-formed IPv4 header are left
/// untouched. Returns whether the frame was modified.
pub fn rewrite(frame: &mut [u8]) -> bool {
    let Some(header) = Header::parse(frame) else {
        return false;
    };
    if header.ethertype != ETHERTYPE_IPV4 {
        return false;
    }
    let ip = &mut frame[HEADER_LEN..];
    if ip.len() < IPV4_HEADER_LEN || ip[0] >> 4 != 4 {
        return false;
    }
    let ihl = (ip[0] & 0x0f) as usize * 4;
    if ihl < IPV4_HEADER_LEN || ihl > ip.len() {
        return false;
    }

    ip[IPV4_SOURCE + 2] ^= 1;
    ip[IPV4_DESTINATION + 2] ^= 1;
    ip[IPV4_CHECKSUM] = 0;
    ip[IPV4_CHECKSUM + 1] = 0;
    let sum = checksum(&ip[..ihl]);
    ip[IPV4_CHECKSUM..IPV4_CHECKSUM + 2].copy_from_slice(&sum.to_be_bytes());
    true
}
