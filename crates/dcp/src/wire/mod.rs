// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transmissible wire types shared by all protocols.
//!
//! A transmissible type knows its serialized size and can write itself into
//! an [`AssemblyArea`] / rebuild itself from a [`DisassemblyArea`]. Types
//! with a variable component (e.g. [`WireString`]) override
//! [`Transmissible::total_size`]; for everything else the fixed size is the
//! total size. Multi-byte integers are network byte order on the air, while
//! structures living in shared memory stay host-endian `#[repr(C)]`: the
//! two worlds only meet through these serializers.

pub mod area;

pub use area::{AreaError, AreaResult, AssemblyArea, DisassemblyArea};

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Serialization interface for everything that goes over the air or
/// through a command socket.
pub trait Transmissible: Sized {
    /// Serialized size of the fixed component in bytes.
    const FIXED_SIZE: usize;

    /// Total serialized size (fixed plus variable component).
    fn total_size(&self) -> usize {
        Self::FIXED_SIZE
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()>;

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self>;
}

/// Node identifier: the MAC address of the originating interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeId(pub [u8; 6]);

impl NodeId {
    /// The all-zero identifier, used before an interface is bound.
    pub const NULL: NodeId = NodeId([0u8; 6]);

    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 6]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl Transmissible for NodeId {
    const FIXED_SIZE: usize = 6;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_bytes(&self.0)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        let mut bytes = [0u8; 6];
        area.read_bytes(&mut bytes)?;
        Ok(NodeId(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 {
                return Err(format!("too many octets in node id '{s}'"));
            }
            bytes[count] = u8::from_str_radix(part, 16)
                .map_err(|_| format!("bad octet '{part}' in node id '{s}'"))?;
            count += 1;
        }
        if count != 6 {
            return Err(format!("expected 6 octets in node id '{s}', got {count}"));
        }
        Ok(NodeId(bytes))
    }
}

/// Timestamp: microseconds since the Unix epoch of the local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimeStamp(pub u64);

impl TimeStamp {
    /// Capture the current local time.
    #[must_use]
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        TimeStamp(micros)
    }

    #[inline]
    #[must_use]
    pub fn micros(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed from `earlier` to `self` (0 if `earlier` is newer).
    #[must_use]
    pub fn millis_since(&self, earlier: TimeStamp) -> u64 {
        self.0.saturating_sub(earlier.0) / 1000
    }
}

impl Transmissible for TimeStamp {
    const FIXED_SIZE: usize = 8;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u64(self.0)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(TimeStamp(area.read_u64()?))
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Maximum byte length of a [`WireString`].
pub const MAX_WIRE_STRING_LEN: usize = 255;

/// Length-prefixed byte string: one length byte followed by that many bytes.
///
/// The content is treated as an opaque blob; UTF-8 validity is the
/// application's business.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireString(Vec<u8>);

impl WireString {
    /// Build from raw bytes; fails when longer than 255 bytes.
    pub fn new(bytes: &[u8]) -> Result<Self, AreaError> {
        if bytes.len() > MAX_WIRE_STRING_LEN {
            return Err(AreaError::Overflow {
                needed: bytes.len(),
                available: MAX_WIRE_STRING_LEN,
            });
        }
        Ok(WireString(bytes.to_vec()))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy UTF-8 view for display purposes.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl Transmissible for WireString {
    const FIXED_SIZE: usize = 1;

    fn total_size(&self) -> usize {
        1 + self.0.len()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u8(self.0.len() as u8)?;
        area.write_bytes(&self.0)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        let len = area.read_u8()? as usize;
        Ok(WireString(area.read_slice(len)?.to_vec()))
    }
}

impl fmt::Display for WireString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Transmissible + PartialEq + fmt::Debug>(value: &T) {
        let mut buf = vec![0u8; value.total_size()];
        let mut area = AssemblyArea::new(&mut buf);
        value.serialize(&mut area).expect("serialize failed");
        assert_eq!(area.used(), value.total_size());
        let mut dis = DisassemblyArea::new(&buf);
        let back = T::deserialize(&mut dis).expect("deserialize failed");
        assert_eq!(&back, value);
        assert_eq!(dis.available(), 0);
    }

    #[test]
    fn test_node_id_roundtrip() {
        roundtrip(&NodeId([0x02, 0x42, 0xac, 0x11, 0x00, 0x07]));
    }

    #[test]
    fn test_node_id_display_parse() {
        let id = NodeId([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        let text = id.to_string();
        assert_eq!(text, "de:ad:be:ef:00:01");
        assert_eq!(text.parse::<NodeId>().unwrap(), id);
        assert!("de:ad".parse::<NodeId>().is_err());
        assert!("zz:00:00:00:00:00".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_timestamp_roundtrip() {
        roundtrip(&TimeStamp(1_726_000_000_123_456));
    }

    #[test]
    fn test_timestamp_millis_since() {
        let t0 = TimeStamp(1_000_000);
        let t1 = TimeStamp(3_500_000);
        assert_eq!(t1.millis_since(t0), 2500);
        assert_eq!(t0.millis_since(t1), 0);
    }

    #[test]
    fn test_wire_string_roundtrip() {
        roundtrip(&WireString::new(b"altitude").unwrap());
        roundtrip(&WireString::new(b"").unwrap());
    }

    #[test]
    fn test_wire_string_max_length() {
        assert!(WireString::new(&[0u8; 255]).is_ok());
        assert!(WireString::new(&[0u8; 256]).is_err());
    }
}
