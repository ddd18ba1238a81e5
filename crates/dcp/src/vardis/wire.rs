// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Vardis wire types: variable atoms and instruction containers.
//!
//! A Vardis payload is a sequence of instruction containers, each headed
//! by a type and a record count:
//!
//! ```text
//! +--------+---------+----------------------------------+
//! | icType | icCount | icCount records of fixed layout  |
//! +--------+---------+----------------------------------+
//! ```
//!
//! Sequence numbers are 8-bit and wrap; the only admissible comparison is
//! [`VarSeqno::more_recent_than`], which treats a forward distance of less
//! than 128 as "newer".

use crate::wire::{
    AreaError, AreaResult, AssemblyArea, DisassemblyArea, NodeId, Transmissible, WireString,
};
use std::fmt;

/// Variable identifier (0..=255).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct VarId(pub u8);

impl Transmissible for VarId {
    const FIXED_SIZE: usize = 1;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u8(self.0)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(VarId(area.read_u8()?))
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-variable repetition count (1..=15).
pub const MAX_REPETITIONS: u8 = 15;

/// Wrap-aware per-variable sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VarSeqno(pub u8);

impl VarSeqno {
    /// `self` is strictly newer than `other` in wrap-safe arithmetic:
    /// unequal, and the forward distance from `other` is below 128.
    #[inline]
    #[must_use]
    pub fn more_recent_than(&self, other: VarSeqno) -> bool {
        self.0 != other.0 && self.0.wrapping_sub(other.0) < 128
    }

    /// Successor with wraparound.
    #[inline]
    #[must_use]
    pub fn next(&self) -> VarSeqno {
        VarSeqno(self.0.wrapping_add(1))
    }
}

impl Transmissible for VarSeqno {
    const FIXED_SIZE: usize = 1;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u8(self.0)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(VarSeqno(area.read_u8()?))
    }
}

impl fmt::Display for VarSeqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A variable value: one length byte followed by that many bytes.
///
/// The protocol never puts an empty value on the air; an empty value in a
/// database entry means "deleted".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VarValue(Vec<u8>);

impl VarValue {
    /// Build from raw bytes; at most 255.
    pub fn new(bytes: &[u8]) -> Result<Self, AreaError> {
        if bytes.len() > 255 {
            return Err(AreaError::Overflow {
                needed: bytes.len(),
                available: 255,
            });
        }
        Ok(VarValue(bytes.to_vec()))
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
}

impl Transmissible for VarValue {
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
        Ok(VarValue(area.read_slice(len)?.to_vec()))
    }
}

/// Variable specification, immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarSpec {
    pub var_id: VarId,
    pub producer: NodeId,
    pub rep_cnt: u8,
    pub description: WireString,
}

impl Transmissible for VarSpec {
    const FIXED_SIZE: usize = 1 + 6 + 1 + 1;

    fn total_size(&self) -> usize {
        Self::FIXED_SIZE + self.description.len()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.var_id.serialize(area)?;
        self.producer.serialize(area)?;
        area.write_u8(self.rep_cnt)?;
        self.description.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            var_id: VarId::deserialize(area)?,
            producer: NodeId::deserialize(area)?,
            rep_cnt: area.read_u8()?,
            description: WireString::deserialize(area)?,
        })
    }
}

/// Instruction container type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IcType {
    Summaries = 1,
    Updates = 2,
    RequestVarUpdates = 3,
    RequestVarCreates = 4,
    CreateVariables = 5,
    DeleteVariables = 6,
}

impl IcType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summaries => "SUMMARIES",
            Self::Updates => "UPDATES",
            Self::RequestVarUpdates => "REQUEST_VARUPDATES",
            Self::RequestVarCreates => "REQUEST_VARCREATES",
            Self::CreateVariables => "CREATE_VARIABLES",
            Self::DeleteVariables => "DELETE_VARIABLES",
        }
    }
}

impl TryFrom<u8> for IcType {
    type Error = AreaError;

    fn try_from(value: u8) -> Result<Self, AreaError> {
        match value {
            1 => Ok(Self::Summaries),
            2 => Ok(Self::Updates),
            3 => Ok(Self::RequestVarUpdates),
            4 => Ok(Self::RequestVarCreates),
            5 => Ok(Self::CreateVariables),
            6 => Ok(Self::DeleteVariables),
            other => Err(AreaError::Invalid {
                what: "instruction container type",
                value: other as u32,
            }),
        }
    }
}

impl fmt::Display for IcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcHeader {
    pub ic_type: IcType,
    pub ic_count: u8,
}

impl Transmissible for IcHeader {
    const FIXED_SIZE: usize = 2;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u8(self.ic_type as u8)?;
        area.write_u8(self.ic_count)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            ic_type: IcType::try_from(area.read_u8()?)?,
            ic_count: area.read_u8()?,
        })
    }
}

/// SUMMARIES / REQUEST_VARUPDATES record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarSummary {
    pub var_id: VarId,
    pub seqno: VarSeqno,
}

impl Transmissible for VarSummary {
    const FIXED_SIZE: usize = 2;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.var_id.serialize(area)?;
        self.seqno.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            var_id: VarId::deserialize(area)?,
            seqno: VarSeqno::deserialize(area)?,
        })
    }
}

/// UPDATES record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarUpdate {
    pub var_id: VarId,
    pub seqno: VarSeqno,
    pub value: VarValue,
}

impl Transmissible for VarUpdate {
    const FIXED_SIZE: usize = 3;

    fn total_size(&self) -> usize {
        2 + self.value.total_size()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.var_id.serialize(area)?;
        self.seqno.serialize(area)?;
        self.value.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            var_id: VarId::deserialize(area)?,
            seqno: VarSeqno::deserialize(area)?,
            value: VarValue::deserialize(area)?,
        })
    }
}

/// CREATE_VARIABLES record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarCreate {
    pub spec: VarSpec,
    pub value: VarValue,
}

impl Transmissible for VarCreate {
    const FIXED_SIZE: usize = VarSpec::FIXED_SIZE + 1;

    fn total_size(&self) -> usize {
        self.spec.total_size() + self.value.total_size()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.spec.serialize(area)?;
        self.value.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            spec: VarSpec::deserialize(area)?,
            value: VarValue::deserialize(area)?,
        })
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
        assert_eq!(&T::deserialize(&mut dis).expect("deserialize failed"), value);
        assert_eq!(dis.available(), 0);
    }

    #[test]
    fn test_more_recent_basic() {
        assert!(VarSeqno(5).more_recent_than(VarSeqno(4)));
        assert!(!VarSeqno(4).more_recent_than(VarSeqno(5)));
        assert!(!VarSeqno(4).more_recent_than(VarSeqno(4)));
    }

    #[test]
    fn test_more_recent_window() {
        let base = VarSeqno(10);
        for k in 1..128u8 {
            assert!(
                VarSeqno(base.0.wrapping_add(k)).more_recent_than(base),
                "k={k}"
            );
        }
        for k in 128..=255u8 {
            assert!(
                !VarSeqno(base.0.wrapping_add(k)).more_recent_than(base),
                "k={k}"
            );
        }
    }

    #[test]
    fn test_more_recent_antisymmetric() {
        for a in 0..=255u8 {
            for b in 0..=255u8 {
                let ab = VarSeqno(a).more_recent_than(VarSeqno(b));
                let ba = VarSeqno(b).more_recent_than(VarSeqno(a));
                if a == b {
                    assert!(!ab && !ba);
                } else {
                    // At most one direction holds; with the 128 window,
                    // exactly one does except at distance 128.
                    assert!(!(ab && ba), "a={a} b={b}");
                    if a.wrapping_sub(b) != 128 {
                        assert!(ab || ba, "a={a} b={b}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_seqno_wraps() {
        assert_eq!(VarSeqno(255).next(), VarSeqno(0));
        assert!(VarSeqno(0).more_recent_than(VarSeqno(255)));
    }

    #[test]
    fn test_value_roundtrip() {
        roundtrip(&VarValue::new(&[0xaa, 0xbb]).unwrap());
        assert!(VarValue::new(&[0u8; 256]).is_err());
    }

    #[test]
    fn test_spec_roundtrip() {
        roundtrip(&VarSpec {
            var_id: VarId(7),
            producer: NodeId([1, 2, 3, 4, 5, 6]),
            rep_cnt: 3,
            description: WireString::new(b"altitude").unwrap(),
        });
    }

    #[test]
    fn test_container_records_roundtrip() {
        roundtrip(&IcHeader {
            ic_type: IcType::Summaries,
            ic_count: 4,
        });
        roundtrip(&VarSummary {
            var_id: VarId(42),
            seqno: VarSeqno(5),
        });
        roundtrip(&VarUpdate {
            var_id: VarId(9),
            seqno: VarSeqno(200),
            value: VarValue::new(&[1, 2, 3]).unwrap(),
        });
        roundtrip(&VarCreate {
            spec: VarSpec {
                var_id: VarId(1),
                producer: NodeId([9, 8, 7, 6, 5, 4]),
                rep_cnt: 1,
                description: WireString::new(b"x").unwrap(),
            },
            value: VarValue::new(&[0xaa]).unwrap(),
        });
    }

    #[test]
    fn test_unknown_ic_type_rejected() {
        let bytes = [7u8, 1];
        let mut dis = DisassemblyArea::new(&bytes);
        assert!(matches!(
            IcHeader::deserialize(&mut dis),
            Err(AreaError::Invalid { .. })
        ));
    }
}
