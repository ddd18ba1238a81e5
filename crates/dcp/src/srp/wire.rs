// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SRP wire types.
//!
//! SRP broadcasts one [`ExtendedSafetyData`] per generation period as the
//! single ONCE-mode BP payload. The struct doubles as the in-memory
//! neighbour-table record, so it is `#[repr(C)]` plain data; on the air
//! the floats travel as big-endian IEEE-754 bit patterns.

use crate::wire::{AreaResult, AssemblyArea, DisassemblyArea, NodeId, TimeStamp, Transmissible};

/// Kinematic state of a node.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SafetyData {
    pub position_x: f64,
    pub position_y: f64,
    pub position_z: f64,
    pub velocity_x: f64,
    pub velocity_y: f64,
    pub velocity_z: f64,
}

impl Transmissible for SafetyData {
    const FIXED_SIZE: usize = 6 * 8;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        for value in [
            self.position_x,
            self.position_y,
            self.position_z,
            self.velocity_x,
            self.velocity_y,
            self.velocity_z,
        ] {
            area.write_u64(value.to_bits())?;
        }
        Ok(())
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            position_x: f64::from_bits(area.read_u64()?),
            position_y: f64::from_bits(area.read_u64()?),
            position_z: f64::from_bits(area.read_u64()?),
            velocity_x: f64::from_bits(area.read_u64()?),
            velocity_y: f64::from_bits(area.read_u64()?),
            velocity_z: f64::from_bits(area.read_u64()?),
        })
    }
}

/// The on-air SRP payload: safety data plus provenance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtendedSafetyData {
    pub safety_data: SafetyData,
    pub node_id: NodeId,
    pub timestamp: TimeStamp,
    pub seqno: u32,
}

impl Transmissible for ExtendedSafetyData {
    const FIXED_SIZE: usize = SafetyData::FIXED_SIZE + 6 + 8 + 4;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.safety_data.serialize(area)?;
        self.node_id.serialize(area)?;
        self.timestamp.serialize(area)?;
        area.write_u32(self.seqno)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            safety_data: SafetyData::deserialize(area)?,
            node_id: NodeId::deserialize(area)?,
            timestamp: TimeStamp::deserialize(area)?,
            seqno: area.read_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_safety_data_roundtrip() {
        let esd = ExtendedSafetyData {
            safety_data: SafetyData {
                position_x: 12.5,
                position_y: -3.25,
                position_z: 110.0,
                velocity_x: 0.5,
                velocity_y: 0.0,
                velocity_z: -9.81,
            },
            node_id: NodeId([1, 2, 3, 4, 5, 6]),
            timestamp: TimeStamp(1_700_000_000_000_000),
            seqno: 42,
        };
        let mut buf = [0u8; ExtendedSafetyData::FIXED_SIZE];
        let mut area = AssemblyArea::new(&mut buf);
        esd.serialize(&mut area).unwrap();
        assert_eq!(area.used(), ExtendedSafetyData::FIXED_SIZE);

        let mut dis = DisassemblyArea::new(&buf);
        assert_eq!(ExtendedSafetyData::deserialize(&mut dis).unwrap(), esd);
    }

    #[test]
    fn test_wire_size() {
        assert_eq!(ExtendedSafetyData::FIXED_SIZE, 66);
    }
}
