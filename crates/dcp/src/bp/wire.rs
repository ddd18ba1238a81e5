// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Beacon frame headers.
//!
//! A beacon is one L2 broadcast frame:
//!
//! ```text
//! +---------------------------------------------------+
//! | BeaconHeader (16 bytes)                           |
//! +---------------------------------------------------+
//! | PayloadHeader (4) | client payload bytes          |  x numPayloads
//! +---------------------------------------------------+
//! ```
//!
//! `length` counts every byte after the beacon header, i.e. the sum of the
//! payload records including their headers.

use crate::wire::{AreaResult, AssemblyArea, DisassemblyArea, NodeId, Transmissible};
use std::fmt;

/// Protocol version carried in every beacon.
pub const BEACON_VERSION: u8 = 1;

/// Magic number identifying beacon frames.
pub const BEACON_MAGIC: u16 = 0x497e;

/// Identifier of a BP client protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BpProtocolId(pub u16);

impl BpProtocolId {
    /// Reserved id of the State Reporting Protocol.
    pub const SRP: BpProtocolId = BpProtocolId(0x0001);
    /// Reserved id of the Variable Dissemination protocol.
    pub const VARDIS: BpProtocolId = BpProtocolId(0x0002);
}

impl Transmissible for BpProtocolId {
    const FIXED_SIZE: usize = 2;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.0)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(BpProtocolId(area.read_u16()?))
    }
}

impl fmt::Display for BpProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Fixed header of every beacon frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconHeader {
    pub version: u8,
    pub magic: u16,
    pub sender_id: NodeId,
    /// Total payload bytes following this header.
    pub length: u16,
    pub num_payloads: u8,
    pub seqno: u32,
}

impl BeaconHeader {
    pub const FIXED_WIRE_SIZE: usize = 1 + 2 + 6 + 2 + 1 + 4;

    /// Byte offset of the `length` field, for back-patching.
    pub const LENGTH_OFFSET: usize = 9;
    /// Byte offset of the `num_payloads` field, for back-patching.
    pub const NUM_PAYLOADS_OFFSET: usize = 11;

    #[must_use]
    pub fn new(sender_id: NodeId, seqno: u32) -> Self {
        Self {
            version: BEACON_VERSION,
            magic: BEACON_MAGIC,
            sender_id,
            length: 0,
            num_payloads: 0,
            seqno,
        }
    }

    /// A received header is acceptable iff the version and magic match,
    /// the frame is not our own echo, and it announces actual content.
    #[must_use]
    pub fn is_well_formed(&self, own_node_id: NodeId) -> bool {
        self.version == BEACON_VERSION
            && self.magic == BEACON_MAGIC
            && self.sender_id != own_node_id
            && self.num_payloads >= 1
            && self.length > 0
    }
}

impl Transmissible for BeaconHeader {
    const FIXED_SIZE: usize = Self::FIXED_WIRE_SIZE;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u8(self.version)?;
        area.write_u16(self.magic)?;
        self.sender_id.serialize(area)?;
        area.write_u16(self.length)?;
        area.write_u8(self.num_payloads)?;
        area.write_u32(self.seqno)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            version: area.read_u8()?,
            magic: area.read_u16()?,
            sender_id: NodeId::deserialize(area)?,
            length: area.read_u16()?,
            num_payloads: area.read_u8()?,
            seqno: area.read_u32()?,
        })
    }
}

/// Header preceding each client payload inside a beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub protocol_id: BpProtocolId,
    /// Length of the payload bytes, not counting this header.
    pub length: u16,
}

impl PayloadHeader {
    pub const FIXED_WIRE_SIZE: usize = 2 + 2;
}

impl Transmissible for PayloadHeader {
    const FIXED_SIZE: usize = Self::FIXED_WIRE_SIZE;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.protocol_id.serialize(area)?;
        area.write_u16(self.length)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            protocol_id: BpProtocolId::deserialize(area)?,
            length: area.read_u16()?,
        })
    }
}
