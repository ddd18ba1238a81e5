// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! BP service primitives.
//!
//! Command-socket messages (register, deregister, management queries) and
//! the small headers that travel through the shared-memory queues
//! (transmit requests, transmit confirms, receive indications). Every
//! message is framed by its service type tag, written by the caller.

use crate::bp::wire::BpProtocolId;
use crate::status::{BpStatus, UnknownCode};
use crate::wire::{
    AreaError, AreaResult, AssemblyArea, DisassemblyArea, NodeId, TimeStamp, Transmissible,
    WireString,
};

/// Service types understood by the BP command socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BpServiceType {
    RegisterProtocol = 0x0001,
    DeregisterProtocol = 0x0002,
    ListRegisteredProtocols = 0x0003,
    ClearBuffer = 0x0004,
    QueryNumberBufferedPayloads = 0x0005,
    ShutDown = 0x0006,
    Activate = 0x0007,
    Deactivate = 0x0008,
    GetStatistics = 0x0009,
}

impl BpServiceType {
    #[inline]
    #[must_use]
    pub fn code(&self) -> u16 {
        *self as u16
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegisterProtocol => "BP-RegisterProtocol",
            Self::DeregisterProtocol => "BP-DeregisterProtocol",
            Self::ListRegisteredProtocols => "BP-ListRegisteredProtocols",
            Self::ClearBuffer => "BP-ClearBuffer",
            Self::QueryNumberBufferedPayloads => "BP-QueryNumberBufferedPayloads",
            Self::ShutDown => "BP-ShutDown",
            Self::Activate => "BP-Activate",
            Self::Deactivate => "BP-Deactivate",
            Self::GetStatistics => "BP-GetStatistics",
        }
    }
}

impl TryFrom<u16> for BpServiceType {
    type Error = UnknownCode;

    fn try_from(value: u16) -> Result<Self, UnknownCode> {
        match value {
            0x0001 => Ok(Self::RegisterProtocol),
            0x0002 => Ok(Self::DeregisterProtocol),
            0x0003 => Ok(Self::ListRegisteredProtocols),
            0x0004 => Ok(Self::ClearBuffer),
            0x0005 => Ok(Self::QueryNumberBufferedPayloads),
            0x0006 => Ok(Self::ShutDown),
            0x0007 => Ok(Self::Activate),
            0x0008 => Ok(Self::Deactivate),
            0x0009 => Ok(Self::GetStatistics),
            _ => Err(UnknownCode {
                space: "BP service type",
                value,
            }),
        }
    }
}

fn read_bp_status(area: &mut DisassemblyArea<'_>) -> AreaResult<BpStatus> {
    let code = area.read_u16()?;
    BpStatus::try_from(code).map_err(|e| AreaError::Invalid {
        what: "BP status",
        value: e.value as u32,
    })
}

fn write_bool(area: &mut AssemblyArea<'_>, value: bool) -> AreaResult<()> {
    area.write_u8(u8::from(value))
}

fn read_bool(area: &mut DisassemblyArea<'_>) -> AreaResult<bool> {
    Ok(area.read_u8()? != 0)
}

// ---------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------

/// Client registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterProtocolRequest {
    pub protocol_id: BpProtocolId,
    pub protocol_name: WireString,
    pub max_payload_size: u16,
    /// Raw queueing mode; validated by the daemon so an unknown value can
    /// be answered with a status code instead of a parse failure.
    pub queueing_mode: u8,
    pub max_entries: u16,
    pub generate_tx_confirms: bool,
    pub shm_name: WireString,
}

impl Transmissible for RegisterProtocolRequest {
    const FIXED_SIZE: usize = 2 + 1 + 2 + 1 + 2 + 1 + 1;

    fn total_size(&self) -> usize {
        Self::FIXED_SIZE + self.protocol_name.len() + self.shm_name.len()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.protocol_id.serialize(area)?;
        self.protocol_name.serialize(area)?;
        area.write_u16(self.max_payload_size)?;
        area.write_u8(self.queueing_mode)?;
        area.write_u16(self.max_entries)?;
        write_bool(area, self.generate_tx_confirms)?;
        self.shm_name.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            protocol_id: BpProtocolId::deserialize(area)?,
            protocol_name: WireString::deserialize(area)?,
            max_payload_size: area.read_u16()?,
            queueing_mode: area.read_u8()?,
            max_entries: area.read_u16()?,
            generate_tx_confirms: read_bool(area)?,
            shm_name: WireString::deserialize(area)?,
        })
    }
}

/// Registration confirm; `own_node_id` is only meaningful on `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterProtocolConfirm {
    pub status: BpStatus,
    pub own_node_id: NodeId,
}

impl Transmissible for RegisterProtocolConfirm {
    const FIXED_SIZE: usize = 2 + 6;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())?;
        self.own_node_id.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            status: read_bp_status(area)?,
            own_node_id: NodeId::deserialize(area)?,
        })
    }
}

/// Request carrying only a protocol id (deregister, clear-buffer, query).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolIdRequest {
    pub protocol_id: BpProtocolId,
}

impl Transmissible for ProtocolIdRequest {
    const FIXED_SIZE: usize = 2;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.protocol_id.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            protocol_id: BpProtocolId::deserialize(area)?,
        })
    }
}

/// Confirm carrying only a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpSimpleConfirm {
    pub status: BpStatus,
}

impl Transmissible for BpSimpleConfirm {
    const FIXED_SIZE: usize = 2;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            status: read_bp_status(area)?,
        })
    }
}

// ---------------------------------------------------------------------
// Management queries
// ---------------------------------------------------------------------

/// Static and counter data of one registered protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDescription {
    pub protocol_id: BpProtocolId,
    pub protocol_name: WireString,
    pub max_payload_size: u16,
    pub queueing_mode: u8,
    pub max_entries: u16,
    pub generate_tx_confirms: bool,
    pub registered_at: TimeStamp,
    pub cnt_outgoing_payloads: u64,
    pub cnt_received_payloads: u64,
    pub cnt_dropped_outgoing_payloads: u64,
    pub cnt_dropped_incoming_payloads: u64,
}

impl Transmissible for ProtocolDescription {
    const FIXED_SIZE: usize = 2 + 1 + 2 + 1 + 2 + 1 + 8 + 4 * 8;

    fn total_size(&self) -> usize {
        Self::FIXED_SIZE + self.protocol_name.len()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.protocol_id.serialize(area)?;
        self.protocol_name.serialize(area)?;
        area.write_u16(self.max_payload_size)?;
        area.write_u8(self.queueing_mode)?;
        area.write_u16(self.max_entries)?;
        write_bool(area, self.generate_tx_confirms)?;
        self.registered_at.serialize(area)?;
        area.write_u64(self.cnt_outgoing_payloads)?;
        area.write_u64(self.cnt_received_payloads)?;
        area.write_u64(self.cnt_dropped_outgoing_payloads)?;
        area.write_u64(self.cnt_dropped_incoming_payloads)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            protocol_id: BpProtocolId::deserialize(area)?,
            protocol_name: WireString::deserialize(area)?,
            max_payload_size: area.read_u16()?,
            queueing_mode: area.read_u8()?,
            max_entries: area.read_u16()?,
            generate_tx_confirms: read_bool(area)?,
            registered_at: TimeStamp::deserialize(area)?,
            cnt_outgoing_payloads: area.read_u64()?,
            cnt_received_payloads: area.read_u64()?,
            cnt_dropped_outgoing_payloads: area.read_u64()?,
            cnt_dropped_incoming_payloads: area.read_u64()?,
        })
    }
}

/// Confirm for `ListRegisteredProtocols`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRegisteredProtocolsConfirm {
    pub status: BpStatus,
    pub bp_is_active: bool,
    pub protocols: Vec<ProtocolDescription>,
}

impl Transmissible for ListRegisteredProtocolsConfirm {
    const FIXED_SIZE: usize = 2 + 1 + 2;

    fn total_size(&self) -> usize {
        Self::FIXED_SIZE + self.protocols.iter().map(Transmissible::total_size).sum::<usize>()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())?;
        write_bool(area, self.bp_is_active)?;
        area.write_u16(self.protocols.len() as u16)?;
        for description in &self.protocols {
            description.serialize(area)?;
        }
        Ok(())
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        let status = read_bp_status(area)?;
        let bp_is_active = read_bool(area)?;
        let count = area.read_u16()?;
        let mut protocols = Vec::with_capacity(count as usize);
        for _ in 0..count {
            protocols.push(ProtocolDescription::deserialize(area)?);
        }
        Ok(Self {
            status,
            bp_is_active,
            protocols,
        })
    }
}

/// Confirm for `QueryNumberBufferedPayloads`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryNumberBufferedPayloadsConfirm {
    pub status: BpStatus,
    pub num_payloads_buffered: u32,
}

impl Transmissible for QueryNumberBufferedPayloadsConfirm {
    const FIXED_SIZE: usize = 2 + 4;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())?;
        area.write_u32(self.num_payloads_buffered)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            status: read_bp_status(area)?,
            num_payloads_buffered: area.read_u32()?,
        })
    }
}

/// Confirm for `GetStatistics`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BpGetStatisticsConfirm {
    pub status: BpStatus,
    /// EWMA of inter-beacon reception time in milliseconds; NaN until the
    /// first foreign beacon arrives.
    pub avg_inter_beacon_time_ms: f64,
    /// EWMA of emitted beacon sizes in bytes; NaN until the first beacon.
    pub avg_beacon_size: f64,
    pub cnt_beacons_sent: u64,
    pub cnt_beacons_received: u64,
    pub cnt_dropped_unknown: u64,
    pub cnt_dropped_incoming: u64,
    pub cnt_dropped_outgoing: u64,
}

impl Transmissible for BpGetStatisticsConfirm {
    const FIXED_SIZE: usize = 2 + 2 * 8 + 5 * 8;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())?;
        area.write_u64(self.avg_inter_beacon_time_ms.to_bits())?;
        area.write_u64(self.avg_beacon_size.to_bits())?;
        area.write_u64(self.cnt_beacons_sent)?;
        area.write_u64(self.cnt_beacons_received)?;
        area.write_u64(self.cnt_dropped_unknown)?;
        area.write_u64(self.cnt_dropped_incoming)?;
        area.write_u64(self.cnt_dropped_outgoing)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            status: read_bp_status(area)?,
            avg_inter_beacon_time_ms: f64::from_bits(area.read_u64()?),
            avg_beacon_size: f64::from_bits(area.read_u64()?),
            cnt_beacons_sent: area.read_u64()?,
            cnt_beacons_received: area.read_u64()?,
            cnt_dropped_unknown: area.read_u64()?,
            cnt_dropped_incoming: area.read_u64()?,
            cnt_dropped_outgoing: area.read_u64()?,
        })
    }
}

// ---------------------------------------------------------------------
// Shared-memory primitives
// ---------------------------------------------------------------------

/// Chunk header of a payload submission; the payload bytes follow it
/// inside the same chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitPayloadRequest {
    pub protocol_id: BpProtocolId,
    pub length: u16,
}

impl Transmissible for TransmitPayloadRequest {
    const FIXED_SIZE: usize = 2 + 2;

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

/// Chunk content of a transmit confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitPayloadConfirm {
    pub status: BpStatus,
}

impl Transmissible for TransmitPayloadConfirm {
    const FIXED_SIZE: usize = 2;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            status: read_bp_status(area)?,
        })
    }
}

/// Chunk header of a received payload; the payload bytes follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivePayloadIndication {
    pub length: u16,
}

impl Transmissible for ReceivePayloadIndication {
    const FIXED_SIZE: usize = 2;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.length)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            length: area.read_u16()?,
        })
    }
}
