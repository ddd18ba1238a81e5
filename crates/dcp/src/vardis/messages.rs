// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Vardis service primitives.
//!
//! The four RTDB operations (Create/Delete/Update/Read) travel through the
//! per-client shared-memory control segment; management operations
//! (register, describe, activate, statistics) go over the Vardis command
//! socket.

use crate::status::{UnknownCode, VardisStatus};
use crate::vardis::store::VardisCounters;
use crate::vardis::wire::{VarId, VarSeqno, VarSpec, VarValue};
use crate::wire::{
    AreaError, AreaResult, AssemblyArea, DisassemblyArea, NodeId, TimeStamp, Transmissible,
    WireString,
};

/// Service types understood by the Vardis command socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum VardisServiceType {
    Register = 0x0101,
    Deregister = 0x0102,
    DescribeDatabase = 0x0103,
    DescribeVariable = 0x0104,
    ShutDown = 0x0105,
    Activate = 0x0106,
    Deactivate = 0x0107,
    GetStatistics = 0x0108,
}

impl VardisServiceType {
    #[inline]
    #[must_use]
    pub fn code(&self) -> u16 {
        *self as u16
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "Vardis-Register",
            Self::Deregister => "Vardis-Deregister",
            Self::DescribeDatabase => "Vardis-RTDB-DescribeDatabase",
            Self::DescribeVariable => "Vardis-RTDB-DescribeVariable",
            Self::ShutDown => "Vardis-ShutDown",
            Self::Activate => "Vardis-Activate",
            Self::Deactivate => "Vardis-Deactivate",
            Self::GetStatistics => "Vardis-GetStatistics",
        }
    }
}

impl TryFrom<u16> for VardisServiceType {
    type Error = UnknownCode;

    fn try_from(value: u16) -> Result<Self, UnknownCode> {
        match value {
            0x0101 => Ok(Self::Register),
            0x0102 => Ok(Self::Deregister),
            0x0103 => Ok(Self::DescribeDatabase),
            0x0104 => Ok(Self::DescribeVariable),
            0x0105 => Ok(Self::ShutDown),
            0x0106 => Ok(Self::Activate),
            0x0107 => Ok(Self::Deactivate),
            0x0108 => Ok(Self::GetStatistics),
            _ => Err(UnknownCode {
                space: "Vardis service type",
                value,
            }),
        }
    }
}

fn read_vardis_status(area: &mut DisassemblyArea<'_>) -> AreaResult<VardisStatus> {
    let code = area.read_u16()?;
    VardisStatus::try_from(code).map_err(|e| AreaError::Invalid {
        what: "Vardis status",
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
// RTDB primitives (shared memory)
// ---------------------------------------------------------------------

/// `RTDB_Create.request`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtdbCreateRequest {
    pub spec: VarSpec,
    pub value: VarValue,
}

impl Transmissible for RtdbCreateRequest {
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

/// Confirm shared by Create, Delete and Update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtdbVarConfirm {
    pub status: VardisStatus,
    pub var_id: VarId,
}

impl Transmissible for RtdbVarConfirm {
    const FIXED_SIZE: usize = 2 + 1;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())?;
        self.var_id.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            status: read_vardis_status(area)?,
            var_id: VarId::deserialize(area)?,
        })
    }
}

/// `RTDB_Delete.request`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtdbDeleteRequest {
    pub var_id: VarId,
}

impl Transmissible for RtdbDeleteRequest {
    const FIXED_SIZE: usize = 1;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.var_id.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            var_id: VarId::deserialize(area)?,
        })
    }
}

/// `RTDB_Update.request`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtdbUpdateRequest {
    pub var_id: VarId,
    pub value: VarValue,
}

impl Transmissible for RtdbUpdateRequest {
    const FIXED_SIZE: usize = 1 + 1;

    fn total_size(&self) -> usize {
        1 + self.value.total_size()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.var_id.serialize(area)?;
        self.value.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            var_id: VarId::deserialize(area)?,
            value: VarValue::deserialize(area)?,
        })
    }
}

/// `RTDB_Read.request`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtdbReadRequest {
    pub var_id: VarId,
    /// Capacity of the reader's value buffer.
    pub buf_capacity: u16,
}

impl Transmissible for RtdbReadRequest {
    const FIXED_SIZE: usize = 1 + 2;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.var_id.serialize(area)?;
        area.write_u16(self.buf_capacity)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            var_id: VarId::deserialize(area)?,
            buf_capacity: area.read_u16()?,
        })
    }
}

/// `RTDB_Read.confirm`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtdbReadConfirm {
    pub status: VardisStatus,
    pub var_id: VarId,
    pub seqno: VarSeqno,
    pub timestamp: TimeStamp,
    pub value: VarValue,
}

impl Transmissible for RtdbReadConfirm {
    const FIXED_SIZE: usize = 2 + 1 + 1 + 8 + 1;

    fn total_size(&self) -> usize {
        2 + 1 + 1 + 8 + self.value.total_size()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())?;
        self.var_id.serialize(area)?;
        self.seqno.serialize(area)?;
        self.timestamp.serialize(area)?;
        self.value.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            status: read_vardis_status(area)?,
            var_id: VarId::deserialize(area)?,
            seqno: VarSeqno::deserialize(area)?,
            timestamp: TimeStamp::deserialize(area)?,
            value: VarValue::deserialize(area)?,
        })
    }
}

// ---------------------------------------------------------------------
// Management primitives (command socket)
// ---------------------------------------------------------------------

/// Application registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VardisRegisterRequest {
    pub client_name: WireString,
    pub shm_name: WireString,
}

impl Transmissible for VardisRegisterRequest {
    const FIXED_SIZE: usize = 2;

    fn total_size(&self) -> usize {
        self.client_name.total_size() + self.shm_name.total_size()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.client_name.serialize(area)?;
        self.shm_name.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            client_name: WireString::deserialize(area)?,
            shm_name: WireString::deserialize(area)?,
        })
    }
}

/// Registration confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VardisRegisterConfirm {
    pub status: VardisStatus,
    pub own_node_id: NodeId,
}

impl Transmissible for VardisRegisterConfirm {
    const FIXED_SIZE: usize = 2 + 6;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())?;
        self.own_node_id.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            status: read_vardis_status(area)?,
            own_node_id: NodeId::deserialize(area)?,
        })
    }
}

/// Deregistration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VardisDeregisterRequest {
    pub client_name: WireString,
}

impl Transmissible for VardisDeregisterRequest {
    const FIXED_SIZE: usize = 1;

    fn total_size(&self) -> usize {
        self.client_name.total_size()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.client_name.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            client_name: WireString::deserialize(area)?,
        })
    }
}

/// Confirm carrying only a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VardisSimpleConfirm {
    pub status: VardisStatus,
}

impl Transmissible for VardisSimpleConfirm {
    const FIXED_SIZE: usize = 2;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            status: read_vardis_status(area)?,
        })
    }
}

/// Per-variable summary line of `DescribeDatabase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDescription {
    pub spec: VarSpec,
    pub seqno: VarSeqno,
    pub timestamp: TimeStamp,
    pub to_be_deleted: bool,
    pub value_length: u8,
}

impl Transmissible for VariableDescription {
    const FIXED_SIZE: usize = VarSpec::FIXED_SIZE + 1 + 8 + 1 + 1;

    fn total_size(&self) -> usize {
        self.spec.total_size() + 1 + 8 + 1 + 1
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.spec.serialize(area)?;
        self.seqno.serialize(area)?;
        self.timestamp.serialize(area)?;
        write_bool(area, self.to_be_deleted)?;
        area.write_u8(self.value_length)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            spec: VarSpec::deserialize(area)?,
            seqno: VarSeqno::deserialize(area)?,
            timestamp: TimeStamp::deserialize(area)?,
            to_be_deleted: read_bool(area)?,
            value_length: area.read_u8()?,
        })
    }
}

/// `DescribeDatabase` confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeDatabaseConfirm {
    pub status: VardisStatus,
    pub vardis_is_active: bool,
    pub variables: Vec<VariableDescription>,
}

impl Transmissible for DescribeDatabaseConfirm {
    const FIXED_SIZE: usize = 2 + 1 + 2;

    fn total_size(&self) -> usize {
        Self::FIXED_SIZE + self.variables.iter().map(Transmissible::total_size).sum::<usize>()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())?;
        write_bool(area, self.vardis_is_active)?;
        area.write_u16(self.variables.len() as u16)?;
        for variable in &self.variables {
            variable.serialize(area)?;
        }
        Ok(())
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        let status = read_vardis_status(area)?;
        let vardis_is_active = read_bool(area)?;
        let count = area.read_u16()?;
        let mut variables = Vec::with_capacity(count as usize);
        for _ in 0..count {
            variables.push(VariableDescription::deserialize(area)?);
        }
        Ok(Self {
            status,
            vardis_is_active,
            variables,
        })
    }
}

/// `DescribeVariable` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescribeVariableRequest {
    pub var_id: VarId,
}

impl Transmissible for DescribeVariableRequest {
    const FIXED_SIZE: usize = 1;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        self.var_id.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            var_id: VarId::deserialize(area)?,
        })
    }
}

/// `DescribeVariable` confirm; detail fields are meaningful on `Ok` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeVariableConfirm {
    pub status: VardisStatus,
    pub spec: VarSpec,
    pub seqno: VarSeqno,
    pub timestamp: TimeStamp,
    pub to_be_deleted: bool,
    pub count_create: u8,
    pub count_update: u8,
    pub count_delete: u8,
    pub value: VarValue,
}

impl Transmissible for DescribeVariableConfirm {
    const FIXED_SIZE: usize = 2 + VarSpec::FIXED_SIZE + 1 + 8 + 1 + 3 + 1;

    fn total_size(&self) -> usize {
        2 + self.spec.total_size() + 1 + 8 + 1 + 3 + self.value.total_size()
    }

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())?;
        self.spec.serialize(area)?;
        self.seqno.serialize(area)?;
        self.timestamp.serialize(area)?;
        write_bool(area, self.to_be_deleted)?;
        area.write_u8(self.count_create)?;
        area.write_u8(self.count_update)?;
        area.write_u8(self.count_delete)?;
        self.value.serialize(area)
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        Ok(Self {
            status: read_vardis_status(area)?,
            spec: VarSpec::deserialize(area)?,
            seqno: VarSeqno::deserialize(area)?,
            timestamp: TimeStamp::deserialize(area)?,
            to_be_deleted: read_bool(area)?,
            count_create: area.read_u8()?,
            count_update: area.read_u8()?,
            count_delete: area.read_u8()?,
            value: VarValue::deserialize(area)?,
        })
    }
}

/// `GetStatistics` confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VardisGetStatisticsConfirm {
    pub status: VardisStatus,
    pub counters: VardisCounters,
}

impl Transmissible for VardisGetStatisticsConfirm {
    const FIXED_SIZE: usize = 2 + 12 * 8;

    fn serialize(&self, area: &mut AssemblyArea<'_>) -> AreaResult<()> {
        area.write_u16(self.status.code())?;
        let c = &self.counters;
        for value in [
            c.rtdb_create_requests,
            c.rtdb_delete_requests,
            c.rtdb_update_requests,
            c.rtdb_read_requests,
            c.payloads_generated,
            c.payloads_processed,
            c.processed_creates,
            c.processed_deletes,
            c.processed_updates,
            c.processed_summaries,
            c.processed_req_creates,
            c.processed_req_updates,
        ] {
            area.write_u64(value)?;
        }
        Ok(())
    }

    fn deserialize(area: &mut DisassemblyArea<'_>) -> AreaResult<Self> {
        let status = read_vardis_status(area)?;
        let counters = VardisCounters {
            rtdb_create_requests: area.read_u64()?,
            rtdb_delete_requests: area.read_u64()?,
            rtdb_update_requests: area.read_u64()?,
            rtdb_read_requests: area.read_u64()?,
            payloads_generated: area.read_u64()?,
            payloads_processed: area.read_u64()?,
            processed_creates: area.read_u64()?,
            processed_deletes: area.read_u64()?,
            processed_updates: area.read_u64()?,
            processed_summaries: area.read_u64()?,
            processed_req_creates: area.read_u64()?,
            processed_req_updates: area.read_u64()?,
        };
        Ok(Self { status, counters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Transmissible + PartialEq + std::fmt::Debug>(value: &T) {
        let mut buf = vec![0u8; value.total_size()];
        let mut area = AssemblyArea::new(&mut buf);
        value.serialize(&mut area).expect("serialize failed");
        assert_eq!(area.used(), value.total_size());
        let mut dis = DisassemblyArea::new(&buf);
        assert_eq!(&T::deserialize(&mut dis).expect("deserialize failed"), value);
    }

    fn spec() -> VarSpec {
        VarSpec {
            var_id: VarId(7),
            producer: NodeId([1, 2, 3, 4, 5, 6]),
            rep_cnt: 3,
            description: WireString::new(b"battery").unwrap(),
        }
    }

    #[test]
    fn test_rtdb_primitives_roundtrip() {
        roundtrip(&RtdbCreateRequest {
            spec: spec(),
            value: VarValue::new(&[0xaa]).unwrap(),
        });
        roundtrip(&RtdbVarConfirm {
            status: VardisStatus::Ok,
            var_id: VarId(7),
        });
        roundtrip(&RtdbDeleteRequest { var_id: VarId(7) });
        roundtrip(&RtdbUpdateRequest {
            var_id: VarId(7),
            value: VarValue::new(&[0xbb, 0xcc]).unwrap(),
        });
        roundtrip(&RtdbReadRequest {
            var_id: VarId(7),
            buf_capacity: 64,
        });
        roundtrip(&RtdbReadConfirm {
            status: VardisStatus::Ok,
            var_id: VarId(7),
            seqno: VarSeqno(4),
            timestamp: TimeStamp(99_000),
            value: VarValue::new(&[0xaa]).unwrap(),
        });
    }

    #[test]
    fn test_management_primitives_roundtrip() {
        roundtrip(&VardisRegisterRequest {
            client_name: WireString::new(b"producer-app").unwrap(),
            shm_name: WireString::new(b"/dcp-vardis-producer").unwrap(),
        });
        roundtrip(&VardisRegisterConfirm {
            status: VardisStatus::Ok,
            own_node_id: NodeId([9, 8, 7, 6, 5, 4]),
        });
        roundtrip(&DescribeDatabaseConfirm {
            status: VardisStatus::Ok,
            vardis_is_active: true,
            variables: vec![VariableDescription {
                spec: spec(),
                seqno: VarSeqno(1),
                timestamp: TimeStamp(5),
                to_be_deleted: false,
                value_length: 1,
            }],
        });
        roundtrip(&DescribeVariableConfirm {
            status: VardisStatus::Ok,
            spec: spec(),
            seqno: VarSeqno(1),
            timestamp: TimeStamp(5),
            to_be_deleted: false,
            count_create: 2,
            count_update: 0,
            count_delete: 0,
            value: VarValue::new(&[1, 2]).unwrap(),
        });
        roundtrip(&VardisGetStatisticsConfirm {
            status: VardisStatus::Ok,
            counters: VardisCounters {
                rtdb_create_requests: 1,
                rtdb_update_requests: 2,
                payloads_generated: 3,
                processed_summaries: 4,
                ..Default::default()
            },
        });
    }

    #[test]
    fn test_service_type_codes() {
        for code in 0x0101..=0x0108u16 {
            assert_eq!(VardisServiceType::try_from(code).unwrap().code(), code);
        }
        assert!(VardisServiceType::try_from(0x0001).is_err());
    }
}
