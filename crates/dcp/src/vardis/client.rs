// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Vardis client library.
//!
//! Applications register over the Vardis command socket, attach the
//! control segment the daemon created for them, and then drive the RTDB
//! through shared memory. Management queries (describe, activate,
//! statistics) stay on the socket and are also usable without a
//! registration, which is what the operator tool does.

use crate::cmdsock::{encode_message, round_trip, CmdSockError};
use crate::shm::{PushOutcome, ShmError};
use crate::status::VardisStatus;
use crate::vardis::control::{RtdbOp, VardisSegment};
use crate::vardis::messages::*;
use crate::vardis::wire::{VarId, VarValue};
use crate::wire::{
    AreaError, AreaResult, AssemblyArea, DisassemblyArea, NodeId, Transmissible, WireString,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Vardis client error.
#[derive(Debug)]
pub enum VardisClientError {
    Socket(CmdSockError),
    Shm(ShmError),
    Encoding(AreaError),
    /// The daemon answered with a non-OK status.
    Rejected(VardisStatus),
    /// The daemon answered with a different service type than asked.
    UnexpectedReply,
    /// No confirm arrived in time.
    Timeout,
}

impl fmt::Display for VardisClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "command socket: {e}"),
            Self::Shm(e) => write!(f, "shared memory: {e}"),
            Self::Encoding(e) => write!(f, "message encoding: {e}"),
            Self::Rejected(status) => write!(f, "daemon rejected request: {status}"),
            Self::UnexpectedReply => write!(f, "daemon answered with wrong service type"),
            Self::Timeout => write!(f, "no confirm within timeout"),
        }
    }
}

impl std::error::Error for VardisClientError {}

impl From<CmdSockError> for VardisClientError {
    fn from(e: CmdSockError) -> Self {
        Self::Socket(e)
    }
}
impl From<ShmError> for VardisClientError {
    fn from(e: ShmError) -> Self {
        Self::Shm(e)
    }
}
impl From<AreaError> for VardisClientError {
    fn from(e: AreaError) -> Self {
        Self::Encoding(e)
    }
}

/// Result type for Vardis client operations.
pub type Result<T> = std::result::Result<T, VardisClientError>;

/// Registration parameters of a Vardis client application.
#[derive(Debug, Clone)]
pub struct VardisClientConfig {
    pub command_socket_path: PathBuf,
    pub command_timeout: Duration,
    /// Unique application name, the daemon's registration key.
    pub client_name: String,
    /// Segment name this client chooses; must be unused on the daemon side.
    pub shm_name: String,
}

fn request_confirm<C, F>(
    path: &Path,
    timeout: Duration,
    service: VardisServiceType,
    body_size: usize,
    body: F,
) -> Result<C>
where
    C: Transmissible,
    F: FnOnce(&mut AssemblyArea<'_>) -> AreaResult<()>,
{
    let request = encode_message(2 + body_size, |area| {
        area.write_u16(service.code())?;
        body(area)
    });
    let response = round_trip(path, &request, timeout)?;
    let mut area = DisassemblyArea::new(&response);
    if area.read_u16()? != service.code() {
        return Err(VardisClientError::UnexpectedReply);
    }
    Ok(C::deserialize(&mut area)?)
}

/// Registered Vardis client application.
pub struct VardisClient {
    client_name: String,
    own_node_id: NodeId,
    segment: VardisSegment,
    command_socket_path: PathBuf,
    command_timeout: Duration,
}

impl VardisClient {
    /// Register with the daemon and attach the freshly created segment.
    pub fn register(config: &VardisClientConfig) -> Result<Self> {
        let request = VardisRegisterRequest {
            client_name: WireString::new(config.client_name.as_bytes())?,
            shm_name: WireString::new(config.shm_name.as_bytes())?,
        };
        let confirm: VardisRegisterConfirm = request_confirm(
            &config.command_socket_path,
            config.command_timeout,
            VardisServiceType::Register,
            request.total_size(),
            |area| request.serialize(area),
        )?;
        if confirm.status != VardisStatus::Ok {
            return Err(VardisClientError::Rejected(confirm.status));
        }
        let segment = VardisSegment::attach(&config.shm_name)?;
        log::info!(
            "[VARDIS] client '{}' registered at node {}",
            config.client_name,
            confirm.own_node_id
        );
        Ok(Self {
            client_name: config.client_name.clone(),
            own_node_id: confirm.own_node_id,
            segment,
            command_socket_path: config.command_socket_path.clone(),
            command_timeout: config.command_timeout,
        })
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.own_node_id
    }

    fn rtdb_round_trip(
        &self,
        op: RtdbOp,
        build: impl FnOnce(&mut AssemblyArea<'_>) -> AreaResult<()>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        match self.segment.submit_request(op, build)? {
            PushOutcome::Pushed => {}
            PushOutcome::QueueFull | PushOutcome::NoFreeBuffer => {
                return Err(VardisClientError::Timeout)
            }
        }
        let mut buf = [0u8; 600];
        match self.segment.pop_confirm_wait(op, &mut buf, timeout)? {
            Some(len) => Ok(buf[..len].to_vec()),
            None => Err(VardisClientError::Timeout),
        }
    }

    /// Create a variable this node produces.
    pub fn rtdb_create(&self, request: &RtdbCreateRequest, timeout: Duration) -> Result<VardisStatus> {
        let bytes = self.rtdb_round_trip(
            RtdbOp::Create,
            |area| request.serialize(area),
            timeout,
        )?;
        let mut area = DisassemblyArea::new(&bytes);
        Ok(RtdbVarConfirm::deserialize(&mut area)?.status)
    }

    /// Delete a variable this node produces.
    pub fn rtdb_delete(&self, var_id: VarId, timeout: Duration) -> Result<VardisStatus> {
        let bytes = self.rtdb_round_trip(
            RtdbOp::Delete,
            |area| RtdbDeleteRequest { var_id }.serialize(area),
            timeout,
        )?;
        let mut area = DisassemblyArea::new(&bytes);
        Ok(RtdbVarConfirm::deserialize(&mut area)?.status)
    }

    /// Write a new value for a variable this node produces.
    pub fn rtdb_update(&self, var_id: VarId, value: &[u8], timeout: Duration) -> Result<VardisStatus> {
        let value = VarValue::new(value)?;
        let bytes = self.rtdb_round_trip(
            RtdbOp::Update,
            |area| RtdbUpdateRequest { var_id, value }.serialize(area),
            timeout,
        )?;
        let mut area = DisassemblyArea::new(&bytes);
        Ok(RtdbVarConfirm::deserialize(&mut area)?.status)
    }

    /// Read the local replica of any variable.
    pub fn rtdb_read(
        &self,
        var_id: VarId,
        buf_capacity: u16,
        timeout: Duration,
    ) -> Result<RtdbReadConfirm> {
        let bytes = self.rtdb_round_trip(
            RtdbOp::Read,
            |area| {
                RtdbReadRequest {
                    var_id,
                    buf_capacity,
                }
                .serialize(area)
            },
            timeout,
        )?;
        let mut area = DisassemblyArea::new(&bytes);
        Ok(RtdbReadConfirm::deserialize(&mut area)?)
    }

    /// Deregister from the daemon and detach.
    pub fn deregister(self) -> Result<()> {
        let request = VardisDeregisterRequest {
            client_name: WireString::new(self.client_name.as_bytes())?,
        };
        let confirm: VardisSimpleConfirm = request_confirm(
            &self.command_socket_path,
            self.command_timeout,
            VardisServiceType::Deregister,
            request.total_size(),
            |area| request.serialize(area),
        )?;
        if confirm.status != VardisStatus::Ok {
            return Err(VardisClientError::Rejected(confirm.status));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Management calls usable without a registration (operator tooling)
// ---------------------------------------------------------------------

pub fn describe_database(path: &Path, timeout: Duration) -> Result<DescribeDatabaseConfirm> {
    request_confirm(path, timeout, VardisServiceType::DescribeDatabase, 0, |_| Ok(()))
}

pub fn describe_variable(
    path: &Path,
    timeout: Duration,
    var_id: VarId,
) -> Result<DescribeVariableConfirm> {
    request_confirm(
        path,
        timeout,
        VardisServiceType::DescribeVariable,
        DescribeVariableRequest::FIXED_SIZE,
        |area| DescribeVariableRequest { var_id }.serialize(area),
    )
}

pub fn get_statistics(path: &Path, timeout: Duration) -> Result<VardisGetStatisticsConfirm> {
    request_confirm(path, timeout, VardisServiceType::GetStatistics, 0, |_| Ok(()))
}

pub fn activate(path: &Path, timeout: Duration) -> Result<VardisStatus> {
    let confirm: VardisSimpleConfirm =
        request_confirm(path, timeout, VardisServiceType::Activate, 0, |_| Ok(()))?;
    Ok(confirm.status)
}

pub fn deactivate(path: &Path, timeout: Duration) -> Result<VardisStatus> {
    let confirm: VardisSimpleConfirm =
        request_confirm(path, timeout, VardisServiceType::Deactivate, 0, |_| Ok(()))?;
    Ok(confirm.status)
}

pub fn shutdown(path: &Path, timeout: Duration) -> Result<VardisStatus> {
    let confirm: VardisSimpleConfirm =
        request_confirm(path, timeout, VardisServiceType::ShutDown, 0, |_| Ok(()))?;
    Ok(confirm.status)
}
