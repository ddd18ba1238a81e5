// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! BP client library.
//!
//! A client registers its protocol over the command socket, attaches the
//! control segment the daemon created, and from then on talks to BP purely
//! through shared memory: payload submissions into the transmit request
//! queue, received payloads out of the indication queue.

use crate::bp::control::BpSegment;
use crate::bp::messages::*;
use crate::bp::queueing::QueueingMode;
use crate::bp::wire::BpProtocolId;
use crate::cmdsock::{encode_message, round_trip, CmdSockError};
use crate::shm::ShmError;
use crate::status::BpStatus;
use crate::wire::{AreaError, AreaResult, AssemblyArea, DisassemblyArea, NodeId, Transmissible, WireString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// BP client error.
#[derive(Debug)]
pub enum BpClientError {
    Socket(CmdSockError),
    Shm(ShmError),
    Encoding(AreaError),
    /// The daemon answered with a non-OK status.
    Rejected(BpStatus),
    /// The daemon answered with a different service type than asked.
    UnexpectedReply,
    /// A shared-memory wait ran out of time.
    Timeout,
}

impl fmt::Display for BpClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "command socket: {e}"),
            Self::Shm(e) => write!(f, "shared memory: {e}"),
            Self::Encoding(e) => write!(f, "message encoding: {e}"),
            Self::Rejected(status) => write!(f, "daemon rejected request: {status}"),
            Self::UnexpectedReply => write!(f, "daemon answered with wrong service type"),
            Self::Timeout => write!(f, "shared memory operation timed out"),
        }
    }
}

impl std::error::Error for BpClientError {}

impl From<CmdSockError> for BpClientError {
    fn from(e: CmdSockError) -> Self {
        Self::Socket(e)
    }
}
impl From<ShmError> for BpClientError {
    fn from(e: ShmError) -> Self {
        Self::Shm(e)
    }
}
impl From<AreaError> for BpClientError {
    fn from(e: AreaError) -> Self {
        Self::Encoding(e)
    }
}

/// Result type for BP client operations.
pub type Result<T> = std::result::Result<T, BpClientError>;

/// Registration parameters of a BP client.
#[derive(Debug, Clone)]
pub struct BpClientConfig {
    pub command_socket_path: PathBuf,
    pub command_timeout: Duration,
    pub protocol_id: BpProtocolId,
    pub protocol_name: String,
    pub max_payload_size: u16,
    pub queueing_mode: QueueingMode,
    pub max_entries: u16,
    pub generate_tx_confirms: bool,
    /// Segment name this client chooses; must be unused on the daemon side.
    pub shm_name: String,
}

fn request_confirm<C, F>(
    path: &Path,
    timeout: Duration,
    service: BpServiceType,
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
        return Err(BpClientError::UnexpectedReply);
    }
    Ok(C::deserialize(&mut area)?)
}

/// Registered BP client protocol.
pub struct BpClient {
    protocol_id: BpProtocolId,
    max_payload_size: u16,
    own_node_id: NodeId,
    segment: BpSegment,
    command_socket_path: PathBuf,
    command_timeout: Duration,
}

impl BpClient {
    /// Register with the daemon and attach the freshly created segment.
    pub fn register(config: &BpClientConfig) -> Result<Self> {
        let request = RegisterProtocolRequest {
            protocol_id: config.protocol_id,
            protocol_name: WireString::new(config.protocol_name.as_bytes())?,
            max_payload_size: config.max_payload_size,
            queueing_mode: config.queueing_mode as u8,
            max_entries: config.max_entries,
            generate_tx_confirms: config.generate_tx_confirms,
            shm_name: WireString::new(config.shm_name.as_bytes())?,
        };
        let confirm: RegisterProtocolConfirm = request_confirm(
            &config.command_socket_path,
            config.command_timeout,
            BpServiceType::RegisterProtocol,
            request.total_size(),
            |area| request.serialize(area),
        )?;
        if confirm.status != BpStatus::Ok {
            return Err(BpClientError::Rejected(confirm.status));
        }
        let segment = BpSegment::attach(
            &config.shm_name,
            config.max_payload_size,
            config.max_entries,
        )?;
        log::info!(
            "[BP] client {} registered at node {}",
            config.protocol_id,
            confirm.own_node_id
        );
        Ok(Self {
            protocol_id: config.protocol_id,
            max_payload_size: config.max_payload_size,
            own_node_id: confirm.own_node_id,
            segment,
            command_socket_path: config.command_socket_path.clone(),
            command_timeout: config.command_timeout,
        })
    }

    /// Node identifier reported by the daemon at registration.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.own_node_id
    }

    #[must_use]
    pub fn protocol_id(&self) -> BpProtocolId {
        self.protocol_id
    }

    /// Direct handle on the shared control segment (daemon-in-library use).
    #[must_use]
    pub fn segment(&self) -> &BpSegment {
        &self.segment
    }

    /// Submit one payload for beaconing.
    pub fn transmit_payload(&self, payload: &[u8], timeout: Duration) -> Result<()> {
        if payload.is_empty() {
            return Err(BpClientError::Rejected(BpStatus::EmptyPayload));
        }
        if payload.len() > self.max_payload_size as usize {
            return Err(BpClientError::Rejected(BpStatus::PayloadTooLarge));
        }
        if self
            .segment
            .submit_payload_wait(self.protocol_id, payload, timeout)?
        {
            Ok(())
        } else {
            Err(BpClientError::Timeout)
        }
    }

    /// Take one received payload, if any.
    pub fn try_receive(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        Ok(self.segment.pop_indication(buf)?)
    }

    /// Take one received payload, waiting up to `timeout`.
    pub fn receive_wait(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        Ok(self.segment.pop_indication_wait(buf, timeout)?)
    }

    /// Take one transmit confirm, if any.
    pub fn poll_transmit_confirm(&self) -> Result<Option<BpStatus>> {
        Ok(self.segment.pop_transmit_confirm()?)
    }

    /// Deregister from the daemon and detach.
    pub fn deregister(self) -> Result<()> {
        let confirm: BpSimpleConfirm = request_confirm(
            &self.command_socket_path,
            self.command_timeout,
            BpServiceType::DeregisterProtocol,
            ProtocolIdRequest::FIXED_SIZE,
            |area| {
                ProtocolIdRequest {
                    protocol_id: self.protocol_id,
                }
                .serialize(area)
            },
        )?;
        if confirm.status != BpStatus::Ok {
            return Err(BpClientError::Rejected(confirm.status));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Management calls usable without a registration (operator tooling)
// ---------------------------------------------------------------------

pub fn list_registered_protocols(
    path: &Path,
    timeout: Duration,
) -> Result<ListRegisteredProtocolsConfirm> {
    request_confirm(path, timeout, BpServiceType::ListRegisteredProtocols, 0, |_| Ok(()))
}

pub fn get_statistics(path: &Path, timeout: Duration) -> Result<BpGetStatisticsConfirm> {
    request_confirm(path, timeout, BpServiceType::GetStatistics, 0, |_| Ok(()))
}

pub fn activate(path: &Path, timeout: Duration) -> Result<BpStatus> {
    let confirm: BpSimpleConfirm =
        request_confirm(path, timeout, BpServiceType::Activate, 0, |_| Ok(()))?;
    Ok(confirm.status)
}

pub fn deactivate(path: &Path, timeout: Duration) -> Result<BpStatus> {
    let confirm: BpSimpleConfirm =
        request_confirm(path, timeout, BpServiceType::Deactivate, 0, |_| Ok(()))?;
    Ok(confirm.status)
}

pub fn shutdown(path: &Path, timeout: Duration) -> Result<BpStatus> {
    let confirm: BpSimpleConfirm =
        request_confirm(path, timeout, BpServiceType::ShutDown, 0, |_| Ok(()))?;
    Ok(confirm.status)
}

pub fn clear_buffer(path: &Path, timeout: Duration, protocol_id: BpProtocolId) -> Result<BpStatus> {
    let confirm: BpSimpleConfirm = request_confirm(
        path,
        timeout,
        BpServiceType::ClearBuffer,
        ProtocolIdRequest::FIXED_SIZE,
        |area| ProtocolIdRequest { protocol_id }.serialize(area),
    )?;
    Ok(confirm.status)
}

pub fn query_buffered_payloads(
    path: &Path,
    timeout: Duration,
    protocol_id: BpProtocolId,
) -> Result<QueryNumberBufferedPayloadsConfirm> {
    request_confirm(
        path,
        timeout,
        BpServiceType::QueryNumberBufferedPayloads,
        ProtocolIdRequest::FIXED_SIZE,
        |area| ProtocolIdRequest { protocol_id }.serialize(area),
    )
}
