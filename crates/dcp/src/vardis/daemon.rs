// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Vardis daemon engine.
//!
//! The engine is itself a BP client: it registers the Vardis protocol
//! with the BP daemon (QUEUE_DROPTAIL) and owns the variable store and
//! the per-application control segments. Five threads drive it:
//!
//! - **transmitter**: every payload generation tick, assembles instruction
//!   containers into a payload and submits it to BP.
//! - **receiver**: drains BP indications, parses containers and applies
//!   them to the RTDB.
//! - **scrubber**: delete-marks variables whose soft-state timeout ran
//!   out, in batches of at most 50 slots per lock acquisition.
//! - **RTDB service**: polls every client application's request queues.
//! - **management**: answers the Vardis command socket.
//!
//! Lock order is always client segment → variable store, and no thread
//! holds more than those two.

use crate::bp::client::{BpClient, BpClientConfig, BpClientError};
use crate::bp::queueing::QueueingMode;
use crate::bp::wire::BpProtocolId;
use crate::cmdsock::{encode_message, CommandServer};
use crate::config::VardisConfig;
use crate::shm::{PushOutcome, ShmError, POLL_INTERVAL};
use crate::status::VardisStatus;
use crate::vardis::control::{RtdbOp, VardisSegment};
use crate::vardis::messages::*;
use crate::vardis::protocol::{
    self, apply_container, make_payload, parse_containers, process_payload, scrub_ids,
};
use crate::vardis::store::{VarStore, VarStoreParams, NUM_VARS};
use crate::vardis::wire::{VarId, VarSeqno, VarValue};
use crate::wire::{
    AreaResult, AssemblyArea, DisassemblyArea, TimeStamp, Transmissible, WireString,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Fatal construction error of the Vardis daemon.
#[derive(Debug)]
pub enum VardisDaemonError {
    /// Registration with the BP daemon failed.
    Bp(BpClientError),
    /// Variable store creation failed.
    Shm(ShmError),
}

impl std::fmt::Display for VardisDaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bp(e) => write!(f, "BP registration failed: {e}"),
            Self::Shm(e) => write!(f, "variable store: {e}"),
        }
    }
}

impl std::error::Error for VardisDaemonError {}

struct ClientEntry {
    name: String,
    segment: VardisSegment,
}

/// The Variable Dissemination daemon engine.
pub struct VardisDaemon {
    config: VardisConfig,
    store: VarStore,
    bp: BpClient,
    clients: Mutex<Vec<ClientEntry>>,
    exit: Arc<AtomicBool>,
}

impl VardisDaemon {
    /// Register with BP and create the variable store.
    pub fn new(config: VardisConfig) -> Result<Arc<Self>, VardisDaemonError> {
        let bp_config = BpClientConfig {
            command_socket_path: config.bp_command_socket_path.clone().into(),
            command_timeout: Duration::from_millis(config.command_socket_timeout_ms as u64),
            protocol_id: BpProtocolId::VARDIS,
            protocol_name: "vardis".to_string(),
            max_payload_size: config.max_payload_size,
            queueing_mode: QueueingMode::QueueDropTail,
            max_entries: config.queue_max_entries,
            generate_tx_confirms: false,
            shm_name: config.bp_shm_name.clone(),
        };
        let bp = BpClient::register(&bp_config).map_err(VardisDaemonError::Bp)?;
        Self::with_bp_client(config, bp)
    }

    /// Build the engine around an already-registered BP client.
    pub fn with_bp_client(
        config: VardisConfig,
        bp: BpClient,
    ) -> Result<Arc<Self>, VardisDaemonError> {
        let params = VarStoreParams {
            max_summaries: config.max_summaries,
            max_description_length: config.max_description_length,
            max_value_length: config.max_value_length,
            max_repetitions: config.max_repetitions,
            default_timeout_ms: config.variable_timeout_ms,
        };
        let store = VarStore::create(&config.store_shm_name, bp.node_id(), params)
            .map_err(VardisDaemonError::Shm)?;
        Ok(Arc::new(Self {
            config,
            store,
            bp,
            clients: Mutex::new(Vec::new()),
            exit: Arc::new(AtomicBool::new(false)),
        }))
    }

    #[must_use]
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit)
    }

    #[must_use]
    pub fn node_id(&self) -> crate::wire::NodeId {
        self.bp.node_id()
    }

    fn fatal(&self, context: &str, err: &ShmError) {
        log::error!("[VARDIS] unrecoverable fault in {context}: {err}; shutting down");
        self.exit.store(true, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        match self.store.with(|data| data.is_active()) {
            Ok(active) => active,
            Err(e) => {
                self.fatal("activity check", &e);
                false
            }
        }
    }

    // -----------------------------------------------------------------
    // Transmitter
    // -----------------------------------------------------------------

    /// One payload generation tick.
    pub fn generate_payload_tick(&self) {
        if !self.is_active() {
            return;
        }
        // Nothing to gain from generating while BP's queue is full.
        let queue_full = self
            .bp
            .segment()
            .with(|_, data, _| Ok(data.payload_queue.is_full()));
        match queue_full {
            Ok(false) => {}
            Ok(true) => {
                log::trace!("[VARDIS] BP payload queue full, skipping generation tick");
                return;
            }
            Err(e) => {
                self.fatal("generate_payload_tick", &e);
                return;
            }
        }

        let mut buf = vec![0u8; self.config.max_payload_size as usize];
        let mut area = AssemblyArea::new(&mut buf);
        let emitted = if self.config.locking_individual_containers {
            let makers = [
                protocol::make_create_variables,
                protocol::make_delete_variables,
                protocol::make_request_var_creates,
                protocol::make_summaries,
                protocol::make_updates,
                protocol::make_request_var_updates,
            ];
            let mut emitted = 0u32;
            for maker in makers {
                match self.store.with(|data| maker(data, &mut area)) {
                    Ok(true) => emitted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        self.fatal("generate_payload_tick", &e);
                        return;
                    }
                }
            }
            emitted
        } else {
            match self.store.with(|data| make_payload(data, &mut area)) {
                Ok(emitted) => emitted,
                Err(e) => {
                    self.fatal("generate_payload_tick", &e);
                    return;
                }
            }
        };

        if emitted == 0 {
            return;
        }
        let used = area.used();
        if let Err(e) = self.store.with(|data| data.counters.payloads_generated += 1) {
            self.fatal("generate_payload_tick", &e);
            return;
        }
        match self
            .bp
            .segment()
            .submit_payload(BpProtocolId::VARDIS, &buf[..used])
        {
            Ok(PushOutcome::Pushed) => {
                log::trace!("[VARDIS] submitted payload of {used} bytes ({emitted} containers)");
            }
            Ok(PushOutcome::QueueFull | PushOutcome::NoFreeBuffer) => {
                log::debug!("[VARDIS] BP request queue full, payload dropped");
            }
            Err(e) => self.fatal("generate_payload_tick", &e),
        }
    }

    // -----------------------------------------------------------------
    // Receiver
    // -----------------------------------------------------------------

    /// Drain all pending BP indications into the RTDB.
    pub fn process_indications_tick(&self) {
        let mut buf = vec![0u8; self.config.max_payload_size as usize + 64];
        loop {
            let received = match self.bp.try_receive(&mut buf) {
                Ok(received) => received,
                Err(e) => {
                    log::error!("[VARDIS] receive failed: {e}; shutting down");
                    self.exit.store(true, Ordering::SeqCst);
                    return;
                }
            };
            let Some(len) = received else { return };

            let containers = match parse_containers(&buf[..len]) {
                Ok(containers) => containers,
                Err(e) => {
                    log::debug!("[VARDIS] undecodable payload of {len} bytes dropped: {e}");
                    continue;
                }
            };
            let now = TimeStamp::now();
            let result = if self.config.locking_individual_containers {
                let mut result: Result<(), ShmError> = Ok(());
                for container in &containers {
                    result = self
                        .store
                        .with(|data| apply_container(data, container, now));
                    if result.is_err() {
                        break;
                    }
                }
                result
            } else {
                self.store
                    .with(|data| process_payload(data, &containers, now))
            };
            match result {
                Ok(()) => {
                    let _ = self
                        .store
                        .with(|data| data.counters.payloads_processed += 1);
                }
                Err(e) => {
                    self.fatal("process_indications_tick", &e);
                    return;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Scrubber
    // -----------------------------------------------------------------

    /// One scrubbing pass over the whole store, in batches of at most 50
    /// slots with the lock released in between.
    pub fn scrub_tick(&self) {
        const BATCH: usize = 50;
        if !self.is_active() {
            return;
        }
        let now = TimeStamp::now();
        let mut start = 0usize;
        while start < NUM_VARS {
            let ids: Vec<VarId> = (start..(start + BATCH).min(NUM_VARS))
                .map(|i| VarId(i as u8))
                .collect();
            if let Err(e) = self.store.with(|data| {
                scrub_ids(data, &ids, now);
            }) {
                self.fatal("scrub_tick", &e);
                return;
            }
            start += BATCH;
        }
    }

    // -----------------------------------------------------------------
    // RTDB service handler
    // -----------------------------------------------------------------

    /// Poll every client application's request queues once.
    pub fn service_clients_tick(&self) {
        if !self.is_active() {
            return;
        }
        let clients = self.clients.lock();
        for client in clients.iter() {
            for op in RtdbOp::ALL {
                let result = client
                    .segment
                    .service_requests(op, |request| self.handle_rtdb_request(op, request));
                if let Err(e) = result {
                    self.fatal("service_clients_tick", &e);
                    return;
                }
            }
        }
    }

    fn handle_rtdb_request(&self, op: RtdbOp, request: &[u8]) -> Vec<u8> {
        let now = TimeStamp::now();
        let mut area = DisassemblyArea::new(request);
        let confirm: Result<Vec<u8>, ShmError> = match op {
            RtdbOp::Create => match RtdbCreateRequest::deserialize(&mut area) {
                Ok(request) => self
                    .store
                    .with(|data| protocol::handle_create_request(data, &request, now))
                    .map(|confirm| encode_confirm(&confirm)),
                Err(_) => Ok(encode_confirm(&bad_request_confirm())),
            },
            RtdbOp::Delete => match RtdbDeleteRequest::deserialize(&mut area) {
                Ok(request) => self
                    .store
                    .with(|data| protocol::handle_delete_request(data, &request, now))
                    .map(|confirm| encode_confirm(&confirm)),
                Err(_) => Ok(encode_confirm(&bad_request_confirm())),
            },
            RtdbOp::Update => match RtdbUpdateRequest::deserialize(&mut area) {
                Ok(request) => self
                    .store
                    .with(|data| protocol::handle_update_request(data, &request, now))
                    .map(|confirm| encode_confirm(&confirm)),
                Err(_) => Ok(encode_confirm(&bad_request_confirm())),
            },
            RtdbOp::Read => match RtdbReadRequest::deserialize(&mut area) {
                Ok(request) => self
                    .store
                    .with(|data| protocol::handle_read_request(data, &request))
                    .map(|confirm| encode_confirm(&confirm)),
                Err(_) => Ok(encode_confirm(&RtdbReadConfirm {
                    status: VardisStatus::IllegalServiceType,
                    var_id: VarId(0),
                    seqno: VarSeqno(0),
                    timestamp: TimeStamp(0),
                    value: VarValue::default(),
                })),
            },
        };
        match confirm {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fatal("handle_rtdb_request", &e);
                encode_confirm(&RtdbVarConfirm {
                    status: VardisStatus::InternalSharedMemoryError,
                    var_id: VarId(0),
                })
            }
        }
    }

    // -----------------------------------------------------------------
    // Management services
    // -----------------------------------------------------------------

    pub fn register_client(&self, request: &VardisRegisterRequest) -> VardisRegisterConfirm {
        let reject = |status| VardisRegisterConfirm {
            status,
            own_node_id: crate::wire::NodeId::NULL,
        };
        let name = request.client_name.to_string_lossy();
        let mut clients = self.clients.lock();
        if clients.iter().any(|c| c.name == name) {
            return reject(VardisStatus::ApplicationAlreadyRegistered);
        }
        let Ok(shm_name) = std::str::from_utf8(request.shm_name.as_bytes()) else {
            return reject(VardisStatus::InternalSharedMemoryError);
        };
        let segment = match VardisSegment::create(shm_name) {
            Ok(segment) => segment,
            Err(e) => {
                log::warn!("[VARDIS] cannot create client segment {shm_name}: {e}");
                return reject(VardisStatus::InternalSharedMemoryError);
            }
        };
        log::info!("[VARDIS] registered application '{name}' at {shm_name}");
        clients.push(ClientEntry { name, segment });
        VardisRegisterConfirm {
            status: VardisStatus::Ok,
            own_node_id: self.bp.node_id(),
        }
    }

    pub fn deregister_client(&self, client_name: &str) -> VardisStatus {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|c| c.name != client_name);
        if clients.len() == before {
            VardisStatus::UnknownApplication
        } else {
            log::info!("[VARDIS] deregistered application '{client_name}'");
            VardisStatus::Ok
        }
    }

    pub fn describe_database(&self) -> DescribeDatabaseConfirm {
        let result = self.store.with(|data| {
            let variables = data
                .list_matching(|_| true)
                .into_iter()
                .map(|var_id| {
                    let entry = data.entry(var_id);
                    VariableDescription {
                        spec: entry.spec(var_id),
                        seqno: entry.seqno(),
                        timestamp: entry.timestamp(),
                        to_be_deleted: entry.to_be_deleted(),
                        value_length: entry.value_len,
                    }
                })
                .collect();
            (data.is_active(), variables)
        });
        match result {
            Ok((vardis_is_active, variables)) => DescribeDatabaseConfirm {
                status: VardisStatus::Ok,
                vardis_is_active,
                variables,
            },
            Err(e) => {
                self.fatal("describe_database", &e);
                DescribeDatabaseConfirm {
                    status: VardisStatus::InternalSharedMemoryError,
                    vardis_is_active: false,
                    variables: Vec::new(),
                }
            }
        }
    }

    pub fn describe_variable(&self, var_id: VarId) -> DescribeVariableConfirm {
        let failure = |status| DescribeVariableConfirm {
            status,
            spec: crate::vardis::wire::VarSpec {
                var_id,
                producer: crate::wire::NodeId::NULL,
                rep_cnt: 0,
                description: WireString::default(),
            },
            seqno: VarSeqno(0),
            timestamp: TimeStamp(0),
            to_be_deleted: false,
            count_create: 0,
            count_update: 0,
            count_delete: 0,
            value: VarValue::default(),
        };
        let result = self.store.with(|data| {
            let entry = data.entry(var_id);
            if !entry.exists() {
                return None;
            }
            Some(DescribeVariableConfirm {
                status: VardisStatus::Ok,
                spec: entry.spec(var_id),
                seqno: entry.seqno(),
                timestamp: entry.timestamp(),
                to_be_deleted: entry.to_be_deleted(),
                count_create: entry.count_create,
                count_update: entry.count_update,
                count_delete: entry.count_delete,
                value: VarValue::new(entry.value()).unwrap_or_default(),
            })
        });
        match result {
            Ok(Some(confirm)) => confirm,
            Ok(None) => failure(VardisStatus::VariableDoesNotExist),
            Err(e) => {
                self.fatal("describe_variable", &e);
                failure(VardisStatus::InternalSharedMemoryError)
            }
        }
    }

    pub fn set_active(&self, active: bool) -> VardisStatus {
        match self.store.with(|data| data.active = u8::from(active)) {
            Ok(()) => {
                log::info!(
                    "[VARDIS] {}",
                    if active { "activated" } else { "deactivated" }
                );
                VardisStatus::Ok
            }
            Err(e) => {
                self.fatal("set_active", &e);
                VardisStatus::InternalSharedMemoryError
            }
        }
    }

    pub fn statistics(&self) -> VardisGetStatisticsConfirm {
        match self.store.with(|data| data.counters) {
            Ok(counters) => VardisGetStatisticsConfirm {
                status: VardisStatus::Ok,
                counters,
            },
            Err(e) => {
                self.fatal("statistics", &e);
                VardisGetStatisticsConfirm {
                    status: VardisStatus::InternalSharedMemoryError,
                    counters: Default::default(),
                }
            }
        }
    }

    pub fn shutdown(&self) -> VardisStatus {
        log::info!("[VARDIS] shutdown requested");
        self.exit.store(true, Ordering::SeqCst);
        VardisStatus::Ok
    }

    /// Handle one command-socket request and build the confirm bytes.
    #[must_use]
    pub fn handle_command(&self, request: &[u8]) -> Vec<u8> {
        let mut area = DisassemblyArea::new(request);
        let service = area
            .read_u16()
            .ok()
            .and_then(|code| VardisServiceType::try_from(code).ok());
        let Some(service) = service else {
            return simple_reply(0, VardisStatus::IllegalServiceType);
        };
        let tag = service.code();

        match service {
            VardisServiceType::Register => match VardisRegisterRequest::deserialize(&mut area) {
                Ok(request) => {
                    let confirm = self.register_client(&request);
                    reply(tag, confirm.total_size(), |a| confirm.serialize(a))
                }
                Err(_) => simple_reply(tag, VardisStatus::IllegalServiceType),
            },
            VardisServiceType::Deregister => {
                match VardisDeregisterRequest::deserialize(&mut area) {
                    Ok(request) => simple_reply(
                        tag,
                        self.deregister_client(&request.client_name.to_string_lossy()),
                    ),
                    Err(_) => simple_reply(tag, VardisStatus::IllegalServiceType),
                }
            }
            VardisServiceType::DescribeDatabase => {
                let confirm = self.describe_database();
                reply(tag, confirm.total_size(), |a| confirm.serialize(a))
            }
            VardisServiceType::DescribeVariable => {
                match DescribeVariableRequest::deserialize(&mut area) {
                    Ok(request) => {
                        let confirm = self.describe_variable(request.var_id);
                        reply(tag, confirm.total_size(), |a| confirm.serialize(a))
                    }
                    Err(_) => simple_reply(tag, VardisStatus::IllegalServiceType),
                }
            }
            VardisServiceType::ShutDown => simple_reply(tag, self.shutdown()),
            VardisServiceType::Activate => simple_reply(tag, self.set_active(true)),
            VardisServiceType::Deactivate => simple_reply(tag, self.set_active(false)),
            VardisServiceType::GetStatistics => {
                let confirm = self.statistics();
                reply(tag, confirm.total_size(), |a| confirm.serialize(a))
            }
        }
    }

    /// Answer one pending command-socket exchange, if any.
    pub fn serve_command(&self, server: &CommandServer) -> bool {
        match server.poll_request() {
            Ok(Some(exchange)) => {
                let response = self.handle_command(exchange.request());
                if let Err(e) = exchange.reply(&response) {
                    log::warn!("[VARDIS] command reply failed: {e}");
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::warn!("[VARDIS] command socket error: {e}");
                false
            }
        }
    }

    // -----------------------------------------------------------------
    // Thread runner
    // -----------------------------------------------------------------

    /// Spawn the daemon thread pool.
    pub fn run(self: &Arc<Self>, server: CommandServer) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let daemon = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            log::info!("[VARDIS] transmitter thread starting");
            let interval =
                Duration::from_millis(daemon.config.payload_generation_interval_ms as u64);
            while !daemon.exit.load(Ordering::SeqCst) {
                crate::bp::daemon::sleep_watching_exit(&daemon.exit, interval);
                if !daemon.exit.load(Ordering::SeqCst) {
                    daemon.generate_payload_tick();
                }
            }
            log::info!("[VARDIS] transmitter thread exiting");
        }));

        let daemon = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            log::info!("[VARDIS] receiver thread starting");
            while !daemon.exit.load(Ordering::SeqCst) {
                daemon.process_indications_tick();
                std::thread::sleep(POLL_INTERVAL);
            }
            log::info!("[VARDIS] receiver thread exiting");
        }));

        let daemon = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            log::info!("[VARDIS] scrubber thread starting");
            let period = Duration::from_millis(daemon.config.scrubbing_period_ms as u64);
            let mut last_scrub = std::time::Instant::now();
            while !daemon.exit.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(100).min(period));
                if last_scrub.elapsed() >= period {
                    last_scrub = std::time::Instant::now();
                    daemon.scrub_tick();
                }
            }
            log::info!("[VARDIS] scrubber thread exiting");
        }));

        let daemon = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            log::info!("[VARDIS] RTDB service thread starting");
            let interval =
                Duration::from_millis(daemon.config.poll_rtdb_service_interval_ms as u64);
            while !daemon.exit.load(Ordering::SeqCst) {
                crate::bp::daemon::sleep_watching_exit(&daemon.exit, interval);
                if !daemon.exit.load(Ordering::SeqCst) {
                    daemon.service_clients_tick();
                }
            }
            log::info!("[VARDIS] RTDB service thread exiting");
        }));

        let daemon = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            log::info!("[VARDIS] management thread starting on {:?}", server.path());
            while !daemon.exit.load(Ordering::SeqCst) {
                if !daemon.serve_command(&server) {
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
            log::info!("[VARDIS] management thread exiting");
        }));

        handles
    }
}

fn encode_confirm<T: Transmissible>(confirm: &T) -> Vec<u8> {
    encode_message(confirm.total_size(), |area| confirm.serialize(area))
}

fn bad_request_confirm() -> RtdbVarConfirm {
    RtdbVarConfirm {
        status: VardisStatus::IllegalServiceType,
        var_id: VarId(0),
    }
}

fn reply<F>(service_type: u16, body_size: usize, build: F) -> Vec<u8>
where
    F: FnOnce(&mut AssemblyArea<'_>) -> AreaResult<()>,
{
    encode_message(2 + body_size, |area| {
        area.write_u16(service_type)?;
        build(area)
    })
}

fn simple_reply(service_type: u16, status: VardisStatus) -> Vec<u8> {
    reply(service_type, VardisSimpleConfirm::FIXED_SIZE, |area| {
        VardisSimpleConfirm { status }.serialize(area)
    })
}
