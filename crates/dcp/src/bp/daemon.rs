// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! BP daemon engine.
//!
//! The engine owns the registration table and the per-client control
//! segments; four threads drive it:
//!
//! - **transmitter**: sleeps a jittered beacon period, composes one frame
//!   from the registered clients' payload sources, hands it to the
//!   transport, then pushes transmit confirms.
//! - **receiver**: blocks on the transport with a short timeout, parses
//!   frames and demultiplexes payload records into client segments.
//! - **service**: drains each client's transmit request queue into its
//!   payload source according to the queueing mode.
//! - **management**: answers the command socket.
//!
//! Every thread watches the shared exit flag; unrecoverable shared-memory
//! faults set it so a supervisor can restart the daemon.

use crate::bp::control::{BpSegment, BpStaticClientInfo, MAX_QUEUE_ENTRIES};
use crate::bp::messages::*;
use crate::bp::queueing::QueueingMode;
use crate::bp::stats::BpStats;
use crate::bp::transport::BeaconTransport;
use crate::bp::wire::{BeaconHeader, BpProtocolId, PayloadHeader};
use crate::cmdsock::{encode_message, CommandServer};
use crate::config::BpConfig;
use crate::shm::{PushOutcome, ShmError, POLL_INTERVAL};
use crate::status::BpStatus;
use crate::wire::{AreaResult, AssemblyArea, DisassemblyArea, NodeId, TimeStamp, Transmissible};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct RegisteredClient {
    protocol_id: BpProtocolId,
    mode: QueueingMode,
    segment: BpSegment,
    cnt_outgoing: u64,
    cnt_received: u64,
    cnt_dropped_outgoing: u64,
    cnt_dropped_incoming: u64,
}

struct BpState {
    active: bool,
    seqno: u32,
    /// Registration order is beacon-assembly order.
    clients: Vec<RegisteredClient>,
    stats: BpStats,
}

/// Result of one beacon composition.
pub struct ComposedBeacon {
    pub len: usize,
    /// Clients whose payload was taken and who asked for confirms.
    pub confirm: Vec<BpProtocolId>,
}

enum Taken {
    /// A payload was emitted into the beacon.
    Emitted { confirm: bool },
    /// This client has nothing to send right now.
    Nothing,
    /// The pending payload does not fit anymore; stop assembling.
    Overflow,
}

/// The Beaconing Protocol daemon engine.
pub struct BpDaemon {
    config: BpConfig,
    node_id: NodeId,
    exit: Arc<AtomicBool>,
    state: Mutex<BpState>,
}

impl BpDaemon {
    #[must_use]
    pub fn new(config: BpConfig, node_id: NodeId) -> Arc<Self> {
        let stats = BpStats::new(
            config.beacon_size_ewma_alpha,
            config.inter_beacon_time_ewma_alpha,
        );
        Arc::new(Self {
            config,
            node_id,
            exit: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(BpState {
                active: true,
                seqno: 0,
                clients: Vec::new(),
                stats,
            }),
        })
    }

    #[must_use]
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit)
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn fatal(&self, context: &str, err: &ShmError) {
        log::error!("[BP] unrecoverable fault in {context}: {err}; shutting down");
        self.exit.store(true, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------
    // Management services
    // -----------------------------------------------------------------

    pub fn register(&self, request: &RegisterProtocolRequest) -> RegisterProtocolConfirm {
        let reject = |status| RegisterProtocolConfirm {
            status,
            own_node_id: NodeId::NULL,
        };

        let mut state = self.state.lock();
        if state
            .clients
            .iter()
            .any(|c| c.protocol_id == request.protocol_id)
        {
            return reject(BpStatus::ProtocolAlreadyRegistered);
        }
        if request.max_payload_size == 0
            || request.max_payload_size > self.config.max_client_payload_size()
        {
            return reject(BpStatus::IllegalMaxPayloadSize);
        }
        let Ok(mode) = QueueingMode::try_from(request.queueing_mode) else {
            return reject(BpStatus::UnknownQueueingMode);
        };
        if mode.uses_queue()
            && (request.max_entries == 0 || request.max_entries > MAX_QUEUE_ENTRIES)
        {
            return reject(BpStatus::IllegalDroppingQueueSize);
        }
        let Ok(shm_name) = std::str::from_utf8(request.shm_name.as_bytes()) else {
            return reject(BpStatus::InternalSharedMemoryError);
        };

        let info = BpStaticClientInfo::new(
            request.protocol_id,
            request.protocol_name.as_bytes(),
            request.max_payload_size,
            request.queueing_mode,
            request.max_entries,
            request.generate_tx_confirms,
        );
        let segment = match BpSegment::create(shm_name, info) {
            Ok(segment) => segment,
            Err(e) => {
                log::warn!(
                    "[BP] cannot create control segment {shm_name} for {}: {e}",
                    request.protocol_id
                );
                return reject(BpStatus::InternalSharedMemoryError);
            }
        };

        log::info!(
            "[BP] registered protocol {} ({}) mode={mode} maxPayload={} shm={shm_name}",
            request.protocol_id,
            request.protocol_name,
            request.max_payload_size
        );
        state.clients.push(RegisteredClient {
            protocol_id: request.protocol_id,
            mode,
            segment,
            cnt_outgoing: 0,
            cnt_received: 0,
            cnt_dropped_outgoing: 0,
            cnt_dropped_incoming: 0,
        });
        RegisterProtocolConfirm {
            status: BpStatus::Ok,
            own_node_id: self.node_id,
        }
    }

    pub fn deregister(&self, protocol_id: BpProtocolId) -> BpStatus {
        let mut state = self.state.lock();
        let before = state.clients.len();
        state.clients.retain(|c| c.protocol_id != protocol_id);
        if state.clients.len() == before {
            BpStatus::UnknownProtocol
        } else {
            log::info!("[BP] deregistered protocol {protocol_id}");
            BpStatus::Ok
        }
    }

    pub fn list_registered_protocols(&self) -> ListRegisteredProtocolsConfirm {
        let state = self.state.lock();
        let mut protocols = Vec::with_capacity(state.clients.len());
        for client in &state.clients {
            let Ok(info) = client.segment.info() else {
                continue;
            };
            protocols.push(ProtocolDescription {
                protocol_id: client.protocol_id,
                protocol_name: crate::wire::WireString::new(info.protocol_name().as_bytes())
                    .unwrap_or_default(),
                max_payload_size: info.max_payload_size,
                queueing_mode: info.queueing_mode,
                max_entries: info.max_entries,
                generate_tx_confirms: info.wants_tx_confirms(),
                registered_at: TimeStamp(info.registered_at_us),
                cnt_outgoing_payloads: client.cnt_outgoing,
                cnt_received_payloads: client.cnt_received,
                cnt_dropped_outgoing_payloads: client.cnt_dropped_outgoing,
                cnt_dropped_incoming_payloads: client.cnt_dropped_incoming,
            });
        }
        ListRegisteredProtocolsConfirm {
            status: BpStatus::Ok,
            bp_is_active: state.active,
            protocols,
        }
    }

    pub fn clear_buffer(&self, protocol_id: BpProtocolId) -> BpStatus {
        let state = self.state.lock();
        let Some(client) = state.clients.iter().find(|c| c.protocol_id == protocol_id) else {
            return BpStatus::UnknownProtocol;
        };
        let result = client.segment.with(|_, data, _| {
            while let Ok(mut desc) = data.payload_queue.pop() {
                desc.clear();
                data.free_list.push(desc).map_err(|e| {
                    ShmError::Corruption(format!("free list rejects cleared chunk: {e}"))
                })?;
            }
            data.single_buffer.clear();
            Ok(())
        });
        match result {
            Ok(()) => BpStatus::Ok,
            Err(e) => {
                self.fatal("clear_buffer", &e);
                BpStatus::InternalSharedMemoryError
            }
        }
    }

    pub fn query_buffered_payloads(
        &self,
        protocol_id: BpProtocolId,
    ) -> QueryNumberBufferedPayloadsConfirm {
        let state = self.state.lock();
        let Some(client) = state.clients.iter().find(|c| c.protocol_id == protocol_id) else {
            return QueryNumberBufferedPayloadsConfirm {
                status: BpStatus::UnknownProtocol,
                num_payloads_buffered: 0,
            };
        };
        let count = client
            .segment
            .with(|_, data, _| {
                Ok(data.payload_queue.stored() as u32
                    + u32::from(!data.single_buffer.is_vacant()))
            })
            .unwrap_or(0);
        QueryNumberBufferedPayloadsConfirm {
            status: BpStatus::Ok,
            num_payloads_buffered: count,
        }
    }

    pub fn set_active(&self, active: bool) -> BpStatus {
        self.state.lock().active = active;
        log::info!(
            "[BP] {}",
            if active { "activated" } else { "deactivated" }
        );
        BpStatus::Ok
    }

    pub fn statistics(&self) -> BpGetStatisticsConfirm {
        let state = self.state.lock();
        BpGetStatisticsConfirm {
            status: BpStatus::Ok,
            avg_inter_beacon_time_ms: state.stats.avg_inter_beacon_time.get(),
            avg_beacon_size: state.stats.avg_beacon_size.get(),
            cnt_beacons_sent: state.stats.beacons_sent,
            cnt_beacons_received: state.stats.beacons_received,
            cnt_dropped_unknown: state.stats.dropped_unknown,
            cnt_dropped_incoming: state.stats.dropped_incoming,
            cnt_dropped_outgoing: state.stats.dropped_outgoing,
        }
    }

    pub fn shutdown(&self) -> BpStatus {
        log::info!("[BP] shutdown requested");
        self.exit.store(true, Ordering::SeqCst);
        BpStatus::Ok
    }

    // -----------------------------------------------------------------
    // Service thread: move submitted payloads into payload sources
    // -----------------------------------------------------------------

    /// Drain every client's transmit request queue into its payload
    /// source according to its queueing mode.
    pub fn drain_transmit_requests(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        for client in &mut state.clients {
            let mode = client.mode;
            let result = client.segment.with(|guard, data, pool| {
                let mut dropped = 0u64;
                let mut malformed = 0u64;
                let max_payload = data.info.max_payload_size;
                while let Ok(desc) = data.tx_requests.pop() {
                    // Validate the submission before holding on to it.
                    let header = {
                        let bytes = pool.chunk(guard, &desc)?;
                        let mut area = DisassemblyArea::new(bytes);
                        TransmitPayloadRequest::deserialize(&mut area).ok()
                    };
                    let valid = header.is_some_and(|h| {
                        h.length > 0
                            && h.length <= max_payload
                            && h.length as usize + TransmitPayloadRequest::FIXED_SIZE
                                == desc.used_len as usize
                    });
                    if !valid {
                        malformed += 1;
                        let mut desc = desc;
                        desc.clear();
                        data.free_list.push(desc).map_err(|e| {
                            ShmError::Corruption(format!("free list full on request drop: {e}"))
                        })?;
                        continue;
                    }

                    match mode {
                        QueueingMode::Once | QueueingMode::Repeat => {
                            // Latest submission overwrites the single buffer.
                            let used = desc.used_len as usize;
                            let src = pool.chunk(guard, &desc)?.to_vec();
                            let single = data.single_buffer;
                            let dst = pool.chunk_mut(guard, &single)?;
                            dst[..used].copy_from_slice(&src);
                            data.single_buffer.used_len = used as u32;
                            let mut desc = desc;
                            desc.clear();
                            data.free_list.push(desc).map_err(|e| {
                                ShmError::Corruption(format!("free list full: {e}"))
                            })?;
                        }
                        QueueingMode::QueueDropTail => {
                            if data.payload_queue.is_full() {
                                dropped += 1;
                                let mut desc = desc;
                                desc.clear();
                                data.free_list.push(desc).map_err(|e| {
                                    ShmError::Corruption(format!("free list full: {e}"))
                                })?;
                            } else {
                                data.payload_queue.push(desc).map_err(|e| {
                                    ShmError::Corruption(format!("payload queue: {e}"))
                                })?;
                            }
                        }
                        QueueingMode::QueueDropHead => {
                            if data.payload_queue.is_full() {
                                if let Ok(mut oldest) = data.payload_queue.pop() {
                                    dropped += 1;
                                    oldest.clear();
                                    data.free_list.push(oldest).map_err(|e| {
                                        ShmError::Corruption(format!("free list full: {e}"))
                                    })?;
                                }
                            }
                            data.payload_queue.push(desc).map_err(|e| {
                                ShmError::Corruption(format!("payload queue: {e}"))
                            })?;
                        }
                    }
                }
                Ok((dropped, malformed))
            });
            match result {
                Ok((dropped, malformed)) => {
                    client.cnt_dropped_outgoing += dropped;
                    state.stats.dropped_outgoing += dropped + malformed;
                }
                Err(e) => {
                    self.fatal("drain_transmit_requests", &e);
                    return;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Transmitter
    // -----------------------------------------------------------------

    /// Draw the next inter-beacon sleep from `[(1-j)T, (1+j)T]`.
    #[must_use]
    pub fn next_beacon_period(&self) -> Duration {
        let t = self.config.avg_beacon_period_ms as f64;
        let j = self.config.jitter_factor;
        let factor = 1.0 - j + 2.0 * j * fastrand::f64();
        Duration::from_micros((t * factor * 1000.0) as u64)
    }

    /// Compose one beacon into `frame`. Returns `None` when inactive or
    /// when no client had a payload (the beacon is dropped).
    pub fn compose_beacon(&self, frame: &mut [u8]) -> Option<ComposedBeacon> {
        let mut state = self.state.lock();
        if !state.active {
            return None;
        }
        let max = (self.config.max_beacon_size as usize).min(frame.len());
        let mut area = AssemblyArea::new(&mut frame[..max]);
        let header = BeaconHeader::new(self.node_id, state.seqno);
        // The frame buffer is at least maxBeaconSize; the fixed header
        // always fits.
        header.serialize(&mut area).ok()?;

        let mut num_payloads: u8 = 0;
        let mut confirm = Vec::new();
        let state_ref = &mut *state;
        for client in &mut state_ref.clients {
            let mode = client.mode;
            let taken = client.segment.with(|guard, data, pool| {
                let desc = match mode {
                    QueueingMode::Once | QueueingMode::Repeat => {
                        if data.single_buffer.is_vacant() {
                            return Ok(Taken::Nothing);
                        }
                        data.single_buffer
                    }
                    _ => match data.payload_queue.peek() {
                        Ok(desc) => desc,
                        Err(_) => return Ok(Taken::Nothing),
                    },
                };

                let bytes = pool.chunk(guard, &desc)?;
                let mut chunk_area = DisassemblyArea::new(bytes);
                let Ok(request) = TransmitPayloadRequest::deserialize(&mut chunk_area) else {
                    return Err(ShmError::Corruption(
                        "undecodable transmit request in payload source".into(),
                    ));
                };
                let payload = chunk_area
                    .read_slice(request.length as usize)
                    .map_err(|_| {
                        ShmError::Corruption("payload source shorter than its header".into())
                    })?;

                if area.available() < PayloadHeader::FIXED_WIRE_SIZE + payload.len() {
                    // Keep the payload for a later beacon.
                    return Ok(Taken::Overflow);
                }
                let payload_header = PayloadHeader {
                    protocol_id: request.protocol_id,
                    length: request.length,
                };
                // Fits by the check above.
                let _ = payload_header.serialize(&mut area);
                let _ = area.write_bytes(payload);

                let wants_confirm = data.info.wants_tx_confirms();
                match mode {
                    QueueingMode::Once => data.single_buffer.clear(),
                    QueueingMode::Repeat => {}
                    _ => {
                        if let Ok(mut taken) = data.payload_queue.pop() {
                            taken.clear();
                            data.free_list.push(taken).map_err(|e| {
                                ShmError::Corruption(format!("free list full: {e}"))
                            })?;
                        }
                    }
                }
                Ok(Taken::Emitted {
                    confirm: wants_confirm,
                })
            });

            match taken {
                Ok(Taken::Emitted { confirm: wants }) => {
                    num_payloads += 1;
                    client.cnt_outgoing += 1;
                    if wants {
                        confirm.push(client.protocol_id);
                    }
                }
                Ok(Taken::Nothing) => {}
                Ok(Taken::Overflow) => break,
                Err(e) => {
                    self.fatal("compose_beacon", &e);
                    return None;
                }
            }
        }

        if num_payloads == 0 {
            return None;
        }

        let len = area.used();
        let payload_bytes = (len - BeaconHeader::FIXED_WIRE_SIZE) as u16;
        let _ = area.patch(BeaconHeader::LENGTH_OFFSET, &payload_bytes.to_be_bytes());
        let _ = area.patch(BeaconHeader::NUM_PAYLOADS_OFFSET, &[num_payloads]);

        state.seqno = state.seqno.wrapping_add(1);
        state.stats.beacons_sent += 1;
        state.stats.avg_beacon_size.update(len as f64);
        Some(ComposedBeacon { len, confirm })
    }

    /// Push OK transmit confirms after the frame reached the transport.
    pub fn confirm_transmissions(&self, protocols: &[BpProtocolId]) {
        let state = self.state.lock();
        for protocol_id in protocols {
            if let Some(client) = state.clients.iter().find(|c| c.protocol_id == *protocol_id) {
                if let Err(e) = client.segment.push_transmit_confirm(BpStatus::Ok) {
                    self.fatal("confirm_transmissions", &e);
                    return;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Receiver
    // -----------------------------------------------------------------

    /// Parse a received frame and route its payloads to client segments.
    pub fn handle_frame(&self, frame: &[u8]) {
        let mut state = self.state.lock();
        let mut area = DisassemblyArea::new(frame);
        let Ok(header) = BeaconHeader::deserialize(&mut area) else {
            state.stats.dropped_unknown += 1;
            return;
        };
        if !header.is_well_formed(self.node_id) {
            state.stats.dropped_unknown += 1;
            return;
        }
        state.stats.record_foreign_beacon(TimeStamp::now());

        let state = &mut *state;
        for _ in 0..header.num_payloads {
            let Ok(payload_header) = PayloadHeader::deserialize(&mut area) else {
                state.stats.dropped_unknown += 1;
                return;
            };
            let Ok(payload) = area.read_slice(payload_header.length as usize) else {
                state.stats.dropped_unknown += 1;
                return;
            };
            let Some(client) = state
                .clients
                .iter_mut()
                .find(|c| c.protocol_id == payload_header.protocol_id)
            else {
                state.stats.dropped_unknown += 1;
                continue;
            };
            match client.segment.push_indication(payload) {
                Ok(PushOutcome::Pushed) => client.cnt_received += 1,
                Ok(PushOutcome::QueueFull | PushOutcome::NoFreeBuffer) => {
                    client.cnt_dropped_incoming += 1;
                    state.stats.dropped_incoming += 1;
                }
                Err(e) => {
                    self.fatal("handle_frame", &e);
                    return;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Management thread: command socket dispatch
    // -----------------------------------------------------------------

    /// Handle one command-socket request and build the confirm bytes.
    #[must_use]
    pub fn handle_command(&self, request: &[u8]) -> Vec<u8> {
        let mut area = DisassemblyArea::new(request);
        let service = area
            .read_u16()
            .ok()
            .and_then(|code| BpServiceType::try_from(code).ok());
        let Some(service) = service else {
            return simple_reply(0, BpStatus::IllegalServiceType);
        };
        let tag = service.code();

        match service {
            BpServiceType::RegisterProtocol => {
                match RegisterProtocolRequest::deserialize(&mut area) {
                    Ok(request) => {
                        let confirm = self.register(&request);
                        reply(tag, confirm.total_size(), |a| confirm.serialize(a))
                    }
                    Err(_) => simple_reply(tag, BpStatus::IllegalServiceType),
                }
            }
            BpServiceType::DeregisterProtocol => match ProtocolIdRequest::deserialize(&mut area) {
                Ok(request) => simple_reply(tag, self.deregister(request.protocol_id)),
                Err(_) => simple_reply(tag, BpStatus::IllegalServiceType),
            },
            BpServiceType::ListRegisteredProtocols => {
                let confirm = self.list_registered_protocols();
                reply(tag, confirm.total_size(), |a| confirm.serialize(a))
            }
            BpServiceType::ClearBuffer => match ProtocolIdRequest::deserialize(&mut area) {
                Ok(request) => simple_reply(tag, self.clear_buffer(request.protocol_id)),
                Err(_) => simple_reply(tag, BpStatus::IllegalServiceType),
            },
            BpServiceType::QueryNumberBufferedPayloads => {
                match ProtocolIdRequest::deserialize(&mut area) {
                    Ok(request) => {
                        let confirm = self.query_buffered_payloads(request.protocol_id);
                        reply(tag, confirm.total_size(), |a| confirm.serialize(a))
                    }
                    Err(_) => simple_reply(tag, BpStatus::IllegalServiceType),
                }
            }
            BpServiceType::ShutDown => simple_reply(tag, self.shutdown()),
            BpServiceType::Activate => simple_reply(tag, self.set_active(true)),
            BpServiceType::Deactivate => simple_reply(tag, self.set_active(false)),
            BpServiceType::GetStatistics => {
                let confirm = self.statistics();
                reply(tag, confirm.total_size(), |a| confirm.serialize(a))
            }
        }
    }

    /// Answer one pending command-socket exchange, if any. Returns whether
    /// an exchange was served.
    pub fn serve_command(&self, server: &CommandServer) -> bool {
        match server.poll_request() {
            Ok(Some(exchange)) => {
                let response = self.handle_command(exchange.request());
                if let Err(e) = exchange.reply(&response) {
                    log::warn!("[BP] command reply failed: {e}");
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::warn!("[BP] command socket error: {e}");
                false
            }
        }
    }

    // -----------------------------------------------------------------
    // Thread runner
    // -----------------------------------------------------------------

    /// Spawn the daemon thread pool. `tx` and `rx` are two handles onto
    /// the same medium (separate handles keep the send path from blocking
    /// behind the receive timeout).
    pub fn run(
        self: &Arc<Self>,
        mut tx: impl BeaconTransport + 'static,
        mut rx: impl BeaconTransport + 'static,
        server: CommandServer,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let daemon = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            log::info!("[BP] transmitter thread starting");
            let mut frame = vec![0u8; daemon.config.max_beacon_size as usize];
            while !daemon.exit.load(Ordering::SeqCst) {
                sleep_watching_exit(&daemon.exit, daemon.next_beacon_period());
                if daemon.exit.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(composed) = daemon.compose_beacon(&mut frame) {
                    if let Err(e) = tx.send(&frame[..composed.len]) {
                        log::warn!("[BP] beacon transmission failed: {e}");
                        continue;
                    }
                    daemon.confirm_transmissions(&composed.confirm);
                }
            }
            log::info!("[BP] transmitter thread exiting");
        }));

        let daemon = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            log::info!("[BP] receiver thread starting");
            let mut buf = vec![0u8; u16::MAX as usize];
            while !daemon.exit.load(Ordering::SeqCst) {
                match rx.recv(&mut buf, Duration::from_millis(10)) {
                    Ok(Some(len)) => daemon.handle_frame(&buf[..len]),
                    Ok(None) => {}
                    Err(e) => {
                        log::error!("[BP] transport receive failed: {e}; shutting down");
                        daemon.exit.store(true, Ordering::SeqCst);
                    }
                }
            }
            log::info!("[BP] receiver thread exiting");
        }));

        let daemon = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            log::info!("[BP] service thread starting");
            while !daemon.exit.load(Ordering::SeqCst) {
                std::thread::sleep(POLL_INTERVAL);
                daemon.drain_transmit_requests();
            }
            log::info!("[BP] service thread exiting");
        }));

        let daemon = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            log::info!("[BP] management thread starting on {:?}", server.path());
            while !daemon.exit.load(Ordering::SeqCst) {
                if !daemon.serve_command(&server) {
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
            log::info!("[BP] management thread exiting");
        }));

        handles
    }
}

/// Sleep `total`, waking at ≤10 ms granularity to observe the exit flag.
pub fn sleep_watching_exit(exit: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(10);
    let mut remaining = total;
    while !exit.load(Ordering::SeqCst) && !remaining.is_zero() {
        let slice = remaining.min(step);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
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

fn simple_reply(service_type: u16, status: BpStatus) -> Vec<u8> {
    reply(service_type, BpSimpleConfirm::FIXED_SIZE, |area| {
        BpSimpleConfirm { status }.serialize(area)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bp::control::BpSegment;
    use crate::wire::WireString;

    fn unique_shm(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/dcp_bpd_{tag}_{ts}")
    }

    fn daemon() -> Arc<BpDaemon> {
        BpDaemon::new(BpConfig::default(), NodeId([0xaa, 0, 0, 0, 0, 1]))
    }

    fn register_request(tag: &str, mode: u8) -> RegisterProtocolRequest {
        RegisterProtocolRequest {
            protocol_id: BpProtocolId(0xabcd),
            protocol_name: WireString::new(b"testproto").unwrap(),
            max_payload_size: 100,
            queueing_mode: mode,
            max_entries: 4,
            generate_tx_confirms: false,
            shm_name: WireString::new(unique_shm(tag).as_bytes()).unwrap(),
        }
    }

    fn attach(request: &RegisterProtocolRequest) -> BpSegment {
        let name = std::str::from_utf8(request.shm_name.as_bytes()).unwrap();
        BpSegment::attach(name, request.max_payload_size, request.max_entries)
            .expect("attach failed")
    }

    #[test]
    fn test_register_and_duplicate() {
        let daemon = daemon();
        let request = register_request("dup", 1);
        let confirm = daemon.register(&request);
        assert_eq!(confirm.status, BpStatus::Ok);
        assert_eq!(confirm.own_node_id, daemon.node_id());

        let confirm = daemon.register(&request);
        assert_eq!(confirm.status, BpStatus::ProtocolAlreadyRegistered);
    }

    #[test]
    fn test_register_rejections() {
        let daemon = daemon();

        let mut request = register_request("rej1", 1);
        request.max_payload_size = 5000;
        assert_eq!(
            daemon.register(&request).status,
            BpStatus::IllegalMaxPayloadSize
        );

        let mut request = register_request("rej2", 9);
        request.queueing_mode = 9;
        assert_eq!(
            daemon.register(&request).status,
            BpStatus::UnknownQueueingMode
        );

        let mut request = register_request("rej3", 2);
        request.max_entries = 0;
        assert_eq!(
            daemon.register(&request).status,
            BpStatus::IllegalDroppingQueueSize
        );
    }

    #[test]
    fn test_repeat_mode_emits_every_beacon() {
        let daemon = daemon();
        let request = register_request("rep", QueueingMode::Repeat as u8);
        assert_eq!(daemon.register(&request).status, BpStatus::Ok);
        let client = attach(&request);

        client
            .submit_payload(request.protocol_id, &[1, 2, 3])
            .unwrap();
        daemon.drain_transmit_requests();

        let mut frame = vec![0u8; 1500];
        for seqno in 0..5u32 {
            let composed = daemon.compose_beacon(&mut frame).expect("beacon expected");
            let mut area = DisassemblyArea::new(&frame[..composed.len]);
            let header = BeaconHeader::deserialize(&mut area).unwrap();
            assert_eq!(header.seqno, seqno);
            assert_eq!(header.num_payloads, 1);
            assert_eq!(
                header.length as usize,
                PayloadHeader::FIXED_WIRE_SIZE + 3
            );
            let ph = PayloadHeader::deserialize(&mut area).unwrap();
            assert_eq!(ph.protocol_id, BpProtocolId(0xabcd));
            assert_eq!(area.read_slice(3).unwrap(), &[1, 2, 3]);
        }
    }

    #[test]
    fn test_once_mode_emits_exactly_once() {
        let daemon = daemon();
        let request = register_request("once", QueueingMode::Once as u8);
        assert_eq!(daemon.register(&request).status, BpStatus::Ok);
        let client = attach(&request);

        client
            .submit_payload(request.protocol_id, &[7])
            .unwrap();
        daemon.drain_transmit_requests();

        let mut frame = vec![0u8; 1500];
        assert!(daemon.compose_beacon(&mut frame).is_some());
        assert!(daemon.compose_beacon(&mut frame).is_none());

        // A new submission re-arms the buffer.
        client
            .submit_payload(request.protocol_id, &[8])
            .unwrap();
        daemon.drain_transmit_requests();
        assert!(daemon.compose_beacon(&mut frame).is_some());
    }

    #[test]
    fn test_droptail_counts_drops() {
        let daemon = daemon();
        let request = register_request("dt", QueueingMode::QueueDropTail as u8);
        assert_eq!(daemon.register(&request).status, BpStatus::Ok);
        let client = attach(&request);

        for i in 0..6u8 {
            client
                .submit_payload(request.protocol_id, &[i])
                .unwrap();
            daemon.drain_transmit_requests();
        }
        // Queue depth is 4; two submissions were dropped.
        let query = daemon.query_buffered_payloads(request.protocol_id);
        assert_eq!(query.num_payloads_buffered, 4);
        assert_eq!(daemon.statistics().cnt_dropped_outgoing, 2);

        // FIFO order preserved: first beacon carries payload 0.
        let mut frame = vec![0u8; 1500];
        let composed = daemon.compose_beacon(&mut frame).unwrap();
        let mut area = DisassemblyArea::new(&frame[..composed.len]);
        BeaconHeader::deserialize(&mut area).unwrap();
        PayloadHeader::deserialize(&mut area).unwrap();
        assert_eq!(area.read_slice(1).unwrap(), &[0]);
    }

    #[test]
    fn test_drophead_evicts_oldest() {
        let daemon = daemon();
        let request = register_request("dh", QueueingMode::QueueDropHead as u8);
        assert_eq!(daemon.register(&request).status, BpStatus::Ok);
        let client = attach(&request);

        for i in 0..6u8 {
            client
                .submit_payload(request.protocol_id, &[i])
                .unwrap();
            daemon.drain_transmit_requests();
        }
        // Oldest two were evicted; head is payload 2.
        let mut frame = vec![0u8; 1500];
        let composed = daemon.compose_beacon(&mut frame).unwrap();
        let mut area = DisassemblyArea::new(&frame[..composed.len]);
        BeaconHeader::deserialize(&mut area).unwrap();
        PayloadHeader::deserialize(&mut area).unwrap();
        assert_eq!(area.read_slice(1).unwrap(), &[2]);
    }

    #[test]
    fn test_inactive_daemon_composes_nothing() {
        let daemon = daemon();
        let request = register_request("inact", QueueingMode::Repeat as u8);
        assert_eq!(daemon.register(&request).status, BpStatus::Ok);
        let client = attach(&request);
        client
            .submit_payload(request.protocol_id, &[1])
            .unwrap();
        daemon.drain_transmit_requests();

        assert_eq!(daemon.set_active(false), BpStatus::Ok);
        let mut frame = vec![0u8; 1500];
        assert!(daemon.compose_beacon(&mut frame).is_none());
        assert_eq!(daemon.set_active(true), BpStatus::Ok);
        assert!(daemon.compose_beacon(&mut frame).is_some());
    }

    #[test]
    fn test_handle_frame_routes_and_counts() {
        let daemon = daemon();
        let request = register_request("route", QueueingMode::Repeat as u8);
        assert_eq!(daemon.register(&request).status, BpStatus::Ok);
        let client = attach(&request);

        // Frame from a foreign node with one payload for 0xabcd and one
        // for an unknown protocol.
        let mut frame = vec![0u8; 256];
        let mut area = AssemblyArea::new(&mut frame);
        let mut header = BeaconHeader::new(NodeId([0xbb, 0, 0, 0, 0, 2]), 5);
        header.num_payloads = 2;
        header.length = (2 * PayloadHeader::FIXED_WIRE_SIZE + 3 + 2) as u16;
        header.serialize(&mut area).unwrap();
        PayloadHeader {
            protocol_id: BpProtocolId(0xabcd),
            length: 3,
        }
        .serialize(&mut area)
        .unwrap();
        area.write_bytes(&[9, 9, 9]).unwrap();
        PayloadHeader {
            protocol_id: BpProtocolId(0x1111),
            length: 2,
        }
        .serialize(&mut area)
        .unwrap();
        area.write_bytes(&[1, 1]).unwrap();
        let len = area.used();

        daemon.handle_frame(&frame[..len]);

        let mut buf = [0u8; 128];
        let got = client.pop_indication(&mut buf).unwrap().expect("payload");
        assert_eq!(&buf[..got], &[9, 9, 9]);

        let stats = daemon.statistics();
        assert_eq!(stats.cnt_beacons_received, 1);
        assert_eq!(stats.cnt_dropped_unknown, 1);
    }

    #[test]
    fn test_handle_frame_drops_malformed() {
        let daemon = daemon();
        daemon.handle_frame(&[0u8; 4]);
        // Own echo.
        let mut frame = vec![0u8; 64];
        let mut area = AssemblyArea::new(&mut frame);
        let mut header = BeaconHeader::new(daemon.node_id(), 1);
        header.num_payloads = 1;
        header.length = 1;
        header.serialize(&mut area).unwrap();
        let len = area.used();
        daemon.handle_frame(&frame[..len]);

        let stats = daemon.statistics();
        assert_eq!(stats.cnt_beacons_received, 0);
        assert_eq!(stats.cnt_dropped_unknown, 2);
    }

    #[test]
    fn test_clear_buffer() {
        let daemon = daemon();
        let request = register_request("clear", QueueingMode::QueueDropTail as u8);
        assert_eq!(daemon.register(&request).status, BpStatus::Ok);
        let client = attach(&request);
        for i in 0..3u8 {
            client
                .submit_payload(request.protocol_id, &[i])
                .unwrap();
        }
        daemon.drain_transmit_requests();
        assert_eq!(
            daemon
                .query_buffered_payloads(request.protocol_id)
                .num_payloads_buffered,
            3
        );
        assert_eq!(daemon.clear_buffer(request.protocol_id), BpStatus::Ok);
        assert_eq!(
            daemon
                .query_buffered_payloads(request.protocol_id)
                .num_payloads_buffered,
            0
        );
    }

    #[test]
    fn test_deregister_unknown() {
        let daemon = daemon();
        assert_eq!(
            daemon.deregister(BpProtocolId(0x4242)),
            BpStatus::UnknownProtocol
        );
    }

    #[test]
    fn test_command_dispatch_register_list() {
        let daemon = daemon();
        let request = register_request("cmd", 1);
        let bytes = encode_message(512, |area| {
            area.write_u16(BpServiceType::RegisterProtocol.code())?;
            request.serialize(area)
        });
        let response = daemon.handle_command(&bytes);
        let mut area = DisassemblyArea::new(&response);
        assert_eq!(
            area.read_u16().unwrap(),
            BpServiceType::RegisterProtocol.code()
        );
        let confirm = RegisterProtocolConfirm::deserialize(&mut area).unwrap();
        assert_eq!(confirm.status, BpStatus::Ok);

        let bytes = encode_message(8, |area| {
            area.write_u16(BpServiceType::ListRegisteredProtocols.code())
        });
        let response = daemon.handle_command(&bytes);
        let mut area = DisassemblyArea::new(&response);
        area.read_u16().unwrap();
        let list = ListRegisteredProtocolsConfirm::deserialize(&mut area).unwrap();
        assert_eq!(list.protocols.len(), 1);
        assert_eq!(list.protocols[0].protocol_id, BpProtocolId(0xabcd));
        assert_eq!(list.protocols[0].protocol_name.as_bytes(), b"testproto");
    }

    #[test]
    fn test_command_unknown_service_type() {
        let daemon = daemon();
        let response = daemon.handle_command(&[0x7f, 0xff]);
        let mut area = DisassemblyArea::new(&response);
        area.read_u16().unwrap();
        let confirm = BpSimpleConfirm::deserialize(&mut area).unwrap();
        assert_eq!(confirm.status, BpStatus::IllegalServiceType);
    }

    #[test]
    fn test_jittered_period_within_bounds() {
        let daemon = daemon();
        let t = daemon.config.avg_beacon_period_ms as f64;
        let j = daemon.config.jitter_factor;
        for _ in 0..200 {
            let period_ms = daemon.next_beacon_period().as_secs_f64() * 1000.0;
            assert!(period_ms >= t * (1.0 - j) - 1e-6);
            assert!(period_ms <= t * (1.0 + j) + 1e-6);
        }
    }

    #[test]
    fn test_tx_confirm_generated_when_requested() {
        let daemon = daemon();
        let mut request = register_request("conf", QueueingMode::Repeat as u8);
        request.generate_tx_confirms = true;
        assert_eq!(daemon.register(&request).status, BpStatus::Ok);
        let client = attach(&request);

        client
            .submit_payload(request.protocol_id, &[5])
            .unwrap();
        daemon.drain_transmit_requests();

        let mut frame = vec![0u8; 1500];
        let composed = daemon.compose_beacon(&mut frame).unwrap();
        assert_eq!(composed.confirm, vec![request.protocol_id]);
        daemon.confirm_transmissions(&composed.confirm);
        assert_eq!(client.pop_transmit_confirm().unwrap(), Some(BpStatus::Ok));
    }
}
