// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SRP daemon engine.
//!
//! The lightest of the three: a BP client in ONCE mode that broadcasts
//! the own node's safety data while it stays fresh, maintains the
//! neighbour table from received broadcasts, and scrubs aged entries.
//! Reception keeps working after the own keepalive lapses: a silent node
//! still listens.

use crate::bp::client::{BpClient, BpClientConfig, BpClientError};
use crate::bp::queueing::QueueingMode;
use crate::bp::wire::BpProtocolId;
use crate::config::SrpConfig;
use crate::shm::{PushOutcome, ShmError, POLL_INTERVAL};
use crate::srp::store::SrpStore;
use crate::srp::wire::ExtendedSafetyData;
use crate::wire::{AssemblyArea, DisassemblyArea, TimeStamp, Transmissible};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Fatal construction error of the SRP daemon.
#[derive(Debug)]
pub enum SrpDaemonError {
    Bp(BpClientError),
    Shm(ShmError),
}

impl std::fmt::Display for SrpDaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bp(e) => write!(f, "BP registration failed: {e}"),
            Self::Shm(e) => write!(f, "neighbour store: {e}"),
        }
    }
}

impl std::error::Error for SrpDaemonError {}

/// The State Reporting Protocol daemon engine.
pub struct SrpDaemon {
    config: SrpConfig,
    store: SrpStore,
    bp: BpClient,
    exit: Arc<AtomicBool>,
}

impl SrpDaemon {
    /// Register with BP and create the neighbour store.
    pub fn new(config: SrpConfig) -> Result<Arc<Self>, SrpDaemonError> {
        let bp_config = BpClientConfig {
            command_socket_path: config.bp_command_socket_path.clone().into(),
            command_timeout: Duration::from_millis(500),
            protocol_id: BpProtocolId::SRP,
            protocol_name: "srp".to_string(),
            max_payload_size: ExtendedSafetyData::FIXED_SIZE as u16,
            queueing_mode: QueueingMode::Once,
            max_entries: 1,
            generate_tx_confirms: false,
            shm_name: config.bp_shm_name.clone(),
        };
        let bp = BpClient::register(&bp_config).map_err(SrpDaemonError::Bp)?;
        Self::with_bp_client(config, bp)
    }

    /// Build the engine around an already-registered BP client.
    pub fn with_bp_client(config: SrpConfig, bp: BpClient) -> Result<Arc<Self>, SrpDaemonError> {
        let store =
            SrpStore::create(&config.store_shm_name, bp.node_id()).map_err(SrpDaemonError::Shm)?;
        Ok(Arc::new(Self {
            config,
            store,
            bp,
            exit: Arc::new(AtomicBool::new(false)),
        }))
    }

    #[must_use]
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit)
    }

    #[must_use]
    pub fn store(&self) -> &SrpStore {
        &self.store
    }

    fn fatal(&self, context: &str, err: &ShmError) {
        log::error!("[SRP] unrecoverable fault in {context}: {err}; shutting down");
        self.exit.store(true, Ordering::SeqCst);
    }

    /// One generation tick: broadcast the own safety data while it is
    /// fresher than the keepalive timeout.
    pub fn transmit_tick(&self) {
        let keepalive = self.config.keepalive_timeout_ms as u64;
        let node_id = self.bp.node_id();
        let esd = self.store.with_own(|own| {
            if !own.is_active() || !own.is_written() {
                return None;
            }
            let now = TimeStamp::now();
            // The keepalive boundary is inclusive: data exactly
            // keepaliveTimeoutMS old still goes out once more.
            if now.millis_since(TimeStamp(own.timestamp_us)) > keepalive {
                log::info!("[SRP] own safety data went stale, pausing transmission");
                own.written = 0;
                return None;
            }
            let esd = ExtendedSafetyData {
                safety_data: own.safety_data,
                node_id,
                timestamp: now,
                seqno: own.seqno,
            };
            own.seqno = own.seqno.wrapping_add(1);
            Some(esd)
        });
        let esd = match esd {
            Ok(Some(esd)) => esd,
            Ok(None) => return,
            Err(e) => {
                self.fatal("transmit_tick", &e);
                return;
            }
        };

        let mut buf = [0u8; ExtendedSafetyData::FIXED_SIZE];
        let mut area = AssemblyArea::new(&mut buf);
        // The buffer is exactly the fixed wire size.
        if esd.serialize(&mut area).is_err() {
            return;
        }
        match self.bp.segment().submit_payload(BpProtocolId::SRP, &buf) {
            Ok(PushOutcome::Pushed) => {}
            Ok(PushOutcome::QueueFull | PushOutcome::NoFreeBuffer) => {
                log::debug!("[SRP] BP request queue full, safety data dropped");
            }
            Err(e) => self.fatal("transmit_tick", &e),
        }
    }

    /// Drain pending BP indications into the neighbour table.
    pub fn process_indications_tick(&self) {
        let own = self.bp.node_id();
        let mut buf = [0u8; 256];
        loop {
            let received = match self.bp.try_receive(&mut buf) {
                Ok(received) => received,
                Err(e) => {
                    log::error!("[SRP] receive failed: {e}; shutting down");
                    self.exit.store(true, Ordering::SeqCst);
                    return;
                }
            };
            let Some(len) = received else { return };

            let mut area = DisassemblyArea::new(&buf[..len]);
            let Ok(esd) = ExtendedSafetyData::deserialize(&mut area) else {
                log::debug!("[SRP] undecodable safety data of {len} bytes dropped");
                continue;
            };
            if esd.node_id == own {
                continue;
            }
            let result = self.store.with_neighbours(|table| {
                table.upsert(esd.node_id, esd.safety_data, esd.seqno, TimeStamp::now());
            });
            if let Err(e) = result {
                self.fatal("process_indications_tick", &e);
                return;
            }
        }
    }

    /// Remove neighbours not heard from for `scrubbingTimeoutMS`.
    pub fn scrub_tick(&self) {
        let timeout_us = self.config.scrubbing_timeout_ms as u64 * 1000;
        let cutoff = TimeStamp(TimeStamp::now().micros().saturating_sub(timeout_us));
        match self.store.with_neighbours(|table| table.remove_older_than(cutoff)) {
            Ok(removed) if removed > 0 => {
                log::debug!("[SRP] scrubbed {removed} stale neighbours");
            }
            Ok(_) => {}
            Err(e) => self.fatal("scrub_tick", &e),
        }
    }

    /// Spawn the daemon thread pool.
    pub fn run(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let daemon = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            log::info!("[SRP] transmitter thread starting");
            let interval = Duration::from_millis(daemon.config.generation_period_ms as u64);
            while !daemon.exit.load(Ordering::SeqCst) {
                crate::bp::daemon::sleep_watching_exit(&daemon.exit, interval);
                if !daemon.exit.load(Ordering::SeqCst) {
                    daemon.transmit_tick();
                }
            }
            log::info!("[SRP] transmitter thread exiting");
        }));

        let daemon = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            log::info!("[SRP] receiver thread starting");
            let interval = Duration::from_millis(daemon.config.reception_period_ms as u64);
            while !daemon.exit.load(Ordering::SeqCst) {
                daemon.process_indications_tick();
                crate::bp::daemon::sleep_watching_exit(&daemon.exit, interval.max(POLL_INTERVAL));
            }
            log::info!("[SRP] receiver thread exiting");
        }));

        let daemon = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            log::info!("[SRP] scrubber thread starting");
            let period = Duration::from_millis(daemon.config.scrubbing_period_ms as u64);
            while !daemon.exit.load(Ordering::SeqCst) {
                crate::bp::daemon::sleep_watching_exit(&daemon.exit, period);
                if !daemon.exit.load(Ordering::SeqCst) {
                    daemon.scrub_tick();
                }
            }
            log::info!("[SRP] scrubber thread exiting");
        }));

        handles
    }
}
