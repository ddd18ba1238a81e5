// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! BP client control segment.
//!
//! One shared-memory segment per registered client protocol:
//!
//! ```text
//! +-----------------------------------------------------------+
//! | robust mutex                                              |
//! | freeList            (capacity B-1)                        |
//! | txRequestQueue      (capacity 10)                         |
//! | txConfirmQueue      (capacity 10)                         |
//! | rxIndicationQueue   (capacity 10)                         |
//! | payloadQueue        (capacity maxEntries; queue modes)    |
//! | singleBuffer        (ONCE / REPEAT modes)                 |
//! | static client info                                        |
//! +-----------------------------------------------------------+
//! | B chunks of (4 + maxPayloadSize) bytes                    |
//! +-----------------------------------------------------------+
//! ```
//!
//! The daemon creates the segment at registration time (a re-registration
//! therefore always starts with a vacant single buffer); the client
//! attaches using the same geometry derived from its own request
//! parameters. Chunks hold a [`TransmitPayloadRequest`] /
//! [`ReceivePayloadIndication`] header followed by the payload bytes.

use crate::bp::messages::{ReceivePayloadIndication, TransmitPayloadConfirm, TransmitPayloadRequest};
use crate::bp::wire::BpProtocolId;
use crate::shm::{
    self, pop_blob, push_blob, BufferPool, BufferRing, PopOutcome, PushOutcome, RingError,
    ShmError, ShmMutex, ShmMutexGuard, ShmSegment, SharedMemBuffer, POLL_INTERVAL,
};
use crate::status::BpStatus;
use crate::wire::{AssemblyArea, DisassemblyArea, TimeStamp, Transmissible};
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::ptr::addr_of_mut;
use std::time::{Duration, Instant};

/// Capacity of the request/confirm/indication rings.
pub const SERVICE_QUEUE_CAPACITY: usize = 10;

/// Upper bound on `maxEntries`, dictated by ring slot counts.
pub const MAX_QUEUE_ENTRIES: u16 = 63;

/// Maximum stored length of a protocol name in the static info block.
pub const MAX_PROTOCOL_NAME_LEN: usize = 31;

/// Static client data recorded at registration, kept inside the segment.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BpStaticClientInfo {
    pub protocol_id: u16,
    pub max_payload_size: u16,
    pub max_entries: u16,
    pub queueing_mode: u8,
    pub generate_tx_confirms: u8,
    pub registered_at_us: u64,
    pub name_len: u8,
    pub name: [u8; MAX_PROTOCOL_NAME_LEN],
}

impl BpStaticClientInfo {
    #[must_use]
    pub fn new(
        protocol_id: BpProtocolId,
        name: &[u8],
        max_payload_size: u16,
        queueing_mode: u8,
        max_entries: u16,
        generate_tx_confirms: bool,
    ) -> Self {
        let mut stored = [0u8; MAX_PROTOCOL_NAME_LEN];
        let len = name.len().min(MAX_PROTOCOL_NAME_LEN);
        stored[..len].copy_from_slice(&name[..len]);
        Self {
            protocol_id: protocol_id.0,
            max_payload_size,
            max_entries,
            queueing_mode,
            generate_tx_confirms: u8::from(generate_tx_confirms),
            registered_at_us: TimeStamp::now().micros(),
            name_len: len as u8,
            name: stored,
        }
    }

    #[must_use]
    pub fn protocol_name(&self) -> String {
        let len = (self.name_len as usize).min(MAX_PROTOCOL_NAME_LEN);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }

    #[inline]
    #[must_use]
    pub fn wants_tx_confirms(&self) -> bool {
        self.generate_tx_confirms != 0
    }
}

/// Mutable portion of the control segment, reached only under the lock.
#[repr(C)]
pub struct BpSegmentData {
    pub free_list: BufferRing,
    pub tx_requests: BufferRing,
    pub tx_confirms: BufferRing,
    pub rx_indications: BufferRing,
    pub payload_queue: BufferRing,
    pub single_buffer: SharedMemBuffer,
    pub info: BpStaticClientInfo,
}

/// The POD placed at offset 0 of the segment.
#[repr(C)]
pub struct BpControlSegment {
    lock: ShmMutex,
    data: UnsafeCell<BpSegmentData>,
}

// SAFETY: all access to `data` is serialized by the robust interprocess
// mutex; the struct itself is plain shared-mapping data.
unsafe impl Send for BpControlSegment {}
unsafe impl Sync for BpControlSegment {}

/// Chunk size for a given client payload bound: request header + payload.
#[must_use]
pub fn chunk_size(max_payload_size: u16) -> usize {
    TransmitPayloadRequest::FIXED_SIZE + max_payload_size as usize
}

/// Number of chunks a segment carries: enough for the payload queue, the
/// single buffer, and all three service rings at full depth.
#[must_use]
pub fn buffer_count(max_entries: u16) -> usize {
    max_entries as usize + 3 * SERVICE_QUEUE_CAPACITY + 2
}

/// Total byte size of a segment with the given geometry.
#[must_use]
pub fn segment_size(max_payload_size: u16, max_entries: u16) -> usize {
    size_of::<BpControlSegment>() + buffer_count(max_entries) * chunk_size(max_payload_size)
}

fn ring_err(e: RingError) -> ShmError {
    ShmError::Corruption(format!("control segment ring: {e}"))
}

/// Handle on a BP control segment: owning (daemon) or attached (client).
pub struct BpSegment {
    shm: ShmSegment,
    pool: BufferPool,
}

impl BpSegment {
    /// Create the segment (daemon side, at registration).
    pub fn create(shm_name: &str, info: BpStaticClientInfo) -> shm::Result<Self> {
        if info.max_entries > MAX_QUEUE_ENTRIES {
            return Err(ShmError::Corruption(format!(
                "maxEntries {} beyond segment bound {MAX_QUEUE_ENTRIES}",
                info.max_entries
            )));
        }
        let chunk = chunk_size(info.max_payload_size);
        let count = buffer_count(info.max_entries);
        let shm = ShmSegment::create(shm_name, segment_size(info.max_payload_size, info.max_entries))?;

        let ctrl = shm.as_ptr().cast::<BpControlSegment>();
        // SAFETY: the segment is fresh, zeroed, large enough for the POD,
        // and not yet visible to any peer; page alignment from mmap covers
        // the struct's alignment.
        unsafe {
            ShmMutex::init(addr_of_mut!((*ctrl).lock))?;
            let data = &mut *(*ctrl).data.get();
            data.free_list.set_capacity(count - 1).map_err(ring_err)?;
            data.tx_requests
                .set_capacity(SERVICE_QUEUE_CAPACITY)
                .map_err(ring_err)?;
            data.tx_confirms
                .set_capacity(SERVICE_QUEUE_CAPACITY)
                .map_err(ring_err)?;
            data.rx_indications
                .set_capacity(SERVICE_QUEUE_CAPACITY)
                .map_err(ring_err)?;
            data.payload_queue
                .set_capacity(info.max_entries.max(1) as usize)
                .map_err(ring_err)?;
            for i in 0..(count - 1) as u32 {
                data.free_list
                    .push(crate::shm::chunk_descriptor(chunk, i))
                    .map_err(ring_err)?;
            }
            data.single_buffer = crate::shm::chunk_descriptor(chunk, (count - 1) as u32);
            data.info = info;
        }

        // SAFETY: the buffer area directly follows the control POD and the
        // mapping outlives the pool (both live in `self`).
        let pool = unsafe {
            BufferPool::new(shm.as_ptr().add(size_of::<BpControlSegment>()), chunk, count)
        };
        Ok(Self { shm, pool })
    }

    /// Attach to an existing segment (client side, after a successful
    /// registration confirm). Geometry is recomputed from the client's own
    /// request parameters and cross-checked against the stored info.
    pub fn attach(shm_name: &str, max_payload_size: u16, max_entries: u16) -> shm::Result<Self> {
        let chunk = chunk_size(max_payload_size);
        let count = buffer_count(max_entries);
        let shm = ShmSegment::attach(shm_name, segment_size(max_payload_size, max_entries))?;
        // SAFETY: as in create(); the creator initialized the POD before
        // confirming the registration.
        let pool = unsafe {
            BufferPool::new(shm.as_ptr().add(size_of::<BpControlSegment>()), chunk, count)
        };
        let segment = Self { shm, pool };

        let info = segment.info()?;
        if info.max_payload_size != max_payload_size || info.max_entries != max_entries {
            return Err(ShmError::Corruption(format!(
                "segment geometry mismatch: daemon has payload={}, entries={}",
                info.max_payload_size, info.max_entries
            )));
        }
        Ok(segment)
    }

    /// Run `f` with the segment locked.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&ShmMutexGuard<'_>, &mut BpSegmentData, &BufferPool) -> shm::Result<R>,
    ) -> shm::Result<R> {
        // SAFETY: the mapping holds an initialized BpControlSegment for the
        // whole lifetime of self.
        let ctrl = unsafe { &*self.shm.as_ptr().cast::<BpControlSegment>() };
        let guard = ctrl.lock.lock()?;
        // SAFETY: the held guard serializes every access to `data` across
        // all attached processes.
        let data = unsafe { &mut *ctrl.data.get() };
        f(&guard, data, &self.pool)
    }

    /// Snapshot of the static client info.
    pub fn info(&self) -> shm::Result<BpStaticClientInfo> {
        self.with(|_, data, _| Ok(data.info))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    // -----------------------------------------------------------------
    // Client-side operations
    // -----------------------------------------------------------------

    /// Submit a payload into the transmit request queue.
    pub fn submit_payload(
        &self,
        protocol_id: BpProtocolId,
        payload: &[u8],
    ) -> shm::Result<PushOutcome> {
        self.with(|guard, data, pool| {
            push_blob(guard, &mut data.tx_requests, &mut data.free_list, pool, |chunk| {
                let mut area = AssemblyArea::new(chunk);
                let header = TransmitPayloadRequest {
                    protocol_id,
                    length: payload.len() as u16,
                };
                // The chunk is sized for header + maxPayloadSize and the
                // caller bounds the payload, so these cannot overflow.
                if header.serialize(&mut area).is_err() || area.write_bytes(payload).is_err() {
                    return 0;
                }
                area.used()
            })
        })
    }

    /// Submit a payload, waiting while the request queue is full or the
    /// free list is exhausted. Returns `false` on timeout.
    pub fn submit_payload_wait(
        &self,
        protocol_id: BpProtocolId,
        payload: &[u8],
        timeout: Duration,
    ) -> shm::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.submit_payload(protocol_id, payload)? {
                PushOutcome::Pushed => return Ok(true),
                PushOutcome::QueueFull | PushOutcome::NoFreeBuffer => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    /// Take one received payload, if any. Copies the payload bytes into
    /// `buf` and returns the payload length.
    pub fn pop_indication(&self, buf: &mut [u8]) -> shm::Result<Option<usize>> {
        self.with(|guard, data, pool| {
            let mut copied: Option<usize> = None;
            let outcome = pop_blob(
                guard,
                &mut data.rx_indications,
                &mut data.free_list,
                pool,
                |bytes| {
                    let mut area = DisassemblyArea::new(bytes);
                    let Ok(ind) = ReceivePayloadIndication::deserialize(&mut area) else {
                        return;
                    };
                    let len = (ind.length as usize).min(area.available()).min(buf.len());
                    if let Ok(slice) = area.read_slice(len) {
                        buf[..len].copy_from_slice(slice);
                        copied = Some(len);
                    }
                },
            )?;
            match outcome {
                PopOutcome::Popped { .. } => Ok(copied),
                PopOutcome::Empty => Ok(None),
            }
        })
    }

    /// Take one received payload, polling until `timeout` elapses.
    pub fn pop_indication_wait(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> shm::Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(len) = self.pop_indication(buf)? {
                return Ok(Some(len));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Take one transmit confirm, if any.
    pub fn pop_transmit_confirm(&self) -> shm::Result<Option<BpStatus>> {
        self.with(|guard, data, pool| {
            let mut status = None;
            let outcome = pop_blob(
                guard,
                &mut data.tx_confirms,
                &mut data.free_list,
                pool,
                |bytes| {
                    let mut area = DisassemblyArea::new(bytes);
                    if let Ok(confirm) = TransmitPayloadConfirm::deserialize(&mut area) {
                        status = Some(confirm.status);
                    }
                },
            )?;
            match outcome {
                PopOutcome::Popped { .. } => Ok(status),
                PopOutcome::Empty => Ok(None),
            }
        })
    }

    // -----------------------------------------------------------------
    // Daemon-side operations
    // -----------------------------------------------------------------

    /// Push a transmit confirm towards the client (best effort: a full
    /// confirm queue drops the confirm, never the daemon).
    pub fn push_transmit_confirm(&self, status: BpStatus) -> shm::Result<PushOutcome> {
        self.with(|guard, data, pool| {
            push_blob(guard, &mut data.tx_confirms, &mut data.free_list, pool, |chunk| {
                let mut area = AssemblyArea::new(chunk);
                if (TransmitPayloadConfirm { status }).serialize(&mut area).is_err() {
                    return 0;
                }
                area.used()
            })
        })
    }

    /// Push a received payload indication towards the client.
    pub fn push_indication(&self, payload: &[u8]) -> shm::Result<PushOutcome> {
        self.with(|guard, data, pool| {
            push_blob(
                guard,
                &mut data.rx_indications,
                &mut data.free_list,
                pool,
                |chunk| {
                    let mut area = AssemblyArea::new(chunk);
                    let header = ReceivePayloadIndication {
                        length: payload.len() as u16,
                    };
                    if header.serialize(&mut area).is_err() || area.write_bytes(payload).is_err() {
                        return 0;
                    }
                    area.used()
                },
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/dcp_bpseg_{tag}_{ts}")
    }

    fn test_info() -> BpStaticClientInfo {
        BpStaticClientInfo::new(BpProtocolId(0xabcd), b"unit-test", 128, 2, 4, true)
    }

    #[test]
    fn test_create_populates_free_list() {
        let name = unique_name("free");
        let segment = BpSegment::create(&name, test_info()).expect("create failed");
        segment
            .with(|_, data, _| {
                assert_eq!(data.free_list.stored(), buffer_count(4) - 1);
                assert!(data.single_buffer.is_vacant());
                assert_eq!(data.payload_queue.capacity(), 4);
                assert_eq!(data.info.protocol_id, 0xabcd);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_attach_checks_geometry() {
        let name = unique_name("geom");
        let _owner = BpSegment::create(&name, test_info()).expect("create failed");
        assert!(BpSegment::attach(&name, 128, 4).is_ok());
        assert!(matches!(
            BpSegment::attach(&name, 256, 4),
            Err(ShmError::Corruption(_) | ShmError::Mmap(_))
        ));
    }

    #[test]
    fn test_submit_then_daemon_reads_request() {
        let name = unique_name("submit");
        let owner = BpSegment::create(&name, test_info()).expect("create failed");
        let client = BpSegment::attach(&name, 128, 4).expect("attach failed");

        let outcome = client
            .submit_payload(BpProtocolId(0xabcd), &[1, 2, 3])
            .expect("submit failed");
        assert_eq!(outcome, PushOutcome::Pushed);

        owner
            .with(|guard, data, pool| {
                let mut seen = Vec::new();
                let outcome = pop_blob(
                    guard,
                    &mut data.tx_requests,
                    &mut data.free_list,
                    pool,
                    |bytes| seen.extend_from_slice(bytes),
                )?;
                assert!(matches!(outcome, PopOutcome::Popped { more: false }));

                let mut area = DisassemblyArea::new(&seen);
                let header = TransmitPayloadRequest::deserialize(&mut area).unwrap();
                assert_eq!(header.protocol_id, BpProtocolId(0xabcd));
                assert_eq!(header.length, 3);
                assert_eq!(area.read_slice(3).unwrap(), &[1, 2, 3]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_indication_roundtrip() {
        let name = unique_name("ind");
        let owner = BpSegment::create(&name, test_info()).expect("create failed");
        let client = BpSegment::attach(&name, 128, 4).expect("attach failed");

        let mut buf = [0u8; 128];
        assert_eq!(client.pop_indication(&mut buf).unwrap(), None);

        assert_eq!(
            owner.push_indication(&[9, 8, 7]).unwrap(),
            PushOutcome::Pushed
        );
        let len = client
            .pop_indication(&mut buf)
            .unwrap()
            .expect("indication expected");
        assert_eq!(&buf[..len], &[9, 8, 7]);
    }

    #[test]
    fn test_confirm_roundtrip() {
        let name = unique_name("conf");
        let owner = BpSegment::create(&name, test_info()).expect("create failed");
        let client = BpSegment::attach(&name, 128, 4).expect("attach failed");

        assert_eq!(client.pop_transmit_confirm().unwrap(), None);
        owner.push_transmit_confirm(BpStatus::Ok).unwrap();
        assert_eq!(client.pop_transmit_confirm().unwrap(), Some(BpStatus::Ok));
    }

    #[test]
    fn test_indication_queue_overflow_reported() {
        let name = unique_name("ovfl");
        let owner = BpSegment::create(&name, test_info()).expect("create failed");
        for _ in 0..SERVICE_QUEUE_CAPACITY {
            assert_eq!(owner.push_indication(&[0]).unwrap(), PushOutcome::Pushed);
        }
        assert_eq!(owner.push_indication(&[0]).unwrap(), PushOutcome::QueueFull);
    }
}
