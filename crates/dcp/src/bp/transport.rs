// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Beacon transport seam.
//!
//! The BP daemon only ever talks to the medium through [`BeaconTransport`]:
//! a blocking send, a receive with a millisecond timeout (so the receiver
//! thread can watch the exit flag), and the local node identifier. The raw
//! `AF_PACKET` implementation lives in the BP daemon binary; the
//! [`HubTransport`] here wires several in-process endpoints into a lossless
//! broadcast domain for tests and demos.

use crate::wire::NodeId;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// One-hop broadcast medium.
pub trait BeaconTransport: Send {
    /// Identifier of the local interface.
    fn node_id(&self) -> NodeId;

    /// Broadcast one frame.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Receive the next frame, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` on timeout.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;
}

/// In-process broadcast domain connecting [`HubTransport`] endpoints.
#[derive(Default)]
pub struct TransportHub {
    peers: Mutex<Vec<(NodeId, Sender<Vec<u8>>)>>,
}

impl TransportHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new endpoint with the given node id.
    pub fn endpoint(self: &Arc<Self>, node_id: NodeId) -> HubTransport {
        let (tx, rx) = unbounded();
        self.peers.lock().push((node_id, tx));
        HubTransport {
            hub: Arc::clone(self),
            node_id,
            rx,
        }
    }

    fn broadcast(&self, from: NodeId, frame: &[u8]) {
        for (peer, tx) in self.peers.lock().iter() {
            if *peer != from {
                let _ = tx.send(frame.to_vec());
            }
        }
    }
}

/// Endpoint of a [`TransportHub`].
pub struct HubTransport {
    hub: Arc<TransportHub>,
    node_id: NodeId,
    rx: Receiver<Vec<u8>>,
}

impl BeaconTransport for HubTransport {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.hub.broadcast(self.node_id, frame);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some(len))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport hub disconnected",
            )),
        }
    }
}
