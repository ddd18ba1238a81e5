// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Raw `AF_PACKET` beacon transport.
//!
//! Beacons are Ethernet-II broadcast frames with a configurable ether
//! type. The socket is bound to one interface; the interface's MAC is
//! the node identifier. Receives run with a short timeout so the
//! receiver thread can watch the exit flag.

use dcp::bp::transport::BeaconTransport;
use dcp::wire::NodeId;
use socket2::{Domain, Protocol, Socket, Type};
use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::time::Duration;

const ETH_HEADER_LEN: usize = 14;
const BROADCAST: [u8; 6] = [0xff; 6];

pub struct PacketTransport {
    socket: Socket,
    node_id: NodeId,
    ether_type: u16,
    current_timeout: Option<Duration>,
}

struct InterfaceInfo {
    index: i32,
    mac: [u8; 6],
    mtu: u32,
}

fn interface_info(fd: i32, name: &str) -> io::Result<InterfaceInfo> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name"))?;
    let bytes = c_name.as_bytes_with_nul();
    if bytes.len() > libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }

    // SAFETY: ifreq is plain data; all-zero is a valid starting state.
    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: fd is a valid socket, req a properly initialized ifreq; the
    // kernel fills the requested union member on success.
    let index = unsafe {
        if libc::ioctl(fd, libc::SIOCGIFINDEX, &mut req) < 0 {
            return Err(io::Error::last_os_error());
        }
        req.ifr_ifru.ifru_ifindex
    };

    // SAFETY: same as above for the hardware address request.
    let mac = unsafe {
        if libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut req) < 0 {
            return Err(io::Error::last_os_error());
        }
        let data = req.ifr_ifru.ifru_hwaddr.sa_data;
        [
            data[0] as u8,
            data[1] as u8,
            data[2] as u8,
            data[3] as u8,
            data[4] as u8,
            data[5] as u8,
        ]
    };

    // SAFETY: same as above for the MTU request.
    let mtu = unsafe {
        if libc::ioctl(fd, libc::SIOCGIFMTU, &mut req) < 0 {
            return Err(io::Error::last_os_error());
        }
        req.ifr_ifru.ifru_mtu as u32
    };

    Ok(InterfaceInfo { index, mac, mtu })
}

impl PacketTransport {
    /// Open a raw socket on `interface` for the given ether type.
    ///
    /// Requires `CAP_NET_RAW`. Returns the transport and the interface
    /// MTU (for configuration validation).
    pub fn open(interface: &str, ether_type: u16) -> io::Result<(Self, u32)> {
        let proto = i32::from(ether_type.to_be());
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(proto)))?;

        let info = interface_info(socket.as_raw_fd(), interface)?;

        // SAFETY: sockaddr_ll is plain data; zeroed then filled with the
        // family, protocol and interface index the bind call requires.
        let ret = unsafe {
            let mut addr: libc::sockaddr_ll = std::mem::zeroed();
            addr.sll_family = libc::AF_PACKET as u16;
            addr.sll_protocol = ether_type.to_be();
            addr.sll_ifindex = info.index;
            libc::bind(
                socket.as_raw_fd(),
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok((
            Self {
                socket,
                node_id: NodeId(info.mac),
                ether_type,
                current_timeout: None,
            },
            info.mtu,
        ))
    }
}

impl BeaconTransport for PacketTransport {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut packet = Vec::with_capacity(ETH_HEADER_LEN + frame.len());
        packet.extend_from_slice(&BROADCAST);
        packet.extend_from_slice(&self.node_id.0);
        packet.extend_from_slice(&self.ether_type.to_be_bytes());
        packet.extend_from_slice(frame);
        self.socket.send(&packet)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if self.current_timeout != Some(timeout) {
            self.socket.set_read_timeout(Some(timeout))?;
            self.current_timeout = Some(timeout);
        }
        let mut packet = [0u8; 2048];
        // SAFETY: recv writes at most packet.len() bytes into a valid,
        // properly sized buffer owned by this frame.
        let got = unsafe {
            libc::recv(
                self.socket.as_raw_fd(),
                packet.as_mut_ptr().cast::<libc::c_void>(),
                packet.len(),
                0,
            )
        };
        if got < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Ok(None),
                _ => Err(err),
            };
        }
        let got = got as usize;
        if got <= ETH_HEADER_LEN {
            return Ok(None);
        }
        // The socket protocol filter already selects our ether type;
        // strip the Ethernet header and hand up the beacon bytes.
        let payload = &packet[ETH_HEADER_LEN..got];
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok(Some(len))
    }
}
