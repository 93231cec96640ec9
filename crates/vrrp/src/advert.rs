//! VRRP advertisement socket: raw-socket multicast send/receive.
//!
//! Extends the teacher crate's original `socket.rs` (raw socket creation,
//! multicast join/leave, TTL=255 enforcement on send) with per-packet TTL
//! validation on receive via `IP_RECVTTL`/`IPV6_RECVHOPLIMIT` ancillary
//! data, since spec §4.1 step 1 requires checking "TTL/hop-limit = 255" on
//! every received advert, not just setting it on send.

use crate::packet::VrrpPacket;
use crate::types::{
    AddressFamily, VRRP_MULTICAST_ADDR_V4, VRRP_MULTICAST_ADDR_V6, VRRP_PROTOCOL,
    VRRP_REQUIRED_TTL,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::mem::{self, MaybeUninit};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;

/// A received advertisement plus the transport-level facts needed to
/// validate it (spec §4.1 step 1: VRID, TTL/hop-limit, checksum, family).
pub struct ReceivedAdvert {
    pub packet: VrrpPacket,
    pub src_ip: IpAddr,
    pub ttl: u8,
}

/// Send/receive boundary the FSM and scheduler depend on, so tests can
/// exercise `fsm::send_advertisement`/`goto_master` and the scheduler's
/// receive path without a privileged raw socket. Not one of the spec's
/// named boundary traits — an internal testability seam, same spirit as
/// `VipBackend`/`NotifySink`.
pub trait AdvertTransport: Send + Sync {
    fn send(&self, packet: &VrrpPacket, src_ip: IpAddr) -> io::Result<usize>;

    /// Non-blocking receive: `Ok(None)` means nothing pending right now.
    fn try_recv(&self) -> io::Result<Option<ReceivedAdvert>>;
}

impl AdvertTransport for AdvertSocket {
    fn send(&self, packet: &VrrpPacket, src_ip: IpAddr) -> io::Result<usize> {
        AdvertSocket::send(self, packet, src_ip)
    }

    fn try_recv(&self) -> io::Result<Option<ReceivedAdvert>> {
        AdvertSocket::try_recv(self)
    }
}

impl<T: AdvertTransport + ?Sized> AdvertTransport for Arc<T> {
    fn send(&self, packet: &VrrpPacket, src_ip: IpAddr) -> io::Result<usize> {
        (**self).send(packet, src_ip)
    }

    fn try_recv(&self) -> io::Result<Option<ReceivedAdvert>> {
        (**self).try_recv()
    }
}

/// In-memory transport for tests: records every packet it was asked to
/// send and always succeeds, and hands back adverts queued via
/// `push_incoming` in FIFO order.
#[derive(Default)]
pub struct FakeAdvertTransport {
    sent: std::sync::Mutex<Vec<VrrpPacket>>,
    incoming: std::sync::Mutex<VecDeque<ReceivedAdvert>>,
}

impl FakeAdvertTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_packets(&self) -> Vec<VrrpPacket> {
        self.sent.lock().unwrap().clone()
    }

    /// Queue an advert for the next `try_recv` call.
    pub fn push_incoming(&self, advert: ReceivedAdvert) {
        self.incoming.lock().unwrap().push_back(advert);
    }
}

impl AdvertTransport for FakeAdvertTransport {
    fn send(&self, packet: &VrrpPacket, _src_ip: IpAddr) -> io::Result<usize> {
        self.sent.lock().unwrap().push(packet.clone());
        Ok(0)
    }

    fn try_recv(&self) -> io::Result<Option<ReceivedAdvert>> {
        Ok(self.incoming.lock().unwrap().pop_front())
    }
}

/// Raw multicast socket for sending/receiving VRRP advertisements.
pub struct AdvertSocket {
    socket: Socket,
    interface: String,
    family: AddressFamily,
}

impl AdvertSocket {
    pub fn new(interface: &str, family: AddressFamily) -> io::Result<Self> {
        let is_ipv6 = matches!(family, AddressFamily::V6);
        let domain = if is_ipv6 { Domain::IPV6 } else { Domain::IPV4 };

        let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(VRRP_PROTOCOL as i32)))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;

        let fd = socket.as_raw_fd();
        if is_ipv6 {
            set_int_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, VRRP_REQUIRED_TTL as i32)?;
            set_int_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, VRRP_REQUIRED_TTL as i32)?;
            set_int_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, 0)?;
            set_int_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT, 1)?;
        } else {
            set_int_opt(fd, libc::IPPROTO_IP, libc::IP_TTL, VRRP_REQUIRED_TTL as i32)?;
            set_int_opt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, VRRP_REQUIRED_TTL as i32)?;
            set_int_opt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, 0)?;
            set_int_opt(fd, libc::IPPROTO_IP, libc::IP_RECVTTL, 1)?;
        }

        Ok(Self {
            socket,
            interface: interface.to_string(),
            family,
        })
    }

    fn is_ipv6(&self) -> bool {
        matches!(self.family, AddressFamily::V6)
    }

    pub fn join_multicast(&self) -> io::Result<()> {
        let ifindex = interface_index(&self.interface)?;
        let fd = self.socket.as_raw_fd();

        if self.is_ipv6() {
            let mcast: Ipv6Addr = VRRP_MULTICAST_ADDR_V6.parse().unwrap();
            let mreq = libc::ipv6_mreq {
                ipv6mr_multiaddr: libc::in6_addr { s6_addr: mcast.octets() },
                ipv6mr_interface: ifindex,
            };
            setsockopt_struct(fd, libc::IPPROTO_IPV6, libc::IPV6_ADD_MEMBERSHIP, &mreq)
        } else {
            let mcast: Ipv4Addr = VRRP_MULTICAST_ADDR_V4.parse().unwrap();
            let mreq = libc::ip_mreqn {
                imr_multiaddr: libc::in_addr { s_addr: u32::from_be_bytes(mcast.octets()) },
                imr_address: libc::in_addr { s_addr: 0 },
                imr_ifindex: ifindex as i32,
            };
            setsockopt_struct(fd, libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, &mreq)
        }
    }

    pub fn leave_multicast(&self) -> io::Result<()> {
        let ifindex = interface_index(&self.interface)?;
        let fd = self.socket.as_raw_fd();

        if self.is_ipv6() {
            let mcast: Ipv6Addr = VRRP_MULTICAST_ADDR_V6.parse().unwrap();
            let mreq = libc::ipv6_mreq {
                ipv6mr_multiaddr: libc::in6_addr { s6_addr: mcast.octets() },
                ipv6mr_interface: ifindex,
            };
            setsockopt_struct(fd, libc::IPPROTO_IPV6, libc::IPV6_DROP_MEMBERSHIP, &mreq)
        } else {
            let mcast: Ipv4Addr = VRRP_MULTICAST_ADDR_V4.parse().unwrap();
            let mreq = libc::ip_mreqn {
                imr_multiaddr: libc::in_addr { s_addr: u32::from_be_bytes(mcast.octets()) },
                imr_address: libc::in_addr { s_addr: 0 },
                imr_ifindex: ifindex as i32,
            };
            setsockopt_struct(fd, libc::IPPROTO_IP, libc::IP_DROP_MEMBERSHIP, &mreq)
        }
    }

    pub fn send(&self, packet: &VrrpPacket, src_ip: IpAddr) -> io::Result<usize> {
        let dst: IpAddr = if self.is_ipv6() {
            VRRP_MULTICAST_ADDR_V6.parse().unwrap()
        } else {
            VRRP_MULTICAST_ADDR_V4.parse().unwrap()
        };
        let dst_addr = SocketAddr::new(dst, 0);

        let mut pkt = packet.clone();
        pkt.set_checksum(src_ip, dst);
        let bytes = pkt.to_bytes();

        self.socket.send_to(&bytes, &dst_addr.into())
    }

    /// Receive one advertisement along with its transport TTL/hop-limit,
    /// via `recvmsg` ancillary data.
    pub fn recv(&self) -> io::Result<ReceivedAdvert> {
        let (data, src_addr, ttl) = self.recvmsg_with_ttl()?;

        if data.len() < 8 {
            return Err(io::Error::new(ErrorKind::InvalidData, "packet too short for VRRP"));
        }

        let packet = VrrpPacket::parse(&data).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;

        Ok(ReceivedAdvert {
            packet,
            src_ip: src_addr.ip(),
            ttl,
        })
    }

    pub fn try_recv(&self) -> io::Result<Option<ReceivedAdvert>> {
        match self.recv() {
            Ok(advert) => Ok(Some(advert)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn recvmsg_with_ttl(&self) -> io::Result<(Vec<u8>, SocketAddr, u8)> {
        let fd = self.socket.as_raw_fd();
        let mut buf = vec![0u8; 1500];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = [0u8; 64];
        let mut src_storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

        let mut mhdr: libc::msghdr = unsafe { mem::zeroed() };
        mhdr.msg_name = &mut src_storage as *mut _ as *mut libc::c_void;
        mhdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        mhdr.msg_iov = &mut iov;
        mhdr.msg_iovlen = 1;
        mhdr.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        mhdr.msg_controllen = control.len() as _;

        let n = unsafe { libc::recvmsg(fd, &mut mhdr, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut ttl: u8 = 0;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&mhdr);
            while !cmsg.is_null() {
                let c = &*cmsg;
                let is_ttl_msg = (c.cmsg_level == libc::IPPROTO_IP && c.cmsg_type == libc::IP_TTL)
                    || (c.cmsg_level == libc::IPPROTO_IPV6 && c.cmsg_type == libc::IPV6_HOPLIMIT);
                if is_ttl_msg {
                    let data_ptr = libc::CMSG_DATA(cmsg) as *const libc::c_int;
                    ttl = std::ptr::read_unaligned(data_ptr) as u8;
                }
                cmsg = libc::CMSG_NXTHDR(&mhdr, cmsg);
            }
        }

        let src_addr = sockaddr_storage_to_socketaddr(&src_storage)?;
        buf.truncate(n as usize);
        Ok((buf, src_addr, ttl))
    }
}

impl Drop for AdvertSocket {
    fn drop(&mut self) {
        let _ = self.leave_multicast();
    }
}

fn set_int_opt(fd: std::os::fd::RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    unsafe {
        if libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn setsockopt_struct<T>(fd: std::os::fd::RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    unsafe {
        if libc::setsockopt(
            fd,
            level,
            name,
            value as *const _ as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn sockaddr_storage_to_socketaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr_in: libc::sockaddr_in = unsafe {
                std::ptr::read(storage as *const _ as *const libc::sockaddr_in)
            };
            let ip = Ipv4Addr::from(u32::from_be(addr_in.sin_addr.s_addr));
            let port = u16::from_be(addr_in.sin_port);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        libc::AF_INET6 => {
            let addr_in6: libc::sockaddr_in6 = unsafe {
                std::ptr::read(storage as *const _ as *const libc::sockaddr_in6)
            };
            let ip = Ipv6Addr::from(addr_in6.sin6_addr.s6_addr);
            let port = u16::from_be(addr_in6.sin6_port);
            Ok(SocketAddr::new(IpAddr::V6(ip), port))
        }
        _ => Err(io::Error::new(ErrorKind::InvalidData, "unsupported source address family")),
    }
}

fn interface_index(name: &str) -> io::Result<u32> {
    use std::ffi::CString;

    let c_name = CString::new(name).map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };

    if index == 0 {
        Err(io::Error::new(ErrorKind::NotFound, format!("interface {name} not found")))
    } else {
        Ok(index)
    }
}

/// Validate the transport-level facts a received advert must satisfy
/// before the FSM looks at its contents (spec §4.1 step 1): TTL/hop-limit
/// must be 255 on receive, matching the send side (RFC 5798 §5.2.2).
pub fn validate_ttl(ttl: u8) -> bool {
    ttl == VRRP_REQUIRED_TTL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_index_resolves_loopback() {
        let result = interface_index("lo");
        assert!(result.is_ok());
        assert!(result.unwrap() > 0);
    }

    #[test]
    fn interface_index_rejects_unknown_name() {
        assert!(interface_index("nonexistent-vrrp-test-iface").is_err());
    }

    #[test]
    fn validate_ttl_requires_255() {
        assert!(validate_ttl(255));
        assert!(!validate_ttl(64));
        assert!(!validate_ttl(0));
    }

    #[test]
    fn socket_creation_does_not_panic_without_privilege() {
        // May fail without CAP_NET_RAW; must not panic either way.
        let _ = AdvertSocket::new("lo", AddressFamily::V4);
        let _ = AdvertSocket::new("lo", AddressFamily::V6);
    }
}
