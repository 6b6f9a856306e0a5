//! Netlink socket operations for interface configuration.
//!
//! Speaks rtnetlink over a raw `NETLINK_ROUTE` socket. A handle acts in the
//! network namespace its socket was opened in, so callers that switch
//! namespaces open a fresh handle afterwards.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tether_core::{Error, Result};

const NETLINK_ROUTE: i32 = 0;

// Message types
const RTM_NEWLINK: u16 = 16;
const RTM_NEWADDR: u16 = 20;
const RTM_NEWROUTE: u16 = 24;
const NLMSG_ERROR: u16 = 2;

// Flags
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;
const NLA_F_NESTED: u16 = 1 << 15;

const IFF_UP: u32 = 0x1;

// Link attributes
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;
const IFLA_MASTER: u16 = 10;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;

// Address attributes
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

// Route attributes
const RTA_GATEWAY: u16 = 5;
const RTA_OIF: u16 = 4;

const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

/// Netlink message header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

/// Interface info message.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IfInfoMsg {
    ifi_family: u8,
    _pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

impl IfInfoMsg {
    fn for_index(index: u32) -> Result<Self> {
        let ifi_index = i32::try_from(index).map_err(|_| Error::Netlink {
            message: format!("interface index out of range: {index}"),
        })?;

        Ok(Self {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index,
            ..Self::default()
        })
    }
}

/// Interface address message.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct IfAddrMsg {
    ifa_family: u8,
    ifa_prefixlen: u8,
    ifa_flags: u8,
    ifa_scope: u8,
    ifa_index: u32,
}

/// Route message.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RtMsg {
    rtm_family: u8,
    rtm_dst_len: u8,
    rtm_src_len: u8,
    rtm_tos: u8,
    rtm_table: u8,
    rtm_protocol: u8,
    rtm_scope: u8,
    rtm_type: u8,
    rtm_flags: u32,
}

/// Netlink attribute header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlAttr {
    nla_len: u16,
    nla_type: u16,
}

const fn align(len: usize) -> usize {
    (len + 3) & !3
}

fn struct_bytes<T: Copy>(value: &T) -> &[u8] {
    // SAFETY: T is a plain #[repr(C)] message struct without padding bytes
    unsafe { std::slice::from_raw_parts(std::ptr::from_ref(value).cast::<u8>(), mem::size_of::<T>()) }
}

fn address_family(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => libc::AF_INET as u8,
        IpAddr::V6(_) => libc::AF_INET6 as u8,
    }
}

fn address_octets(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// A single rtnetlink request under construction
#[derive(Debug)]
struct Request {
    buf: Vec<u8>,
    nests: Vec<usize>,
}

impl Request {
    fn new<T: Copy>(message_type: u16, flags: u16, body: &T) -> Self {
        let header = NlMsgHdr {
            nlmsg_len: 0,
            nlmsg_type: message_type,
            nlmsg_flags: NLM_F_REQUEST | NLM_F_ACK | flags,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        };

        let mut request = Self {
            buf: Vec::with_capacity(256),
            nests: Vec::new(),
        };
        request.buf.extend_from_slice(struct_bytes(&header));
        request.push_raw(struct_bytes(body));
        request
    }

    fn push_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.buf.resize(align(self.buf.len()), 0);
    }

    fn push_attr_header(&mut self, attr_type: u16, payload_len: usize) {
        let attr = NlAttr {
            nla_len: (mem::size_of::<NlAttr>() + payload_len) as u16,
            nla_type: attr_type,
        };
        self.buf.extend_from_slice(struct_bytes(&attr));
    }

    fn attr_bytes(&mut self, attr_type: u16, value: &[u8]) -> &mut Self {
        self.push_attr_header(attr_type, value.len());
        self.push_raw(value);
        self
    }

    fn attr_str(&mut self, attr_type: u16, value: &str) -> &mut Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.attr_bytes(attr_type, &bytes)
    }

    fn attr_u32(&mut self, attr_type: u16, value: u32) -> &mut Self {
        self.attr_bytes(attr_type, &value.to_ne_bytes())
    }

    fn begin_nested(&mut self, attr_type: u16) -> &mut Self {
        self.nests.push(self.buf.len());
        self.push_attr_header(attr_type | NLA_F_NESTED, 0);
        self
    }

    fn end_nested(&mut self) -> &mut Self {
        if let Some(start) = self.nests.pop() {
            let len = (self.buf.len() - start) as u16;
            self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        }
        self
    }

    fn finish(mut self, seq: u32) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        self.buf
    }
}

/// Netlink socket handle for interface configuration.
#[derive(Debug)]
pub struct NetlinkHandle {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkHandle {
    /// Open a netlink socket in the current network namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn new() -> Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };

        if raw < 0 {
            return Err(Error::Netlink {
                message: format!("failed to create netlink socket: {}", io::Error::last_os_error()),
            });
        }

        // SAFETY: raw is a freshly created descriptor nobody else owns
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0;
        addr.nl_groups = 0;

        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };

        if ret < 0 {
            return Err(Error::Netlink {
                message: format!("failed to bind netlink socket: {}", io::Error::last_os_error()),
            });
        }

        Ok(Self { fd, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Send a request and wait for the kernel's acknowledgement.
    fn execute(&mut self, request: Request) -> Result<()> {
        let seq = self.next_seq();
        let msg = request.finish(seq);

        let sent = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr().cast::<libc::c_void>(),
                msg.len(),
                0,
            )
        };

        if sent < 0 {
            return Err(Error::Netlink {
                message: format!("failed to send netlink message: {}", io::Error::last_os_error()),
            });
        }

        let mut buf = [0u8; 4096];
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                0,
            )
        };

        if len < 0 {
            return Err(Error::Netlink {
                message: format!("failed to receive netlink response: {}", io::Error::last_os_error()),
            });
        }

        check_ack(&buf[..len.unsigned_abs()])
    }

    /// Look up an interface index by name.
    ///
    /// # Errors
    ///
    /// Returns `InterfaceNotFound` if no such interface exists here.
    pub fn ifindex(&self, name: &str) -> Result<u32> {
        let c_name = CString::new(name).map_err(|_| Error::InterfaceNotFound {
            name: name.to_string(),
        })?;

        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            return Err(Error::InterfaceNotFound {
                name: name.to_string(),
            });
        }

        Ok(index)
    }

    /// Bring an interface up or down.
    pub fn set_link_up(&mut self, index: u32, up: bool) -> Result<()> {
        let mut info = IfInfoMsg::for_index(index)?;
        info.ifi_flags = if up { IFF_UP } else { 0 };
        info.ifi_change = IFF_UP;

        self.execute(Request::new(RTM_NEWLINK, 0, &info))
    }

    /// Enslave an interface to a bridge.
    pub fn set_link_master(&mut self, index: u32, master: u32) -> Result<()> {
        let info = IfInfoMsg::for_index(index)?;
        let mut request = Request::new(RTM_NEWLINK, 0, &info);
        request.attr_u32(IFLA_MASTER, master);

        self.execute(request)
    }

    /// Set an interface's MTU.
    pub fn set_link_mtu(&mut self, index: u32, mtu: u32) -> Result<()> {
        let info = IfInfoMsg::for_index(index)?;
        let mut request = Request::new(RTM_NEWLINK, 0, &info);
        request.attr_u32(IFLA_MTU, mtu);

        self.execute(request)
    }

    /// Rename an interface; it must be down.
    pub fn set_link_name(&mut self, index: u32, name: &str) -> Result<()> {
        let info = IfInfoMsg::for_index(index)?;
        let mut request = Request::new(RTM_NEWLINK, 0, &info);
        request.attr_str(IFLA_IFNAME, name);

        self.execute(request)
    }

    /// Move an interface into the network namespace of `pid`.
    pub fn set_link_netns_pid(&mut self, index: u32, pid: u32) -> Result<()> {
        let info = IfInfoMsg::for_index(index)?;
        let mut request = Request::new(RTM_NEWLINK, 0, &info);
        request.attr_u32(IFLA_NET_NS_PID, pid);

        self.execute(request)
    }

    /// Create a veth pair.
    pub fn create_veth(&mut self, name: &str, peer: &str) -> Result<()> {
        let info = IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ..IfInfoMsg::default()
        };

        let mut request = Request::new(RTM_NEWLINK, NLM_F_CREATE | NLM_F_EXCL, &info);
        request.attr_str(IFLA_IFNAME, name);
        request
            .begin_nested(IFLA_LINKINFO)
            .attr_str(IFLA_INFO_KIND, "veth")
            .begin_nested(IFLA_INFO_DATA)
            .begin_nested(VETH_INFO_PEER);
        request.push_raw(struct_bytes(&info));
        request
            .attr_str(IFLA_IFNAME, peer)
            .end_nested()
            .end_nested()
            .end_nested();

        self.execute(request)
    }

    /// Assign an address with prefix length to an interface.
    pub fn add_address(&mut self, index: u32, addr: IpAddr, prefix: u8) -> Result<()> {
        let msg = IfAddrMsg {
            ifa_family: address_family(&addr),
            ifa_prefixlen: prefix,
            ifa_flags: 0,
            ifa_scope: 0,
            ifa_index: index,
        };

        let octets = address_octets(&addr);
        let mut request = Request::new(RTM_NEWADDR, NLM_F_CREATE | NLM_F_EXCL, &msg);
        request
            .attr_bytes(IFA_LOCAL, &octets)
            .attr_bytes(IFA_ADDRESS, &octets);

        self.execute(request)
    }

    /// Install a default route through `gateway`, optionally pinned to an
    /// output interface.
    pub fn add_default_route(&mut self, gateway: IpAddr, oif: Option<u32>) -> Result<()> {
        let msg = RtMsg {
            rtm_family: address_family(&gateway),
            rtm_dst_len: 0,
            rtm_src_len: 0,
            rtm_tos: 0,
            rtm_table: RT_TABLE_MAIN,
            rtm_protocol: RTPROT_BOOT,
            rtm_scope: RT_SCOPE_UNIVERSE,
            rtm_type: RTN_UNICAST,
            rtm_flags: 0,
        };

        let mut request = Request::new(RTM_NEWROUTE, NLM_F_CREATE | NLM_F_EXCL, &msg);
        request.attr_bytes(RTA_GATEWAY, &address_octets(&gateway));
        if let Some(oif) = oif {
            request.attr_u32(RTA_OIF, oif);
        }

        self.execute(request)
    }
}

/// Interpret the kernel's reply to a request sent with `NLM_F_ACK`.
fn check_ack(reply: &[u8]) -> Result<()> {
    let header_len = mem::size_of::<NlMsgHdr>();
    if reply.len() < header_len {
        return Err(Error::Netlink {
            message: format!("short netlink reply ({} bytes)", reply.len()),
        });
    }

    let message_type = u16::from_ne_bytes([reply[4], reply[5]]);
    if message_type != NLMSG_ERROR {
        return Ok(());
    }

    let Some(code) = reply.get(header_len..header_len + 4) else {
        return Err(Error::Netlink {
            message: "truncated netlink error message".to_string(),
        });
    };

    match i32::from_ne_bytes([code[0], code[1], code[2], code[3]]) {
        0 => Ok(()),
        errno => Err(Error::Netlink {
            message: io::Error::from_raw_os_error(-errno).to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16_at(buf: &[u8], offset: usize) -> u16 {
        u16::from_ne_bytes([buf[offset], buf[offset + 1]])
    }

    #[test]
    fn test_message_struct_sizes() {
        assert_eq!(mem::size_of::<NlMsgHdr>(), 16);
        assert_eq!(mem::size_of::<IfInfoMsg>(), 16);
        assert_eq!(mem::size_of::<IfAddrMsg>(), 8);
        assert_eq!(mem::size_of::<RtMsg>(), 12);
    }

    #[test]
    fn test_request_header_and_padding() {
        let info = IfInfoMsg::for_index(7).unwrap();
        let mut request = Request::new(RTM_NEWLINK, 0, &info);
        request.attr_str(IFLA_IFNAME, "eth0");

        let msg = request.finish(42);

        // header + ifinfomsg + (4 byte attr header + "eth0\0" padded to 8)
        assert_eq!(msg.len(), 16 + 16 + 12);
        assert_eq!(u32::from_ne_bytes([msg[0], msg[1], msg[2], msg[3]]), 44);
        assert_eq!(u16_at(&msg, 4), RTM_NEWLINK);
        assert_eq!(u16_at(&msg, 6), NLM_F_REQUEST | NLM_F_ACK);
        assert_eq!(u32::from_ne_bytes([msg[8], msg[9], msg[10], msg[11]]), 42);

        assert_eq!(u16_at(&msg, 32), 9);
        assert_eq!(u16_at(&msg, 34), IFLA_IFNAME);
        assert_eq!(&msg[36..41], b"eth0\0");
    }

    #[test]
    fn test_nested_attribute_lengths() {
        let info = IfInfoMsg::default();
        let mut request = Request::new(RTM_NEWLINK, 0, &info);
        request
            .begin_nested(IFLA_LINKINFO)
            .attr_str(IFLA_INFO_KIND, "veth")
            .end_nested();

        let msg = request.finish(1);

        // nest header (4) + kind attr (4 + "veth\0" padded to 8)
        assert_eq!(u16_at(&msg, 32), 16);
        assert_eq!(u16_at(&msg, 34), IFLA_LINKINFO | NLA_F_NESTED);
    }

    #[test]
    fn test_check_ack() {
        let mut reply = vec![0u8; 36];
        reply[4..6].copy_from_slice(&NLMSG_ERROR.to_ne_bytes());
        assert!(check_ack(&reply).is_ok());

        reply[16..20].copy_from_slice(&(-libc::EEXIST).to_ne_bytes());
        assert!(matches!(check_ack(&reply), Err(Error::Netlink { .. })));

        assert!(check_ack(&reply[..8]).is_err());
    }

    #[test]
    fn test_unknown_interface() {
        let handle = NetlinkHandle::new().unwrap();
        let err = handle.ifindex("tether-nope0").unwrap_err();
        assert!(matches!(err, Error::InterfaceNotFound { .. }));
    }

    #[test]
    fn test_loopback_index() {
        let handle = NetlinkHandle::new().unwrap();
        assert!(handle.ifindex("lo").unwrap() > 0);
    }
}
