//! Network watch session on top of rtnetlink address notifications.

use std::{
    collections::VecDeque,
    convert::Infallible,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    os::fd::BorrowedFd,
};

use num_enum::FromPrimitive;
use rustix::net::{
    AddressFamily, SocketFlags, SocketType, bind, netlink::SocketAddrNetlink,
    socket_with,
};
use snafu::{OptionExt, ResultExt, ensure};
use strum::Display;
use tokio::io::unix::AsyncFd;
use tracing::debug;

use crate::{
    protocol_common::{
        IFADDRMSG_LEN, IfAddrMsgHeader, KernelResourceSnafu,
        MalformedRecordSnafu, NLMSG_ALIGN_SHIFT, NLMSG_HDR_LEN, NlMsgHeader,
        RTATTR_HDR_LEN, RtAttrHeader, WatchError, align_up_pow2,
    },
    reader::{EventStream, KernelSource, ReaderHandle},
    record::{Malformed, Record, read_pod, records},
    shutdown::Shutdown,
};

/// Data lost. The kernel reports this as `ENOBUFS` on the socket rather
/// than as a message, so the reader synthesizes one.
pub const NLMSG_OVERRUN: u16 = 4;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;

pub const RTMGRP_LINK: u32 = 0x1;
// RTNLGRP_IPV4_IFADDR is the group *number* 5. bind() takes the legacy
// bitmask, where IPv4 addresses are 1 << (5 - 1).
pub const RTMGRP_IPV4_IFADDR: u32 = 0x10;
pub const RTMGRP_IPV6_IFADDR: u32 = 0x100;

pub const SUBSCRIBED_GROUPS: u32 =
    RTMGRP_LINK | RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR;

/// Large enough for the biggest datagram rtnetlink sends unsolicited.
const NETLINK_BUF_LEN: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingMessage {
    pub message_type: u16,
    pub flags: u16,
    pub sequence: u32,
    pub port_id: u32,
    pub payload: Vec<u8>,
}

impl Record for RoutingMessage {
    fn decode(buf: &[u8]) -> Result<(Self, usize), Malformed> {
        let header: NlMsgHeader = read_pod(buf, 0)
            .ok_or(Malformed::fatal("truncated netlink header"))?;

        let len = header.len as usize;
        if len < NLMSG_HDR_LEN {
            return Err(Malformed::fatal("netlink length shorter than header"));
        }
        let payload = buf
            .get(NLMSG_HDR_LEN..len)
            .ok_or(Malformed::fatal("netlink length runs past end of buffer"))?;

        let message = Self {
            message_type: header.ty,
            flags: header.flags,
            sequence: header.seq,
            port_id: header.pid,
            payload: payload.to_vec(),
        };
        Ok((message, align_up_pow2(len, NLMSG_ALIGN_SHIFT)))
    }
}

impl RoutingMessage {
    /// Marker queued when the socket's receive buffer overran.
    pub fn overrun() -> Self {
        Self {
            message_type: NLMSG_OVERRUN,
            flags: 0,
            sequence: 0,
            port_id: 0,
            payload: Vec::new(),
        }
    }

    pub fn is_overrun(&self) -> bool {
        self.message_type == NLMSG_OVERRUN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MessageKind {
    NewAddress,
    DeletedAddress,
    /// Messages were lost, current state has to be re-read.
    Overrun,
    Other,
}

pub fn classify(msg: &RoutingMessage) -> MessageKind {
    match msg.message_type {
        RTM_NEWADDR => MessageKind::NewAddress,
        RTM_DELADDR => MessageKind::DeletedAddress,
        NLMSG_OVERRUN => MessageKind::Overrun,
        _ => MessageKind::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromPrimitive)]
#[repr(u8)]
pub enum AddressScope {
    Universe = 0,
    // 1 is never a kernel scope, it only gives the catch-all a discriminant
    #[num_enum(catch_all)]
    Other(u8) = 1,
    Site = 200,
    Link = 253,
    Host = 254,
    Nowhere = 255,
}

impl From<AddressScope> for u8 {
    fn from(scope: AddressScope) -> u8 {
        match scope {
            AddressScope::Universe => 0,
            AddressScope::Other(raw) => raw,
            AddressScope::Site => 200,
            AddressScope::Link => 253,
            AddressScope::Host => 254,
            AddressScope::Nowhere => 255,
        }
    }
}

impl AddressScope {
    /// Whether an address in this scope counts as a real assignment rather
    /// than link-local or loopback noise.
    pub fn is_globally_relevant(self) -> bool {
        matches!(self, AddressScope::Universe | AddressScope::Site)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressChangeMessage {
    pub kind: MessageKind,
    pub interface_index: i32,
    pub prefix_len: u8,
    pub flags: u8,
    pub scope: AddressScope,
    pub address: IpAddr,
    pub mask: IpAddr,
}

impl AddressChangeMessage {
    pub fn address_bytes(&self) -> Vec<u8> {
        match self.address {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    pub fn is_globally_relevant(&self) -> bool {
        self.scope.is_globally_relevant()
    }
}

/// Netmask with the top `prefix_len` bits of `address`'s width set.
pub fn prefix_mask(address: IpAddr, prefix_len: u8) -> IpAddr {
    let prefix = u32::from(prefix_len);
    match address {
        IpAddr::V4(_) => {
            let bits =
                u32::MAX.checked_shl(32 - prefix.min(32)).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(bits))
        }
        IpAddr::V6(_) => {
            let bits =
                u128::MAX.checked_shl(128 - prefix.min(128)).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(bits))
        }
    }
}

/// Parse the `ifaddrmsg` and the first attribute of an address change.
pub fn parse_address_change(
    msg: &RoutingMessage,
) -> Result<AddressChangeMessage, WatchError> {
    let kind = classify(msg);
    ensure!(
        matches!(kind, MessageKind::NewAddress | MessageKind::DeletedAddress),
        MalformedRecordSnafu {
            offset: 0_usize,
            reason: "not an address change message",
        }
    );

    let payload = msg.payload.as_slice();
    let header: IfAddrMsgHeader =
        read_pod(payload, 0).context(MalformedRecordSnafu {
            offset: 0_usize,
            reason: "truncated ifaddrmsg",
        })?;

    let attr_at = IFADDRMSG_LEN;
    let attr: RtAttrHeader =
        read_pod(payload, attr_at).context(MalformedRecordSnafu {
            offset: attr_at,
            reason: "truncated rtattr header",
        })?;
    let attr_len = usize::from(attr.len);
    ensure!(
        attr_len >= RTATTR_HDR_LEN,
        MalformedRecordSnafu {
            offset: attr_at,
            reason: "rtattr length shorter than its header",
        }
    );

    let addr_at = attr_at + RTATTR_HDR_LEN;
    let bytes = payload
        .get(addr_at..attr_at + attr_len)
        .context(MalformedRecordSnafu {
            offset: attr_at,
            reason: "rtattr length runs past payload",
        })?;

    let address = match i32::from(header.family) {
        libc::AF_INET => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        libc::AF_INET6 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
    .context(MalformedRecordSnafu {
        offset: addr_at,
        reason: "address length does not match family",
    })?;

    ensure!(
        usize::from(header.prefix_len) <= bytes.len() * 8,
        MalformedRecordSnafu {
            offset: 1_usize,
            reason: "prefix length wider than address",
        }
    );

    Ok(AddressChangeMessage {
        kind,
        interface_index: header.index,
        prefix_len: header.prefix_len,
        flags: header.flags,
        scope: AddressScope::from_primitive(header.scope),
        address,
        mask: prefix_mask(address, header.prefix_len),
    })
}

struct NetlinkSource;

impl KernelSource for NetlinkSource {
    type Item = RoutingMessage;
    type Command = Infallible;

    fn ingest(&mut self, buf: &[u8], out: &mut VecDeque<RoutingMessage>) {
        for record in records::<RoutingMessage>(buf) {
            match record {
                Ok(msg) => {
                    debug!(
                        kind = %classify(&msg),
                        message_type = msg.message_type,
                        len = msg.payload.len(),
                        "routing message"
                    );
                    out.push_back(msg);
                }
                Err(e) => {
                    debug!(error = %e, "skipping malformed netlink record");
                }
            }
        }
    }

    fn handle(&mut self, _fd: BorrowedFd<'_>, cmd: Infallible) {
        match cmd {}
    }

    fn overrun(&mut self, out: &mut VecDeque<RoutingMessage>) {
        if !out.back().is_some_and(RoutingMessage::is_overrun) {
            out.push_back(RoutingMessage::overrun());
        }
    }
}

/// A routing socket subscribed to link and address changes.
pub struct NetWatchSession {
    reader: ReaderHandle<RoutingMessage>,
}

impl NetWatchSession {
    /// Open and bind the socket and start its reader. Must be called from
    /// within a Tokio runtime.
    pub fn open() -> Result<Self, WatchError> {
        let fd = socket_with(
            AddressFamily::NETLINK,
            SocketType::DGRAM,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            // NETLINK_ROUTE is protocol 0
            None,
        )
        .map_err(io::Error::from)
        .context(KernelResourceSnafu {
            op: "socket(AF_NETLINK)",
        })?;

        bind(&fd, &SocketAddrNetlink::new(0, SUBSCRIBED_GROUPS))
            .map_err(io::Error::from)
            .context(KernelResourceSnafu {
                op: "bind(AF_NETLINK)",
            })?;

        let fd = AsyncFd::new(fd).context(KernelResourceSnafu {
            op: "register netlink socket",
        })?;

        let reader = ReaderHandle::spawn(
            "netlink-reader",
            NetlinkSource,
            fd,
            None,
            NETLINK_BUF_LEN,
        );
        Ok(Self { reader })
    }

    /// Take the message stream. Only the first call succeeds.
    pub fn events(
        &mut self,
    ) -> Result<EventStream<RoutingMessage>, WatchError> {
        self.reader.events()
    }

    pub fn shutdown_token(&self) -> Shutdown {
        self.reader.shutdown_token()
    }

    pub async fn close(self) -> Result<(), WatchError> {
        self.reader.close().await
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::bytes_of;

    use super::*;

    const AF_INET: u8 = libc::AF_INET as u8;
    const AF_INET6: u8 = libc::AF_INET6 as u8;

    fn address_payload(
        family: u8,
        prefix_len: u8,
        scope: u8,
        addr: &[u8],
        declared_attr_len: u16,
    ) -> Vec<u8> {
        let ifa = IfAddrMsgHeader {
            family,
            prefix_len,
            flags: 0,
            scope,
            index: 3,
        };
        let rta = RtAttrHeader {
            len: declared_attr_len,
            ty: 1, // IFA_ADDRESS
        };
        let mut out =
            Vec::with_capacity(IFADDRMSG_LEN + RTATTR_HDR_LEN + addr.len());
        out.extend_from_slice(bytes_of(&ifa));
        out.extend_from_slice(bytes_of(&rta));
        out.extend_from_slice(addr);
        out
    }

    /// IPv4, universe scope, attribute length matching the address.
    fn v4_payload(prefix_len: u8, addr: [u8; 4]) -> Vec<u8> {
        address_payload(AF_INET, prefix_len, 0, &addr, 8)
    }

    fn message(message_type: u16, payload: Vec<u8>) -> RoutingMessage {
        RoutingMessage {
            message_type,
            flags: 0,
            sequence: 0,
            port_id: 0,
            payload,
        }
    }

    fn frame(message_type: u16, payload: &[u8]) -> Vec<u8> {
        let header = NlMsgHeader {
            len: (NLMSG_HDR_LEN + payload.len()) as u32,
            ty: message_type,
            flags: 0,
            seq: 7,
            pid: 0,
        };
        let mut out = bytes_of(&header).to_vec();
        out.extend_from_slice(payload);
        out.resize(align_up_pow2(out.len(), NLMSG_ALIGN_SHIFT), 0);
        out
    }

    #[test]
    fn parses_ipv4_address_and_derives_mask() {
        let payload = v4_payload(24, [10, 0, 0, 5]);
        let parsed = parse_address_change(&message(RTM_NEWADDR, payload))
            .expect("well formed");

        assert_eq!(parsed.kind, MessageKind::NewAddress);
        assert_eq!(parsed.address_bytes(), vec![10, 0, 0, 5]);
        assert_eq!(parsed.address, IpAddr::from([10, 0, 0, 5]));
        assert_eq!(parsed.mask, IpAddr::from([255, 255, 255, 0]));
        assert_eq!(parsed.prefix_len, 24);
        assert_eq!(parsed.interface_index, 3);
        assert_eq!(parsed.scope, AddressScope::Universe);
    }

    #[test]
    fn parses_ipv6_address() {
        let addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1).octets();
        let payload = address_payload(AF_INET6, 64, 200, &addr, 20);
        let parsed = parse_address_change(&message(RTM_DELADDR, payload))
            .expect("well formed");

        assert_eq!(parsed.kind, MessageKind::DeletedAddress);
        assert_eq!(parsed.address_bytes(), addr.to_vec());
        let mask = Ipv6Addr::new(0xffff, 0xffff, 0xffff, 0xffff, 0, 0, 0, 0);
        assert_eq!(parsed.mask, IpAddr::V6(mask));
        assert_eq!(parsed.scope, AddressScope::Site);
    }

    #[test]
    fn attribute_length_past_payload_is_malformed() {
        // allocated to exactly its nominal size, attribute claims 4 more
        let payload = address_payload(AF_INET, 24, 0, &[10, 0, 0, 5], 12);
        assert_eq!(payload.len(), IFADDRMSG_LEN + RTATTR_HDR_LEN + 4);

        let err = parse_address_change(&message(RTM_NEWADDR, payload))
            .expect_err("must not read past payload");
        assert!(err.is_malformed());
    }

    #[test]
    fn rejects_inconsistent_family_and_prefix() {
        let cases = [
            // IPv4 family but six address bytes
            (RTM_NEWADDR, address_payload(AF_INET, 24, 0, &[1; 6], 10)),
            (RTM_NEWADDR, v4_payload(33, [10, 0, 0, 5])),
            (RTM_NEWADDR, address_payload(AF_INET, 24, 0, &[10, 0, 0, 5], 2)),
            // RTM_NEWLINK
            (16, v4_payload(24, [10, 0, 0, 5])),
            (NLMSG_OVERRUN, Vec::new()),
            (RTM_NEWADDR, vec![2, 24]),
        ];
        for (ty, payload) in cases {
            let res = parse_address_change(&message(ty, payload.clone()));
            assert!(res.is_err(), "type {ty} payload {payload:?}");
        }
    }

    #[test]
    fn relevance_follows_scope() {
        for scope in 0..=u8::MAX {
            let expected = scope == 0 || scope == 200;
            assert_eq!(
                AddressScope::from_primitive(scope).is_globally_relevant(),
                expected,
                "scope {scope}"
            );
        }

        let payload = address_payload(AF_INET, 8, 253, &[169, 254, 0, 1], 8);
        let parsed = parse_address_change(&message(RTM_NEWADDR, payload))
            .expect("well formed");
        assert!(!parsed.is_globally_relevant());
    }

    #[test]
    fn scope_survives_the_wire_byte() {
        assert_eq!(AddressScope::from_primitive(1), AddressScope::Other(1));
        assert_eq!(AddressScope::from_primitive(255), AddressScope::Nowhere);
        assert_eq!(AddressScope::from_primitive(254), AddressScope::Host);
        for scope in 0..=u8::MAX {
            let back: u8 = AddressScope::from_primitive(scope).into();
            assert_eq!(back, scope);
        }
    }

    #[test]
    fn classifies_on_message_type() {
        let kind = |ty| classify(&message(ty, vec![]));
        assert_eq!(kind(RTM_NEWADDR), MessageKind::NewAddress);
        assert_eq!(kind(RTM_DELADDR), MessageKind::DeletedAddress);
        assert_eq!(kind(NLMSG_OVERRUN), MessageKind::Overrun);
        assert_eq!(kind(16), MessageKind::Other); // RTM_NEWLINK
        assert_eq!(kind(3), MessageKind::Other); // NLMSG_DONE
    }

    #[test]
    fn mask_edges() {
        let v4 = IpAddr::from([0, 0, 0, 0]);
        assert_eq!(prefix_mask(v4, 0), IpAddr::from([0, 0, 0, 0]));
        assert_eq!(prefix_mask(v4, 32), IpAddr::from([255, 255, 255, 255]));
        assert_eq!(prefix_mask(v4, 17), IpAddr::from([255, 255, 128, 0]));
    }

    #[test]
    fn decodes_batched_netlink_messages() {
        let first = v4_payload(24, [10, 0, 0, 5]);
        let mut buf = frame(RTM_NEWADDR, &first);
        buf.extend(frame(16, &[1, 2, 3])); // padded to 4
        buf.extend(frame(RTM_DELADDR, &first));

        let msgs: Vec<_> = records::<RoutingMessage>(&buf)
            .map(|r| r.expect("well formed"))
            .collect();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].payload, first);
        assert_eq!(msgs[0].sequence, 7);
        assert_eq!(msgs[1].payload, vec![1, 2, 3]);
        assert_eq!(classify(&msgs[2]), MessageKind::DeletedAddress);
    }

    #[test]
    fn netlink_length_past_buffer_abandons_rest() {
        let payload = [0u8; 8];
        let mut buf = frame(RTM_NEWADDR, &payload);
        let mut bad = frame(RTM_NEWADDR, &payload);
        bad[0..4].copy_from_slice(&200u32.to_ne_bytes());
        buf.extend(bad);
        buf.extend(frame(RTM_NEWADDR, &payload));

        let out: Vec<_> = records::<RoutingMessage>(&buf).collect();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(out[1].as_ref().is_err_and(WatchError::is_malformed));
    }

    #[test]
    fn ingest_skips_malformed_without_stopping_good_ones() {
        let payload = [0u8; 4];
        let mut buf = frame(RTM_NEWADDR, &payload);
        let mut bad = frame(RTM_NEWADDR, &payload);
        bad[0..4].copy_from_slice(&4u32.to_ne_bytes());
        buf.extend(bad);

        let mut out = VecDeque::new();
        NetlinkSource.ingest(&buf, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message_type, RTM_NEWADDR);
    }

    #[test]
    fn overrun_queues_one_marker_after_pending_messages() {
        let mut out = VecDeque::new();
        NetlinkSource.ingest(&frame(RTM_NEWADDR, &[0u8; 4]), &mut out);

        NetlinkSource.overrun(&mut out);
        NetlinkSource.overrun(&mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message_type, RTM_NEWADDR);
        assert!(out[1].is_overrun());
        assert_eq!(classify(&out[1]), MessageKind::Overrun);
    }
}
