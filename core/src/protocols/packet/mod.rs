//! Link, network, and transport header views.
//!
//! Each header type is a zero-copy view constructed from a [`Reader`];
//! construction fails (returns `None`) on short or malformed input and the
//! packet is simply not processed further at that layer.

pub mod ethernet;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

use std::net::IpAddr;

use crate::reader::Reader;
use ipv4::Ipv4;
use ipv6::Ipv6;
use tcp::Tcp;
use udp::Udp;

/// Connection 5-tuple, derived from network-order header fields.
///
/// Used as the map key by the reassembler and the flow tables, and carried
/// into every output record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    #[inline]
    pub fn ip_version(&self) -> u8 {
        match self.src_addr {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }
}

/// The network layer of a packet, after link-layer decode.
pub enum IpHeader<'a> {
    V4(Ipv4<'a>),
    V6(Ipv6<'a>),
}

impl<'a> IpHeader<'a> {
    /// Parses an IPv4 or IPv6 header based on the version nibble.
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        match r.peek_u8()? >> 4 {
            4 => Ipv4::parse(r).map(IpHeader::V4),
            6 => Ipv6::parse(r).map(IpHeader::V6),
            _ => None,
        }
    }

    #[inline]
    pub fn transport_protocol(&self) -> u8 {
        match self {
            IpHeader::V4(v4) => v4.protocol(),
            IpHeader::V6(v6) => v6.transport_protocol(),
        }
    }

    #[inline]
    pub fn src_addr(&self) -> IpAddr {
        match self {
            IpHeader::V4(v4) => IpAddr::V4(v4.src_addr()),
            IpHeader::V6(v6) => IpAddr::V6(v6.src_addr()),
        }
    }

    #[inline]
    pub fn dst_addr(&self) -> IpAddr {
        match self {
            IpHeader::V4(v4) => IpAddr::V4(v4.dst_addr()),
            IpHeader::V6(v6) => IpAddr::V6(v6.dst_addr()),
        }
    }
}

/// The transport layer, with ports extracted for the flow key.
pub enum Transport<'a> {
    Tcp(Tcp<'a>),
    Udp(Udp<'a>),
}

impl<'a> Transport<'a> {
    pub fn parse(proto: u8, r: &mut Reader<'a>) -> Option<Self> {
        match proto {
            tcp::TCP_PROTOCOL => Tcp::parse(r).map(Transport::Tcp),
            udp::UDP_PROTOCOL => Udp::parse(r).map(Transport::Udp),
            _ => None,
        }
    }

    /// Builds the flow key for this packet.
    pub fn flow_key(&self, ip: &IpHeader) -> FlowKey {
        let (proto, src_port, dst_port) = match self {
            Transport::Tcp(t) => (tcp::TCP_PROTOCOL, t.src_port(), t.dst_port()),
            Transport::Udp(u) => (udp::UDP_PROTOCOL, u.src_port(), u.dst_port()),
        };
        FlowKey {
            src_addr: ip.src_addr(),
            dst_addr: ip.dst_addr(),
            protocol: proto,
            src_port,
            dst_port,
        }
    }
}
