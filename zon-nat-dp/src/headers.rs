//! Ethernet, IPv4 and TCP/UDP header parsing over a raw frame buffer.
//!
//! Every layer is bounds checked before it is read. Addresses and ports are
//! returned in host byte order; writers take host order values and store
//! them in network order.

use core::mem::{self, offset_of};
use network_types::{
    eth::EthHdr,
    ip::{IpProto, Ipv4Hdr},
    tcp::TcpHdr,
    udp::UdpHdr,
};
use thiserror::Error;
use zon_nat_common::FlowKey;

pub const ETH_P_IPV4: u16 = 0x0800;
pub const ETH_P_8021Q: u16 = 0x8100;

const VLAN_HDR_LEN: usize = 4;
const ETH_TYPE_OFF: usize = 12;
const IPV4_TOT_LEN_OFF: usize = 2;
const IPV4_FRAG_OFF: usize = 6;
const IPV4_FRAG_OFFSET_MASK: u16 = 0x1FFF;
const IPV4_MORE_FRAGMENTS: u16 = 0x2000;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("{layer} header truncated, need {need} bytes, have {have}")]
    Truncated {
        layer: &'static str,
        need: usize,
        have: usize,
    },
    #[error("not an IPv4 frame, ether type 0x{0:04x}")]
    NotIpv4(u16),
    #[error("malformed IPv4 header, version {version}, ihl {ihl}")]
    BadIpv4 { version: u8, ihl: u8 },
    #[error("IPv4 fragment, offset {0}")]
    Fragment(u16),
    #[error("IPv4 first fragment, more fragments follow")]
    MoreFragments,
    #[error("unsupported transport protocol {0}")]
    Unsupported(u8),
    #[error("access of {len} bytes at {offset} exceeds packet length {have}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        have: usize,
    },
}

impl HeaderError {
    /// True for well formed traffic this engine does not translate.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Self::NotIpv4(_) | Self::Fragment(_) | Self::MoreFragments | Self::Unsupported(_)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L4Proto {
    Tcp,
    Udp,
}

impl L4Proto {
    pub fn from_ip_proto(proto: u8) -> Option<Self> {
        if proto == IpProto::Tcp as u8 {
            Some(Self::Tcp)
        } else if proto == IpProto::Udp as u8 {
            Some(Self::Udp)
        } else {
            None
        }
    }

    pub fn ip_proto(&self) -> u8 {
        match self {
            Self::Tcp => IpProto::Tcp as u8,
            Self::Udp => IpProto::Udp as u8,
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            Self::Tcp => mem::size_of::<TcpHdr>(),
            Self::Udp => mem::size_of::<UdpHdr>(),
        }
    }

    /// Offset of the checksum field inside the transport header
    pub fn check_off(&self) -> usize {
        match self {
            Self::Tcp => offset_of!(TcpHdr, check),
            Self::Udp => offset_of!(UdpHdr, check),
        }
    }
}

/// Offsets and values extracted from a TCP or UDP over IPv4 frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Headers {
    pub l3_offset: usize,
    pub l4_offset: usize,
    pub vlan_id: Option<u16>,
    pub proto: L4Proto,
    pub total_len: u16,
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub ip_check: u16,
    pub l4_check: u16,
}

impl Headers {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.src_port, self.dst_port)
    }

    pub fn src_addr_off(&self) -> usize {
        self.l3_offset + offset_of!(Ipv4Hdr, src_addr)
    }

    pub fn dst_addr_off(&self) -> usize {
        self.l3_offset + offset_of!(Ipv4Hdr, dst_addr)
    }

    pub fn ip_check_off(&self) -> usize {
        self.l3_offset + offset_of!(Ipv4Hdr, check)
    }

    pub fn l4_check_off(&self) -> usize {
        self.l4_offset + self.proto.check_off()
    }

    pub fn ip_header_len(&self) -> usize {
        self.l4_offset - self.l3_offset
    }
}

fn ensure(buf: &[u8], layer: &'static str, need: usize) -> Result<(), HeaderError> {
    if buf.len() < need {
        return Err(HeaderError::Truncated {
            layer,
            need,
            have: buf.len(),
        });
    }
    Ok(())
}

fn bounds(buf: &[u8], offset: usize, len: usize) -> Result<(), HeaderError> {
    match offset.checked_add(len) {
        Some(end) if end <= buf.len() => Ok(()),
        _ => Err(HeaderError::OutOfBounds {
            offset,
            len,
            have: buf.len(),
        }),
    }
}

pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16, HeaderError> {
    bounds(buf, offset, 2)?;
    Ok(u16::from_be_bytes([buf[offset], buf[offset + 1]]))
}

pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32, HeaderError> {
    bounds(buf, offset, 4)?;
    let mut bytes = [0_u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    Ok(u32::from_be_bytes(bytes))
}

pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) -> Result<(), HeaderError> {
    bounds(buf, offset, 2)?;
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<(), HeaderError> {
    bounds(buf, offset, 4)?;
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Checks that `len` bytes starting at `offset` can be written.
pub fn check_writable(buf: &[u8], offset: usize, len: usize) -> Result<(), HeaderError> {
    bounds(buf, offset, len)
}

/// Parses the frame up to and including the transport header.
pub fn parse(buf: &[u8]) -> Result<Headers, HeaderError> {
    let eth_len = mem::size_of::<EthHdr>();
    ensure(buf, "ethernet", eth_len)?;

    let mut l3_offset = eth_len;
    let mut ether_type = read_u16(buf, ETH_TYPE_OFF)?;
    let mut vlan_id = None;

    // Single 802.1Q tag
    if ether_type == ETH_P_8021Q {
        ensure(buf, "vlan", eth_len + VLAN_HDR_LEN)?;
        vlan_id = Some(read_u16(buf, eth_len)? & 0x0FFF);
        ether_type = read_u16(buf, eth_len + 2)?;
        l3_offset += VLAN_HDR_LEN;
    }

    if ether_type != ETH_P_IPV4 {
        return Err(HeaderError::NotIpv4(ether_type));
    }

    ensure(buf, "ipv4", l3_offset + mem::size_of::<Ipv4Hdr>())?;

    let version = buf[l3_offset] >> 4;
    let ihl = buf[l3_offset] & 0x0F;
    if version != 4 || ihl < 5 {
        return Err(HeaderError::BadIpv4 { version, ihl });
    }

    // Options are skipped, never interpreted
    let l4_offset = l3_offset + ((ihl as usize) << 2);
    ensure(buf, "ipv4 options", l4_offset)?;

    let frag = read_u16(buf, l3_offset + IPV4_FRAG_OFF)?;
    if frag & IPV4_FRAG_OFFSET_MASK != 0 {
        return Err(HeaderError::Fragment(frag & IPV4_FRAG_OFFSET_MASK));
    }
    if frag & IPV4_MORE_FRAGMENTS != 0 {
        return Err(HeaderError::MoreFragments);
    }

    let ip_proto = buf[l3_offset + offset_of!(Ipv4Hdr, proto)];
    let proto = L4Proto::from_ip_proto(ip_proto).ok_or(HeaderError::Unsupported(ip_proto))?;

    ensure(
        buf,
        match proto {
            L4Proto::Tcp => "tcp",
            L4Proto::Udp => "udp",
        },
        l4_offset + proto.header_len(),
    )?;

    Ok(Headers {
        l3_offset,
        l4_offset,
        vlan_id,
        proto,
        total_len: read_u16(buf, l3_offset + IPV4_TOT_LEN_OFF)?,
        src_addr: read_u32(buf, l3_offset + offset_of!(Ipv4Hdr, src_addr))?,
        dst_addr: read_u32(buf, l3_offset + offset_of!(Ipv4Hdr, dst_addr))?,
        src_port: read_u16(buf, l4_offset)?,
        dst_port: read_u16(buf, l4_offset + 2)?,
        ip_check: read_u16(buf, l3_offset + offset_of!(Ipv4Hdr, check))?,
        l4_check: read_u16(buf, l4_offset + proto.check_off())?,
    })
}
