use crate::checksum::{ipv4_header_checksum, l4_checksum_ipv4};
use crate::headers::{L4Proto, ETH_P_8021Q, ETH_P_IPV4};
use std::net::SocketAddrV4;

const DEFAULT_TTL: u8 = 64;
const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

/// Builds Ethernet frames carrying a TCP or UDP over IPv4 segment with
/// valid checksums. Used by the probe command and the tests.
#[derive(Clone, Debug)]
pub struct FrameBuilder {
    src: SocketAddrV4,
    dst: SocketAddrV4,
    proto: L4Proto,
    payload: Vec<u8>,
    ip_options: Vec<u8>,
    vlan: Option<u16>,
    l4_checksum: bool,
}

impl FrameBuilder {
    pub fn new(proto: L4Proto, src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self {
            src,
            dst,
            proto,
            payload: vec![],
            ip_options: vec![],
            vlan: None,
            l4_checksum: true,
        }
    }

    pub fn tcp(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self::new(L4Proto::Tcp, src, dst)
    }

    pub fn udp(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self::new(L4Proto::Udp, src, dst)
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn vlan(mut self, id: u16) -> Self {
        self.vlan = Some(id & 0x0FFF);
        self
    }

    /// IPv4 options, padded with zeros to a multiple of 4 bytes (max 40).
    pub fn ip_options(mut self, options: &[u8]) -> Self {
        let mut options = options[..options.len().min(40)].to_vec();
        options.resize(options.len().div_ceil(4) * 4, 0);
        self.ip_options = options;
        self
    }

    /// Leaves the UDP checksum at zero. Ignored for TCP.
    pub fn no_l4_checksum(mut self) -> Self {
        self.l4_checksum = false;
        self
    }

    fn l4_segment(&self) -> Vec<u8> {
        let mut seg = match self.proto {
            L4Proto::Tcp => {
                let mut hdr = vec![0_u8; 20];
                hdr[4..8].copy_from_slice(&1_u32.to_be_bytes()); // seq
                hdr[12] = 5 << 4; // data offset
                hdr[13] = 0x18; // PSH, ACK
                hdr[14..16].copy_from_slice(&0xFFFF_u16.to_be_bytes()); // window
                hdr
            }
            L4Proto::Udp => {
                let mut hdr = vec![0_u8; 8];
                let len = (8 + self.payload.len()) as u16;
                hdr[4..6].copy_from_slice(&len.to_be_bytes());
                hdr
            }
        };
        seg[0..2].copy_from_slice(&self.src.port().to_be_bytes());
        seg[2..4].copy_from_slice(&self.dst.port().to_be_bytes());
        seg.extend_from_slice(&self.payload);

        if self.proto == L4Proto::Tcp || self.l4_checksum {
            let check_off = self.proto.check_off();
            let check = l4_checksum_ipv4(
                u32::from(*self.src.ip()),
                u32::from(*self.dst.ip()),
                self.proto.ip_proto(),
                &seg,
                check_off,
            );
            let check = match (self.proto, check) {
                (L4Proto::Udp, 0) => 0xFFFF,
                (_, check) => check,
            };
            seg[check_off..check_off + 2].copy_from_slice(&check.to_be_bytes());
        }

        seg
    }

    fn ipv4_header(&self, seg_len: usize) -> Vec<u8> {
        let hdr_len = 20 + self.ip_options.len();
        let mut hdr = vec![0_u8; hdr_len];
        hdr[0] = (4 << 4) | (hdr_len / 4) as u8;
        hdr[2..4].copy_from_slice(&((hdr_len + seg_len) as u16).to_be_bytes());
        hdr[4..6].copy_from_slice(&0x1234_u16.to_be_bytes());
        hdr[6..8].copy_from_slice(&0x4000_u16.to_be_bytes()); // DF
        hdr[8] = DEFAULT_TTL;
        hdr[9] = self.proto.ip_proto();
        hdr[12..16].copy_from_slice(&self.src.ip().octets());
        hdr[16..20].copy_from_slice(&self.dst.ip().octets());
        hdr[20..].copy_from_slice(&self.ip_options);
        let check = ipv4_header_checksum(&hdr, 10);
        hdr[10..12].copy_from_slice(&check.to_be_bytes());
        hdr
    }

    pub fn build(&self) -> Vec<u8> {
        let seg = self.l4_segment();
        let iphdr = self.ipv4_header(seg.len());

        let mut frame = Vec::with_capacity(18 + iphdr.len() + seg.len());
        frame.extend_from_slice(&DST_MAC);
        frame.extend_from_slice(&SRC_MAC);
        if let Some(id) = self.vlan {
            frame.extend_from_slice(&ETH_P_8021Q.to_be_bytes());
            frame.extend_from_slice(&id.to_be_bytes());
        }
        frame.extend_from_slice(&ETH_P_IPV4.to_be_bytes());
        frame.extend_from_slice(&iphdr);
        frame.extend_from_slice(&seg);
        frame
    }
}
