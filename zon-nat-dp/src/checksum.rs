//! Internet checksum maintenance for IPv4 address rewrites.
//!
//! All values are ones' complement sums over big-endian 16-bit words, the
//! address arguments are host order `u32`s as returned by the header parser.

use crate::headers::{self, HeaderError, Headers, L4Proto};

/// Folds a 32-bit ones' complement accumulator into 16 bits.
pub fn csum_fold_32_to_16(csum: u32) -> u16 {
    let csum = (csum & 0xFFFF) + (csum >> 16);
    let csum = (csum & 0xFFFF) + (csum >> 16);
    csum as u16
}

/// Returns the checksum field value after a 32-bit word covered by it
/// changed from `old` to `new` (RFC 1624, eqn. 3).
pub fn csum_update_u32(check: u16, old: u32, new: u32) -> u16 {
    let mut sum = !check as u32;
    sum += !(old >> 16) & 0xFFFF;
    sum += !old & 0xFFFF;
    sum += new >> 16;
    sum += new & 0xFFFF;
    !csum_fold_32_to_16(sum)
}

/// Adds `data` as big-endian 16-bit words to the unfolded sum `sum`.
/// An odd trailing byte is padded with zero.
pub fn csum_partial(data: &[u8], sum: u32) -> u32 {
    let mut sum = sum as u64;
    let mut chunks = data.chunks_exact(2);
    for word in chunks.by_ref() {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    while sum >> 32 != 0 {
        sum = (sum & 0xFFFF_FFFF) + (sum >> 32);
    }
    sum as u32
}

/// Checksum of an IPv4 header whose check field is treated as zero.
pub fn ipv4_header_checksum(hdr: &[u8], check_off: usize) -> u16 {
    let sum = csum_partial(&hdr[..check_off], 0);
    let sum = csum_partial(&hdr[check_off + 2..], sum);
    !csum_fold_32_to_16(sum)
}

/// TCP/UDP checksum over the IPv4 pseudo header and `segment`, whose
/// check field at `check_off` is treated as zero.
pub fn l4_checksum_ipv4(src: u32, dst: u32, proto: u8, segment: &[u8], check_off: usize) -> u16 {
    let mut sum = (src >> 16) + (src & 0xFFFF) + (dst >> 16) + (dst & 0xFFFF);
    sum += proto as u32;
    sum += segment.len() as u32;
    let sum = csum_partial(&segment[..check_off], sum);
    let sum = csum_partial(&segment[check_off + 2..], sum);
    !csum_fold_32_to_16(sum)
}

/// How a rewritten packet gets its checksums fixed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Patch the existing values from the rewritten words only
    #[default]
    Incremental,
    /// Recompute both checksums over the whole packet
    Full,
}

impl std::str::FromStr for ChecksumMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incremental" => Ok(Self::Incremental),
            "full" => Ok(Self::Full),
            _ => Err(format!("unknown checksum mode '{}'", s)),
        }
    }
}

fn l4_segment_end(buf: &[u8], hdrs: &Headers) -> usize {
    // Ethernet padding is not part of the segment
    let ip_end = hdrs.l3_offset + hdrs.total_len as usize;
    if ip_end >= hdrs.l4_offset && ip_end <= buf.len() {
        ip_end
    } else {
        buf.len()
    }
}

/// Rewrites the IPv4 address at `field_offset` from `old` to `new` and
/// incrementally fixes the IP header and TCP/UDP checksums. Nothing is
/// written unless every touched field is inside `buf`.
pub fn apply_address_rewrite(
    buf: &mut [u8],
    hdrs: &Headers,
    field_offset: usize,
    old: u32,
    new: u32,
) -> Result<(), HeaderError> {
    headers::check_writable(buf, field_offset, 4)?;
    headers::check_writable(buf, hdrs.ip_check_off(), 2)?;
    headers::check_writable(buf, hdrs.l4_check_off(), 2)?;

    let ip_check = csum_update_u32(hdrs.ip_check, old, new);

    // NOTE: a zero UDP checksum means the sender didn't compute one
    let l4_check = match (hdrs.proto, hdrs.l4_check) {
        (L4Proto::Udp, 0) => None,
        (L4Proto::Udp, check) => match csum_update_u32(check, old, new) {
            0 => Some(0xFFFF),
            check => Some(check),
        },
        (L4Proto::Tcp, check) => Some(csum_update_u32(check, old, new)),
    };

    headers::write_u32(buf, field_offset, new)?;
    headers::write_u16(buf, hdrs.ip_check_off(), ip_check)?;
    if let Some(check) = l4_check {
        headers::write_u16(buf, hdrs.l4_check_off(), check)?;
    }

    Ok(())
}

/// Rewrites the IPv4 address at `field_offset` to `new` and recomputes
/// both checksums from scratch.
pub fn apply_address_rewrite_full(
    buf: &mut [u8],
    hdrs: &Headers,
    field_offset: usize,
    new: u32,
) -> Result<(), HeaderError> {
    headers::check_writable(buf, field_offset, 4)?;
    headers::check_writable(buf, hdrs.ip_check_off(), 2)?;
    headers::check_writable(buf, hdrs.l4_check_off(), 2)?;

    headers::write_u32(buf, field_offset, new)?;
    recompute_checksums(buf, hdrs)
}

/// Recomputes the IPv4 header and TCP/UDP checksums of a parsed packet.
/// A zero UDP checksum is kept as is.
pub fn recompute_checksums(buf: &mut [u8], hdrs: &Headers) -> Result<(), HeaderError> {
    headers::check_writable(buf, hdrs.l3_offset, hdrs.ip_header_len())?;
    let ip_check_off = hdrs.ip_check_off() - hdrs.l3_offset;
    let ip_check = ipv4_header_checksum(&buf[hdrs.l3_offset..hdrs.l4_offset], ip_check_off);
    headers::write_u16(buf, hdrs.ip_check_off(), ip_check)?;

    let l4_check = headers::read_u16(buf, hdrs.l4_check_off())?;
    if hdrs.proto == L4Proto::Udp && l4_check == 0 {
        return Ok(());
    }

    let src = headers::read_u32(buf, hdrs.src_addr_off())?;
    let dst = headers::read_u32(buf, hdrs.dst_addr_off())?;
    let end = l4_segment_end(buf, hdrs);
    let check = l4_checksum_ipv4(
        src,
        dst,
        hdrs.proto.ip_proto(),
        &buf[hdrs.l4_offset..end],
        hdrs.proto.check_off(),
    );
    let check = match (hdrs.proto, check) {
        (L4Proto::Udp, 0) => 0xFFFF,
        (_, check) => check,
    };
    headers::write_u16(buf, hdrs.l4_check_off(), check)
}

/// Verifies the IPv4 header and TCP/UDP checksums of a frame.
pub fn verify(buf: &[u8]) -> Result<bool, HeaderError> {
    let hdrs = headers::parse(buf)?;
    let ip_check_off = hdrs.ip_check_off() - hdrs.l3_offset;
    let ip_ok = ipv4_header_checksum(&buf[hdrs.l3_offset..hdrs.l4_offset], ip_check_off)
        == hdrs.ip_check;

    if hdrs.proto == L4Proto::Udp && hdrs.l4_check == 0 {
        return Ok(ip_ok);
    }

    let end = l4_segment_end(buf, &hdrs);
    let check = l4_checksum_ipv4(
        hdrs.src_addr,
        hdrs.dst_addr,
        hdrs.proto.ip_proto(),
        &buf[hdrs.l4_offset..end],
        hdrs.proto.check_off(),
    );
    let l4_ok = match (hdrs.proto, check) {
        (L4Proto::Udp, 0) => hdrs.l4_check == 0xFFFF,
        (_, check) => check == hdrs.l4_check,
    };

    Ok(ip_ok && l4_ok)
}
