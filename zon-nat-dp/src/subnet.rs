use ipnet::Ipv4Net;

pub fn in_subnet(addr: u32, subnet: u32, mask: u32) -> bool {
    (addr & mask) == (subnet & mask)
}

pub fn in_subnet_v6(addr: &[u8; 16], subnet: &[u8; 16], mask: &[u8; 16]) -> bool {
    addr.iter()
        .zip(subnet.iter())
        .zip(mask.iter())
        .all(|((a, s), m)| (a & m) == (s & m))
}

/// Membership test of a host order address, as read from the headers.
pub fn contains(net: &Ipv4Net, addr: u32) -> bool {
    in_subnet(addr, u32::from(net.network()), u32::from(net.netmask()))
}
