use smoltcp::wire::{IpAddress, Ipv4Address, Ipv4Packet, TcpPacket, UdpPacket};
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::{Arc, Barrier},
    thread,
};
use zon_nat_common::{stats, FlowKey};
use zon_nat_dp::{
    checksum, headers, notify, BackendRegistry, FrameBuilder, L4Proto, MissNotifier, Proxy,
    ProxyConfig, Selector, Verdict,
};

const SUBNET: &str = "10.30.0.0/16";
const SERVICE: &str = "10.30.5.5";
const INSTANCES: [&str; 2] = ["10.30.5.10", "10.30.5.11"];
const CLIENT: &str = "192.168.1.2:4000";
const SERVICE_EP: &str = "10.30.5.5:8000";

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn ep(s: &str) -> SocketAddrV4 {
    s.parse().unwrap()
}

fn registry() -> Arc<BackendRegistry> {
    let registry = Arc::new(BackendRegistry::new());
    let instances: Vec<Ipv4Addr> = INSTANCES.iter().map(|s| ip(s)).collect();
    registry.publish(ip(SERVICE), &instances).unwrap();
    registry
}

fn proxy_with(selector: Selector, notifier: MissNotifier) -> Proxy {
    let _ = env_logger::builder().is_test(true).try_init();
    Proxy::new(
        ProxyConfig::new(SUBNET.parse().unwrap()),
        registry(),
        selector,
        notifier,
    )
}

fn proxy() -> Proxy {
    proxy_with(Selector::random(Some(42)), MissNotifier::disabled())
}

fn dst_of(frame: &[u8]) -> Ipv4Addr {
    Ipv4Addr::from(headers::parse(frame).unwrap().dst_addr)
}

fn src_of(frame: &[u8]) -> SocketAddrV4 {
    let hdrs = headers::parse(frame).unwrap();
    SocketAddrV4::new(Ipv4Addr::from(hdrs.src_addr), hdrs.src_port)
}

/// IPv4 and TCP/UDP checksums as validated by smoltcp.
fn checksums_valid(frame: &[u8]) -> bool {
    let hdrs = headers::parse(frame).unwrap();
    let ip = Ipv4Packet::new_checked(&frame[hdrs.l3_offset..]).unwrap();
    let src = IpAddress::Ipv4(Ipv4Address::from(Ipv4Addr::from(hdrs.src_addr)));
    let dst = IpAddress::Ipv4(Ipv4Address::from(Ipv4Addr::from(hdrs.dst_addr)));
    let l4_ok = match hdrs.proto {
        L4Proto::Tcp => TcpPacket::new_checked(ip.payload())
            .unwrap()
            .verify_checksum(&src, &dst),
        L4Proto::Udp => UdpPacket::new_checked(ip.payload())
            .unwrap()
            .verify_checksum(&src, &dst),
    };
    ip.verify_checksum() && l4_ok
}

#[test]
fn outgoing_rewrites_to_listed_instance_with_valid_checksums() {
    let p = proxy();
    for (i, tcp) in [(0_u16, true), (1, false), (2, true), (3, false)] {
        let client = SocketAddrV4::new(ip("192.168.1.2"), 5000 + i);
        let builder = if tcp {
            FrameBuilder::tcp(client, ep(SERVICE_EP))
        } else {
            FrameBuilder::udp(client, ep(SERVICE_EP))
        };
        let mut frame = builder.payload(b"request payload").build();

        assert_eq!(p.outgoing(&mut frame), Verdict::ForwardModified);
        let dst = dst_of(&frame);
        assert!(INSTANCES.iter().any(|s| ip(s) == dst), "{} not listed", dst);
        assert!(checksum::verify(&frame).unwrap());
        assert!(checksums_valid(&frame));
    }
}

#[test]
fn scenario_udp_round_trip() {
    let (notifier, mut rx) = notify::channel(16);
    let p = proxy_with(Selector::random(Some(42)), notifier);

    let mut request = FrameBuilder::udp(ep(CLIENT), ep(SERVICE_EP))
        .payload(b"ping")
        .build();
    assert_eq!(p.outgoing(&mut request), Verdict::ForwardModified);

    let instance = dst_of(&request);
    assert!(INSTANCES.iter().any(|s| ip(s) == instance));

    // The same seed makes the same decision
    let twin = proxy_with(Selector::random(Some(42)), MissNotifier::disabled());
    let mut twin_request = FrameBuilder::udp(ep(CLIENT), ep(SERVICE_EP))
        .payload(b"ping")
        .build();
    twin.outgoing(&mut twin_request);
    assert_eq!(dst_of(&twin_request), instance);

    let event = rx.try_recv().unwrap();
    assert_eq!(event.service, ip(SERVICE));

    let mut reply = FrameBuilder::udp(SocketAddrV4::new(instance, 8000), ep(CLIENT))
        .payload(b"pong")
        .build();
    assert_eq!(p.ingoing(&mut reply), Verdict::ForwardModified);
    assert_eq!(src_of(&reply), ep(SERVICE_EP));
    assert!(checksum::verify(&reply).unwrap());
    assert!(checksums_valid(&reply));

    let hdrs = headers::parse(&reply).unwrap();
    assert_eq!(hdrs.dst_port, 4000);
    assert_eq!(Ipv4Addr::from(hdrs.dst_addr), ip("192.168.1.2"));
}

#[test]
fn same_flow_keeps_its_instance() {
    let p = proxy_with(Selector::round_robin(), MissNotifier::disabled());

    let mut first = FrameBuilder::tcp(ep(CLIENT), ep(SERVICE_EP)).build();
    p.outgoing(&mut first);
    let chosen = dst_of(&first);

    for _ in 0..10 {
        let mut frame = FrameBuilder::tcp(ep(CLIENT), ep(SERVICE_EP)).build();
        assert_eq!(p.outgoing(&mut frame), Verdict::ForwardModified);
        assert_eq!(dst_of(&frame), chosen);
    }

    assert_eq!(p.stats().get(stats::SESSION_MISSES), 1);
    assert_eq!(p.stats().get(stats::SESSION_HITS), 10);

    // A new port pair moves on to the next instance
    let mut other = FrameBuilder::tcp(ep("192.168.1.2:4001"), ep(SERVICE_EP)).build();
    p.outgoing(&mut other);
    assert_ne!(dst_of(&other), chosen);
}

#[test]
fn every_packet_of_a_session_is_reported() {
    const PACKETS: usize = 10;
    let (notifier, mut rx) = notify::channel(PACKETS);
    let p = proxy_with(Selector::round_robin(), notifier);

    let mut first = FrameBuilder::tcp(ep(CLIENT), ep(SERVICE_EP)).build();
    assert_eq!(p.outgoing(&mut first), Verdict::ForwardModified);
    assert_eq!(rx.try_recv().unwrap().service, ip(SERVICE));

    for _ in 0..PACKETS {
        let mut frame = FrameBuilder::tcp(ep(CLIENT), ep(SERVICE_EP)).build();
        assert_eq!(p.outgoing(&mut frame), Verdict::ForwardModified);
        assert_eq!(dst_of(&frame), dst_of(&first));
    }
    assert_eq!(p.stats().get(stats::SESSION_HITS), PACKETS as u64);

    let mut events = 0;
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.service, ip(SERVICE));
        events += 1;
    }
    assert_eq!(events, PACKETS);
    assert_eq!(p.stats().get(stats::NOTIFY_LOST), 0);

    // A full channel loses events, never packets
    for _ in 0..PACKETS + 2 {
        let mut frame = FrameBuilder::tcp(ep(CLIENT), ep(SERVICE_EP)).build();
        assert_eq!(p.outgoing(&mut frame), Verdict::ForwardModified);
    }
    assert_eq!(p.stats().get(stats::NOTIFY_LOST), 2);
}

#[test]
fn racing_first_packets_share_one_instance() {
    const WORKERS: usize = 16;
    let p = Arc::new(proxy_with(Selector::round_robin(), MissNotifier::disabled()));
    let service = u32::from(ip(SERVICE));

    for round in 0..64_u16 {
        let client = SocketAddrV4::new(ip("192.168.1.2"), 4000 + round);
        let start = Arc::new(Barrier::new(WORKERS));
        let workers: Vec<_> = (0..WORKERS)
            .map(|_| {
                let p = p.clone();
                let start = start.clone();
                thread::spawn(move || {
                    let mut frame = FrameBuilder::udp(client, ep(SERVICE_EP)).build();
                    start.wait();
                    assert_eq!(p.outgoing(&mut frame), Verdict::ForwardModified);
                    dst_of(&frame)
                })
            })
            .collect();

        let picks: Vec<Ipv4Addr> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert!(
            picks.iter().all(|&dst| dst == picks[0]),
            "flow {} split over {:?}",
            client,
            picks
        );

        let key = FlowKey::new(client.port(), 8000);
        let ring = p.sessions().ring(&key).unwrap();
        assert_eq!(ring.len(), 1, "flow {} has duplicate conversions", client);
        assert_eq!(
            p.sessions().lookup_by_service(&key, service),
            Some(u32::from(picks[0]))
        );
    }
}

#[test]
fn fifth_service_on_same_ports_evicts_the_first() {
    let registry = Arc::new(BackendRegistry::new());
    for i in 1..=5 {
        registry
            .publish(Ipv4Addr::new(10, 30, 1, i), &[Ipv4Addr::new(10, 30, 2, i)])
            .unwrap();
    }
    let p = Proxy::new(
        ProxyConfig::new(SUBNET.parse().unwrap()),
        registry,
        Selector::random(Some(1)),
        MissNotifier::disabled(),
    );

    for i in 1..=5 {
        let mut frame = FrameBuilder::udp(
            ep(CLIENT),
            SocketAddrV4::new(Ipv4Addr::new(10, 30, 1, i), 8000),
        )
        .build();
        assert_eq!(p.outgoing(&mut frame), Verdict::ForwardModified);
        assert_eq!(dst_of(&frame), Ipv4Addr::new(10, 30, 2, i));
    }

    let reply_from = |i: u8| {
        FrameBuilder::udp(SocketAddrV4::new(Ipv4Addr::new(10, 30, 2, i), 8000), ep(CLIENT)).build()
    };

    let mut evicted = reply_from(1);
    let before = evicted.clone();
    assert_eq!(p.ingoing(&mut evicted), Verdict::ForwardUnmodified);
    assert_eq!(evicted, before);

    for i in 2..=5 {
        let mut reply = reply_from(i);
        assert_eq!(p.ingoing(&mut reply), Verdict::ForwardModified);
        assert_eq!(*src_of(&reply).ip(), Ipv4Addr::new(10, 30, 1, i));
    }
}

#[test]
fn truncated_transport_header_is_forwarded() {
    let (notifier, mut rx) = notify::channel(4);
    let p = proxy_with(Selector::random(None), notifier);

    let frame = FrameBuilder::udp(ep(CLIENT), ep(SERVICE_EP)).build();
    let mut short = frame[..40].to_vec();
    let before = short.clone();

    assert_eq!(p.outgoing(&mut short), Verdict::ForwardUnmodified);
    assert_eq!(p.ingoing(&mut short), Verdict::ForwardUnmodified);
    assert_eq!(short, before);
    assert_eq!(p.stats().get(stats::PARSE_ERRORS), 2);
    assert!(rx.try_recv().is_err());
}

#[test]
fn unknown_service_is_dropped_and_reported() {
    let (notifier, mut rx) = notify::channel(4);
    let p = proxy_with(Selector::random(None), notifier);

    let mut frame = FrameBuilder::tcp(ep(CLIENT), ep("10.30.9.9:443")).build();
    let before = frame.clone();
    assert_eq!(p.outgoing(&mut frame), Verdict::Drop);
    assert_eq!(frame, before);
    assert_eq!(rx.try_recv().unwrap().service, ip("10.30.9.9"));
    assert_eq!(p.stats().get(stats::REGISTRY_MISSES), 1);

    // Once published the retransmission goes through
    p.registry()
        .publish(ip("10.30.9.9"), &[ip("10.30.9.10")])
        .unwrap();
    assert_eq!(p.outgoing(&mut frame), Verdict::ForwardModified);
    assert_eq!(dst_of(&frame), ip("10.30.9.10"));
}

#[test]
fn empty_instance_list_is_dropped() {
    let p = proxy();
    p.registry().publish(ip("10.30.8.8"), &[]).unwrap();
    let mut frame = FrameBuilder::udp(ep(CLIENT), ep("10.30.8.8:53")).build();
    assert_eq!(p.outgoing(&mut frame), Verdict::Drop);
}

#[test]
fn untracked_reply_is_forwarded() {
    let p = proxy();
    let mut reply = FrameBuilder::tcp(ep("10.30.5.10:8000"), ep(CLIENT)).build();
    assert_eq!(p.ingoing(&mut reply), Verdict::ForwardUnmodified);
    assert_eq!(p.stats().get(stats::INGOING_UNTRACKED), 1);
}

#[test]
fn non_ipv4_and_other_protocols_are_forwarded() {
    let p = proxy();
    let mut frame = FrameBuilder::udp(ep(CLIENT), ep(SERVICE_EP)).build();
    frame[12..14].copy_from_slice(&0x0806_u16.to_be_bytes());
    assert_eq!(p.outgoing(&mut frame), Verdict::ForwardUnmodified);

    let mut frame = FrameBuilder::udp(ep(CLIENT), ep(SERVICE_EP)).build();
    frame[14 + 9] = 1;
    assert_eq!(p.outgoing(&mut frame), Verdict::ForwardUnmodified);
    assert_eq!(p.stats().get(stats::UNSUPPORTED), 2);
}

#[test]
fn vlan_and_ip_options_round_trip() {
    let p = proxy();
    let mut request = FrameBuilder::tcp(ep(CLIENT), ep(SERVICE_EP))
        .vlan(100)
        .ip_options(&[0x94, 0x04, 0x00, 0x00])
        .build();
    assert_eq!(p.outgoing(&mut request), Verdict::ForwardModified);
    assert!(checksum::verify(&request).unwrap());
    assert!(checksums_valid(&request));

    let instance = dst_of(&request);
    let mut reply = FrameBuilder::tcp(SocketAddrV4::new(instance, 8000), ep(CLIENT))
        .vlan(100)
        .build();
    assert_eq!(p.ingoing(&mut reply), Verdict::ForwardModified);
    assert_eq!(src_of(&reply), ep(SERVICE_EP));
    assert!(checksums_valid(&reply));
}

#[test]
fn concurrent_flows_stay_stable() {
    let p = Arc::new(proxy());
    let workers: Vec<_> = (0..8_u16)
        .map(|w| {
            let p = p.clone();
            thread::spawn(move || {
                let client = SocketAddrV4::new(ip("192.168.1.2"), 10_000 + w);
                let mut chosen = None;
                for _ in 0..200 {
                    let mut frame = FrameBuilder::udp(client, ep(SERVICE_EP)).build();
                    assert_eq!(p.outgoing(&mut frame), Verdict::ForwardModified);
                    let dst = dst_of(&frame);
                    assert_eq!(*chosen.get_or_insert(dst), dst);

                    let mut reply =
                        FrameBuilder::udp(SocketAddrV4::new(dst, 8000), client).build();
                    assert_eq!(p.ingoing(&mut reply), Verdict::ForwardModified);
                    assert_eq!(src_of(&reply), ep(SERVICE_EP));
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(p.sessions().len(), 8);
    assert_eq!(p.stats().get(stats::FORWARD_MODIFIED), 8 * 200 * 2);
}
