//! Host-level tests for the captive-portal DHCP server.

use std::net::Ipv4Addr;

use embassy_time::{Duration, Instant};
use wifi_onboard::dhcp::{DHCP_FRAME_LEN, DhcpServer};

const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);
const URL: &str = "http://192.168.4.1";

const DISCOVER: u8 = 1;
const REQUEST: u8 = 3;
const RELEASE: u8 = 7;

fn frame(kind: u8, mac: [u8; 6], extra: &[(u8, &[u8])]) -> Vec<u8> {
    let mut frame = vec![0u8; 240];
    frame[0] = 1;
    frame[1] = 1;
    frame[2] = 6;
    frame[4..8].copy_from_slice(&0x1234_5678u32.to_be_bytes());
    frame[10..12].copy_from_slice(&0x8000u16.to_be_bytes());
    frame[28..34].copy_from_slice(&mac);
    frame[236..240].copy_from_slice(&[99, 130, 83, 99]);
    frame.extend_from_slice(&[53, 1, kind]);
    for (code, payload) in extra {
        frame.push(*code);
        frame.push(u8::try_from(payload.len()).unwrap());
        frame.extend_from_slice(payload);
    }
    frame.push(255);
    frame
}

fn mac(last: u8) -> [u8; 6] {
    [0x02, 0, 0, 0, 0, last]
}

fn handle(server: &mut DhcpServer, request: &[u8], now: Instant) -> Option<Vec<u8>> {
    let mut reply = [0u8; DHCP_FRAME_LEN];
    server
        .handle(request, &mut reply, now)
        .map(|len| reply[..len].to_vec())
}

fn option(reply: &[u8], code: u8) -> Option<&[u8]> {
    let mut at = 240;
    while at < reply.len() {
        match reply[at] {
            0 => at += 1,
            255 => return None,
            found => {
                let len = usize::from(reply[at + 1]);
                let payload = &reply[at + 2..at + 2 + len];
                if found == code {
                    return Some(payload);
                }
                at += 2 + len;
            }
        }
    }
    None
}

fn offered(reply: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(reply[16], reply[17], reply[18], reply[19])
}

#[test]
fn discover_gets_offer_with_portal_options() {
    let mut server = DhcpServer::new(SERVER, URL);
    let reply = handle(&mut server, &frame(DISCOVER, mac(1), &[]), Instant::from_secs(0)).unwrap();

    assert_eq!(reply[0], 2);
    assert_eq!(&reply[4..8], &0x1234_5678u32.to_be_bytes());
    assert_eq!(&reply[28..34], &mac(1));
    assert_eq!(offered(&reply), Ipv4Addr::new(192, 168, 4, 2));
    assert_eq!(&reply[20..24], &SERVER.octets()[..]);
    assert!(reply.len() >= 300);

    assert_eq!(option(&reply, 53), Some(&[2][..]));
    assert_eq!(option(&reply, 54), Some(&SERVER.octets()[..]));
    assert_eq!(option(&reply, 1), Some(&[255, 255, 255, 0][..]));
    assert_eq!(option(&reply, 3), Some(&SERVER.octets()[..]));
    assert_eq!(option(&reply, 6), Some(&SERVER.octets()[..]));
    assert_eq!(option(&reply, 28), Some(&[192, 168, 4, 255][..]));
    assert_eq!(option(&reply, 51), Some(&30u32.to_be_bytes()[..]));
    assert_eq!(option(&reply, 114), Some(URL.as_bytes()));
}

#[test]
fn request_is_acknowledged_with_same_address() {
    let mut server = DhcpServer::new(SERVER, URL);
    let now = Instant::from_secs(0);
    let offer = handle(&mut server, &frame(DISCOVER, mac(1), &[]), now).unwrap();
    let address = offered(&offer);

    let ack = handle(
        &mut server,
        &frame(REQUEST, mac(1), &[(50, &address.octets()[..]), (54, &SERVER.octets()[..])]),
        now,
    )
    .unwrap();
    assert_eq!(option(&ack, 53), Some(&[5][..]));
    assert_eq!(offered(&ack), address);
    assert_eq!(server.lease_for(mac(1)), Some(address));
}

#[test]
fn clients_get_distinct_addresses() {
    let mut server = DhcpServer::new(SERVER, URL);
    let now = Instant::from_secs(0);
    let first = offered(&handle(&mut server, &frame(DISCOVER, mac(1), &[]), now).unwrap());
    let second = offered(&handle(&mut server, &frame(DISCOVER, mac(2), &[]), now).unwrap());
    assert_ne!(first, second);
    assert_eq!(second, Ipv4Addr::new(192, 168, 4, 3));
}

#[test]
fn honors_requested_address_inside_pool_only() {
    let mut server = DhcpServer::new(SERVER, URL);
    let now = Instant::from_secs(0);
    let wanted = Ipv4Addr::new(192, 168, 4, 4);
    let reply = handle(&mut server, &frame(DISCOVER, mac(1), &[(50, &wanted.octets()[..])]), now);
    assert_eq!(offered(&reply.unwrap()), wanted);

    let outside = Ipv4Addr::new(10, 0, 0, 7);
    let reply = handle(&mut server, &frame(DISCOVER, mac(2), &[(50, &outside.octets()[..])]), now);
    assert_eq!(offered(&reply.unwrap()), Ipv4Addr::new(192, 168, 4, 2));
}

#[test]
fn request_for_other_server_releases_lease() {
    let mut server = DhcpServer::new(SERVER, URL);
    let now = Instant::from_secs(0);
    handle(&mut server, &frame(DISCOVER, mac(1), &[]), now).unwrap();
    assert!(server.lease_for(mac(1)).is_some());

    let elsewhere = Ipv4Addr::new(192, 168, 1, 1);
    let reply = handle(&mut server, &frame(REQUEST, mac(1), &[(54, &elsewhere.octets()[..])]), now);
    assert!(reply.is_none());
    assert!(server.lease_for(mac(1)).is_none());
}

#[test]
fn release_frees_address() {
    let mut server = DhcpServer::new(SERVER, URL);
    let now = Instant::from_secs(0);
    handle(&mut server, &frame(DISCOVER, mac(1), &[]), now).unwrap();
    assert!(handle(&mut server, &frame(RELEASE, mac(1), &[]), now).is_none());
    assert!(server.lease_for(mac(1)).is_none());
}

#[test]
fn exhausted_pool_is_silent_until_leases_expire() {
    let mut server = DhcpServer::new(SERVER, URL);
    let start = Instant::from_secs(0);
    for client in 1..=4 {
        assert!(handle(&mut server, &frame(DISCOVER, mac(client), &[]), start).is_some());
    }
    assert!(handle(&mut server, &frame(DISCOVER, mac(9), &[]), start).is_none());

    let later = start + Duration::from_secs(31);
    let reply = handle(&mut server, &frame(DISCOVER, mac(9), &[]), later).unwrap();
    assert_eq!(offered(&reply), Ipv4Addr::new(192, 168, 4, 2));
}

#[test]
fn ignores_malformed_frames() {
    let mut server = DhcpServer::new(SERVER, URL);
    let now = Instant::from_secs(0);
    let good = frame(DISCOVER, mac(1), &[]);

    assert!(handle(&mut server, &good[..200], now).is_none());

    let mut reply_frame = good.clone();
    reply_frame[0] = 2;
    assert!(handle(&mut server, &reply_frame, now).is_none());

    let mut bad_cookie = good.clone();
    bad_cookie[236] = 0;
    assert!(handle(&mut server, &bad_cookie, now).is_none());

    let mut no_type = good;
    no_type[240] = 255;
    assert!(handle(&mut server, &no_type, now).is_none());
}

#[test]
fn broadcasts_on_subnet() {
    let server = DhcpServer::new(SERVER, URL);
    assert_eq!(server.broadcast_ip(), Ipv4Addr::new(192, 168, 4, 255));
}

#[test]
fn request_for_foreign_address_is_refused() {
    let mut server = DhcpServer::new(SERVER, URL);
    let now = Instant::from_secs(0);
    let remembered = Ipv4Addr::new(10, 0, 0, 7);

    let nak = handle(
        &mut server,
        &frame(REQUEST, mac(1), &[(50, &remembered.octets()[..])]),
        now,
    )
    .unwrap();
    assert_eq!(option(&nak, 53), Some(&[6][..]));
    assert_eq!(option(&nak, 54), Some(&SERVER.octets()[..]));
    assert_eq!(option(&nak, 51), None);
    assert_eq!(option(&nak, 114), None);
    assert_eq!(offered(&nak), Ipv4Addr::UNSPECIFIED);
    assert_eq!(&nak[28..34], &mac(1));
    assert!(server.lease_for(mac(1)).is_none());
}

#[test]
fn request_for_address_held_by_other_client_is_refused() {
    let mut server = DhcpServer::new(SERVER, URL);
    let now = Instant::from_secs(0);
    let taken = offered(&handle(&mut server, &frame(DISCOVER, mac(1), &[]), now).unwrap());

    let nak = handle(
        &mut server,
        &frame(REQUEST, mac(2), &[(50, &taken.octets()[..])]),
        now,
    )
    .unwrap();
    assert_eq!(option(&nak, 53), Some(&[6][..]));
    assert_eq!(server.lease_for(mac(1)), Some(taken));
    assert!(server.lease_for(mac(2)).is_none());

    // Once the first lease lapses the address can be granted.
    let later = now + Duration::from_secs(31);
    let ack = handle(
        &mut server,
        &frame(REQUEST, mac(2), &[(50, &taken.octets()[..])]),
        later,
    )
    .unwrap();
    assert_eq!(option(&ack, 53), Some(&[5][..]));
    assert_eq!(offered(&ack), taken);
}
