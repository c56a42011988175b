//! Host-level tests for NTP packet handling.

use wifi_onboard::Error;
use wifi_onboard::time_sync::{NTP_PACKET_LEN, ntp_request, parse_ntp_response};
use wifi_onboard::unix_seconds::UnixSeconds;

const NTP_TO_UNIX: u32 = 2_208_988_800;

fn response_with_transmit(seconds: u32) -> [u8; NTP_PACKET_LEN] {
    let mut response = [0u8; NTP_PACKET_LEN];
    response[0] = 0x1C; // LI=0, VN=3, Mode=4 (server)
    response[40..44].copy_from_slice(&seconds.to_be_bytes());
    response
}

#[test]
fn request_is_version3_client() {
    let request = ntp_request();
    assert_eq!(request[0], 0x1B);
    assert!(request[1..].iter().all(|&byte| byte == 0));
}

#[test]
fn parses_transmit_timestamp() {
    let response = response_with_transmit(NTP_TO_UNIX + 1_700_000_000);
    assert_eq!(parse_ntp_response(&response).unwrap(), UnixSeconds(1_700_000_000));
}

#[test]
fn accepts_trailing_extension_bytes() {
    let mut long = response_with_transmit(NTP_TO_UNIX + 5).to_vec();
    long.extend_from_slice(&[0xEE; 20]);
    assert_eq!(parse_ntp_response(&long).unwrap().as_i64(), 5);
}

#[test]
fn rejects_short_response() {
    let response = response_with_transmit(NTP_TO_UNIX + 1);
    assert!(matches!(
        parse_ntp_response(&response[..47]),
        Err(Error::TimeSync(_))
    ));
}

#[test]
fn rejects_pre_1970_timestamp() {
    let response = response_with_transmit(1_000);
    assert!(matches!(parse_ntp_response(&response), Err(Error::TimeSync(_))));
}

#[test]
fn ntp_epoch_conversion() {
    assert_eq!(UnixSeconds::from_ntp_seconds(NTP_TO_UNIX), Some(UnixSeconds(0)));
    assert_eq!(UnixSeconds::from_ntp_seconds(NTP_TO_UNIX - 1), None);
    assert_eq!(
        UnixSeconds::from_ntp_seconds(u32::MAX),
        Some(UnixSeconds(i64::from(u32::MAX) - i64::from(NTP_TO_UNIX)))
    );
}
