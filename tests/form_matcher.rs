//! Host-level tests for the urlencoded form matcher.

use wifi_onboard::form_matcher::{FieldDescriptor, parse, terminated};

#[test]
fn decodes_onboarding_form() {
    let mut ssid = [0xAAu8; 33];
    let mut password = [0xAAu8; 64];
    let mut timezone = [0xAAu8; 64];
    {
        let mut fields = [
            FieldDescriptor::new("ssid", &mut ssid),
            FieldDescriptor::new("password", &mut password),
            FieldDescriptor::new("timezone", &mut timezone),
        ];
        parse(b"ssid=MyNet&password=abc%2B1&timezone=UTC", &mut fields);
        assert_eq!(fields[0].value(), b"MyNet");
        assert_eq!(fields[1].value(), b"abc+1");
        assert_eq!(fields[2].value(), b"UTC");
    }
    assert_eq!(&ssid[..6], b"MyNet\0");
    assert_eq!(&password[..6], b"abc+1\0");
    assert_eq!(&timezone[..4], b"UTC\0");
}

#[test]
fn truncates_long_value_without_overrun() {
    let mut storage = [0xAAu8; 8];
    {
        let mut fields = [FieldDescriptor::new("ssid", &mut storage[..4])];
        parse(b"ssid=abcdefgh", &mut fields);
        assert_eq!(fields[0].value(), b"abc");
    }
    assert_eq!(&storage[..4], b"abc\0");
    assert_eq!(&storage[4..], &[0xAA; 4]);
}

#[test]
fn truncation_keeps_later_fields() {
    let mut ssid = [0u8; 4];
    let mut timezone = [0u8; 16];
    let mut fields = [
        FieldDescriptor::new("ssid", &mut ssid),
        FieldDescriptor::new("timezone", &mut timezone),
    ];
    parse(b"ssid=far-too-long&timezone=CET-1", &mut fields);
    assert_eq!(fields[0].value(), b"far");
    assert_eq!(fields[1].value(), b"CET-1");
}

#[test]
fn ignores_unknown_keys() {
    let mut ssid = [0x55u8; 16];
    let mut password = [0x55u8; 16];
    let mut fields = [
        FieldDescriptor::new("ssid", &mut ssid),
        FieldDescriptor::new("password", &mut password),
    ];
    parse(b"foo=bar&ssid=home&pass=nope&ssidx=1&password=secret", &mut fields);
    assert_eq!(fields[0].value(), b"home");
    assert_eq!(fields[1].value(), b"secret");
}

#[test]
fn absent_key_leaves_buffer_untouched() {
    let mut ssid = *b"kept\0\0\0\0";
    let mut password = [0u8; 8];
    let mut fields = [
        FieldDescriptor::new("ssid", &mut ssid),
        FieldDescriptor::new("password", &mut password),
    ];
    parse(b"password=x", &mut fields);
    assert_eq!(fields[0].value(), b"kept");
    assert_eq!(fields[1].value(), b"x");
}

#[test]
fn plus_and_escapes_decode() {
    let mut ssid = [0u8; 32];
    let mut fields = [FieldDescriptor::new("ssid", &mut ssid)];
    parse(b"ssid=My+Home%20Net%26Co%3d", &mut fields);
    assert_eq!(fields[0].value(), b"My Home Net&Co=");
}

#[test]
fn malformed_escape_is_literal() {
    let mut ssid = [0u8; 32];
    let mut password = [0u8; 32];
    let mut fields = [
        FieldDescriptor::new("ssid", &mut ssid),
        FieldDescriptor::new("password", &mut password),
    ];
    parse(b"ssid=100%&password=%zz%4", &mut fields);
    assert_eq!(fields[0].value(), b"100%");
    assert_eq!(fields[1].value(), b"%zz%4");
}

#[test]
fn escaped_key_bytes_match() {
    let mut ssid = [0u8; 8];
    let mut fields = [FieldDescriptor::new("ssid", &mut ssid)];
    parse(b"ss%69d=ok", &mut fields);
    assert_eq!(fields[0].value(), b"ok");
}

#[test]
fn last_occurrence_wins_and_empty_value_clears() {
    let mut ssid = [0u8; 8];
    let mut timezone = [0u8; 8];
    let mut fields = [
        FieldDescriptor::new("ssid", &mut ssid),
        FieldDescriptor::new("timezone", &mut timezone),
    ];
    parse(b"ssid=first&ssid=second&timezone=UTC&timezone=", &mut fields);
    assert_eq!(fields[0].value(), b"second");
    assert_eq!(fields[1].value(), b"");
}

#[test]
fn prefix_names_resolve_to_exact_key() {
    let mut short = [0u8; 8];
    let mut long = [0u8; 8];
    let mut fields = [
        FieldDescriptor::new("tz", &mut short),
        FieldDescriptor::new("tzdata", &mut long),
    ];
    parse(b"tzdata=b&tz=a", &mut fields);
    assert_eq!(fields[0].value(), b"a");
    assert_eq!(fields[1].value(), b"b");
}

#[test]
fn empty_body_and_stray_separators() {
    let mut ssid = [0u8; 8];
    let mut fields = [FieldDescriptor::new("ssid", &mut ssid)];
    parse(b"", &mut fields);
    assert_eq!(fields[0].value(), b"");
    parse(b"&&=x&ssid&ssid=y&", &mut fields);
    assert_eq!(fields[0].value(), b"y");
    assert_eq!(fields[0].capacity(), 8);
    assert_eq!(fields[0].name(), b"ssid");
}

#[test]
fn terminated_stops_at_first_nul() {
    assert_eq!(terminated(b"abc\0def"), b"abc");
    assert_eq!(terminated(b"abc"), b"abc");
    assert_eq!(terminated(b"\0"), b"");
}
