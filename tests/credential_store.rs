//! Host-level tests for credential persistence and the setup form.

use heapless::String;
use wifi_onboard::credential_store::{BlockStorage, CredentialStore, KeyedBlobStore, RamBlock};
use wifi_onboard::credentials::{AlarmProfile, CredentialForm, Credentials};
use wifi_onboard::Error;

fn text<const N: usize>(value: &str) -> String<N> {
    let mut text = String::new();
    text.push_str(value).unwrap();
    text
}

fn home_network() -> Credentials {
    let mut credentials = Credentials {
        ssid: text("HomeNet"),
        password: text("correct horse"),
        timezone: text("CET-1CEST,M3.5.0,M10.5.0/3"),
        ..Credentials::default()
    };
    credentials.alarms[2].hour = 6;
    credentials.alarms[2].minute = 45;
    credentials
}

#[test]
fn blank_block_loads_nothing() {
    let mut store = KeyedBlobStore::new(RamBlock::new());
    assert_eq!(store.load().unwrap(), None);
}

#[test]
fn saved_credentials_load_back() {
    let mut block = RamBlock::new();
    let credentials = home_network();
    {
        let mut store = KeyedBlobStore::new(&mut block);
        store.save(&credentials).unwrap();
    }
    assert_eq!(block.writes(), 1);

    let mut reopened = KeyedBlobStore::new(block);
    assert_eq!(reopened.load().unwrap(), Some(credentials));
}

#[test]
fn save_replaces_previous_record() {
    let mut store = KeyedBlobStore::new(RamBlock::new());
    store.save(&home_network()).unwrap();
    let mut changed = home_network();
    changed.ssid = text("Office");
    store.save(&changed).unwrap();
    assert_eq!(store.load().unwrap(), Some(changed));
    assert_eq!(store.into_inner().writes(), 2);
}

#[test]
fn other_namespace_reads_as_empty() {
    let mut block = RamBlock::new();
    KeyedBlobStore::new(&mut block).save(&home_network()).unwrap();

    let mut other = KeyedBlobStore::with_key(&mut block, "storage", "alarms");
    assert_eq!(other.load().unwrap(), None);
    let mut other_namespace = KeyedBlobStore::with_key(&mut block, "settings", "data");
    assert_eq!(other_namespace.load().unwrap(), None);
}

#[test]
fn corrupted_payload_is_reported() {
    let mut block = RamBlock::new();
    KeyedBlobStore::new(&mut block).save(&home_network()).unwrap();
    block.bytes_mut()[12] ^= 0x01;

    let result = KeyedBlobStore::new(&mut block).load();
    assert!(matches!(result, Err(Error::StorageCorrupted)));
}

#[test]
fn impossible_length_is_reported() {
    let mut block = RamBlock::new();
    KeyedBlobStore::new(&mut block).save(&home_network()).unwrap();
    block.bytes_mut()[8..10].copy_from_slice(&u16::MAX.to_le_bytes());

    let result = KeyedBlobStore::new(&mut block).load();
    assert!(matches!(result, Err(Error::StorageCorrupted)));
}

struct FailingBlock;

impl BlockStorage for FailingBlock {
    fn read_block(&mut self, _block: &mut [u8; 4096]) -> wifi_onboard::Result<()> {
        Err(Error::Storage)
    }

    fn write_block(&mut self, _block: &[u8; 4096]) -> wifi_onboard::Result<()> {
        Err(Error::Storage)
    }
}

#[test]
fn backend_errors_propagate() {
    let mut store = KeyedBlobStore::new(FailingBlock);
    assert!(matches!(store.load(), Err(Error::Storage)));
    assert!(matches!(store.save(&home_network()), Err(Error::Storage)));
}

#[test]
fn provisioned_means_network_name_present() {
    assert!(!Credentials::default().is_provisioned());
    assert!(home_network().is_provisioned());
}

#[test]
fn alarm_defaults() {
    let alarm = AlarmProfile::default();
    assert_eq!((alarm.hour, alarm.minute), (7, 0));
    assert_eq!(alarm.repeat, 0xFF);
    assert_eq!(alarm.sleep_aid_colour, 0xB4);
}

#[test]
fn form_replaces_submitted_fields_and_keeps_alarms() {
    let current = home_network();
    let mut form = CredentialForm::prefilled(&current);
    form.parse(b"ssid=New+Net&password=p%40ss");
    let updated = form.apply(&current);

    assert_eq!(updated.ssid.as_str(), "New Net");
    assert_eq!(updated.password.as_str(), "p@ss");
    assert_eq!(updated.timezone, current.timezone, "absent key keeps old value");
    assert_eq!(updated.alarms, current.alarms);
}

#[test]
fn form_truncates_to_field_limits() {
    let long_ssid = "s".repeat(40);
    let body = format!("ssid={long_ssid}&timezone=UTC");
    let mut form = CredentialForm::prefilled(&Credentials::default());
    form.parse(body.as_bytes());
    let updated = form.apply(&Credentials::default());

    assert_eq!(updated.ssid.len(), 32);
    assert_eq!(updated.timezone.as_str(), "UTC");
}

#[test]
fn form_drops_invalid_utf8_tail() {
    let mut form = CredentialForm::prefilled(&Credentials::default());
    form.parse(b"ssid=caf%C3%A9%FF");
    let updated = form.apply(&Credentials::default());
    assert_eq!(updated.ssid.as_str(), "caf\u{e9}");
}
