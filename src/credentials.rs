//! The persisted onboarding record: network credentials, timezone and alarm profiles.

use heapless::String;
use serde::{Deserialize, Serialize};

use crate::form_matcher::{self, FieldDescriptor};

/// Longest network name accepted (802.11 limit).
pub const SSID_MAX_LEN: usize = 32;
/// Longest passphrase accepted (WPA2 limit).
pub const PASSWORD_MAX_LEN: usize = 63;
/// Longest timezone identifier accepted, e.g. `CET-1CEST,M3.5.0,M10.5.0/3`.
pub const TIMEZONE_MAX_LEN: usize = 63;
/// Number of alarm profiles stored alongside the credentials.
pub const ALARM_COUNT: usize = 5;

const SSID_CAPACITY: usize = SSID_MAX_LEN + 1;
const PASSWORD_CAPACITY: usize = PASSWORD_MAX_LEN + 1;
const TIMEZONE_CAPACITY: usize = TIMEZONE_MAX_LEN + 1;

/// Everything the appliance keeps across reboots.
///
/// Created empty at first boot and replaced only by a form submission in access-point mode.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// Network name (SSID).
    pub ssid: String<SSID_MAX_LEN>,
    /// Network passphrase; empty for open networks.
    pub password: String<PASSWORD_MAX_LEN>,
    /// POSIX `TZ` string used to render local time.
    pub timezone: String<TIMEZONE_MAX_LEN>,
    /// Alarm settings; carried through onboarding untouched.
    pub alarms: [AlarmProfile; ALARM_COUNT],
}

impl Credentials {
    /// `true` once a network name has been provided.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        !self.ssid.is_empty()
    }
}

/// One alarm slot. Times are minutes unless noted; colours are 2-bit-per-channel RGB.
#[expect(missing_docs, reason = "The fields are self-explanatory.")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmProfile {
    pub hour: u8,
    pub minute: u8,
    /// Bit per weekday; all set means every day.
    pub repeat: u8,
    pub volume: u8,
    pub sunrise_time: u8,
    pub sunrise_brightness: u8,
    pub ring_time: u8,
    /// Multiples of 5 minutes.
    pub sleep_time: u8,
    pub sleep_aid_time: u8,
    pub sleep_aid_brightness: u8,
    /// Multiples of 5 seconds.
    pub sleep_aid_fade: u8,
    pub sleep_aid_colour: u8,
    pub pre_sleep_aid_time: u8,
    pub pre_sleep_aid_brightness: u8,
    /// Multiples of 5 seconds.
    pub pre_sleep_aid_fade: u8,
    pub pre_sleep_aid_colour: u8,
}

impl Default for AlarmProfile {
    fn default() -> Self {
        Self {
            hour: 7,
            minute: 0,
            repeat: 0xFF,
            volume: 96,
            sunrise_time: 5,
            sunrise_brightness: 255,
            ring_time: 30,
            sleep_time: 41, // 8h05
            sleep_aid_time: 15,
            sleep_aid_brightness: 64,
            sleep_aid_fade: 24,
            sleep_aid_colour: 0xB4, // red
            pre_sleep_aid_time: 120,
            pre_sleep_aid_brightness: 255,
            pre_sleep_aid_fade: 60,
            pre_sleep_aid_colour: 0x05, // blue
        }
    }
}

/// The three form fields of the configuration page, as NUL-terminated byte buffers.
///
/// Start from [`CredentialForm::prefilled`] so that a key missing from the POST body keeps
/// its previous value, then [`CredentialForm::parse`] and [`CredentialForm::apply`].
pub struct CredentialForm {
    ssid: [u8; SSID_CAPACITY],
    password: [u8; PASSWORD_CAPACITY],
    timezone: [u8; TIMEZONE_CAPACITY],
}

impl CredentialForm {
    /// Form buffers holding the current values of `credentials`.
    #[must_use]
    pub fn prefilled(credentials: &Credentials) -> Self {
        let mut form = Self {
            ssid: [0; SSID_CAPACITY],
            password: [0; PASSWORD_CAPACITY],
            timezone: [0; TIMEZONE_CAPACITY],
        };
        copy_terminated(&mut form.ssid, credentials.ssid.as_bytes());
        copy_terminated(&mut form.password, credentials.password.as_bytes());
        copy_terminated(&mut form.timezone, credentials.timezone.as_bytes());
        form
    }

    /// Decode a `application/x-www-form-urlencoded` body into the buffers.
    pub fn parse(&mut self, body: &[u8]) {
        let mut fields = [
            FieldDescriptor::new("ssid", &mut self.ssid),
            FieldDescriptor::new("password", &mut self.password),
            FieldDescriptor::new("timezone", &mut self.timezone),
        ];
        form_matcher::parse(body, &mut fields);
    }

    /// `base` with the network name, passphrase and timezone replaced by the form values.
    #[must_use]
    pub fn apply(&self, base: &Credentials) -> Credentials {
        Credentials {
            ssid: utf8_prefix(&self.ssid),
            password: utf8_prefix(&self.password),
            timezone: utf8_prefix(&self.timezone),
            alarms: base.alarms,
        }
    }
}

fn copy_terminated(buffer: &mut [u8], value: &[u8]) {
    let len = value.len().min(buffer.len().saturating_sub(1));
    if let (Some(dest), Some(src)) = (buffer.get_mut(..len), value.get(..len)) {
        dest.copy_from_slice(src);
    }
    if let Some(terminator) = buffer.get_mut(len) {
        *terminator = 0;
    }
}

/// The longest valid UTF-8 prefix of the terminated bytes in `buffer`.
fn utf8_prefix<const N: usize>(buffer: &[u8]) -> String<N> {
    let bytes = form_matcher::terminated(buffer);
    let text = match core::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => bytes
            .get(..err.valid_up_to())
            .and_then(|valid| core::str::from_utf8(valid).ok())
            .unwrap_or_default(),
    };
    let mut value = String::new();
    for ch in text.chars() {
        if value.push(ch).is_err() {
            break;
        }
    }
    value
}
