//! Wi-Fi onboarding for a small network appliance.
//!
//! With nothing stored, the device opens a setup access point and captures every client with
//! DHCP option 114, a wildcard DNS responder and an HTTP portal. The submitted network name,
//! passphrase and timezone are saved, then the device joins that network and synchronizes its
//! clock. See [`onboarding::OnboardingCoordinator`].
//!
//! The protocol logic (DNS, DHCP, form decoding, HTTP routing, storage layout, the state
//! machine) builds and tests on the host. Feature `wifi` adds the embassy-net tasks; `pico1`
//! adds internal flash storage and, together with `wifi`, the CYW43 radio driver.
#![no_std]

#[macro_use]
mod fmt;

pub mod credential_store;
pub mod credentials;
pub mod dhcp;
pub mod dns_responder;
mod error;
#[cfg(feature = "pico1")]
pub mod flash_array;
pub mod form_matcher;
pub mod onboarding;
pub mod portal;
pub mod time_sync;
pub mod unix_seconds;
#[cfg(all(feature = "wifi", feature = "pico1"))]
pub mod wifi;

// Re-export commonly used items
pub use credential_store::{CredentialStore, KeyedBlobStore};
pub use credentials::Credentials;
pub use dns_responder::DnsResponder;
pub use error::{Error, Result};
pub use onboarding::{
    ApOutcome, OnboardingConfig, OnboardingCoordinator, OnboardingState, OnboardingStatic,
    WifiDevice,
};
pub use time_sync::TimeSource;
pub use unix_seconds::UnixSeconds;
