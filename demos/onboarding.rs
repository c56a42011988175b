//! Alarm-clock onboarding on a Raspberry Pi Pico W.
//!
//! First boot opens the open access point `alarm-clock-setup`; join it and the captive portal
//! asks for the home network and timezone. Once saved, the device joins that network,
//! synchronizes its clock over NTP and keeps the link up.

#![no_std]
#![no_main]
#![allow(clippy::future_not_send, reason = "single-threaded")]

use core::convert::Infallible;
use defmt::*;
use defmt_rtt as _;
use embassy_executor::Spawner;
use panic_probe as _;
use wifi_onboard::flash_array::{FlashArray, FlashArrayStatic};
use wifi_onboard::time_sync::NtpTimeSource;
use wifi_onboard::wifi::{Cyw43Wifi, Cyw43WifiStatic};
use wifi_onboard::{
    KeyedBlobStore, OnboardingConfig, OnboardingCoordinator, OnboardingStatic, Result,
};

#[embassy_executor::main]
pub async fn main(spawner: Spawner) -> ! {
    let err = inner_main(spawner).await.unwrap_err();
    core::panic!("{err}");
}

async fn inner_main(spawner: Spawner) -> Result<Infallible> {
    info!("Starting onboarding demo");
    let p = embassy_rp::init(Default::default());

    static FLASH_STATIC: FlashArrayStatic = FlashArray::<1>::new_static();
    let [credential_block] = FlashArray::new(&FLASH_STATIC, p.FLASH)?;
    let store = KeyedBlobStore::new(credential_block);

    static ONBOARDING: OnboardingStatic = OnboardingStatic::new();
    static WIFI_STATIC: Cyw43WifiStatic = Cyw43Wifi::new_static();
    let wifi = Cyw43Wifi::new(
        &WIFI_STATIC,
        &ONBOARDING,
        p.PIN_23,
        p.PIN_25,
        p.PIO0,
        p.PIN_24,
        p.PIN_29,
        p.DMA_CH0,
        spawner,
    )
    .await?;

    let config = OnboardingConfig::default();
    let time = NtpTimeSource::new(wifi.stack(), config.ntp_server);
    let mut coordinator = OnboardingCoordinator::new(&ONBOARDING, wifi, store, time, config);

    let now = coordinator.run().await?;
    info!("Online; unix time {}", now.as_i64());
    info!(
        "Timezone: {}",
        coordinator.credentials().timezone.as_str()
    );

    Ok(coordinator.maintain_connection().await)
}
