//! [`WifiDevice`] for the Raspberry Pi Pico W's CYW43439 radio.
//!
//! One embassy-net stack serves both modes. In access-point mode it gets the static address
//! 192.168.4.1/24 and hosts the DHCP, DNS and HTTP tasks; in station mode it runs a DHCP
//! client. A monitor task turns link and address changes into [`NetworkEvent`]s while the
//! station is active.
//!
//! ```no_run
//! # #![no_std]
//! # #![no_main]
//! # use panic_probe as _;
//! use wifi_onboard::onboarding::OnboardingStatic;
//! use wifi_onboard::wifi::{Cyw43Wifi, Cyw43WifiStatic};
//!
//! # async fn example(spawner: embassy_executor::Spawner) -> wifi_onboard::Result<()> {
//! let p = embassy_rp::init(Default::default());
//!
//! static ONBOARDING: OnboardingStatic = OnboardingStatic::new();
//! static WIFI_STATIC: Cyw43WifiStatic = Cyw43Wifi::new_static();
//! let wifi = Cyw43Wifi::new(
//!     &WIFI_STATIC,
//!     &ONBOARDING,
//!     p.PIN_23,
//!     p.PIN_25,
//!     p.PIO0,
//!     p.PIN_24,
//!     p.PIN_29,
//!     p.DMA_CH0,
//!     spawner,
//! )
//! .await?;
//! let stack = wifi.stack(); // for NtpTimeSource
//! # let _ = stack;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::future_not_send, reason = "single-threaded")]

use core::net::Ipv4Addr;

use cyw43::JoinOptions;
use cyw43_pio::{DEFAULT_CLOCK_DIVIDER, PioSpi};
use embassy_executor::Spawner;
use embassy_net::{Config, ConfigV4, Ipv4Cidr, Stack, StackResources, StaticConfigV4};
use embassy_rp::gpio::{Level, Output};
use embassy_rp::peripherals::{DMA_CH0, PIN_23, PIN_24, PIN_25, PIN_29, PIO0};
use embassy_rp::pio::{InterruptHandler, Pio};
use embassy_rp::{Peri, bind_interrupts};
use embassy_time::Timer;
use portable_atomic::{AtomicBool, Ordering};
use static_cell::StaticCell;

use crate::credentials::Credentials;
use crate::dhcp::DhcpService;
use crate::dns_responder::DnsResponder;
use crate::onboarding::{AccessPointConfig, NetworkEvent, OnboardingStatic, WifiDevice};
use crate::portal::{HttpPortal, Portal};
use crate::{Error, Result};

/// Address of the device on its own setup network.
pub const AP_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);
/// Prefix length of the setup network.
pub const AP_PREFIX_LEN: u8 = 24;

// DNS responder, DHCP server, HTTP portal, NTP client, DNS client, spare.
const SOCKET_COUNT: usize = 6;
const LINK_POLL_MS: u64 = 250;

bind_interrupts!(struct Irqs {
    PIO0_IRQ_0 => InterruptHandler<PIO0>;
});

/// Static resources for [`Cyw43Wifi`].
pub struct Cyw43WifiStatic {
    radio_state: StaticCell<cyw43::State>,
    stack_resources: StaticCell<StackResources<SOCKET_COUNT>>,
    dns: DnsResponder,
    dhcp: DhcpService,
    http: HttpPortal,
    station_active: AtomicBool,
}

/// The Pico W radio plus its network stack.
pub struct Cyw43Wifi {
    control: cyw43::Control<'static>,
    stack: Stack<'static>,
    spawner: Spawner,
    resources: &'static Cyw43WifiStatic,
    onboarding: &'static OnboardingStatic,
    credentials: Option<Credentials>,
    ap_up: bool,
}

impl Cyw43Wifi {
    /// Create static resources for [`Cyw43Wifi::new`].
    #[must_use]
    pub const fn new_static() -> Cyw43WifiStatic {
        Cyw43WifiStatic {
            radio_state: StaticCell::new(),
            stack_resources: StaticCell::new(),
            dns: DnsResponder::new(),
            dhcp: DhcpService::new(),
            http: HttpPortal::new(),
            station_active: AtomicBool::new(false),
        }
    }

    /// Power up the radio, load its firmware and start the network stack with no address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskSpawn`] if a driver task cannot be started.
    #[expect(clippy::too_many_arguments, reason = "one argument per radio pin")]
    pub async fn new(
        resources: &'static Cyw43WifiStatic,
        onboarding: &'static OnboardingStatic,
        pin_23: Peri<'static, PIN_23>,
        pin_25: Peri<'static, PIN_25>,
        pio0: Peri<'static, PIO0>,
        pin_24: Peri<'static, PIN_24>,
        pin_29: Peri<'static, PIN_29>,
        dma_ch0: Peri<'static, DMA_CH0>,
        spawner: Spawner,
    ) -> Result<Self> {
        info!("Radio initializing");
        let fw = cyw43_firmware::CYW43_43439A0;
        let clm = cyw43_firmware::CYW43_43439A0_CLM;

        let pwr = Output::new(pin_23, Level::Low);
        let cs = Output::new(pin_25, Level::High);
        let mut pio = Pio::new(pio0, Irqs);
        let spi = PioSpi::new(
            &mut pio.common,
            pio.sm0,
            DEFAULT_CLOCK_DIVIDER,
            pio.irq0,
            cs,
            pin_24,
            pin_29,
            dma_ch0,
        );

        let state = resources.radio_state.init(cyw43::State::new());
        let (net_device, mut control, runner) = cyw43::new(state, pwr, spi, fw).await;
        spawner.spawn(wifi_task(runner)?);

        control.init(clm).await;
        control
            .set_power_management(cyw43::PowerManagementMode::PowerSave)
            .await;

        let seed = 0x7c8f_3a2e_9d14_6b5a;
        let (stack, runner) = embassy_net::new(
            net_device,
            Config::default(),
            resources.stack_resources.init(StackResources::new()),
            seed,
        );
        spawner.spawn(net_task(runner)?);
        spawner.spawn(link_monitor_task(stack, resources, onboarding)?);

        Ok(Self {
            control,
            stack,
            spawner,
            resources,
            onboarding,
            credentials: None,
            ap_up: false,
        })
    }

    /// The network stack, e.g. for [`NtpTimeSource`](crate::time_sync::NtpTimeSource).
    #[must_use]
    pub const fn stack(&self) -> Stack<'static> {
        self.stack
    }
}

impl WifiDevice for Cyw43Wifi {
    async fn start_access_point(&mut self, config: &AccessPointConfig) -> Result<Ipv4Addr> {
        self.stack.set_config_v4(ConfigV4::Static(StaticConfigV4 {
            address: Ipv4Cidr::new(AP_ADDRESS, AP_PREFIX_LEN),
            gateway: Some(AP_ADDRESS),
            dns_servers: Default::default(),
        }));
        info!(
            "Starting AP '{}' on channel {} (max {} client)",
            config.ssid, config.channel, config.max_connections
        );
        self.control.start_ap_open(config.ssid, config.channel).await;
        self.ap_up = true;
        Ok(AP_ADDRESS)
    }

    async fn start_dhcp_server(&mut self, address: Ipv4Addr, portal_url: &str) -> Result<()> {
        self.resources
            .dhcp
            .start(self.stack, self.spawner, address, portal_url)
            .await
    }

    async fn stop_dhcp_server(&mut self) {
        self.resources.dhcp.stop();
    }

    async fn start_dns_responder(&mut self, address: Ipv4Addr) -> Result<()> {
        self.resources
            .dns
            .start(self.stack, self.spawner, address)
            .await
    }

    async fn stop_dns_responder(&mut self) {
        self.resources.dns.stop();
    }

    async fn start_http_portal(&mut self, portal: Portal) -> Result<()> {
        self.resources.http.start(
            self.stack,
            self.spawner,
            portal,
            self.onboarding.submissions(),
        )
    }

    async fn stop_http_portal(&mut self) {
        self.resources.http.stop();
    }

    async fn start_station(&mut self, credentials: &Credentials) -> Result<()> {
        if credentials.ssid.is_empty() {
            return Err(Error::Station);
        }
        self.stack
            .set_config_v4(ConfigV4::Dhcp(embassy_net::DhcpConfig::default()));
        self.credentials = Some(credentials.clone());
        self.resources.station_active.store(true, Ordering::Release);
        info!("Station configured for {}", credentials.ssid.as_str());
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        let credentials = self.credentials.as_ref().ok_or(Error::Station)?;
        let options = if credentials.password.is_empty() {
            JoinOptions::new_open()
        } else {
            JoinOptions::new(credentials.password.as_bytes())
        };
        match self.control.join(credentials.ssid.as_str(), options).await {
            Ok(()) => info!("Joined {}", credentials.ssid.as_str()),
            Err(err) => {
                // Reported as a disconnect so the coordinator's reconnect delay applies.
                warn!("Join failed: status {}", err.status);
                let _ = self
                    .onboarding
                    .events()
                    .try_send(NetworkEvent::Disconnected);
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.resources
            .station_active
            .store(false, Ordering::Release);
        self.control.leave().await;
        Ok(())
    }

    async fn deinit(&mut self) -> Result<()> {
        self.resources
            .station_active
            .store(false, Ordering::Release);
        if self.ap_up {
            self.control.close_ap().await;
            self.ap_up = false;
        }
        self.credentials = None;
        self.stack.set_config_v4(ConfigV4::None);
        debug!("Radio idle");
        Ok(())
    }
}

#[embassy_executor::task]
async fn wifi_task(
    runner: cyw43::Runner<'static, Output<'static>, PioSpi<'static, PIO0, 0, DMA_CH0>>,
) -> ! {
    runner.run().await
}

#[embassy_executor::task]
async fn net_task(mut runner: embassy_net::Runner<'static, cyw43::NetDriver<'static>>) -> ! {
    runner.run().await
}

/// Report station link and address transitions while the station is active.
#[embassy_executor::task]
async fn link_monitor_task(
    stack: Stack<'static>,
    resources: &'static Cyw43WifiStatic,
    onboarding: &'static OnboardingStatic,
) -> ! {
    let mut had_link = false;
    let mut had_address = false;
    loop {
        Timer::after_millis(LINK_POLL_MS).await;
        let active = resources.station_active.load(Ordering::Acquire);
        let has_link = active && stack.is_link_up();
        let has_address = active && stack.is_config_up();

        if active {
            if had_link && !has_link {
                let _ = onboarding.events().try_send(NetworkEvent::Disconnected);
            }
            if has_address && !had_address {
                if let Some(config) = stack.config_v4() {
                    let [a, b, c, d] = config.address.address().octets();
                    info!("Station address {}.{}.{}.{}", a, b, c, d);
                }
                let _ = onboarding.events().try_send(NetworkEvent::AddressAcquired);
            }
        }
        had_link = has_link;
        had_address = has_address;
    }
}
