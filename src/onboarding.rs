//! Onboarding state machine: captive-portal provisioning, then station mode with time sync.
//!
//! The coordinator owns the credentials and the radio mode. Radio control sits behind
//! [`WifiDevice`], persistence behind [`CredentialStore`], and wall-clock time behind
//! [`TimeSource`]. Anything asynchronous that happens elsewhere (link changes, a form
//! submission) reaches it as a message through [`OnboardingStatic`].
//!
//! ```text
//!   NoCredentials ──► ApCapturing ──submit──► StaConnecting ──address+time──► StaConnected
//!                        ▲   │                     │
//!                        │   └──timeout──► Failed ◄┘ timeout / error
//!                        └─────────────────────┘
//! ```

#![allow(clippy::future_not_send, reason = "single-threaded")]

use core::convert::Infallible;
use core::net::Ipv4Addr;

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer, with_timeout};

use crate::credential_store::CredentialStore;
use crate::credentials::Credentials;
use crate::portal::{Portal, portal_url};
use crate::time_sync::TimeSource;
use crate::unix_seconds::UnixSeconds;
use crate::{Error, Result};

/// Network name of the setup access point, overridable with `ONBOARD_AP_SSID` at build time.
pub const DEFAULT_AP_SSID: &str = env!("ONBOARD_AP_SSID");
/// Time server host, overridable with `ONBOARD_NTP_SERVER` at build time.
pub const DEFAULT_NTP_SERVER: &str = env!("ONBOARD_NTP_SERVER");

const EVENT_CAPACITY: usize = 4;

/// Link-layer happenings reported by the radio driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetworkEvent {
    /// The station interface came (back) up and wants a connect.
    StationStarted,
    /// The station lost its association.
    Disconnected,
    /// The station was given an IPv4 address.
    AddressAcquired,
}

/// Where the coordinator is in the onboarding flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OnboardingState {
    /// Nothing stored; provisioning is required.
    NoCredentials,
    /// Access point up, waiting for a form submission.
    ApCapturing,
    /// Station mode started, waiting for an address and the time.
    StaConnecting,
    /// Address acquired and clock synchronized.
    StaConnected,
    /// The last attempt timed out or errored.
    Failed,
}

/// How an access-point session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ApOutcome {
    /// New credentials were submitted and saved.
    Submitted,
    /// Nobody submitted in time; the stored credentials are unchanged.
    TimedOut,
}

/// Tunables of the onboarding flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnboardingConfig {
    /// Network name of the open setup access point.
    pub ap_ssid: &'static str,
    /// Radio channel of the setup access point.
    pub ap_channel: u8,
    /// Client limit of the setup access point.
    pub ap_max_connections: u8,
    /// How long the portal waits for a submission when credentials already exist.
    pub portal_timeout: Duration,
    /// How long the station waits for an address.
    pub address_timeout: Duration,
    /// How long the station waits for the time.
    pub time_sync_timeout: Duration,
    /// Pause before reconnecting after a disconnect.
    pub reconnect_delay: Duration,
    /// Pause between time-sync attempts.
    pub time_sync_retry_delay: Duration,
    /// Time server host name.
    pub ntp_server: &'static str,
}

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            ap_ssid: DEFAULT_AP_SSID,
            ap_channel: 1,
            ap_max_connections: 1,
            portal_timeout: Duration::from_secs(120),
            address_timeout: Duration::from_secs(30),
            time_sync_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            time_sync_retry_delay: Duration::from_secs(2),
            ntp_server: DEFAULT_NTP_SERVER,
        }
    }
}

/// Parameters of the open setup access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPointConfig {
    /// Network name.
    pub ssid: &'static str,
    /// Radio channel.
    pub channel: u8,
    /// Client limit.
    pub max_connections: u8,
}

/// Radio operations the coordinator drives.
///
/// Implementations push [`NetworkEvent`]s into [`OnboardingStatic::events`] while the
/// station is active, and signal [`OnboardingStatic::submissions`] when the portal receives
/// a form.
#[allow(async_fn_in_trait, reason = "single-threaded executor")]
pub trait WifiDevice {
    /// Bring up the open access point and return its own address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessPoint`] when the radio refuses.
    async fn start_access_point(&mut self, config: &AccessPointConfig) -> Result<Ipv4Addr>;

    /// Start leasing addresses, advertising `portal_url` as captive portal.
    ///
    /// # Errors
    ///
    /// Returns a socket or spawn error.
    async fn start_dhcp_server(&mut self, address: Ipv4Addr, portal_url: &str) -> Result<()>;

    /// Stop leasing addresses.
    async fn stop_dhcp_server(&mut self);

    /// Start answering every DNS A query with `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SocketBind`] when port 53 is unavailable.
    async fn start_dns_responder(&mut self, address: Ipv4Addr) -> Result<()>;

    /// Stop the DNS responder.
    async fn stop_dns_responder(&mut self);

    /// Start serving `portal` over HTTP.
    ///
    /// # Errors
    ///
    /// Returns a socket or spawn error.
    async fn start_http_portal(&mut self, portal: Portal) -> Result<()>;

    /// Stop the HTTP portal.
    async fn stop_http_portal(&mut self);

    /// Configure station mode for `credentials` and start reporting link events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Station`] when the radio refuses.
    async fn start_station(&mut self, credentials: &Credentials) -> Result<()>;

    /// Start (or retry) associating with the configured network.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Station`] when the attempt cannot be started.
    async fn connect(&mut self) -> Result<()>;

    /// Drop the association and stop reporting link events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Station`] when the radio refuses.
    async fn disconnect(&mut self) -> Result<()>;

    /// Release the radio mode and the network interface.
    ///
    /// # Errors
    ///
    /// Returns a radio error.
    async fn deinit(&mut self) -> Result<()>;
}

/// Statics shared between the coordinator and the tasks feeding it.
pub struct OnboardingStatic {
    events: Channel<CriticalSectionRawMutex, NetworkEvent, EVENT_CAPACITY>,
    submissions: Signal<CriticalSectionRawMutex, Credentials>,
    states: Signal<CriticalSectionRawMutex, OnboardingState>,
}

impl Default for OnboardingStatic {
    fn default() -> Self {
        Self::new()
    }
}

impl OnboardingStatic {
    /// Create the shared resources.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            events: Channel::new(),
            submissions: Signal::new(),
            states: Signal::new(),
        }
    }

    /// Link events, radio driver → coordinator.
    pub const fn events(&self) -> &Channel<CriticalSectionRawMutex, NetworkEvent, EVENT_CAPACITY> {
        &self.events
    }

    /// Form submissions, portal → coordinator.
    pub const fn submissions(&self) -> &Signal<CriticalSectionRawMutex, Credentials> {
        &self.submissions
    }

    /// Wait for the next state the coordinator publishes.
    pub async fn wait_state(&self) -> OnboardingState {
        self.states.wait().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RadioMode {
    Idle,
    AccessPoint,
    Station,
}

/// Drives a device from "no credentials" to "connected with the time known".
pub struct OnboardingCoordinator<'a, W, S, T> {
    wifi: W,
    store: S,
    time: T,
    config: OnboardingConfig,
    resources: &'a OnboardingStatic,
    state: OnboardingState,
    credentials: Credentials,
    mode: RadioMode,
    reconnect_registered: bool,
}

impl<'a, W, S, T> OnboardingCoordinator<'a, W, S, T>
where
    W: WifiDevice,
    S: CredentialStore,
    T: TimeSource,
{
    /// Load the stored credentials and pick the starting state.
    ///
    /// Unreadable storage is logged and treated as empty, so the device falls back to
    /// provisioning instead of refusing to boot.
    pub fn new(
        resources: &'a OnboardingStatic,
        wifi: W,
        mut store: S,
        time: T,
        config: OnboardingConfig,
    ) -> Self {
        let credentials = match store.load() {
            Ok(Some(credentials)) => credentials,
            Ok(None) => Credentials::default(),
            Err(err) => {
                error!("Stored credentials unusable, starting over: {}", err);
                Credentials::default()
            }
        };
        let state = if credentials.is_provisioned() {
            OnboardingState::StaConnecting
        } else {
            OnboardingState::NoCredentials
        };
        resources.states.signal(state);
        Self {
            wifi,
            store,
            time,
            config,
            resources,
            state,
            credentials,
            mode: RadioMode::Idle,
            reconnect_registered: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> OnboardingState {
        self.state
    }

    /// Credentials in use.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// The radio device, e.g. to inspect a test double.
    pub const fn wifi(&self) -> &W {
        &self.wifi
    }

    /// The credential store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Provision until STA succeeds: AP when nothing is stored, otherwise STA with AP
    /// fallback after each failure.
    ///
    /// # Errors
    ///
    /// Access-point errors (radio, sockets, saving) are not retried and are returned.
    pub async fn run(&mut self) -> Result<UnixSeconds> {
        loop {
            if !self.credentials.is_provisioned() {
                info!("No credentials stored; starting setup access point");
                self.enter_ap_mode().await?;
                continue;
            }
            match self.enter_sta_mode().await {
                Ok(now) => return Ok(now),
                Err(err) => {
                    warn!("Station attempt failed ({}); reopening setup portal", err);
                    match self.enter_ap_mode().await? {
                        ApOutcome::Submitted => info!("New credentials received"),
                        ApOutcome::TimedOut => info!("Portal idle; retrying stored network"),
                    }
                }
            }
        }
    }

    /// Run the captive portal until a submission arrives.
    ///
    /// The wait is unbounded while no credentials exist and bounded by
    /// [`OnboardingConfig::portal_timeout`] otherwise. A submission is saved before it
    /// replaces the in-memory credentials.
    ///
    /// # Errors
    ///
    /// Returns radio, socket or storage errors; the access point is torn down either way.
    pub async fn enter_ap_mode(&mut self) -> Result<ApOutcome> {
        self.deinit().await?;
        self.set_state(OnboardingState::ApCapturing);
        self.resources.submissions.reset();
        self.mode = RadioMode::AccessPoint;

        let captured = self.capture_submission().await;
        let released = self.deinit().await;

        let submitted = match captured {
            Ok(Some(submitted)) => submitted,
            Ok(None) => {
                released?;
                info!("Setup portal timed out");
                self.set_state(OnboardingState::Failed);
                return Ok(ApOutcome::TimedOut);
            }
            Err(err) => {
                error!("Setup portal failed: {}", err);
                self.set_state(OnboardingState::Failed);
                return Err(err);
            }
        };
        released?;

        if let Err(err) = self.store.save(&submitted) {
            error!("Unable to save credentials: {}", err);
            self.set_state(OnboardingState::Failed);
            return Err(err);
        }
        self.credentials = submitted;
        self.set_state(OnboardingState::StaConnecting);
        Ok(ApOutcome::Submitted)
    }

    async fn capture_submission(&mut self) -> Result<Option<Credentials>> {
        let access_point = AccessPointConfig {
            ssid: self.config.ap_ssid,
            channel: self.config.ap_channel,
            max_connections: self.config.ap_max_connections,
        };
        let address = self.wifi.start_access_point(&access_point).await?;
        let url = portal_url(address);
        self.wifi.start_dhcp_server(address, &url).await?;
        self.wifi.start_dns_responder(address).await?;
        self.wifi
            .start_http_portal(Portal::new(&url, self.credentials.clone()))
            .await?;
        info!("Setup portal ready at {}", url.as_str());

        let submission = self.resources.submissions.wait();
        if self.credentials.is_provisioned() {
            Ok(with_timeout(self.config.portal_timeout, submission).await.ok())
        } else {
            Ok(Some(submission.await))
        }
    }

    /// Join the stored network, wait for an address, then synchronize the clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressTimeout`], [`Error::TimeSyncTimeout`] or a radio error. The
    /// station is torn down and the credentials are left as they were.
    pub async fn enter_sta_mode(&mut self) -> Result<UnixSeconds> {
        self.deinit().await?;
        self.set_state(OnboardingState::StaConnecting);
        self.resources.events.clear();
        self.mode = RadioMode::Station;
        self.reconnect_registered = true;

        match self.connect_and_sync().await {
            Ok(now) => {
                info!("Station connected; unix time {}", now.as_i64());
                self.set_state(OnboardingState::StaConnected);
                Ok(now)
            }
            Err(err) => {
                if let Err(teardown) = self.deinit().await {
                    error!("Station teardown failed: {}", teardown);
                }
                self.set_state(OnboardingState::Failed);
                Err(err)
            }
        }
    }

    async fn connect_and_sync(&mut self) -> Result<UnixSeconds> {
        self.wifi.start_station(&self.credentials).await?;
        self.wifi.connect().await?;

        let Self {
            wifi,
            time,
            config,
            resources,
            ..
        } = self;
        let config: &OnboardingConfig = config;
        let resources: &OnboardingStatic = resources;

        with_timeout(config.address_timeout, wait_for_address(wifi, resources, config))
            .await
            .map_err(|_| Error::AddressTimeout)?;
        info!("Station has an address; synchronizing time");

        let attempts = async {
            loop {
                match time.synchronize().await {
                    Ok(now) => return now,
                    Err(err) => {
                        warn!("Time sync attempt failed: {}", err);
                        Timer::after(config.time_sync_retry_delay).await;
                    }
                }
            }
        };
        let synced = with_timeout(
            config.time_sync_timeout,
            select(attempts, service_link_events(wifi, resources, config)),
        )
        .await
        .map_err(|_| Error::TimeSyncTimeout)?;
        match synced {
            Either::First(now) => Ok(now),
            Either::Second(never) => match never {},
        }
    }

    /// Keep the station associated after a successful [`enter_sta_mode`](Self::enter_sta_mode).
    ///
    /// Disconnects are retried after [`OnboardingConfig::reconnect_delay`]; the published
    /// state follows the link.
    pub async fn maintain_connection(&mut self) -> Infallible {
        loop {
            let event = self.resources.events.receive().await;
            if !self.reconnect_registered {
                continue;
            }
            match event {
                NetworkEvent::AddressAcquired => self.set_state(OnboardingState::StaConnected),
                NetworkEvent::Disconnected => {
                    self.set_state(OnboardingState::StaConnecting);
                    handle_link_event(&mut self.wifi, &self.config, event).await;
                }
                NetworkEvent::StationStarted => {
                    handle_link_event(&mut self.wifi, &self.config, event).await;
                }
            }
        }
    }

    /// Release whatever radio mode is active. Calling it while idle does nothing.
    ///
    /// The reconnect handling is unregistered and the station disconnected before the
    /// radio is released, so no reconnect can race the teardown.
    ///
    /// # Errors
    ///
    /// Returns the first radio error; the mode is considered released regardless.
    pub async fn deinit(&mut self) -> Result<()> {
        let disconnected = match self.mode {
            RadioMode::Idle => return Ok(()),
            RadioMode::AccessPoint => {
                self.wifi.stop_http_portal().await;
                self.wifi.stop_dns_responder().await;
                self.wifi.stop_dhcp_server().await;
                Ok(())
            }
            RadioMode::Station if self.reconnect_registered => {
                self.reconnect_registered = false;
                self.resources.events.clear();
                self.wifi.disconnect().await
            }
            RadioMode::Station => Ok(()),
        };
        let released = self.wifi.deinit().await;
        self.mode = RadioMode::Idle;
        debug!("Radio released");
        disconnected.and(released)
    }

    fn set_state(&mut self, state: OnboardingState) {
        if self.state != state {
            debug!("Onboarding state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.resources.states.signal(state);
    }
}

async fn wait_for_address<W: WifiDevice>(
    wifi: &mut W,
    resources: &OnboardingStatic,
    config: &OnboardingConfig,
) {
    loop {
        match resources.events.receive().await {
            NetworkEvent::AddressAcquired => return,
            event => handle_link_event(wifi, config, event).await,
        }
    }
}

async fn service_link_events<W: WifiDevice>(
    wifi: &mut W,
    resources: &OnboardingStatic,
    config: &OnboardingConfig,
) -> Infallible {
    loop {
        let event = resources.events.receive().await;
        handle_link_event(wifi, config, event).await;
    }
}

async fn handle_link_event<W: WifiDevice>(
    wifi: &mut W,
    config: &OnboardingConfig,
    event: NetworkEvent,
) {
    let reconnect = match event {
        NetworkEvent::StationStarted => {
            info!("Station started; connecting");
            wifi.connect().await
        }
        NetworkEvent::Disconnected => {
            warn!("Station disconnected; reconnecting shortly");
            Timer::after(config.reconnect_delay).await;
            wifi.connect().await
        }
        NetworkEvent::AddressAcquired => Ok(()),
    };
    if let Err(err) = reconnect {
        warn!("Reconnect attempt failed: {}", err);
    }
}
