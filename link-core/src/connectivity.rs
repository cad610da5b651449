//! Station association lifecycle, status indication and update gating.
//!
//! The manager is the only writer of [`ConnectionState`] and of the status
//! indicator. The update transport is armed only after the station reports
//! an association, and from then on it is serviced exclusively from
//! [`ConnectivityManager::service_updates`].

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;

use crate::config::{LinkTimings, NetworkConfig, StaticAddressing, TxPower};
use crate::shutdown::ShutdownSignal;
use crate::update::{UpdateCallbacks, UpdateTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Wireless station in client mode.
pub trait StationLink {
    type Error: fmt::Display;

    /// Must run before [`StationLink::begin`], otherwise the address the
    /// station ends up with is undefined.
    fn configure_addressing(&mut self, addressing: &StaticAddressing) -> Result<(), Self::Error>;
    /// Start associating. Must not block until the link is up.
    fn begin(&mut self, ssid: &str, credential: &str) -> Result<(), Self::Error>;
    fn set_tx_power(&mut self, power: TxPower) -> Result<(), Self::Error>;
    fn is_associated(&mut self) -> bool;
    fn local_ip(&self) -> Option<Ipv4Addr>;
}

/// Single digital output: blinking while connecting, solid once connected.
pub trait StatusIndicator {
    fn set(&mut self, on: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Shutdown,
    ConnectTimedOut,
    /// The static address could not be applied; association was not attempted.
    AddressingFailed,
}

pub struct ConnectivityManager<L, I, U> {
    config: NetworkConfig,
    timings: LinkTimings,
    link: L,
    indicator: I,
    updates: U,
    state: ConnectionState,
    indicator_on: bool,
}

impl<L, I, U> ConnectivityManager<L, I, U>
where
    L: StationLink,
    I: StatusIndicator,
    U: UpdateTransport,
{
    pub fn new(config: NetworkConfig, timings: LinkTimings, link: L, indicator: I, updates: U) -> Self {
        Self {
            config,
            timings,
            link,
            indicator,
            updates,
            state: ConnectionState::Disconnected,
            indicator_on: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn indicator_on(&self) -> bool {
        self.indicator_on
    }

    pub fn updates(&self) -> &U {
        &self.updates
    }

    /// Full lifecycle. Returns only on shutdown, on an addressing failure
    /// or when a configured connect timeout expires.
    pub fn run(&mut self, shutdown: &ShutdownSignal) -> RunExit {
        if !self.start_association() {
            return RunExit::AddressingFailed;
        }

        if let Err(exit) = self.wait_for_association(shutdown) {
            return exit;
        }

        self.arm_updates(UpdateCallbacks::logging());
        self.service_updates(shutdown);
        RunExit::Shutdown
    }

    /// Indicator off, static addressing, then association and TX power.
    /// Returns false without associating when the static address cannot be
    /// applied, since the station would otherwise come up on DHCP.
    pub fn start_association(&mut self) -> bool {
        self.set_indicator(false);
        self.state = ConnectionState::Disconnected;
        log::info!("WiFi: connecting to network {}", self.config.ssid);

        let addressing = match self.config.addressing() {
            Ok(addressing) => addressing,
            Err(e) => {
                log::error!("WiFi: invalid addressing: {}", e);
                return false;
            }
        };
        if let Err(e) = self.link.configure_addressing(&addressing) {
            log::error!("WiFi: static addressing failed: {}", e);
            return false;
        }
        log::info!("WiFi: static address {}", addressing);

        if let Err(e) = self.link.begin(&self.config.ssid, &self.config.credential) {
            log::error!("WiFi: association request failed: {}", e);
        }

        if let Err(e) = self.link.set_tx_power(self.config.tx_power) {
            log::warn!("WiFi: cannot set TX power to {} dBm: {}", self.config.tx_power.dbm(), e);
        }

        self.state = ConnectionState::Connecting;
        true
    }

    /// Blink until the station is associated. Without a configured timeout
    /// this blocks for as long as the access point stays unreachable.
    pub fn wait_for_association(&mut self, shutdown: &ShutdownSignal) -> Result<Ipv4Addr, RunExit> {
        let started = Instant::now();
        let timeout = self.config.connect_timeout();

        while !self.link.is_associated() {
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    log::error!(
                        "WiFi: connection failed, no association after {} ms",
                        limit.as_millis()
                    );
                    self.state = ConnectionState::Disconnected;
                    self.set_indicator(false);
                    return Err(RunExit::ConnectTimedOut);
                }
            }

            let level = !self.indicator_on;
            self.set_indicator(level);
            log::trace!("WiFi: waiting for association");

            if !shutdown.sleep(self.timings.connect_blink) {
                self.state = ConnectionState::Disconnected;
                self.set_indicator(false);
                return Err(RunExit::Shutdown);
            }
        }

        self.state = ConnectionState::Connected;
        self.set_indicator(true);

        let ip = self.link.local_ip().unwrap_or(Ipv4Addr::UNSPECIFIED);
        log::info!("WiFi: connected, IP Address: {}", ip);
        Ok(ip)
    }

    /// Secret, hooks, then start listening. Refuses while not connected.
    pub fn arm_updates(&mut self, callbacks: UpdateCallbacks) -> bool {
        if self.state != ConnectionState::Connected {
            log::warn!("OTA: not armed, station is {:?}", self.state);
            return false;
        }

        self.updates.set_auth_secret(&self.config.update_auth_secret);
        self.updates.set_callbacks(callbacks);
        match self.updates.begin() {
            Ok(()) => true,
            Err(e) => {
                log::error!("OTA: cannot listen for sessions: {}", e);
                false
            }
        }
    }

    pub fn service_updates(&mut self, shutdown: &ShutdownSignal) {
        loop {
            self.updates.poll_once();
            if !shutdown.sleep(self.timings.update_poll) {
                break;
            }
        }
        log::info!("WiFi/OTA loop stopped");
    }

    fn set_indicator(&mut self, on: bool) {
        self.indicator_on = on;
        self.indicator.set(on);
    }
}
