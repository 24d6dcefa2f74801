use crate::error::{ClockError, Result};
use crate::log::ActivityLog;
use crate::protocol::Endpoint;
use crate::types::{AlarmSettings, DeviceRecord, GatewayState};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// HTTP command gateway for a single clock
///
/// Every request outcome is recorded in the shared [`ActivityLog`]. Requests
/// are never retried; failures come back as `Err` so callers can decide.
#[derive(Clone)]
pub struct DeviceGateway {
    http: reqwest::Client,
    device: Option<DeviceRecord>,
    state: GatewayState,
    probe_timeout: Duration,
    log: ActivityLog,
}

impl DeviceGateway {
    /// Create a gateway with no target device
    pub fn new(log: ActivityLog, probe_timeout: Duration) -> Self {
        // The clock's web server handles one connection at a time
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        Self {
            http,
            device: None,
            state: GatewayState::Disconnected,
            probe_timeout,
            log,
        }
    }

    /// Create a gateway already pointed at `device`, skipping the probe
    ///
    /// Used when the address is known to be good, e.g. reopening a saved device.
    pub fn for_device(device: DeviceRecord, log: ActivityLog, probe_timeout: Duration) -> Self {
        let mut gateway = Self::new(log, probe_timeout);
        gateway.device = Some(device);
        gateway.state = GatewayState::Connected;
        gateway
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    pub fn device(&self) -> Option<&DeviceRecord> {
        self.device.as_ref()
    }

    pub fn log(&self) -> &ActivityLog {
        &self.log
    }

    /// Best-effort check that something answers HTTP at `address:port`
    ///
    /// Any response counts, whatever its status. This only proves the
    /// transport connected; it is not a health check.
    pub async fn test_reachability(&self, address: &str, port: u16) -> bool {
        probe(&self.http, &DeviceRecord::new(address, port), self.probe_timeout).await
    }

    /// Probe `device` and target it if it answers
    pub async fn probe(&mut self, device: DeviceRecord) -> Result<()> {
        self.state = GatewayState::Probing;
        tracing::info!("Probing device at {}", device);

        if probe(&self.http, &device, self.probe_timeout).await {
            tracing::info!("Device at {} is reachable", device);
            self.device = Some(device);
            self.state = GatewayState::Connected;
            Ok(())
        } else {
            self.device = None;
            self.state = GatewayState::Disconnected;
            Err(ClockError::Connection(format!("cannot reach device at {}", device)))
        }
    }

    /// Drop the target device
    pub fn disconnect(&mut self) {
        self.device = None;
        self.state = GatewayState::Disconnected;
    }

    /// GET `endpoint` with query `params` and return the raw body
    ///
    /// Appends exactly one log entry on failure.
    pub async fn send_command(&self, endpoint: &str, params: &[(&str, String)]) -> Result<String> {
        let device = match &self.device {
            Some(device) if self.state == GatewayState::Connected => device,
            _ => {
                self.log.warning(format!("No device connected, dropped '{}'", endpoint));
                return Err(ClockError::NotConnected);
            }
        };

        let url = format!("{}/{}", device.base_url(), endpoint);
        tracing::debug!("Sending: {} {:?}", url, params);

        match self.fetch(&url, params).await {
            Ok((status, body)) => {
                tracing::debug!("Response from {}: {} {}", url, status, body);
                Ok(body)
            }
            Err(e) => {
                self.log.error(format!("Connection error: {}", e));
                Err(e.into())
            }
        }
    }

    async fn fetch(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> std::result::Result<(reqwest::StatusCode, String), reqwest::Error> {
        let response = self.http.get(url).query(params).send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }

    async fn send_endpoint(&self, endpoint: Endpoint, params: &[(&str, String)]) -> Result<String> {
        self.send_command(endpoint.path(), params).await
    }

    /// Enable or disable the alarm at the given time
    pub async fn set_alarm(&self, settings: AlarmSettings, enable: bool) -> Result<String> {
        if let Err(e) = settings.validate() {
            self.log.warning(e.to_string());
            return Err(e);
        }

        let params = [
            ("hour", settings.hour.to_string()),
            ("minute", settings.minute.to_string()),
            ("sound", settings.sound.to_string()),
            ("enable", if enable { "1" } else { "0" }.to_string()),
        ];
        let body = self.send_endpoint(Endpoint::SetAlarmDirect, &params).await?;

        self.log
            .success(if enable { "Alarm enabled" } else { "Alarm disabled" });
        Ok(body)
    }

    /// Simulate a press of one of the clock's physical buttons
    pub async fn press_button(&self, button: &str) -> Result<String> {
        let body = self
            .send_endpoint(Endpoint::Button, &[("btn", button.to_string())])
            .await?;
        self.log.success(format!("Pressed button {}", button));
        Ok(body)
    }

    pub async fn snooze_alarm(&self) -> Result<String> {
        let body = self.send_endpoint(Endpoint::Snooze, &[]).await?;
        self.log.success("Alarm snoozed");
        Ok(body)
    }

    /// Reboot the clock
    ///
    /// The clock usually restarts before it replies, so a transport error
    /// here is expected. Once the request went out the resetting warning is
    /// logged whatever the outcome, and the result is returned unchanged.
    pub async fn reset_device(&self) -> Result<String> {
        let result = self.send_endpoint(Endpoint::Reset, &[]).await;
        if !matches!(result, Err(ClockError::NotConnected)) {
            self.log.warning("Device is resetting...");
        }
        result
    }

    pub async fn reset_sleep_timer(&self) -> Result<String> {
        let body = self.send_endpoint(Endpoint::ResetSleepTimer, &[]).await?;
        self.log.success("Sleep timer reset");
        Ok(body)
    }

    /// Probe the target device every `period` in the background
    ///
    /// Transitions between reachable and unreachable are logged. The poll
    /// stops when the returned handle is stopped or dropped.
    pub fn spawn_reachability_poll(&self, period: Duration) -> Result<ReachabilityPoll> {
        let device = self.device.clone().ok_or(ClockError::NotConnected)?;
        let (tx, rx) = watch::channel(self.state == GatewayState::Connected);

        let http = self.http.clone();
        let log = self.log.clone();
        let timeout = self.probe_timeout;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let reachable = probe(&http, &device, timeout).await;
                let was_reachable = *tx.borrow();

                if reachable != was_reachable {
                    if reachable {
                        log.info(format!("Device {} is reachable again", device));
                    } else {
                        log.warning(format!("Lost contact with device {}", device));
                    }
                }

                if tx.send(reachable).is_err() {
                    tracing::debug!("Reachability receiver dropped, stopping poll");
                    break;
                }
            }
        });

        Ok(ReachabilityPoll { rx, handle })
    }
}

/// Handle to a background reachability poll
pub struct ReachabilityPoll {
    rx: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

impl ReachabilityPoll {
    /// Result of the most recent probe
    pub fn reachable(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the next probe result
    pub async fn changed(&mut self) -> Result<bool> {
        self.rx
            .changed()
            .await
            .map_err(|_| ClockError::ChannelError("Reachability poll stopped".to_string()))?;
        Ok(*self.rx.borrow_and_update())
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for ReachabilityPoll {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn probe(http: &reqwest::Client, device: &DeviceRecord, timeout: Duration) -> bool {
    let url = format!("{}/{}", device.base_url(), Endpoint::Root.path());
    match http.get(&url).timeout(timeout).send().await {
        Ok(response) => {
            tracing::debug!("Probe {} answered {}", url, response.status());
            true
        }
        Err(e) => {
            tracing::debug!("Probe {} failed: {}", url, e);
            false
        }
    }
}
