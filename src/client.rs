use crate::channel::NotificationChannel;
use crate::config::ClockConfig;
use crate::error::{ClockError, Result};
use crate::gateway::DeviceGateway;
use crate::log::ActivityLog;
use crate::store::DeviceStore;
use crate::types::DeviceRecord;

/// Entry point for controlling smart clocks
///
/// The `ClockClient` owns the configuration, the saved device list and the
/// activity log. It hands out [`DeviceGateway`]s for HTTP control and
/// [`NotificationChannel`]s for the optional broker session; each shares
/// this client's log.
pub struct ClockClient {
    config: ClockConfig,
    store: DeviceStore,
    log: ActivityLog,
}

impl ClockClient {
    pub fn new(config: ClockConfig) -> Self {
        let store = DeviceStore::new(config.devices_path());
        Self {
            config,
            store,
            log: ActivityLog::new(),
        }
    }

    /// Client configured from `CLOCK_*` environment variables
    pub fn from_env() -> Self {
        Self::new(ClockConfig::from_env())
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    pub fn log(&self) -> &ActivityLog {
        &self.log
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    /// Devices saved by earlier successful connections
    pub async fn saved_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.store.load().await
    }

    pub async fn remove_device(&self, address: &str) -> Result<bool> {
        let removed = self.store.remove(address).await?;
        if removed {
            self.log.info(format!("Removed device {}", address));
        }
        Ok(removed)
    }

    /// Probe a device and, if it answers, save it and return a connected gateway
    ///
    /// # Example
    ///
    /// ```no_run
    /// use smartclock_control::{AlarmSettings, ClockClient, ClockConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let client = ClockClient::new(ClockConfig::default());
    ///     let gateway = client.find_device("192.168.1.50", 80).await?;
    ///     gateway.set_alarm(AlarmSettings::new(6, 30, 1), true).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn find_device(&self, address: &str, port: u16) -> Result<DeviceGateway> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ClockError::InvalidArgument(
                "device address is required".to_string(),
            ));
        }

        let record = DeviceRecord::new(address, port);
        let mut gateway = self.gateway();
        if let Err(e) = gateway.probe(record.clone()).await {
            self.log
                .error(format!("Cannot reach device at {}, check the address and network", record));
            return Err(e);
        }

        self.store.save(record.clone()).await?;
        self.log.success(format!("Connected to {}", record));
        Ok(gateway)
    }

    /// Gateway targeting a known device without probing it first
    pub fn open_device(&self, record: DeviceRecord) -> DeviceGateway {
        DeviceGateway::for_device(record, self.log.clone(), self.config.broker.connect_timeout())
    }

    /// Gateway with no target device
    pub fn gateway(&self) -> DeviceGateway {
        DeviceGateway::new(self.log.clone(), self.config.broker.connect_timeout())
    }

    /// Idle notification channel for the configured broker
    pub fn notification_channel(&self) -> NotificationChannel {
        NotificationChannel::new(self.config.broker.clone(), self.config.topics.clone())
    }

    /// Notification channel that is already connected
    pub async fn connect_notifications(&self) -> Result<NotificationChannel> {
        let mut channel = self.notification_channel();
        match channel.connect().await {
            Ok(()) => {
                self.log.success("Notification channel connected");
                Ok(channel)
            }
            Err(e) => {
                self.log.error(format!("Notification channel failed: {}", e));
                Err(e)
            }
        }
    }
}
