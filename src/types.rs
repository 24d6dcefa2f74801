use crate::error::{ClockError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Port the clock's web server listens on unless told otherwise
pub const DEFAULT_DEVICE_PORT: u16 = 80;

/// A saved device, identified by its address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(rename = "ip")]
    pub address: String,
    pub port: u16,
}

impl DeviceRecord {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Base URL of the device's HTTP surface
    pub fn base_url(&self) -> String {
        format!("http://{}", self)
    }

    /// Address as it appears in a URL authority, IPv6 literals bracketed
    fn host(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]", self.address)
        } else {
            self.address.clone()
        }
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.port)
    }
}

/// Parses `host`, `host:port`, `[v6]` or `[v6]:port`, defaulting to port 80
///
/// A bare address with more than one colon is taken as an IPv6 literal
/// without a port.
impl FromStr for DeviceRecord {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ClockError::InvalidArgument("device address is empty".to_string()));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ClockError::InvalidArgument(format!("unclosed '[' in '{}'", s)))?;
            match tail {
                "" => (host, None),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => {
                        return Err(ClockError::InvalidArgument(format!(
                            "unexpected '{}' after address in '{}'",
                            tail, s
                        )))
                    }
                },
            }
        } else if s.matches(':').count() > 1 {
            (s, None)
        } else {
            match s.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(ClockError::InvalidArgument(format!("missing host in '{}'", s)));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| ClockError::InvalidArgument(format!("invalid port in '{}'", s)))?,
            None => DEFAULT_DEVICE_PORT,
        };
        Ok(Self::new(host, port))
    }
}

/// Alarm time and sound as the device's `setAlarmDirect` endpoint expects them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmSettings {
    pub hour: u8,
    pub minute: u8,

    /// Sound index: 0 = beep, 1 = melody 1, 2 = melody 2
    #[serde(default)]
    pub sound: u8,
}

impl AlarmSettings {
    pub fn new(hour: u8, minute: u8, sound: u8) -> Self {
        Self { hour, minute, sound }
    }

    /// Check hour and minute are a valid clock time
    pub fn validate(&self) -> Result<()> {
        if self.hour > 23 {
            return Err(ClockError::InvalidArgument(format!(
                "hour must be 0-23, got {}",
                self.hour
            )));
        }
        if self.minute > 59 {
            return Err(ClockError::InvalidArgument(format!(
                "minute must be 0-59, got {}",
                self.minute
            )));
        }
        Ok(())
    }
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self::new(12, 0, 0)
    }
}

/// Gateway session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Disconnected,
    Probing,
    Connected,
}
