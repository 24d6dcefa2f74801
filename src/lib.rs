//! Rust library for controlling ESP32-based smart clocks
//!
//! This library provides an async API for driving a smart clock over its
//! local HTTP interface, with an optional MQTT session for push-style
//! status updates. It supports:
//!
//! - Saving known clocks (unique by address) to a JSON device list
//! - Alarm set/clear, button presses, snooze, reset and sleep-timer reset
//! - A user-visible activity log of every device interaction
//! - MQTT over WebSocket, secure WebSocket or TCP with automatic reconnect
//! - Generic and per-topic notification streams
//!
//! # Quick Start
//!
//! ```no_run
//! use smartclock_control::{AlarmSettings, ClockClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClockClient::from_env();
//!
//!     // Probe the clock and remember it
//!     let gateway = client.find_device("192.168.1.50", 80).await?;
//!     gateway.set_alarm(AlarmSettings::new(7, 0, 0), true).await?;
//!     gateway.press_button("mode").await?;
//!
//!     for entry in client.log().entries() {
//!         println!("[{}] {}", entry.timestamp, entry.text);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Notifications
//!
//! ```no_run
//! use smartclock_control::ClockClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClockClient::from_env();
//!     let mut channel = client.connect_notifications().await?;
//!
//!     let mut status = channel.on_topic("clock/status");
//!     channel.subscribe("clock/status").await?;
//!     channel.request_status().await?;
//!
//!     let update = status.recv().await?;
//!     println!("{}: {}", update.topic, update.data);
//!
//!     channel.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Client**: owns config, device store and activity log
//! - **Gateway**: HTTP commands against one clock
//! - **Channel**: MQTT session, subscriptions and publishing
//! - **Subscription**: notification fan-out by topic
//! - **Protocol**: command and notification message structures
//! - **Types**: domain types and data structures

mod channel;
mod client;
mod config;
mod error;
mod gateway;
mod log;
mod protocol;
mod store;
mod subscription;
mod types;

// Public exports
pub use channel::{ChannelState, NotificationChannel};
pub use client::ClockClient;
pub use config::{BrokerConfig, BrokerTransport, ClockConfig, ReconnectPolicy, Topics};
pub use error::{ClockError, Result};
pub use gateway::{DeviceGateway, ReachabilityPoll};
pub use log::{ActivityLog, LogEntry, Severity};
pub use protocol::{topic_matches, CommandMessage, Endpoint, Notification, SOURCE_TAG};
pub use store::DeviceStore;
pub use subscription::NotificationReceiver;
pub use types::{AlarmSettings, DeviceRecord, GatewayState, DEFAULT_DEVICE_PORT};
