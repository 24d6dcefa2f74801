use crate::error::Result;
use crate::types::DeviceRecord;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Persisted list of known devices, unique by address
///
/// The whole list is rewritten on every change. Writers in this process are
/// serialized; separate processes sharing the file are last-writer-wins.
#[derive(Clone)]
pub struct DeviceStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl DeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_ref()
    }

    /// All saved devices in insertion order; empty when nothing was saved yet
    pub async fn load(&self) -> Result<Vec<DeviceRecord>> {
        let _guard = self.lock.lock().await;
        self.read_all().await
    }

    /// Insert a device, replacing any entry with the same address in place
    pub async fn save(&self, record: DeviceRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut devices = self.read_all().await?;

        match devices.iter_mut().find(|d| d.address == record.address) {
            Some(existing) => *existing = record,
            None => devices.push(record),
        }

        self.write_all(&devices).await
    }

    /// Remove a device by address, returning whether it was present
    pub async fn remove(&self, address: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut devices = self.read_all().await?;

        let before = devices.len();
        devices.retain(|d| d.address != address);
        if devices.len() == before {
            return Ok(false);
        }

        self.write_all(&devices).await?;
        Ok(true)
    }

    async fn read_all(&self) -> Result<Vec<DeviceRecord>> {
        match tokio::fs::read(self.path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_all(&self, devices: &[DeviceRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(devices)?;
        tokio::fs::write(self.path.as_ref(), payload).await?;
        tracing::debug!("Saved {} device(s) to {}", devices.len(), self.path.display());
        Ok(())
    }
}
