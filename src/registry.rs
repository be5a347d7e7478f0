//! Device registry
//!
//! Maps device ids to live driver instances. Persistent entries are kept in
//! a single JSON file keyed by id; the whole map is rewritten on every change
//! (last write wins). Runtime-only drivers can be registered alongside them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::driver::bambu::{BambuConfig, BambuPrinter};
use crate::driver::simulated::{SimulatedPrinter, SimulatedState};
use crate::driver::PrinterDriver;

pub type DeviceId = String;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid device id: {0:?}")]
    InvalidId(String),
}

/// Persisted description of a device, tagged by driver type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceConfig {
    Bambu {
        ip: String,
        access_code: String,
        serial: String,
    },
    Simulated {
        #[serde(default = "SimulatedState::idle")]
        state: SimulatedState,
    },
}

impl DeviceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceConfig::Bambu { .. } => "bambu",
            DeviceConfig::Simulated { .. } => "simulated",
        }
    }

    pub fn build_driver(&self) -> Arc<dyn PrinterDriver> {
        match self {
            DeviceConfig::Bambu {
                ip,
                access_code,
                serial,
            } => Arc::new(BambuPrinter::new(BambuConfig::new(
                ip.clone(),
                serial.clone(),
                access_code.clone(),
            ))),
            DeviceConfig::Simulated { state } => SimulatedPrinter::new(state.clone()),
        }
    }
}

/// Row returned by [`DeviceRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    #[serde(rename = "type")]
    pub kind: String,
}

struct Entry {
    /// `None` for runtime-only drivers, which are never written to disk.
    config: Option<DeviceConfig>,
    driver: Arc<dyn PrinterDriver>,
}

pub struct DeviceRegistry {
    path: Option<PathBuf>,
    devices: RwLock<BTreeMap<DeviceId, Entry>>,
}

impl DeviceRegistry {
    /// A registry that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load device definitions from `path`. A missing file is an empty registry.
    ///
    /// Entries with an unknown or invalid shape are skipped with a warning.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let mut devices = BTreeMap::new();

        if path.exists() {
            let data = std::fs::read(path).map_err(|e| RegistryError::IoError(e.to_string()))?;
            let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&data)
                .map_err(|e| RegistryError::DeserializationError(e.to_string()))?;

            for (id, value) in raw {
                match serde_json::from_value::<DeviceConfig>(value) {
                    Ok(config) => {
                        let driver = config.build_driver();
                        devices.insert(
                            id,
                            Entry {
                                config: Some(config),
                                driver,
                            },
                        );
                    }
                    Err(e) => log::warn!("Skipping registry entry {}: {}", id, e),
                }
            }
        }

        log::info!("Loaded {} printer(s) from {}", devices.len(), path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            devices: RwLock::new(devices),
        })
    }

    /// Register a device from its config and persist. Returns the new driver.
    pub async fn add(
        &self,
        id: &str,
        config: DeviceConfig,
    ) -> Result<Arc<dyn PrinterDriver>, RegistryError> {
        let driver = config.build_driver();
        self.insert(id, Some(config), Arc::clone(&driver)).await?;
        Ok(driver)
    }

    /// Register a driver that lives only for this process.
    pub async fn insert_driver(
        &self,
        id: &str,
        driver: Arc<dyn PrinterDriver>,
    ) -> Result<(), RegistryError> {
        self.insert(id, None, driver).await
    }

    async fn insert(
        &self,
        id: &str,
        config: Option<DeviceConfig>,
        driver: Arc<dyn PrinterDriver>,
    ) -> Result<(), RegistryError> {
        if id.trim().is_empty() {
            return Err(RegistryError::InvalidId(id.to_string()));
        }

        let mut devices = self.devices.write().await;
        if devices.contains_key(id) {
            return Err(RegistryError::AlreadyExists(id.to_string()));
        }

        let persistent = config.is_some();
        devices.insert(id.to_string(), Entry { config, driver });
        if persistent {
            if let Err(e) = self.persist(&devices).await {
                devices.remove(id);
                return Err(e);
            }
        }

        log::info!("Registered printer {}", id);
        Ok(())
    }

    /// Remove a device and persist. If the file cannot be written the
    /// device stays registered.
    pub async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        let entry = devices
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if entry.config.is_some() {
            if let Err(e) = self.persist(&devices).await {
                devices.insert(id.to_string(), entry);
                return Err(e);
            }
        }
        log::info!("Removed printer {}", id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn PrinterDriver>> {
        let devices = self.devices.read().await;
        devices.get(id).map(|entry| Arc::clone(&entry.driver))
    }

    pub async fn list(&self) -> Vec<DeviceSummary> {
        let devices = self.devices.read().await;
        devices
            .iter()
            .map(|(id, entry)| DeviceSummary {
                id: id.clone(),
                kind: entry.driver.kind().to_string(),
            })
            .collect()
    }

    /// Snapshot of every registered driver.
    pub async fn drivers(&self) -> Vec<(DeviceId, Arc<dyn PrinterDriver>)> {
        let devices = self.devices.read().await;
        devices
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.driver)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Write the persistent entries. Callers hold the write lock, so saves
    /// land in the same order as the edits they record.
    async fn persist(&self, devices: &BTreeMap<DeviceId, Entry>) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let serializable: BTreeMap<&str, &DeviceConfig> = devices
            .iter()
            .filter_map(|(id, entry)| entry.config.as_ref().map(|c| (id.as_str(), c)))
            .collect();
        let json = serde_json::to_string_pretty(&serializable)
            .map_err(|e| RegistryError::SerializationError(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RegistryError::IoError(format!("Failed to create registry directory: {}", e))
            })?;
        }
        tokio::fs::write(path, json)
            .await
            .map_err(|e| RegistryError::IoError(format!("Failed to write registry: {}", e)))
    }
}
