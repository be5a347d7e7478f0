//! Printer driver abstraction
//!
//! Defines the capability every printer backend exposes to the engine and
//! HTTP layer. Drivers never panic or hang on purpose: every facet returns
//! either a value or a [`DriverError`], and callers decide how to degrade.

pub mod bambu;
pub mod report;
pub mod simulated;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Printer unreachable: {0}")]
    Unreachable(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed device data: {0}")]
    Malformed(String),

    #[error("Action not supported: {0}")]
    Unsupported(ControlAction),

    #[error("Command failed: {0}")]
    CommandFailed(String),
}

/// Status facet exactly as the device reports it, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStatus {
    pub phase_token: Option<String>,
    pub bed_temperature: Option<f64>,
    pub nozzle_temperature: Option<f64>,
    pub error_code: Option<i64>,
}

/// Filament facet: the loaded material plus the vendor payload it came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilamentReport {
    pub tray_type: Option<String>,
    pub raw: serde_json::Value,
}

/// One-shot control requests a driver may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Home,
    Pause,
    Resume,
    Cancel,
}

impl ControlAction {
    pub const ALL: [ControlAction; 4] = [
        ControlAction::Home,
        ControlAction::Pause,
        ControlAction::Resume,
        ControlAction::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Home => "home",
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Cancel => "cancel",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which optional control actions a driver implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub home: bool,
    pub pause: bool,
    pub resume: bool,
    pub cancel: bool,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            home: true,
            pause: true,
            resume: true,
            cancel: true,
        }
    }

    pub fn supports(&self, action: ControlAction) -> bool {
        match action {
            ControlAction::Home => self.home,
            ControlAction::Pause => self.pause,
            ControlAction::Resume => self.resume,
            ControlAction::Cancel => self.cancel,
        }
    }
}

/// Acknowledgement returned by a successful control action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionAck {
    pub status: String,
    pub action: ControlAction,
}

impl ActionAck {
    pub fn sent(action: ControlAction) -> Self {
        Self {
            status: "sent".to_string(),
            action,
        }
    }
}

/// A networked printer.
#[async_trait]
pub trait PrinterDriver: Send + Sync {
    /// Short backend name, also used as the registry `type`.
    fn kind(&self) -> &'static str;

    /// Optional actions this driver implements.
    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
    }

    /// Establish the device session. A no-op when already connected.
    async fn connect(&self) -> Result<(), DriverError>;

    /// Temperatures, phase token and error code.
    async fn status(&self) -> Result<RawStatus, DriverError>;

    /// Print progress in percent, if the device reports one.
    async fn percentage(&self) -> Result<Option<f64>, DriverError>;

    /// Currently loaded filament.
    async fn filament(&self) -> Result<FilamentReport, DriverError>;

    /// Run a control action. Drivers advertise support via [`capabilities`].
    ///
    /// [`capabilities`]: PrinterDriver::capabilities
    async fn perform(&self, action: ControlAction) -> Result<ActionAck, DriverError> {
        Err(DriverError::Unsupported(action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    #[async_trait]
    impl PrinterDriver for Bare {
        fn kind(&self) -> &'static str {
            "bare"
        }

        async fn connect(&self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn status(&self) -> Result<RawStatus, DriverError> {
            Ok(RawStatus::default())
        }

        async fn percentage(&self) -> Result<Option<f64>, DriverError> {
            Ok(None)
        }

        async fn filament(&self) -> Result<FilamentReport, DriverError> {
            Ok(FilamentReport::default())
        }
    }

    #[tokio::test]
    async fn test_default_perform_is_unsupported() {
        let driver = Bare;
        assert!(!driver.capabilities().supports(ControlAction::Pause));
        assert_eq!(
            driver.perform(ControlAction::Pause).await,
            Err(DriverError::Unsupported(ControlAction::Pause))
        );
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(ControlAction::parse("home"), Some(ControlAction::Home));
        assert_eq!(ControlAction::parse("CANCEL"), Some(ControlAction::Cancel));
        assert_eq!(ControlAction::parse("explode"), None);
    }

    #[test]
    fn test_capabilities() {
        let caps = Capabilities {
            pause: true,
            ..Capabilities::none()
        };
        assert!(caps.supports(ControlAction::Pause));
        assert!(!caps.supports(ControlAction::Home));
        assert!(ControlAction::ALL.iter().all(|a| Capabilities::all().supports(*a)));
    }
}
