//! In-process printer simulator
//!
//! A scriptable [`PrinterDriver`] used by the test suite and by registry
//! entries of type `simulated`, so the server can be exercised without
//! hardware. Every facet can be told to fail or stall, and each call is
//! counted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    ActionAck, Capabilities, ControlAction, DriverError, FilamentReport, PrinterDriver, RawStatus,
};

/// Facets a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facet {
    Status,
    Percentage,
    Filament,
}

/// Scripted device state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatedState {
    #[serde(default)]
    pub phase_token: Option<String>,
    #[serde(default)]
    pub bed_temperature: Option<f64>,
    #[serde(default)]
    pub nozzle_temperature: Option<f64>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub tray_type: Option<String>,
}

impl SimulatedState {
    pub fn idle() -> Self {
        Self {
            phase_token: Some("IDLE".to_string()),
            bed_temperature: Some(24.0),
            nozzle_temperature: Some(26.0),
            error_code: Some(0),
            percentage: Some(0.0),
            tray_type: Some("PLA".to_string()),
        }
    }
}

#[derive(Default)]
struct Faults {
    status: Option<DriverError>,
    percentage: Option<DriverError>,
    filament: Option<DriverError>,
}

impl Faults {
    fn slot(&mut self, facet: Facet) -> &mut Option<DriverError> {
        match facet {
            Facet::Status => &mut self.status,
            Facet::Percentage => &mut self.percentage,
            Facet::Filament => &mut self.filament,
        }
    }
}

#[derive(Default)]
struct CallCounts {
    connect: AtomicUsize,
    status: AtomicUsize,
    percentage: AtomicUsize,
    filament: AtomicUsize,
}

pub struct SimulatedPrinter {
    state: Mutex<SimulatedState>,
    faults: Mutex<Faults>,
    latency: Mutex<Duration>,
    capabilities: Capabilities,
    calls: CallCounts,
}

impl SimulatedPrinter {
    pub fn new(state: SimulatedState) -> Arc<Self> {
        Arc::new(Self::with_capabilities(state, Capabilities::all()))
    }

    pub fn with_capabilities(state: SimulatedState, capabilities: Capabilities) -> Self {
        Self {
            state: Mutex::new(state),
            faults: Mutex::new(Faults::default()),
            latency: Mutex::new(Duration::ZERO),
            capabilities,
            calls: CallCounts::default(),
        }
    }

    /// Apply a change to the scripted state.
    pub fn update(&self, f: impl FnOnce(&mut SimulatedState)) {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
    }

    pub fn state(&self) -> SimulatedState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Make every call to `facet` fail with `error` until cleared.
    pub fn fail(&self, facet: Facet, error: DriverError) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults.slot(facet) = Some(error);
        }
    }

    pub fn clear_fault(&self, facet: Facet) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults.slot(facet) = None;
        }
    }

    /// Delay applied to every facet call.
    /// Uses tokio time, so paused test clocks advance instantly.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    pub fn connect_calls(&self) -> usize {
        self.calls.connect.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.calls.status.load(Ordering::SeqCst)
    }

    pub fn percentage_calls(&self) -> usize {
        self.calls.percentage.load(Ordering::SeqCst)
    }

    pub fn filament_calls(&self) -> usize {
        self.calls.filament.load(Ordering::SeqCst)
    }

    async fn enter(&self, facet: Facet) -> Result<SimulatedState, DriverError> {
        let latency = self.latency.lock().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let fault = self.faults.lock().ok().and_then(|mut f| f.slot(facet).clone());
        match fault {
            Some(error) => Err(error),
            None => Ok(self.state()),
        }
    }
}

#[async_trait]
impl PrinterDriver for SimulatedPrinter {
    fn kind(&self) -> &'static str {
        "simulated"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn connect(&self) -> Result<(), DriverError> {
        self.calls.connect.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self) -> Result<RawStatus, DriverError> {
        self.calls.status.fetch_add(1, Ordering::SeqCst);
        let state = self.enter(Facet::Status).await?;
        Ok(RawStatus {
            phase_token: state.phase_token,
            bed_temperature: state.bed_temperature,
            nozzle_temperature: state.nozzle_temperature,
            error_code: state.error_code,
        })
    }

    async fn percentage(&self) -> Result<Option<f64>, DriverError> {
        self.calls.percentage.fetch_add(1, Ordering::SeqCst);
        Ok(self.enter(Facet::Percentage).await?.percentage)
    }

    async fn filament(&self) -> Result<FilamentReport, DriverError> {
        self.calls.filament.fetch_add(1, Ordering::SeqCst);
        let state = self.enter(Facet::Filament).await?;
        Ok(FilamentReport {
            raw: json!({ "tray_type": state.tray_type.clone().unwrap_or_default() }),
            tray_type: state.tray_type,
        })
    }

    async fn perform(&self, action: ControlAction) -> Result<ActionAck, DriverError> {
        if !self.capabilities.supports(action) {
            return Err(DriverError::Unsupported(action));
        }
        let token = match action {
            ControlAction::Home => "HOMING_TOOLHEAD",
            ControlAction::Pause => "PAUSED_USER",
            ControlAction::Resume => "PRINTING",
            ControlAction::Cancel => "IDLE",
        };
        self.update(|state| state.phase_token = Some(token.to_string()));
        Ok(ActionAck::sent(action))
    }
}
