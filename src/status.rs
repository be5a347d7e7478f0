//! Status normalization
//!
//! Maps a driver's raw phase token onto the small, vendor-independent
//! vocabulary the UI understands. Classification is pure and total: every
//! token (or its absence) lands in exactly one [`CanonicalPhase`].

use serde::{Deserialize, Serialize};

use crate::driver::RawStatus;

/// Canonical printer phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalPhase {
    Idle,
    Preparing,
    Printing,
    Calibrating,
    FilamentChange,
    Paused,
    Cooling,
    Error,
    Unknown,
}

impl CanonicalPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalPhase::Idle => "idle",
            CanonicalPhase::Preparing => "preparing",
            CanonicalPhase::Printing => "printing",
            CanonicalPhase::Calibrating => "calibrating",
            CanonicalPhase::FilamentChange => "filament_change",
            CanonicalPhase::Paused => "paused",
            CanonicalPhase::Cooling => "cooling",
            CanonicalPhase::Error => "error",
            CanonicalPhase::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CanonicalPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heating, leveling, homing and the other steps a printer runs before the
/// first extrusion.
const PREPARATION_TOKENS: &[&str] = &[
    "HEATBED_PREHEATING",
    "HEATING_HOTEND",
    "AUTO_BED_LEVELING",
    "HOMING_TOOLHEAD",
    "INSPECTING_FIRST_LAYER",
    "SCANNING_BED_SURFACE",
    "IDENTIFYING_BUILD_PLATE_TYPE",
    "CLEANING_NOZZLE_TIP",
];

const FILAMENT_TOKENS: &[&str] = &["CHANGING_FILAMENT", "FILAMENT_LOADING", "FILAMENT_UNLOADING"];

const MANUAL_PAUSE_TOKEN: &str = "M400_PAUSE";

const COOLING_TOKEN: &str = "COOLING_CHAMBER";

/// Pauses the printer only enters because something went wrong.
const ERROR_PAUSE_TOKENS: &[&str] = &[
    "PAUSED_CUTTER_ERROR",
    "PAUSED_FIRST_LAYER_ERROR",
    "PAUSED_NOZZLE_CLOG",
    "PAUSED_NOZZLE_TEMPERATURE_MALFUNCTION",
    "PAUSED_HEAT_BED_TEMPERATURE_MALFUNCTION",
    "PAUSED_CHAMBER_TEMPERATURE_CONTROL_ERROR",
    "PAUSED_AMS_LOST",
];

/// Classify a raw phase token. Matching is case-insensitive.
///
/// Error pauses are checked ahead of the generic `PAUSED` prefix, since
/// every member of that set also carries the prefix.
pub fn classify(token: Option<&str>) -> CanonicalPhase {
    let token = match token {
        Some(t) => t.trim().to_ascii_uppercase(),
        None => return CanonicalPhase::Unknown,
    };
    let token = token.as_str();

    if token == "PRINTING" {
        CanonicalPhase::Printing
    } else if PREPARATION_TOKENS.contains(&token) {
        CanonicalPhase::Preparing
    } else if token.starts_with("CALIBRATING") {
        CanonicalPhase::Calibrating
    } else if FILAMENT_TOKENS.contains(&token) {
        CanonicalPhase::FilamentChange
    } else if ERROR_PAUSE_TOKENS.contains(&token) {
        CanonicalPhase::Error
    } else if token.starts_with("PAUSED") || token == MANUAL_PAUSE_TOKEN {
        CanonicalPhase::Paused
    } else if token == COOLING_TOKEN {
        CanonicalPhase::Cooling
    } else if token == "IDLE" {
        CanonicalPhase::Idle
    } else {
        CanonicalPhase::Unknown
    }
}

/// Classify a token and echo it back alongside the phase.
pub fn normalize(token: Option<&str>) -> (CanonicalPhase, Option<String>) {
    (classify(token), token.map(str::to_string))
}

/// Device status in the stable vocabulary pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedStatus {
    /// The driver's own phase token, untouched.
    pub print_status: Option<String>,
    pub phase: CanonicalPhase,
    pub bed_temperature: Option<f64>,
    pub nozzle_temperature: Option<f64>,
    pub error_code: Option<i64>,
    pub has_error: bool,
    /// Set only when the status could not be fetched at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NormalizedStatus {
    /// Normalize a raw driver report.
    ///
    /// A non-zero error code forces the phase to `error` after token
    /// classification; the two signals are independent and may disagree.
    pub fn from_raw(raw: &RawStatus) -> Self {
        let (token_phase, print_status) = normalize(raw.phase_token.as_deref());
        let has_error = matches!(raw.error_code, Some(code) if code != 0);
        let phase = if has_error { CanonicalPhase::Error } else { token_phase };

        Self {
            print_status,
            phase,
            bed_temperature: raw.bed_temperature,
            nozzle_temperature: raw.nozzle_temperature,
            error_code: raw.error_code,
            has_error,
            error: None,
        }
    }

    /// Status substituted when the device could not be queried.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            print_status: None,
            phase: CanonicalPhase::Error,
            bed_temperature: None,
            nozzle_temperature: None,
            error_code: None,
            has_error: true,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(token: Option<&str>, error_code: Option<i64>) -> RawStatus {
        RawStatus {
            phase_token: token.map(str::to_string),
            bed_temperature: Some(60.0),
            nozzle_temperature: Some(215.0),
            error_code,
        }
    }

    #[test]
    fn test_preparation_tokens() {
        for token in PREPARATION_TOKENS {
            assert_eq!(classify(Some(token)), CanonicalPhase::Preparing, "{}", token);
        }
    }

    #[test]
    fn test_calibrating_prefix() {
        for token in [
            "CALIBRATING_EXTRUSION",
            "CALIBRATING_MICRO_LIDAR",
            "CALIBRATING_LIDAR",
            "CALIBRATING_EXTRUSION_FLOW",
            "CALIBRATING_MOTOR_NOISE",
        ] {
            assert_eq!(classify(Some(token)), CanonicalPhase::Calibrating);
        }
    }

    #[test]
    fn test_simple_tokens() {
        assert_eq!(classify(Some("PRINTING")), CanonicalPhase::Printing);
        assert_eq!(classify(Some("IDLE")), CanonicalPhase::Idle);
        assert_eq!(classify(Some("COOLING_CHAMBER")), CanonicalPhase::Cooling);
        assert_eq!(classify(Some("FILAMENT_LOADING")), CanonicalPhase::FilamentChange);
        assert_eq!(classify(Some("CHANGING_FILAMENT")), CanonicalPhase::FilamentChange);
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(classify(Some("printing")), CanonicalPhase::Printing);
        assert_eq!(classify(Some("Homing_Toolhead")), CanonicalPhase::Preparing);
        assert_eq!(classify(Some("paused_user")), CanonicalPhase::Paused);
    }

    #[test]
    fn test_pauses() {
        assert_eq!(classify(Some("PAUSED_USER")), CanonicalPhase::Paused);
        assert_eq!(classify(Some("PAUSED_FILAMENT_RUNOUT")), CanonicalPhase::Paused);
        assert_eq!(classify(Some("M400_PAUSE")), CanonicalPhase::Paused);
        for token in ERROR_PAUSE_TOKENS {
            assert_eq!(classify(Some(token)), CanonicalPhase::Error, "{}", token);
        }
    }

    #[test]
    fn test_unknown_and_absent() {
        assert_eq!(classify(None), CanonicalPhase::Unknown);
        assert_eq!(classify(Some("")), CanonicalPhase::Unknown);
        assert_eq!(classify(Some("MOTOR_NOISE_SHOWOFF")), CanonicalPhase::Unknown);
        assert_eq!(classify(Some("PRINTING_FAST")), CanonicalPhase::Unknown);
    }

    #[test]
    fn test_normalize_echoes_token() {
        let (phase, token) = normalize(Some("HOMING_TOOLHEAD"));
        assert_eq!(phase, CanonicalPhase::Preparing);
        assert_eq!(token.as_deref(), Some("HOMING_TOOLHEAD"));
        assert_eq!(normalize(None), (CanonicalPhase::Unknown, None));
    }

    #[test]
    fn test_homing_without_error() {
        let status = NormalizedStatus::from_raw(&raw(Some("HOMING_TOOLHEAD"), Some(0)));
        assert_eq!(status.phase, CanonicalPhase::Preparing);
        assert!(!status.has_error);
        assert_eq!(status.print_status.as_deref(), Some("HOMING_TOOLHEAD"));
    }

    #[test]
    fn test_error_code_overrides_token() {
        let status = NormalizedStatus::from_raw(&raw(Some("PRINTING"), Some(4)));
        assert_eq!(status.phase, CanonicalPhase::Error);
        assert!(status.has_error);
        assert_eq!(status.error_code, Some(4));

        let status = NormalizedStatus::from_raw(&raw(None, Some(-1)));
        assert_eq!(status.phase, CanonicalPhase::Error);
        assert!(status.has_error);
    }

    #[test]
    fn test_absent_error_code_keeps_phase() {
        let status = NormalizedStatus::from_raw(&raw(Some("IDLE"), None));
        assert_eq!(status.phase, CanonicalPhase::Idle);
        assert!(!status.has_error);
    }

    #[test]
    fn test_wire_shape() {
        let status = NormalizedStatus::from_raw(&raw(Some("FILAMENT_UNLOADING"), Some(0)));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "filament_change");
        assert_eq!(json["print_status"], "FILAMENT_UNLOADING");
        assert_eq!(json["has_error"], false);
        assert!(json.get("error").is_none());

        let json = serde_json::to_value(NormalizedStatus::unavailable("timed out")).unwrap();
        assert_eq!(json["phase"], "error");
        assert_eq!(json["error"], "timed out");
        assert_eq!(json["has_error"], true);
    }
}
