//! Bambu Lab report schema and command payloads.
//!
//! Printers publish partial `print` objects on `device/<serial>/report`;
//! only the keys that changed are included. [`ReportCache`] merges them into
//! a running picture and [`PrintReport`] is the typed view the driver reads.
//! A key with an unexpected type only blanks that key; the filament facet
//! is the one place where a bad `vt_tray` is reported as malformed.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{ControlAction, DriverError, FilamentReport, RawStatus};

/// Stage code (`stg_cur`) to stage name.
pub fn stage_name(code: i64) -> Option<&'static str> {
    let name = match code {
        0 => "PRINTING",
        1 => "AUTO_BED_LEVELING",
        2 => "HEATBED_PREHEATING",
        3 => "SWEEPING_XY_MECH_MODE",
        4 => "CHANGING_FILAMENT",
        5 => "M400_PAUSE",
        6 => "PAUSED_FILAMENT_RUNOUT",
        7 => "HEATING_HOTEND",
        8 => "CALIBRATING_EXTRUSION",
        9 => "SCANNING_BED_SURFACE",
        10 => "INSPECTING_FIRST_LAYER",
        11 => "IDENTIFYING_BUILD_PLATE_TYPE",
        12 => "CALIBRATING_MICRO_LIDAR",
        13 => "HOMING_TOOLHEAD",
        14 => "CLEANING_NOZZLE_TIP",
        15 => "CHECKING_EXTRUSION_TEMPERATURE",
        16 => "PAUSED_USER",
        17 => "PAUSED_FRONT_COVER_FALLING",
        18 => "CALIBRATING_LIDAR",
        19 => "CALIBRATING_EXTRUSION_FLOW",
        20 => "PAUSED_NOZZLE_TEMPERATURE_MALFUNCTION",
        21 => "PAUSED_HEAT_BED_TEMPERATURE_MALFUNCTION",
        22 => "FILAMENT_UNLOADING",
        23 => "PAUSED_SKIPPED_STEP",
        24 => "FILAMENT_LOADING",
        25 => "CALIBRATING_MOTOR_NOISE",
        26 => "PAUSED_AMS_LOST",
        27 => "PAUSED_LOW_FAN_SPEED_HEAT_BREAK",
        28 => "PAUSED_CHAMBER_TEMPERATURE_CONTROL_ERROR",
        29 => "COOLING_CHAMBER",
        30 => "PAUSED_USER_GCODE",
        31 => "MOTOR_NOISE_SHOWOFF",
        32 => "PAUSED_NOZZLE_FILAMENT_COVERED_DETECTED",
        33 => "PAUSED_CUTTER_ERROR",
        34 => "PAUSED_FIRST_LAYER_ERROR",
        35 => "PAUSED_NOZZLE_CLOG",
        255 => "IDLE",
        _ => return None,
    };
    Some(name)
}

/// External spool holder.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VirtualTray {
    #[serde(default)]
    pub tray_type: Option<String>,
}

impl VirtualTray {
    pub fn tray_type(&self) -> Option<String> {
        self.tray_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

/// Typed view over the merged `print` object.
#[derive(Debug, Clone, Default)]
pub struct PrintReport {
    pub stg_cur: Option<i64>,
    pub gcode_state: Option<String>,
    pub mc_percent: Option<f64>,
    pub bed_temper: Option<f64>,
    pub nozzle_temper: Option<f64>,
    pub print_error: Option<i64>,
}

/// Read one key, treating a missing, null or mistyped value as absent.
fn field<T: DeserializeOwned>(print: &Map<String, Value>, key: &str) -> Option<T> {
    let value = print.get(key).filter(|v| !v.is_null())?;
    match T::deserialize(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            log::debug!("Ignoring malformed `{}` in report: {}", key, e);
            None
        }
    }
}

impl PrintReport {
    pub fn parse(print: &Map<String, Value>) -> Self {
        Self {
            stg_cur: field(print, "stg_cur"),
            gcode_state: field(print, "gcode_state"),
            mc_percent: field(print, "mc_percent"),
            bed_temper: field(print, "bed_temper"),
            nozzle_temper: field(print, "nozzle_temper"),
            print_error: field(print, "print_error"),
        }
    }

    /// Stage name for the current phase.
    ///
    /// A1/P1 firmware leaves `stg_cur` at 0 between jobs, so a zero stage
    /// only means printing while the gcode state says `RUNNING`.
    pub fn phase_token(&self) -> Option<String> {
        let stage = self.stg_cur?;
        if stage == 0 {
            if let Some(state) = self.gcode_state.as_deref() {
                if !state.eq_ignore_ascii_case("RUNNING") {
                    return Some("IDLE".to_string());
                }
            }
        }
        stage_name(stage).map(str::to_string)
    }

    pub fn raw_status(&self) -> RawStatus {
        RawStatus {
            phase_token: self.phase_token(),
            bed_temperature: self.bed_temper,
            nozzle_temperature: self.nozzle_temper,
            error_code: self.print_error,
        }
    }

}

/// Accumulates partial `print` reports.
#[derive(Debug, Default)]
pub struct ReportCache {
    print: Map<String, Value>,
    received: bool,
}

impl ReportCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one MQTT report payload. Returns whether it carried a `print` object.
    pub fn merge_payload(&mut self, payload: &[u8]) -> Result<bool, DriverError> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| DriverError::Malformed(e.to_string()))?;
        match value.get("print") {
            Some(Value::Object(print)) => {
                for (key, v) in print {
                    self.print.insert(key.clone(), v.clone());
                }
                self.received = true;
                Ok(true)
            }
            Some(_) => Err(DriverError::Malformed("`print` is not an object".to_string())),
            None => Ok(false),
        }
    }

    pub fn has_report(&self) -> bool {
        self.received
    }

    /// Typed view of everything merged so far. Fails until the first report.
    pub fn report(&self) -> Result<PrintReport, DriverError> {
        if !self.received {
            return Err(DriverError::NotConnected);
        }
        Ok(PrintReport::parse(&self.print))
    }

    /// External spool facet. A `vt_tray` that is not a tray object is
    /// reported as [`DriverError::Malformed`].
    pub fn filament(&self) -> Result<FilamentReport, DriverError> {
        if !self.received {
            return Err(DriverError::NotConnected);
        }
        let raw = self.print.get("vt_tray").cloned().unwrap_or(Value::Null);
        let tray = Option::<VirtualTray>::deserialize(&raw)
            .map_err(|e| DriverError::Malformed(format!("vt_tray: {}", e)))?;
        Ok(FilamentReport {
            tray_type: tray.and_then(|t| t.tray_type()),
            raw,
        })
    }
}

/// `pushall` request, answered with a full report.
pub fn push_all() -> Value {
    json!({
        "pushing": {
            "sequence_id": "0",
            "command": "pushall"
        }
    })
}

pub fn action_command(action: ControlAction) -> Value {
    match action {
        ControlAction::Home => json!({
            "print": {
                "sequence_id": "0",
                "command": "gcode_line",
                "param": "G28 \n"
            }
        }),
        ControlAction::Pause => print_command("pause"),
        ControlAction::Resume => print_command("resume"),
        ControlAction::Cancel => print_command("stop"),
    }
}

fn print_command(command: &str) -> Value {
    json!({
        "print": {
            "sequence_id": "0",
            "command": command
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_reports_merge() {
        let mut cache = ReportCache::new();
        assert!(!cache.has_report());

        let first = json!({"print": {"stg_cur": 2, "bed_temper": 41.5, "nozzle_temper": 30.0, "mc_percent": 0}});
        assert!(cache.merge_payload(first.to_string().as_bytes()).unwrap());

        let second = json!({"print": {"bed_temper": 58.0}});
        cache.merge_payload(second.to_string().as_bytes()).unwrap();

        let report = cache.report().unwrap();
        assert_eq!(report.bed_temper, Some(58.0));
        assert_eq!(report.nozzle_temper, Some(30.0));
        assert_eq!(report.phase_token().as_deref(), Some("HEATBED_PREHEATING"));
    }

    #[test]
    fn test_non_print_payload_ignored() {
        let mut cache = ReportCache::new();
        let info = json!({"info": {"command": "get_version"}});
        assert!(!cache.merge_payload(info.to_string().as_bytes()).unwrap());
        assert!(!cache.has_report());
        assert!(matches!(cache.report(), Err(DriverError::NotConnected)));
    }

    #[test]
    fn test_malformed_payloads() {
        let mut cache = ReportCache::new();
        assert!(matches!(
            cache.merge_payload(b"not json"),
            Err(DriverError::Malformed(_))
        ));

        let bad = json!({"print": {"stg_cur": 1, "mc_percent": "lots", "bed_temper": 60.0}});
        cache.merge_payload(bad.to_string().as_bytes()).unwrap();
        let report = cache.report().unwrap();
        assert_eq!(report.mc_percent, None);
        assert_eq!(report.bed_temper, Some(60.0));
        assert_eq!(report.phase_token().as_deref(), Some("AUTO_BED_LEVELING"));
    }

    #[test]
    fn test_bad_tray_only_breaks_filament() {
        let mut cache = ReportCache::new();
        let payload = json!({"print": {"stg_cur": 0, "gcode_state": "RUNNING", "mc_percent": 12, "vt_tray": "PLA"}});
        cache.merge_payload(payload.to_string().as_bytes()).unwrap();

        let status = cache.report().unwrap().raw_status();
        assert_eq!(status.phase_token.as_deref(), Some("PRINTING"));
        assert_eq!(cache.report().unwrap().mc_percent, Some(12.0));
        assert!(matches!(cache.filament(), Err(DriverError::Malformed(_))));

        let fixed = json!({"print": {"vt_tray": {"tray_type": "ABS"}}});
        cache.merge_payload(fixed.to_string().as_bytes()).unwrap();
        assert_eq!(cache.filament().unwrap().tray_type.as_deref(), Some("ABS"));
    }

    #[test]
    fn test_filament_before_first_report() {
        assert_eq!(ReportCache::new().filament(), Err(DriverError::NotConnected));
    }

    #[test]
    fn test_idle_stage_zero() {
        let report = PrintReport {
            stg_cur: Some(0),
            gcode_state: Some("FINISH".into()),
            ..Default::default()
        };
        assert_eq!(report.phase_token().as_deref(), Some("IDLE"));

        let report = PrintReport {
            stg_cur: Some(0),
            gcode_state: Some("RUNNING".into()),
            ..Default::default()
        };
        assert_eq!(report.phase_token().as_deref(), Some("PRINTING"));

        let report = PrintReport {
            stg_cur: Some(-1),
            ..Default::default()
        };
        assert_eq!(report.phase_token(), None);
    }

    #[test]
    fn test_tray_type() {
        let mut cache = ReportCache::new();
        let payload = json!({"print": {"vt_tray": {"id": "254", "tray_type": "PETG"}}});
        cache.merge_payload(payload.to_string().as_bytes()).unwrap();
        let filament = cache.filament().unwrap();
        assert_eq!(filament.tray_type.as_deref(), Some("PETG"));
        assert_eq!(filament.raw["id"], "254");

        let payload = json!({"print": {"vt_tray": {"tray_type": ""}}});
        cache.merge_payload(payload.to_string().as_bytes()).unwrap();
        assert_eq!(cache.filament().unwrap().tray_type, None);
    }

    #[test]
    fn test_action_commands() {
        assert_eq!(action_command(ControlAction::Pause)["print"]["command"], "pause");
        assert_eq!(action_command(ControlAction::Cancel)["print"]["command"], "stop");
        assert_eq!(action_command(ControlAction::Home)["print"]["command"], "gcode_line");
        assert!(push_all().get("pushing").is_some());
    }
}
