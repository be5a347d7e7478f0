//! Per-device bookkeeping between ticks.

use std::time::Duration;

use tokio::time::Instant;

/// Round a progress sample for comparison and transmission.
/// Non-finite values are treated as absent; the rest are clamped to 0..=100.
pub(crate) fn round_percentage(raw: Option<f64>) -> Option<i64> {
    raw.filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 100.0).round() as i64)
}

/// Last-known values for one device. Owned and mutated only by the engine.
#[derive(Debug, Default)]
pub(crate) struct DeviceTickCache {
    pub last_percentage: Option<i64>,
    pub last_tray_type: Option<String>,
    /// `None` until the first successful filament sample.
    pub next_filament_check: Option<Instant>,
    /// Whether the last status fetch failed; keeps failure logging to transitions.
    pub status_failing: bool,
}

impl DeviceTickCache {
    /// Record a percentage sample. Returns whether it differs from the last one.
    pub fn observe_percentage(&mut self, percentage: Option<i64>) -> bool {
        let changed = percentage != self.last_percentage;
        self.last_percentage = percentage;
        changed
    }

    /// Filament is sampled once its deadline has passed, and on every tick
    /// until a tray type has been seen for this device.
    pub fn filament_due(&self, now: Instant) -> bool {
        self.last_tray_type.is_none() || self.next_filament_check.map_or(true, |at| now >= at)
    }

    pub fn filament_sampled(&mut self, now: Instant, interval: Duration) {
        self.next_filament_check = Some(now + interval);
    }

    /// Fold in a tray sample. Returns the value to transmit and whether it changed.
    /// An absent sample never replaces a known value.
    pub fn observe_tray_type(&mut self, sampled: Option<String>) -> (Option<String>, bool) {
        match sampled {
            Some(tray) if self.last_tray_type.as_deref() != Some(tray.as_str()) => {
                self.last_tray_type = Some(tray.clone());
                (Some(tray), true)
            }
            Some(tray) => (Some(tray), false),
            None => (self.last_tray_type.clone(), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_percentage() {
        assert_eq!(round_percentage(Some(45.4)), Some(45));
        assert_eq!(round_percentage(Some(45.6)), Some(46));
        assert_eq!(round_percentage(Some(120.0)), Some(100));
        assert_eq!(round_percentage(Some(-3.0)), Some(0));
        assert_eq!(round_percentage(Some(f64::NAN)), None);
        assert_eq!(round_percentage(None), None);
    }

    #[test]
    fn test_percentage_changes() {
        let mut cache = DeviceTickCache::default();
        assert!(cache.observe_percentage(Some(45)));
        assert!(!cache.observe_percentage(Some(45)));
        assert!(cache.observe_percentage(Some(46)));
        assert!(cache.observe_percentage(None));
        assert!(!cache.observe_percentage(None));
    }

    #[test]
    fn test_absent_first_percentage_unchanged() {
        let mut cache = DeviceTickCache::default();
        assert!(!cache.observe_percentage(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_filament_deadline() {
        let mut cache = DeviceTickCache::default();
        let start = Instant::now();
        assert!(cache.filament_due(start));

        cache.filament_sampled(start, Duration::from_secs(10));
        cache.observe_tray_type(Some("PLA".to_string()));

        assert!(!cache.filament_due(start + Duration::from_secs(5)));
        assert!(cache.filament_due(start + Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_filament_due_until_tray_seen() {
        let mut cache = DeviceTickCache::default();
        let start = Instant::now();
        cache.filament_sampled(start, Duration::from_secs(10));
        cache.observe_tray_type(None);
        assert!(cache.filament_due(start + Duration::from_secs(1)));
    }

    #[test]
    fn test_tray_type_retained() {
        let mut cache = DeviceTickCache::default();
        assert_eq!(cache.observe_tray_type(None), (None, false));
        assert_eq!(cache.observe_tray_type(Some("PLA".into())), (Some("PLA".into()), true));
        assert_eq!(cache.observe_tray_type(Some("PLA".into())), (Some("PLA".into()), false));
        assert_eq!(cache.observe_tray_type(None), (Some("PLA".into()), false));
        assert_eq!(cache.observe_tray_type(Some("PETG".into())), (Some("PETG".into()), true));
    }
}
