//! Daily detection window in local time.

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveTime, Timelike};

use crate::config::DetectionSettings;

/// Window during which detection runs. `start > end` wraps past midnight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectionSchedule {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl DetectionSchedule {
    pub fn parse(enabled: bool, start: &str, end: &str) -> Result<Self> {
        Ok(Self {
            enabled,
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
        })
    }

    /// Disabled schedules contain every time of day.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if !self.enabled {
            return true;
        }
        let t = time.with_nanosecond(0).unwrap_or(time);
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }

    pub fn describe(&self) -> String {
        format!("{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

impl Default for DetectionSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
        }
    }
}

fn parse_hhmm(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| anyhow!("invalid schedule time '{}' (expected HH:MM): {}", value, e))
}

/// Whether the detector should run at local time `now`.
pub fn detection_allowed(settings: &DetectionSettings, now: NaiveTime) -> bool {
    settings.detection_enabled && settings.schedule.contains(now)
}

pub fn detection_allowed_now(settings: &DetectionSettings) -> bool {
    detection_allowed(settings, Local::now().time())
}
