//! Fan and telemetry collaborators.
//!
//! Only the console talks to these; the link core never does.

use std::sync::Mutex;

use sysinfo::{Components, Disks, System};

use crate::error::HardwareError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    Auto,
    Manual(u8),
}

pub trait FanController: Send + Sync {
    fn set_manual_speed(&self, percent: u8) -> Result<(), HardwareError>;
    fn set_auto_mode(&self);
    fn mode(&self) -> FanMode;
}

/// Fan controller for hosts without PWM wiring: records and logs the request.
#[derive(Debug)]
pub struct LoggingFan {
    mode: Mutex<FanMode>,
}

impl LoggingFan {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(FanMode::Auto),
        }
    }

    fn store(&self, mode: FanMode) {
        if let Ok(mut current) = self.mode.lock() {
            *current = mode;
        }
    }
}

impl Default for LoggingFan {
    fn default() -> Self {
        Self::new()
    }
}

impl FanController for LoggingFan {
    fn set_manual_speed(&self, percent: u8) -> Result<(), HardwareError> {
        if percent > 100 {
            return Err(HardwareError::InvalidSpeed(percent));
        }
        tracing::info!("Fan set to {}%", percent);
        self.store(FanMode::Manual(percent));
        Ok(())
    }

    fn set_auto_mode(&self) {
        tracing::info!("Fan set to auto");
        self.store(FanMode::Auto);
    }

    fn mode(&self) -> FanMode {
        self.mode.lock().map(|m| *m).unwrap_or(FanMode::Auto)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryStatus {
    pub cpu_percent: f32,
    pub ram_percent: f32,
    /// Hottest sensor reading, when the platform exposes any.
    pub temperature_c: Option<f32>,
    /// Used share of all mounted disks combined.
    pub disk_percent: Option<f32>,
}

pub trait Telemetry: Send + Sync {
    fn status(&self) -> TelemetryStatus;
}

pub struct SysTelemetry {
    system: Mutex<System>,
}

impl SysTelemetry {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta; prime it so the first reading is meaningful.
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry for SysTelemetry {
    fn status(&self) -> TelemetryStatus {
        let (cpu_percent, ram_percent) = match self.system.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu_usage();
                sys.refresh_memory();
                let total = sys.total_memory();
                let ram = if total == 0 {
                    0.0
                } else {
                    (sys.used_memory() as f64 / total as f64 * 100.0) as f32
                };
                (sys.global_cpu_usage(), ram)
            }
            Err(_) => (0.0, 0.0),
        };

        let components = Components::new_with_refreshed_list();
        let temperature_c = components
            .list()
            .iter()
            .filter_map(|c| Option::<f32>::from(c.temperature()))
            .filter(|t| t.is_finite())
            .reduce(f32::max);

        let disks = Disks::new_with_refreshed_list();
        let disk_percent = disk_usage(
            disks
                .list()
                .iter()
                .map(|d| (d.total_space(), d.available_space())),
        );

        TelemetryStatus {
            cpu_percent,
            ram_percent,
            temperature_c,
            disk_percent,
        }
    }
}

/// Combined used percentage over `(total, available)` byte pairs. `None`
/// when there is no capacity to measure.
fn disk_usage(disks: impl Iterator<Item = (u64, u64)>) -> Option<f32> {
    let (total, available) = disks.fold((0u64, 0u64), |(t, a), (total, available)| {
        (t.saturating_add(total), a.saturating_add(available.min(total)))
    });
    if total == 0 {
        return None;
    }
    Some(((total - available) as f64 / total as f64 * 100.0) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_fan_tracks_mode() {
        let fan = LoggingFan::new();
        assert_eq!(fan.mode(), FanMode::Auto);

        fan.set_manual_speed(40).unwrap();
        assert_eq!(fan.mode(), FanMode::Manual(40));

        fan.set_auto_mode();
        assert_eq!(fan.mode(), FanMode::Auto);
    }

    #[test]
    fn test_logging_fan_rejects_out_of_range_speed() {
        let fan = LoggingFan::new();
        fan.set_manual_speed(100).unwrap();

        let result = fan.set_manual_speed(101);

        assert_eq!(result, Err(HardwareError::InvalidSpeed(101)));
        assert_eq!(fan.mode(), FanMode::Manual(100));
    }

    #[test]
    fn test_sys_telemetry_reports_percentages() {
        let telemetry = SysTelemetry::new();

        let status = telemetry.status();

        assert!((0.0..=100.0).contains(&status.ram_percent));
        assert!(status.cpu_percent >= 0.0);
        if let Some(disk) = status.disk_percent {
            assert!((0.0..=100.0).contains(&disk), "disk {disk}");
        }
    }

    #[test]
    fn test_disk_usage_combines_disks() {
        let disks = [(1_000, 250), (3_000, 750)];

        let usage = disk_usage(disks.into_iter());

        assert_eq!(usage, Some(75.0));
    }

    #[test]
    fn test_disk_usage_without_capacity_is_unknown() {
        assert_eq!(disk_usage(std::iter::empty()), None);
        assert_eq!(disk_usage([(0, 0)].into_iter()), None);
    }
}
