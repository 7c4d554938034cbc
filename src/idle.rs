// PROFRUN IDLE-WAIT GATE
// RUNS BEFORE EVERY STAGE SO THERMAL HISTORY FROM THE PREVIOUS STAGE DOES NOT
// BIAS THE NEXT ONE.
//
//   1. SLEEP THE MINIMUM DWELL (ALWAYS)
//   2. SENSOR READABLE: POLL UNTIL TEMP <= TARGET OR TOTAL ELAPSED >= TIMEOUT
//   3. SENSOR MISSING: DWELL ALONE
//
// EVERY SLEEP IS SLICED SO A CANCEL REQUEST (CTRL+C) ENDS THE WAIT WITHIN
// CANCEL_POLL.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::sysfs::Sysfs;

const CANCEL_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IdleSettings {
    pub min_dwell: Duration,
    pub target_celsius: f64,
    pub timeout: Duration,
    pub poll: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleStop {
    ThresholdReached,
    Timeout,
    SensorUnavailable,
    Interrupted,
}

impl fmt::Display for IdleStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThresholdReached => write!(f, "THRESHOLD REACHED"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::SensorUnavailable => write!(f, "SENSOR UNAVAILABLE"),
            Self::Interrupted => write!(f, "INTERRUPTED"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct IdleReport {
    pub elapsed: Duration,
    pub reason: IdleStop,
    pub last_celsius: Option<f64>,
}

pub trait ThermalSensor {
    fn read_celsius(&mut self) -> Option<f64>;
}

// ---------------------------------------------------------------------------
// HOST SENSOR
// ---------------------------------------------------------------------------

// PACKAGE TEMPERATURE. PREFERS hwmon coretemp "Package id 0", FALLS BACK TO
// THE x86_pkg_temp THERMAL ZONE. RESOLVED ONCE, READ MANY TIMES.
pub struct PackageSensor {
    sys: Sysfs,
    input: Option<String>,
}

impl PackageSensor {
    pub fn discover(sys: &Sysfs) -> Self {
        let input = find_hwmon_package(sys).or_else(|| find_thermal_zone(sys));
        match &input {
            Some(path) => debug!("package temperature sensor: {}", path),
            None => debug!("no package temperature sensor found"),
        }
        Self { sys: sys.clone(), input }
    }

    pub fn is_available(&self) -> bool {
        self.input.is_some()
    }
}

fn find_hwmon_package(sys: &Sysfs) -> Option<String> {
    for hwmon in sys.list("/sys/class/hwmon") {
        let dir = format!("/sys/class/hwmon/{}", hwmon);
        for file in sys.list(&dir) {
            let Some(base) = file.strip_suffix("_label") else {
                continue;
            };
            if !base.starts_with("temp") {
                continue;
            }
            let label = sys.read(&format!("{}/{}", dir, file)).unwrap_or_default();
            if label.starts_with("Package id 0") {
                let input = format!("{}/{}_input", dir, base);
                if sys.exists(&input) {
                    return Some(input);
                }
            }
        }
    }
    None
}

fn find_thermal_zone(sys: &Sysfs) -> Option<String> {
    sys.list("/sys/class/thermal")
        .into_iter()
        .filter(|zone| zone.starts_with("thermal_zone"))
        .map(|zone| format!("/sys/class/thermal/{}", zone))
        .find(|dir| sys.read(&format!("{}/type", dir)).as_deref() == Some("x86_pkg_temp"))
        .map(|dir| format!("{}/temp", dir))
}

impl ThermalSensor for PackageSensor {
    fn read_celsius(&mut self) -> Option<f64> {
        let input = self.input.as_ref()?;
        // MILLIDEGREES
        let milli: i64 = self.sys.read(input)?.parse().ok()?;
        Some(milli as f64 / 1000.0)
    }
}

// ---------------------------------------------------------------------------
// GATE
// ---------------------------------------------------------------------------

pub struct IdleGate<S: ThermalSensor> {
    settings: IdleSettings,
    sensor: S,
}

impl<S: ThermalSensor> IdleGate<S> {
    pub fn new(settings: IdleSettings, sensor: S) -> Self {
        Self { settings, sensor }
    }

    // `cancelled` IS CHECKED BETWEEN SLEEP SLICES AND BEFORE EVERY READING
    pub fn wait_idle(&mut self, cancelled: impl Fn() -> bool) -> IdleReport {
        let s = self.settings;
        let start = Instant::now();
        let interrupted = |last| IdleReport {
            elapsed: start.elapsed(),
            reason: IdleStop::Interrupted,
            last_celsius: last,
        };
        if nap(s.min_dwell, &cancelled) {
            return interrupted(None);
        }

        let mut last = None;
        loop {
            if cancelled() {
                return interrupted(last);
            }
            let temp = match self.sensor.read_celsius() {
                Some(t) => t,
                None => {
                    return IdleReport {
                        elapsed: start.elapsed(),
                        reason: IdleStop::SensorUnavailable,
                        last_celsius: last,
                    }
                }
            };
            last = Some(temp);
            debug!("idle wait: {:.1}C (target {:.1}C)", temp, s.target_celsius);

            if temp <= s.target_celsius {
                return IdleReport {
                    elapsed: start.elapsed(),
                    reason: IdleStop::ThresholdReached,
                    last_celsius: last,
                };
            }

            let elapsed = start.elapsed();
            if elapsed >= s.timeout {
                return IdleReport {
                    elapsed,
                    reason: IdleStop::Timeout,
                    last_celsius: last,
                };
            }
            if nap(s.poll.min(s.timeout - elapsed), &cancelled) {
                return interrupted(last);
            }
        }
    }
}

// SLEEP `total` IN CANCEL_POLL SLICES. TRUE IF CANCELLED BEFORE THE END.
fn nap(total: Duration, cancelled: &impl Fn() -> bool) -> bool {
    let end = Instant::now() + total;
    loop {
        if cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= end {
            return false;
        }
        std::thread::sleep(CANCEL_POLL.min(end - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(Vec<Option<f64>>);

    impl ThermalSensor for Scripted {
        fn read_celsius(&mut self) -> Option<f64> {
            if self.0.len() > 1 {
                self.0.remove(0)
            } else {
                self.0.first().copied().flatten()
            }
        }
    }

    fn settings(dwell_ms: u64, timeout_ms: u64) -> IdleSettings {
        IdleSettings {
            min_dwell: Duration::from_millis(dwell_ms),
            target_celsius: 45.0,
            timeout: Duration::from_millis(timeout_ms),
            poll: Duration::from_millis(5),
        }
    }

    #[test]
    fn no_sensor_relies_on_dwell() {
        let mut gate = IdleGate::new(settings(30, 1_000), Scripted(vec![None]));
        let r = gate.wait_idle(|| false);
        assert_eq!(r.reason, IdleStop::SensorUnavailable);
        assert!(r.elapsed >= Duration::from_millis(30));
        assert!(r.last_celsius.is_none());
    }

    #[test]
    fn cools_down_to_threshold() {
        let temps = vec![Some(80.0), Some(60.0), Some(45.0)];
        let mut gate = IdleGate::new(settings(0, 5_000), Scripted(temps));
        let r = gate.wait_idle(|| false);
        assert_eq!(r.reason, IdleStop::ThresholdReached);
        assert_eq!(r.last_celsius, Some(45.0));
    }

    #[test]
    fn hot_sensor_times_out() {
        let mut gate = IdleGate::new(settings(10, 60), Scripted(vec![Some(95.0)]));
        let r = gate.wait_idle(|| false);
        assert_eq!(r.reason, IdleStop::Timeout);
        assert!(r.elapsed >= Duration::from_millis(60));
        assert!(r.elapsed < Duration::from_millis(1_000));
    }

    #[test]
    fn already_cool_stops_after_dwell() {
        let mut gate = IdleGate::new(settings(20, 5_000), Scripted(vec![Some(30.0)]));
        let r = gate.wait_idle(|| false);
        assert_eq!(r.reason, IdleStop::ThresholdReached);
        assert!(r.elapsed >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_cuts_the_dwell_short() {
        let mut gate = IdleGate::new(settings(10_000, 20_000), Scripted(vec![Some(30.0)]));
        let start = Instant::now();
        let r = gate.wait_idle(|| start.elapsed() >= Duration::from_millis(50));
        assert_eq!(r.reason, IdleStop::Interrupted);
        assert!(r.elapsed < Duration::from_secs(2));
        assert!(r.last_celsius.is_none());
    }

    #[test]
    fn cancel_during_cooldown_keeps_last_reading() {
        let mut gate = IdleGate::new(settings(0, 20_000), Scripted(vec![Some(90.0)]));
        let start = Instant::now();
        let r = gate.wait_idle(|| start.elapsed() >= Duration::from_millis(40));
        assert_eq!(r.reason, IdleStop::Interrupted);
        assert_eq!(r.last_celsius, Some(90.0));
        assert!(r.elapsed < Duration::from_secs(2));
    }

    #[test]
    fn missing_tree_has_no_sensor() {
        let sensor = PackageSensor::discover(&Sysfs::at("/nonexistent-profrun-root"));
        assert!(!sensor.is_available());
    }
}
