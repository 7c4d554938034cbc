// PROFRUN POWER / FREQUENCY CONTROLLER
// BEST-EFFORT: EVERY WRITE IS INDEPENDENT, A MISSING OR READ-ONLY INTERFACE IS
// LOGGED AND RECORDED, NEVER FATAL. THE TRUTH IS WHATEVER read_back() SEES
// AFTERWARDS, NOT WHAT WAS REQUESTED.
//
// INTERFACES (ALL UNDER THE Sysfs ROOT):
//   TURBO   /sys/devices/system/cpu/intel_pstate/no_turbo  (1 = TURBO OFF)
//           /sys/devices/system/cpu/cpufreq/boost          (1 = TURBO ON, FALLBACK)
//   CAPS    /sys/class/powercap/intel-rapl:N               (package-N zones)
//           /sys/class/powercap/intel-rapl:N/intel-rapl:N:M (name == dram)
//           constraint_0_power_limit_uw                    (MICROWATTS)
//   FREQ    /sys/devices/system/cpu/cpuN/cpufreq/scaling_{governor,min_freq,max_freq} (KHZ)

use std::fmt;

use anyhow::{bail, Result};
use tracing::{debug, info, warn};

use crate::config::{RunConfiguration, Setpoint, Turbo};
use crate::cpulist::CpuSet;
use crate::sysfs::Sysfs;

const NO_TURBO: &str = "/sys/devices/system/cpu/intel_pstate/no_turbo";
const BOOST: &str = "/sys/devices/system/cpu/cpufreq/boost";
const POWERCAP: &str = "/sys/class/powercap";
const LIMIT_FILE: &str = "constraint_0_power_limit_uw";
const PIN_GOVERNOR: &str = "performance";

// WHAT THE CONTROLLER ASKS FOR. DISABLED SETTINGS ARE NEVER WRITTEN.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PowerRequest {
    pub turbo: Turbo,
    pub pkg_cap: Setpoint,
    pub dram_cap: Setpoint,
    pub freq: Setpoint,
}

impl PowerRequest {
    pub fn from_config(cfg: &RunConfiguration) -> Self {
        Self {
            turbo: cfg.turbo,
            pkg_cap: cfg.pkg_cap,
            dram_cap: cfg.dram_cap,
            freq: cfg.freq,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Setting {
    Turbo,
    PackageCap,
    DramCap,
    FrequencyPin,
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Turbo => write!(f, "TURBO"),
            Self::PackageCap => write!(f, "PACKAGE CAP"),
            Self::DramCap => write!(f, "DRAM CAP"),
            Self::FrequencyPin => write!(f, "FREQUENCY PIN"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    // EVERY FILE SUCCESSFULLY WRITTEN, IN ORDER
    pub writes: Vec<String>,
    pub failures: Vec<(Setting, String)>,
}

impl ApplyOutcome {
    pub fn failed(&self, setting: Setting) -> bool {
        self.failures.iter().any(|(s, _)| *s == setting)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreFreq {
    pub cpu: u32,
    pub governor: Option<String>,
    pub min_khz: Option<u64>,
    pub max_khz: Option<u64>,
}

// OBSERVED HARDWARE STATE. None = INTERFACE NOT READABLE ON THIS HOST.
#[derive(Clone, Debug, PartialEq)]
pub struct PowerState {
    pub turbo: Option<bool>,
    pub pkg_cap_w: Option<f64>,
    pub dram_cap_w: Option<f64>,
    pub cores: Vec<CoreFreq>,
}

pub struct PowerController {
    sys: Sysfs,
    cpus: CpuSet,
}

impl PowerController {
    // `cpus` IS THE SHIELDED SET. THE FREQUENCY PIN COVERS EXACTLY THESE.
    pub fn new(sys: Sysfs, cpus: CpuSet) -> Self {
        Self { sys, cpus }
    }

    pub fn apply(&self, req: &PowerRequest) -> ApplyOutcome {
        let mut out = ApplyOutcome::default();

        let turbo = self.apply_turbo(req.turbo, &mut out.writes);
        record(&mut out, Setting::Turbo, turbo);

        if let Some(w) = req.pkg_cap.value() {
            let r = self.apply_cap(CapDomain::Package, w, &mut out.writes);
            record(&mut out, Setting::PackageCap, r);
        }
        if let Some(w) = req.dram_cap.value() {
            let r = self.apply_cap(CapDomain::Dram, w, &mut out.writes);
            record(&mut out, Setting::DramCap, r);
        }
        if let Some(ghz) = req.freq.value() {
            let khz = (ghz * 1_000_000.0).round() as u64;
            for cpu in self.cpus.iter() {
                let r = self.pin_core(cpu, khz, &mut out.writes);
                record(&mut out, Setting::FrequencyPin, r);
            }
        }
        out
    }

    fn write(&self, path: &str, value: &str, writes: &mut Vec<String>) -> Result<()> {
        self.sys.write(path, value)?;
        debug!("wrote {} -> {}", value, path);
        writes.push(path.to_string());
        Ok(())
    }

    fn apply_turbo(&self, turbo: Turbo, writes: &mut Vec<String>) -> Result<()> {
        let on = turbo == Turbo::On;
        if self.sys.exists(NO_TURBO) {
            self.write(NO_TURBO, if on { "0" } else { "1" }, writes)
        } else if self.sys.exists(BOOST) {
            self.write(BOOST, if on { "1" } else { "0" }, writes)
        } else {
            bail!("no intel_pstate/no_turbo or cpufreq/boost interface")
        }
    }

    // EVERY PACKAGE ZONE (ONE PER SOCKET), OR EVERY DRAM SUBZONE
    fn cap_zones(&self, domain: CapDomain) -> Vec<String> {
        let mut zones = Vec::new();
        for pkg in self.sys.list(POWERCAP) {
            // TOP-LEVEL ZONES ONLY: intel-rapl:N
            if !pkg.starts_with("intel-rapl:") || pkg.matches(':').count() != 1 {
                continue;
            }
            let pkg_dir = format!("{}/{}", POWERCAP, pkg);
            let name = self.sys.read(&format!("{}/name", pkg_dir)).unwrap_or_default();
            if !name.starts_with("package") {
                continue;
            }
            match domain {
                CapDomain::Package => zones.push(pkg_dir),
                CapDomain::Dram => {
                    for sub in self.sys.list(&pkg_dir) {
                        if !sub.starts_with(&format!("{}:", pkg)) {
                            continue;
                        }
                        let sub_dir = format!("{}/{}", pkg_dir, sub);
                        if self.sys.read(&format!("{}/name", sub_dir)).as_deref() == Some("dram") {
                            zones.push(sub_dir);
                        }
                    }
                }
            }
        }
        zones
    }

    fn apply_cap(&self, domain: CapDomain, watts: f64, writes: &mut Vec<String>) -> Result<()> {
        let zones = self.cap_zones(domain);
        if zones.is_empty() {
            bail!("no RAPL {} zone", domain.label());
        }
        let uw = (watts * 1_000_000.0).round() as u64;
        let mut errors = Vec::new();
        for zone in zones {
            let enabled = format!("{}/enabled", zone);
            if self.sys.exists(&enabled) {
                if let Err(e) = self.write(&enabled, "1", writes) {
                    errors.push(format!("{:#}", e));
                }
            }
            if let Err(e) = self.write(&format!("{}/{}", zone, LIMIT_FILE), &uw.to_string(), writes) {
                errors.push(format!("{:#}", e));
            }
        }
        if !errors.is_empty() {
            bail!(errors.join("; "));
        }
        Ok(())
    }

    // GOVERNOR, THEN MIN = MAX = TARGET. EACH OF THE THREE WRITES IS ATTEMPTED
    // EVEN IF AN EARLIER ONE FAILED. ORDER OF THE TWO LIMIT WRITES AVOIDS A
    // TRANSIENT min > max THE KERNEL WOULD REJECT.
    fn pin_core(&self, cpu: u32, khz: u64, writes: &mut Vec<String>) -> Result<()> {
        let dir = format!("/sys/devices/system/cpu/cpu{}/cpufreq", cpu);
        if !self.sys.exists(&dir) {
            bail!("cpu{}: no cpufreq interface", cpu);
        }
        let governor = format!("{}/scaling_governor", dir);
        let min = format!("{}/scaling_min_freq", dir);
        let max = format!("{}/scaling_max_freq", dir);
        let raising = self.sys.read_u64(&max).map(|cur| khz > cur).unwrap_or(true);
        let value = khz.to_string();
        let limits = if raising { [&max, &min] } else { [&min, &max] };

        let mut errors = Vec::new();
        if let Err(e) = self.write(&governor, PIN_GOVERNOR, writes) {
            errors.push(format!("{:#}", e));
        }
        for path in limits {
            if let Err(e) = self.write(path, &value, writes) {
                errors.push(format!("{:#}", e));
            }
        }
        if !errors.is_empty() {
            bail!("cpu{}: {}", cpu, errors.join("; "));
        }
        Ok(())
    }

    // ALWAYS RUNS, INDEPENDENT OF WHETHER apply() SUCCEEDED
    pub fn read_back(&self) -> PowerState {
        let turbo = match self.sys.read_u64(NO_TURBO) {
            Some(v) => Some(v == 0),
            None => self.sys.read_u64(BOOST).map(|v| v == 1),
        };
        let cap = |domain| {
            self.cap_zones(domain)
                .first()
                .and_then(|z| self.sys.read_u64(&format!("{}/{}", z, LIMIT_FILE)))
                .map(|uw| uw as f64 / 1_000_000.0)
        };
        let cores = self
            .cpus
            .iter()
            .map(|cpu| {
                let dir = format!("/sys/devices/system/cpu/cpu{}/cpufreq", cpu);
                CoreFreq {
                    cpu,
                    governor: self.sys.read(&format!("{}/scaling_governor", dir)),
                    min_khz: self.sys.read_u64(&format!("{}/scaling_min_freq", dir)),
                    max_khz: self.sys.read_u64(&format!("{}/scaling_max_freq", dir)),
                }
            })
            .collect();
        PowerState {
            turbo,
            pkg_cap_w: cap(CapDomain::Package),
            dram_cap_w: cap(CapDomain::Dram),
            cores,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum CapDomain {
    Package,
    Dram,
}

impl CapDomain {
    fn label(self) -> &'static str {
        match self {
            Self::Package => "package",
            Self::Dram => "dram",
        }
    }
}

fn record(out: &mut ApplyOutcome, setting: Setting, result: Result<()>) {
    match result {
        Ok(()) => info!("{} APPLIED", setting),
        Err(e) => {
            warn!("{} NOT APPLIED: {:#}", setting, e);
            out.failures.push((setting, format!("{:#}", e)));
        }
    }
}

// ---------------------------------------------------------------------------
// REPORT
// ---------------------------------------------------------------------------

fn or_na<T: fmt::Display>(v: &Option<T>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "n/a".to_string(),
    }
}

fn watts(v: Option<f64>) -> String {
    match v {
        Some(w) => format!("{:.1} W", w),
        None => "n/a".to_string(),
    }
}

pub fn print_request(req: &PowerRequest) {
    let show = |s: Setpoint, unit: &str| match s {
        Setpoint::Disabled => "disabled".to_string(),
        Setpoint::Value(v) => format!("{} {}", v, unit),
    };
    println!("REQUESTED:");
    println!("  TURBO:           {}", req.turbo);
    println!("  PACKAGE CAP:     {}", show(req.pkg_cap, "W"));
    println!("  DRAM CAP:        {}", show(req.dram_cap, "W"));
    println!("  FREQUENCY PIN:   {}", show(req.freq, "GHz"));
}

pub fn print_state(state: &PowerState, outcome: &ApplyOutcome) {
    println!("OBSERVED:");
    println!(
        "  TURBO:           {}",
        match state.turbo {
            Some(true) => "on",
            Some(false) => "off",
            None => "n/a",
        }
    );
    println!("  PACKAGE CAP:     {}", watts(state.pkg_cap_w));
    println!("  DRAM CAP:        {}", watts(state.dram_cap_w));
    println!("  {:<6} {:<14} {:>10} {:>10}", "CPU", "GOVERNOR", "MIN_KHZ", "MAX_KHZ");
    for c in &state.cores {
        println!(
            "  {:<6} {:<14} {:>10} {:>10}",
            c.cpu,
            or_na(&c.governor),
            or_na(&c.min_khz),
            or_na(&c.max_khz)
        );
    }
    for (setting, reason) in &outcome.failures {
        println!("  NOT APPLIED:     {} ({})", setting, reason);
    }
}
