// PROFRUN POWER CONTROLLER TESTS
// RUNS AGAINST A FAKE /sys TREE IN A TEMP DIR. NO ROOT, NO REAL MSRS.
//
// EXCEPT host_turbo_round_trip, WHICH FLIPS THE REAL TURBO KNOB AND PUTS IT BACK.
// RUN: sudo cargo test --test power -- --ignored --test-threads=1

use std::fs;
use std::path::PathBuf;

use profrun::config::{Setpoint, Turbo};
use profrun::cpulist::CpuSet;
use profrun::power::{PowerController, PowerRequest, Setting};
use profrun::sysfs::Sysfs;

const NO_TURBO: &str = "/sys/devices/system/cpu/intel_pstate/no_turbo";
const PKG: &str = "/sys/class/powercap/intel-rapl:0";
const DRAM: &str = "/sys/class/powercap/intel-rapl:0/intel-rapl:0:0";
const CORE: &str = "/sys/class/powercap/intel-rapl:0/intel-rapl:0:1";

// ---------------------------------------------------------------------------
// FAKE TREE
// ---------------------------------------------------------------------------

struct FakeRoot {
    dir: PathBuf,
}

impl FakeRoot {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("profrun-power-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        Self { dir }
    }

    fn put(&self, host_path: &str, value: &str) {
        let path = self.dir.join(host_path.trim_start_matches('/'));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, value).unwrap();
    }

    fn get(&self, host_path: &str) -> String {
        fs::read_to_string(self.dir.join(host_path.trim_start_matches('/')))
            .unwrap()
            .trim()
            .to_string()
    }

    fn sys(&self) -> Sysfs {
        Sysfs::at(&self.dir)
    }

    // ONE SOCKET, DRAM + CORE SUBZONES, CORES 4-6 WITH cpufreq
    fn populate(&self) {
        self.put(NO_TURBO, "0");
        self.put(&format!("{}/name", PKG), "package-0");
        self.put(&format!("{}/enabled", PKG), "0");
        self.put(&format!("{}/constraint_0_power_limit_uw", PKG), "125000000");
        self.put(&format!("{}/name", DRAM), "dram");
        self.put(&format!("{}/constraint_0_power_limit_uw", DRAM), "0");
        self.put(&format!("{}/name", CORE), "core");
        self.put(&format!("{}/constraint_0_power_limit_uw", CORE), "0");
        for cpu in 4..=6 {
            let dir = format!("/sys/devices/system/cpu/cpu{}/cpufreq", cpu);
            self.put(&format!("{}/scaling_governor", dir), "powersave");
            self.put(&format!("{}/scaling_min_freq", dir), "800000");
            self.put(&format!("{}/scaling_max_freq", dir), "3500000");
        }
    }
}

impl Drop for FakeRoot {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn freq_file(cpu: u32, file: &str) -> String {
    format!("/sys/devices/system/cpu/cpu{}/cpufreq/{}", cpu, file)
}

fn request(turbo: Turbo, pkg: Setpoint, dram: Setpoint, freq: Setpoint) -> PowerRequest {
    PowerRequest { turbo, pkg_cap: pkg, dram_cap: dram, freq }
}

fn shield() -> CpuSet {
    CpuSet::from_cpus([5, 6])
}

// === FULL APPLY ===

#[test]
fn full_request_is_visible_in_read_back() {
    let root = FakeRoot::new("full");
    root.populate();
    let ctl = PowerController::new(root.sys(), shield());

    let out = ctl.apply(&request(
        Turbo::Off,
        Setpoint::Value(15.0),
        Setpoint::Value(5.0),
        Setpoint::Value(2.1),
    ));
    assert!(out.failures.is_empty(), "{:?}", out.failures);

    let state = ctl.read_back();
    assert_eq!(state.turbo, Some(false));
    assert_eq!(state.pkg_cap_w, Some(15.0));
    assert_eq!(state.dram_cap_w, Some(5.0));
    assert_eq!(state.cores.len(), 2);
    for core in &state.cores {
        assert_eq!(core.governor.as_deref(), Some("performance"));
        assert_eq!(core.min_khz, Some(2_100_000));
        assert_eq!(core.max_khz, Some(2_100_000));
    }

    assert_eq!(root.get(NO_TURBO), "1");
    assert_eq!(root.get(&format!("{}/enabled", PKG)), "1");
    assert_eq!(root.get(&format!("{}/constraint_0_power_limit_uw", PKG)), "15000000");
    // ONLY THE SUBZONE NAMED dram IS A DRAM CAP
    assert_eq!(root.get(&format!("{}/constraint_0_power_limit_uw", CORE)), "0");
}

#[test]
fn applying_twice_is_idempotent() {
    let root = FakeRoot::new("idem");
    root.populate();
    let ctl = PowerController::new(root.sys(), shield());
    let req = request(Turbo::On, Setpoint::Value(20.0), Setpoint::Disabled, Setpoint::Value(1.8));

    ctl.apply(&req);
    let first = ctl.read_back();
    ctl.apply(&req);
    let second = ctl.read_back();
    assert_eq!(first, second);
    assert_eq!(second.turbo, Some(true));
}

// === DISABLED SETTINGS ===

#[test]
fn disabled_caps_and_frequency_are_never_written() {
    let root = FakeRoot::new("disabled");
    root.populate();
    let ctl = PowerController::new(root.sys(), shield());

    let out = ctl.apply(&request(Turbo::Off, Setpoint::Disabled, Setpoint::Disabled, Setpoint::Disabled));
    assert!(out.failures.is_empty());
    // TURBO IS ALWAYS ENFORCED
    assert_eq!(out.writes, [NO_TURBO]);

    assert_eq!(root.get(&format!("{}/enabled", PKG)), "0");
    assert_eq!(root.get(&format!("{}/constraint_0_power_limit_uw", PKG)), "125000000");
    assert_eq!(root.get(&freq_file(5, "scaling_governor")), "powersave");
    assert_eq!(root.get(&freq_file(6, "scaling_max_freq")), "3500000");
}

// === MISSING INTERFACES ===

#[test]
fn missing_interfaces_are_recorded_not_fatal() {
    let root = FakeRoot::new("missing");
    let ctl = PowerController::new(root.sys(), shield());

    let out = ctl.apply(&request(
        Turbo::On,
        Setpoint::Value(15.0),
        Setpoint::Value(5.0),
        Setpoint::Value(2.0),
    ));
    assert!(out.writes.is_empty());
    assert!(out.failed(Setting::Turbo));
    assert!(out.failed(Setting::PackageCap));
    assert!(out.failed(Setting::DramCap));
    assert!(out.failed(Setting::FrequencyPin));

    let state = ctl.read_back();
    assert_eq!(state.turbo, None);
    assert_eq!(state.pkg_cap_w, None);
    assert_eq!(state.dram_cap_w, None);
    assert!(state.cores.iter().all(|c| c.governor.is_none() && c.max_khz.is_none()));
}

#[test]
fn dram_cap_without_dram_zone_fails_alone() {
    let root = FakeRoot::new("nodram");
    root.put(NO_TURBO, "0");
    root.put(&format!("{}/name", PKG), "package-0");
    root.put(&format!("{}/constraint_0_power_limit_uw", PKG), "0");
    let ctl = PowerController::new(root.sys(), shield());

    let out = ctl.apply(&request(Turbo::Off, Setpoint::Value(10.0), Setpoint::Value(3.0), Setpoint::Disabled));
    assert!(!out.failed(Setting::Turbo));
    assert!(!out.failed(Setting::PackageCap));
    assert!(out.failed(Setting::DramCap));
    assert_eq!(ctl.read_back().pkg_cap_w, Some(10.0));
}

#[test]
fn boost_is_the_turbo_fallback() {
    let root = FakeRoot::new("boost");
    root.put("/sys/devices/system/cpu/cpufreq/boost", "0");
    let ctl = PowerController::new(root.sys(), shield());

    let out = ctl.apply(&request(Turbo::On, Setpoint::Disabled, Setpoint::Disabled, Setpoint::Disabled));
    assert!(out.failures.is_empty());
    assert_eq!(root.get("/sys/devices/system/cpu/cpufreq/boost"), "1");
    assert_eq!(ctl.read_back().turbo, Some(true));
}

// === FREQUENCY PIN ===

#[test]
fn pin_covers_only_the_shielded_cores() {
    let root = FakeRoot::new("pinset");
    root.populate();
    let ctl = PowerController::new(root.sys(), shield());

    ctl.apply(&request(Turbo::Off, Setpoint::Disabled, Setpoint::Disabled, Setpoint::Value(2.4)));
    assert_eq!(root.get(&freq_file(4, "scaling_governor")), "powersave");
    assert_eq!(root.get(&freq_file(4, "scaling_max_freq")), "3500000");
    assert_eq!(root.get(&freq_file(5, "scaling_min_freq")), "2400000");
    assert_eq!(root.get(&freq_file(6, "scaling_min_freq")), "2400000");
}

#[test]
fn pin_orders_limits_to_avoid_min_above_max() {
    let root = FakeRoot::new("order");
    root.populate();
    // CPU 6 STARTS BELOW THE TARGET, CPU 5 ABOVE IT
    root.put(&freq_file(6, "scaling_max_freq"), "1000000");
    let ctl = PowerController::new(root.sys(), shield());

    let out = ctl.apply(&request(Turbo::Off, Setpoint::Disabled, Setpoint::Disabled, Setpoint::Value(2.0)));
    let cpu5: Vec<&String> = out.writes.iter().filter(|w| w.contains("/cpu5/")).collect();
    let cpu6: Vec<&String> = out.writes.iter().filter(|w| w.contains("/cpu6/")).collect();
    assert_eq!(
        cpu5,
        [
            &freq_file(5, "scaling_governor"),
            &freq_file(5, "scaling_min_freq"),
            &freq_file(5, "scaling_max_freq"),
        ]
    );
    assert_eq!(
        cpu6,
        [
            &freq_file(6, "scaling_governor"),
            &freq_file(6, "scaling_max_freq"),
            &freq_file(6, "scaling_min_freq"),
        ]
    );
}

// === HOST (ROOT ONLY) ===

// PUTS THE HOST TURBO KNOB BACK NO MATTER HOW THE TEST EXITS
struct TurboGuard {
    path: &'static str,
    saved: String,
}

impl Drop for TurboGuard {
    fn drop(&mut self) {
        let _ = Sysfs::host().write(self.path, &self.saved);
    }
}

#[test]
#[ignore]
fn host_turbo_round_trip() {
    let sys = Sysfs::host();
    let path = [NO_TURBO, "/sys/devices/system/cpu/cpufreq/boost"]
        .into_iter()
        .find(|p| sys.exists(p))
        .expect("NO TURBO INTERFACE ON THIS HOST");
    let _guard = TurboGuard { path, saved: sys.read(path).unwrap() };

    let ctl = PowerController::new(sys, CpuSet::from_cpus([0]));
    for turbo in [Turbo::Off, Turbo::On] {
        let out = ctl.apply(&request(turbo, Setpoint::Disabled, Setpoint::Disabled, Setpoint::Disabled));
        assert!(!out.failed(Setting::Turbo), "{:?}", out.failures);
        assert_eq!(ctl.read_back().turbo, Some(turbo == Turbo::On));
    }
}

#[test]
fn unwritable_governor_does_not_block_the_limits() {
    let root = FakeRoot::new("governor");
    root.populate();
    // A DIRECTORY WHERE THE GOVERNOR FILE SHOULD BE: EVERY WRITE TO IT FAILS
    let governor = freq_file(5, "scaling_governor");
    fs::remove_file(root.dir.join(governor.trim_start_matches('/'))).unwrap();
    fs::create_dir(root.dir.join(governor.trim_start_matches('/'))).unwrap();
    let ctl = PowerController::new(root.sys(), shield());

    let out = ctl.apply(&request(Turbo::Off, Setpoint::Disabled, Setpoint::Disabled, Setpoint::Value(2.0)));
    assert!(out.failed(Setting::FrequencyPin));
    assert_eq!(out.failures.len(), 1, "{:?}", out.failures);
    assert!(out.failures[0].1.contains("cpu5"));

    // cpu5 STILL GETS ITS LIMITS, cpu6 IS PINNED COMPLETELY
    assert!(!out.writes.contains(&governor));
    assert!(out.writes.contains(&freq_file(5, "scaling_min_freq")));
    assert!(out.writes.contains(&freq_file(5, "scaling_max_freq")));
    assert_eq!(root.get(&freq_file(5, "scaling_min_freq")), "2000000");
    assert_eq!(root.get(&freq_file(5, "scaling_max_freq")), "2000000");
    assert_eq!(root.get(&freq_file(6, "scaling_governor")), "performance");
    assert_eq!(root.get(&freq_file(6, "scaling_max_freq")), "2000000");
}
