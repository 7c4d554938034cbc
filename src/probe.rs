// PROFRUN CAPABILITY PROBES
// WHAT THE HARDWARE/KERNEL EXPOSES. SHARED BY THE SIDECAR MANAGER (SKIP A
// COLLECTOR WHOSE FEATURE IS ABSENT) AND THE --check PREFLIGHT.

use std::io::Read;
use std::process::Command;

use crate::sysfs::Sysfs;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    // CACHE / MEMORY-BANDWIDTH MONITORING (pqos)
    ResctrlMonitoring,
    // MODEL-SPECIFIC REGISTERS (turbostat, pcm)
    Msr,
    // RAPL POWERCAP ZONES
    Rapl,
}

impl Capability {
    pub fn label(self) -> &'static str {
        match self {
            Self::ResctrlMonitoring => "RESCTRL MONITORING",
            Self::Msr => "MSR DEVICE",
            Self::Rapl => "RAPL POWERCAP",
        }
    }

    // Ok(()) WHEN PRESENT, Err(REASON) WHEN NOT
    pub fn check(self, sys: &Sysfs) -> Result<(), String> {
        match self {
            Self::ResctrlMonitoring => {
                if sys.exists("/sys/fs/resctrl/info/L3_MON") {
                    return Ok(());
                }
                let flags = cpu_flags(sys);
                if flags.iter().any(|f| f == "cqm_mbm_total" || f == "cqm_llc") {
                    // PQOS CAN FALL BACK TO MSR ACCESS
                    return Ok(());
                }
                Err("no resctrl L3_MON and no cqm_llc/cqm_mbm_total cpu flags".into())
            }
            Self::Msr => {
                if sys.exists("/dev/cpu/0/msr") {
                    Ok(())
                } else {
                    Err("/dev/cpu/0/msr missing (modprobe msr)".into())
                }
            }
            Self::Rapl => {
                if sys.exists("/sys/class/powercap/intel-rapl:0") {
                    Ok(())
                } else {
                    Err("/sys/class/powercap/intel-rapl:0 missing".into())
                }
            }
        }
    }
}

// FLAGS OF THE FIRST PROCESSOR IN /proc/cpuinfo
pub fn cpu_flags(sys: &Sysfs) -> Vec<String> {
    let cpuinfo = sys.read("/proc/cpuinfo").unwrap_or_default();
    cpuinfo
        .lines()
        .find(|l| l.starts_with("flags"))
        .and_then(|l| l.split_once(':'))
        .map(|(_, v)| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

// /proc/config.gz CONTENT. None WHEN MISSING OR UNREADABLE.
pub fn kernel_config(sys: &Sysfs) -> Option<String> {
    let file = std::fs::File::open(sys.path("/proc/config.gz")).ok()?;
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    decoder.read_to_string(&mut config).ok()?;
    Some(config)
}

pub fn kernel_option_enabled(config: &str, option: &str) -> bool {
    let want_y = format!("{}=y", option);
    let want_m = format!("{}=m", option);
    config.lines().any(|l| l == want_y || l == want_m)
}

pub fn tool_available(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
