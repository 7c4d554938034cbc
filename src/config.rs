// PROFRUN CONFIGURATION RESOLVER
// RAW ARGUMENTS -> IMMUTABLE RunConfiguration. PURE: TOUCHES NO HOST STATE.
//
// USAGE ERRORS (UNKNOWN FLAG, BAD ENUMERATED VALUE) ARE REPORTED BY CLAP
// BEFORE ANYTHING ELSE RUNS. CROSS-FIELD CHECKS HAPPEN IN Cli::resolve().

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, ValueEnum};
use regex::Regex;

use crate::cpulist::CpuSet;
use crate::idle::IdleSettings;
use crate::stage::{ProfilerStage, StageId};

// IDLE GATE DEFAULTS
pub const DEFAULT_IDLE_MIN_SECS: u64 = 30;
pub const DEFAULT_IDLE_TEMP_C: f64 = 50.0;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const IDLE_POLL: Duration = Duration::from_secs(2);

// SAMPLING INTERVAL DEFAULT FOR PCM, PQOS AND TURBOSTAT
pub const DEFAULT_INTERVAL_SECS: f64 = 0.5;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Turbo {
    On,
    Off,
}

impl fmt::Display for Turbo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

// A NUMERIC TARGET OR THE "disabled" SENTINEL (NO WRITE AT ALL)
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Setpoint {
    Disabled,
    Value(f64),
}

impl Setpoint {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Disabled => None,
            Self::Value(v) => Some(v),
        }
    }
}

fn setpoint_regex(unit: &str) -> Regex {
    Regex::new(&format!(r"(?i)^\s*([0-9]+(?:\.[0-9]+)?)\s*(?:{})?\s*$", unit))
        .expect("static setpoint pattern")
}

fn parse_setpoint(raw: &str, re: &Regex, what: &str) -> Result<Setpoint, String> {
    let lowered = raw.trim().to_ascii_lowercase();
    if lowered == "disabled" || lowered == "off" {
        return Ok(Setpoint::Disabled);
    }
    let value = re
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| format!("expected {} or 'disabled', got '{}'", what, raw))?;
    if value <= 0.0 {
        return Err(format!("{} must be positive, got '{}'", what, raw));
    }
    Ok(Setpoint::Value(value))
}

// "15", "15W", "12.5 watts", "DISABLED"
pub fn parse_watts(raw: &str) -> Result<Setpoint, String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    parse_setpoint(raw, RE.get_or_init(|| setpoint_regex("w|watts?")), "watts")
}

// "2.4", "2.4GHz", "OFF"
pub fn parse_ghz(raw: &str) -> Result<Setpoint, String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    parse_setpoint(raw, RE.get_or_init(|| setpoint_regex("ghz")), "GHz")
}

fn parse_interval(raw: &str) -> Result<f64, String> {
    match raw.trim().parse::<f64>() {
        Ok(v) if v > 0.0 && v.is_finite() => Ok(v),
        _ => Err(format!("expected a positive number of seconds, got '{}'", raw)),
    }
}

// COLLABORATOR BINARIES. OVERRIDABLE FOR NON-STANDARD INSTALLS.
// EXPLICIT ids: sde, pcm, pcm_* ARE ALREADY TAKEN BY THE STAGE FLAGS.
#[derive(Args, Clone, Debug)]
pub struct Tools {
    #[arg(id = "cset_bin", long = "cset-bin", env = "CSET", default_value = "cset", hide = true)]
    pub cset: String,

    #[arg(id = "taskset_bin", long = "taskset-bin", env = "TASKSET", default_value = "taskset", hide = true)]
    pub taskset: String,

    #[arg(id = "toplev_bin", long = "toplev-bin", env = "TOPLEV", default_value = "toplev", hide = true)]
    pub toplev: String,

    #[arg(id = "sde_bin", long = "sde-bin", env = "SDE", default_value = "sde64", hide = true)]
    pub sde: String,

    #[arg(id = "pcm_bin", long = "pcm-bin", env = "PCM", default_value = "pcm", hide = true)]
    pub pcm: String,

    #[arg(id = "pcm_memory_bin", long = "pcm-memory-bin", env = "PCM_MEMORY", default_value = "pcm-memory", hide = true)]
    pub pcm_memory: String,

    #[arg(id = "pcm_power_bin", long = "pcm-power-bin", env = "PCM_POWER", default_value = "pcm-power", hide = true)]
    pub pcm_power: String,

    #[arg(id = "pcm_pcie_bin", long = "pcm-pcie-bin", env = "PCM_PCIE", default_value = "pcm-pcie", hide = true)]
    pub pcm_pcie: String,

    #[arg(id = "pqos_bin", long = "pqos-bin", env = "PQOS", default_value = "pqos", hide = true)]
    pub pqos: String,

    #[arg(id = "turbostat_bin", long = "turbostat-bin", env = "TURBOSTAT", default_value = "turbostat", hide = true)]
    pub turbostat: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            cset: "cset".into(),
            taskset: "taskset".into(),
            toplev: "toplev".into(),
            sde: "sde64".into(),
            pcm: "pcm".into(),
            pcm_memory: "pcm-memory".into(),
            pcm_power: "pcm-power".into(),
            pcm_pcie: "pcm-pcie".into(),
            pqos: "pqos".into(),
            turbostat: "turbostat".into(),
        }
    }
}

impl Tools {
    pub fn all(&self) -> [&str; 10] {
        [
            &self.cset,
            &self.taskset,
            &self.toplev,
            &self.sde,
            &self.pcm,
            &self.pcm_memory,
            &self.pcm_power,
            &self.pcm_pcie,
            &self.pqos,
            &self.turbostat,
        ]
    }
}

#[derive(Parser, Debug)]
#[command(name = "profrun")]
#[command(about = "PROFRUN -- ISOLATED MULTI-TOOL MICROARCHITECTURE PROFILING RUNS")]
#[command(after_help = "WITH NO STAGE FLAG AND NO PRESET, EVERY STAGE RUNS.")]
pub struct Cli {
    /// toplev level 1 (low-overhead top-down breakdown)
    #[arg(long)]
    pub toplev_basic: bool,

    /// toplev execution-pipeline nodes (level 3)
    #[arg(long)]
    pub toplev_execution: bool,

    /// toplev level 6, all counters
    #[arg(long)]
    pub toplev_full: bool,

    /// Intel SDE instruction-mix emulation
    #[arg(long)]
    pub sde: bool,

    /// pcm core counters
    #[arg(long)]
    pub pcm: bool,

    /// pcm-memory bandwidth
    #[arg(long)]
    pub pcm_memory: bool,

    /// pcm-power, with pqos and turbostat sidecars
    #[arg(long)]
    pub pcm_power: bool,

    /// pcm-pcie IO bandwidth
    #[arg(long)]
    pub pcm_pcie: bool,

    /// preset: toplev-basic, toplev-execution, pcm-power
    #[arg(long)]
    pub short: bool,

    /// preset: every stage
    #[arg(long)]
    pub long: bool,

    /// turbo boost target state
    #[arg(long, value_enum, ignore_case = true, default_value_t = Turbo::Off)]
    pub turbo: Turbo,

    /// package power cap in watts, or 'disabled'
    #[arg(long, value_parser = parse_watts, default_value = "disabled")]
    pub cpu_cap: Setpoint,

    /// DRAM power cap in watts, or 'disabled'
    #[arg(long, value_parser = parse_watts, default_value = "disabled")]
    pub dram_cap: Setpoint,

    /// pin shielded cores to this frequency in GHz, or 'disabled'
    #[arg(long, value_parser = parse_ghz, default_value = "disabled")]
    pub freq: Setpoint,

    /// debug logging
    #[arg(long)]
    pub debug: bool,

    /// check collaborators and host interfaces, then exit
    #[arg(long)]
    pub check: bool,

    /// results directory
    #[arg(long, env = "OUTDIR", default_value = "results")]
    pub outdir: PathBuf,

    /// prefix for every artifact in the results directory
    #[arg(long, env = "IDTAG", default_value = "id_X")]
    pub idtag: String,

    /// core the profiling tool is pinned to
    #[arg(long, default_value_t = 5)]
    pub tool_cpu: u32,

    /// core the workload is pinned to
    #[arg(long, env = "WORKLOAD_CPU", default_value_t = 6)]
    pub workload_cpu: u32,

    /// move kernel threads off the shielded cores too (default: they may stay)
    #[arg(long)]
    pub move_kthreads: bool,

    /// minimum idle dwell before each stage, seconds
    #[arg(long, default_value_t = DEFAULT_IDLE_MIN_SECS)]
    pub idle_min_secs: u64,

    /// package temperature to wait for before each stage, celsius
    #[arg(long, default_value_t = DEFAULT_IDLE_TEMP_C)]
    pub idle_temp: f64,

    /// give up waiting for the temperature after this many seconds
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout_secs: u64,

    /// pcm sampling interval, seconds
    #[arg(long, env = "PCM_POWER_INTERVAL_SEC", value_parser = parse_interval, default_value_t = DEFAULT_INTERVAL_SECS)]
    pub pcm_interval: f64,

    /// pqos sampling interval, seconds [default: the pcm interval]
    #[arg(long, env = "PQOS_INTERVAL_SEC", value_parser = parse_interval)]
    pub pqos_interval: Option<f64>,

    /// turbostat sampling interval, seconds
    #[arg(long, env = "TS_INTERVAL", value_parser = parse_interval, default_value_t = DEFAULT_INTERVAL_SECS)]
    pub turbostat_interval: f64,

    #[command(flatten)]
    pub tools: Tools,

    /// workload command, after --
    #[arg(last = true, required_unless_present = "check")]
    pub workload: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Intervals {
    pub pcm: f64,
    pub pqos: f64,
    pub turbostat: f64,
}

#[derive(Clone, Debug)]
pub struct RunConfiguration {
    pub stages: BTreeMap<StageId, bool>,
    pub turbo: Turbo,
    pub pkg_cap: Setpoint,
    pub dram_cap: Setpoint,
    pub freq: Setpoint,
    pub debug: bool,
    pub outdir: PathBuf,
    pub idtag: String,
    pub tool_cpu: u32,
    pub workload_cpu: u32,
    // true -> KERNEL THREADS ARE MOVED OFF THE SHIELD TOO
    pub move_kthreads: bool,
    pub idle: IdleSettings,
    pub intervals: Intervals,
    pub tools: Tools,
    pub workload: Vec<String>,
}

// STAGE SELECTION. NO FLAG AND NO PRESET -> EVERYTHING.
// EXPLICIT FLAGS AND PRESETS COMBINE BY UNION.
pub fn resolve_stages(requested: &[StageId], short: bool, long: bool) -> BTreeMap<StageId, bool> {
    let all = requested.is_empty() && !short && !long;
    StageId::ALL
        .into_iter()
        .map(|id| {
            let on = all
                || long
                || requested.contains(&id)
                || (short && StageId::SHORT.contains(&id));
            (id, on)
        })
        .collect()
}

impl Cli {
    fn requested_stages(&self) -> Vec<StageId> {
        let flags = [
            (self.toplev_basic, StageId::ToplevBasic),
            (self.toplev_execution, StageId::ToplevExecution),
            (self.toplev_full, StageId::ToplevFull),
            (self.sde, StageId::Sde),
            (self.pcm, StageId::Pcm),
            (self.pcm_memory, StageId::PcmMemory),
            (self.pcm_power, StageId::PcmPower),
            (self.pcm_pcie, StageId::PcmPcie),
        ];
        flags.into_iter().filter(|(on, _)| *on).map(|(_, id)| id).collect()
    }

    pub fn resolve(self) -> Result<RunConfiguration> {
        if self.tool_cpu == self.workload_cpu {
            bail!(
                "--tool-cpu and --workload-cpu must differ (both {})",
                self.tool_cpu
            );
        }
        if self.workload.is_empty() {
            bail!("no workload command given (pass it after --)");
        }
        if !self.idle_temp.is_finite() || self.idle_temp <= 0.0 {
            bail!("--idle-temp must be a positive temperature, got {}", self.idle_temp);
        }
        if self.idtag.is_empty() || self.idtag.contains('/') {
            bail!("--idtag must be a non-empty file name prefix, got '{}'", self.idtag);
        }

        let stages = resolve_stages(&self.requested_stages(), self.short, self.long);

        Ok(RunConfiguration {
            stages,
            turbo: self.turbo,
            pkg_cap: self.cpu_cap,
            dram_cap: self.dram_cap,
            freq: self.freq,
            debug: self.debug,
            outdir: self.outdir,
            idtag: self.idtag,
            tool_cpu: self.tool_cpu,
            workload_cpu: self.workload_cpu,
            move_kthreads: self.move_kthreads,
            idle: IdleSettings {
                min_dwell: Duration::from_secs(self.idle_min_secs),
                target_celsius: self.idle_temp,
                timeout: Duration::from_secs(self.idle_timeout_secs),
                poll: IDLE_POLL,
            },
            intervals: Intervals {
                pcm: self.pcm_interval,
                // pqos SAMPLES IN STEP WITH pcm-power UNLESS TOLD OTHERWISE
                pqos: self.pqos_interval.unwrap_or(self.pcm_interval),
                turbostat: self.turbostat_interval,
            },
            tools: self.tools,
            workload: self.workload,
        })
    }
}

impl RunConfiguration {
    pub fn is_enabled(&self, id: StageId) -> bool {
        self.stages.get(&id).copied().unwrap_or(false)
    }

    // CORES THE SHIELD RESERVES. FREQUENCY PINNING FOLLOWS THE SAME SET.
    pub fn shield_cpus(&self) -> CpuSet {
        CpuSet::from_cpus([self.tool_cpu, self.workload_cpu])
    }

    // ONE RECORD PER KNOWN STAGE, IN DECLARED ORDER
    pub fn profiler_stages(&self) -> Vec<ProfilerStage> {
        self.stages
            .iter()
            .map(|(&id, &on)| ProfilerStage::new(id, on, &self.outdir, &self.idtag))
            .collect()
    }
}
