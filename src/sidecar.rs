// PROFRUN SIDECAR LIFECYCLE
// TELEMETRY COLLECTORS THAT RUN NEXT TO THE POWER STAGE'S MAIN MEASUREMENT:
//   pqos       LLC OCCUPANCY + MEMORY BANDWIDTH, WORKLOAD CORE VS EVERYTHING ELSE
//   turbostat  FREQUENCY / TEMPERATURE / RAPL WATTS ACROSS ALL CORES
//
// SHUTDOWN ESCALATES SIGINT -> SIGTERM -> SIGKILL WITH A BOUNDED WAIT AFTER
// EACH. COLLECTORS BUFFER OUTPUT, SO THEY GET A CHANCE TO FLUSH FIRST. A STEP
// IS SKIPPED ONCE THE PROCESS HAS EXITED, SO A COLLECTOR THAT HONOURS SIGINT
// NEVER SEES SIGTERM OR SIGKILL.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::config::RunConfiguration;
use crate::cpulist::CpuSet;
use crate::probe::Capability;
use crate::stage::StageId;
use crate::sysfs::Sysfs;

const REAP_POLL: Duration = Duration::from_millis(10);

const TURBOSTAT_COLUMNS: &str = "Core,CPU,Avg_MHz,Busy%,Bzy_MHz,CoreTmp,PkgTmp,PkgWatt,RAMWatt";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SidecarKind {
    Pqos,
    Turbostat,
}

impl SidecarKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pqos => "pqos",
            Self::Turbostat => "turbostat",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    NotStarted,
    Running,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Self::Interrupt => libc::SIGINT,
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub interrupt_grace: Duration,
    pub terminate_grace: Duration,
    pub kill_grace: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            interrupt_grace: Duration::from_secs(3),
            terminate_grace: Duration::from_secs(2),
            kill_grace: Duration::from_secs(1),
        }
    }
}

impl ShutdownPolicy {
    pub fn total(&self) -> Duration {
        self.interrupt_grace + self.terminate_grace + self.kill_grace
    }
}

#[derive(Debug)]
pub struct StopReport {
    pub signals: Vec<Signal>,
    pub elapsed: Duration,
    // None IF THE PROCESS WAS NEVER REAPED (STILL ALIVE AFTER SIGKILL GRACE)
    pub status: Option<ExitStatus>,
}

#[derive(Clone, Debug)]
pub struct SidecarSpec {
    pub kind: SidecarKind,
    pub stage: StageId,
    pub argv: Vec<String>,
    pub output: PathBuf,
    pub requires: Option<Capability>,
}

// ---------------------------------------------------------------------------
// ONE COLLECTOR PROCESS
// ---------------------------------------------------------------------------

pub struct SidecarProcess {
    pub kind: SidecarKind,
    pub stage: StageId,
    pub output: PathBuf,
    child: Option<Child>,
    pgid: i32,
    state: Liveness,
}

impl SidecarProcess {
    pub fn new(spec: &SidecarSpec) -> Self {
        Self {
            kind: spec.kind,
            stage: spec.stage,
            output: spec.output.clone(),
            child: None,
            pgid: 0,
            state: Liveness::NotStarted,
        }
    }

    // OWN PROCESS GROUP SO SIGNALS REACH ANY HELPERS IT FORKS.
    // PARENT-DEATH SIGNAL SO IT NEVER OUTLIVES THE ORCHESTRATOR.
    pub fn spawn(spec: &SidecarSpec) -> Result<Self> {
        let mut proc = Self::new(spec);
        let Some((program, args)) = spec.argv.split_first() else {
            bail!("EMPTY COMMAND FOR SIDECAR {}", spec.kind.name());
        };
        let child = unsafe {
            Command::new(program)
                .args(args)
                .process_group(0)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .pre_exec(|| {
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong);
                    Ok(())
                })
                .spawn()
                .with_context(|| format!("FAILED TO START {}", program))?
        };
        proc.pgid = child.id() as i32;
        proc.child = Some(child);
        proc.state = Liveness::Running;
        Ok(proc)
    }

    pub fn state(&self) -> Liveness {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    pub fn stop(&mut self, policy: &ShutdownPolicy) -> StopReport {
        let start = Instant::now();
        let mut signals = Vec::new();

        let Some(child) = self.child.as_mut() else {
            if self.state == Liveness::Running {
                self.state = Liveness::Stopped;
            }
            return StopReport { signals, elapsed: start.elapsed(), status: None };
        };

        let steps = [
            (Signal::Interrupt, policy.interrupt_grace),
            (Signal::Terminate, policy.terminate_grace),
            (Signal::Kill, policy.kill_grace),
        ];

        let mut status = child.try_wait().ok().flatten();
        for (signal, grace) in steps {
            if status.is_some() {
                break;
            }
            unsafe {
                libc::killpg(self.pgid, signal.raw());
            }
            signals.push(signal);
            status = wait_until(child, start.elapsed() + grace, start);
        }

        if status.is_none() {
            warn!(
                "{} (pgid {}) NOT REAPED AFTER SIGKILL",
                self.kind.name(),
                self.pgid
            );
        }
        self.child = None;
        self.state = Liveness::Stopped;
        StopReport { signals, elapsed: start.elapsed(), status }
    }
}

// POLL try_wait UNTIL THE CHILD EXITS OR `deadline` (RELATIVE TO `start`) PASSES
fn wait_until(child: &mut Child, deadline: Duration, start: Instant) -> Option<ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                let now = start.elapsed();
                if now >= deadline {
                    return None;
                }
                std::thread::sleep(REAP_POLL.min(deadline - now));
            }
            Err(_) => return None,
        }
    }
}

impl Drop for SidecarProcess {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.stop(&ShutdownPolicy::default());
        }
    }
}

// ---------------------------------------------------------------------------
// MANAGER
// ---------------------------------------------------------------------------

pub struct SidecarManager {
    sys: Sysfs,
    policy: ShutdownPolicy,
    running: Vec<SidecarProcess>,
}

impl SidecarManager {
    pub fn new(sys: Sysfs, policy: ShutdownPolicy) -> Self {
        Self { sys, policy, running: Vec::new() }
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    // COLLECTORS FOR A STAGE. EMPTY FOR EVERY STAGE BUT THE POWER STAGE.
    pub fn plan(&self, stage: StageId, cfg: &RunConfiguration) -> Vec<SidecarSpec> {
        if !stage.uses_sidecars() {
            return Vec::new();
        }

        let workload = CpuSet::from_cpus([cfg.workload_cpu]);
        let online = CpuSet::read(&self.sys.path("/sys/devices/system/cpu/online"));
        let others = online.without(&workload);
        let mut groups = format!("all:[{}]", workload);
        if !others.is_empty() {
            groups.push_str(&format!(";all:[{}]", others));
        }

        // pqos -i COUNTS 100MS TICKS
        let ticks = ((cfg.intervals.pqos * 10.0).round() as u64).max(1);
        let pqos_out = cfg.outdir.join(format!("{}_pqos.csv", cfg.idtag));
        let mut pqos = vec![cfg.tools.pqos.clone()];
        if self.sys.exists("/sys/fs/resctrl/info/L3_MON") {
            // OS (RESCTRL) INTERFACE INSTEAD OF RAW MSR
            pqos.push("-I".into());
        }
        pqos.extend([
            "-u".to_string(),
            "csv".to_string(),
            "-o".to_string(),
            pqos_out.display().to_string(),
            "-i".to_string(),
            ticks.to_string(),
            "-m".to_string(),
            groups,
        ]);

        let ts_out = cfg.outdir.join(format!("{}_turbostat.csv", cfg.idtag));
        let turbostat = vec![
            cfg.tools.turbostat.clone(),
            "--quiet".to_string(),
            "--interval".to_string(),
            format!("{}", cfg.intervals.turbostat),
            "--show".to_string(),
            TURBOSTAT_COLUMNS.to_string(),
            "--out".to_string(),
            ts_out.display().to_string(),
        ];

        vec![
            SidecarSpec {
                kind: SidecarKind::Pqos,
                stage,
                argv: pqos,
                output: pqos_out,
                requires: Some(Capability::ResctrlMonitoring),
            },
            SidecarSpec {
                kind: SidecarKind::Turbostat,
                stage,
                argv: turbostat,
                output: ts_out,
                requires: Some(Capability::Msr),
            },
        ]
    }

    pub fn start(&mut self, stage: StageId, cfg: &RunConfiguration) -> usize {
        let specs = self.plan(stage, cfg);
        self.launch(specs)
    }

    // PROBE, THEN SPAWN. A MISSING FEATURE OR A FAILED SPAWN SKIPS THAT
    // COLLECTOR ONLY. RETURNS HOW MANY ARE NOW RUNNING.
    pub fn launch(&mut self, specs: Vec<SidecarSpec>) -> usize {
        let mut started = 0;
        for spec in specs {
            if let Some(cap) = spec.requires {
                if let Err(reason) = cap.check(&self.sys) {
                    warn!(
                        "SKIPPING SIDECAR {} FOR {}: {} UNAVAILABLE ({})",
                        spec.kind.name(),
                        spec.stage.name(),
                        cap.label(),
                        reason
                    );
                    continue;
                }
            }
            match SidecarProcess::spawn(&spec) {
                Ok(proc) => {
                    info!(
                        "SIDECAR {} STARTED (pid {}) -> {}",
                        spec.kind.name(),
                        proc.pid().unwrap_or(0),
                        spec.output.display()
                    );
                    debug!("sidecar argv: {:?}", spec.argv);
                    self.running.push(proc);
                    started += 1;
                }
                Err(e) => warn!("SKIPPING SIDECAR {}: {:#}", spec.kind.name(), e),
            }
        }
        started
    }

    // STOP EVERY COLLECTOR OWNED BY `stage`
    pub fn stop(&mut self, stage: StageId) -> Vec<(SidecarKind, StopReport)> {
        let mut reports = Vec::new();
        let mut i = 0;
        while i < self.running.len() {
            if self.running[i].stage != stage {
                i += 1;
                continue;
            }
            let mut proc = self.running.remove(i);
            let report = proc.stop(&self.policy);
            info!(
                "SIDECAR {} STOPPED in {:.2}s (signals: {:?})",
                proc.kind.name(),
                report.elapsed.as_secs_f64(),
                report.signals
            );
            reports.push((proc.kind, report));
        }
        reports
    }
}

impl Drop for SidecarManager {
    fn drop(&mut self) {
        for proc in &mut self.running {
            proc.stop(&self.policy);
        }
    }
}
