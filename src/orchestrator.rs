// PROFRUN STAGE ORCHESTRATOR
// STRICTLY SEQUENTIAL. PER ENABLED STAGE, IN DECLARED ORDER:
//   IDLE GATE -> [SIDECARS UP] -> TOOL(WORKLOAD) -> [SIDECARS DOWN] -> MARKER
// DISABLED STAGES GO STRAIGHT TO "skipped" WITHOUT RUNNING.
//
// A STAGE FAILURE (NON-ZERO EXIT OR SPAWN FAILURE) ENDS THE LOOP. LATER STAGES
// STAY PENDING AND SHOW UP AS "not run". THERE IS NO RETRY.

use std::fmt;
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::config::RunConfiguration;
use crate::idle::{IdleGate, IdleStop, ThermalSensor};
use crate::report::Reporter;
use crate::sidecar::SidecarManager;
use crate::stage::{now_ms, ProfilerStage, StageId, StageState};

// RUNS ONE FULLY-BUILT COMMAND LINE TO COMPLETION. NO TIMEOUT.
pub trait Launch {
    fn run(&mut self, argv: &[String]) -> Result<ExitStatus>;
}

impl<L: Launch + ?Sized> Launch for &mut L {
    fn run(&mut self, argv: &[String]) -> Result<ExitStatus> {
        (**self).run(argv)
    }
}

// INHERITS STDIO SO THE TOOL'S OWN OUTPUT REACHES THE OPERATOR
pub struct ProcessLauncher;

impl Launch for ProcessLauncher {
    fn run(&mut self, argv: &[String]) -> Result<ExitStatus> {
        let Some((program, args)) = argv.split_first() else {
            bail!("EMPTY COMMAND");
        };
        Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("FAILED TO START {}", program))
    }
}

// command IS None WHEN THE STAGE NEVER LAUNCHED (CTRL+C BEFORE ITS TOOL STARTED)
#[derive(Clone, Debug)]
pub struct StageFailure {
    pub stage: StageId,
    pub command: Option<String>,
    pub reason: String,
}

impl StageFailure {
    fn interrupted(stage: StageId, when: &str) -> Self {
        Self { stage, command: None, reason: format!("interrupted {}", when) }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.command {
            Some(cmd) => write!(f, "stage {} failed: `{}`: {}", self.stage.name(), cmd, self.reason),
            None => write!(f, "stage {} aborted: {}", self.stage.name(), self.reason),
        }
    }
}

impl std::error::Error for StageFailure {}

pub struct RunOutcome {
    pub stages: Vec<ProfilerStage>,
    pub failure: Option<StageFailure>,
}

pub struct Orchestrator<'a, L: Launch, S: ThermalSensor> {
    cfg: &'a RunConfiguration,
    launcher: L,
    gate: IdleGate<S>,
    sidecars: SidecarManager,
    reporter: &'a Reporter,
    exec_prefix: Vec<String>,
    shutdown: Option<&'a AtomicBool>,
}

impl<'a, L: Launch, S: ThermalSensor> Orchestrator<'a, L, S> {
    pub fn new(
        cfg: &'a RunConfiguration,
        launcher: L,
        gate: IdleGate<S>,
        sidecars: SidecarManager,
        reporter: &'a Reporter,
    ) -> Self {
        Self {
            cfg,
            launcher,
            gate,
            sidecars,
            reporter,
            exec_prefix: Vec::new(),
            shutdown: None,
        }
    }

    // PREFIX FROM THE ACTIVE SHIELD ("cset shield --exec --")
    pub fn with_exec_prefix(mut self, prefix: Vec<String>) -> Self {
        self.exec_prefix = prefix;
        self
    }

    pub fn with_shutdown(mut self, flag: &'a AtomicBool) -> Self {
        self.shutdown = Some(flag);
        self
    }

    // [shield prefix] taskset -c T <tool...> -- taskset -c W <workload...>
    pub fn command_for(&self, stage: &ProfilerStage) -> Vec<String> {
        let cfg = self.cfg;
        let mut argv = self.exec_prefix.clone();
        argv.extend([cfg.tools.taskset.clone(), "-c".into(), cfg.tool_cpu.to_string()]);
        argv.extend(stage.id.tool_argv(&cfg.tools, &stage.raw, cfg.intervals.pcm));
        argv.extend([
            "--".to_string(),
            cfg.tools.taskset.clone(),
            "-c".into(),
            cfg.workload_cpu.to_string(),
        ]);
        argv.extend(cfg.workload.iter().cloned());
        argv
    }

    fn interrupted(&self) -> bool {
        self.shutdown.map(|f| f.load(Ordering::Relaxed)).unwrap_or(false)
    }

    pub fn run(&mut self) -> Result<RunOutcome> {
        let mut stages = self.cfg.profiler_stages();
        let total = stages.iter().filter(|s| s.enabled).count();
        let mut ordinal = 0;
        let mut failure = None;

        for stage in stages.iter_mut() {
            if !stage.enabled {
                stage.skip();
                println!("STAGE {:<18} SKIPPED", stage.name());
                self.reporter.write_marker(stage)?;
                continue;
            }
            if self.interrupted() {
                failure = Some(StageFailure::interrupted(stage.id, "before start"));
                break;
            }
            ordinal += 1;
            println!("{}", "-".repeat(60));
            println!("STAGE {}/{}: {}", ordinal, total, stage.name().to_uppercase());
            println!("{}", "-".repeat(60));

            if let Some(f) = self.run_stage(stage)? {
                failure = Some(f);
                break;
            }
        }

        // AFTER AN ABORT, DISABLED STAGES ARE STILL "skipped", NOT "not run"
        if failure.is_some() {
            for stage in stages.iter_mut().filter(|s| !s.enabled && !s.is_terminal()) {
                stage.skip();
                self.reporter.write_marker(stage)?;
            }
        }

        Ok(RunOutcome { stages, failure })
    }

    fn run_stage(&mut self, stage: &mut ProfilerStage) -> Result<Option<StageFailure>> {
        let shutdown = self.shutdown;
        let idle = self
            .gate
            .wait_idle(move || shutdown.map(|f| f.load(Ordering::Relaxed)).unwrap_or(false));
        info!(
            "IDLE WAIT {:.1}s ({}{})",
            idle.elapsed.as_secs_f64(),
            idle.reason,
            idle.last_celsius.map(|t| format!(", {:.1}C", t)).unwrap_or_default()
        );

        // CTRL+C DURING THE GATE: NOTHING OF THIS STAGE RUNS, IT STAYS "not run"
        if idle.reason == IdleStop::Interrupted || self.interrupted() {
            return Ok(Some(StageFailure::interrupted(stage.id, "during idle wait")));
        }

        // SIDECARS STRICTLY BEFORE THE MEASUREMENT STARTS...
        if stage.id.uses_sidecars() {
            let n = self.sidecars.start(stage.id, self.cfg);
            info!("{} SIDECAR(S) RUNNING FOR {}", n, stage.name());
        }

        let argv = self.command_for(stage);
        info!("RUNNING: {}", argv.join(" "));
        stage.begin(now_ms());
        let result = self.launcher.run(&argv);
        let end = now_ms();

        // ...AND STRICTLY AFTER IT ENDS, SUCCESS OR NOT
        if stage.id.uses_sidecars() {
            self.sidecars.stop(stage.id);
        }

        let failure = match result {
            Ok(status) if status.success() => {
                stage.complete(end);
                None
            }
            Ok(status) => {
                stage.fail(end, status.to_string());
                Some(status.to_string())
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                stage.fail(end, reason.clone());
                Some(reason)
            }
        };
        self.reporter.write_marker(stage)?;

        match &stage.state {
            StageState::Completed => {
                println!(
                    "STAGE {:<18} DONE IN {:.3}s",
                    stage.name(),
                    stage.duration().map(|d| d.as_secs_f64()).unwrap_or(0.0)
                );
                debug!("raw artifact: {}", stage.raw.display());
                if let Some(converted) = &stage.converted {
                    debug!("converted artifact (post-processing): {}", converted.display());
                }
                Ok(None)
            }
            _ => Ok(failure.map(|reason| StageFailure {
                stage: stage.id,
                command: Some(argv.join(" ")),
                reason,
            })),
        }
    }
}
