// PROFRUN RUN PIPELINE
// CONFIG -> POWER (APPLY + READ BACK) -> SHIELD -> STAGES -> RELEASE -> REPORT
//
// THE HOST COLLABORATORS (SYSFS ROOT, ISOLATION, LAUNCHER, SENSOR) ARE
// PARAMETERS SO THE WHOLE SEQUENCE RUNS AGAINST FAKES IN TESTS.

use std::fs;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use tracing::warn;

use crate::config::RunConfiguration;
use crate::idle::{IdleGate, ThermalSensor};
use crate::orchestrator::{Launch, Orchestrator, StageFailure};
use crate::power::{self, ApplyOutcome, PowerController, PowerRequest, PowerState};
use crate::report::{CompletionReport, Reporter};
use crate::shield::{Isolation, ShieldGuard};
use crate::sidecar::{ShutdownPolicy, SidecarManager};
use crate::stage::{ProfilerStage, StageId};
use crate::sysfs::Sysfs;

pub struct Host<'h, I: Isolation + ?Sized, L: Launch, S: ThermalSensor> {
    pub sys: Sysfs,
    pub isolation: &'h mut I,
    pub launcher: L,
    pub sensor: S,
    pub sidecar_policy: ShutdownPolicy,
    pub shutdown: Option<&'h AtomicBool>,
}

pub struct RunSummary {
    pub applied: ApplyOutcome,
    pub power: PowerState,
    pub stages: Vec<ProfilerStage>,
    pub report: CompletionReport,
    pub failure: Option<StageFailure>,
}

pub fn run<I, L, S>(cfg: &RunConfiguration, host: Host<'_, I, L, S>) -> Result<RunSummary>
where
    I: Isolation + ?Sized,
    L: Launch,
    S: ThermalSensor,
{
    fs::create_dir_all(&cfg.outdir)
        .with_context(|| format!("CREATE RESULTS DIR {}", cfg.outdir.display()))?;

    // POWER: BEST EFFORT, ALWAYS READ BACK
    let controller = PowerController::new(host.sys.clone(), cfg.shield_cpus());
    let request = PowerRequest::from_config(cfg);
    power::print_request(&request);
    let applied = controller.apply(&request);
    let state = controller.read_back();
    power::print_state(&state, &applied);
    println!();

    // SHIELD: RELEASED ON EVERY PATH OUT OF THIS FUNCTION
    let guard = ShieldGuard::reserve(host.isolation, &cfg.shield_cpus(), cfg.move_kthreads)?;

    let reporter = Reporter::new(&cfg.outdir, &cfg.idtag);
    let outcome = {
        let gate = IdleGate::new(cfg.idle, host.sensor);
        let sidecars = SidecarManager::new(host.sys.clone(), host.sidecar_policy);
        let mut orch = Orchestrator::new(cfg, host.launcher, gate, sidecars, &reporter)
            .with_exec_prefix(guard.exec_prefix());
        if let Some(flag) = host.shutdown {
            orch = orch.with_shutdown(flag);
        }
        orch.run()?
    };

    if let Err(e) = guard.release() {
        warn!("CPU SHIELD RELEASE FAILED: {:#}", e);
    }

    let report = reporter.finish(&StageId::ALL)?;
    println!("{}", "=".repeat(60));
    println!("REPORT: {}", reporter.report_path().display());
    for (_, line) in &report.lines {
        println!("  {}", line);
    }
    println!("{}", "=".repeat(60));

    Ok(RunSummary {
        applied,
        power: state,
        stages: outcome.stages,
        report,
        failure: outcome.failure,
    })
}
