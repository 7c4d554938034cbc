// PROFRUN -- ISOLATED MULTI-TOOL MICROARCHITECTURE PROFILING RUNS
// DRIVES ONE WORKLOAD UNDER toplev / SDE / PCM WHILE HOLDING THE MACHINE IN A
// KNOWN POWER AND ISOLATION STATE SO RUNS STAY COMPARABLE.
//
// STAGE FAILURES ARE FATAL. POWER WRITES ARE BEST-EFFORT. THE CPU SHIELD IS
// RELEASED ON EVERY EXIT PATH.

mod cli;

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;

use profrun::config::Cli;
use profrun::idle::PackageSensor;
use profrun::orchestrator::ProcessLauncher;
use profrun::pipeline::{self, Host};
use profrun::shield::CsetShield;
use profrun::sidecar::ShutdownPolicy;
use profrun::sysfs::Sysfs;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn main() -> Result<()> {
    // USAGE ERRORS EXIT HERE, BEFORE ANY HOST STATE IS TOUCHED
    let cli = Cli::parse();

    if cli.check {
        return cli::check::run_check(&cli.tools);
    }

    let cfg = cli.resolve()?;
    profrun::logging::init(cfg.debug);

    // THE TOOL AND WORKLOAD SHARE OUR TERMINAL AND GET CTRL+C DIRECTLY.
    // WE ONLY NEED TO SURVIVE IT LONG ENOUGH TO RELEASE THE SHIELD.
    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    let sys = Sysfs::host();
    let sensor = PackageSensor::discover(&sys);
    let enabled: Vec<&str> = cfg
        .stages
        .iter()
        .filter(|(_, &on)| on)
        .map(|(id, _)| id.name())
        .collect();

    println!("PROFRUN v{}", env!("CARGO_PKG_VERSION"));
    println!("STAGES:          {}", enabled.join(", "));
    println!("WORKLOAD:        {}", cfg.workload.join(" "));
    println!("SHIELD:          {} (tool {}, workload {})", cfg.shield_cpus(), cfg.tool_cpu, cfg.workload_cpu);
    println!("RESULTS:         {}/{}_*", cfg.outdir.display(), cfg.idtag);
    println!(
        "IDLE GATE:       {}s dwell, {:.1}C target, {}s timeout{}",
        cfg.idle.min_dwell.as_secs(),
        cfg.idle.target_celsius,
        cfg.idle.timeout.as_secs(),
        if sensor.is_available() { "" } else { " (no sensor: dwell only)" }
    );
    println!();

    let mut shield = CsetShield::new(cfg.tools.cset.clone());
    let summary = pipeline::run(
        &cfg,
        Host {
            sys,
            isolation: &mut shield,
            launcher: ProcessLauncher,
            sensor,
            sidecar_policy: ShutdownPolicy::default(),
            shutdown: Some(&SHUTDOWN),
        },
    )?;

    if let Some(failure) = summary.failure {
        return Err(failure.into());
    }

    println!("PROFRUN OUT.");
    Ok(())
}
