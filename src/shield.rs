// PROFRUN CPU ISOLATION
// RESERVES THE TOOL + WORKLOAD CORES AWAY FROM THE GENERAL SCHEDULER POOL.
//
// ShieldGuard IS THE ONLY WAY THE ORCHESTRATOR TOUCHES ISOLATION. IT RELEASES
// EXACTLY ONCE: EXPLICITLY, OR ON DROP WHEN THE RUN UNWINDS THROUGH AN ERROR.
// A FAILED OR PARTIAL reserve() STILL GETS RELEASED.

use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::cpulist::CpuSet;

pub trait Isolation {
    // move_kthreads: ALSO MIGRATE KERNEL THREADS OFF `cpus`
    fn reserve(&mut self, cpus: &CpuSet, move_kthreads: bool) -> Result<()>;
    fn release(&mut self) -> Result<()>;

    // ARGV PREFIX THAT RUNS A COMMAND INSIDE THE RESERVED SET
    fn exec_prefix(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// CPUSET SHIELD (cset)
// ---------------------------------------------------------------------------

pub struct CsetShield {
    program: String,
}

impl CsetShield {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    fn run(&self, args: &[String]) -> Result<()> {
        debug!("{} {}", self.program, args.join(" "));
        let status = Command::new(&self.program)
            .args(args)
            .status()
            .with_context(|| format!("FAILED TO RUN {}", self.program))?;
        if !status.success() {
            bail!("`{} {}` exited with {}", self.program, args.join(" "), status);
        }
        Ok(())
    }
}

// cset: --kthread=on MOVES KERNEL THREADS INTO THE UNSHIELDED SET
fn shield_args(cpus: &CpuSet, move_kthreads: bool) -> Vec<String> {
    vec![
        "shield".to_string(),
        "--cpu".to_string(),
        cpus.to_string(),
        format!("--kthread={}", if move_kthreads { "on" } else { "off" }),
    ]
}

impl Isolation for CsetShield {
    fn reserve(&mut self, cpus: &CpuSet, move_kthreads: bool) -> Result<()> {
        self.run(&shield_args(cpus, move_kthreads))
    }

    fn release(&mut self) -> Result<()> {
        self.run(&["shield".to_string(), "--reset".to_string()])
    }

    fn exec_prefix(&self) -> Vec<String> {
        vec![
            self.program.clone(),
            "shield".to_string(),
            "--exec".to_string(),
            "--".to_string(),
        ]
    }
}

// ---------------------------------------------------------------------------
// SCOPED RESERVATION
// ---------------------------------------------------------------------------

pub struct ShieldGuard<'a, I: Isolation + ?Sized> {
    isolation: &'a mut I,
    released: bool,
}

impl<'a, I: Isolation + ?Sized> ShieldGuard<'a, I> {
    // GUARD FIRST, RESERVE SECOND: A HALF-APPLIED SHIELD IS STILL TORN DOWN
    pub fn reserve(isolation: &'a mut I, cpus: &CpuSet, move_kthreads: bool) -> Result<Self> {
        let mut guard = Self { isolation, released: false };
        info!(
            "SHIELDING CPUS {} (kernel threads {})",
            cpus,
            if move_kthreads { "moved off" } else { "left in place" }
        );
        guard.isolation.reserve(cpus, move_kthreads)?;
        Ok(guard)
    }

    pub fn exec_prefix(&self) -> Vec<String> {
        self.isolation.exec_prefix()
    }

    pub fn release(mut self) -> Result<()> {
        self.release_once()
    }

    fn release_once(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        info!("RELEASING CPU SHIELD");
        self.isolation.release()
    }
}

impl<I: Isolation + ?Sized> Drop for ShieldGuard<'_, I> {
    fn drop(&mut self) {
        if let Err(e) = self.release_once() {
            warn!("CPU SHIELD RELEASE FAILED: {:#}", e);
        }
    }
}
