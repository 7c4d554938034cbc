use anyhow::Result;

use profrun::config::Tools;
use profrun::probe::{self, Capability};
use profrun::sysfs::Sysfs;

const KERNEL_OPTIONS: [&str; 3] = ["CONFIG_X86_CPU_RESCTRL", "CONFIG_INTEL_RAPL", "CONFIG_X86_MSR"];

fn check_kernel_config(sys: &Sysfs) -> bool {
    let config = match probe::kernel_config(sys) {
        Some(c) => c,
        None => {
            println!("  /proc/config.gz         NOT FOUND OR UNREADABLE (SKIPPED)");
            return true;
        }
    };
    let mut ok = true;
    for option in KERNEL_OPTIONS {
        if probe::kernel_option_enabled(&config, option) {
            println!("  {:<24}OK", option);
        } else {
            println!("  {:<24}NOT SET", option);
            ok = false;
        }
    }
    ok
}

fn check_interface(sys: &Sysfs, label: &str, path: &str) -> bool {
    let found = sys.exists(path);
    println!("  {:<24}{}", label, if found { "OK" } else { "MISSING" });
    found
}

pub fn run_check(tools: &Tools) -> Result<()> {
    let sys = Sysfs::host();

    println!("PROFRUN PREFLIGHT CHECK");
    println!();

    // HARD REQUIREMENTS: WITHOUT THESE NO STAGE CAN RUN
    let mut ok = true;
    println!("TOOLS:");
    for tool in tools.all() {
        if probe::tool_available(tool) {
            println!("  {:<24}OK", tool);
        } else {
            println!("  {:<24}MISSING", tool);
            ok = false;
        }
    }
    println!();

    let root = unsafe { libc::geteuid() } == 0;
    println!("  {:<24}{}", "root", if root { "OK" } else { "NO (cset, msr and sysfs writes need root)" });
    if !root {
        ok = false;
    }
    println!();

    println!("KERNEL CONFIG:");
    if !check_kernel_config(&sys) {
        ok = false;
    }
    println!();

    // SOFT: MISSING INTERFACES ONLY DEGRADE THE RUN (SETTING OR SIDECAR SKIPPED)
    println!("HOST INTERFACES:");
    let pstate = check_interface(&sys, "intel_pstate/no_turbo", "/sys/devices/system/cpu/intel_pstate/no_turbo");
    if !pstate {
        check_interface(&sys, "cpufreq/boost", "/sys/devices/system/cpu/cpufreq/boost");
    }
    check_interface(&sys, "cpu0 cpufreq", "/sys/devices/system/cpu/cpu0/cpufreq");
    for cap in [Capability::Rapl, Capability::ResctrlMonitoring, Capability::Msr] {
        match cap.check(&sys) {
            Ok(()) => println!("  {:<24}OK", cap.label()),
            Err(reason) => println!("  {:<24}MISSING ({})", cap.label(), reason),
        }
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        std::process::exit(1);
    }

    Ok(())
}
