// PROFRUN LOGGING
// DIAGNOSTICS GO THROUGH tracing TO STDERR. OPERATOR TABLES (BANNER, POWER
// READ-BACK, REPORT) STAY ON STDOUT VIA println!.
// RUST_LOG OVERRIDES THE LEVEL PICKED BY --debug.

use tracing_subscriber::EnvFilter;

pub fn init(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("profrun={}", level)));
    // try_init: A SECOND CALL (TESTS) IS A NO-OP INSTEAD OF A PANIC
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
