// PROFRUN LIBRARY
// EVERYTHING THE BINARY DRIVES, SPLIT OUT SO tests/ CAN RUN IT AGAINST FAKE
// HOSTS. NOTHING HERE TOUCHES THE MACHINE UNTIL A Sysfs ROOT, AN Isolation
// AND A Launch ARE HANDED IN.

pub mod config;
pub mod cpulist;
pub mod idle;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod power;
pub mod probe;
pub mod report;
pub mod shield;
pub mod sidecar;
pub mod stage;
pub mod sysfs;
