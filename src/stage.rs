// PROFRUN STAGES
// ONE STAGE = ONE PROFILING TOOL OBSERVING ONE WORKLOAD INVOCATION.
// THE DECLARED ORDER OF StageId::ALL IS THE EXECUTION AND REPORT ORDER.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::Tools;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageId {
    ToplevBasic,
    ToplevExecution,
    ToplevFull,
    Sde,
    Pcm,
    PcmMemory,
    PcmPower,
    PcmPcie,
}

impl StageId {
    pub const ALL: [StageId; 8] = [
        StageId::ToplevBasic,
        StageId::ToplevExecution,
        StageId::ToplevFull,
        StageId::Sde,
        StageId::Pcm,
        StageId::PcmMemory,
        StageId::PcmPower,
        StageId::PcmPcie,
    ];

    // --short: CHEAP, MOST USEFUL SUBSET
    pub const SHORT: [StageId; 3] = [
        StageId::ToplevBasic,
        StageId::ToplevExecution,
        StageId::PcmPower,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ToplevBasic => "toplev-basic",
            Self::ToplevExecution => "toplev-execution",
            Self::ToplevFull => "toplev-full",
            Self::Sde => "sde",
            Self::Pcm => "pcm",
            Self::PcmMemory => "pcm-memory",
            Self::PcmPower => "pcm-power",
            Self::PcmPcie => "pcm-pcie",
        }
    }

    // ONLY THE POWER STAGE CARRIES SIDECAR COLLECTORS
    pub fn uses_sidecars(self) -> bool {
        self == Self::PcmPower
    }

    fn file_stem(self) -> &'static str {
        match self {
            Self::ToplevBasic => "toplev_basic",
            Self::ToplevExecution => "toplev_execution",
            Self::ToplevFull => "toplev_full",
            Self::Sde => "sde",
            Self::Pcm => "pcm",
            Self::PcmMemory => "pcm_memory",
            Self::PcmPower => "pcm_power",
            Self::PcmPcie => "pcm_pcie",
        }
    }

    pub fn raw_artifact(self, outdir: &Path, idtag: &str) -> PathBuf {
        let ext = if self == Self::Sde { "txt" } else { "csv" };
        outdir.join(format!("{}_{}.{}", idtag, self.file_stem(), ext))
    }

    pub fn converted_artifact(self, outdir: &Path, idtag: &str) -> Option<PathBuf> {
        match self {
            Self::ToplevBasic | Self::ToplevExecution | Self::ToplevFull => Some(
                outdir.join(format!("{}_{}_dense.csv", idtag, self.file_stem())),
            ),
            Self::PcmMemory => Some(outdir.join(format!("{}_pcm_memory_dram.csv", idtag))),
            _ => None,
        }
    }

    // TOOL HALF OF THE COMMAND LINE (EVERYTHING BEFORE "--" AND THE WORKLOAD)
    pub fn tool_argv(self, tools: &Tools, raw: &Path, interval_secs: f64) -> Vec<String> {
        let raw = raw.display().to_string();
        let interval = format!("{}", interval_secs);
        let toplev = |extra: &[&str]| {
            let mut argv = vec![tools.toplev.clone()];
            argv.extend(extra.iter().map(|s| s.to_string()));
            argv.extend(
                ["--single-thread", "--no-desc", "-x,", "-o", raw.as_str()]
                    .iter()
                    .map(|s| s.to_string()),
            );
            argv
        };
        match self {
            Self::ToplevBasic => toplev(&["-l1"]),
            Self::ToplevExecution => toplev(&[
                "-l3",
                "--nodes",
                "+Frontend_Bound*/3,+Bad_Speculation*/3,+Backend_Bound*/3,+Retiring*/3",
            ]),
            Self::ToplevFull => toplev(&["-l6", "--all"]),
            Self::Sde => vec![tools.sde.clone(), "-mix".into(), "-omix".into(), raw],
            Self::Pcm => vec![tools.pcm.clone(), interval, format!("-csv={}", raw)],
            Self::PcmMemory => vec![tools.pcm_memory.clone(), interval, format!("-csv={}", raw)],
            Self::PcmPower => vec![tools.pcm_power.clone(), interval, format!("-csv={}", raw)],
            Self::PcmPcie => vec![
                tools.pcm_pcie.clone(),
                interval,
                "-B".into(),
                format!("-csv={}", raw),
            ],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct ProfilerStage {
    pub id: StageId,
    pub enabled: bool,
    pub raw: PathBuf,
    pub converted: Option<PathBuf>,
    // EPOCH MILLISECONDS. 0 = NOT RUN.
    pub start_ms: u64,
    pub end_ms: u64,
    pub state: StageState,
}

impl ProfilerStage {
    pub fn new(id: StageId, enabled: bool, outdir: &Path, idtag: &str) -> Self {
        Self {
            id,
            enabled,
            raw: id.raw_artifact(outdir, idtag),
            converted: id.converted_artifact(outdir, idtag),
            start_ms: 0,
            end_ms: 0,
            state: StageState::Pending,
        }
    }

    pub fn name(&self) -> &'static str {
        self.id.name()
    }

    pub fn duration(&self) -> Option<Duration> {
        if self.start_ms == 0 || self.end_ms < self.start_ms {
            return None;
        }
        Some(Duration::from_millis(self.end_ms - self.start_ms))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            StageState::Completed | StageState::Skipped | StageState::Failed(_)
        )
    }

    // TRANSITIONS. SKIPPED NEVER PASSES THROUGH RUNNING.

    pub fn skip(&mut self) {
        debug_assert_eq!(self.state, StageState::Pending);
        self.state = StageState::Skipped;
    }

    pub fn begin(&mut self, start_ms: u64) {
        debug_assert_eq!(self.state, StageState::Pending);
        self.start_ms = start_ms;
        self.state = StageState::Running;
    }

    pub fn complete(&mut self, end_ms: u64) {
        debug_assert_eq!(self.state, StageState::Running);
        self.end_ms = end_ms;
        self.state = StageState::Completed;
    }

    pub fn fail(&mut self, end_ms: u64, reason: String) {
        debug_assert_eq!(self.state, StageState::Running);
        self.end_ms = end_ms;
        self.state = StageState::Failed(reason);
    }

    // ONE HUMAN-READABLE REPORT LINE
    pub fn outcome_line(&self) -> String {
        let outcome = match &self.state {
            StageState::Skipped => "skipped".to_string(),
            StageState::Completed => match self.duration() {
                Some(d) => format!("{:.3}s", d.as_secs_f64()),
                None => "0.000s".to_string(),
            },
            StageState::Failed(reason) => format!("failed: {}", reason),
            StageState::Pending | StageState::Running => "not run".to_string(),
        };
        format!("{}: {}", self.name(), outcome)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_order_is_stable() {
        let names: Vec<&str> = StageId::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            [
                "toplev-basic",
                "toplev-execution",
                "toplev-full",
                "sde",
                "pcm",
                "pcm-memory",
                "pcm-power",
                "pcm-pcie"
            ]
        );
        let mut sorted = StageId::ALL;
        sorted.sort();
        assert_eq!(sorted, StageId::ALL);
    }

    #[test]
    fn only_power_stage_has_sidecars() {
        let with: Vec<StageId> = StageId::ALL.into_iter().filter(|s| s.uses_sidecars()).collect();
        assert_eq!(with, [StageId::PcmPower]);
    }

    #[test]
    fn fresh_stage_has_zero_sentinel() {
        let s = ProfilerStage::new(StageId::Pcm, true, Path::new("/out"), "id_7");
        assert_eq!(s.start_ms, 0);
        assert_eq!(s.end_ms, 0);
        assert!(s.duration().is_none());
        assert_eq!(s.raw, PathBuf::from("/out/id_7_pcm.csv"));
        assert!(s.converted.is_none());
        assert_eq!(s.outcome_line(), "pcm: not run");
    }

    #[test]
    fn completed_line_formats_duration() {
        let mut s = ProfilerStage::new(StageId::ToplevBasic, true, Path::new("/out"), "x");
        s.begin(1_000);
        s.complete(13_345);
        assert_eq!(s.outcome_line(), "toplev-basic: 12.345s");
        assert!(s.is_terminal());
    }

    #[test]
    fn skipped_never_runs() {
        let mut s = ProfilerStage::new(StageId::Sde, false, Path::new("/out"), "x");
        s.skip();
        assert_eq!(s.start_ms, 0);
        assert_eq!(s.outcome_line(), "sde: skipped");
    }

    #[test]
    fn pcm_argv_carries_interval_and_csv() {
        let tools = Tools::default();
        let argv = StageId::PcmPcie.tool_argv(&tools, Path::new("/o/r.csv"), 0.5);
        assert_eq!(argv, ["pcm-pcie", "0.5", "-B", "-csv=/o/r.csv"]);
    }

    #[test]
    fn toplev_argv_writes_csv_to_raw() {
        let tools = Tools::default();
        let argv = StageId::ToplevBasic.tool_argv(&tools, Path::new("/o/r.csv"), 0.5);
        assert_eq!(argv[0], "toplev");
        assert_eq!(argv[1], "-l1");
        assert_eq!(argv.last().map(String::as_str), Some("/o/r.csv"));
    }
}
