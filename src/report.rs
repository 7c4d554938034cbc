// PROFRUN COMPLETION REPORT
// EACH STAGE LEAVES ONE MARKER FILE (<IDTAG>_<stage>.time) WITH ITS OUTCOME
// LINE. AT THE END THE MARKERS ARE CONCATENATED IN DECLARED STAGE ORDER INTO
// <IDTAG>_timings.txt AND DELETED. THE REPORT IS WRITTEN ONCE, VIA A TEMP
// FILE AND RENAME, SO READERS NEVER SEE A PARTIAL ONE.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::stage::{ProfilerStage, StageId};

pub struct Reporter {
    outdir: PathBuf,
    idtag: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionReport {
    pub lines: Vec<(StageId, String)>,
}

impl CompletionReport {
    pub fn line(&self, id: StageId) -> Option<&str> {
        self.lines.iter().find(|(s, _)| *s == id).map(|(_, l)| l.as_str())
    }

    pub fn render(&self) -> String {
        let mut text = String::new();
        for (_, line) in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        text
    }
}

impl Reporter {
    pub fn new(outdir: &Path, idtag: &str) -> Self {
        Self { outdir: outdir.to_path_buf(), idtag: idtag.to_string() }
    }

    pub fn marker_path(&self, id: StageId) -> PathBuf {
        self.outdir.join(format!("{}_{}.time", self.idtag, id.name()))
    }

    pub fn report_path(&self) -> PathBuf {
        self.outdir.join(format!("{}_timings.txt", self.idtag))
    }

    pub fn write_marker(&self, stage: &ProfilerStage) -> Result<()> {
        let path = self.marker_path(stage.id);
        fs::write(&path, format!("{}\n", stage.outcome_line()))
            .with_context(|| format!("WRITE MARKER {}", path.display()))
    }

    // MERGE MARKERS IN `order`, WRITE THE REPORT, REMOVE THE MARKERS.
    // A STAGE WITH NO MARKER NEVER REACHED A TERMINAL STATE: "not run".
    pub fn finish(&self, order: &[StageId]) -> Result<CompletionReport> {
        let mut lines = Vec::with_capacity(order.len());
        for &id in order {
            let line = match fs::read_to_string(self.marker_path(id)) {
                Ok(raw) => raw.trim_end().to_string(),
                Err(_) => format!("{}: not run", id.name()),
            };
            lines.push((id, line));
        }
        let report = CompletionReport { lines };

        let path = self.report_path();
        let tmp = path.with_extension("txt.partial");
        fs::write(&tmp, report.render()).with_context(|| format!("WRITE {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("RENAME {}", path.display()))?;

        for &id in order {
            let marker = self.marker_path(id);
            if fs::remove_file(&marker).is_ok() {
                debug!("removed {}", marker.display());
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("profrun-report-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn finish_merges_and_cleans_markers() {
        let dir = scratch("merge");
        let reporter = Reporter::new(&dir, "id_1");

        let mut done = ProfilerStage::new(StageId::Pcm, true, &dir, "id_1");
        done.begin(1_000);
        done.complete(3_500);
        let mut skipped = ProfilerStage::new(StageId::Sde, false, &dir, "id_1");
        skipped.skip();
        // WRITTEN OUT OF ORDER ON PURPOSE
        reporter.write_marker(&done).unwrap();
        reporter.write_marker(&skipped).unwrap();

        let order = [StageId::Sde, StageId::Pcm, StageId::PcmPcie];
        let report = reporter.finish(&order).unwrap();

        let text = fs::read_to_string(reporter.report_path()).unwrap();
        assert_eq!(text, "sde: skipped\npcm: 2.500s\npcm-pcie: not run\n");
        assert_eq!(report.render(), text);
        for id in order {
            assert!(!reporter.marker_path(id).exists());
        }
        assert!(!reporter.report_path().with_extension("txt.partial").exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
