// PROFRUN HOST INTERFACE ROOT
// EVERY /sys, /proc AND /dev ACCESS GOES THROUGH THIS SO TESTS CAN POINT IT
// AT A FAKE TREE. ROOT IS "/" ON A REAL HOST.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    pub fn host() -> Self {
        Self { root: PathBuf::from("/") }
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    // ABSOLUTE HOST PATH ("/sys/...") RE-ROOTED UNDER self.root
    pub fn path(&self, host_path: &str) -> PathBuf {
        self.root.join(host_path.trim_start_matches('/'))
    }

    pub fn exists(&self, host_path: &str) -> bool {
        self.path(host_path).exists()
    }

    pub fn read(&self, host_path: &str) -> Option<String> {
        read_trimmed(&self.path(host_path))
    }

    pub fn read_u64(&self, host_path: &str) -> Option<u64> {
        self.read(host_path).and_then(|s| s.parse().ok())
    }

    pub fn write(&self, host_path: &str, value: &str) -> Result<()> {
        write_value(&self.path(host_path), value)
    }

    // DIRECTORY ENTRIES SORTED BY NAME. EMPTY WHEN THE DIRECTORY IS MISSING.
    pub fn list(&self, host_dir: &str) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(self.path(host_dir)) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn write_value(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).with_context(|| format!("WRITE {} -> {}", value, path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_rerooted() {
        let sys = Sysfs::at("/tmp/fake");
        assert_eq!(
            sys.path("/sys/devices/system/cpu/online"),
            PathBuf::from("/tmp/fake/sys/devices/system/cpu/online")
        );
        assert_eq!(Sysfs::host().path("/proc/stat"), PathBuf::from("/proc/stat"));
    }

    #[test]
    fn missing_reads_are_none() {
        let sys = Sysfs::at("/nonexistent-profrun-root");
        assert!(sys.read("/sys/nothing").is_none());
        assert!(sys.list("/sys/nothing").is_empty());
        assert!(sys.write("/sys/nothing", "1").is_err());
    }
}
