// PROFRUN CPU LISTS
// KERNEL-STYLE CPU LIST PARSING AND FORMATTING ("0-3,5,7-8")
// USED FOR /sys/devices/system/cpu/online, cset --cpu AND pqos GROUPS

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{bail, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuSet {
    cpus: BTreeSet<u32>,
}

impl CpuSet {
    pub fn from_cpus(cpus: impl IntoIterator<Item = u32>) -> Self {
        Self { cpus: cpus.into_iter().collect() }
    }

    // STRICT PARSE. REJECTS GARBAGE INSTEAD OF SKIPPING IT.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut cpus = BTreeSet::new();
        for range in raw.trim().split(',').filter(|r| !r.is_empty()) {
            let parts: Vec<&str> = range.split('-').collect();
            match parts.len() {
                1 => {
                    cpus.insert(parse_cpu(parts[0])?);
                }
                2 => {
                    let lo = parse_cpu(parts[0])?;
                    let hi = parse_cpu(parts[1])?;
                    if lo > hi {
                        bail!("INVALID CPU RANGE '{}'", range);
                    }
                    cpus.extend(lo..=hi);
                }
                _ => bail!("INVALID CPU RANGE '{}'", range),
            }
        }
        Ok(Self { cpus })
    }

    // SYSFS CPU LIST (online, possible). EMPTY SET WHEN UNREADABLE.
    pub fn read(path: &std::path::Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| Self::parse(&raw).ok())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.cpus.iter().copied()
    }

    pub fn without(&self, other: &CpuSet) -> CpuSet {
        Self { cpus: self.cpus.difference(&other.cpus).copied().collect() }
    }
}

fn parse_cpu(s: &str) -> Result<u32> {
    match s.trim().parse::<u32>() {
        Ok(cpu) => Ok(cpu),
        Err(_) => bail!("INVALID CPU '{}'", s),
    }
}

// COLLAPSES CONSECUTIVE RUNS: {0,1,2,5} -> "0-2,5"
impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.cpus.iter().copied().peekable();
        while let Some(lo) = iter.next() {
            let mut hi = lo;
            while iter.peek() == Some(&(hi + 1)) {
                hi += 1;
                iter.next();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if lo == hi {
                write!(f, "{}", lo)?;
            } else {
                write!(f, "{}-{}", lo, hi)?;
            }
        }
        Ok(())
    }
}
