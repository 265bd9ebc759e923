//! The persisted year counter of a run (`time.year.step`).
//!
//! The generated scripts own this file at run time; the crate reads it for
//! `status` and writes it only in tests and tooling. The format is the one a
//! shell can `source`: a single `year=<N>` line.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result, StageError};

pub const STATE_FILE: &str = "time.year.step";
const STATE_TMP: &str = "time.year.step.tmp";

/// Next year to simulate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearState {
    pub year: u32,
}

impl Default for YearState {
    fn default() -> Self {
        Self { year: 1 }
    }
}

impl YearState {
    pub fn path(run_dir: &Path) -> PathBuf {
        run_dir.join(STATE_FILE)
    }

    /// Read the state of `run_dir`; an absent file means year 1
    pub fn load(run_dir: &Path) -> Result<Self> {
        let path = Self::path(run_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).at(&path)?;
        Self::parse(&content).ok_or_else(|| {
            StageError::consistency(format!(
                "{} does not hold a year=<N> line: {:?}",
                path.display(),
                content.trim()
            ))
        })
    }

    fn parse(content: &str) -> Option<Self> {
        content
            .lines()
            .filter_map(|line| line.trim().strip_prefix("year="))
            .last()
            .and_then(|n| n.trim().parse().ok())
            .map(|year| Self { year })
    }

    /// Persist through a temp file and rename
    pub fn store(&self, run_dir: &Path) -> Result<()> {
        let tmp = run_dir.join(STATE_TMP);
        fs::write(&tmp, format!("year={}\n", self.year)).at(&tmp)?;
        let path = Self::path(run_dir);
        fs::rename(&tmp, &path).at(&path)?;
        Ok(())
    }

    /// True once every year up to `max_year` has completed
    pub fn is_complete(&self, max_year: u32) -> bool {
        self.year > max_year
    }
}
