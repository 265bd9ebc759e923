//! Type-safe selectors for nemostage
//!
//! Run families, script kinds and domain modes are enums rather than strings so
//! the resolver and script generator can match on them exhaustively.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString};

/// Categorical run family. Each family has its own template set, executable
/// and domain size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum RunType {
    /// Slope-versus-melt idealised shelf runs
    #[strum(serialize = "SVM")]
    #[serde(rename = "SVM")]
    Svm,
    /// AJ toy channel configurations
    #[strum(serialize = "AJTOY")]
    #[serde(rename = "AJTOY")]
    Ajtoy,
    /// Antarctic slope front channel with flux forcing
    #[strum(serialize = "ASF")]
    #[serde(rename = "ASF")]
    Asf,
    /// Machine-learning geometry ensemble
    #[strum(serialize = "SR_ML")]
    #[serde(rename = "SR_ML")]
    SrMl,
}

/// The three generated batch drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    /// One iteration, for interactive smoke tests
    Quick,
    /// Plain year loop up to the last year
    Long,
    /// Spin-up then production output, then post-processing
    Production,
}

impl ScriptKind {
    /// File name of the generated driver inside the run directory
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Quick => "goNEMOquick.sh",
            Self::Long => "goNEMOlong.sh",
            Self::Production => "goNEMOproduction.sh",
        }
    }
}

/// Which generated script the launcher hands to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum SubmitTarget {
    Quick,
    Long,
    #[default]
    Production,
    /// Stage everything, submit nothing
    None,
}

impl SubmitTarget {
    pub fn script(self) -> Option<ScriptKind> {
        match self {
            Self::Quick => Some(ScriptKind::Quick),
            Self::Long => Some(ScriptKind::Long),
            Self::Production => Some(ScriptKind::Production),
            Self::None => None,
        }
    }
}

/// How the domain/grid artifact (`domain_cfg.nc`) comes into existence
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DomainMode {
    /// Generate it from `domaincfg/` inside the batch script
    #[default]
    Default,
    /// Generate it, then post-process it with `hook <in> <out>`
    Hacked { hook: PathBuf },
    /// Use an externally supplied artifact, no generation
    External { artifact: PathBuf },
}

impl DomainMode {
    /// True when the batch scripts must run the grid generator first
    pub fn generates_grid(&self) -> bool {
        matches!(self, Self::Default | Self::Hacked { .. })
    }
}

impl fmt::Display for DomainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Hacked { hook } => write!(f, "hacked:{}", hook.display()),
            Self::External { artifact } => write!(f, "external:{}", artifact.display()),
        }
    }
}

/// Parses `default`, `hacked:<hook>` or `external:<artifact>`
impl FromStr for DomainMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mode, arg) = match s.split_once(':') {
            Some((mode, arg)) => (mode, Some(arg)),
            None => (s, None),
        };
        match (mode.to_ascii_lowercase().as_str(), arg) {
            ("default", None) => Ok(Self::Default),
            ("hacked", Some(hook)) if !hook.is_empty() => Ok(Self::Hacked {
                hook: PathBuf::from(hook),
            }),
            // "rogue" is the legacy name for external
            ("external" | "rogue", Some(artifact)) if !artifact.is_empty() => {
                Ok(Self::External {
                    artifact: PathBuf::from(artifact),
                })
            }
            _ => Err(format!(
                "Invalid domain mode '{}'. Valid: default, hacked:<hook>, external:<domain_cfg.nc>",
                s
            )),
        }
    }
}
