//! QA stages, stage results, and diagnostic fingerprints.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The QA stages a task run passes through each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Lint,
    Test,
    Review,
}

impl Stage {
    /// Canonical stage order within an iteration.
    pub const ALL: [Stage; 4] = [Stage::Build, Stage::Lint, Stage::Test, Stage::Review];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Lint => "lint",
            Self::Test => "test",
            Self::Review => "review",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Build => Some(Self::Lint),
            Self::Lint => Some(Self::Test),
            Self::Test => Some(Self::Review),
            Self::Review => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single diagnostic from a QA stage (compiler error, lint warning,
/// failing test, review comment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Tool-specific code, e.g. `E0308` or `no-unused-vars`.
    pub code: Option<String>,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl Diagnostic {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            file: None,
            line: None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "[{code}] ")?;
        }
        f.write_str(&self.message)?;
        if let Some(file) = &self.file {
            write!(f, " ({file}")?;
            if let Some(line) = self.line {
                write!(f, ":{line}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Outcome of one QA stage for one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub passed: bool,
    pub summary: String,
    pub diagnostics: Vec<Diagnostic>,
    pub duration_ms: u64,
}

impl StageResult {
    /// An automatic pass, used when the host wires no callback for a stage.
    pub fn auto_pass() -> Self {
        Self {
            passed: true,
            summary: "no callback configured; automatic pass".to_owned(),
            diagnostics: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn pass(summary: impl Into<String>) -> Self {
        Self {
            passed: true,
            summary: summary.into(),
            diagnostics: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn fail(summary: impl Into<String>, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            passed: false,
            summary: summary.into(),
            diagnostics,
            duration_ms: 0,
        }
    }
}

/// Review verdicts returned by the review callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve,
    RequestChanges,
    Reject,
}

/// A review stage outcome: verdict plus the underlying stage result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub verdict: ReviewVerdict,
    pub result: StageResult,
    /// Set when the reviewer judged the change too large for one task.
    #[serde(default)]
    pub scope_too_large: bool,
}

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// Stable identity of a diagnostic: `(stage, code, normalized message,
/// file)` hashed. Used to detect the same failure recurring across
/// iterations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(stage_label: &str, diagnostic: &Diagnostic) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(stage_label.as_bytes());
        hasher.update([0u8]);
        hasher.update(diagnostic.code.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_message(&diagnostic.message).as_bytes());
        hasher.update([0u8]);
        hasher.update(diagnostic.file.as_deref().unwrap_or("").as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a diagnostic message so incidental differences (counts, line
/// numbers, padding) do not defeat fingerprinting: lowercase, digits
/// stripped, whitespace collapsed.
fn normalize_message(message: &str) -> String {
    let lowered: String = message
        .chars()
        .filter(|c| !c.is_ascii_digit())
        .flat_map(char::to_lowercase)
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hash of an agent's touched-file set, used to detect when previously
/// green stages must rerun.
pub fn file_set_hash(files: &[String]) -> String {
    let mut sorted: Vec<&str> = files.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let mut hasher = Sha256::new();
    for file in sorted {
        hasher.update(file.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..8])
}
