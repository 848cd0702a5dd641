//! Classification of fetcher CLI output.
//!
//! The fetcher reports its result as free text on stdout/stderr. This
//! module maps that text to exactly one [`FetcherOutcome`]; the mapping is
//! deterministic, so the same output always classifies the same way.
//!
//! Precedence: permanent failures, then force-indicated conditions, then
//! known transient failures, then the exit status, then success.

use std::sync::LazyLock;

use regex::Regex;

/// Outcome of one fetcher execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetcherOutcome {
    /// The story was written or updated.
    Success,
    /// The local copy disagrees with the remote in a way a forced rebuild
    /// can fix (chapter-count mismatch or a local timestamp newer than the
    /// remote's).
    ForceIndicated { reason: String },
    /// Worth retrying: network trouble, rate limits, challenges, a site
    /// that has not caught up yet.
    TransientFailure { reason: String },
    /// Not worth retrying.
    PermanentFailure { reason: String },
}

struct Pattern {
    regex: LazyLock<Regex>,
    reason: &'static str,
}

macro_rules! pattern {
    ($re:expr, $reason:expr) => {
        Pattern {
            regex: LazyLock::new(|| Regex::new($re).expect("invalid classifier regex")),
            reason: $reason,
        }
    };
}

/// Output shapes that no amount of retrying will fix.
static PERMANENT: [Pattern; 1] =
    [pattern!(r"No story url found or unsupported domain", "unsupported site")];

/// Output shapes that a forced rebuild resolves.
static FORCEABLE: [Pattern; 2] = [
    pattern!(
        r"contains \d+ chapters, more than source: \d+\.",
        "local chapter count exceeds the source"
    ),
    pattern!(
        r"File\(.*\.epub\) Updated\(.*\) more recently than Story\(.*\) - Skipping",
        "local file newer than the story; likely a metadata bug"
    ),
];

/// Output shapes that warrant a retry.
static TRANSIENT: [Pattern; 7] = [
    pattern!(
        r"already contains \d+ chapters\.",
        "site has not published the update yet"
    ),
    pattern!(
        r"doesn't contain any recognizable chapters, probably from a different source\.\s+Not updating\.",
        "local epub has no recognizable chapters; site or epub is confused"
    ),
    pattern!(
        r"No story URL found in epub to update\.",
        "no story URL in the local epub; fix the metadata"
    ),
    pattern!(
        r"Login Failed on non-interactive process",
        "login failed; check username and password in personal.ini"
    ),
    pattern!(r"400 Client Error: Bad Request for url", "bad request from the site"),
    pattern!(r"403 Client Error: Forbidden for url", "forbidden by the site"),
    pattern!(
        r"Connection to flaresolverr proxy server failed",
        "challenge-solver proxy unreachable"
    ),
];

/// Classifies combined fetcher output into exactly one outcome.
pub fn classify(output: &str, exited_ok: bool) -> FetcherOutcome {
    for p in &PERMANENT {
        if p.regex.is_match(output) {
            return FetcherOutcome::PermanentFailure { reason: p.reason.to_string() };
        }
    }
    for p in &FORCEABLE {
        if p.regex.is_match(output) {
            return FetcherOutcome::ForceIndicated { reason: p.reason.to_string() };
        }
    }
    for p in &TRANSIENT {
        if p.regex.is_match(output) {
            return FetcherOutcome::TransientFailure { reason: p.reason.to_string() };
        }
    }
    if !exited_ok {
        return FetcherOutcome::TransientFailure {
            reason: "fetcher exited with a failure status".to_string(),
        };
    }
    FetcherOutcome::Success
}
