//! Site identifiers derived from story URLs.
//!
//! A site is the stable name of a remote provider, used as the key for
//! domain locking: at most one worker talks to a given site at a time.
//! The normalization is intentionally simple so that every URL variant a
//! notification email can contain (`www.`, mobile, forum subdomains) maps
//! to the same identifier.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Site identifier a worker for which URLs are routed to.
///
/// URLs whose host cannot be parsed fall back to [`Site::OTHER`] so they
/// still flow through the pipeline on a shared catch-all lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Site(String);

/// Subdomain prefixes that carry no site identity.
const STRIPPED_PREFIXES: [&str; 3] = ["www.", "m.", "forums."];

impl Site {
    /// The catch-all site for URLs with no recognizable host.
    pub const OTHER: &'static str = "other";

    /// Derives the site identifier from a story URL.
    ///
    /// Host → lowercase → strip one leading `www.` / `m.` / `forums.` →
    /// label before the first remaining dot. `https://www.fanfiction.net/s/1`
    /// becomes `fanfiction`.
    pub fn from_url(url: &str) -> Site {
        match Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_owned)) {
            Some(host) => Site::from_host(&host),
            None => Site(Site::OTHER.to_string()),
        }
    }

    /// Normalizes a bare hostname into a site identifier.
    pub fn from_host(host: &str) -> Site {
        let lowered = host.to_ascii_lowercase();
        let stripped = STRIPPED_PREFIXES
            .iter()
            .find_map(|p| lowered.strip_prefix(p))
            .unwrap_or(&lowered);
        let label = stripped.split('.').next().unwrap_or(stripped);
        if label.is_empty() {
            Site(Site::OTHER.to_string())
        } else {
            Site(label.to_string())
        }
    }

    /// Builds a site from an already-normalized identifier (e.g. config).
    pub fn named(name: impl Into<String>) -> Site {
        Site(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
