//! Resolution of the fetcher invocation mode.
//!
//! The configured update method and the story's own behavior flag combine
//! into the single mode flag passed to the fetcher CLI. `update_no_force`
//! wins over everything: under it a force request, manual or promoted, is
//! silently downgraded to a plain update.

use crate::config::UpdateMethod;
use crate::types::UpdateBehavior;

/// The mode flag handed to the fetcher CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Update,
    UpdateAlways,
    Force,
}

impl FetchMode {
    /// Command-line arguments for this mode.
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            FetchMode::Update => &["-u"],
            FetchMode::UpdateAlways => &["-u", "--update-always"],
            FetchMode::Force => &["-u", "--force"],
        }
    }
}

/// Resolves the invocation mode for one story. Rules are checked
/// top-to-bottom; the first match wins.
pub fn resolve(method: UpdateMethod, behavior: UpdateBehavior) -> FetchMode {
    if method == UpdateMethod::UpdateNoForce {
        return FetchMode::Update;
    }
    if behavior == UpdateBehavior::Force {
        return FetchMode::Force;
    }
    match method {
        UpdateMethod::Force => FetchMode::Force,
        UpdateMethod::UpdateAlways => FetchMode::UpdateAlways,
        UpdateMethod::Update | UpdateMethod::UpdateNoForce => FetchMode::Update,
    }
}

/// Whether a force-indicated outcome may promote the story's behavior.
pub fn promotion_allowed(method: UpdateMethod) -> bool {
    method != UpdateMethod::UpdateNoForce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_no_force_ignores_all_force_requests() {
        assert_eq!(
            resolve(UpdateMethod::UpdateNoForce, UpdateBehavior::Force),
            FetchMode::Update
        );
        assert_eq!(
            resolve(UpdateMethod::UpdateNoForce, UpdateBehavior::Update),
            FetchMode::Update
        );
    }

    #[test]
    fn story_force_beats_configured_method() {
        assert_eq!(resolve(UpdateMethod::Update, UpdateBehavior::Force), FetchMode::Force);
        assert_eq!(resolve(UpdateMethod::UpdateAlways, UpdateBehavior::Force), FetchMode::Force);
    }

    #[test]
    fn configured_method_applies_without_story_force() {
        assert_eq!(resolve(UpdateMethod::Force, UpdateBehavior::Update), FetchMode::Force);
        assert_eq!(
            resolve(UpdateMethod::UpdateAlways, UpdateBehavior::Update),
            FetchMode::UpdateAlways
        );
        assert_eq!(resolve(UpdateMethod::Update, UpdateBehavior::Update), FetchMode::Update);
    }

    #[test]
    fn promotion_blocked_only_under_update_no_force() {
        assert!(promotion_allowed(UpdateMethod::Update));
        assert!(promotion_allowed(UpdateMethod::UpdateAlways));
        assert!(promotion_allowed(UpdateMethod::Force));
        assert!(!promotion_allowed(UpdateMethod::UpdateNoForce));
    }

    #[test]
    fn update_no_force_never_emits_force_flag() {
        for behavior in [UpdateBehavior::Update, UpdateBehavior::Force] {
            let mode = resolve(UpdateMethod::UpdateNoForce, behavior);
            assert!(!mode.args().contains(&"--force"));
        }
    }
}
