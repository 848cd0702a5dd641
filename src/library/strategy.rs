//! Update strategies for integrating a fetched story into the library.
//!
//! New stories are always a plain add. For existing entries the configured
//! preservation mode decides how much of the old record survives. The
//! remove/add sequences run under the client's mutation lock so they are
//! atomic per story with respect to other workers.

use std::path::Path;

use tracing::debug;

use crate::config::MetadataPreservationMode;
use crate::types::LibraryId;

use super::{LibraryClient, LibraryError};

/// Integrates a downloaded epub, returning the id it ended up under.
pub async fn integrate_story(
    client: &LibraryClient,
    mode: MetadataPreservationMode,
    existing: Option<LibraryId>,
    epub: &Path,
) -> Result<LibraryId, LibraryError> {
    let Some(id) = existing else {
        let id = client.add(epub).await?;
        debug!(%id, "added new story to library");
        return Ok(id);
    };

    match mode {
        MetadataPreservationMode::RemoveAdd => {
            let _lock = client.mutation_lock().await;
            client.remove(id).await?;
            let new_id = client.add(epub).await?;
            debug!(old = %id, new = %new_id, "replaced library entry");
            Ok(new_id)
        }
        MetadataPreservationMode::PreserveMetadata => {
            let _lock = client.mutation_lock().await;
            let fields = client.custom_fields(id).await?;
            client.remove(id).await?;
            let new_id = client.add(epub).await?;
            client.restore_custom_fields(new_id, &fields).await;
            debug!(
                old = %id,
                new = %new_id,
                restored = fields.len(),
                "replaced library entry, custom fields restored"
            );
            Ok(new_id)
        }
        MetadataPreservationMode::AddFormat => {
            client.replace_format(id, epub).await?;
            debug!(%id, "swapped stored file in place");
            Ok(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LibraryConfig;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// A fake CLI that appends each invocation's arguments to a log file
    /// and answers `list` and `add` with canned output.
    fn logging_cli(dir: &Path) -> (PathBuf, PathBuf) {
        let log = dir.join("calls.log");
        let path = dir.join("fake-calibredb");
        let body = format!(
            r##"#!/bin/sh
echo "$@" >> "{log}"
case "$1" in
  list) echo '[{{"id": 5, "#read": true}}]' ;;
  add) echo "Added book ids: 9" ;;
esac
"##,
            log = log.display()
        );
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        (path, log)
    }

    fn client(dir: &Path) -> (LibraryClient, PathBuf) {
        let (script, log) = logging_cli(dir);
        let config = LibraryConfig { path: "/books".to_string(), ..LibraryConfig::default() };
        (LibraryClient::with_program(script, &config), log)
    }

    fn calls(log: &Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn new_story_is_plain_add() {
        let dir = tempfile::tempdir().unwrap();
        let (client, log) = client(dir.path());

        let id = integrate_story(
            &client,
            MetadataPreservationMode::RemoveAdd,
            None,
            Path::new("/tmp/s.epub"),
        )
        .await
        .unwrap();

        assert_eq!(id, LibraryId(9));
        let calls = calls(&log);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("add"));
    }

    #[tokio::test]
    async fn remove_add_removes_then_adds() {
        let dir = tempfile::tempdir().unwrap();
        let (client, log) = client(dir.path());

        let id = integrate_story(
            &client,
            MetadataPreservationMode::RemoveAdd,
            Some(LibraryId(5)),
            Path::new("/tmp/s.epub"),
        )
        .await
        .unwrap();

        assert_eq!(id, LibraryId(9));
        let calls = calls(&log);
        assert!(calls[0].starts_with("remove 5"));
        assert!(calls[1].starts_with("add"));
    }

    #[tokio::test]
    async fn preserve_metadata_exports_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let (client, log) = client(dir.path());

        let id = integrate_story(
            &client,
            MetadataPreservationMode::PreserveMetadata,
            Some(LibraryId(5)),
            Path::new("/tmp/s.epub"),
        )
        .await
        .unwrap();

        assert_eq!(id, LibraryId(9));
        let calls = calls(&log);
        assert!(calls[0].starts_with("list"), "first call should dump fields: {}", calls[0]);
        assert!(calls[1].starts_with("remove 5"));
        assert!(calls[2].starts_with("add"));
        assert!(
            calls[3].starts_with("set_custom read 9"),
            "custom field should be restored on the new id: {}",
            calls[3]
        );
    }

    #[tokio::test]
    async fn add_format_swaps_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let (client, log) = client(dir.path());

        let id = integrate_story(
            &client,
            MetadataPreservationMode::AddFormat,
            Some(LibraryId(5)),
            Path::new("/tmp/s.epub"),
        )
        .await
        .unwrap();

        assert_eq!(id, LibraryId(5));
        let calls = calls(&log);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("add_format --replace 5"));
    }
}
