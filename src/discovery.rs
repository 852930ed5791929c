/// Transcript discovery under the projects directory.
///
/// Layout: `<root>/<project-slug>/<session>.jsonl`, with subagent transcripts
/// nested deeper under the same project slug.
use std::path::{Component, Path, PathBuf};

/// Recursively find all `.jsonl` files under `root`, sorted.
pub fn find_jsonl_files(root: &Path) -> Vec<PathBuf> {
    let pattern = format!(
        "{}/**/*.jsonl",
        glob::Pattern::escape(&root.to_string_lossy())
    );
    let entries = match glob::glob(&pattern) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, root = %root.display(), "invalid discovery pattern");
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(path) if path.is_file() => Some(path),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable path");
                None
            }
        })
        .collect();
    files.sort();
    files
}

/// Project label for a transcript: the first path component beneath `root`.
///
/// Falls back to the component following a literal `projects` segment, then
/// to `"unknown"`.
pub fn project_name(root: &Path, path: &Path) -> String {
    if let Ok(rel) = path.strip_prefix(root) {
        let mut parts = rel.components();
        if let (Some(Component::Normal(first)), Some(_)) = (parts.next(), parts.next()) {
            return first.to_string_lossy().into_owned();
        }
    }

    let parts: Vec<_> = path.components().collect();
    parts
        .iter()
        .position(|c| c.as_os_str() == "projects")
        .and_then(|idx| parts.get(idx + 1))
        .filter(|c| matches!(c, Component::Normal(_)))
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Session id for tool events: the file stem.
pub fn file_session_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
