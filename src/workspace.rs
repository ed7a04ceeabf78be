//! Workspace context and per-workspace storage layout.

use std::path::{Path, PathBuf};

/// Handle identifying one tenant-isolated workspace and its storage directory.
#[derive(Debug, Clone)]
pub struct WorkspaceContext {
    pub workspace_id: i64,
    pub workspace_slug: String,
    /// Resolved `<root>/<slug>` directory owning the indexes and artifacts.
    pub storage_root: PathBuf,
}

impl WorkspaceContext {
    /// Build a context from a raw workspace name, resolving the storage
    /// directory under `root`.
    pub fn new(workspace_id: i64, name: &str, root: &Path) -> Self {
        let slug = slugify(name);
        let storage_root = root.join(&slug);
        Self {
            workspace_id,
            workspace_slug: slug,
            storage_root,
        }
    }

    /// Directory holding the dense vector store.
    pub fn vector_dir(&self) -> PathBuf {
        self.storage_root.join("lancedb")
    }

    /// Path of the persisted keyword index.
    pub fn bm25_path(&self) -> PathBuf {
        self.storage_root.join("bm25.index")
    }

    /// Directory for exported Drive PDFs.
    pub fn pdf_dir(&self) -> PathBuf {
        self.storage_root.join("googledrive").join("pdf")
    }

    /// Directory for JSONL audit records.
    pub fn jsonl_dir(&self) -> PathBuf {
        self.storage_root.join("jsonl")
    }

    /// Create the storage directories if they do not exist.
    pub fn ensure_storage(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.storage_root)?;
        std::fs::create_dir_all(self.vector_dir())?;
        std::fs::create_dir_all(self.pdf_dir())?;
        std::fs::create_dir_all(self.jsonl_dir())?;
        Ok(())
    }
}

/// Filesystem-friendly slug derived from the workspace name.
///
/// Lowercases, replaces invalid characters with `-`, collapses any run of
/// dashes to one, and trims leading/trailing separator characters.
pub fn slugify(name: &str) -> String {
    let normalized = name.trim().to_lowercase();
    if normalized.is_empty() {
        return "workspace".to_string();
    }

    // First pass: map every invalid character to a dash.
    let sanitized: String = normalized
        .chars()
        .map(|ch| {
            if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '-'
            }
        })
        .collect();

    // Second pass: collapse dash runs, whether generated or literal.
    let mut collapsed = String::with_capacity(sanitized.len());
    let mut last_was_dash = false;
    for ch in sanitized.chars() {
        if ch == '-' {
            if !last_was_dash {
                collapsed.push(ch);
            }
            last_was_dash = true;
        } else {
            collapsed.push(ch);
            last_was_dash = false;
        }
    }

    let slug = collapsed.trim_matches(|c| matches!(c, '-' | '.' | '_'));
    if slug.is_empty() {
        "workspace".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::slugify;

    #[test]
    fn slugify_sanitizes_names() {
        assert_eq!(slugify("My Workspace"), "my-workspace");
        assert_eq!(slugify("  Team (QA) 2024  "), "team-qa-2024");
        assert_eq!(slugify("---"), "workspace");
        assert_eq!(slugify(""), "workspace");
        assert_eq!(slugify("data_eng.prod"), "data_eng.prod");
    }

    #[test]
    fn slugify_collapses_separator_runs() {
        assert_eq!(slugify("a   b"), "a-b");
        assert_eq!(slugify("a!!!b"), "a-b");
        // Literal dashes collapse the same way generated ones do.
        assert_eq!(slugify("Team--QA"), "team-qa");
        assert_eq!(slugify("a-- --b"), "a-b");
    }
}
