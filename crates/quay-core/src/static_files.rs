//! Static content resolution.
//!
//! The server core only sees the [`StaticResolver`] interface; the
//! bundled [`DirResolver`] serves a directory tree from disk.
//!
//! # Security
//!
//! `DirResolver` refuses path traversal: URI paths are rebuilt
//! component-by-component and any `..` (or other non-normal component)
//! rejects the request before the filesystem is touched.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::response::mime_type_for_extension;

/// Resolved static content.
#[derive(Debug, Clone)]
pub struct StaticContent {
    /// File contents.
    pub bytes: Vec<u8>,
    /// Content-Type value.
    pub content_type: &'static str,
    /// Modification time, when the backing store knows one.
    pub last_modified: Option<SystemTime>,
}

/// Maps a URI path to static content.
pub trait StaticResolver: Send {
    /// Resolve a URI path (query string already stripped).
    ///
    /// Returns `None` for anything that should 404.
    fn resolve(&self, uri_path: &str) -> Option<StaticContent>;
}

/// Filesystem-backed resolver rooted at a directory.
#[derive(Debug, Clone)]
pub struct DirResolver {
    root: PathBuf,
}

impl DirResolver {
    /// Create a resolver serving files under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a URI path onto the root, rejecting traversal.
    fn map_path(&self, uri_path: &str) -> Option<PathBuf> {
        let clean = uri_path.trim_start_matches('/');
        if clean.is_empty() || clean.ends_with('/') {
            // Directory request; serve its index.
            return self.map_path(&format!("/{clean}index.html"));
        }
        if clean.contains('\\') {
            return None;
        }
        // Hidden files are not served.
        if clean.split('/').any(|part| part.starts_with('.')) {
            return None;
        }
        let mut mapped = self.root.clone();
        for comp in Path::new(clean).components() {
            match comp {
                Component::Normal(part) => mapped.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(mapped)
    }
}

impl StaticResolver for DirResolver {
    fn resolve(&self, uri_path: &str) -> Option<StaticContent> {
        let path = self.map_path(uri_path)?;
        if !path.is_file() {
            return None;
        }
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read static file");
                return None;
            }
        };
        let content_type = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or("application/octet-stream", mime_type_for_extension);
        let last_modified = std::fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .ok();
        Some(StaticContent {
            bytes,
            content_type,
            last_modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> (tempfile::TempDir, DirResolver) {
        let dir = tempfile::tempdir().expect("create temp dir");
        fs::write(dir.path().join("index.html"), b"<h1>home</h1>").unwrap();
        fs::write(dir.path().join("app.js"), b"console.log(1);").unwrap();
        fs::write(dir.path().join(".secret"), b"nope").unwrap();
        let resolver = DirResolver::new(dir.path());
        (dir, resolver)
    }

    #[test]
    fn resolves_plain_file() {
        let (_dir, resolver) = fixture();
        let content = resolver.resolve("/app.js").expect("app.js resolves");
        assert_eq!(content.bytes, b"console.log(1);");
        assert_eq!(content.content_type, "text/javascript; charset=utf-8");
        assert!(content.last_modified.is_some());
    }

    #[test]
    fn root_serves_index() {
        let (_dir, resolver) = fixture();
        let content = resolver.resolve("/").expect("index resolves");
        assert_eq!(content.bytes, b"<h1>home</h1>");
        assert_eq!(content.content_type, "text/html; charset=utf-8");
    }

    #[test]
    fn traversal_is_rejected() {
        let (_dir, resolver) = fixture();
        assert!(resolver.resolve("/../etc/passwd").is_none());
        assert!(resolver.resolve("/a/../../etc/passwd").is_none());
        assert!(resolver.resolve("/..\\win").is_none());
    }

    #[test]
    fn hidden_files_are_not_served() {
        let (_dir, resolver) = fixture();
        assert!(resolver.resolve("/.secret").is_none());
    }

    #[test]
    fn missing_file_is_none() {
        let (_dir, resolver) = fixture();
        assert!(resolver.resolve("/nope.txt").is_none());
    }
}
