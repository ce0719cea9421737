//! Filesystem-backed collaborators: devfile repository and parent resolver
//! rooted at a directory. Used by the CLI; tests favour the in-memory
//! variants.

use std::path::{Component as PathComponent, Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use devspace_devfile::flatten::ParentResolver;
use devspace_devfile::ParentRef;

use crate::DevfileRepository;

fn resolve_under(root: &Path, reference: &str) -> Result<PathBuf> {
    let rel = Path::new(reference);
    if rel.is_absolute() || rel.components().any(|c| matches!(c, PathComponent::ParentDir)) {
        return Err(anyhow!("reference '{}' must stay inside the devfile root", reference));
    }
    Ok(root.join(rel))
}

/// Reads devfiles from disk relative to a root directory. References may not
/// escape the root.
pub struct FsRepository {
    root: PathBuf,
}

impl FsRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DevfileRepository for FsRepository {
    fn fetch(&self, reference: &str) -> Result<String> {
        let path = resolve_under(&self.root, reference)?;
        std::fs::read_to_string(&path).with_context(|| format!("reading devfile {}", path.display()))
    }
}

/// Resolves parent `uri` references against the same root directory.
pub struct FsParentResolver {
    root: PathBuf,
}

impl FsParentResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ParentResolver for FsParentResolver {
    fn resolve(&self, parent: &ParentRef) -> Result<Option<String>> {
        let Some(uri) = parent.uri.as_deref() else {
            // registry ids are not resolvable from disk
            return Ok(None);
        };
        let uri = uri.strip_prefix("./").unwrap_or(uri);
        let path = resolve_under(&self.root, uri)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading parent devfile {}", path.display()))?;
        Ok(Some(raw))
    }
}
