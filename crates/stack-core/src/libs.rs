//! Library search paths used to resolve `stacks` patterns.

use crate::config::LibItem;
use crate::error::{Result, StackError};
use crate::git;
use crate::paths;
use crate::runtime::Runtime;
use std::path::{Path, PathBuf};

const DEFAULT_LIB_REF: &str = "HEAD";

/// Search paths for a unit: its own directory, declared libs in order, then
/// the root directory. Duplicates keep their first position.
pub fn resolve(rt: &Runtime, workdir: &Path, items: &[LibItem]) -> Result<Vec<PathBuf>> {
    let root = rt.settings().root.clone();
    let mut out = vec![workdir.to_path_buf()];
    for item in items {
        out.push(resolve_item(rt, workdir, &root, item)?);
    }
    out.push(root);

    let mut seen = std::collections::HashSet::new();
    out.retain(|p| seen.insert(p.clone()));
    Ok(out)
}

fn resolve_item(rt: &Runtime, workdir: &Path, root: &Path, item: &LibItem) -> Result<PathBuf> {
    match item {
        LibItem::Path(path) => {
            let found = paths::find_path(path, &[workdir.to_path_buf(), root.to_path_buf()])?;
            if !found.is_dir() {
                return Err(StackError::BadLib(path.clone()));
            }
            Ok(found)
        }
        LibItem::Git {
            git: url,
            reference,
            path,
        } => {
            let reference = reference.as_deref().unwrap_or(DEFAULT_LIB_REF);
            let checkout = rt
                .settings()
                .gitlibs_dir
                .join(paths::sanitize_component(url))
                .join(paths::sanitize_component(reference));
            rt.with_git_lock(&checkout, || {
                git::sync_repo(url, reference, &checkout, rt.settings().default_timeout)
            })?;
            let dir = checkout.join(path.as_deref().unwrap_or("."));
            if !dir.is_dir() {
                return Err(StackError::BadLib(format!(
                    "{url}: '{}' is not a directory",
                    path.as_deref().unwrap_or(".")
                )));
            }
            Ok(dir)
        }
    }
}
