use std::path::{Path, PathBuf};

/// Resolve the directory holding the root stack file.
///
/// `--workdir` / `STACK_WORKDIR` wins and is made absolute against the
/// current directory; otherwise the current directory is used.
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match explicit {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) if p == Path::new(".") => cwd,
        Some(p) => cwd.join(p),
        None => cwd,
    }
}
