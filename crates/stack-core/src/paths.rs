use crate::error::{Result, StackError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const STACK_FILE_STEM: &str = "stack";
pub const STACK_FILE_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

pub const GITCLONE_DIR: &str = ".gitclone";
pub const DEFAULT_GITLIBS_DIR: &str = ".gitlibs";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Stack file of a directory: `stack.{yaml,yml,json}`, then
/// `<dirname>.{yaml,yml,json}`.
pub fn find_stack_file(dir: &Path) -> Result<PathBuf> {
    let dir_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let stems = [STACK_FILE_STEM, dir_name];
    stems
        .iter()
        .filter(|s| !s.is_empty())
        .flat_map(|stem| {
            STACK_FILE_EXTENSIONS
                .iter()
                .map(move |ext| dir.join(format!("{stem}.{ext}")))
        })
        .find(|p| p.is_file())
        .ok_or_else(|| StackError::StackFileNotFound(dir.to_path_buf()))
}

pub fn has_stack_file(dir: &Path) -> bool {
    find_stack_file(dir).is_ok()
}

/// Sub-directories of `dir` whose name fully matches `pattern` and that hold
/// a stack file. Hidden directories are skipped. Sorted by name.
pub fn matching_stack_dirs(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let re = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| StackError::BadPattern {
        pattern: pattern.to_string(),
        source,
    })?;
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(Vec::new());
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            !name.starts_with('.') && re.is_match(&name)
        })
        .map(|e| e.path())
        .filter(|p| has_stack_file(p))
        .collect();
    found.sort();
    Ok(found)
}

/// Resolve `name` against each search directory in order. Absolute paths are
/// only checked for existence.
pub fn find_path(name: &str, search: &[PathBuf]) -> Result<PathBuf> {
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        if candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
    } else if let Some(found) = search.iter().map(|d| d.join(name)).find(|p| p.exists()) {
        return Ok(found);
    }
    Err(StackError::PathNotFound {
        path: name.to_string(),
        searched: display_list(search),
    })
}

pub fn display_list(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

static UNSAFE_CHARS_RE: OnceLock<Regex> = OnceLock::new();

fn unsafe_chars_re() -> &'static Regex {
    UNSAFE_CHARS_RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap())
}

/// Turn a repository URL or ref into a single path component.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned = unsafe_chars_re().replace_all(raw, "_");
    let trimmed = cleaned.trim_matches(|c| c == '_' || c == '.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Join a possibly relative path onto `base`.
pub fn absolutize(base: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
