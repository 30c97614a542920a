use std::path::{Path, PathBuf};

/// Resolve the directory holding `.outreach/`.
///
/// `--root` / `OUTREACH_ROOT` wins; otherwise walk upward from the current
/// directory looking for `.outreach/`, falling back to the current directory
/// (which is where `init` creates it).
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_upward(&cwd).unwrap_or(cwd)
}

fn find_upward(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(outreach_core::paths::OUTREACH_DIR).is_dir())
        .map(Path::to_path_buf)
}
