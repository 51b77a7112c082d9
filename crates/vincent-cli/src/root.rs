use std::path::{Path, PathBuf};
use vincent_core::paths;

/// Resolve the project root.
///
/// Priority:
/// 1. `--root` flag / `VINCENT_E2E_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for a state or config file
/// 3. Walk upward from `cwd` looking for `.git/`
/// 4. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    find_upward(&cwd, |dir| {
        paths::state_path(dir).is_file() || paths::config_path(dir).is_file()
    })
    .or_else(|| find_upward(&cwd, |dir| dir.join(".git").is_dir()))
    .unwrap_or(cwd)
}

fn find_upward(start: &Path, found: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    start.ancestors().find(|dir| found(dir)).map(Path::to_path_buf)
}
