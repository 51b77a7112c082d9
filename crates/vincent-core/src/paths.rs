use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// File constants
// ---------------------------------------------------------------------------

pub const STATE_FILE: &str = ".e2e-state.json";
pub const CONFIG_FILE: &str = ".vincent-e2e.yaml";

/// Fallback partition name when the caller's file cannot be determined.
pub const UNKNOWN_TEST_FILE: &str = "unknown-test.rs";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn state_path(root: &Path) -> PathBuf {
    root.join(STATE_FILE)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Reduce a source path to the file-name component used as a partition key.
pub fn test_file_name(source: &str) -> String {
    Path::new(source)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(UNKNOWN_TEST_FILE)
        .to_string()
}

/// Partition name for the code that called into this function.
#[track_caller]
pub fn caller_test_file() -> String {
    test_file_name(std::panic::Location::caller().file())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
