use std::path::PathBuf;

use directories::BaseDirs;
use tracing::warn;

/// Root directory for recordings: `<data_local>/bb`.
pub fn recordings_root() -> PathBuf {
    let Some(base_dirs) = BaseDirs::new() else {
        warn!("couldn't find basedirs, storing recordings in /tmp/bb");
        return PathBuf::from("/tmp/bb");
    };
    base_dirs.data_local_dir().join("bb")
}

/// Per-application recording directory: `<data_local>/bb/<sanitized app>`.
pub fn recording_dir<S: AsRef<str>>(sanitized_app_name: S) -> PathBuf {
    recordings_root().join(sanitized_app_name.as_ref())
}
