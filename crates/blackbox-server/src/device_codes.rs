use std::{
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use tracing::{debug, warn};

/// Short device identifiers that authorize a client independently of the
/// whitelist. Backed by a JSON array on disk; `reload` is wired to whatever
/// external signal the embedder uses.
#[derive(Default)]
pub struct DeviceCodes {
    codes: Mutex<Vec<String>>,
    path: Option<PathBuf>,
}

impl DeviceCodes {
    pub fn new(path: Option<PathBuf>) -> Self {
        let codes = Self { codes: Mutex::new(Vec::new()), path };
        codes.reload();
        codes
    }

    pub fn reload(&self) {
        let Some(path) = &self.path else {
            return;
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Vec<String>>(&contents) {
                Ok(codes) => {
                    debug!(count = codes.len(), "device codes loaded");
                    *self.codes.lock().unwrap_or_else(PoisonError::into_inner) = codes;
                }
                Err(err) => warn!(?err, path = %path.display(), "device codes file is invalid"),
            },
            Err(err) => debug!(?err, path = %path.display(), "no device codes file"),
        }
    }

    pub fn set_codes(&self, codes: Vec<String>) {
        *self.codes.lock().unwrap_or_else(PoisonError::into_inner) = codes;
    }

    pub fn contains(&self, code: &str) -> bool {
        !code.is_empty()
            && self
                .codes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .any(|c| c == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_exactly() {
        let codes = DeviceCodes::default();
        codes.set_codes(vec!["devkit-7".into(), "qa-3".into()]);
        assert!(codes.contains("devkit-7"));
        assert!(!codes.contains("devkit"));
        assert!(!codes.contains(""));
    }

    #[test]
    fn reload_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device_codes.json");
        std::fs::write(&path, r#"["alpha", "beta"]"#).unwrap();
        let codes = DeviceCodes::new(Some(path.clone()));
        assert!(codes.contains("alpha"));

        std::fs::write(&path, r#"["gamma"]"#).unwrap();
        codes.reload();
        assert!(!codes.contains("alpha"));
        assert!(codes.contains("gamma"));
    }
}
