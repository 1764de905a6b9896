use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(crate) struct Settings {
    pub(crate) api_base: String,
    pub(crate) poll_interval_secs: u64,
    pub(crate) invoice_ceiling_secs: u64,
    pub(crate) debounce_ms: u64,
    pub(crate) failsafe_secs: u64,
    pub(crate) request_timeout_secs: u64,
    pub(crate) download_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: "https://rgblightcat.com".to_string(),
            poll_interval_secs: 3,
            invoice_ceiling_secs: 15 * 60,
            debounce_ms: 2000,
            failsafe_secs: 30,
            request_timeout_secs: 20,
            download_dir: None,
        }
    }
}

impl Settings {
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub(crate) fn invoice_ceiling(&self) -> Duration {
        Duration::from_secs(self.invoice_ceiling_secs.max(1))
    }

    pub(crate) fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub(crate) fn failsafe(&self) -> Duration {
        Duration::from_secs(self.failsafe_secs.max(1))
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Base URL without a trailing slash, so endpoint paths can be appended.
    pub(crate) fn api_root(&self) -> &str {
        self.api_base.trim_end_matches('/')
    }
}

pub(crate) struct Paths {
    pub(crate) store_path: PathBuf,
    pub(crate) settings_path: PathBuf,
    pub(crate) download_dir: PathBuf,
}

pub(crate) fn project_paths() -> Result<Paths> {
    let proj = ProjectDirs::from("com", "rgblightcat", "Lightcat")
        .context("could not resolve project directories")?;
    let dir = proj.data_local_dir().to_path_buf();
    fs::create_dir_all(&dir)
        .with_context(|| format!("could not create data dir {}", dir.display()))?;
    Ok(Paths {
        store_path: dir.join("store.json"),
        settings_path: proj.config_dir().join("settings.json"),
        download_dir: dir.join("consignments"),
    })
}

pub(crate) fn load_settings(path: &Path) -> Settings {
    match fs::read_to_string(path) {
        Ok(s) => match serde_json::from_str::<Settings>(&s) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed settings");
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}

/// Write `value` as pretty JSON next to `path`, then rename it into place.
pub(crate) fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, data)?;
    atomic_rename(&tmp, path)?;
    Ok(())
}

fn atomic_rename(from: &Path, to: &Path) -> Result<()> {
    // Rename-over-existing is not atomic on Windows; remove first there.
    if cfg!(windows) && to.exists() {
        let _ = fs::remove_file(to);
    }
    fs::rename(from, to)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_fill_defaults() {
        let s: Settings = serde_json::from_str(r#"{"api_base":"http://localhost:3000/"}"#).unwrap();
        assert_eq!(s.api_root(), "http://localhost:3000");
        assert_eq!(s.poll_interval(), Duration::from_secs(3));
        assert_eq!(s.invoice_ceiling(), Duration::from_secs(900));
    }

    #[test]
    fn settings_survive_atomic_save() {
        let dir = std::env::temp_dir().join(format!("lightcat-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let mut s = Settings::default();
        s.debounce_ms = 500;
        save_json_atomic(&path, &s).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings(&path), s);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_settings_file_is_default() {
        let path = std::env::temp_dir().join("lightcat-does-not-exist/settings.json");
        assert_eq!(load_settings(&path), Settings::default());
    }
}
