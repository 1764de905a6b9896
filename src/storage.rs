use crate::config::save_json_atomic;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Small key-value state the client keeps between runs.
///
/// `score` is kept as a raw JSON value because the game writes whatever it
/// has; readers must tolerate strings, numbers, or garbage.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(crate) struct ClientState {
    pub(crate) score: Option<Value>,
    pub(crate) tier: Option<String>,
    pub(crate) last_invoice_id: Option<String>,
    pub(crate) game_session_id: Option<String>,
}

pub(crate) struct LocalStore {
    path: Option<PathBuf>,
    state: Mutex<ClientState>,
}

impl LocalStore {
    pub(crate) fn open(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(read_state(path)),
        }
    }

    #[cfg(test)]
    pub(crate) fn in_memory(state: ClientState) -> Self {
        Self {
            path: None,
            state: Mutex::new(state),
        }
    }

    pub(crate) fn snapshot(&self) -> ClientState {
        self.lock().clone()
    }

    /// Re-read the backing file, picking up writes made by another process.
    pub(crate) fn reload(&self) {
        if let Some(path) = &self.path {
            *self.lock() = read_state(path);
        }
    }

    /// Apply `f` and persist. Nothing is written when `f` leaves the state unchanged.
    pub(crate) fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ClientState),
    {
        let mut st = self.lock();
        let before = st.clone();
        f(&mut *st);
        if *st == before {
            return Ok(());
        }
        if let Some(path) = &self.path {
            save_json_atomic(path, &*st)
                .with_context(|| format!("could not save {}", path.display()))?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClientState> {
        // A panic while holding the lock leaves plain data behind; keep using it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn read_state(path: &Path) -> ClientState {
    if let Ok(s) = fs::read_to_string(path) {
        match serde_json::from_str::<ClientState>(&s) {
            Ok(st) => return st,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "store unreadable, starting empty"
                )
            }
        }
    }
    ClientState::default()
}
