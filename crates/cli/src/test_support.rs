use std::sync::{Mutex, MutexGuard, OnceLock};

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Serializes environment mutation across tests and restores the touched
/// variables when dropped.
pub(crate) struct EnvGuard {
    saved: Vec<(&'static str, Option<String>)>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Locks the environment and snapshots `keys`.
    pub(crate) fn new(keys: &[&'static str]) -> Self {
        let lock = env_lock().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let saved = keys.iter().map(|k| (*k, std::env::var(k).ok())).collect();
        Self { saved, _lock: lock }
    }

    pub(crate) fn set(&self, key: &str, value: &str) {
        // SAFETY: every writer holds the environment lock.
        unsafe {
            std::env::set_var(key, value);
        }
    }

    pub(crate) fn remove(&self, key: &str) {
        // SAFETY: every writer holds the environment lock.
        unsafe {
            std::env::remove_var(key);
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.saved {
            match value {
                Some(value) => self.set(key, value),
                None => self.remove(key),
            }
        }
    }
}
