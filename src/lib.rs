pub mod config;
pub mod credentials;
pub mod gateway;
pub mod runtime;
pub mod scheduler;
pub mod validator;
pub mod web;

pub use changuard_app::logging;
pub use changuard_core::channel;
pub use changuard_core::clock;
pub use changuard_core::error;
pub use changuard_core::permissions;
pub use changuard_core::text;
pub use changuard_storage::db;
pub use changuard_storage::history;

#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    pub fn env_lock() -> MutexGuard<'static, ()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
