//! # Prefsync
//!
//! Keeps a user's preference document in step with the backend: loads and
//! repairs it, lets the app edit it in memory, and writes it back through a
//! debounced, coalescing save queue with bounded retries.
//!
//! ```no_run
//! # async fn demo() -> Result<(), prefsync_lib::sync::SyncError> {
//! use prefsync_lib::{config::EngineConfig, sync::PreferenceStore};
//!
//! let config = EngineConfig::default();
//! let store = PreferenceStore::connect(&config)?;
//! store.load().await;
//! store.update(|doc| doc["jobTitles"] = serde_json::json!(["Animator"]));
//! store.save(false).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod sync;

use std::sync::Once;

static LOGGER: Once = Once::new();

/// Load `.env` and install the env_logger backend (default level `info`).
/// Safe to call more than once.
pub fn init_logging() {
    LOGGER.call_once(|| {
        dotenvy::dotenv().ok();
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
    });
}
