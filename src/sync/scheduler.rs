//! Background Refresh Scheduler
//!
//! Periodically pulls the server copy of the preferences into the store,
//! so server-owned fields (plan, usage) stay current in long sessions.
//! Uses Tokio tasks for non-blocking background execution.

use super::store::PreferenceStore;
use crate::config::EngineConfig;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const MAX_INTERVAL_MINUTES: u64 = 1440;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            last_run: None,
        }
    }
}

impl SchedulerConfig {
    /// Enabled when the engine config asks for a refresh interval
    pub fn from_engine(config: &EngineConfig) -> Self {
        match config.refresh_interval_minutes {
            0 => Self::default(),
            minutes => Self {
                enabled: true,
                interval_minutes: minutes,
                last_run: None,
            },
        }
    }
}

/// Background scheduler for periodic refreshes
#[derive(Clone)]
pub struct BackgroundScheduler {
    store: PreferenceStore,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(1..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be 1-{} minutes, got {}",
            MAX_INTERVAL_MINUTES, interval_minutes
        )));
    }
    Ok(())
}

impl BackgroundScheduler {
    pub fn new(store: PreferenceStore) -> Self {
        Self::with_config(store, SchedulerConfig::default())
    }

    pub fn with_config(store: PreferenceStore, config: SchedulerConfig) -> Self {
        Self {
            store,
            config: Arc::new(RwLock::new(config)),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Start background refresh task
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let interval_minutes = self.config.read().await.interval_minutes;
        validate_interval(interval_minutes)?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let handle = tokio::spawn(Self::scheduler_loop(
            self.running.clone(),
            self.config.clone(),
            self.store.clone(),
            Duration::from_secs(60 * interval_minutes),
        ));

        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        log::info!("Background refresh started (interval: {} minutes)", interval_minutes);
        Ok(())
    }

    /// Stop background refresh task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(handle) = self.task_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }

        log::info!("Background refresh stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart the task if needed
    pub async fn update_config(&self, enabled: bool, interval_minutes: u64) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }

        if self.is_running() {
            let _ = self.stop().await;
        }

        if enabled {
            self.start().await?;
        }

        log::info!(
            "Refresh schedule updated: enabled={}, interval={} minutes",
            enabled,
            interval_minutes
        );
        Ok(())
    }

    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        config: Arc<RwLock<SchedulerConfig>>,
        store: PreferenceStore,
        period: Duration,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the store was just loaded
        interval.tick().await;

        loop {
            interval.tick().await;

            if !running.load(Ordering::SeqCst) {
                log::info!("Refresh loop: stopping (running flag is false)");
                break;
            }

            log::debug!("Background refresh triggered by scheduler");

            match store.refresh().await {
                Ok(_) => {
                    config.write().await.last_run = Some(store.now());
                }
                Err(e) => {
                    log::error!("Background refresh failed: {}", e);
                }
            }
        }

        log::info!("Refresh loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
