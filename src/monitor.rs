//! Worker liveness monitoring
//!
//! A single background loop polls every tracked worker about once a
//! second. A dead or faulted worker is recorded once in the crashed list
//! and stays there until the orchestrator clears it after a restart. A
//! slower periodic pointing check cross-validates the telescope against
//! the slew limits, independent of the slew-time validation.

use crate::astro;
use crate::config::ObservatoryConfig;
use crate::workers::{OpResult, Rig, WorkerFlags};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct TaskMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    tracked: Mutex<HashMap<String, WorkerFlags>>,
    crashed: Mutex<Vec<String>>,
}

impl TaskMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tracked: Mutex::new(HashMap::new()),
                crashed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start or re-start tracking a worker. Called again with the fresh
    /// flags after a worker is replaced.
    pub fn track(&self, name: &str, flags: WorkerFlags) {
        self.inner
            .tracked
            .lock()
            .unwrap()
            .insert(name.to_string(), flags);
    }

    /// One scan over the tracked workers; each failure is recorded once.
    pub fn sweep(&self) {
        let tracked = self.inner.tracked.lock().unwrap();
        let mut crashed = self.inner.crashed.lock().unwrap();
        for (name, flags) in tracked.iter() {
            let dead = !flags.is_running() || flags.is_crashed();
            if dead && !crashed.contains(name) {
                tracing::warn!("worker '{name}' is down, flagging for restart");
                crashed.push(name.clone());
            }
        }
    }

    pub fn crashed_workers(&self) -> Vec<String> {
        self.inner.crashed.lock().unwrap().clone()
    }

    /// Forget a recorded crash after the worker has been replaced.
    pub fn clear(&self, name: &str) {
        self.inner.crashed.lock().unwrap().retain(|n| n != name);
    }

    /// Run the monitor loop in the background.
    pub fn spawn_watch(&self, rig: Arc<Rig>, config: Arc<ObservatoryConfig>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut tick = 0u64;
            loop {
                interval.tick().await;
                monitor.sweep();
                tick += 1;
                if tick % 30 == 0 {
                    pointing_check(&rig, &config).await;
                }
            }
        })
    }
}

impl Default for TaskMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Independent sanity check that the mount is still pointing inside the
/// configured limits.
async fn pointing_check(rig: &Rig, config: &ObservatoryConfig) {
    let telescope = rig.telescope().await;
    if !telescope.is_live() {
        return;
    }
    let Ok(pending) = telescope.coordinates().await else {
        return;
    };
    if let OpResult::Done((ra_hours, dec_degrees)) = pending.wait(Duration::from_secs(5)).await {
        let jd = astro::julian_day(&Utc::now());
        let lst = astro::local_sidereal_time(jd, config.site.longitude);
        let altitude = astro::altitude_deg(ra_hours, dec_degrees, config.site.latitude, lst);
        if altitude < config.slew.min_altitude_deg {
            tracing::warn!(
                "pointing check: telescope at altitude {altitude:.1}° (limit {:.1}°)",
                config.slew.min_altitude_deg
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_worker_recorded_once() {
        let monitor = TaskMonitor::new();
        let flags = WorkerFlags::new();
        monitor.track("camera", flags.clone());

        monitor.sweep();
        assert!(monitor.crashed_workers().is_empty());

        flags.set_stopped();
        monitor.sweep();
        monitor.sweep();
        assert_eq!(monitor.crashed_workers(), vec!["camera".to_string()]);
    }

    #[test]
    fn crashed_flag_triggers_record() {
        let monitor = TaskMonitor::new();
        let flags = WorkerFlags::new();
        monitor.track("telescope", flags.clone());

        flags.mark_crashed();
        monitor.sweep();
        assert_eq!(monitor.crashed_workers(), vec!["telescope".to_string()]);
    }

    #[test]
    fn clear_resets_after_restart() {
        let monitor = TaskMonitor::new();
        let flags = WorkerFlags::new();
        monitor.track("camera", flags.clone());
        flags.mark_crashed();
        monitor.sweep();
        assert!(!monitor.crashed_workers().is_empty());

        // Replacement worker with healthy flags
        monitor.track("camera", WorkerFlags::new());
        monitor.clear("camera");
        monitor.sweep();
        assert!(monitor.crashed_workers().is_empty());
    }
}
