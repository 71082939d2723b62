//! Tiered send scheduling
//!
//! Critical operations are never scheduled here; the coordinator sends them
//! at once. A normal-tier window restarts on every edit so bursts coalesce,
//! but never extends past `normal_max_wait_ms` from the first edit of the
//! burst. The background window is fixed: further edits ride along with the
//! pending one instead of pushing it back.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::queue::Priority;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub normal_debounce_ms: u64,
    /// Upper bound on how long continuous edits can hold back a send
    pub normal_max_wait_ms: u64,
    pub background_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            normal_debounce_ms: 300,
            normal_max_wait_ms: 2_000,
            background_delay_ms: 5_000,
        }
    }
}

impl DispatchConfig {
    pub fn normal_debounce(&self) -> Duration {
        Duration::from_millis(self.normal_debounce_ms)
    }

    pub fn normal_max_wait(&self) -> Duration {
        Duration::from_millis(self.normal_max_wait_ms)
    }

    pub fn background_delay(&self) -> Duration {
        Duration::from_millis(self.background_delay_ms)
    }
}

struct Window {
    /// First schedule of the current burst
    opened_at: Instant,
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Windows {
    open: HashMap<Priority, Window>,
    next_generation: u64,
}

pub struct DispatchTimer {
    config: DispatchConfig,
    windows: Arc<Mutex<Windows>>,
}

impl DispatchTimer {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            windows: Arc::new(Mutex::new(Windows::default())),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Arrange for `fire` to run when the tier's window closes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, priority: Priority, fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };

        let opened_at = match (priority, windows.open.get(&priority)) {
            // Already pending; the queued entry goes out with it
            (Priority::Background, Some(_)) => return,
            (Priority::Normal, Some(window)) => {
                window.handle.abort();
                window.opened_at
            }
            _ => now,
        };

        let delay = match priority {
            Priority::Critical => Duration::ZERO,
            Priority::Normal => {
                let deadline = opened_at + self.config.normal_max_wait();
                self.config
                    .normal_debounce()
                    .min(deadline.saturating_duration_since(now))
            }
            Priority::Background => self.config.background_delay(),
        };

        let generation = windows.next_generation;
        windows.next_generation += 1;

        let shared = Arc::clone(&self.windows);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut windows = match shared.lock() {
                    Ok(w) => w,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if windows.open.get(&priority).map(|w| w.generation) == Some(generation) {
                    windows.open.remove(&priority);
                }
            }
            fire().await;
        });

        log::debug!("Scheduled {} dispatch in {:?}", priority, delay);
        windows.open.insert(
            priority,
            Window {
                opened_at,
                generation,
                handle,
            },
        );
    }

    pub fn is_pending(&self, priority: Priority) -> bool {
        match self.windows.lock() {
            Ok(w) => w.open.contains_key(&priority),
            Err(poisoned) => poisoned.into_inner().open.contains_key(&priority),
        }
    }

    /// Abort every pending window without firing.
    pub fn cancel_all(&self) {
        let mut windows = match self.windows.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, window) in windows.open.drain() {
            window.handle.abort();
        }
    }
}

impl Drop for DispatchTimer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_fire(count: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_restarts_on_each_edit() {
        let timer = DispatchTimer::new(DispatchConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            timer.schedule(Priority::Normal, counter_fire(&fired));
            settle(200).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timer.is_pending(Priority::Normal));

        settle(150).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending(Priority::Normal));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_edits_cannot_starve_sending() {
        let timer = DispatchTimer::new(DispatchConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));

        // An edit every 100ms for 3s; the window caps at 2s
        for _ in 0..30 {
            timer.schedule(Priority::Normal, counter_fire(&fired));
            settle(100).await;
        }
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_window_is_not_pushed_back() {
        let timer = DispatchTimer::new(DispatchConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));

        timer.schedule(Priority::Background, counter_fire(&fired));
        settle(4_000).await;
        timer.schedule(Priority::Background, counter_fire(&fired));
        settle(1_100).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let timer = DispatchTimer::new(DispatchConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));

        timer.schedule(Priority::Normal, counter_fire(&fired));
        timer.cancel_all();
        settle(5_000).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
