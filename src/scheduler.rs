//! Tick sources and the single-flight guard
//!
//! Both background loops are driven by a [`TickSource`]. Production uses
//! [`IntervalTicker`]; tests drive ticks by hand through [`ManualTicker`].
//!
//! A tick body that overruns its interval is still running when the next tick
//! fires. [`SingleFlight`] makes that second attempt a cheap no-op instead of
//! a concurrent pass over the same state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Source of periodic wake-ups
#[async_trait]
pub trait TickSource: Send {
    /// Wait for the next tick. `false` means the source is exhausted.
    async fn next_tick(&mut self) -> bool;
}

/// Builds a fresh tick source each time a loop is (re)started
pub type TickSourceFactory = Arc<dyn Fn() -> Box<dyn TickSource> + Send + Sync>;

// ============================================================
// Interval ticker
// ============================================================

/// Wall-clock ticker. Missed ticks are skipped, never burst.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    /// First tick fires immediately
    pub fn new(period: Duration) -> Self {
        Self::build(Instant::now(), period)
    }

    /// First tick fires after one full period
    pub fn delayed(period: Duration) -> Self {
        Self::build(Instant::now() + period, period)
    }

    fn build(start: Instant, period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(start, period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub fn factory(period: Duration, delayed: bool) -> TickSourceFactory {
        Arc::new(move || {
            let ticker = if delayed {
                IntervalTicker::delayed(period)
            } else {
                IntervalTicker::new(period)
            };
            Box::new(ticker) as Box<dyn TickSource>
        })
    }
}

#[async_trait]
impl TickSource for IntervalTicker {
    async fn next_tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

// ============================================================
// Manual ticker
// ============================================================

/// Ticker fired explicitly through a [`ManualTickHandle`]
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

#[async_trait]
impl TickSource for ManualTicker {
    async fn next_tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

/// Fires ticks into whichever [`ManualTicker`] the factory built last
#[derive(Clone, Default)]
pub struct ManualTickHandle {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<()>>>>,
}

impl ManualTickHandle {
    /// Factory plus the handle that drives every ticker it creates
    pub fn factory() -> (TickSourceFactory, ManualTickHandle) {
        let handle = ManualTickHandle::default();
        let slot = handle.tx.clone();
        let factory: TickSourceFactory = Arc::new(move || {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Ok(mut guard) = slot.lock() {
                *guard = Some(tx);
            }
            Box::new(ManualTicker { rx }) as Box<dyn TickSource>
        });
        (factory, handle)
    }

    /// Fire one tick. Returns `false` if no live ticker is listening.
    pub fn tick(&self) -> bool {
        match self.tx.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|tx| tx.send(()).is_ok()),
            Err(_) => false,
        }
    }

    /// Drop the sender so the current ticker reports exhaustion
    pub fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

// ============================================================
// Single flight
// ============================================================

/// At most one holder at a time; entry never blocks.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the section, or `None` if someone is already inside
    pub fn try_enter(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { busy: &self.busy })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the [`SingleFlight`] on drop, including on panic unwind
#[derive(Debug)]
pub struct FlightGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
