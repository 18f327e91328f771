//! Ticker thread driving a shared [TimerWheel].

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use super::{TimerError, TimerId, TimerWheel, MAX_TICKS, MIN_TICKS};

#[derive(Debug)]
struct Clock {
    wheel: TimerWheel<()>,
    /// When the wheel last advanced, or the service started.
    last_tick: Instant,
}

#[derive(Debug)]
struct Inner {
    clock: Mutex<Clock>,
    tick: Duration,
    shutdown: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Thread safe handle to a [TimerWheel] ticked every `tick` by a dedicated thread.
///
/// Callbacks run on the ticker thread once the wheel lock is released, so they may set
/// or cancel timers themselves, but must stay short.
#[derive(Debug, Clone)]
pub struct TimerService(Arc<Inner>);

impl TimerService {
    /// Spawn the ticker thread.
    pub fn start(tick: Duration) -> Result<Self, TimerError> {
        if tick.is_zero() {
            return Err(TimerError::TooShort(0));
        }

        let (shutdown, receiver) = flume::bounded::<()>(1);

        let service = TimerService(Arc::new(Inner {
            clock: Mutex::new(Clock {
                wheel: TimerWheel::new(),
                last_tick: Instant::now(),
            }),
            tick,
            shutdown,
            handle: Mutex::new(None),
        }));

        let inner = Arc::downgrade(&service.0);
        let handle = thread::Builder::new()
            .name("chaindht-timer".to_string())
            .spawn(move || run(inner, tick, receiver))
            .map_err(|_| TimerError::Shutdown)?;

        *service.0.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(service)
    }

    // === Getters ===

    pub fn tick_duration(&self) -> Duration {
        self.0.tick
    }

    /// Number of pending timers.
    pub fn pending(&self) -> usize {
        self.clock().wheel.len()
    }

    // === Public Methods ===

    /// Run `callback` once `duration` has elapsed, rounded up to whole ticks.
    ///
    /// The part of the current tick already elapsed counts against the timer, so it
    /// never fires early, and at most one tick late.
    pub fn set<F>(&self, duration: Duration, callback: F) -> Result<TimerId, TimerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut clock = self.clock();
        let ticks = self.ticks(duration, clock.last_tick.elapsed())?;

        clock
            .wheel
            .insert(ticks, (), Box::new(move |_, ()| callback()))
    }

    /// Cancel a pending timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.clock().wheel.cancel(id).is_ok()
    }

    /// Stop the ticker thread. Pending timers never fire.
    pub fn shutdown(&self) {
        let _ = self.0.shutdown.try_send(());

        let handle = self
            .0
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    // === Private Methods ===

    fn clock(&self) -> MutexGuard<'_, Clock> {
        // A panicking callback never holds this lock, recover from poisoning anyway.
        self.0.clock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ticks until `duration` has passed, `elapsed` into the current tick.
    fn ticks(&self, duration: Duration, elapsed: Duration) -> Result<u64, TimerError> {
        if duration.is_zero() {
            return Err(TimerError::TooShort(0));
        }

        let tick = self.0.tick.as_nanos();
        // A late ticker advances as soon as it wakes, the tick in progress is spent.
        let elapsed = elapsed.as_nanos().min(tick);
        let ticks = (duration.as_nanos() + elapsed).div_ceil(tick);

        let ticks = u64::try_from(ticks).map_err(|_| TimerError::TooLong(u64::MAX))?;

        if ticks < MIN_TICKS {
            return Err(TimerError::TooShort(ticks));
        }
        if ticks > MAX_TICKS {
            return Err(TimerError::TooLong(ticks));
        }

        Ok(ticks)
    }
}

fn run(inner: Weak<Inner>, tick: Duration, shutdown: Receiver<()>) {
    debug!(?tick, "Timer service started");

    loop {
        match shutdown.recv_timeout(tick) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }

        // Every handle was dropped.
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let fired = {
            let mut clock = inner.clock.lock().unwrap_or_else(|e| e.into_inner());
            clock.last_tick = Instant::now();
            clock.wheel.advance()
        };
        drop(inner);

        if !fired.is_empty() {
            trace!(count = fired.len(), "Timers expired");
        }

        for timer in fired {
            timer.fire();
        }
    }

    debug!("Timer service stopped");
}
