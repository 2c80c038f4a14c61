//! Idle timer
//!
//! A dedicated thread sleeps until the deadline. `reset` pushes the
//! deadline out by the configured duration; if it is not called in time
//! the callback runs once on the timer thread. `cancel` disarms it.

use crate::http::lock;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

struct TimerState {
    deadline: Instant,
    armed: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

/// Fires a callback after `timeout` without a `reset`
pub struct Watchdog {
    shared: Arc<Shared>,
    timeout: Duration,
}

impl Watchdog {
    /// Arm the timer and spawn its thread
    pub fn start<F>(timeout: Duration, on_idle: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                deadline: Instant::now() + timeout,
                armed: true,
            }),
            changed: Condvar::new(),
        });

        let timer = Arc::clone(&shared);
        thread::Builder::new()
            .name("h2mux-watchdog".to_string())
            .spawn(move || run(timer, timeout, on_idle))?;

        Ok(Watchdog { shared, timeout })
    }

    /// Restart the idle clock
    pub fn reset(&self) {
        let mut state = lock(&self.shared.state);
        if state.armed {
            state.deadline = Instant::now() + self.timeout;
        }
    }

    /// Disarm; the callback will not run after this returns unless it
    /// was already running
    pub fn cancel(&self) {
        lock(&self.shared.state).armed = false;
        self.shared.changed.notify_all();
    }

    /// Whether the timer can still fire
    pub fn is_armed(&self) -> bool {
        lock(&self.shared.state).armed
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run<F: FnOnce()>(shared: Arc<Shared>, timeout: Duration, on_idle: F) {
    let mut state = lock(&shared.state);
    loop {
        if !state.armed {
            return;
        }

        let now = Instant::now();
        if now >= state.deadline {
            state.armed = false;
            break;
        }

        let wait = state.deadline - now;
        state = shared
            .changed
            .wait_timeout(state, wait)
            .unwrap_or_else(|e| e.into_inner())
            .0;
    }
    drop(state);

    tracing::debug!(timeout_ms = timeout.as_millis() as u64, "idle timeout expired");
    on_idle();
}
