//! Background task handles with explicit cancellation.
//!
//! Every long-lived thread the controller starts is wrapped in a
//! [`TaskHandle`] so shutdown can cancel and join it deterministically.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap_or_else(|p| p.into_inner());
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleeps for `timeout` or until cancelled. Returns `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = lock.lock().unwrap_or_else(|p| p.into_inner());
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = match cvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

pub struct TaskHandle {
    name: &'static str,
    token: CancelToken,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawns `body` on a named thread with a fresh token.
    pub fn spawn<F>(name: &'static str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let token = CancelToken::new();
        let task_token = token.clone();
        let join = thread::Builder::new()
            .name(format!("flowforge-{name}"))
            .spawn(move || body(task_token))?;
        Ok(Self {
            name,
            token,
            join: Some(join),
        })
    }

    pub fn cancel_and_join(mut self) {
        self.token.cancel();
        self.join_inner();
    }

    fn join_inner(&mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!(task = self.name, "Background task panicked");
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.token.cancel();
        self.join_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_early_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || remote.wait_timeout(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().expect("join"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_times_out_without_cancel() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_and_join_stops_loop() {
        let handle = TaskHandle::spawn("test-loop", |token| {
            while !token.wait_timeout(Duration::from_millis(5)) {}
        })
        .expect("spawn");
        handle.cancel_and_join();
    }
}
