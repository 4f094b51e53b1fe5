use futures::future::BoxFuture;
use std::time::Duration;

// Wall-clock time and cancellable delay behind one seam so the selection,
// ledger and dispatch state machines can be driven deterministically in tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
pub struct ManualClock {
    now: std::sync::atomic::AtomicI64,
    slept: std::sync::Mutex<Vec<u64>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: std::sync::atomic::AtomicI64::new(start_ms),
            slept: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn slept_ms(&self) -> Vec<u64> {
        self.slept.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }

    // Sleeping advances virtual time immediately so tests never block.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let ms = duration.as_millis() as u64;
        self.slept.lock().unwrap().push(ms);
        self.now
            .fetch_add(ms as i64, std::sync::atomic::Ordering::SeqCst);
        Box::pin(futures::future::ready(()))
    }
}
