use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time source injected into every component that stamps or compares
/// instants (reservation access times, initialization deadlines, disposal
/// retries). Production code uses [`WallClock`]; tests provide their own
/// implementation so protocol timing is deterministic.
pub trait SystemClock: std::fmt::Debug + Send + Sync {
    fn now_millis(&self) -> i64;
    fn clone_box(&self) -> SharedClock;
}

#[derive(Debug)]
pub struct SharedClock(pub Arc<dyn SystemClock>);

impl Clone for SharedClock {
    fn clone(&self) -> Self {
        self.0.clone_box()
    }
}

impl std::ops::Deref for SharedClock {
    type Target = dyn SystemClock;
    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl From<SharedClock> for Arc<dyn SystemClock> {
    fn from(wrapper: SharedClock) -> Self {
        wrapper.0
    }
}

/// Real wall-clock time in epoch milliseconds.
#[derive(Debug, Clone)]
pub struct WallClock;

impl WallClock {
    pub fn shared() -> SharedClock {
        SharedClock(Arc::new(WallClock))
    }
}

impl SystemClock for WallClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as i64
    }

    fn clone_box(&self) -> SharedClock {
        SharedClock(Arc::new(self.clone()))
    }
}
