use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::trace;

const DEFAULT_TIMEOUT_SECS: u64 = 20 * 60;

/// Watchdog timeout, overridable through `STDEADLOCKTIMEOUT` (integer
/// seconds).
pub(crate) fn timeout_from_env() -> Duration {
    let secs = std::env::var("STDEADLOCKTIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);

    Duration::from_secs(secs)
}

/// Spawns a monitor thread that periodically write-acquires `lock` and
/// panics if the acquisition does not succeed within `timeout`; a lock
/// held that long means a task wedged while holding it. The thread exits
/// once the lock's owner is dropped.
pub(crate) fn deadlock_detect<T>(name: &'static str, lock: &Arc<RwLock<T>>, timeout: Duration)
where
    T: Send + Sync + 'static,
{
    let weak: Weak<RwLock<T>> = Arc::downgrade(lock);

    let _handle = std::thread::Builder::new()
        .name(format!("watchdog-{name}"))
        .spawn(move || loop {
            std::thread::sleep(timeout);

            let Some(lock) = weak.upgrade() else {
                return;
            };

            match lock.try_write_for(timeout) {
                Some(_guard) => trace!(lock = name, "Watchdog acquired and released"),
                None => panic!(
                    "deadlock detected: {name} lock held for more than {}s",
                    timeout.as_secs()
                ),
            };
        });
}
