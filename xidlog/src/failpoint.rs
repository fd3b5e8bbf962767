//! Fault injection at named storage operations.
//!
//! A failpoint is armed in one of three ways:
//! * for the calling thread only, with [`enable`];
//! * for every thread, with [`arm`], until the returned guard is dropped;
//! * for the whole process at startup, through `XIDLOG_FAILPOINTS`: a
//!   comma-separated list of names, each optionally `name=N` to fail only
//!   the first `N` hits.
//!
//! Storage code calls [`maybe_fail`] before touching a file.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use parking_lot::{const_mutex, Mutex};
use tracing::{debug, warn};

pub const STORAGE_READ: &str = "storage::read";
pub const STORAGE_WRITE: &str = "storage::write";
pub const STORAGE_EXTEND: &str = "storage::extend";

/// When a process-wide failpoint fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Every hit fails.
    Always,
    /// The next `n` hits fail, later ones pass.
    Times(u32),
    /// The next `n` hits pass, every later one fails.
    After(u32),
}

#[derive(Debug)]
struct Armed {
    name: String,
    trigger: Trigger,
    fired: u64,
}

impl Armed {
    fn fire(&mut self) -> bool {
        let fail = match &mut self.trigger {
            Trigger::Always => true,
            Trigger::Times(0) => false,
            Trigger::Times(n) => {
                *n -= 1;
                true
            }
            Trigger::After(0) => true,
            Trigger::After(n) => {
                *n -= 1;
                false
            }
        };
        if fail {
            self.fired += 1;
        }
        fail
    }
}

thread_local! {
    static LOCAL: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

static GLOBAL: Mutex<Vec<Armed>> = const_mutex(Vec::new());
static ANY_GLOBAL: AtomicBool = AtomicBool::new(false);
static ENV_LOADED: Once = Once::new();

/// Arms `name` for the calling thread until [`disable`] or [`clear`].
pub fn enable(name: &str) {
    LOCAL.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
}

pub fn disable(name: &str) {
    LOCAL.with(|set| {
        set.borrow_mut().remove(name);
    });
}

/// Disarms every failpoint of the calling thread.
pub fn clear() {
    LOCAL.with(|set| set.borrow_mut().clear());
}

/// Keeps a process-wide failpoint armed. Disarms it on drop.
#[derive(Debug)]
#[must_use = "the failpoint is disarmed when the guard is dropped"]
pub struct FailpointGuard {
    name: String,
}

impl FailpointGuard {
    /// How many hits have failed so far.
    pub fn fired(&self) -> u64 {
        GLOBAL
            .lock()
            .iter()
            .find(|armed| armed.name == self.name)
            .map_or(0, |armed| armed.fired)
    }
}

impl Drop for FailpointGuard {
    fn drop(&mut self) {
        disarm(&self.name);
    }
}

/// Arms `name` for every thread. Re-arming a name replaces its trigger.
pub fn arm(name: &str, trigger: Trigger) -> FailpointGuard {
    ENV_LOADED.call_once(load_env);
    install(name, trigger);
    FailpointGuard {
        name: name.to_string(),
    }
}

/// Disarms a process-wide failpoint, including one armed from the
/// environment.
pub fn disarm(name: &str) {
    let mut global = GLOBAL.lock();
    global.retain(|armed| armed.name != name);
    ANY_GLOBAL.store(!global.is_empty(), Ordering::Release);
}

fn install(name: &str, trigger: Trigger) {
    let mut global = GLOBAL.lock();
    global.retain(|armed| armed.name != name);
    global.push(Armed {
        name: name.to_string(),
        trigger,
        fired: 0,
    });
    ANY_GLOBAL.store(true, Ordering::Release);
    debug!(name, ?trigger, "armed failpoint");
}

fn load_env() {
    let Ok(raw) = std::env::var("XIDLOG_FAILPOINTS") else {
        return;
    };
    for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        match item.split_once('=') {
            None => install(item, Trigger::Always),
            Some((name, count)) => match count.trim().parse() {
                Ok(n) => install(name.trim(), Trigger::Times(n)),
                Err(_) => warn!(item, "ignoring malformed failpoint"),
            },
        }
    }
}

/// True if `name` is armed for this thread or process-wide.
pub fn is_enabled(name: &str) -> bool {
    ENV_LOADED.call_once(load_env);
    if LOCAL.with(|set| set.borrow().contains(name)) {
        return true;
    }
    ANY_GLOBAL.load(Ordering::Acquire) && GLOBAL.lock().iter().any(|armed| armed.name == name)
}

/// Fails with an I/O error if `name` fires on this hit.
pub fn maybe_fail(name: &str) -> io::Result<()> {
    ENV_LOADED.call_once(load_env);
    let local = LOCAL.with(|set| set.borrow().contains(name));
    let global = !local
        && ANY_GLOBAL.load(Ordering::Acquire)
        && GLOBAL
            .lock()
            .iter_mut()
            .find(|armed| armed.name == name)
            .is_some_and(Armed::fire);
    if local || global {
        Err(io::Error::other(format!("failpoint triggered: {name}")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_thread_local_failpoint() {
        assert!(maybe_fail("test::local").is_ok());
        enable("test::local");
        let err = maybe_fail("test::local").unwrap_err();
        assert!(err.to_string().contains("test::local"));

        let other_thread = thread::spawn(|| is_enabled("test::local")).join().unwrap();
        assert!(!other_thread);

        disable("test::local");
        assert!(maybe_fail("test::local").is_ok());
        enable("test::local");
        clear();
        assert!(!is_enabled("test::local"));
    }

    #[test]
    fn test_armed_failpoint_reaches_other_threads() {
        let guard = arm("test::global", Trigger::Always);
        let failed = thread::spawn(|| maybe_fail("test::global").is_err()).join().unwrap();
        assert!(failed);
        assert_eq!(guard.fired(), 1);

        drop(guard);
        assert!(!is_enabled("test::global"));
        assert!(maybe_fail("test::global").is_ok());
    }

    #[test]
    fn test_counted_triggers() {
        let times = arm("test::times", Trigger::Times(2));
        let outcomes: Vec<bool> = (0..4).map(|_| maybe_fail("test::times").is_err()).collect();
        assert_eq!(outcomes, [true, true, false, false]);
        assert_eq!(times.fired(), 2);

        let after = arm("test::after", Trigger::After(2));
        let outcomes: Vec<bool> = (0..4).map(|_| maybe_fail("test::after").is_err()).collect();
        assert_eq!(outcomes, [false, false, true, true]);
        assert_eq!(after.fired(), 2);
    }
}
