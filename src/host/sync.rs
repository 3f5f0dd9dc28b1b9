//! Small synchronization pieces: a manual-reset event and the discriminator
//! for the engine's completion messages.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Manual-reset event in the Win32 style: stays signaled until reset, wakes
/// every waiter.
pub struct ManualEvent {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl ManualEvent {
    pub fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        self.cv.notify_all();
    }

    pub fn reset(&self) {
        *self.flag.lock().unwrap() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock().unwrap()
    }

    /// Wait until the event is signaled or the timeout elapses. Returns the
    /// signaled state on exit, so `while !ev.wait_timeout(..)` loops work.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let flag = self.flag.lock().unwrap();
        if *flag {
            return true;
        }
        let (flag, _result) = self
            .cv
            .wait_timeout_while(flag, timeout, |signaled| !*signaled)
            .unwrap();
        *flag
    }
}

impl Default for ManualEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// First user-range window message id (WM_USER).
pub const WM_USER_BASE: u32 = 0x0400;

/// Engine status payloads carried in wParam.
pub const STATUS_STARTED: usize = 1000;
pub const STATUS_DONE: usize = 1001;
pub const STATUS_OTHER: usize = 1002;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncSignal {
    Start,
    Done,
}

/// Decides whether a window message is really an engine completion post.
///
/// The engine signals start/done/error with small integers in wParam, but
/// plenty of unrelated messages (WM_TIMER payloads in particular) carry the
/// same values. The message id itself has to match the engine's sync channel,
/// which may be a registered message ("SVSyncMessages") or, when that name is
/// not registered on the host, whatever user-range id the engine picked. So
/// the filter learns the id from the first plausible post and rejects
/// everything else afterwards.
pub struct SyncMessageFilter {
    /// Registered message id, 0 when unavailable.
    registered: u32,
    /// Id actually observed from the engine; 0 until learned.
    active: AtomicU32,
}

impl SyncMessageFilter {
    pub fn new(registered: u32) -> Self {
        Self {
            registered,
            active: AtomicU32::new(0),
        }
    }

    pub fn classify(&self, msg: u32, wparam: usize) -> Option<SyncSignal> {
        if wparam != STATUS_STARTED && wparam != STATUS_DONE && wparam != STATUS_OTHER {
            return None;
        }

        let active = self.active.load(Ordering::Relaxed);
        if active != 0 {
            if msg != active {
                return None;
            }
        } else if self.registered != 0 && msg == self.registered {
            self.active.store(msg, Ordering::Relaxed);
        } else if msg < WM_USER_BASE {
            // Below WM_USER lives WM_TIMER/WM_COMMAND territory; adopting one
            // of those would fire premature DONEs and truncate speech.
            return None;
        } else {
            self.active.store(msg, Ordering::Relaxed);
        }

        match wparam {
            STATUS_STARTED => Some(SyncSignal::Start),
            // 1002 is "error or other"; the worker decides whether an ERROR
            // marker is warranted, completion-wise it counts as done.
            _ => Some(SyncSignal::Done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn event_set_wakes_waiter() {
        let ev = Arc::new(ManualEvent::new());
        let ev2 = ev.clone();
        let t = std::thread::spawn(move || ev2.wait_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        ev.set();
        assert!(t.join().unwrap());
        // Manual reset: stays signaled.
        assert!(ev.is_set());
        ev.reset();
        assert!(!ev.is_set());
    }

    #[test]
    fn event_wait_times_out() {
        let ev = ManualEvent::new();
        assert!(!ev.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn filter_rejects_low_message_ids() {
        // WM_TIMER (0x0113) carrying 1001 in wParam must not count as done.
        let filter = SyncMessageFilter::new(0);
        assert_eq!(filter.classify(0x0113, STATUS_DONE), None);
        // And must not have been learned either.
        assert_eq!(filter.classify(0x0113, STATUS_DONE), None);
    }

    #[test]
    fn filter_prefers_registered_id() {
        let filter = SyncMessageFilter::new(0xC123);
        // A user-range impostor arriving first is not adopted over the
        // registered id once the registered id shows up... but the first
        // plausible id wins when the registered one never arrives.
        assert_eq!(
            filter.classify(0xC123, STATUS_STARTED),
            Some(SyncSignal::Start)
        );
        // Learned; other ids are rejected now.
        assert_eq!(filter.classify(0x0500, STATUS_DONE), None);
        assert_eq!(filter.classify(0xC123, STATUS_DONE), Some(SyncSignal::Done));
    }

    #[test]
    fn filter_learns_first_user_range_id() {
        let filter = SyncMessageFilter::new(0);
        assert_eq!(filter.classify(0x0467, STATUS_DONE), Some(SyncSignal::Done));
        // Sticks with what it learned.
        assert_eq!(filter.classify(0x0468, STATUS_DONE), None);
        assert_eq!(
            filter.classify(0x0467, STATUS_OTHER),
            Some(SyncSignal::Done)
        );
    }

    #[test]
    fn filter_ignores_unrelated_wparam() {
        let filter = SyncMessageFilter::new(0);
        assert_eq!(filter.classify(0x0467, 7), None);
        // Nothing learned from it.
        assert_eq!(filter.classify(0x0468, STATUS_DONE), Some(SyncSignal::Done));
    }
}
