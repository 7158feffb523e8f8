//! Stage lifecycle control shared between a background stage and the
//! threads that drive it.
//!
//! Each background stage (Local Mapping, Loop Closing, Viewer) owns one
//! `StageControl` through an `Arc`. Other parties only ever request things:
//!
//! - stop / release: the stage parks between units of work until every
//!   party that asked for the stop has released it
//! - finish: the stage leaves its run loop and reports finished
//! - reset: the stage drops its pending work and clears the flag when done
//! - busy: set while a long pass (global optimization) is in flight
//!
//! Waiting is done on a condition variable with a short timeout, so a waiter
//! blocks instead of spinning and still re-checks its predicate regularly.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Upper bound between predicate re-checks while waiting.
pub const WAIT_TICK: Duration = Duration::from_millis(3);

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    /// Outstanding stop requests; each is dropped by one `release`.
    stop_holds: u32,
    stopped: bool,
    finish_requested: bool,
    finished: bool,
    reset_requested: bool,
    busy: bool,
}

/// Lifecycle flags of one background stage.
#[derive(Debug)]
pub struct StageControl {
    name: &'static str,
    flags: Mutex<Flags>,
    changed: Condvar,
}

impl StageControl {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            flags: Mutex::new(Flags::default()),
            changed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn update(&self, f: impl FnOnce(&mut Flags)) {
        let mut flags = self.flags.lock();
        f(&mut flags);
        self.changed.notify_all();
    }

    fn read(&self, f: impl FnOnce(&Flags) -> bool) -> bool {
        f(&*self.flags.lock())
    }

    fn wait_until(&self, pred: impl Fn(&Flags) -> bool) {
        let mut flags = self.flags.lock();
        while !pred(&flags) {
            self.changed.wait_for(&mut flags, WAIT_TICK);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stop / release
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask the stage to stop. Every call must be paired with one
    /// [`release`](Self::release) by the same party.
    pub fn request_stop(&self) {
        self.update(|f| {
            f.stop_holds += 1;
            debug!("{}: stop requested ({} holding)", self.name, f.stop_holds);
        });
    }

    pub fn is_stop_requested(&self) -> bool {
        self.read(|f| f.stop_holds > 0)
    }

    /// Called by the stage between units of work. Enters the stopped state
    /// if a stop is pending and no finish was requested.
    pub fn stop_if_requested(&self) -> bool {
        let mut flags = self.flags.lock();
        if flags.stop_holds > 0 && !flags.finish_requested {
            if !flags.stopped {
                debug!("{}: stopped", self.name);
            }
            flags.stopped = true;
            self.changed.notify_all();
            true
        } else {
            false
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.read(|f| f.stopped)
    }

    /// Drop one stop request. The stage runs again once no request is left.
    pub fn release(&self) {
        self.update(|f| {
            f.stop_holds = f.stop_holds.saturating_sub(1);
            if f.stop_holds == 0 {
                debug!("{}: released", self.name);
                f.stopped = false;
            } else {
                debug!("{}: still held by {} requests", self.name, f.stop_holds);
            }
        });
    }

    /// Block the caller until the stage reports stopped (or has finished,
    /// since a finished stage never stops).
    pub fn wait_until_stopped(&self) {
        self.wait_until(|f| f.stopped || f.finished);
    }

    /// Called by the stage while stopped. Returns when it was released, or
    /// when a finish or reset needs its attention.
    pub fn wait_while_stopped(&self) {
        self.wait_until(|f| !f.stopped || f.finish_requested || f.reset_requested);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Finish
    // ─────────────────────────────────────────────────────────────────────────

    pub fn request_finish(&self) {
        debug!("{}: finish requested", self.name);
        self.update(|f| f.finish_requested = true);
    }

    pub fn is_finish_requested(&self) -> bool {
        self.read(|f| f.finish_requested)
    }

    /// Called by the stage as it leaves its run loop.
    pub fn set_finished(&self) {
        debug!("{}: finished", self.name);
        self.update(|f| {
            f.finished = true;
            f.stopped = true;
        });
    }

    pub fn is_finished(&self) -> bool {
        self.read(|f| f.finished)
    }

    pub fn wait_until_finished(&self) {
        self.wait_until(|f| f.finished);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reset
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask the stage to drop its state and block until it has done so.
    ///
    /// Returns immediately if the stage already finished.
    pub fn request_reset(&self) {
        debug!("{}: reset requested", self.name);
        self.update(|f| f.reset_requested = true);
        self.wait_until(|f| !f.reset_requested || f.finished);
    }

    pub fn is_reset_requested(&self) -> bool {
        self.read(|f| f.reset_requested)
    }

    /// Called by the stage once its reset is complete.
    pub fn reset_done(&self) {
        self.update(|f| f.reset_requested = false);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Busy (global pass in flight)
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_busy(&self, busy: bool) {
        self.update(|f| f.busy = busy);
    }

    pub fn is_busy(&self) -> bool {
        self.read(|f| f.busy)
    }

    /// Block until the stage finished and has no pass in flight.
    pub fn wait_until_idle(&self) {
        self.wait_until(|f| f.finished && !f.busy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    /// A minimal worker honoring stop / release / reset / finish.
    fn spawn_worker(control: Arc<StageControl>) -> thread::JoinHandle<usize> {
        thread::spawn(move || {
            let mut resets = 0;
            loop {
                if control.is_reset_requested() {
                    resets += 1;
                    control.reset_done();
                }
                if control.stop_if_requested() {
                    control.wait_while_stopped();
                    if control.is_finish_requested() {
                        break;
                    }
                    continue;
                }
                if control.is_finish_requested() {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            control.set_finished();
            resets
        })
    }

    #[test]
    fn test_stop_release_handshake() {
        let control = Arc::new(StageControl::new("worker"));
        let handle = spawn_worker(Arc::clone(&control));

        control.request_stop();
        control.wait_until_stopped();
        assert!(control.is_stopped());

        control.release();
        assert!(!control.is_stopped());
        assert!(!control.is_stop_requested());

        control.request_finish();
        control.wait_until_finished();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn test_stage_stays_stopped_until_every_holder_releases() {
        let control = Arc::new(StageControl::new("worker"));
        let handle = spawn_worker(Arc::clone(&control));

        // A save pauses the stage, then localization mode asks for a stop too
        control.request_stop();
        control.wait_until_stopped();
        control.request_stop();

        control.release();
        thread::sleep(Duration::from_millis(20));
        assert!(control.is_stop_requested());
        assert!(control.is_stopped());

        control.release();
        assert!(!control.is_stop_requested());
        assert!(!control.is_stopped());

        // Unpaired releases do not underflow into a pending stop
        control.release();
        assert!(!control.is_stop_requested());

        control.request_finish();
        control.wait_until_finished();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn test_reset_is_served_while_stopped() {
        let control = Arc::new(StageControl::new("worker"));
        let handle = spawn_worker(Arc::clone(&control));

        control.request_stop();
        control.wait_until_stopped();
        control.request_reset();
        assert!(!control.is_reset_requested());

        control.request_finish();
        control.wait_until_finished();
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn test_idle_waits_for_busy_pass() {
        let control = Arc::new(StageControl::new("loop"));
        control.set_busy(true);
        control.set_finished();

        let releaser = {
            let control = Arc::clone(&control);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(60));
                control.set_busy(false);
            })
        };

        let start = Instant::now();
        control.wait_until_idle();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!control.is_busy());
        releaser.join().unwrap();
    }

    #[test]
    fn test_reset_on_finished_stage_returns() {
        let control = StageControl::new("done");
        control.set_finished();
        control.request_reset();
        control.wait_until_stopped();
    }
}
