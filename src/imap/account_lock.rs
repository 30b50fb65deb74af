//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Quillmap.
//
// Quillmap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Quillmap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Quillmap. If not, see <http://www.gnu.org/licenses/>.

//! Per-account serialisation of expensive commands.
//!
//! One account may have many connections open at once, possibly from many
//! clients. Only one of them at a time may run an expensive command such as a
//! large `FETCH`; the others wait for a bounded time and then give up with a
//! "busy" response.
//!
//! Each account has a slot holding a single token in a `crossbeam` channel of
//! capacity 1. Taking the token is acquiring the lock, so waiting can time
//! out; the guard puts the token back when dropped, which also happens during
//! unwinding.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, warn};

use crate::support::error::{Error, ThrottleReason};

struct Slot {
    release: Sender<()>,
    take: Receiver<()>,
    last_used: Mutex<Instant>,
}

impl Slot {
    fn new() -> Self {
        let (release, take) = channel::bounded(1);
        // Capacity is 1 and the channel is empty, so this cannot fail
        let _ = release.try_send(());
        Slot {
            release,
            take,
            last_used: Mutex::new(Instant::now()),
        }
    }
}

/// The process-wide registry of account locks.
pub struct AccountLocks {
    timeout: Duration,
    idle_expiry: Duration,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

/// Proof that the lock of one account is held. Released on drop.
pub struct AccountLockGuard {
    account: String,
    slot: Arc<Slot>,
    acquired: Instant,
}

impl AccountLocks {
    pub fn new(timeout: Duration, idle_expiry: Duration) -> Self {
        AccountLocks {
            timeout,
            idle_expiry,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Take the lock of `account`, waiting at most the configured timeout.
    pub fn acquire(&self, account: &str) -> Result<AccountLockGuard, Error> {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            Arc::clone(
                slots
                    .entry(account.to_owned())
                    .or_insert_with(|| Arc::new(Slot::new())),
            )
        };

        match slot.take.recv_timeout(self.timeout) {
            Ok(()) => Ok(AccountLockGuard {
                account: account.to_owned(),
                slot,
                acquired: Instant::now(),
            }),
            Err(_) => {
                warn!(
                    "Gave up waiting {:?} for the lock of account {}",
                    self.timeout, account
                );
                Err(Error::Throttled(ThrottleReason::AccountBusy(
                    account.to_owned(),
                )))
            }
        }
    }

    /// Forget slots which are not held, not waited on, and have been unused
    /// for longer than the idle expiry. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    fn prune_at(&self, now: Instant) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let before = slots.len();
        slots.retain(|_, slot| {
            // The registry holds the only reference to an idle slot; guards
            // and waiters hold their own
            Arc::strong_count(slot) > 1
                || slot.take.is_empty()
                || now.saturating_duration_since(
                    *slot.last_used.lock().unwrap(),
                ) <= self.idle_expiry
        });
        let pruned = before - slots.len();
        if pruned > 0 {
            debug!("Pruned {} idle account locks", pruned);
        }
        pruned
    }

    /// Drop every slot. Guards still outstanding release into their own slot
    /// harmlessly.
    pub fn shutdown(&self) {
        self.slots.lock().unwrap().clear();
    }

    /// The number of accounts with a slot.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

impl AccountLockGuard {
    pub fn account(&self) -> &str {
        &self.account
    }
}

impl fmt::Debug for AccountLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AccountLockGuard({})", self.account)
    }
}

impl Drop for AccountLockGuard {
    fn drop(&mut self) {
        *self.slot.last_used.lock().unwrap() = Instant::now();
        if self.slot.release.try_send(()).is_err() {
            warn!("BUG: Account lock of {} released twice", self.account);
        }
        debug!(
            "Released lock of account {} after {:?}",
            self.account,
            self.acquired.elapsed()
        );
    }
}

#[cfg(test)]
mod test {
    use std::panic;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use rayon::prelude::*;

    use super::*;

    fn locks(timeout_ms: u64) -> AccountLocks {
        AccountLocks::new(
            Duration::from_millis(timeout_ms),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn same_account_is_serialised() {
        let locks = locks(30_000);
        let inside = AtomicBool::new(false);
        let count = AtomicUsize::new(0);

        (0..64).into_par_iter().for_each(|_| {
            let _guard = locks.acquire("alice").unwrap();
            assert!(!inside.swap(true, Ordering::SeqCst));
            count.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            inside.store(false, Ordering::SeqCst);
        });

        assert_eq!(64, count.load(Ordering::SeqCst));
        assert_eq!(1, locks.len());
    }

    #[test]
    fn different_accounts_do_not_contend() {
        let locks = locks(10);
        let _alice = locks.acquire("alice").unwrap();
        let bob = locks.acquire("bob").unwrap();
        assert_eq!("bob", bob.account());
        assert_eq!("AccountLockGuard(bob)", format!("{:?}", bob));
        assert_eq!(2, locks.len());
    }

    #[test]
    fn timeout_is_throttled_error() {
        let locks = locks(20);
        let guard = locks.acquire("alice").unwrap();
        assert_matches!(
            Err(Error::Throttled(ThrottleReason::AccountBusy(_))),
            locks.acquire("alice")
        );
        drop(guard);
        locks.acquire("alice").unwrap();
    }

    #[test]
    fn released_on_panic() {
        let locks = locks(20);
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let _guard = locks.acquire("alice").unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        locks.acquire("alice").unwrap();
    }

    #[test]
    fn prune_keeps_held_and_recent_slots() {
        let locks = locks(20);
        let held = locks.acquire("held").unwrap();
        drop(locks.acquire("idle").unwrap());

        assert_eq!(0, locks.prune());
        assert_eq!(2, locks.len());

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(1, locks.prune_at(later));
        assert_eq!(1, locks.len());

        drop(held);
        assert_eq!(1, locks.prune_at(later));
        assert_eq!(0, locks.len());
    }

    #[test]
    fn shutdown_clears_registry() {
        let locks = locks(20);
        let guard = locks.acquire("alice").unwrap();
        locks.shutdown();
        assert_eq!(0, locks.len());
        drop(guard);
        locks.acquire("alice").unwrap();
    }
}
