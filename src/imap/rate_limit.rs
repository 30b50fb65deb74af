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

//! Server-wide limits on how fast one account or one address may issue
//! requests.
//!
//! Each account and each peer address has a counter of requests in the
//! current window. The window is fixed: it starts with the first request
//! after the previous one ended, and the counter starts over with it.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::support::error::{Error, ThrottleReason};
use crate::support::system_config::ThrottleConfig;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Source {
    Account(String),
    Address(IpAddr),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Source::Account(ref account) => write!(f, "account {}", account),
            Source::Address(ip) => write!(f, "address {}", ip),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Counter {
    window_start: Instant,
    count: u32,
}

/// The process-wide request counters.
pub struct RequestRateLimits {
    account_limit: u32,
    address_limit: u32,
    window: Duration,
    counters: Mutex<HashMap<Source, Counter>>,
}

impl RequestRateLimits {
    pub fn new(config: &ThrottleConfig) -> Self {
        RequestRateLimits {
            account_limit: config.account_request_limit,
            address_limit: config.address_request_limit,
            window: Duration::from_millis(config.request_rate_window_ms),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Count a request from `account` (if authenticated) at `peer` (if
    /// known), failing if either has exceeded its limit for the window.
    pub fn check(
        &self,
        account: Option<&str>,
        peer: Option<IpAddr>,
    ) -> Result<(), Error> {
        self.check_at(account, peer, Instant::now())
    }

    fn check_at(
        &self,
        account: Option<&str>,
        peer: Option<IpAddr>,
        now: Instant,
    ) -> Result<(), Error> {
        let mut counters = self.counters.lock().unwrap();

        if let Some(account) = account.filter(|_| self.account_limit > 0) {
            self.count(
                &mut counters,
                Source::Account(account.to_owned()),
                self.account_limit,
                now,
            )?;
        }

        if let Some(ip) = peer.filter(|_| self.address_limit > 0) {
            self.count(
                &mut counters,
                Source::Address(ip),
                self.address_limit,
                now,
            )?;
        }

        Ok(())
    }

    fn count(
        &self,
        counters: &mut HashMap<Source, Counter>,
        source: Source,
        limit: u32,
        now: Instant,
    ) -> Result<(), Error> {
        let counter = counters.entry(source.clone()).or_insert(Counter {
            window_start: now,
            count: 0,
        });
        if now.saturating_duration_since(counter.window_start) >= self.window
        {
            counter.window_start = now;
            counter.count = 0;
        }

        counter.count = counter.count.saturating_add(1);
        if counter.count > limit {
            warn!("Too many requests from {}", source);
            Err(Error::Throttled(ThrottleReason::TooManyRequests(
                source.to_string(),
            )))
        } else {
            Ok(())
        }
    }

    /// Forget counters whose window has ended. Returns how many were
    /// dropped.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    fn prune_at(&self, now: Instant) -> usize {
        let mut counters = self.counters.lock().unwrap();
        let before = counters.len();
        counters.retain(|_, c| {
            now.saturating_duration_since(c.window_start) < self.window
        });
        let pruned = before - counters.len();
        if pruned > 0 {
            debug!("Pruned {} request rate counters", pruned);
        }
        pruned
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.counters.lock().unwrap().len()
    }
}
