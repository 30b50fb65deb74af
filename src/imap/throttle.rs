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

//! Detection of pathologically repeated commands.
//!
//! Some clients get stuck in a loop issuing the same command (typically a
//! `SELECT` or `FETCH` of the same thing) as fast as the server answers. Each
//! connection owns a `CommandThrottle` which remembers the previous command
//! and how many times in a row it has been seen.

use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use log::warn;

use super::command::{Argument, Command};
use crate::support::system_config::ThrottleConfig;

/// The identity of a command for repeat detection.
#[derive(Debug, PartialEq, Eq)]
struct Fingerprint {
    verb: String,
    uid: bool,
    args: Vec<Shape>,
}

#[derive(Debug, PartialEq, Eq)]
enum Shape {
    Atom(String),
    Quoted(String),
    Nil,
    Sequence(String),
    /// Flags are a set; their order does not distinguish commands.
    Flags(BTreeSet<String>),
    List(Vec<Shape>),
    /// Only the length of a literal is compared, so that the payload never
    /// needs to be read back.
    Literal(u64, bool),
}

impl Shape {
    fn of(arg: &Argument) -> Self {
        match *arg {
            Argument::Atom(ref s) => Shape::Atom(s.clone()),
            Argument::Quoted(ref s) => Shape::Quoted(s.clone()),
            Argument::Nil => Shape::Nil,
            Argument::SequenceSet(ref s) => {
                Shape::Sequence(s.as_str().to_owned())
            }
            Argument::FlagList(ref flags) => Shape::Flags(
                flags.iter().map(|f| f.to_ascii_lowercase()).collect(),
            ),
            Argument::List(ref items) => {
                Shape::List(items.iter().map(Shape::of).collect())
            }
            Argument::Literal(ref l) => Shape::Literal(l.len(), l.is_binary()),
        }
    }
}

impl Fingerprint {
    fn of(command: &Command) -> Self {
        Fingerprint {
            verb: command.verb.clone(),
            uid: command.uid,
            args: command.args.iter().map(Shape::of).collect(),
        }
    }
}

pub struct CommandThrottle {
    limit: u32,
    window: Duration,
    aware: HashSet<String>,
    self_limited: HashSet<String>,
    exempt: Vec<IpAddr>,

    last: Option<(Fingerprint, Instant)>,
    repeats: u32,
}

fn upper_set(verbs: &[String]) -> HashSet<String> {
    verbs.iter().map(|v| v.to_ascii_uppercase()).collect()
}

impl CommandThrottle {
    pub fn new(config: &ThrottleConfig) -> Self {
        let exempt = config
            .exempt_addresses
            .iter()
            .filter_map(|a| match a.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("Ignoring unparsable exempt address {:?}", a);
                    None
                }
            })
            .collect();

        CommandThrottle {
            limit: config.command_limit,
            window: Duration::from_millis(config.repeat_window_ms),
            aware: upper_set(&config.throttle_aware_commands),
            self_limited: upper_set(&config.self_limited_commands),
            exempt,
            last: None,
            repeats: 0,
        }
    }

    /// Whether connections from `peer` bypass repeat throttling.
    pub fn is_exempt(&self, peer: IpAddr) -> bool {
        self.exempt.contains(&peer)
    }

    pub fn should_throttle(&mut self, command: &Command) -> bool {
        self.should_throttle_at(command, Instant::now())
    }

    /// Record that `command` arrived at `now`, and return whether it should
    /// be rejected.
    ///
    /// With a limit of N, the (N+1)th consecutive identical command within
    /// the window is the first to be throttled. Commands not subject to
    /// throttling reset the count.
    pub fn should_throttle_at(
        &mut self,
        command: &Command,
        now: Instant,
    ) -> bool {
        if 0 == self.limit {
            return false;
        }

        if !self.aware.contains(&command.verb) {
            self.last = None;
            self.repeats = 0;
            return false;
        }

        let fingerprint = Fingerprint::of(command);
        let repeated = match self.last {
            Some((ref prev, at)) => {
                now.saturating_duration_since(at) <= self.window
                    && (*prev == fingerprint
                        || (prev.verb == fingerprint.verb
                            && self.self_limited.contains(&fingerprint.verb)))
            }
            None => false,
        };

        self.repeats = if repeated {
            self.repeats.saturating_add(1)
        } else {
            1
        };
        self.last = Some((fingerprint, now));

        self.repeats > self.limit
    }
}
