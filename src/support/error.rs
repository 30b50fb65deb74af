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

use std::fmt;
use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Parse(String),
    #[error("Request exceeds the limit of {0} bytes")]
    SizeLimitExceeded(u64),
    #[error("Unable to store literal: {0}")]
    LiteralStorage(#[source] io::Error),
    #[error("Folder cache failure: {0}")]
    CacheBackend(String),
    #[error("{0}")]
    Throttled(ThrottleReason),
    #[error("Connection terminated")]
    ConnectionTerminated,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
}

/// Why a command was refused by the throttling layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThrottleReason {
    /// The same command (or a self-limited verb) was repeated too often. The
    /// value is the verb.
    RepeatedCommand(String),
    /// The per-account lock could not be acquired in time. The value is the
    /// account.
    AccountBusy(String),
    /// An account or address exceeded its request rate. The value describes
    /// which.
    TooManyRequests(String),
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ThrottleReason::RepeatedCommand(ref verb) => {
                write!(f, "Too many repeated {} requests", verb)
            }
            ThrottleReason::AccountBusy(_) => {
                write!(f, "Account busy, try again")
            }
            ThrottleReason::TooManyRequests(ref source) => {
                write!(f, "Too many requests from {}", source)
            }
        }
    }
}

/// An error tied to the command that caused it.
///
/// `tag` is `None` when the failure happened before a tag could be
/// identified, in which case the response is untagged.
#[derive(Debug)]
pub struct TaggedError {
    pub tag: Option<String>,
    pub error: Error,
}

impl TaggedError {
    pub fn new(tag: Option<String>, error: Error) -> Self {
        TaggedError { tag, error }
    }

    /// The tag to use in the response, `*` if there is none.
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or("*")
    }

    /// Renders the single response line (without line ending) which reports
    /// this error to the client.
    pub fn response_line(&self) -> String {
        let tag = self.tag();
        match self.error {
            Error::Parse(ref msg) => format!("{} BAD {}", tag, msg),
            Error::SizeLimitExceeded(_) => {
                format!("{} NO [LIMIT] {}", tag, self.error)
            }
            Error::LiteralStorage(_) => {
                format!("{} NO [UNAVAILABLE] Unable to store literal", tag)
            }
            Error::Throttled(ref reason) => match *reason {
                ThrottleReason::RepeatedCommand(_)
                | ThrottleReason::TooManyRequests(_) => {
                    format!("{} NO [LIMIT] {}", tag, reason)
                }
                ThrottleReason::AccountBusy(_) => {
                    format!("{} NO [UNAVAILABLE] {}", tag, reason)
                }
            },
            _ => format!("{} NO [SERVERBUG] {}", tag, self.error),
        }
    }
}

impl fmt::Display for TaggedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.tag(), self.error)
    }
}
