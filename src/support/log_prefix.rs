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
use std::sync::{Arc, Mutex};

/// Tracks text that should be included in at the start of every log statement
/// about a session.
///
/// Clones of a `LogPrefix` share the same underlying data, so the session and
/// the dispatcher see the user once login completes.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    peer: String,
    user: Option<String>,
    mailbox: Option<String>,
}

impl LogPrefix {
    pub fn new(peer: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                peer: sanitise(peer),
                user: None,
                mailbox: None,
            })),
        }
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(sanitise(user));
    }

    pub fn set_mailbox(&self, mailbox: Option<String>) {
        self.inner.lock().unwrap().mailbox = mailbox.map(sanitise);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.peer)?;
        if inner.user.is_some() || inner.mailbox.is_some() {
            write!(f, "[")?;
            if let Some(ref user) = inner.user {
                write!(f, "{}", user)?;
            }
            if let Some(ref mailbox) = inner.mailbox {
                if inner.user.is_some() {
                    write!(f, " ")?;
                }
                write!(f, "mailbox={}", mailbox)?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn formatting() {
        let prefix = LogPrefix::new("127.0.0.1:1234".to_owned());
        assert_eq!("127.0.0.1:1234", prefix.to_string());

        let shared = prefix.clone();
        shared.set_user("al\nice".to_owned());
        assert_eq!("127.0.0.1:1234[alice]", prefix.to_string());

        prefix.set_mailbox(Some("INBOX".to_owned()));
        assert_eq!("127.0.0.1:1234[alice mailbox=INBOX]", shared.to_string());

        prefix.set_mailbox(None);
        assert_eq!("127.0.0.1:1234[alice]", shared.to_string());

        let long = LogPrefix::new("x".repeat(100));
        assert_eq!(64, long.to_string().len());
    }
}
