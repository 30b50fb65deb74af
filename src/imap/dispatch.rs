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

//! The seam between the protocol engine and whatever carries out commands.

use super::command::Command;
use super::session::SessionContext;

/// Carries out commands on behalf of a `Session`.
///
/// The returned lines are written to the client verbatim and in order; the
/// last one should be the tagged completion. A tagged `NO` or `BAD` counts
/// as a failed command.
pub trait Dispatcher {
    fn dispatch(
        &mut self,
        command: Command,
        ctx: &mut SessionContext,
    ) -> Vec<String>;
}

/// Implements the commands which are valid in any state and need nothing
/// beyond the connection itself. Anything else is refused with `BAD`.
pub struct BaselineDispatcher {
    capabilities: String,
}

impl BaselineDispatcher {
    pub fn new(append_limit: u64) -> Self {
        BaselineDispatcher {
            capabilities: format!(
                "IMAP4rev1 LITERAL+ APPENDLIMIT={}",
                append_limit
            ),
        }
    }
}

impl Dispatcher for BaselineDispatcher {
    fn dispatch(
        &mut self,
        command: Command,
        ctx: &mut SessionContext,
    ) -> Vec<String> {
        let tag = &command.tag;
        match command.verb.as_str() {
            "CAPABILITY" => vec![
                format!("* CAPABILITY {}", self.capabilities),
                format!("{} OK CAPABILITY completed", tag),
            ],
            "NOOP" => vec![format!("{} OK NOOP completed", tag)],
            "LOGOUT" => {
                ctx.logout();
                vec![
                    "* BYE Logging out".to_owned(),
                    format!("{} OK LOGOUT completed", tag),
                ]
            }
            verb => vec![format!("{} BAD Unknown command {}", tag, verb)],
        }
    }
}
