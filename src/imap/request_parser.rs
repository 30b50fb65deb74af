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

//! Incremental, literal-aware request parsing.
//!
//! `RequestParser` owns no I/O. The session feeds it whatever the transport
//! produced and polls it for the next event. The parser buffers partial
//! lines, copies literal bytes straight into their `Literal` sinks, and asks
//! for a continuation whenever the client is waiting for one. Commands are
//! produced strictly in the order they arrived.
//!
//! Rejected commands are skipped in their entirety, including any LITERAL+
//! payloads the client has already committed to sending, without buffering
//! the skipped bytes.

use std::mem;

use lazy_static::lazy_static;
use regex::bytes::Regex;

use super::command::{parse_tag, peek_verb, Command, Part};
use super::literal::{Literal, LiteralStore};
use crate::support::error::{Error, TaggedError};

lazy_static! {
    static ref LITERAL_AT_END: Regex =
        Regex::new(r#"(~?)\{([^{}\r\n]*)\}$"#).unwrap();
}

/// When skipping an overlong line, this many trailing bytes are kept so that
/// a literal declaration at the end of the line can still be recognised.
const LINE_TAIL: usize = 32;

/// Upper bound on the read size suggested by `wanted()` for literal data.
const MAX_READ: u64 = 65536;

/// The result of polling the parser.
#[derive(Debug)]
pub enum Poll {
    /// Nothing more can happen until more input is fed.
    NeedInput,
    /// The client is waiting for a continuation line before it sends the
    /// literal just declared. Polling may continue immediately after sending
    /// it.
    Continuation,
    /// A complete command.
    Command(Command),
    /// A command was rejected. Exactly one response must be sent for it; the
    /// parser has already arranged to skip whatever remains of it.
    Rejected(TaggedError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParserState {
    AwaitingLine,
    AwaitingLiteralBytes { remaining: u64 },
    Complete,
}

#[derive(Clone, Copy, Debug)]
pub struct ParserLimits {
    pub max_request_size: u64,
    pub max_line_length: usize,
}

enum Mode {
    Line,
    Literal(Literal),
    /// Discarding this many bytes of a literal belonging to a rejected
    /// command.
    Skip(u64),
}

/// What must be skipped after a command is rejected.
#[derive(Clone, Copy, Debug)]
enum Skip {
    /// The command ended with the rejected line.
    Nothing,
    /// A LITERAL+ of this size follows, then the rest of the command.
    Literal(u64),
    /// The rest of the current line and the rest of the command.
    RestOfCommand,
}

/// A literal declaration found at the end of a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LiteralDecl {
    /// Offset in the line where the declaration starts.
    start: usize,
    len: u64,
    blocking: bool,
    binary: bool,
}

impl LiteralDecl {
    fn skip(&self) -> Skip {
        if self.blocking && self.len > 0 {
            // The client won't send anything until we say so.
            Skip::Nothing
        } else {
            Skip::Literal(self.len)
        }
    }
}

pub struct RequestParser {
    store: LiteralStore,
    limits: ParserLimits,
    /// Buffered input. Everything before `consumed` has been processed.
    input: Vec<u8>,
    consumed: usize,
    mode: Mode,
    /// The tag of the command in progress, once its first line is complete.
    tag: Option<String>,
    verb: Option<String>,
    parts: Vec<Part>,
    /// Line bytes plus declared literal bytes of the command in progress.
    request_size: u64,
    /// Whether the remainder of a rejected command is being skipped.
    discarding: bool,
    /// Whether the last poll produced a command.
    completed: bool,
}

impl RequestParser {
    pub fn new(store: LiteralStore, mut limits: ParserLimits) -> Self {
        limits.max_line_length = limits.max_line_length.max(2 * LINE_TAIL);
        RequestParser {
            store,
            limits,
            input: Vec::new(),
            consumed: 0,
            mode: Mode::Line,
            tag: None,
            verb: None,
            parts: Vec::new(),
            request_size: 0,
            discarding: false,
            completed: false,
        }
    }

    /// Buffer the next chunk of input. Chunks may be split anywhere.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.consumed > 0 {
            self.input.drain(..self.consumed);
            self.consumed = 0;
        }
        self.input.extend_from_slice(chunk);
    }

    pub fn state(&self) -> ParserState {
        match self.mode {
            Mode::Literal(ref literal) => ParserState::AwaitingLiteralBytes {
                remaining: literal.remaining(),
            },
            Mode::Skip(remaining) => {
                ParserState::AwaitingLiteralBytes { remaining }
            }
            Mode::Line if self.completed => ParserState::Complete,
            Mode::Line => ParserState::AwaitingLine,
        }
    }

    /// How many bytes the caller should try to read next.
    ///
    /// While a literal is being received, this never exceeds the number of
    /// bytes still owed for it. Otherwise it is bounded by what one line may
    /// hold.
    pub fn wanted(&self) -> usize {
        let buffered = self.input.len() - self.consumed;
        match self.mode {
            Mode::Literal(ref literal) => {
                literal.remaining().min(MAX_READ).max(1) as usize
            }
            Mode::Skip(remaining) => remaining.min(MAX_READ).max(1) as usize,
            Mode::Line => (self.limits.max_line_length + 2)
                .saturating_sub(buffered)
                .max(1),
        }
    }

    /// The number of bytes of the in-progress command held in memory.
    ///
    /// Spooled literal data does not count.
    pub fn retained_bytes(&self) -> usize {
        let parts: usize = self
            .parts
            .iter()
            .map(|part| match *part {
                Part::Line(ref line) => line.len(),
                Part::Literal(ref literal) => literal.resident_bytes(),
            })
            .sum();
        let literal = match self.mode {
            Mode::Literal(ref literal) => literal.resident_bytes(),
            _ => 0,
        };
        self.input.len() - self.consumed + parts + literal
    }

    /// Whether there is no partially-received command.
    pub fn is_between_commands(&self) -> bool {
        matches!(self.mode, Mode::Line)
            && self.tag.is_none()
            && !self.discarding
            && self.input.len() == self.consumed
    }

    /// Discard all buffered input and the command in progress, releasing
    /// any literal storage.
    pub fn abort(&mut self) {
        self.mode = Mode::Line;
        self.reset_command();
        self.input.clear();
        self.consumed = 0;
        self.discarding = false;
        self.completed = false;
    }

    /// Advance over the buffered input.
    pub fn poll(&mut self) -> Poll {
        self.completed = false;

        loop {
            match mem::replace(&mut self.mode, Mode::Line) {
                Mode::Literal(mut literal) => {
                    match literal.fill(&self.input[self.consumed..]) {
                        Ok(n) => self.consumed += n,
                        Err(e) => {
                            let remaining = literal.remaining();
                            drop(literal);
                            return self.reject(
                                Error::LiteralStorage(e),
                                Skip::Literal(remaining),
                            );
                        }
                    }

                    if literal.is_complete() {
                        self.parts.push(Part::Literal(literal));
                    } else {
                        self.mode = Mode::Literal(literal);
                        return Poll::NeedInput;
                    }
                }

                Mode::Skip(remaining) => {
                    let available = (self.input.len() - self.consumed) as u64;
                    let n = remaining.min(available);
                    self.consumed += n as usize;
                    if n < remaining {
                        self.mode = Mode::Skip(remaining - n);
                        return Poll::NeedInput;
                    }
                }

                Mode::Line => {
                    if let Some(poll) = self.poll_line() {
                        return poll;
                    }
                }
            }
        }
    }

    /// Handle the next line, if there is one.
    ///
    /// Returns `None` if polling should continue.
    fn poll_line(&mut self) -> Option<Poll> {
        let Some(lf) = memchr::memchr(b'\n', &self.input[self.consumed..])
        else {
            return Some(self.on_partial_line());
        };

        let line_end = self.consumed + lf;
        let mut text_end = line_end;
        if text_end > self.consumed && b'\r' == self.input[text_end - 1] {
            text_end -= 1;
        }
        let mut line = self.input[self.consumed..text_end].to_vec();
        self.consumed = line_end + 1;

        if self.discarding {
            self.skip_line(&line);
            return None;
        }

        let first_line = self.tag.is_none() && self.parts.is_empty();
        if first_line && line.is_empty() {
            return None;
        }

        if lf > self.limits.max_line_length {
            if first_line {
                // A "tag" running to the end of the line is not a tag.
                self.tag = parse_tag(&line).filter(|t| t.len() < line.len());
            }
            let skip = skip_after(&line);
            return Some(self.reject(
                Error::SizeLimitExceeded(self.limits.max_line_length as u64),
                skip,
            ));
        }

        if first_line {
            self.tag = parse_tag(&line);
            if self.tag.is_none() {
                let skip = skip_after(&line);
                return Some(self.reject(
                    Error::Parse("Missing or invalid command tag".to_owned()),
                    skip,
                ));
            }
            self.verb = peek_verb(&line);
        }

        self.request_size += lf as u64 + 1;
        if self.request_size > self.limits.max_request_size {
            let skip = skip_after(&line);
            return Some(self.reject(
                Error::SizeLimitExceeded(self.limits.max_request_size),
                skip,
            ));
        }

        let decl = match check_literal(&line) {
            None => {
                self.parts.push(Part::Line(line));
                return Some(self.complete());
            }
            Some(Err(())) => {
                return Some(self.reject(
                    Error::Parse("Malformed literal".to_owned()),
                    Skip::Nothing,
                ))
            }
            Some(Ok(decl)) => decl,
        };

        match self.request_size.checked_add(decl.len) {
            Some(size) if size <= self.limits.max_request_size => {
                self.request_size = size;
            }
            _ => {
                return Some(self.reject(
                    Error::SizeLimitExceeded(self.limits.max_request_size),
                    decl.skip(),
                ))
            }
        }

        let prefer_spool = Some("APPEND") == self.verb.as_deref();
        let literal = match self.store.new_sink(
            decl.len,
            decl.blocking,
            decl.binary,
            prefer_spool,
        ) {
            Ok(literal) => literal,
            Err(e) => return Some(self.reject(e, decl.skip())),
        };

        line.truncate(decl.start);
        self.parts.push(Part::Line(line));

        if literal.is_empty() {
            self.parts.push(Part::Literal(literal));
            None
        } else {
            self.mode = Mode::Literal(literal);
            if decl.blocking {
                Some(Poll::Continuation)
            } else {
                None
            }
        }
    }

    /// Called when the buffered input holds no line ending.
    fn on_partial_line(&mut self) -> Poll {
        let pending = self.input.len() - self.consumed;
        if self.discarding {
            if pending > LINE_TAIL {
                self.consumed = self.input.len() - LINE_TAIL;
            }
        } else if pending > self.limits.max_line_length {
            if self.tag.is_none() && self.parts.is_empty() {
                let partial = &self.input[self.consumed..];
                // A "tag" running to the end of the buffer is not a tag.
                self.tag = parse_tag(partial).filter(|t| t.len() < pending);
            }
            self.consumed = self.input.len() - LINE_TAIL;
            return self.reject(
                Error::SizeLimitExceeded(self.limits.max_line_length as u64),
                Skip::RestOfCommand,
            );
        }

        Poll::NeedInput
    }

    /// Handle a complete line of a command being discarded.
    fn skip_line(&mut self, line: &[u8]) {
        match check_literal(line) {
            // A zero-length literal never waits for a continuation
            Some(Ok(decl)) if !decl.blocking || 0 == decl.len => {
                if decl.len > 0 {
                    self.mode = Mode::Skip(decl.len);
                }
            }
            _ => self.discarding = false,
        }
    }

    fn complete(&mut self) -> Poll {
        let tag = self.tag.take().unwrap_or_default();
        let parts = mem::take(&mut self.parts);
        self.reset_command();

        match Command::from_parts(tag.clone(), parts) {
            Ok(command) => {
                self.completed = true;
                Poll::Command(command)
            }
            Err(e) => Poll::Rejected(TaggedError::new(Some(tag), e)),
        }
    }

    fn reject(&mut self, error: Error, skip: Skip) -> Poll {
        let tag = self.tag.take();
        self.reset_command();

        match skip {
            Skip::Nothing => (),
            Skip::Literal(len) => {
                self.discarding = true;
                if len > 0 {
                    self.mode = Mode::Skip(len);
                }
            }
            Skip::RestOfCommand => self.discarding = true,
        }

        Poll::Rejected(TaggedError::new(tag, error))
    }

    fn reset_command(&mut self) {
        // Dropping the parts releases any literal storage.
        self.parts.clear();
        self.tag = None;
        self.verb = None;
        self.request_size = 0;
    }
}

/// How to skip whatever follows a rejected line.
fn skip_after(line: &[u8]) -> Skip {
    match check_literal(line) {
        Some(Ok(decl)) => decl.skip(),
        _ => Skip::Nothing,
    }
}

/// Check whether `line` ends with a literal declaration.
///
/// Returns `None` if there is no declaration, `Some(Err(()))` if there is
/// something that looks like one but is malformed or too large to represent.
fn check_literal(line: &[u8]) -> Option<Result<LiteralDecl, ()>> {
    let captures = LITERAL_AT_END.captures(line)?;
    let whole = captures.get(0)?;
    let binary = captures.get(1).map_or(false, |m| !m.as_bytes().is_empty());
    let body = captures.get(2)?.as_bytes();

    let (digits, blocking) = match body.split_last() {
        Some((&b'+', digits)) => (digits, false),
        _ => (body, true),
    };

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Some(Err(()));
    }

    let len = digits.iter().try_fold(0u64, |accum, &d| {
        accum.checked_mul(10)?.checked_add(u64::from(d - b'0'))
    });

    Some(len.ok_or(()).map(|len| LiteralDecl {
        start: whole.start(),
        len,
        blocking,
        binary,
    }))
}

#[cfg(test)]
mod test {
    use std::fmt::Write as _;

    use proptest::prelude::*;

    use super::super::command::Argument;
    use super::*;

    fn limits() -> ParserLimits {
        ParserLimits {
            max_request_size: 1024,
            max_line_length: 128,
        }
    }

    fn parser() -> RequestParser {
        RequestParser::new(LiteralStore::in_memory(), limits())
    }

    fn describe_arg(out: &mut String, arg: &Argument) {
        match *arg {
            Argument::Literal(ref l) => {
                let data = l.data().unwrap();
                write!(out, "{{{}}}{:?}", l.len(), String::from_utf8_lossy(&data))
                    .unwrap();
            }
            Argument::List(ref items) => {
                out.push('(');
                for (ix, item) in items.iter().enumerate() {
                    if ix > 0 {
                        out.push(' ');
                    }
                    describe_arg(out, item);
                }
                out.push(')');
            }
            Argument::Atom(ref s) => out.push_str(s),
            ref other => write!(out, "{:?}", other).unwrap(),
        }
    }

    fn describe(cmd: &Command) -> String {
        let mut out = format!("{} {}", cmd.tag, cmd.full_verb());
        for arg in &cmd.args {
            out.push(' ');
            describe_arg(&mut out, arg);
        }
        out
    }

    /// Feed each chunk in turn, recording every event.
    fn drive<'a>(
        parser: &mut RequestParser,
        chunks: impl IntoIterator<Item = &'a [u8]>,
    ) -> String {
        let mut out = String::new();
        for chunk in chunks {
            parser.feed(chunk);
            loop {
                match parser.poll() {
                    Poll::NeedInput => break,
                    Poll::Continuation => out.push_str("continuation\n"),
                    Poll::Command(cmd) => {
                        writeln!(out, "command: {}", describe(&cmd)).unwrap()
                    }
                    Poll::Rejected(e) => {
                        writeln!(out, "rejected: {}", e.response_line())
                            .unwrap()
                    }
                }
            }
        }
        out
    }

    fn run_test(input: &str, expected: &str) {
        let mut p = parser();
        assert_eq!(expected, drive(&mut p, [input.as_bytes()]));
        assert!(p.is_between_commands());

        // Byte-at-a-time must give the same result.
        let mut p = parser();
        assert_eq!(
            expected,
            drive(&mut p, input.as_bytes().chunks(1)),
            "byte-at-a-time"
        );
    }

    #[test]
    fn simple_commands() {
        run_test(
            "a1 NOOP\r\na2 capability\nA3 UID FETCH 1:* (FLAGS)\r\n",
            "command: a1 NOOP\n\
             command: a2 CAPABILITY\n\
             command: A3 UID FETCH SequenceSet(SequenceSet { raw: \"1:*\", \
             ranges: [SeqRange { start: Number(1), end: Star }] }) (FLAGS)\n",
        );
    }

    #[test]
    fn blank_lines_ignored() {
        run_test("\r\n\na1 NOOP\r\n", "command: a1 NOOP\n");
    }

    #[test]
    fn login_with_two_literals() {
        run_test(
            "a001 LOGIN {5}\r\nalice {8}\r\npassword\r\n",
            "continuation\n\
             continuation\n\
             command: a001 LOGIN {5}\"alice\" {8}\"password\"\n",
        );
    }

    #[test]
    fn login_end_to_end_every_split() {
        let input = b"a001 LOGIN {5}\r\nalice {8}\r\npasswordx\r\n";
        for split in 0..=input.len() {
            let mut p = parser();
            let mut continuations = 0;
            let mut commands = Vec::new();
            for chunk in [&input[..split], &input[split..]] {
                p.feed(chunk);
                loop {
                    match p.poll() {
                        Poll::NeedInput => break,
                        Poll::Continuation => {
                            // Nothing of the announced literal has been
                            // consumed yet.
                            assert_eq!(
                                ParserState::AwaitingLiteralBytes {
                                    remaining: [5, 8][continuations],
                                },
                                p.state()
                            );
                            continuations += 1;
                        }
                        Poll::Command(c) => commands.push(c),
                        Poll::Rejected(e) => panic!("rejected: {}", e),
                    }
                }
            }

            assert_eq!(2, continuations, "split at {}", split);
            assert_eq!(1, commands.len(), "split at {}", split);
            let cmd = &commands[0];
            assert_eq!("a001", cmd.tag);
            assert_eq!("LOGIN", cmd.verb);
            assert_eq!(5, cmd.args[0].literal().unwrap().len());
            assert_eq!(8, cmd.args[1].literal().unwrap().len());
            assert_eq!(
                b"password".to_vec(),
                cmd.args[1].literal().unwrap().data().unwrap()
            );
            assert_eq!(Some("x"), cmd.args[2].as_str());
        }
    }

    #[test]
    fn literal_plus_needs_no_continuation() {
        run_test(
            "a1 LOGIN {5+}\r\nalice {8+}\r\npassword\r\n",
            "command: a1 LOGIN {5}\"alice\" {8}\"password\"\n",
        );
    }

    #[test]
    fn zero_length_literal_completes_immediately() {
        run_test(
            "a1 LOGIN {0}\r\n {0+}\r\n\r\n",
            "command: a1 LOGIN {0}\"\" {0}\"\"\n",
        );

        let mut p = parser();
        p.feed(b"a1 SEARCH TEXT {0}\r\n");
        assert_matches!(Poll::NeedInput, p.poll());
        assert_eq!(ParserState::AwaitingLine, p.state());
        p.feed(b"\r\n");
        assert_matches!(Poll::Command(_), p.poll());
        assert_eq!(ParserState::Complete, p.state());
        assert_matches!(Poll::NeedInput, p.poll());
        assert_eq!(ParserState::AwaitingLine, p.state());
    }

    #[test]
    fn binary_literal() {
        let mut p = parser();
        p.feed(b"a1 APPEND INBOX ~{3}\r\n");
        assert_matches!(Poll::Continuation, p.poll());
        p.feed(b"\0\x01\x02\r\n");
        match p.poll() {
            Poll::Command(cmd) => {
                let lit = cmd.args[1].literal().unwrap();
                assert!(lit.is_binary());
                assert_eq!(vec![0u8, 1, 2], lit.data().unwrap());
            }
            p => panic!("unexpected {:?}", p),
        }
    }

    #[test]
    fn literal_state_and_read_hints() {
        let mut p = parser();
        p.feed(b"a1 APPEND INBOX {10}\r\n");
        assert_matches!(Poll::Continuation, p.poll());
        assert_eq!(
            ParserState::AwaitingLiteralBytes { remaining: 10 },
            p.state()
        );
        assert_eq!(10, p.wanted());
        p.feed(b"0123");
        assert_matches!(Poll::NeedInput, p.poll());
        assert_eq!(
            ParserState::AwaitingLiteralBytes { remaining: 6 },
            p.state()
        );
        assert_eq!(6, p.wanted());
        p.feed(b"456789");
        assert_matches!(Poll::NeedInput, p.poll());
        assert_eq!(ParserState::AwaitingLine, p.state());
        assert!(p.wanted() <= limits().max_line_length + 2);
        p.feed(b"\r\n");
        assert_matches!(Poll::Command(_), p.poll());
    }

    #[test]
    fn catenate_style_multiple_literals() {
        run_test(
            "a1 APPEND INBOX CATENATE (TEXT {3}\r\nabc URL \"/x\" TEXT {2+}\r\nde)\r\n",
            "continuation\n\
             command: a1 APPEND INBOX CATENATE (TEXT {3}\"abc\" URL \
             Quoted(\"/x\") TEXT {2}\"de\")\n",
        );
    }

    #[test]
    fn malformed_literal_tagged() {
        run_test(
            "a1 LOGIN {5x}\r\na2 NOOP\r\n",
            "rejected: a1 BAD Malformed literal\n\
             command: a2 NOOP\n",
        );
        run_test(
            "a1 LOGIN {}\r\na2 NOOP\r\n",
            "rejected: a1 BAD Malformed literal\n\
             command: a2 NOOP\n",
        );
        run_test(
            "a1 LOGIN {99999999999999999999999}\r\na2 NOOP\r\n",
            "rejected: a1 BAD Malformed literal\n\
             command: a2 NOOP\n",
        );
    }

    #[test]
    fn bad_tag_untagged() {
        run_test(
            "+tag NOOP\r\n* NOOP\r\na2 NOOP\r\n",
            "rejected: * BAD Missing or invalid command tag\n\
             rejected: * BAD Missing or invalid command tag\n\
             command: a2 NOOP\n",
        );
        // The LITERAL+ after a bad tag is skipped too
        run_test(
            "(x {4+}\r\nNOOP\r\na2 NOOP\r\n",
            "rejected: * BAD Missing or invalid command tag\n\
             command: a2 NOOP\n",
        );
    }

    #[test]
    fn tag_with_open_bracket() {
        run_test(
            "a[1 NOOP\r\na]2 LOGIN {5+}\r\nalice\r\n",
            "command: a[1 NOOP\n\
             command: a]2 LOGIN {5}\"alice\"\n",
        );
    }

    #[test]
    fn syntax_error_after_complete_command() {
        run_test(
            "a1 FETCH (1\r\na2 NOOP\r\n",
            "rejected: a1 BAD Unbalanced parentheses\n\
             command: a2 NOOP\n",
        );
        run_test(
            "a1\r\na2 NOOP\r\n",
            "rejected: a1 BAD Missing command\n\
             command: a2 NOOP\n",
        );
    }

    #[test]
    fn blocking_literal_over_request_limit() {
        run_test(
            "a1 APPEND INBOX {2000}\r\na2 NOOP\r\n",
            "rejected: a1 NO [LIMIT] Request exceeds the limit of 1024 bytes\n\
             command: a2 NOOP\n",
        );
    }

    #[test]
    fn literal_plus_over_request_limit_is_skipped() {
        let payload = "x".repeat(2000);
        run_test(
            &format!(
                "a1 APPEND INBOX {{2000+}}\r\n{} {{3+}}\r\nabc\r\na2 NOOP\r\n",
                payload
            ),
            "rejected: a1 NO [LIMIT] Request exceeds the limit of 1024 bytes\n\
             command: a2 NOOP\n",
        );
    }

    #[test]
    fn zero_length_literal_in_skipped_command() {
        let payload = "z".repeat(1000);
        run_test(
            &format!(
                "a1 APPEND INBOX {{1000+}}\r\n{} {{0}}\r\n x\r\na2 NOOP\r\n",
                payload
            ),
            "rejected: a1 NO [LIMIT] Request exceeds the limit of 1024 bytes\n\
             command: a2 NOOP\n",
        );
    }

    #[test]
    fn rejected_line_ending_in_zero_length_literal() {
        run_test(
            "(bad {0}\r\n rest\r\na2 NOOP\r\n",
            "rejected: * BAD Missing or invalid command tag\n\
             command: a2 NOOP\n",
        );
    }

    #[test]
    fn cumulative_size_counts_every_part() {
        // Each literal is fine on its own but together they are too much.
        let chunk = "y".repeat(400);
        run_test(
            &format!(
                "a1 X {{400+}}\r\n{c} {{400+}}\r\n{c} {{400+}}\r\n{c}\r\na2 NOOP\r\n",
                c = chunk
            ),
            "rejected: a1 NO [LIMIT] Request exceeds the limit of 1024 bytes\n\
             command: a2 NOOP\n",
        );
    }

    #[test]
    fn oversized_literal_memory_stays_bounded() {
        let mut p = parser();
        p.feed(b"a1 APPEND INBOX {1000000+}\r\n");
        assert_matches!(
            Poll::Rejected(TaggedError {
                error: Error::SizeLimitExceeded(1024),
                ..
            }),
            p.poll()
        );

        let block = [b'z'; 4096];
        let mut fed = 0;
        let mut peak = 0;
        while fed < 1_000_000 {
            let n = block.len().min(1_000_000 - fed);
            p.feed(&block[..n]);
            fed += n;
            assert_matches!(Poll::NeedInput, p.poll());
            peak = peak.max(p.retained_bytes());
        }
        assert_eq!(0, peak);

        p.feed(b"\r\na2 NOOP\r\n");
        match p.poll() {
            Poll::Command(cmd) => assert_eq!("a2", cmd.tag),
            p => panic!("unexpected {:?}", p),
        }
    }

    #[test]
    fn overlong_line_recovers() {
        let long = "z".repeat(300);
        run_test(
            &format!("a1 SEARCH {}\r\na2 NOOP\r\n", long),
            "rejected: a1 NO [LIMIT] Request exceeds the limit of 128 bytes\n\
             command: a2 NOOP\n",
        );

        // The tail of the overlong line announces a LITERAL+ which must be
        // skipped as well.
        run_test(
            &format!("a1 SEARCH {} {{5+}}\r\nhello\r\na2 NOOP\r\n", long),
            "rejected: a1 NO [LIMIT] Request exceeds the limit of 128 bytes\n\
             command: a2 NOOP\n",
        );

        // Overlong continuation line
        run_test(
            &format!("a1 LOGIN {{1+}}\r\nx {}\r\na2 NOOP\r\n", long),
            "rejected: a1 NO [LIMIT] Request exceeds the limit of 128 bytes\n\
             command: a2 NOOP\n",
        );
    }

    #[test]
    fn overlong_line_without_tag() {
        let long = "z".repeat(300);
        run_test(
            &format!("{}\r\na2 NOOP\r\n", long),
            "rejected: * NO [LIMIT] Request exceeds the limit of 128 bytes\n\
             command: a2 NOOP\n",
        );
    }

    #[test]
    fn append_literal_is_spooled() {
        let dir = tempfile::TempDir::new().unwrap();
        let store =
            LiteralStore::new(Some(dir.path().to_owned()), 1 << 20, 1 << 20);
        let mut p = RequestParser::new(store, limits());

        p.feed(b"a1 LOGIN {3}\r\n");
        assert_matches!(Poll::Continuation, p.poll());
        assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());
        p.feed(b"bob \"pw\"\r\n");
        assert_matches!(Poll::Command(_), p.poll());

        p.feed(b"a2 APPEND INBOX {3}\r\n");
        assert_matches!(Poll::Continuation, p.poll());
        assert_eq!(1, std::fs::read_dir(dir.path()).unwrap().count());
        p.feed(b"abc\r\n");
        let cmd = match p.poll() {
            Poll::Command(cmd) => cmd,
            p => panic!("unexpected {:?}", p),
        };
        assert!(cmd.args[1].literal().unwrap().is_spooled());
        drop(cmd);
        assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());
    }

    #[test]
    fn abort_disposes_partial_literals() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LiteralStore::new(Some(dir.path().to_owned()), 0, 1 << 20);
        let mut p = RequestParser::new(store, limits());

        p.feed(b"a1 APPEND INBOX (\\Seen) {3+}\r\nabc {100}\r\n");
        assert_matches!(Poll::Continuation, p.poll());
        p.feed(b"partial");
        assert_matches!(Poll::NeedInput, p.poll());
        assert_eq!(2, std::fs::read_dir(dir.path()).unwrap().count());

        p.abort();
        assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());
        assert!(p.is_between_commands());

        p.feed(b"a2 NOOP\r\n");
        assert_matches!(Poll::Command(_), p.poll());
    }

    #[test]
    fn rejected_literal_storage_failure_skips_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LiteralStore::new(
            Some(dir.path().join("missing")),
            0,
            1 << 20,
        );
        let mut p = RequestParser::new(store, limits());
        assert_eq!(
            "rejected: a1 NO [UNAVAILABLE] Unable to store literal\n\
             command: a2 NOOP\n",
            drive(
                &mut p,
                [&b"a1 APPEND INBOX {3+}\r\nabc\r\na2 NOOP\r\n"[..]]
            )
        );
    }

    #[test]
    fn literal_suffix_detection() {
        assert_eq!(None, check_literal(b"a1 NOOP"));
        assert_eq!(None, check_literal(b"a1 LOGIN \"{5}\""));
        assert_eq!(
            Some(Ok(LiteralDecl {
                start: 9,
                len: 5,
                blocking: true,
                binary: false,
            })),
            check_literal(b"a1 LOGIN {5}")
        );
        assert_eq!(
            Some(Ok(LiteralDecl {
                start: 16,
                len: 12,
                blocking: false,
                binary: true,
            })),
            check_literal(b"a1 APPEND INBOX ~{12+}")
        );
        assert_eq!(Some(Err(())), check_literal(b"a1 X {+}"));
        assert_eq!(Some(Err(())), check_literal(b"a1 X {-1}"));
        assert_eq!(Some(Err(())), check_literal(b"a1 X {1++}"));
        assert_eq!(
            Some(Ok(LiteralDecl {
                start: 5,
                len: u64::MAX,
                blocking: true,
                binary: false,
            })),
            check_literal(b"a1 X {18446744073709551615}")
        );
        assert_eq!(
            Some(Err(())),
            check_literal(b"a1 X {18446744073709551616}")
        );
    }

    const CHUNKING_INPUT: &[u8] = b"a1 NOOP\r\n\
        a2 LOGIN {5}\r\nalice {8+}\r\npassword\r\n\
        a3 APPEND INBOX (\\Seen $Junk) ~{4}\r\n\0\r\n\x7f {0}\r\n\r\n\
        a4 UID STORE 1:3,5 +FLAGS (\\Deleted)\r\n\
        a5 LOGIN {4x}\r\n\
        a6 SEARCH CHARSET UTF-8 TEXT {3+}\r\n\xe2\x98\x83\r\n";

    proptest! {
        #[test]
        fn chunking_does_not_matter(
            sizes in prop::collection::vec(1usize..24, 1..64)
        ) {
            let expected = drive(&mut parser(), [CHUNKING_INPUT]);

            let mut chunks = Vec::new();
            let mut rest = CHUNKING_INPUT;
            let mut sizes = sizes.into_iter().cycle();
            while !rest.is_empty() {
                let n = sizes.next().unwrap().min(rest.len());
                chunks.push(&rest[..n]);
                rest = &rest[n..];
            }

            let mut p = parser();
            prop_assert_eq!(expected, drive(&mut p, chunks));
            prop_assert!(p.is_between_commands());
        }
    }

    #[test]
    fn every_two_way_split() {
        let expected = drive(&mut parser(), [CHUNKING_INPUT]);
        assert_eq!(
            6,
            expected
                .lines()
                .filter(|l| !l.starts_with("continuation"))
                .count()
        );
        for split in 0..=CHUNKING_INPUT.len() {
            let mut p = parser();
            assert_eq!(
                expected,
                drive(
                    &mut p,
                    [&CHUNKING_INPUT[..split], &CHUNKING_INPUT[split..]]
                ),
                "split at {}",
                split
            );
        }
    }
}
