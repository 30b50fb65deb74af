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

//! Fully-parsed IMAP commands.
//!
//! The request parser collects a command as a sequence of `Part`s: the text
//! of each line (with any trailing literal declaration removed) and the
//! literals between them. `Command::from_parts` lexes that into a tag, a verb
//! and a tree of typed `Argument`s. Nothing here knows the grammar of any
//! particular command; that is the dispatcher's job.

use std::fmt;
use std::str;

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while1},
    character::complete::{digit1, space0},
    combinator::{all_consuming, map, map_opt, opt, recognize, verify},
    multi::{fold_many0, many0, many1_count, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use super::literal::Literal;
use crate::support::error::Error;

/// A complete command, ready for dispatch.
///
/// Literals inside the arguments are released when the command is dropped.
#[derive(Debug, PartialEq, Eq)]
pub struct Command {
    pub tag: String,
    /// The verb, in upper case. For `UID FETCH` etc, this is `FETCH`.
    pub verb: String,
    /// Whether the verb was prefixed with `UID`.
    pub uid: bool,
    pub args: Vec<Argument>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Argument {
    Atom(String),
    Quoted(String),
    Nil,
    SequenceSet(SequenceSet),
    /// A parenthesised list of atoms that looks like a flag list: empty, or
    /// containing at least one `\`-prefixed system flag.
    FlagList(Vec<String>),
    List(Vec<Argument>),
    Literal(Literal),
}

/// A raw piece of a command as received.
#[derive(Debug)]
pub enum Part {
    Line(Vec<u8>),
    Literal(Literal),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceSet {
    raw: String,
    ranges: Vec<SeqRange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeqRange {
    pub start: SeqBound,
    pub end: SeqBound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqBound {
    Number(u32),
    Star,
}

impl SequenceSet {
    /// Parse a complete sequence set, e.g. `1:5,7,9:*` or `$`.
    pub fn parse(s: &str) -> Option<Self> {
        all_consuming(sequence_set)(s.as_bytes())
            .ok()
            .map(|(_, ranges)| SequenceSet {
                raw: s.to_owned(),
                ranges,
            })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The ranges of the set. Empty for the saved-result reference `$`.
    pub fn ranges(&self) -> &[SeqRange] {
        &self.ranges
    }

    pub fn is_saved_result(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl Argument {
    /// The textual value of atoms, quoted strings and sequence sets.
    pub fn as_str(&self) -> Option<&str> {
        match *self {
            Argument::Atom(ref s) | Argument::Quoted(ref s) => Some(s),
            Argument::SequenceSet(ref s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn flags(&self) -> Option<&[String]> {
        match *self {
            Argument::FlagList(ref f) => Some(f),
            _ => None,
        }
    }

    pub fn literal(&self) -> Option<&Literal> {
        match *self {
            Argument::Literal(ref l) => Some(l),
            _ => None,
        }
    }

    fn dispose_literals(&mut self) {
        match *self {
            Argument::Literal(ref mut l) => l.dispose(),
            Argument::List(ref mut items) => {
                items.iter_mut().for_each(Argument::dispose_literals)
            }
            _ => (),
        }
    }

    fn write_loggable(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Argument::Atom(ref s) => write!(f, "{}", s),
            Argument::Quoted(ref s) => write!(f, "{:?}", s),
            Argument::Nil => write!(f, "NIL"),
            Argument::SequenceSet(ref s) => write!(f, "{}", s.as_str()),
            Argument::FlagList(ref flags) => {
                write!(f, "({})", flags.join(" "))
            }
            Argument::List(ref items) => {
                write!(f, "(")?;
                for (ix, item) in items.iter().enumerate() {
                    if ix > 0 {
                        write!(f, " ")?;
                    }
                    item.write_loggable(f)?;
                }
                write!(f, ")")
            }
            Argument::Literal(ref l) => {
                write!(
                    f,
                    "{}{{{}{}}}",
                    if l.is_binary() { "~" } else { "" },
                    l.len(),
                    if l.is_blocking() { "" } else { "+" },
                )
            }
        }
    }
}

impl Command {
    /// Assemble a command from the parts the request parser collected.
    ///
    /// `tag` has already been extracted from the first line by the parser and
    /// is skipped here.
    pub fn from_parts(tag: String, parts: Vec<Part>) -> Result<Self, Error> {
        let mut tokens = Vec::new();
        for (ix, part) in parts.into_iter().enumerate() {
            match part {
                Part::Line(line) => {
                    // Tags are not atoms (they may hold a lone `[`), so the
                    // tag is cut off rather than lexed.
                    let text = if 0 == ix {
                        strip_tag(&line, &tag).ok_or_else(|| {
                            Error::Parse("Missing command tag".to_owned())
                        })?
                    } else {
                        &line[..]
                    };
                    let (_, line_tokens) = line_tokens(text).map_err(|_| {
                        Error::Parse("Unparsable command syntax".to_owned())
                    })?;
                    tokens.extend(line_tokens);
                }
                Part::Literal(_) if 0 == ix => {
                    return Err(Error::Parse("Missing command tag".to_owned()))
                }
                Part::Literal(lit) => tokens.push(Token::Literal(lit)),
            }
        }

        let mut tokens = tokens.into_iter();

        let mut verb = match tokens.next() {
            Some(Token::Atom(verb)) => verb.to_ascii_uppercase(),
            _ => return Err(Error::Parse("Missing command".to_owned())),
        };

        let uid = "UID" == verb;
        if uid {
            verb = match tokens.next() {
                Some(Token::Atom(verb)) => verb.to_ascii_uppercase(),
                _ => {
                    return Err(Error::Parse(
                        "Missing command after UID".to_owned(),
                    ))
                }
            };
        }

        let args = build_args(&mut tokens, false)?;
        Ok(Command {
            tag,
            verb,
            uid,
            args,
        })
    }

    /// The verb as the client would write it, e.g. `UID FETCH`.
    pub fn full_verb(&self) -> String {
        if self.uid {
            format!("UID {}", self.verb)
        } else {
            self.verb.clone()
        }
    }

    /// Release the storage of every literal in the command.
    pub fn dispose_literals(&mut self) {
        self.args.iter_mut().for_each(Argument::dispose_literals);
    }

    /// Whether the arguments of this command carry credentials and must not
    /// be logged.
    pub fn is_sensitive(&self) -> bool {
        "LOGIN" == self.verb || "AUTHENTICATE" == self.verb
    }
}

/// Renders the command for logs. Arguments of credential-bearing commands are
/// elided and literal payloads are never shown.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.tag, self.full_verb())?;
        if self.is_sensitive() {
            if !self.args.is_empty() {
                write!(f, " <omitted>")?;
            }
            return Ok(());
        }

        for arg in &self.args {
            write!(f, " ")?;
            arg.write_loggable(f)?;
        }
        Ok(())
    }
}

/// Extract the tag from the start of a command line.
///
/// Returns `None` if the line does not start with a valid tag followed by a
/// space or end of line.
pub fn parse_tag(line: &[u8]) -> Option<String> {
    let end = line
        .iter()
        .position(|&b| !is_tag_char(b))
        .unwrap_or(line.len());
    if 0 == end || (end < line.len() && b' ' != line[end]) {
        return None;
    }

    str::from_utf8(&line[..end]).ok().map(str::to_owned)
}

fn strip_tag<'a>(line: &'a [u8], tag: &str) -> Option<&'a [u8]> {
    let rest = line.strip_prefix(tag.as_bytes())?;
    match rest.first() {
        None | Some(b' ') => Some(rest),
        Some(_) => None,
    }
}

/// Extract the verb (upper-cased) following the tag on the first line of a
/// command, if there is one.
pub fn peek_verb(line: &[u8]) -> Option<String> {
    let tag = parse_tag(line)?;
    let rest = line.get(tag.len() + 1..)?;
    let end = rest
        .iter()
        .position(|&b| !is_atom_char(b))
        .unwrap_or(rest.len());
    if 0 == end {
        return None;
    }

    str::from_utf8(&rest[..end])
        .ok()
        .map(str::to_ascii_uppercase)
}

fn is_atom_char(b: u8) -> bool {
    match b {
        0..=b' ' | 127..=255 => false,
        b'(' | b')' | b'{' | b'"' | b'[' => false,
        _ => true,
    }
}

fn is_tag_char(b: u8) -> bool {
    match b {
        0..=b' ' | 127..=255 => false,
        b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b'+' => false,
        _ => true,
    }
}

enum Token {
    Open,
    Close,
    Atom(String),
    Quoted(String),
    Literal(Literal),
}

fn build_args(
    tokens: &mut impl Iterator<Item = Token>,
    nested: bool,
) -> Result<Vec<Argument>, Error> {
    let mut args = Vec::new();
    loop {
        let arg = match tokens.next() {
            None if nested => {
                return Err(Error::Parse("Unbalanced parentheses".to_owned()))
            }
            None => return Ok(args),
            Some(Token::Close) if nested => return Ok(args),
            Some(Token::Close) => {
                return Err(Error::Parse("Unbalanced parentheses".to_owned()))
            }
            Some(Token::Open) => classify_list(build_args(tokens, true)?),
            Some(Token::Atom(a)) => classify_atom(a),
            Some(Token::Quoted(q)) => Argument::Quoted(q),
            Some(Token::Literal(l)) => Argument::Literal(l),
        };
        args.push(arg);
    }
}

fn classify_atom(atom: String) -> Argument {
    if atom.eq_ignore_ascii_case("NIL") {
        Argument::Nil
    } else if let Some(seqset) = SequenceSet::parse(&atom) {
        Argument::SequenceSet(seqset)
    } else {
        Argument::Atom(atom)
    }
}

fn classify_list(items: Vec<Argument>) -> Argument {
    let all_atoms = items.iter().all(|a| matches!(*a, Argument::Atom(_)));
    let has_system_flag = items
        .iter()
        .any(|a| matches!(*a, Argument::Atom(ref s) if s.starts_with('\\')));

    if items.is_empty() || (all_atoms && has_system_flag) {
        Argument::FlagList(
            items
                .into_iter()
                .filter_map(|a| match a {
                    Argument::Atom(s) => Some(s),
                    _ => None,
                })
                .collect(),
        )
    } else {
        Argument::List(items)
    }
}

// ==================== LEXER ====================

fn atom(i: &[u8]) -> IResult<&[u8], String> {
    map(
        recognize(many1_count(alt((
            take_while1(is_atom_char),
            // Section specifiers like BODY[HEADER.FIELDS (FROM TO)] are
            // kept as part of the atom.
            recognize(tuple((tag("["), opt(is_not("]\r\n")), tag("]")))),
        )))),
        |s| String::from_utf8_lossy(s).into_owned(),
    )(i)
}

fn quoted_char(i: &[u8]) -> IResult<&[u8], &[u8]> {
    preceded(tag("\\"), alt((tag("\\"), tag("\""))))(i)
}

fn quoted_string_content(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((quoted_char, is_not("\r\n\"\\")))(i)
}

fn quoted(i: &[u8]) -> IResult<&[u8], String> {
    delimited(
        tag("\""),
        fold_many0(quoted_string_content, String::new, |mut accum, piece| {
            accum.push_str(&String::from_utf8_lossy(piece));
            accum
        }),
        tag("\""),
    )(i)
}

fn token(i: &[u8]) -> IResult<&[u8], Token> {
    alt((
        map(tag("("), |_| Token::Open),
        map(tag(")"), |_| Token::Close),
        map(quoted, Token::Quoted),
        map(atom, Token::Atom),
    ))(i)
}

fn line_tokens(i: &[u8]) -> IResult<&[u8], Vec<Token>> {
    all_consuming(preceded(space0, many0(terminated(token, space0))))(i)
}

fn seq_number(i: &[u8]) -> IResult<&[u8], SeqBound> {
    alt((
        map(tag("*"), |_| SeqBound::Star),
        map_opt(verify(digit1, |s: &[u8]| b'0' != s[0]), |s| {
            str::from_utf8(s)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .map(SeqBound::Number)
        }),
    ))(i)
}

fn seq_range(i: &[u8]) -> IResult<&[u8], SeqRange> {
    map(
        pair(seq_number, opt(preceded(tag(":"), seq_number))),
        |(start, end)| SeqRange {
            start,
            end: end.unwrap_or(start),
        },
    )(i)
}

fn sequence_set(i: &[u8]) -> IResult<&[u8], Vec<SeqRange>> {
    alt((
        map(tag("$"), |_| Vec::new()),
        separated_list1(tag(","), seq_range),
    ))(i)
}

#[cfg(test)]
mod test {
    use super::*;

    fn line(s: &str) -> Part {
        Part::Line(s.as_bytes().to_vec())
    }

    fn parse(s: &str) -> Result<Command, Error> {
        let tag = parse_tag(s.as_bytes()).unwrap();
        Command::from_parts(tag, vec![line(s)])
    }

    fn atom_arg(s: &str) -> Argument {
        Argument::Atom(s.to_owned())
    }

    fn seq(s: &str) -> Argument {
        Argument::SequenceSet(SequenceSet::parse(s).unwrap())
    }

    #[test]
    fn tags() {
        assert_eq!(Some("a001".to_owned()), parse_tag(b"a001 NOOP"));
        assert_eq!(Some("a001".to_owned()), parse_tag(b"a001"));
        assert_eq!(Some("x.1]".to_owned()), parse_tag(b"x.1] NOOP"));
        assert_eq!(None, parse_tag(b""));
        assert_eq!(None, parse_tag(b" NOOP"));
        assert_eq!(None, parse_tag(b"a+1 NOOP"));
        assert_eq!(None, parse_tag(b"* NOOP"));
        assert_eq!(None, parse_tag(b"a\"b NOOP"));
        assert_eq!(None, parse_tag(b"a{1} NOOP"));
    }

    #[test]
    fn bracketed_tags() {
        assert_eq!(Some("a[1".to_owned()), parse_tag(b"a[1 NOOP"));

        let cmd = parse("a[1 NOOP").unwrap();
        assert_eq!("a[1", cmd.tag);
        assert_eq!("NOOP", cmd.verb);

        let cmd = parse("[x] select INBOX").unwrap();
        assert_eq!("[x]", cmd.tag);
        assert_eq!("SELECT", cmd.verb);
        assert_eq!(vec![atom_arg("INBOX")], cmd.args);

        assert_matches!(
            Err(Error::Parse(_)),
            Command::from_parts("b1".to_owned(), vec![line("a1 NOOP")])
        );
        assert_matches!(
            Err(Error::Parse(_)),
            Command::from_parts("a1".to_owned(), vec![line("a1x NOOP")])
        );
    }

    #[test]
    fn verbs() {
        assert_eq!(Some("APPEND".to_owned()), peek_verb(b"a1 append INBOX "));
        assert_eq!(Some("LOGIN".to_owned()), peek_verb(b"a1 LOGIN"));
        assert_eq!(None, peek_verb(b"a1"));
        assert_eq!(None, peek_verb(b"a1 "));
    }

    #[test]
    fn simple_commands() {
        let cmd = parse("a1 noop").unwrap();
        assert_eq!("a1", cmd.tag);
        assert_eq!("NOOP", cmd.verb);
        assert!(!cmd.uid);
        assert!(cmd.args.is_empty());

        let cmd = parse(
            "a2 uid fetch 1:*,4 (FLAGS BODY.PEEK[HEADER.FIELDS (FROM TO)])",
        )
        .unwrap();
        assert_eq!("FETCH", cmd.verb);
        assert!(cmd.uid);
        assert_eq!("UID FETCH", cmd.full_verb());
        assert_eq!(
            vec![
                seq("1:*,4"),
                Argument::List(vec![
                    atom_arg("FLAGS"),
                    atom_arg("BODY.PEEK[HEADER.FIELDS (FROM TO)]"),
                ]),
            ],
            cmd.args
        );
    }

    #[test]
    fn argument_kinds() {
        let cmd = parse(
            r#"a3 STORE 2 +FLAGS.SILENT (\Seen $Label) "q\"uo\\ted" nil ()"#,
        )
        .unwrap();
        assert_eq!(
            vec![
                seq("2"),
                atom_arg("+FLAGS.SILENT"),
                Argument::FlagList(vec![
                    "\\Seen".to_owned(),
                    "$Label".to_owned()
                ]),
                Argument::Quoted("q\"uo\\ted".to_owned()),
                Argument::Nil,
                Argument::FlagList(vec![]),
            ],
            cmd.args
        );
        assert_eq!(Some("q\"uo\\ted"), cmd.args[3].as_str());
        assert_eq!(2, cmd.args[2].flags().unwrap().len());
    }

    #[test]
    fn literals_between_lines() {
        let tag = "a4".to_owned();
        let cmd = Command::from_parts(
            tag,
            vec![
                line("a4 LOGIN "),
                Part::Literal(Literal::of_data(b"alice", true)),
                line(" "),
                Part::Literal(Literal::of_data(b"password", false)),
                line(""),
            ],
        )
        .unwrap();

        assert_eq!("LOGIN", cmd.verb);
        assert_eq!(2, cmd.args.len());
        assert_eq!(
            b"alice".to_vec(),
            cmd.args[0].literal().unwrap().data().unwrap()
        );
        assert_eq!(8, cmd.args[1].literal().unwrap().len());
        assert_eq!("a4 LOGIN <omitted>", cmd.to_string());
    }

    #[test]
    fn literal_inside_list() {
        let cmd = Command::from_parts(
            "a5".to_owned(),
            vec![
                line("a5 SEARCH (SUBJECT "),
                Part::Literal(Literal::of_data(b"hi", false)),
                line(")"),
            ],
        )
        .unwrap();
        assert_eq!(
            "a5 SEARCH (SUBJECT {2+})",
            cmd.to_string()
        );
    }

    #[test]
    fn syntax_errors() {
        assert_matches!(Err(Error::Parse(_)), parse("a1"));
        assert_matches!(Err(Error::Parse(_)), parse("a1 UID"));
        assert_matches!(Err(Error::Parse(_)), parse("a1 FETCH (1"));
        assert_matches!(Err(Error::Parse(_)), parse("a1 FETCH 1)"));
        assert_matches!(Err(Error::Parse(_)), parse("a1 FETCH \"unterminated"));
        assert_matches!(Err(Error::Parse(_)), parse("a1 FETCH {oops"));
        assert_matches!(Err(Error::Parse(_)), parse("a1 (FETCH)"));
    }

    #[test]
    fn sequence_sets() {
        assert!(SequenceSet::parse("1").is_some());
        assert!(SequenceSet::parse("*").is_some());
        assert!(SequenceSet::parse("1:5,7,9:*").is_some());
        assert!(SequenceSet::parse("$").unwrap().is_saved_result());
        assert!(SequenceSet::parse("0").is_none());
        assert!(SequenceSet::parse("1,").is_none());
        assert!(SequenceSet::parse(":1").is_none());
        assert!(SequenceSet::parse("1:2:3").is_none());
        assert!(SequenceSet::parse("01").is_none());
        assert!(SequenceSet::parse("INBOX").is_none());

        let set = SequenceSet::parse("3:*,5").unwrap();
        assert_eq!(
            &[
                SeqRange {
                    start: SeqBound::Number(3),
                    end: SeqBound::Star,
                },
                SeqRange {
                    start: SeqBound::Number(5),
                    end: SeqBound::Number(5),
                },
            ],
            set.ranges()
        );
    }

    #[test]
    fn dispose_reaches_nested_literals() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = super::super::literal::LiteralStore::new(
            Some(dir.path().to_owned()),
            0,
            1024,
        );
        let mut lit = store.new_sink(2, false, false, false).unwrap();
        lit.fill(b"hi").unwrap();

        let mut cmd = Command::from_parts(
            "a6".to_owned(),
            vec![line("a6 SEARCH (TEXT "), Part::Literal(lit), line(")")],
        )
        .unwrap();
        assert_eq!(1, std::fs::read_dir(dir.path()).unwrap().count());
        cmd.dispose_literals();
        assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());
    }
}
