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

//! Mapping of arbitrary strings onto file name components.
//!
//! Folder cache keys are made of account ids, mailbox paths and
//! discriminators which may contain anything, including the `_` separator
//! used between components on disk. `encode_component` produces a string
//! that contains no separator, no path element and nothing a shell or IMAP
//! client would find surprising, and `decode_component` inverts it.

use std::fmt::Write as _;

/// Whether `b` may appear unescaped in an encoded component.
fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'+'
}

/// Encode `name` as a file name component.
///
/// Everything other than ASCII alphanumerics, `-`, `.` and `+` is written as
/// `%XX`. A leading `.` is also escaped so the result never names a hidden
/// file or a directory traversal. The empty string encodes to `%`, which no
/// other input produces.
pub fn encode_component(name: &str) -> String {
    if name.is_empty() {
        return "%".to_owned();
    }

    let mut out = String::with_capacity(name.len());
    for (ix, &b) in name.as_bytes().iter().enumerate() {
        if is_plain(b) && !(0 == ix && b'.' == b) {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{:02X}", b);
        }
    }
    out
}

/// Invert `encode_component`.
///
/// Returns `None` if `encoded` could not have been produced by
/// `encode_component`.
pub fn decode_component(encoded: &str) -> Option<String> {
    if "%" == encoded {
        return Some(String::new());
    }

    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut ix = 0;
    while ix < bytes.len() {
        match bytes[ix] {
            b'%' => {
                let hex = encoded.get(ix + 1..ix + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                ix += 3;
            }
            b if is_plain(b) => {
                out.push(b);
                ix += 1;
            }
            _ => return None,
        }
    }

    String::from_utf8(out).ok()
}
