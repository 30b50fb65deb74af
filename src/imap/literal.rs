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

//! Storage for literal payloads.
//!
//! A `Literal` is a write-once, read-many byte sink of a declared length.
//! Small literals live in memory; large ones, and anything the caller
//! expects to hand to durable storage, are spooled to an unnamed-on-drop
//! temporary file. Either way, `dispose()` (or dropping the `Literal`)
//! releases everything.

use std::fmt;
use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::PathBuf;

use log::warn;

use crate::support::error::Error;

/// Allocates `Literal`s.
#[derive(Clone, Debug)]
pub struct LiteralStore {
    spool_dir: Option<PathBuf>,
    spool_threshold: u64,
    max_literal_size: u64,
}

impl LiteralStore {
    /// Create a store which spools literals larger than `spool_threshold`
    /// into `spool_dir` (or the system temporary directory if `None`).
    pub fn new(
        spool_dir: Option<PathBuf>,
        spool_threshold: u64,
        max_literal_size: u64,
    ) -> Self {
        LiteralStore {
            spool_dir,
            spool_threshold,
            max_literal_size,
        }
    }

    /// A store that never spools and accepts literals of any size.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        LiteralStore::new(None, u64::MAX, u64::MAX)
    }

    pub fn max_literal_size(&self) -> u64 {
        self.max_literal_size
    }

    /// Allocate a sink for a literal of `declared` bytes.
    ///
    /// `prefer_spool` forces the literal onto disk regardless of size; it is
    /// set for payloads such as `APPEND` message bodies.
    ///
    /// A literal larger than the configured maximum fails with
    /// `SizeLimitExceeded`. Failure to create the spool file fails with
    /// `LiteralStorage`. Neither affects anything beyond the command being
    /// parsed.
    pub fn new_sink(
        &self,
        declared: u64,
        blocking: bool,
        binary: bool,
        prefer_spool: bool,
    ) -> Result<Literal, Error> {
        if declared > self.max_literal_size {
            return Err(Error::SizeLimitExceeded(self.max_literal_size));
        }

        let backing = if 0 != declared
            && (prefer_spool || declared > self.spool_threshold)
        {
            let file = match self.spool_dir {
                Some(ref dir) => tempfile::NamedTempFile::new_in(dir),
                None => tempfile::NamedTempFile::new(),
            }
            .map_err(Error::LiteralStorage)?;
            Backing::Spooled(file)
        } else {
            // The declared size is untrusted until the bytes arrive.
            let reserve = declared.min(self.spool_threshold).min(65536);
            let mut data = Vec::new();
            data.try_reserve_exact(reserve as usize).map_err(|_| {
                Error::LiteralStorage(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "Unable to allocate literal buffer",
                ))
            })?;
            Backing::Memory(data)
        };

        Ok(Literal {
            declared,
            written: 0,
            blocking,
            binary,
            backing,
        })
    }
}

/// A literal argument, possibly still being received.
pub struct Literal {
    declared: u64,
    written: u64,
    blocking: bool,
    binary: bool,
    backing: Backing,
}

enum Backing {
    Memory(Vec<u8>),
    Spooled(tempfile::NamedTempFile),
    Disposed,
}

impl Literal {
    /// Construct a complete in-memory literal directly.
    #[cfg(test)]
    pub fn of_data(data: &[u8], blocking: bool) -> Self {
        Literal {
            declared: data.len() as u64,
            written: data.len() as u64,
            blocking,
            binary: false,
            backing: Backing::Memory(data.to_vec()),
        }
    }

    /// The length the client declared for this literal.
    pub fn len(&self) -> u64 {
        self.declared
    }

    pub fn is_empty(&self) -> bool {
        0 == self.declared
    }

    /// The number of bytes still expected.
    pub fn remaining(&self) -> u64 {
        self.declared - self.written
    }

    /// Whether the client needed a continuation before sending the data,
    /// i.e., this was `{n}` rather than `{n+}`.
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Whether this used the `~{n}` binary syntax.
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    pub fn is_complete(&self) -> bool {
        self.written == self.declared
    }

    pub fn is_spooled(&self) -> bool {
        matches!(self.backing, Backing::Spooled(_))
    }

    #[cfg(test)]
    pub fn is_disposed(&self) -> bool {
        matches!(self.backing, Backing::Disposed)
    }

    /// The path of the spool file, if any.
    #[cfg(test)]
    pub fn spool_path(&self) -> Option<PathBuf> {
        match self.backing {
            Backing::Spooled(ref file) => Some(file.path().to_owned()),
            _ => None,
        }
    }

    /// The number of bytes this literal holds in memory.
    pub fn resident_bytes(&self) -> usize {
        match self.backing {
            Backing::Memory(ref data) => data.len(),
            _ => 0,
        }
    }

    /// Append as much of `src` as fits within the declared length.
    ///
    /// Returns the number of bytes consumed, which is less than `src.len()`
    /// only when the literal became complete.
    pub fn fill(&mut self, src: &[u8]) -> io::Result<usize> {
        let n = (self.remaining().min(src.len() as u64)) as usize;
        if 0 == n {
            return Ok(0);
        }

        match self.backing {
            Backing::Memory(ref mut data) => data.extend_from_slice(&src[..n]),
            Backing::Spooled(ref mut file) => {
                file.as_file_mut().write_all(&src[..n])?
            }
            Backing::Disposed => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "Write to disposed literal",
                ))
            }
        }

        self.written += n as u64;
        Ok(n)
    }

    /// Open a reader over the complete payload.
    pub fn reader(&self) -> io::Result<Box<dyn Read + '_>> {
        if !self.is_complete() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Literal is incomplete",
            ));
        }

        match self.backing {
            Backing::Memory(ref data) => Ok(Box::new(&data[..])),
            Backing::Spooled(ref file) => {
                let mut f = file.reopen()?;
                f.seek(io::SeekFrom::Start(0))?;
                Ok(Box::new(f.take(self.declared)))
            }
            Backing::Disposed => Err(io::Error::new(
                io::ErrorKind::Other,
                "Read from disposed literal",
            )),
        }
    }

    /// Read the full payload into memory.
    pub fn data(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.declared.min(65536) as usize);
        self.reader()?.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Release all resources held by this literal.
    ///
    /// Safe to call any number of times, and on incomplete literals.
    pub fn dispose(&mut self) {
        if let Backing::Spooled(file) =
            std::mem::replace(&mut self.backing, Backing::Disposed)
        {
            let path = file.path().to_owned();
            if let Err(e) = file.close() {
                if io::ErrorKind::NotFound != e.kind() {
                    warn!(
                        "Failed to remove literal spool {}: {}",
                        path.display(),
                        e
                    );
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
}

impl Write for Literal {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        if !src.is_empty() && self.is_complete() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "Literal already complete",
            ));
        }

        self.fill(src)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.backing {
            Backing::Spooled(ref mut file) => file.as_file_mut().flush(),
            _ => Ok(()),
        }
    }
}

impl Drop for Literal {
    fn drop(&mut self) {
        self.dispose();
    }
}

// Literals compare by length and syntax only; the payload itself is never
// examined.
impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        self.declared == other.declared && self.binary == other.binary
    }
}

impl Eq for Literal {}

impl fmt::Debug for Literal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Literal")
            .field("declared", &self.declared)
            .field("written", &self.written)
            .field("blocking", &self.blocking)
            .field("binary", &self.binary)
            .field("spooled", &self.is_spooled())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spool_store(dir: &tempfile::TempDir, threshold: u64) -> LiteralStore {
        LiteralStore::new(Some(dir.path().to_owned()), threshold, 1 << 20)
    }

    fn spool_count(dir: &tempfile::TempDir) -> usize {
        fs::read_dir(dir.path()).unwrap().count()
    }

    #[test]
    fn bounded_write_never_exceeds_declared() {
        let store = LiteralStore::in_memory();
        let mut lit = store.new_sink(5, true, false, false).unwrap();
        assert!(!lit.is_complete());
        assert_eq!(3, lit.fill(b"abc").unwrap());
        assert_eq!(2, lit.fill(b"defgh").unwrap());
        assert!(lit.is_complete());
        assert_eq!(0, lit.fill(b"more").unwrap());
        assert!(lit.write(b"x").is_err());
        assert_eq!(b"abcde".to_vec(), lit.data().unwrap());
    }

    #[test]
    fn incomplete_literal_cannot_be_read() {
        let store = LiteralStore::in_memory();
        let mut lit = store.new_sink(5, false, false, false).unwrap();
        lit.fill(b"ab").unwrap();
        assert!(lit.reader().is_err());
    }

    #[test]
    fn small_literals_stay_in_memory() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = spool_store(&dir, 16);
        let lit = store.new_sink(16, true, false, false).unwrap();
        assert!(!lit.is_spooled());
        assert_eq!(0, spool_count(&dir));
    }

    #[test]
    fn large_literals_are_spooled_and_removed() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = spool_store(&dir, 16);

        let mut lit = store.new_sink(32, true, false, false).unwrap();
        assert!(lit.is_spooled());
        assert_eq!(1, spool_count(&dir));
        let payload = [b'x'; 32];
        lit.write_all(&payload).unwrap();
        assert!(lit.is_complete());
        assert_eq!(0, lit.resident_bytes());
        assert_eq!(payload.to_vec(), lit.data().unwrap());
        // Readable more than once
        assert_eq!(payload.to_vec(), lit.data().unwrap());

        lit.dispose();
        assert!(lit.is_disposed());
        assert_eq!(0, spool_count(&dir));
        lit.dispose();
        assert!(lit.fill(b"x").is_ok());
    }

    #[test]
    fn preferred_spool_ignores_threshold() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = spool_store(&dir, 1024);
        let lit = store.new_sink(10, false, false, true).unwrap();
        assert!(lit.is_spooled());
        drop(lit);
        assert_eq!(0, spool_count(&dir));
    }

    #[test]
    fn partial_spool_removed_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = spool_store(&dir, 0);
        let mut lit = store.new_sink(100, false, false, false).unwrap();
        lit.fill(b"partial").unwrap();
        let path = lit.spool_path().unwrap();
        assert!(path.is_file());
        drop(lit);
        assert!(!path.exists());
    }

    #[test]
    fn oversized_literal_rejected() {
        let store = LiteralStore::new(None, 16, 100);
        assert_matches!(
            Err(Error::SizeLimitExceeded(100)),
            store.new_sink(101, true, false, false)
        );
    }

    #[test]
    fn unusable_spool_dir_is_storage_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LiteralStore::new(
            Some(dir.path().join("nonexistent")),
            0,
            1024,
        );
        assert_matches!(
            Err(Error::LiteralStorage(_)),
            store.new_sink(10, true, false, false)
        );
    }
}
