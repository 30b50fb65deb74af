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

//! The durable, host-local folder cache.
//!
//! Each snapshot is one file directly inside the cache directory, named
//! `<account>_<mailbox>_<discriminator>.qfc` with every component encoded by
//! `safe_name::encode_component` (which never emits `_`). The content is the
//! zstd-compressed CBOR encoding of the key and the snapshot; the embedded
//! key guards against a file having been renamed or written by something
//! else.
//!
//! Files are staged in `tmp/` and moved into place without clobbering, so
//! the first writer of a key wins and readers never see a partial file.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{FolderCache, FolderKey, FolderSnapshot};
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};
use crate::support::safe_name::{decode_component, encode_component};

const EXTENSION: &str = "qfc";
const TMP_DIR: &str = "tmp";
const ZSTD_LEVEL: i32 = 5;
/// Separates a discriminator from the session which wrote it.
const SESSION_SEPARATOR: char = '+';

#[derive(Serialize)]
struct EntryRef<'a> {
    key: &'a FolderKey,
    snapshot: &'a FolderSnapshot,
}

#[derive(Deserialize)]
struct Entry {
    key: FolderKey,
    snapshot: FolderSnapshot,
}

#[derive(Debug)]
pub struct DiskFolderCache {
    root: PathBuf,
    tmp: PathBuf,
}

impl DiskFolderCache {
    /// Open (creating if needed) the cache in `root` and sweep it.
    ///
    /// Returns the cache and the number of files the sweep removed.
    pub fn open(root: impl AsRef<Path>) -> Result<(Self, usize), Error> {
        let root = root.as_ref().to_owned();
        let tmp = root.join(TMP_DIR);
        fs::create_dir_all(&tmp)?;

        let this = DiskFolderCache { root, tmp };
        let pruned = this.sweep()?;
        Ok((this, pruned))
    }

    /// Remove leftovers of interrupted writes, and every snapshot which has
    /// been superseded by a newer one of the same folder.
    ///
    /// Among files sharing account and mailbox, only the one with the
    /// greatest discriminator (per `compare_discriminators`) survives. A
    /// survivor written under a session-qualified discriminator
    /// (`<base>+<session>`) is then moved to `<base>`, so the next session
    /// to select the folder finds it. Files in the cache directory whose
    /// names cannot be decoded are removed too.
    pub fn sweep(&self) -> Result<usize, Error> {
        let mut pruned = file_ops::clear_dir(&self.tmp)?;

        let mut newest: HashMap<(String, String), (String, PathBuf)> =
            HashMap::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(EXTENSION)
            {
                continue;
            }

            let key = match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(parse_file_stem)
            {
                Some(key) => key,
                None => {
                    warn!(
                        "Removing unrecognised cache file {}",
                        path.display()
                    );
                    fs::remove_file(&path).ignore_not_found()?;
                    pruned += 1;
                    continue;
                }
            };

            let folder = (key.account, key.mailbox);
            let loser = match newest.remove(&folder) {
                None => {
                    newest.insert(folder, (key.discriminator, path));
                    continue;
                }
                Some((disc, existing)) => {
                    if Ordering::Greater
                        == compare_discriminators(&key.discriminator, &disc)
                    {
                        newest.insert(folder, (key.discriminator, path));
                        existing
                    } else {
                        newest.insert(folder, (disc, existing));
                        path
                    }
                }
            };

            debug!("Pruning superseded cache file {}", loser.display());
            fs::remove_file(&loser).ignore_not_found()?;
            pruned += 1;
        }

        for ((account, mailbox), (discriminator, path)) in newest {
            let key = FolderKey {
                account,
                mailbox,
                discriminator,
            };
            if !self.strip_session(key, &path)? {
                pruned += 1;
            }
        }

        Ok(pruned)
    }

    /// Move the entry at `path` from a session-qualified key to the plain
    /// one.
    ///
    /// Returns whether an entry for the folder remains.
    fn strip_session(
        &self,
        key: FolderKey,
        path: &Path,
    ) -> Result<bool, Error> {
        let base = match key.discriminator.find(SESSION_SEPARATOR) {
            Some(ix) => key.discriminator[..ix].to_owned(),
            None => return Ok(true),
        };
        let target = FolderKey {
            discriminator: base,
            ..key.clone()
        };

        // The embedded key must match the name, so rewrite rather than
        // rename
        match self.try_get(&key)? {
            Some(snapshot) => {
                self.try_put(&target, &snapshot)?;
                fs::remove_file(path).ignore_not_found()?;
                debug!("Moved cache entry {} to {}", key, target);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn path_for(&self, key: &FolderKey) -> PathBuf {
        self.root.join(format!(
            "{}_{}_{}.{}",
            encode_component(&key.account),
            encode_component(&key.mailbox),
            encode_component(&key.discriminator),
            EXTENSION
        ))
    }

    fn try_put(
        &self,
        key: &FolderKey,
        snapshot: &FolderSnapshot,
    ) -> Result<(), Error> {
        let cbor = serde_cbor::to_vec(&EntryRef { key, snapshot })?;
        let data = zstd::encode_all(&cbor[..], ZSTD_LEVEL)?;
        file_ops::spit(&self.tmp, self.path_for(key), false, 0o600, &data)
            .ignore_already_exists()?;
        Ok(())
    }

    fn try_get(
        &self,
        key: &FolderKey,
    ) -> Result<Option<FolderSnapshot>, Error> {
        let path = self.path_for(key);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };

        let decoded = zstd::decode_all(&data[..])
            .map_err(Error::from)
            .and_then(|cbor| {
                serde_cbor::from_slice::<Entry>(&cbor).map_err(Error::from)
            });

        match decoded {
            Ok(entry) if entry.key == *key => Ok(Some(entry.snapshot)),
            Ok(entry) => {
                warn!(
                    "Cache file {} holds {} instead of {}; removing",
                    path.display(),
                    entry.key,
                    key
                );
                fs::remove_file(&path).ignore_not_found()?;
                Ok(None)
            }
            Err(e) => {
                warn!(
                    "Cache file {} is corrupt; removing: {}",
                    path.display(),
                    e
                );
                fs::remove_file(&path).ignore_not_found()?;
                Ok(None)
            }
        }
    }
}

/// Order discriminators for the sweep.
///
/// The base (before any `+<session>` suffix) is compared in natural order:
/// runs of ASCII digits compare by numeric value, so `10.1` is greater than
/// `9.1`, and everything else compares byte-wise. With equal bases, an
/// unqualified discriminator is greater than a session-qualified one, and
/// two session-qualified ones compare by suffix in natural order.
fn compare_discriminators(a: &str, b: &str) -> Ordering {
    let mut a_parts = a.splitn(2, SESSION_SEPARATOR);
    let mut b_parts = b.splitn(2, SESSION_SEPARATOR);
    let a_base = a_parts.next().unwrap_or("");
    let b_base = b_parts.next().unwrap_or("");

    natural_cmp(a_base, b_base).then_with(|| {
        match (a_parts.next(), b_parts.next()) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => natural_cmp(a, b),
        }
    })
}

fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let (a_digits, a_rest) = split_digits(a);
                let (b_digits, b_rest) = split_digits(b);
                let a_value = trim_zeros(a_digits);
                let b_value = trim_zeros(b_digits);
                let ord = a_value
                    .len()
                    .cmp(&b_value.len())
                    .then_with(|| a_value.cmp(b_value))
                    .then_with(|| a_digits.len().cmp(&b_digits.len()));
                if Ordering::Equal != ord {
                    return ord;
                }
                a = a_rest;
                b = b_rest;
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn split_digits(s: &[u8]) -> (&[u8], &[u8]) {
    let end = s
        .iter()
        .position(|c| !c.is_ascii_digit())
        .unwrap_or_else(|| s.len());
    s.split_at(end)
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let start = digits
        .iter()
        .position(|&c| b'0' != c)
        .unwrap_or_else(|| digits.len());
    &digits[start..]
}

fn parse_file_stem(stem: &str) -> Option<FolderKey> {
    let mut parts = stem.split('_');
    let account = decode_component(parts.next()?)?;
    let mailbox = decode_component(parts.next()?)?;
    let discriminator = decode_component(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }

    Some(FolderKey {
        account,
        mailbox,
        discriminator,
    })
}

impl FolderCache for DiskFolderCache {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn put(&self, key: &FolderKey, snapshot: &FolderSnapshot) {
        if let Err(e) = self.try_put(key, snapshot) {
            warn!("Failed to write {} to disk cache: {}", key, e);
        }
    }

    fn get(&self, key: &FolderKey) -> Option<FolderSnapshot> {
        match self.try_get(key) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to read {} from disk cache: {}", key, e);
                None
            }
        }
    }

    fn remove(&self, key: &FolderKey) {
        if let Err(e) = fs::remove_file(self.path_for(key)).ignore_not_found()
        {
            warn!("Failed to remove {} from disk cache: {}", key, e);
        }
    }

    fn touch(&self, key: &FolderKey) {
        if let Err(e) = file_ops::touch(self.path_for(key)).ignore_not_found()
        {
            warn!("Failed to touch {} in disk cache: {}", key, e);
        }
    }
}
