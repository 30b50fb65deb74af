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

//! A folder cache shared between hosts through a network key/value store.

use std::fmt::Write as _;

use log::warn;
use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Sha3};

use super::{FolderCache, FolderKey, FolderSnapshot};
use crate::support::error::Error;

const KEY_PREFIX: &str = "quillmap:folder:";

/// The operations needed from a shared key/value store.
///
/// Keys are short printable ASCII strings without whitespace.
pub trait SharedCacheClient: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
    fn set(&self, key: &str, value: &[u8], ttl_secs: u32) -> Result<(), Error>;
    fn delete(&self, key: &str) -> Result<(), Error>;
    /// Refresh the expiry of `key`, if it exists.
    fn touch(&self, key: &str, ttl_secs: u32) -> Result<(), Error>;
}

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

pub struct DistributedFolderCache {
    client: Box<dyn SharedCacheClient>,
    ttl_secs: u32,
}

impl DistributedFolderCache {
    pub fn new(client: Box<dyn SharedCacheClient>, ttl_secs: u32) -> Self {
        DistributedFolderCache { client, ttl_secs }
    }

    /// The store key for `key`: a fixed prefix and the SHA-3 of the CBOR
    /// encoding of the key, in lowercase hex.
    ///
    /// Hashing keeps arbitrary account and mailbox names within the length
    /// and character limits of the store.
    pub fn store_key(key: &FolderKey) -> Result<String, Error> {
        let cbor = serde_cbor::to_vec(key)?;
        let mut sha3 = Sha3::v256();
        sha3.update(&cbor);
        let mut hash = [0u8; 32];
        sha3.finalize(&mut hash);

        let mut out = String::with_capacity(KEY_PREFIX.len() + 2 * hash.len());
        out.push_str(KEY_PREFIX);
        for &b in &hash {
            let _ = write!(out, "{:02x}", b);
        }
        Ok(out)
    }

    fn try_put(
        &self,
        key: &FolderKey,
        snapshot: &FolderSnapshot,
    ) -> Result<(), Error> {
        let value = serde_cbor::to_vec(&EntryRef { key, snapshot })?;
        self.client
            .set(&Self::store_key(key)?, &value, self.ttl_secs)
    }

    fn try_get(
        &self,
        key: &FolderKey,
    ) -> Result<Option<FolderSnapshot>, Error> {
        let store_key = Self::store_key(key)?;
        let value = match self.client.get(&store_key)? {
            Some(value) => value,
            None => return Ok(None),
        };

        match serde_cbor::from_slice::<Entry>(&value) {
            Ok(entry) if entry.key == *key => Ok(Some(entry.snapshot)),
            Ok(entry) => {
                warn!(
                    "Shared cache holds {} under the key of {}",
                    entry.key, key
                );
                self.client.delete(&store_key)?;
                Ok(None)
            }
            Err(e) => {
                warn!("Shared cache entry for {} is corrupt: {}", key, e);
                self.client.delete(&store_key)?;
                Ok(None)
            }
        }
    }

    fn try_remove(&self, key: &FolderKey) -> Result<(), Error> {
        self.client.delete(&Self::store_key(key)?)
    }

    fn try_touch(&self, key: &FolderKey) -> Result<(), Error> {
        self.client.touch(&Self::store_key(key)?, self.ttl_secs)
    }
}

impl FolderCache for DistributedFolderCache {
    fn name(&self) -> &'static str {
        "distributed"
    }

    fn put(&self, key: &FolderKey, snapshot: &FolderSnapshot) {
        if let Err(e) = self.try_put(key, snapshot) {
            warn!("Failed to write {} to shared cache: {}", key, e);
        }
    }

    fn get(&self, key: &FolderKey) -> Option<FolderSnapshot> {
        match self.try_get(key) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to read {} from shared cache: {}", key, e);
                None
            }
        }
    }

    fn remove(&self, key: &FolderKey) {
        if let Err(e) = self.try_remove(key) {
            warn!("Failed to remove {} from shared cache: {}", key, e);
        }
    }

    fn touch(&self, key: &FolderKey) {
        if let Err(e) = self.try_touch(key) {
            warn!("Failed to touch {} in shared cache: {}", key, e);
        }
    }
}
