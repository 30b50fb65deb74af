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

//! Miscellaneous functions for working with files.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::SystemTime;

/// Write `data` into the file at `path`, atomically.
///
/// The file will first be staged within `tmp`.
///
/// If `overwrite` is true, this will replace anything already at `path`. If
/// false, the call will fail with `AlreadyExists` if `path` already exists.
pub fn spit(
    tmp: impl AsRef<Path>,
    path: impl AsRef<Path>,
    overwrite: bool,
    mode: u32,
    data: &[u8],
) -> io::Result<()> {
    let mut tf = tempfile::NamedTempFile::new_in(tmp)?;
    tf.as_file_mut().write_all(data)?;
    chmod(tf.path(), mode)?;
    tf.as_file_mut().sync_all()?;
    if overwrite {
        tf.persist(path)?;
    } else {
        tf.persist_noclobber(path)?;
    }
    Ok(())
}

pub fn chmod(path: impl AsRef<Path>, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Set the modification time of `path` to now.
pub fn touch(path: impl AsRef<Path>) -> io::Result<()> {
    fs::OpenOptions::new()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

/// Remove every regular file directly inside `dir`, returning how many were
/// removed.
pub fn clear_dir(dir: impl AsRef<Path>) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path()).ignore_not_found()?;
            removed += 1;
        }
    }
    Ok(removed)
}

pub trait IgnoreKinds {
    fn ignore_already_exists(self) -> Self;
    fn ignore_not_found(self) -> Self;
}

impl<R: Default> IgnoreKinds for Result<R, io::Error> {
    fn ignore_already_exists(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => {
                Ok(R::default())
            }
            Err(e) => Err(e),
        }
    }

    fn ignore_not_found(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(R::default()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spit_without_overwrite_keeps_first_writer() {
        let root = tempfile::TempDir::new().unwrap();
        let target = root.path().join("target");

        spit(root.path(), &target, false, 0o600, b"first").unwrap();
        let err = spit(root.path(), &target, false, 0o600, b"second")
            .unwrap_err();
        assert_eq!(io::ErrorKind::AlreadyExists, err.kind());
        assert_eq!(b"first".to_vec(), fs::read(&target).unwrap());

        spit(root.path(), &target, false, 0o600, b"third")
            .ignore_already_exists()
            .unwrap();
        assert_eq!(b"first".to_vec(), fs::read(&target).unwrap());

        spit(root.path(), &target, true, 0o600, b"fourth").unwrap();
        assert_eq!(b"fourth".to_vec(), fs::read(&target).unwrap());
    }

    #[test]
    fn clear_dir_removes_files_only() {
        let root = tempfile::TempDir::new().unwrap();
        fs::write(root.path().join("a"), b"x").unwrap();
        fs::write(root.path().join("b"), b"y").unwrap();
        fs::create_dir(root.path().join("sub")).unwrap();

        assert_eq!(2, clear_dir(root.path()).unwrap());
        assert!(root.path().join("sub").is_dir());
        assert!(!root.path().join("a").exists());
    }

    #[test]
    fn ignore_not_found_on_missing_file() {
        let root = tempfile::TempDir::new().unwrap();
        fs::remove_file(root.path().join("nx")).ignore_not_found().unwrap();
        assert_eq!(
            io::ErrorKind::NotFound,
            touch(root.path().join("nx")).unwrap_err().kind()
        );
        touch(root.path().join("nx")).ignore_not_found().unwrap();
    }
}
