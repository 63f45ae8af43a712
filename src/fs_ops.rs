//! Filesystem primitives the core relies on for atomicity and mutual exclusion.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{IoResultExt, SargeError, SargeResult};

/// Point `link` at `target`, replacing any existing link in one rename.
///
/// A reader resolving `link` sees either the old target or the new one.
pub fn replace_symlink(target: &Path, link: &Path) -> SargeResult<()> {
    let parent = link
        .parent()
        .ok_or_else(|| SargeError::Config(format!("{} has no parent", link.display())))?;
    let staging = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    symlink(target, &staging).at(&staging)?;
    if let Err(e) = fs::rename(&staging, link) {
        let _ = fs::remove_file(&staging);
        return Err(SargeError::Io {
            path: link.to_path_buf(),
            source: e,
        });
    }
    debug!(link = %link.display(), target = %target.display(), "symlink replaced");
    Ok(())
}

/// Write `contents` to `path` through a sibling temp file and a rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> SargeResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SargeError::Config(format!("{} has no parent", path.display())))?;
    let mut tmp = NamedTempFile::new_in(parent).at(parent)?;
    tmp.write_all(contents).at(path)?;
    tmp.as_file().sync_all().at(path)?;
    tmp.persist(path).map_err(|e| SargeError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> SargeResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SargeError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

pub fn remove_dir_if_exists(path: &Path) -> SargeResult<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SargeError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Exclusive advisory lock on a file, released on drop.
///
/// Works across processes on the same host.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Block until the lock on `path` is held.
    pub fn acquire(path: &Path) -> SargeResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .at(path)?;
        file.lock().at(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

/// Hand `path` to `user`, keeping its group as the user's primary group.
pub fn chown_to_user(path: &Path, user: &str) -> SargeResult<()> {
    let found = nix::unistd::User::from_name(user)
        .map_err(|e| SargeError::Config(format!("looking up user `{user}`: {e}")))?
        .ok_or_else(|| SargeError::Config(format!("unknown user `{user}`")))?;
    nix::unistd::chown(path, Some(found.uid), Some(found.gid)).map_err(|e| SargeError::Io {
        path: path.to_path_buf(),
        source: io::Error::from(e),
    })?;
    debug!(path = %path.display(), user, "ownership changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};
    use tempfile::tempdir;

    #[test]
    fn symlink_is_replaced_in_place() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("1.run");
        let b = dir.path().join("2.run");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();
        let link = dir.path().join("blog");

        replace_symlink(&a, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), a);
        replace_symlink(&b, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), b);

        // No staging links left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn atomic_write_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
    }

    #[test]
    fn removing_missing_paths_is_fine() {
        let dir = tempdir().unwrap();
        assert!(!remove_file_if_exists(&dir.path().join("nope")).unwrap());
        assert!(!remove_dir_if_exists(&dir.path().join("nope")).unwrap());
    }

    #[test]
    fn lock_serializes_critical_sections() {
        let dir = tempdir().unwrap();
        let lock_path = Arc::new(dir.path().join("counter.lock"));
        let value_path = Arc::new(dir.path().join("counter"));
        fs::write(&*value_path, "0").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock_path = lock_path.clone();
                let value_path = value_path.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        let _guard = LockFile::acquire(&lock_path).unwrap();
                        let n: u64 = fs::read_to_string(&*value_path).unwrap().parse().unwrap();
                        fs::write(&*value_path, (n + 1).to_string()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fs::read_to_string(&*value_path).unwrap(), "200");
    }
}
