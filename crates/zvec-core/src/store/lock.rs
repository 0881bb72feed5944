//! Advisory file locking for writer-mode containers.
//!
//! A writable container takes an exclusive `flock` on its backing file so
//! two writers cannot interleave chunk writes. Readers do not lock.

use std::fs::File;

use crate::error::{Error, Result};

/// Exclusive advisory lock held for the lifetime of the value.
#[derive(Debug)]
pub struct FileLock {
    #[cfg(unix)]
    file: File,
}

impl FileLock {
    /// Takes an exclusive non-blocking lock on `file`.
    ///
    /// Fails with `Io` when another process already holds the lock.
    pub fn exclusive(file: &File) -> Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let duplicate = file.try_clone()?;
            // SAFETY: the fd is owned by `duplicate` and stays open for the
            // lifetime of the lock.
            let rc = unsafe { libc::flock(duplicate.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                tracing::warn!(error = %err, "exclusive container lock unavailable");
                return Err(Error::Io(err));
            }
            Ok(Self { file: duplicate })
        }
        #[cfg(not(unix))]
        {
            let _ = file;
            Ok(Self {})
        }
    }
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fd is still open; unlock failure leaves the lock to be
        // released on close.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_second_exclusive_lock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.zvi");
        let file = File::create(&path).unwrap();

        let held = FileLock::exclusive(&file).unwrap();
        let again = File::options().read(true).write(true).open(&path).unwrap();
        assert!(FileLock::exclusive(&again).is_err());

        drop(held);
        assert!(FileLock::exclusive(&again).is_ok());
    }
}
