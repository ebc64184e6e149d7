//! Exclusive access to a corpus directory.
//!
//! Commands that write records or vectors take an advisory `flock()` on
//! `recall.lock` before opening the stores, so two `recall` invocations
//! never persist over each other. The holder writes its pid into the
//! lock file so a refused caller can say who is in the way.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE_NAME: &str = "recall.lock";

/// What to do when another process already holds the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Return `WouldBlock` immediately.
    Fail,
    /// Block until the holder exits.
    Wait,
}

/// Corpus lock, released when dropped.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Takes the exclusive lock for `base_path`, creating the directory
    /// if needed.
    pub fn acquire(base_path: &Path, mode: LockMode) -> io::Result<Self> {
        std::fs::create_dir_all(base_path)?;
        let path = base_path.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(err) = flock(&file, mode) {
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
            let holder = read_holder(&mut file)
                .map(|pid| format!(" (pid {pid})"))
                .unwrap_or_default();
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!(
                    "corpus at {} is in use by another recall process{holder}",
                    base_path.display()
                ),
            ));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        log::debug!("locked corpus at {}", base_path.display());

        Ok(DirLock { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_holder(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

#[cfg(unix)]
fn flock(file: &File, mode: LockMode) -> io::Result<()> {
    let operation = match mode {
        LockMode::Fail => libc::LOCK_EX | libc::LOCK_NB,
        LockMode::Wait => libc::LOCK_EX,
    };
    if unsafe { libc::flock(file.as_raw_fd(), operation) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => {
            Err(io::ErrorKind::WouldBlock.into())
        }
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _mode: LockMode) -> io::Result<()> {
    Ok(())
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // an empty file means nobody holds the corpus
        let _ = self.file.set_len(0);
        #[cfg(unix)]
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
