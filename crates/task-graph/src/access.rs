//! Exclusive access to external file-format libraries.
//!
//! Readers of a file format whose native library is not thread-safe take a
//! `&mut FileAccessToken` in every call. The only way to obtain one is to
//! lock the [`FileAccess`] that owns it, so two threads can never be inside
//! the same library at once.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Capability to call into a serialized file-format library.
#[derive(Debug)]
pub struct FileAccessToken {
    library: String,
}

impl FileAccessToken {
    pub fn library(&self) -> &str {
        &self.library
    }
}

/// Owner of the access token for one file-format library.
#[derive(Debug)]
pub struct FileAccess {
    token: Mutex<FileAccessToken>,
}

impl FileAccess {
    pub fn new(library: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(FileAccessToken {
                library: library.into(),
            }),
        }
    }

    /// Block until the token is available.
    pub fn acquire(&self) -> MutexGuard<'_, FileAccessToken> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
