//! Types shared with the protocol adapter.

use bitflags::bitflags;

/// Type representing a file handle.
///
/// Handles are issued by a per-mount [`HandleGenerator`](crate::mount::HandleGenerator), start at
/// 1, and are never reused within a mount's lifetime.
pub type FileHandle = u64;

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;
    }
}

impl OpenFlags {
    /// Returns `true` if these flags allow writing.
    #[must_use]
    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_is_not_writable() {
        assert!(!OpenFlags::RDONLY.is_writable());
        assert!(!(OpenFlags::RDONLY | OpenFlags::TRUNC).is_writable());
    }

    #[test]
    fn write_modes_are_writable() {
        assert!(OpenFlags::WRONLY.is_writable());
        assert!((OpenFlags::RDWR | OpenFlags::APPEND).is_writable());
    }
}
