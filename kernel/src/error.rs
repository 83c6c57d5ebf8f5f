//! POSIX errno values
//!
//! Error codes handed back across the storage stack's outer surface
//! (filesystem operations, `InodeOps`, mount and unmount).

use core::fmt;

/// Kernel error number
///
/// Discriminants match the Linux values so they can be returned to
/// userspace unchanged.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    /// Operation not permitted
    EPERM = 1,
    /// No such file or directory
    ENOENT = 2,
    /// I/O error
    EIO = 5,
    /// No such device or address
    ENXIO = 6,
    /// Cannot allocate memory
    ENOMEM = 12,
    /// Device or resource busy
    EBUSY = 16,
    /// File exists
    EEXIST = 17,
    /// No such device
    ENODEV = 19,
    /// Not a directory
    ENOTDIR = 20,
    /// Is a directory
    EISDIR = 21,
    /// Invalid argument
    EINVAL = 22,
    /// File too large
    EFBIG = 27,
    /// No space left on device
    ENOSPC = 28,
    /// Read-only file system
    EROFS = 30,
    /// Result out of range
    ERANGE = 34,
    /// Function not implemented
    ENOSYS = 38,
    /// Structure needs cleaning (on-disk corruption)
    EUCLEAN = 117,
}

/// Result type used by the filesystem and mount layers
pub type KResult<T> = Result<T, Errno>;

impl Errno {
    /// Raw errno value
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Negated value, as returned from a syscall
    pub const fn to_syscall_ret(self) -> i64 {
        -(self as i32 as i64)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Errno::EPERM => "operation not permitted",
            Errno::ENOENT => "no such file or directory",
            Errno::EIO => "I/O error",
            Errno::ENXIO => "no such device or address",
            Errno::ENOMEM => "cannot allocate memory",
            Errno::EBUSY => "device or resource busy",
            Errno::EEXIST => "file exists",
            Errno::ENODEV => "no such device",
            Errno::ENOTDIR => "not a directory",
            Errno::EISDIR => "is a directory",
            Errno::EINVAL => "invalid argument",
            Errno::EFBIG => "file too large",
            Errno::ENOSPC => "no space left on device",
            Errno::EROFS => "read-only file system",
            Errno::ERANGE => "result out of range",
            Errno::ENOSYS => "function not implemented",
            Errno::EUCLEAN => "structure needs cleaning",
        };
        write!(f, "{} (errno {})", msg, self.as_i32())
    }
}
