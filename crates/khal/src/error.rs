//! HAL error taxonomy.
//!
//! Every fallible HAL entry point reports one of these. The numeric values
//! are part of the raw interface: `HAL_OK` is zero and every failure is
//! strictly negative, so a status can travel through a register unchanged.

use core::fmt;

/// Success status on the raw interface.
pub const HAL_OK: i32 = 0;

/// Uniform HAL failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum HalError {
    InvalidParam = -1,
    NoMemory = -2,
    NotSupported = -3,
    NotFound = -4,
    Busy = -5,
    Timeout = -6,
    Io = -7,
    Permission = -8,
    AlreadyExists = -9,
    NotInitialized = -10,
}

pub type HalResult<T> = Result<T, HalError>;

impl HalError {
    pub const ALL: [HalError; 10] = [
        HalError::InvalidParam,
        HalError::NoMemory,
        HalError::NotSupported,
        HalError::NotFound,
        HalError::Busy,
        HalError::Timeout,
        HalError::Io,
        HalError::Permission,
        HalError::AlreadyExists,
        HalError::NotInitialized,
    ];

    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<HalError> {
        Self::ALL.iter().copied().find(|e| e.code() == code)
    }

    /// Positive errno reported to userland when this error crosses the
    /// syscall boundary.
    pub const fn errno(self) -> i32 {
        match self {
            HalError::InvalidParam => 22,   // EINVAL
            HalError::NoMemory => 12,       // ENOMEM
            HalError::NotSupported => 38,   // ENOSYS
            HalError::NotFound => 2,        // ENOENT
            HalError::Busy => 16,           // EBUSY
            HalError::Timeout => 110,       // ETIMEDOUT
            HalError::Io => 5,              // EIO
            HalError::Permission => 1,      // EPERM
            HalError::AlreadyExists => 17,  // EEXIST
            HalError::NotInitialized => 19, // ENODEV
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            HalError::InvalidParam => "invalid parameter",
            HalError::NoMemory => "out of memory",
            HalError::NotSupported => "not supported",
            HalError::NotFound => "not found",
            HalError::Busy => "busy",
            HalError::Timeout => "timed out",
            HalError::Io => "I/O error",
            HalError::Permission => "permission denied",
            HalError::AlreadyExists => "already exists",
            HalError::NotInitialized => "not initialized",
        }
    }
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Collapses a result into the raw status code.
#[inline]
pub fn hal_status(result: HalResult<()>) -> i32 {
    match result {
        Ok(()) => HAL_OK,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_strictly_negative() {
        for e in HalError::ALL {
            assert!(e.code() < HAL_OK, "{e} must be negative");
            assert_eq!(HalError::from_code(e.code()), Some(e));
            assert!(e.errno() > 0);
        }
        assert_eq!(HalError::from_code(HAL_OK), None);
        assert_eq!(HalError::from_code(-11), None);
    }

    #[test]
    fn status_collapses_results() {
        assert_eq!(hal_status(Ok(())), 0);
        assert_eq!(hal_status(Err(HalError::Busy)), -5);
    }
}
