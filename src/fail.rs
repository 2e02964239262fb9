//! A stable, allocation-free description of the last error a module hit.
//!
//! Grounded on the original `struct sob_fail` / `SOB_FAIL_INIT` pair: a
//! fixed-size, `Copy` record capturing where a failure happened and the
//! `errno` snapshot at that moment, without owning a heap-allocated message.

use std::fmt;

/// Source location plus OS errno snapshot for the last failure a module
/// observed.
///
/// `FailRecord` is `Copy` and carries no heap allocation: once written it is
/// immutable, and overwriting it (the only mutation it ever gets) is a
/// single struct assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailRecord {
    file: &'static str,
    line: u32,
    /// `None` for failures with no corresponding OS errno (protocol
    /// violations, parser errors reported through other channels).
    errno: Option<i32>,
    msg: &'static str,
}

impl FailRecord {
    /// A record with no failure recorded yet.
    pub const NONE: FailRecord = FailRecord {
        file: "",
        line: 0,
        errno: None,
        msg: "",
    };

    /// Builds a record capturing the current OS `errno` at the call site.
    ///
    /// Use [`fail_here!`] rather than calling this directly so `file`/`line`
    /// point at the failure, not at this constructor.
    pub fn from_errno(file: &'static str, line: u32, msg: &'static str) -> FailRecord {
        FailRecord {
            file,
            line,
            errno: Some(std::io::Error::last_os_error().raw_os_error().unwrap_or(0)),
            msg,
        }
    }

    /// Builds a record for a failure with no OS errno (a protocol
    /// violation, a buffer overflow, a dead peer process).
    pub fn without_errno(file: &'static str, line: u32, msg: &'static str) -> FailRecord {
        FailRecord {
            file,
            line,
            errno: None,
            msg,
        }
    }

    pub fn file(&self) -> &'static str {
        self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    pub fn msg(&self) -> &'static str {
        self.msg
    }

    pub fn is_set(&self) -> bool {
        !self.file.is_empty()
    }
}

impl Default for FailRecord {
    fn default() -> FailRecord {
        FailRecord::NONE
    }
}

impl fmt::Display for FailRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_set() {
            return write!(f, "<no failure recorded>");
        }
        match self.errno {
            Some(errno) => write!(
                f,
                "{} at {}:{}: {}",
                self.msg,
                self.file,
                self.line,
                std::io::Error::from_raw_os_error(errno)
            ),
            None => write!(f, "{} at {}:{}", self.msg, self.file, self.line),
        }
    }
}

/// Captures a [`FailRecord`] at the call site, snapshotting `errno`.
macro_rules! fail_here {
    ($msg:expr) => {
        $crate::fail::FailRecord::from_errno(file!(), line!(), $msg)
    };
}

/// Captures a [`FailRecord`] at the call site with no `errno` (protocol
/// violations, overflow, dead peers).
macro_rules! fail_here_no_errno {
    ($msg:expr) => {
        $crate::fail::FailRecord::without_errno(file!(), line!(), $msg)
    };
}

pub(crate) use fail_here;
pub(crate) use fail_here_no_errno;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unset() {
        assert!(!FailRecord::default().is_set());
    }

    #[test]
    fn display_without_errno() {
        let f = FailRecord::without_errno("src/x.rs", 12, "peer died");
        let s = f.to_string();
        assert!(s.contains("peer died"));
        assert!(s.contains("src/x.rs:12"));
    }
}
