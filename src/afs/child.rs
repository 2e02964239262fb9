//! The forked worker's own run loop. Everything here executes after
//! `fork()`, in a process whose only job is to sit blocked on the wake byte,
//! perform exactly one blocking syscall, and report back.

use std::os::unix::io::RawFd;

use super::proc_::{ProcChildSt, ProcCmd, ProcRes, ProcShared};

/// Entry point for the child side of a worker. Returns the process exit
/// code; never returns otherwise (loops until told to exit).
pub(super) fn run(
    parent_fd: RawFd,
    shared: *mut ProcShared,
    rw_buf: *mut u8,
    rw_buf_len: usize,
) -> i32 {
    let shared = unsafe { &mut *shared };
    if shared.st != ProcChildSt::NotStarted {
        return 126;
    }
    shared.st = ProcChildSt::Idle;

    let mut fd: RawFd = -1;

    loop {
        let mut throwaway = [0u8; 1];
        let n = unsafe { libc::read(parent_fd, throwaway.as_mut_ptr() as *mut _, 1) };
        if n != 1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                log::warn!(target: "nbio::afs::child", "wake read interrupted, retrying");
                continue;
            }
            return 1;
        }

        shared.st = ProcChildSt::Busy;
        shared.res = ProcRes::None;

        log::trace!(target: "nbio::afs::child", "dispatching {:?}", shared.cmd);
        let mut should_exit = false;
        shared.res = match shared.cmd {
            ProcCmd::None => ProcRes::Ok,
            ProcCmd::Exit => {
                should_exit = true;
                ProcRes::Ok
            }
            ProcCmd::Open => cmd_open(shared, &mut fd, rw_buf, rw_buf_len),
            ProcCmd::Close => cmd_close(shared, &mut fd),
            ProcCmd::Fsync => cmd_fsync(shared, fd),
            ProcCmd::Write => cmd_write(shared, fd, rw_buf),
            ProcCmd::Readall => cmd_readall(shared, fd, rw_buf, rw_buf_len),
            ProcCmd::Mkdir => cmd_mkdir(shared, rw_buf),
        };

        shared.st = ProcChildSt::Idle;

        loop {
            let n = unsafe { libc::write(parent_fd, throwaway.as_mut_ptr() as *const _, 1) };
            if n == 1 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                log::warn!(target: "nbio::afs::child", "ack write interrupted, retrying");
                continue;
            }
            log::error!(target: "nbio::afs::child", "ack write failed, worker exiting: {}", err);
            shared.fail = crate::fail::fail_here!("write");
            shared.st = ProcChildSt::NotStarted;
            return 127;
        }

        if should_exit {
            shared.st = ProcChildSt::NotStarted;
            return 0;
        }
    }
}

fn cstr_from_rw_buf(rw_buf: *mut u8) -> &'static std::ffi::CStr {
    unsafe { std::ffi::CStr::from_ptr(rw_buf as *const libc::c_char) }
}

fn cmd_open(
    shared: &mut ProcShared,
    fd: &mut RawFd,
    rw_buf: *mut u8,
    _rw_buf_len: usize,
) -> ProcRes {
    if *fd != -1 {
        shared.fail = crate::fail::fail_here_no_errno!("already open");
        return ProcRes::Fail;
    }
    let path = cstr_from_rw_buf(rw_buf);
    let opened = unsafe { libc::open(path.as_ptr(), shared.open_flags, 0o600) };
    if opened == -1 {
        shared.fail = crate::fail::fail_here!("open");
        ProcRes::Fail
    } else {
        *fd = opened;
        ProcRes::Ok
    }
}

fn cmd_close(shared: &mut ProcShared, fd: &mut RawFd) -> ProcRes {
    if *fd == -1 {
        shared.fail = crate::fail::fail_here_no_errno!("not open");
        return ProcRes::Fail;
    }
    unsafe {
        libc::close(*fd);
    }
    *fd = -1;
    ProcRes::Ok
}

fn cmd_fsync(shared: &mut ProcShared, fd: RawFd) -> ProcRes {
    if fd == -1 {
        shared.fail = crate::fail::fail_here_no_errno!("not open");
        return ProcRes::Fail;
    }
    if unsafe { libc::fsync(fd) } == -1 {
        shared.fail = crate::fail::fail_here!("fsync");
        ProcRes::Fail
    } else {
        ProcRes::Ok
    }
}

fn cmd_write(shared: &mut ProcShared, fd: RawFd, rw_buf: *mut u8) -> ProcRes {
    if fd == -1 {
        shared.fail = crate::fail::fail_here_no_errno!("not open");
        return ProcRes::Fail;
    }

    let mut buf = rw_buf;
    let mut len = shared.write_len;
    shared.written = 0;

    loop {
        let written = unsafe { libc::write(fd, buf as *const libc::c_void, len) };
        if written as usize == len {
            shared.written += written as usize;
            return ProcRes::Ok;
        } else if written >= 0 {
            buf = unsafe { buf.add(written as usize) };
            len -= written as usize;
            shared.written += written as usize;
            continue;
        } else if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
            log::warn!(target: "nbio::afs::child", "write(2) interrupted, retrying");
            continue;
        } else {
            log::error!(target: "nbio::afs::child", "write(2) failed: {}", std::io::Error::last_os_error());
            shared.fail = crate::fail::fail_here!("write");
            return ProcRes::Fail;
        }
    }
}

fn cmd_readall(shared: &mut ProcShared, fd: RawFd, rw_buf: *mut u8, rw_buf_len: usize) -> ProcRes {
    if fd == -1 {
        shared.fail = crate::fail::fail_here_no_errno!("not open");
        return ProcRes::Fail;
    }
    shared.read_len = 0;
    let n = unsafe { libc::read(fd, rw_buf as *mut libc::c_void, rw_buf_len) };
    if n < 0 {
        shared.fail = crate::fail::fail_here!("read");
        ProcRes::Fail
    } else {
        shared.read_len = n as usize;
        ProcRes::Ok
    }
}

fn cmd_mkdir(shared: &mut ProcShared, rw_buf: *mut u8) -> ProcRes {
    let path = cstr_from_rw_buf(rw_buf);

    if unsafe { libc::mkdir(path.as_ptr(), 0o700) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EEXIST) {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::stat(path.as_ptr(), &mut st) } != 0 {
                shared.fail = crate::fail::fail_here!("stat after EEXIST");
                return ProcRes::Fail;
            }
            if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
                shared.fail = crate::fail::fail_here_no_errno!("path exists and is not a directory");
                return ProcRes::Fail;
            }
            return ProcRes::Ok;
        } else {
            shared.fail = crate::fail::fail_here!("mkdir");
            return ProcRes::Fail;
        }
    }

    if fsync_path(path).is_err() {
        shared.fail = crate::fail::fail_here!("fsync dir");
        return ProcRes::Fail;
    }

    let mut resolved = [0u8; libc::PATH_MAX as usize];
    let resolved_ptr =
        unsafe { libc::realpath(path.as_ptr(), resolved.as_mut_ptr() as *mut libc::c_char) };
    if resolved_ptr.is_null() {
        shared.fail = crate::fail::fail_here!("realpath");
        return ProcRes::Fail;
    }
    let parent_dir = unsafe { std::ffi::CStr::from_ptr(resolved_ptr) };
    // `realpath` resolved `path` itself; its dirname is the parent that also
    // needs an fsync for the new entry to be durable.
    let parent = std::path::Path::new(parent_dir.to_str().unwrap_or("/"))
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("/"));
    let parent_c = match std::ffi::CString::new(parent.as_os_str().to_string_lossy().as_bytes()) {
        Ok(s) => s,
        Err(_) => {
            shared.fail = crate::fail::fail_here_no_errno!("parent path has interior NUL");
            return ProcRes::Fail;
        }
    };
    if fsync_path(&parent_c).is_err() {
        shared.fail = crate::fail::fail_here!("fsync parent dir");
        return ProcRes::Fail;
    }

    ProcRes::Ok
}

fn fsync_path(path: &std::ffi::CStr) -> Result<(), ()> {
    let mut openflags = libc::O_RDONLY;
    #[cfg(target_os = "linux")]
    {
        openflags |= libc::O_DIRECTORY;
    }
    let dirfd = unsafe { libc::open(path.as_ptr(), openflags) };
    if dirfd == -1 {
        return Err(());
    }
    let r = unsafe { libc::fsync(dirfd) };
    unsafe {
        libc::close(dirfd);
    }
    if r != 0 {
        Err(())
    } else {
        Ok(())
    }
}
