//! Per-slot worker: one forked child process, one `socketpair` wake channel,
//! one anonymous `mmap` page shared between parent and child.

use std::os::unix::io::RawFd;

use crate::fail::FailRecord;

use super::child;
use super::{AfsEvent, AfsEventKind};

pub(super) const PROC_EVS_MAXLEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ProcCmd {
    None,
    Exit,
    Open,
    Close,
    Fsync,
    Write,
    Readall,
    Mkdir,
}

impl ProcCmd {
    pub(super) fn fail_event(self) -> AfsEventKind {
        match self {
            ProcCmd::None => AfsEventKind::InitFail,
            ProcCmd::Exit => AfsEventKind::StopFail,
            ProcCmd::Open => AfsEventKind::OpenFail,
            ProcCmd::Close => AfsEventKind::CloseFail,
            ProcCmd::Fsync => AfsEventKind::FsyncFail,
            ProcCmd::Write => AfsEventKind::WriteFail,
            ProcCmd::Readall => AfsEventKind::ReadallFail,
            ProcCmd::Mkdir => AfsEventKind::MkdirFail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ProcRes {
    None,
    Ok,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ProcChildSt {
    NotStarted,
    Idle,
    Busy,
}

/// Laid out at the front of the anonymous `mmap` region; the tail of the
/// region (`rw_buf_len` bytes) is the read/write scratch buffer used for
/// paths and file contents. Both parent and child access this directly,
/// coordinated by the one-byte wake protocol on the socketpair — never
/// concurrently, so no atomics are needed.
#[repr(C)]
pub(super) struct ProcShared {
    pub cmd: ProcCmd,
    pub write_len: usize,
    pub open_flags: i32,

    pub res: ProcRes,
    pub st: ProcChildSt,
    pub written: usize,
    pub read_len: usize,
    pub fail: FailRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ProcSt {
    Uninit,
    InitPend,
    Avail,
    Busy,
    Dead,
}

/// The parent-side handle to one worker child process.
pub(super) struct Proc {
    pub fail: FailRecord,
    pub is_stop_req: bool,
    pub st: ProcSt,
    evs: [Option<AfsEvent>; PROC_EVS_MAXLEN],
    evs_len: usize,

    shared: *mut ProcShared,
    rw_buf: *mut u8,
    rw_buf_len: usize,
    mmap_start: *mut libc::c_void,
    mmap_len: usize,

    pid: libc::pid_t,
    pub fd: RawFd,

    /// Override for the computed page-aligned rw-buffer size, from
    /// [`crate::config::Config::afs_rw_buf_len`].
    min_rw_buf_len: Option<usize>,
}

impl Proc {
    pub(super) fn uninit() -> Proc {
        Proc {
            fail: FailRecord::NONE,
            is_stop_req: false,
            st: ProcSt::Uninit,
            evs: [None; PROC_EVS_MAXLEN],
            evs_len: 0,
            shared: std::ptr::null_mut(),
            rw_buf: std::ptr::null_mut(),
            rw_buf_len: 0,
            mmap_start: std::ptr::null_mut(),
            mmap_len: 0,
            pid: 0,
            fd: -1,
            min_rw_buf_len: None,
        }
    }

    pub(super) fn set_min_rw_buf_len(&mut self, len: Option<usize>) {
        self.min_rw_buf_len = len;
    }

    pub(super) fn rw_buf(&self) -> &[u8] {
        if self.rw_buf.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.rw_buf, self.rw_buf_len) }
        }
    }

    pub(super) fn rw_buf_mut(&mut self) -> &mut [u8] {
        if self.rw_buf.is_null() {
            &mut []
        } else {
            unsafe { std::slice::from_raw_parts_mut(self.rw_buf, self.rw_buf_len) }
        }
    }

    pub(super) fn shared(&self) -> &ProcShared {
        unsafe { &*self.shared }
    }

    pub(super) fn shared_mut(&mut self) -> &mut ProcShared {
        unsafe { &mut *self.shared }
    }

    pub(super) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Forks the worker, wires up the socketpair and the shared mmap
    /// region, and asks the child to acknowledge readiness.
    pub(super) fn init(&mut self) -> Result<(), ()> {
        self.evs_len = 0;
        self.is_stop_req = false;
        self.pid = 0;

        let mut sv = [0 as RawFd; 2];
        if syscall!(socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr())).is_err() {
            self.fail = crate::fail::fail_here!("socketpair");
            return Err(());
        }

        let pgs = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let shared_size = std::mem::size_of::<ProcShared>();
        let default_rw_buf_len = (pgs * 2).saturating_sub(shared_size);
        let wanted_rw_buf_len = self
            .min_rw_buf_len
            .map_or(default_rw_buf_len, |want| want.max(default_rw_buf_len));
        let mut mmap_len = shared_size + wanted_rw_buf_len;
        mmap_len = ((mmap_len - 1) / pgs + 1) * pgs;

        let mmap_start = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mmap_start == libc::MAP_FAILED {
            self.fail = crate::fail::fail_here!("mmap");
            unsafe {
                libc::close(sv[0]);
                libc::close(sv[1]);
            }
            return Err(());
        }

        let shared = mmap_start as *mut ProcShared;
        unsafe {
            shared.write(ProcShared {
                cmd: ProcCmd::None,
                write_len: 0,
                open_flags: 0,
                res: ProcRes::None,
                st: ProcChildSt::NotStarted,
                written: 0,
                read_len: 0,
                fail: FailRecord::NONE,
            });
        }

        let rw_buf = unsafe { (mmap_start as *mut u8).add(shared_size) };
        let rw_buf_len = mmap_len - shared_size;

        let pid = match syscall!(fork()) {
            Ok(pid) => pid,
            Err(_) => {
                self.fail = crate::fail::fail_here!("fork");
                unsafe {
                    libc::close(sv[0]);
                    libc::close(sv[1]);
                    libc::munmap(mmap_start, mmap_len);
                }
                return Err(());
            }
        };
        if pid == 0 {
            unsafe {
                libc::close(sv[0]);
            }
            let code = child::run(sv[1], shared, rw_buf, rw_buf_len);
            std::process::exit(code);
        }

        unsafe {
            libc::close(sv[1]);
        }

        self.pid = pid;
        self.fd = sv[0];
        self.st = ProcSt::InitPend;
        self.shared = shared;
        self.rw_buf = rw_buf;
        self.rw_buf_len = rw_buf_len;
        self.mmap_start = mmap_start;
        self.mmap_len = mmap_len;

        log::debug!(target: "nbio::afs", "forked worker pid={} rw_buf_len={}", pid, rw_buf_len);
        self.notify_child()
    }

    pub(super) fn open(&mut self) -> Result<(), ()> {
        self.send_cmd(ProcCmd::Open)
    }

    pub(super) fn close(&mut self) -> Result<(), ()> {
        self.send_cmd(ProcCmd::Close)
    }

    pub(super) fn fsync(&mut self) -> Result<(), ()> {
        self.send_cmd(ProcCmd::Fsync)
    }

    pub(super) fn write(&mut self) -> Result<(), ()> {
        self.send_cmd(ProcCmd::Write)
    }

    pub(super) fn readall(&mut self) -> Result<(), ()> {
        self.send_cmd(ProcCmd::Readall)
    }

    pub(super) fn mkdir(&mut self) -> Result<(), ()> {
        self.send_cmd(ProcCmd::Mkdir)
    }

    pub(super) fn stop_prep(&mut self) -> Result<(), ()> {
        if self.is_stop_req {
            self.fail = crate::fail::fail_here_no_errno!("stop_prep already pending");
            return Err(());
        }
        self.is_stop_req = true;
        match self.st {
            ProcSt::Avail => self.send_cmd(ProcCmd::Exit),
            ProcSt::Busy => Ok(()),
            _ => {
                self.fail = crate::fail::fail_here_no_errno!("bad state for stop_prep");
                Err(())
            }
        }
    }

    pub(super) fn stop(&self) -> Result<(), ()> {
        if self.st != ProcSt::Uninit {
            Err(())
        } else {
            Ok(())
        }
    }

    pub(super) fn evs(&self) -> &[Option<AfsEvent>] {
        &self.evs[..self.evs_len]
    }

    pub(super) fn update(&mut self, revents: i16) -> Result<(), ()> {
        self.evs_len = 0;
        match self.st {
            ProcSt::InitPend => self.update_init_pend(revents),
            ProcSt::Busy => self.update_busy(revents),
            ProcSt::Avail => self.update_avail(revents),
            ProcSt::Dead => self.update_dead(),
            ProcSt::Uninit => {
                if self.is_stop_req {
                    self.is_stop_req = false;
                    self.add_ev(AfsEventKind::Stop);
                }
                self.fail = crate::fail::fail_here_no_errno!("update on uninit worker");
                Err(())
            }
        }
    }

    fn update_init_pend(&mut self, revents: i16) -> Result<(), ()> {
        if self.is_stop_req {
            self.is_stop_req = false;
            self.destroy_child();
            self.add_ev(AfsEventKind::InitFail);
            self.add_ev(AfsEventKind::Stop);
            return Err(());
        }

        if revents & (libc::POLLHUP | libc::POLLERR) as i16 != 0 {
            log::error!(target: "nbio::afs", "worker pid={} died during init", self.pid);
            self.destroy_child();
            self.add_ev(AfsEventKind::InitFail);
            self.fail = crate::fail::fail_here_no_errno!("child died during init");
            Err(())
        } else if revents & libc::POLLIN as i16 != 0 {
            let mut throwaway = [0u8; 1];
            unsafe {
                libc::read(self.fd, throwaway.as_mut_ptr() as *mut _, 1);
            }
            if self.shared().res == ProcRes::Ok {
                log::trace!(target: "nbio::afs", "slot pid={} init-pend -> avail", self.pid);
                self.st = ProcSt::Avail;
                self.add_ev(AfsEventKind::Init);
                Ok(())
            } else {
                log::error!(target: "nbio::afs", "worker pid={} failed the init handshake", self.pid);
                self.destroy_child();
                self.add_ev(AfsEventKind::InitFail);
                self.fail = crate::fail::fail_here_no_errno!("child failed the init handshake");
                Err(())
            }
        } else {
            Ok(())
        }
    }

    fn update_avail(&mut self, revents: i16) -> Result<(), ()> {
        if revents & (libc::POLLHUP | libc::POLLERR) as i16 != 0 {
            log::error!(target: "nbio::afs", "worker pid={} died while idle", self.pid);
            self.destroy_child();
            self.fail = crate::fail::fail_here_no_errno!("child died while idle");
            Err(())
        } else {
            Ok(())
        }
    }

    fn update_busy(&mut self, revents: i16) -> Result<(), ()> {
        if revents & (libc::POLLHUP | libc::POLLERR) as i16 != 0 {
            let cmd = self.shared().cmd;
            log::error!(target: "nbio::afs", "worker pid={} died mid-command {:?}", self.pid, cmd);
            self.add_ev(cmd.fail_event());
            self.destroy_child();
            self.fail = crate::fail::fail_here_no_errno!("child died mid-command");
            return Err(());
        }
        if revents & libc::POLLIN as i16 == 0 {
            return Ok(());
        }

        let mut throwaway = [0u8; 1];
        unsafe {
            libc::read(self.fd, throwaway.as_mut_ptr() as *mut _, 1);
        }

        if self.shared().res == ProcRes::Ok {
            let cmd = self.shared().cmd;
            log::debug!(target: "nbio::afs", "worker pid={} completed {:?}", self.pid, cmd);
            match cmd {
                ProcCmd::None => {}
                ProcCmd::Exit => {
                    self.destroy_child();
                    self.fail = crate::fail::fail_here_no_errno!("exit successful");
                    return Err(());
                }
                ProcCmd::Open => self.add_ev(AfsEventKind::Open),
                ProcCmd::Close => self.add_ev(AfsEventKind::Close),
                ProcCmd::Fsync => self.add_ev(AfsEventKind::Fsync),
                ProcCmd::Write => {
                    let len = self.shared().written;
                    self.add_ev_write(len);
                }
                ProcCmd::Readall => {
                    let len = self.shared().read_len;
                    self.add_ev_readall(len);
                }
                ProcCmd::Mkdir => self.add_ev(AfsEventKind::Mkdir),
            }
            self.shared_mut().cmd = ProcCmd::None;
        } else {
            self.fail = self.shared().fail;
            let cmd = self.shared().cmd;
            log::warn!(target: "nbio::afs", "worker pid={} reported failure for {:?}: {}", self.pid, cmd, self.fail);
            self.add_ev(cmd.fail_event());
        }
        self.st = ProcSt::Avail;

        if self.is_stop_req {
            return self.send_cmd(ProcCmd::Exit);
        }
        Ok(())
    }

    fn update_dead(&mut self) -> Result<(), ()> {
        if self.is_stop_req {
            self.is_stop_req = false;
            self.add_ev(AfsEventKind::StopFail);
        }
        self.destroy_child();
        self.fail = crate::fail::fail_here_no_errno!("worker is dead");
        Err(())
    }

    fn send_cmd(&mut self, cmd: ProcCmd) -> Result<(), ()> {
        if self.st != ProcSt::Avail {
            self.fail = crate::fail::fail_here_no_errno!("bad state for command");
            return Err(());
        }
        if self.shared().st != ProcChildSt::Idle {
            self.fail = crate::fail::fail_here_no_errno!("child is not idle");
            return Err(());
        }
        self.st = ProcSt::Busy;
        self.shared_mut().cmd = cmd;
        log::debug!(target: "nbio::afs", "worker pid={} dispatched {:?}", self.pid, cmd);
        self.notify_child()
    }

    fn notify_child(&mut self) -> Result<(), ()> {
        let throwaway = [0u8; 1];
        loop {
            match syscall!(write(self.fd, throwaway.as_ptr() as *const _, 1)) {
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                    log::warn!(target: "nbio::afs", "write to worker fd={} interrupted, retrying", self.fd);
                    continue;
                }
                Err(_) => {
                    self.fail = crate::fail::fail_here!("write");
                    self.st = ProcSt::Dead;
                    return Err(());
                }
            }
        }
    }

    fn destroy_child(&mut self) {
        if self.pid > 0 {
            unsafe {
                libc::kill(self.pid, libc::SIGKILL);
            }
            loop {
                let mut wstatus: i32 = 0;
                let r = unsafe { libc::waitpid(self.pid, &mut wstatus, 0) };
                if r == -1 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted
                {
                    continue;
                }
                break;
            }
            self.pid = 0;
        }

        if self.fd != -1 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
        if !self.mmap_start.is_null() {
            unsafe {
                libc::munmap(self.mmap_start, self.mmap_len);
            }
            self.mmap_start = std::ptr::null_mut();
            self.mmap_len = 0;
            self.rw_buf = std::ptr::null_mut();
            self.rw_buf_len = 0;
            self.shared = std::ptr::null_mut();
        }

        self.st = ProcSt::Uninit;
    }

    fn add_ev(&mut self, kind: AfsEventKind) {
        self.push_ev(AfsEvent {
            kind,
            fd: None,
            write_len: 0,
            readall_len: 0,
        });
    }

    fn add_ev_write(&mut self, write_len: usize) {
        self.push_ev(AfsEvent {
            kind: AfsEventKind::Write,
            fd: None,
            write_len,
            readall_len: 0,
        });
    }

    fn add_ev_readall(&mut self, readall_len: usize) {
        self.push_ev(AfsEvent {
            kind: AfsEventKind::Readall,
            fd: None,
            write_len: 0,
            readall_len,
        });
    }

    fn push_ev(&mut self, ev: AfsEvent) {
        if self.evs_len >= PROC_EVS_MAXLEN {
            bug!("afs: worker event queue overflow (max {})", PROC_EVS_MAXLEN);
        }
        self.evs[self.evs_len] = Some(ev);
        self.evs_len += 1;
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.pid > 0 || !self.mmap_start.is_null() {
            self.destroy_child();
        }
    }
}
