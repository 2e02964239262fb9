//! Asynchronous filesystem facade.
//!
//! A host wants to `open`/`write`/`readall`/`fsync`/`close`/`mkdir` without
//! ever blocking its event loop on disk I/O. [`Afs`] gets there by handing
//! each open handle to a dedicated worker **child process**: the parent
//! writes a command into an anonymous `mmap` page shared with the worker,
//! wakes it with a single byte on a `socketpair`, and later polls that same
//! socket for the one-byte reply. The blocking syscall (`open`, `write`,
//! `fsync`, `read`, `mkdir`) always happens in the child, never in the
//! host's thread.
//!
//! Follows the crate-wide [`crate::module::Module`] shape: [`Afs::pollfds`],
//! [`Afs::update`], [`Afs::events`], [`Afs::stop_prep`], [`Afs::stop`].

mod child;
mod proc_;

use crate::config::Config;
use crate::fail::FailRecord;
use proc_::{Proc, ProcCmd, ProcSt};

/// A handle to one open file or in-flight `mkdir`, opaque to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AfsFd(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfsEventKind {
    Init,
    InitFail,
    Stop,
    StopFail,
    Open,
    OpenFail,
    Close,
    CloseFail,
    Fsync,
    FsyncFail,
    Write,
    WriteFail,
    Readall,
    ReadallFail,
    Mkdir,
    MkdirFail,
}

impl AfsEventKind {
    pub fn is_fail(self) -> bool {
        matches!(
            self,
            AfsEventKind::InitFail
                | AfsEventKind::StopFail
                | AfsEventKind::OpenFail
                | AfsEventKind::CloseFail
                | AfsEventKind::FsyncFail
                | AfsEventKind::WriteFail
                | AfsEventKind::ReadallFail
                | AfsEventKind::MkdirFail
        )
    }
}

/// One event produced by a call to [`Afs::update`].
#[derive(Debug, Clone, Copy)]
pub struct AfsEvent {
    pub(super) kind: AfsEventKind,
    pub(super) fd: Option<AfsFd>,
    pub(super) write_len: usize,
    pub(super) readall_len: usize,
}

impl AfsEvent {
    pub fn kind(&self) -> AfsEventKind {
        self.kind
    }

    pub fn is_fail(&self) -> bool {
        self.kind.is_fail()
    }

    /// `None` for the top-level [`AfsEventKind::Stop`]/[`AfsEventKind::StopFail`].
    pub fn fd(&self) -> Option<AfsFd> {
        self.fd
    }

    pub fn write_len(&self) -> usize {
        self.write_len
    }

    pub fn readall_len(&self) -> usize {
        self.readall_len
    }
}

struct Slot {
    /// `None` marks this slot as free for reuse by the next `open`/`mkdir`
    /// without spawning a new worker process.
    fd: Option<u32>,
    proc: Proc,
    cmd_after_init: Option<ProcCmd>,
    is_avail: bool,
}

/// The asynchronous filesystem facade.
pub struct Afs {
    fail: FailRecord,
    is_stop_req: bool,
    slots: Vec<Slot>,
    pfds: Vec<libc::pollfd>,
    evs: Vec<AfsEvent>,
    rw_buf_len: Option<usize>,
}

impl Afs {
    pub fn new() -> Afs {
        Afs::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Afs {
        Afs {
            fail: FailRecord::NONE,
            is_stop_req: false,
            slots: Vec::new(),
            pfds: Vec::new(),
            evs: Vec::new(),
            rw_buf_len: config.afs_rw_buf_len,
        }
    }

    pub fn fail(&self) -> FailRecord {
        self.fail
    }

    /// The read/write scratch buffer for an open handle: the destination
    /// for `readall`, and the source for `write`.
    pub fn rw_buf(&self, fd: AfsFd) -> Option<&[u8]> {
        let slot = self.slot_get(fd.0)?;
        if slot.is_avail {
            Some(slot.proc.rw_buf())
        } else {
            None
        }
    }

    pub fn rw_buf_mut(&mut self, fd: AfsFd) -> Option<&mut [u8]> {
        let slot = self.slot_get_mut(fd.0)?;
        if slot.is_avail {
            Some(slot.proc.rw_buf_mut())
        } else {
            None
        }
    }

    /// Opens `path` with the given `open(2)` flags. The path must fit in
    /// the worker's scratch buffer (one page, minus the shared control
    /// struct).
    pub fn open(&mut self, path: &str, flags: i32) -> Result<AfsFd, ()> {
        let (idx, was_init) = self.alloc_slot()?;
        let fd = AfsFd(self.slots[idx].fd.expect("freshly allocated slot has an fd"));

        if let Err(()) = self.stage_path(idx, path) {
            return Err(());
        }
        self.slots[idx].proc.shared_mut().open_flags = flags;
        log::debug!(target: "nbio::afs", "open fd={:?} path={:?} flags={:#x}", fd, path, flags);

        if was_init {
            let r = self.slots[idx].proc.open();
            self.fail = self.slots[idx].proc.fail;
            r.map(|_| fd)
        } else {
            self.slots[idx].is_avail = false;
            self.slots[idx].cmd_after_init = Some(ProcCmd::Open);
            Ok(fd)
        }
    }

    pub fn mkdir(&mut self, path: &str) -> Result<AfsFd, ()> {
        let (idx, was_init) = self.alloc_slot()?;
        let fd = AfsFd(self.slots[idx].fd.expect("freshly allocated slot has an fd"));

        if let Err(()) = self.stage_path(idx, path) {
            return Err(());
        }

        if was_init {
            let r = self.slots[idx].proc.mkdir();
            self.fail = self.slots[idx].proc.fail;
            r.map(|_| fd)
        } else {
            self.slots[idx].is_avail = false;
            self.slots[idx].cmd_after_init = Some(ProcCmd::Mkdir);
            Ok(fd)
        }
    }

    pub fn close(&mut self, fd: AfsFd) -> Result<(), ()> {
        let slot = self.slot_for(fd)?;
        slot.proc.close()
    }

    pub fn fsync(&mut self, fd: AfsFd) -> Result<(), ()> {
        let slot = self.slot_for(fd)?;
        slot.proc.fsync()
    }

    /// Writes `len` bytes from the front of [`Afs::rw_buf_mut`].
    pub fn write(&mut self, fd: AfsFd, len: usize) -> Result<(), ()> {
        let slot = self.slot_for(fd)?;
        slot.proc.shared_mut().write_len = len;
        slot.proc.write()
    }

    pub fn readall(&mut self, fd: AfsFd) -> Result<(), ()> {
        let slot = self.slot_for(fd)?;
        slot.proc.readall()
    }

    pub fn stop_prep(&mut self) -> Result<(), ()> {
        if self.is_stop_req {
            self.fail = crate::fail::fail_here_no_errno!("stop_prep already pending");
            return Err(());
        }
        self.is_stop_req = true;
        let mut res = Ok(());
        for slot in &mut self.slots {
            if slot.proc.stop_prep().is_err() {
                self.fail = slot.proc.fail;
                res = Err(());
            }
        }
        res
    }

    pub fn stop(mut self) -> Result<(), ()> {
        let mut res = Ok(());
        for slot in &self.slots {
            if slot.proc.stop().is_err() {
                res = Err(());
            }
        }
        self.slots.clear();
        res
    }

    pub fn pollfds(&mut self, out: &mut [libc::pollfd]) -> usize {
        self.pfds.clear();
        for slot in &self.slots {
            let fd = slot.proc.fd();
            if fd != -1 {
                self.pfds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
        }
        let n = self.pfds.len().min(out.len());
        out[..n].copy_from_slice(&self.pfds[..n]);
        n
    }

    pub fn update(&mut self, fds: &[libc::pollfd]) {
        self.evs.clear();

        let mut to_remove = Vec::new();
        for idx in 0..self.slots.len() {
            let worker_fd = self.slots[idx].proc.fd();
            let revents = if worker_fd != -1 {
                fds.iter()
                    .find(|f| f.fd == worker_fd)
                    .map(|f| f.revents)
                    .unwrap_or(0)
            } else {
                0
            };

            let r = self.slots[idx].proc.update(revents);
            let mut should_del = false;

            let raw_evs: Vec<AfsEvent> = self.slots[idx]
                .proc
                .evs()
                .iter()
                .filter_map(|e| *e)
                .collect();

            for mut ev in raw_evs {
                let afs_fd = self.slots[idx].fd.map(AfsFd);
                ev.fd = afs_fd;

                let mut should_add = true;
                match ev.kind {
                    AfsEventKind::Init => {
                        should_add = false;
                        self.slots[idx].is_avail = true;
                        match self.slots[idx].cmd_after_init.take() {
                            Some(ProcCmd::Open) => {
                                if self.slots[idx].proc.open().is_err() {
                                    self.fail = self.slots[idx].proc.fail;
                                    self.evs.push(AfsEvent {
                                        kind: AfsEventKind::OpenFail,
                                        fd: afs_fd,
                                        write_len: 0,
                                        readall_len: 0,
                                    });
                                }
                            }
                            Some(ProcCmd::Mkdir) => {
                                if self.slots[idx].proc.mkdir().is_err() {
                                    self.fail = self.slots[idx].proc.fail;
                                    self.evs.push(AfsEvent {
                                        kind: AfsEventKind::MkdirFail,
                                        fd: afs_fd,
                                        write_len: 0,
                                        readall_len: 0,
                                    });
                                }
                            }
                            Some(other) => {
                                self.evs.push(AfsEvent {
                                    kind: other.fail_event(),
                                    fd: afs_fd,
                                    write_len: 0,
                                    readall_len: 0,
                                });
                                self.fail =
                                    crate::fail::fail_here_no_errno!("bad cmd_after_init");
                            }
                            None => {}
                        }
                    }
                    AfsEventKind::Close | AfsEventKind::CloseFail => {
                        self.slots[idx].fd = None;
                    }
                    AfsEventKind::InitFail => {
                        should_add = false;
                        should_del = true;
                        if let Some(cmd) = self.slots[idx].cmd_after_init.take() {
                            self.evs.push(AfsEvent {
                                kind: cmd.fail_event(),
                                fd: afs_fd,
                                write_len: 0,
                                readall_len: 0,
                            });
                        }
                    }
                    AfsEventKind::Mkdir | AfsEventKind::MkdirFail => {
                        self.slots[idx].fd = None;
                    }
                    AfsEventKind::Stop | AfsEventKind::StopFail => {
                        should_add = false;
                        self.slots[idx].fd = None;
                        self.slots[idx].is_avail = false;
                    }
                    _ => {}
                }

                if ev.kind.is_fail() {
                    self.fail = self.slots[idx].proc.fail;
                }
                if should_add {
                    self.evs.push(ev);
                }
            }

            if r.is_err() || should_del {
                to_remove.push(idx);
            }
        }

        for idx in to_remove.into_iter().rev() {
            self.slots.remove(idx);
        }

        if self.is_stop_req {
            let all_stopped = self.slots.iter().all(|s| s.proc.st == ProcSt::Uninit);
            if all_stopped {
                self.evs.push(AfsEvent {
                    kind: AfsEventKind::Stop,
                    fd: None,
                    write_len: 0,
                    readall_len: 0,
                });
            }
        }
    }

    pub fn events(&self) -> &[AfsEvent] {
        &self.evs
    }

    fn stage_path(&mut self, idx: usize, path: &str) -> Result<(), ()> {
        let bytes = path.as_bytes();
        let buf = self.slots[idx].proc.rw_buf_mut();
        if bytes.len() + 1 > buf.len() {
            self.fail = crate::fail::fail_here_no_errno!("path does not fit in rw_buf");
            return Err(());
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        buf[bytes.len()] = 0;
        Ok(())
    }

    /// Finds a free slot (a previously closed handle) to reuse, or
    /// allocates a fresh worker. Returns the slot index and whether the
    /// worker was already running (`true`) versus freshly forked
    /// (`false` — the caller still owes it its first command).
    fn alloc_slot(&mut self) -> Result<(usize, bool), ()> {
        if let Some(idx) = self.slots.iter().position(|s| s.fd.is_none()) {
            let was_init = self.slots[idx].proc.st != ProcSt::Uninit;
            if !was_init {
                log::trace!(target: "nbio::afs", "slot {} reused, respawning worker", idx);
                self.slots[idx].proc.set_min_rw_buf_len(self.rw_buf_len);
                if self.slots[idx].proc.init().is_err() {
                    self.fail = self.slots[idx].proc.fail;
                    self.slots.remove(idx);
                    return Err(());
                }
            } else {
                log::trace!(target: "nbio::afs", "slot {} reused, worker still alive", idx);
            }
            let next = self.next_fd();
            self.slots[idx].fd = Some(next);
            return Ok((idx, was_init));
        }

        let mut proc = Proc::uninit();
        proc.set_min_rw_buf_len(self.rw_buf_len);
        if proc.init().is_err() {
            self.fail = proc.fail;
            return Err(());
        }
        let next = self.next_fd();
        log::trace!(target: "nbio::afs", "allocated new slot {}", self.slots.len());
        self.slots.push(Slot {
            fd: Some(next),
            proc,
            cmd_after_init: None,
            is_avail: false,
        });
        Ok((self.slots.len() - 1, false))
    }

    fn next_fd(&self) -> u32 {
        self.slots
            .iter()
            .filter_map(|s| s.fd)
            .max()
            .map(|m| m + 1)
            .unwrap_or(0)
    }

    fn slot_get(&self, fd: u32) -> Option<&Slot> {
        self.slots.iter().find(|s| s.fd == Some(fd))
    }

    fn slot_get_mut(&mut self, fd: u32) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.fd == Some(fd))
    }

    fn slot_for(&mut self, fd: AfsFd) -> Result<&mut Slot, ()> {
        match self.slots.iter_mut().find(|s| s.fd == Some(fd.0)) {
            Some(slot) if slot.is_avail => Ok(slot),
            _ => {
                self.fail = crate::fail::fail_here_no_errno!("bad afs fd");
                Err(())
            }
        }
    }
}

impl Default for Afs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(afs: &mut Afs, want: usize) -> Vec<AfsEvent> {
        let mut collected = Vec::new();
        let mut fds_buf = [libc::pollfd {
            fd: 0,
            events: 0,
            revents: 0,
        }; 32];
        while collected.len() < want {
            let n = afs.pollfds(&mut fds_buf);
            assert!(n <= fds_buf.len());
            let r = unsafe { libc::poll(fds_buf.as_mut_ptr(), n as libc::nfds_t, 5000) };
            assert!(r >= 0, "poll failed");
            afs.update(&fds_buf[..n]);
            collected.extend_from_slice(afs.events());
        }
        collected
    }

    #[test]
    fn open_write_readall_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.txt");
        let path_str = path.to_str().unwrap();

        let mut afs = Afs::new();
        let fd = afs
            .open(path_str, libc::O_RDWR | libc::O_CREAT)
            .expect("open should queue");
        let evs = drive(&mut afs, 1);
        assert!(evs.iter().any(|e| e.kind() == AfsEventKind::Open && e.fd() == Some(fd)));

        let payload = b"hello from afs";
        {
            let buf = afs.rw_buf_mut(fd).unwrap();
            buf[..payload.len()].copy_from_slice(payload);
        }
        afs.write(fd, payload.len()).unwrap();
        let evs = drive(&mut afs, 1);
        let write_ev = evs.iter().find(|e| e.kind() == AfsEventKind::Write).unwrap();
        assert_eq!(write_ev.write_len(), payload.len());

        afs.fsync(fd).unwrap();
        drive(&mut afs, 1);

        afs.close(fd).unwrap();
        drive(&mut afs, 1);

        afs.stop_prep().unwrap();
        drive(&mut afs, 1);
        afs.stop().unwrap();
    }

    #[test]
    fn mkdir_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("newdir");
        let path_str = path.to_str().unwrap().to_string();

        let mut afs = Afs::new();
        afs.mkdir(&path_str).expect("mkdir should queue");
        let evs = drive(&mut afs, 1);
        assert!(evs.iter().any(|e| e.kind() == AfsEventKind::Mkdir));
        assert!(path.is_dir());

        afs.stop_prep().unwrap();
        drive(&mut afs, 1);
        afs.stop().unwrap();
    }
}
