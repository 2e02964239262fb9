//! Readiness-driven HTTPS client built on curl's multi interface.
//!
//! One in-flight request at a time, much like [`crate::afs`]'s one worker
//! per handle: callers drive this module by polling the fds from
//! [`Https::pollfds`] and feeding the poll results back into
//! [`Https::update`]. All the actual network I/O happens inside libcurl;
//! this module's job is translating libcurl's socket/timer callbacks into
//! pollable fds and back, the way an embedder of libcurl's multi interface
//! always has to.
//!
//! Grounded on the original `https.c`: `sock_cb_`/`timer_cb_` become the
//! closures registered with [`Multi::socket_function`]/
//! [`Multi::timer_function`]; the `m->fds` mirror becomes [`FdSet`]; the
//! Linux `timerfd` plumbing is kept as-is (this module is Linux-only for
//! the same reason the original was — the comment in `https.c` called it
//! out as non-portable, and nothing here changes that).

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use curl::easy::{Easy2, Handler, List, WriteError};
use curl::multi::{Easy2Handle, Events, Multi};

use crate::fail::FailRecord;

const FDS_MAXLEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpsEventKind {
    Init,
    /// Emitted once per write-callback invocation while a response body is
    /// arriving; the host may drain [`Https::resp_data`] between events.
    ReqData,
    ReqFin,
    ReqFail,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpsEvent {
    kind: HttpsEventKind,
}

impl HttpsEvent {
    pub fn kind(&self) -> HttpsEventKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpsMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpsVerbosity {
    Silent,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum St {
    JustInit,
    Idle,
    Pend,
    Stopped,
    Err,
}

/// Accumulates the response body, truncating past `mlen - 1` bytes (the
/// last slot is reserved for the trailing NUL the original's fixed
/// `resp_out` buffer always keeps room for) rather than growing without
/// bound. Counts invocations so [`Https::update`] can emit one `req_data`
/// event per callback, draining the counter as it goes.
struct Collector {
    out: Vec<u8>,
    mlen: usize,
    pending_writes: usize,
}

impl Handler for Collector {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        let cap = self.mlen.saturating_sub(1);
        let remain = cap.saturating_sub(self.out.len());
        let write_len = data.len().min(remain);
        self.out.extend_from_slice(&data[..write_len]);
        self.pending_writes += 1;
        // Report the full length consumed regardless of truncation, so
        // curl does not treat the short copy as a write error.
        Ok(data.len())
    }
}

/// The set of fds libcurl has asked us to poll, mirroring
/// `m->fds`/`set_fd_`/`del_fd_`/`find_fd_`. Shared with the socket/timer
/// callbacks registered on [`Multi`], which libcurl invokes synchronously
/// from inside `Multi::action` — never concurrently with the rest of
/// [`Https`] — but curl-rust's callback bounds require `Send + 'static`,
/// so it lives behind a mutex rather than a plain `RefCell`.
#[derive(Default)]
struct FdSet {
    fds: Vec<libc::pollfd>,
}

impl FdSet {
    fn find(&self, fd: RawFd) -> Option<usize> {
        self.fds.iter().position(|p| p.fd == fd)
    }

    fn set(&mut self, fd: RawFd, events: i16) -> Result<(), ()> {
        match self.find(fd) {
            Some(pos) => {
                self.fds[pos].events = events;
                Ok(())
            }
            None => {
                if self.fds.len() >= FDS_MAXLEN {
                    Err(())
                } else {
                    self.fds.push(libc::pollfd {
                        fd,
                        events,
                        revents: 0,
                    });
                    Ok(())
                }
            }
        }
    }

    fn del(&mut self, fd: RawFd) -> Result<(), ()> {
        match self.find(fd) {
            Some(pos) => {
                self.fds.remove(pos);
                Ok(())
            }
            None => Err(()),
        }
    }
}

struct Shared {
    fdset: FdSet,
    timerfd: RawFd,
}

/// The readiness-driven HTTPS client.
pub struct Https {
    fail: FailRecord,
    st: St,
    evs: Vec<HttpsEvent>,
    resp_status: u32,
    resp_mlen: usize,

    shared: Arc<Mutex<Shared>>,
    multi: Multi,
    handle: Option<Easy2Handle<Collector>>,

    /// Carried forward onto each freshly built [`Easy2`] in [`Https::req_json`].
    /// The original reused a single persistent `curl_easy` handle across
    /// requests and set these once at init; curl-rust's multi ownership
    /// model (a handle is moved into the multi on add and handed back on
    /// remove) makes building a fresh [`Easy2`] per request the natural
    /// idiom instead, so the per-handle options are restored here each time.
    timeout: Option<Duration>,
    verbose: bool,
}

impl Https {
    /// `resp_maxlen` bounds the response body buffer; bytes past that are
    /// discarded, matching the original's fixed `resp_out` buffer.
    pub fn new(resp_maxlen: usize) -> Result<Https, ()> {
        Https::with_config(resp_maxlen, &crate::config::Config::default())
    }

    pub fn with_config(resp_maxlen: usize, config: &crate::config::Config) -> Result<Https, ()> {
        let timerfd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if timerfd == -1 {
            return Err(());
        }

        let shared = Arc::new(Mutex::new(Shared {
            fdset: FdSet::default(),
            timerfd,
        }));

        let mut multi = Multi::new();

        let sock_shared = shared.clone();
        if multi
            .socket_function(move |socket, events, _token| {
                let mut s = sock_shared.lock().unwrap();
                if events.remove() {
                    log::trace!(target: "nbio::https", "socket {} removed from poll set", socket);
                    let _ = s.fdset.del(socket);
                    return;
                }
                let mut ev: i16 = 0;
                if events.input() {
                    ev |= libc::POLLIN;
                }
                if events.output() {
                    ev |= libc::POLLOUT;
                }
                let _ = s.fdset.set(socket, ev);
            })
            .is_err()
        {
            unsafe {
                libc::close(timerfd);
            }
            return Err(());
        }

        let timer_shared = shared.clone();
        if multi
            .timer_function(move |timeout_ms| {
                let mut s = timer_shared.lock().unwrap();
                let timerfd = s.timerfd;
                let mut its: libc::itimerspec = unsafe { std::mem::zeroed() };

                if timeout_ms >= 0 {
                    if timeout_ms > 0 {
                        its.it_value.tv_sec = timeout_ms / 1000;
                        its.it_value.tv_nsec = (timeout_ms % 1000) * 1_000_000;
                    } else {
                        // 0ms means "timeout now"; arming with both fields
                        // zero would disarm the timer instead, so fire at
                        // the nearest possible instant.
                        its.it_value.tv_sec = 0;
                        its.it_value.tv_nsec = 1;
                    }
                    let _ = s.fdset.set(timerfd, libc::POLLIN);
                } else {
                    its.it_value.tv_sec = 0;
                    its.it_value.tv_nsec = 0;
                    let _ = s.fdset.del(timerfd);
                }

                unsafe {
                    libc::timerfd_settime(timerfd, 0, &its, std::ptr::null_mut());
                }
                true
            })
            .is_err()
        {
            unsafe {
                libc::close(timerfd);
            }
            return Err(());
        }

        Ok(Https {
            fail: FailRecord::NONE,
            st: St::JustInit,
            evs: Vec::new(),
            resp_status: 0,
            resp_mlen: resp_maxlen,
            shared,
            multi,
            handle: None,
            timeout: Some(config.https_timeout),
            verbose: config.https_verbose,
        })
    }

    pub fn fail(&self) -> FailRecord {
        self.fail
    }

    /// Overrides the per-request timeout for requests issued after this
    /// call.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn set_verbosity(&mut self, level: HttpsVerbosity) {
        self.verbose = level == HttpsVerbosity::Debug;
    }

    /// Starts a GET/POST. Only legal while idle; returns `Err` if a request
    /// is already pending.
    pub fn req_json(&mut self, method: HttpsMethod, url: &str, data: &str) -> Result<(), ()> {
        if self.st != St::Idle {
            self.fail = crate::fail::fail_here_no_errno!("https: request already pending");
            return Err(());
        }

        let mut easy = Easy2::new(Collector {
            out: Vec::new(),
            mlen: self.resp_mlen,
            pending_writes: 0,
        });

        let mut hdrs = List::new();
        let _ = hdrs.append("Content-Type: application/json");
        let _ = hdrs.append("Accept: application/json");

        if let Some(timeout) = self.timeout {
            let _ = easy.timeout(timeout);
        }
        let _ = easy.verbose(self.verbose);

        if easy.url(url).is_err() {
            self.fail = crate::fail::fail_here_no_errno!("https: bad url");
            return Err(());
        }
        match method {
            HttpsMethod::Get => {
                let _ = easy.get(true);
            }
            HttpsMethod::Post => {
                let _ = easy.post(true);
                let _ = easy.post_fields_copy(data.as_bytes());
            }
        }
        let _ = easy.http_headers(hdrs);

        let handle = match self.multi.add2(easy) {
            Ok(h) => h,
            Err(_) => {
                self.fail = crate::fail::fail_here_no_errno!("https: curl_multi_add_handle failed");
                return Err(());
            }
        };
        self.handle = Some(handle);
        self.st = St::Pend;
        log::debug!(target: "nbio::https", "req_json {:?} {}", method, url);
        Ok(())
    }

    pub fn resp_status(&self) -> u32 {
        self.resp_status
    }

    pub fn resp_data(&self) -> &[u8] {
        match &self.handle {
            Some(h) => &h.get_ref().out,
            None => &[],
        }
    }

    /// Length of the response body collected so far, capped at
    /// `maxlen - 1` to leave room for the trailing NUL the original always
    /// reserves.
    pub fn resp_len(&self) -> usize {
        self.resp_data().len()
    }

    pub fn stop_prep(&mut self) -> Result<(), ()> {
        if self.st == St::Pend {
            if let Some(handle) = self.handle.take() {
                let _ = self.multi.remove2(handle);
            }
        }
        self.st = St::Stopped;
        Ok(())
    }

    pub fn stop(self) -> Result<(), ()> {
        let timerfd = self.shared.lock().unwrap().timerfd;
        unsafe {
            libc::close(timerfd);
        }
        Ok(())
    }

    pub fn pollfds(&self, out: &mut [libc::pollfd]) -> usize {
        if self.st != St::Pend {
            return 0;
        }
        let s = self.shared.lock().unwrap();
        let n = s.fdset.fds.len().min(out.len());
        out[..n].copy_from_slice(&s.fdset.fds[..n]);
        n
    }

    pub fn update(&mut self, fds: &[libc::pollfd]) {
        self.evs.clear();

        match self.st {
            St::Stopped => {
                self.evs.push(HttpsEvent {
                    kind: HttpsEventKind::Stopped,
                });
                return;
            }
            St::JustInit => {
                self.st = St::Idle;
                self.evs.push(HttpsEvent {
                    kind: HttpsEventKind::Init,
                });
                return;
            }
            St::Pend => {}
            St::Idle | St::Err => return,
        }

        let timerfd = self.shared.lock().unwrap().timerfd;

        for fd in fds {
            let acted = if fd.fd == timerfd {
                if fd.revents & libc::POLLIN == 0 {
                    continue;
                }
                let mut throwaway: u64 = 0;
                unsafe {
                    libc::read(fd.fd, &mut throwaway as *mut u64 as *mut libc::c_void, 8);
                }
                self.multi.action(-1, &Events::new())
            } else {
                // Mirrors the original's `switch (fd->revents)` with no
                // `break` between cases: POLLIN falls through to also set
                // CURL_CSELECT_OUT, which in turn falls through to
                // CURL_CSELECT_ERR for POLLERR/POLLHUP/POLLNVAL. Preserved
                // exactly rather than "fixed" to match observed behavior.
                let mut ev = Events::new();
                if fd.revents == libc::POLLIN {
                    ev = ev.input(true).output(true).error(true);
                } else if fd.revents == libc::POLLOUT {
                    ev = ev.output(true).error(true);
                } else if fd.revents == libc::POLLERR
                    || fd.revents == libc::POLLHUP
                    || fd.revents == libc::POLLNVAL
                {
                    ev = ev.error(true);
                }
                self.multi.action(fd.fd, &ev)
            };

            if acted.is_err() {
                log::error!(target: "nbio::https", "curl_multi_socket_action failed");
                self.fail = crate::fail::fail_here_no_errno!("curl_multi_socket_action failed");
                self.req_fail();
                return;
            }

            if let Some(h) = &mut self.handle {
                let pending = std::mem::take(&mut h.get_mut().pending_writes);
                for _ in 0..pending {
                    self.evs.push(HttpsEvent {
                        kind: HttpsEventKind::ReqData,
                    });
                }
            }

            let mut done: Option<Result<(), curl::Error>> = None;
            let handle = &self.handle;
            self.multi.messages(|msg| {
                if let Some(h) = handle {
                    if let Some(result) = msg.result_for2(h) {
                        done = Some(result);
                    }
                }
            });

            match done {
                Some(Ok(())) => {
                    if let Some(h) = &self.handle {
                        self.resp_status = h.response_code().unwrap_or(0);
                    }
                    log::debug!(target: "nbio::https", "request finished status={}", self.resp_status);
                    if let Some(handle) = self.handle.take() {
                        let _ = self.multi.remove2(handle);
                    }
                    self.st = St::Idle;
                    self.evs.push(HttpsEvent {
                        kind: HttpsEventKind::ReqFin,
                    });
                    return;
                }
                Some(Err(e)) => {
                    log::warn!(target: "nbio::https", "request failed: {}", e);
                    self.req_fail();
                    return;
                }
                None => {}
            }
        }
    }

    pub fn events(&self) -> &[HttpsEvent] {
        &self.evs
    }

    fn req_fail(&mut self) {
        self.st = St::Err;
        if let Some(handle) = self.handle.take() {
            let _ = self.multi.remove2(handle);
        }
        self.evs.push(HttpsEvent {
            kind: HttpsEventKind::ReqFail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_just_init_and_emits_init_event() {
        let mut https = Https::new(4096).expect("timerfd_create should succeed in tests");
        https.update(&[]);
        assert_eq!(https.events().len(), 1);
        assert_eq!(https.events()[0].kind(), HttpsEventKind::Init);
    }

    #[test]
    fn collector_truncates_to_maxlen_minus_one_and_counts_writes() {
        let mut c = Collector {
            out: Vec::new(),
            mlen: 8,
            pending_writes: 0,
        };
        assert_eq!(c.write(b"1234").unwrap(), 4);
        assert_eq!(c.write(b"56789").unwrap(), 5);
        assert_eq!(c.out.len(), 7, "maxlen - 1 == 7 bytes kept");
        assert_eq!(c.out, b"1234567");
        assert_eq!(c.pending_writes, 2);
    }

    #[test]
    fn req_json_rejected_before_idle() {
        // Right after construction the module is `JustInit`, not `Idle`
        // yet — mirrors the original returning `https_req_fail_other_pend`
        // for any request issued before the first `update`.
        let mut https = Https::new(4096).unwrap();
        assert!(https.req_json(HttpsMethod::Get, "https://example.invalid", "").is_err());
    }

    #[test]
    fn stop_prep_then_stop() {
        let mut https = Https::new(4096).unwrap();
        https.update(&[]);
        https.stop_prep().unwrap();
        https.update(&[]);
        assert_eq!(https.events()[0].kind(), HttpsEventKind::Stopped);
        https.stop().unwrap();
    }
}
