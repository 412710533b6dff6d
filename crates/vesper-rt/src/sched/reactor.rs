// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Event-loop integration.
//!
//! The scheduler drives an external event loop for timers and I/O.
//! Exactly one worker at a time owns the loop (a global mutex in the
//! scheduler guards entry); other threads interrupt a blocked loop
//! through `cross_thread_wake`. The default implementation is an epoll
//! reactor with an eventfd kick.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::warn;

use super::task::Task;

/// What the scheduler needs from an event loop. One call runs at a time;
/// the scheduler serializes callers through its loop mutex.
pub trait EventLoop: Send + Sync {
    /// Run one loop iteration, blocking until an event or a wake.
    fn run_once_blocking(&self);
    /// Run one loop iteration without blocking.
    fn run_once_nonblocking(&self);
    /// Ask a loop iteration running on this thread to return. Called by
    /// the thread that owns the loop mutex.
    fn stop(&self);
    /// Interrupt a loop iteration blocked on another thread.
    fn cross_thread_wake(&self);
}

/// I/O interest for reactor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    ReadWrite,
}

impl Interest {
    fn to_epoll_events(self) -> u32 {
        match self {
            Interest::Readable => libc::EPOLLIN as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
            Interest::ReadWrite => (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        }
    }
}

/// Per-FD registration: the task to hand back when the FD is ready.
struct Registration {
    task: Arc<Task>,
    #[allow(dead_code)]
    interest: Interest,
}

/// Callback that returns a ready task to the scheduler's run queue.
type ReadyFn = Box<dyn Fn(Arc<Task>) + Send + Sync>;

/// Default event loop: epoll (Linux) plus an eventfd for cross-thread
/// wakes. Tasks register interest in FDs; when an FD turns ready its
/// task is handed to the ready callback, which re-enqueues it.
pub struct Reactor {
    epoll_fd: RawFd,
    /// Eventfd for interrupting `epoll_wait` (wake, stop, shutdown).
    wake_fd: RawFd,
    /// FD → registration mapping.
    registrations: Mutex<HashMap<RawFd, Registration>>,
    /// Raised by `stop`; a blocking iteration returns promptly.
    stopping: AtomicBool,
    /// Installed once by the scheduler after construction.
    ready: OnceLock<ReadyFn>,
}

impl Reactor {
    /// Create a reactor with an epoll instance and wake eventfd.
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            unsafe { libc::close(epoll_fd) };
            return Err(io::Error::last_os_error());
        }

        // Register wake_fd with epoll so we can interrupt epoll_wait.
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll_fd,
            wake_fd,
            registrations: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            ready: OnceLock::new(),
        })
    }

    /// Install the re-enqueue callback. Set once at scheduler init.
    pub fn set_ready_handler(&self, f: impl Fn(Arc<Task>) + Send + Sync + 'static) {
        let _ = self.ready.set(Box::new(f));
    }

    /// Register a file descriptor. When it becomes ready for `interest`,
    /// `task` is handed to the ready callback.
    pub fn register(&self, fd: RawFd, interest: Interest, task: Arc<Task>) -> io::Result<()> {
        let mut regs = self.registrations.lock().unwrap();

        let mut ev = libc::epoll_event {
            events: interest.to_epoll_events(),
            u64: fd as u64,
        };

        let op = if regs.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };

        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        regs.insert(fd, Registration { task, interest });
        drop(regs);

        // Kick a blocked iteration so it sees the new registration.
        self.cross_thread_wake();
        Ok(())
    }

    /// Remove a file descriptor from the reactor.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut regs = self.registrations.lock().unwrap();
        if regs.remove(&fd).is_some() {
            let ret = unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // ENOENT / EBADF are expected if the FD already closed.
                if err.raw_os_error() != Some(libc::ENOENT)
                    && err.raw_os_error() != Some(libc::EBADF)
                {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// One epoll cycle. Ready tasks go to the ready callback; returns how
    /// many were handed over.
    fn poll(&self, timeout_ms: i32) -> io::Result<usize> {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0); // EINTR: retry next cycle.
            }
            return Err(err);
        }

        // Collect ready tasks under the lock, hand them over outside it;
        // the callback takes scheduler locks of its own.
        let mut ready = Vec::new();
        {
            let mut regs = self.registrations.lock().unwrap();

            for ev in events.iter().take(n as usize) {
                let fd = ev.u64 as RawFd;

                // Drain wake_fd; the value is just a signal.
                if fd == self.wake_fd {
                    let mut buf = [0u8; 8];
                    unsafe {
                        libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                    }
                    continue;
                }

                if let Some(reg) = regs.remove(&fd) {
                    unsafe {
                        libc::epoll_ctl(
                            self.epoll_fd,
                            libc::EPOLL_CTL_DEL,
                            fd,
                            std::ptr::null_mut(),
                        );
                    }
                    ready.push(reg.task);
                }
            }
        }

        let handed = ready.len();
        if let Some(handler) = self.ready.get() {
            for task in ready {
                handler(task);
            }
        }

        Ok(handed)
    }
}

impl EventLoop for Reactor {
    fn run_once_blocking(&self) {
        // A stop that raced ahead of this iteration consumes it.
        if self.stopping.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.poll(-1) {
            warn!("reactor poll failed: {e}");
        }
    }

    fn run_once_nonblocking(&self) {
        if let Err(e) = self.poll(0) {
            warn!("reactor poll failed: {e}");
        }
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.cross_thread_wake();
    }

    fn cross_thread_wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let regs = self.registrations.lock().unwrap();
        for &fd in regs.keys() {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
        drop(regs);

        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}
