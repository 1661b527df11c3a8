//! Linux `epoll` backend.
//!
//! Level-triggered: a socket with unread data or writable buffer space
//! keeps firing, so a partial read or write is simply picked up on the
//! next wait. Interest changes go straight to the kernel via `epoll_ctl`,
//! which is safe from any thread while another thread sits in
//! `epoll_wait`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Event, Interest};

const MAX_EVENTS: usize = 1024;

pub struct EpollPoller {
    epfd: RawFd,
}

impl EpollPoller {
    pub fn new() -> io::Result<EpollPoller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller { epfd })
    }

    fn flags(interest: Interest) -> u32 {
        let mut flags = 0u32;
        if interest.is_readable() {
            flags |= libc::EPOLLIN as u32;
        }
        if interest.is_writable() {
            flags |= libc::EPOLLOUT as u32;
        }
        // EPOLLERR / EPOLLHUP are always reported by the kernel.
        flags
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: Self::flags(interest),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<usize> {
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for ev in &raw[..n as usize] {
            let mut readiness = Interest::none();
            if ev.events & (libc::EPOLLIN as u32 | libc::EPOLLPRI as u32) != 0 {
                readiness = readiness | Interest::READ;
            }
            if ev.events & libc::EPOLLOUT as u32 != 0 {
                readiness = readiness | Interest::WRITE;
            }
            if ev.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                readiness = readiness | Interest::ERROR;
            }
            if !readiness.is_empty() {
                events.push(Event {
                    fd: ev.u64 as RawFd,
                    readiness,
                });
            }
        }
        Ok(events.len())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
