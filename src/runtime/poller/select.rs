//! `select(2)` backend.
//!
//! Portable fallback; limited to `FD_SETSIZE` (1024) descriptors. Same
//! mutex-guarded registration model as the poll backend.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use super::{Event, Interest};

pub struct SelectPoller {
    registered: Mutex<HashMap<RawFd, Interest>>,
}

impl SelectPoller {
    pub fn new() -> SelectPoller {
        SelectPoller {
            registered: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "fd exceeds FD_SETSIZE; use the poll or epoll backend",
            ));
        }
        self.registered.lock().unwrap().insert(fd, interest);
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut registered = self.registered.lock().unwrap();
        match registered.get_mut(&fd) {
            Some(slot) => {
                *slot = interest;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "fd not registered",
            )),
        }
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.registered.lock().unwrap().remove(&fd);
        Ok(())
    }

    pub fn wait(&self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<usize> {
        let snapshot: Vec<(RawFd, Interest)> = {
            let registered = self.registered.lock().unwrap();
            registered.iter().map(|(&fd, &i)| (fd, i)).collect()
        };

        let mut readfds: libc::fd_set = unsafe { mem::zeroed() };
        let mut writefds: libc::fd_set = unsafe { mem::zeroed() };
        let mut errorfds: libc::fd_set = unsafe { mem::zeroed() };
        let mut nfds: RawFd = 0;

        unsafe {
            libc::FD_ZERO(&mut readfds);
            libc::FD_ZERO(&mut writefds);
            libc::FD_ZERO(&mut errorfds);
            for &(fd, interest) in &snapshot {
                if interest.is_readable() {
                    libc::FD_SET(fd, &mut readfds);
                }
                if interest.is_writable() {
                    libc::FD_SET(fd, &mut writefds);
                }
                libc::FD_SET(fd, &mut errorfds);
                if fd >= nfds {
                    nfds = fd + 1;
                }
            }
        }

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let n = unsafe {
            libc::select(
                nfds,
                &mut readfds,
                &mut writefds,
                &mut errorfds,
                &mut tv,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for &(fd, _) in &snapshot {
            let mut readiness = Interest::none();
            unsafe {
                if libc::FD_ISSET(fd, &mut readfds) {
                    readiness = readiness | Interest::READ;
                }
                if libc::FD_ISSET(fd, &mut writefds) {
                    readiness = readiness | Interest::WRITE;
                }
                if libc::FD_ISSET(fd, &mut errorfds) {
                    readiness = readiness | Interest::ERROR;
                }
            }
            if !readiness.is_empty() {
                events.push(Event { fd, readiness });
            }
        }
        Ok(events.len())
    }
}
