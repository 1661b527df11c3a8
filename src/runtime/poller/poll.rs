//! `poll(2)` backend.
//!
//! The registration set lives behind a mutex and the pollfd array is
//! rebuilt on every wait, so registrations and interest changes can come
//! from any thread and take effect on the next wait cycle.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use super::{Event, Interest};

pub struct PollPoller {
    registered: Mutex<HashMap<RawFd, Interest>>,
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            registered: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
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
        let mut fds: Vec<libc::pollfd> = {
            let registered = self.registered.lock().unwrap();
            registered
                .iter()
                .map(|(&fd, &interest)| {
                    let mut poll_events: libc::c_short = 0;
                    if interest.is_readable() {
                        poll_events |= libc::POLLIN;
                    }
                    if interest.is_writable() {
                        poll_events |= libc::POLLOUT;
                    }
                    libc::pollfd {
                        fd,
                        events: poll_events,
                        revents: 0,
                    }
                })
                .collect()
        };

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for pfd in &fds {
            if pfd.revents == 0 {
                continue;
            }
            let mut readiness = Interest::none();
            if pfd.revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                readiness = readiness | Interest::READ;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                readiness = readiness | Interest::WRITE;
            }
            if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                readiness = readiness | Interest::ERROR;
            }
            if !readiness.is_empty() {
                events.push(Event {
                    fd: pfd.fd,
                    readiness,
                });
            }
        }
        Ok(events.len())
    }
}
