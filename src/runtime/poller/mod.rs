//! I/O readiness multiplexer with selectable backends.
//!
//! All three backends expose the same contract: register a file descriptor
//! with an interest mask, then `wait` for readiness events. `epoll` runs in
//! level-triggered mode so partial reads and writes re-fire on the next
//! wait; select/poll are level-triggered by nature, so the backends behave
//! identically at this interface.
//!
//! Every method takes `&self` and is safe to call from any thread: the send
//! pipeline arms WRITE interest from worker and heartbeat threads while the
//! event loop is blocked in `wait`. For epoll the kernel serializes
//! `epoll_ctl`; select/poll keep their registration set behind a mutex and
//! rebuild the fd sets on each wait, so a cross-thread update is observed
//! at the next wait cycle (bounded by the event loop's 100 ms timeout).

mod epoll;
mod poll;
mod select;

use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub use epoll::EpollPoller;
pub use poll::PollPoller;
pub use select::SelectPoller;

use crate::config::IoType;

/// Readiness interest / readiness state bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0b001);
    pub const WRITE: Interest = Interest(0b010);
    pub const ERROR: Interest = Interest(0b100);

    pub const fn none() -> Interest {
        Interest(0)
    }

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_readable(self) -> bool {
        self.contains(Interest::READ)
    }

    pub const fn is_writable(self) -> bool {
        self.contains(Interest::WRITE)
    }

    pub const fn is_error(self) -> bool {
        self.contains(Interest::ERROR)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// A single readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub readiness: Interest,
}

/// Multiplexer facade over the configured backend.
pub enum Poller {
    Select(SelectPoller),
    Poll(PollPoller),
    Epoll(EpollPoller),
}

impl Poller {
    pub fn new(io_type: IoType) -> io::Result<Poller> {
        match io_type {
            IoType::Select => Ok(Poller::Select(SelectPoller::new())),
            IoType::Poll => Ok(Poller::Poll(PollPoller::new())),
            IoType::Epoll => Ok(Poller::Epoll(EpollPoller::new()?)),
        }
    }

    /// Register `fd` with the given interest mask.
    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self {
            Poller::Select(p) => p.add(fd, interest),
            Poller::Poll(p) => p.add(fd, interest),
            Poller::Epoll(p) => p.add(fd, interest),
        }
    }

    /// Replace the interest mask of an already registered `fd`.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self {
            Poller::Select(p) => p.modify(fd, interest),
            Poller::Poll(p) => p.modify(fd, interest),
            Poller::Epoll(p) => p.modify(fd, interest),
        }
    }

    /// Drop `fd` from the interest set.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        match self {
            Poller::Select(p) => p.remove(fd),
            Poller::Poll(p) => p.remove(fd),
            Poller::Epoll(p) => p.remove(fd),
        }
    }

    /// Block until at least one fd is ready or the timeout elapses.
    ///
    /// `events` is cleared and refilled; an empty result means timeout.
    /// `EINTR` is reported as an empty result, not an error.
    pub fn wait(&self, events: &mut Vec<Event>, timeout: Duration) -> io::Result<usize> {
        events.clear();
        match self {
            Poller::Select(p) => p.wait(events, timeout),
            Poller::Poll(p) => p.wait(events, timeout),
            Poller::Epoll(p) => p.wait(events, timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn check_backend(poller: Poller) {
        let (mut client, server) = socket_pair();
        let fd = server.as_raw_fd();
        let mut events = Vec::new();

        poller.add(fd, Interest::READ | Interest::ERROR).unwrap();

        // Nothing pending yet: wait times out empty.
        let n = poller.wait(&mut events, Duration::from_millis(10)).unwrap();
        assert_eq!(n, 0);
        assert!(events.is_empty());

        client.write_all(b"ping").unwrap();
        let n = poller.wait(&mut events, Duration::from_millis(1000)).unwrap();
        assert!(n >= 1);
        let ev = events.iter().find(|e| e.fd == fd).expect("event for fd");
        assert!(ev.readiness.is_readable());

        // An idle socket is immediately writable once WRITE interest is armed.
        poller
            .modify(fd, Interest::READ | Interest::WRITE | Interest::ERROR)
            .unwrap();
        poller.wait(&mut events, Duration::from_millis(1000)).unwrap();
        let ev = events.iter().find(|e| e.fd == fd).expect("event for fd");
        assert!(ev.readiness.is_writable());

        poller.remove(fd).unwrap();
        let n = poller.wait(&mut events, Duration::from_millis(10)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn epoll_backend_contract() {
        check_backend(Poller::new(IoType::Epoll).unwrap());
    }

    #[test]
    fn poll_backend_contract() {
        check_backend(Poller::new(IoType::Poll).unwrap());
    }

    #[test]
    fn select_backend_contract() {
        check_backend(Poller::new(IoType::Select).unwrap());
    }

    #[test]
    fn interest_mask_ops() {
        let both = Interest::READ | Interest::WRITE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_error());
        assert!(Interest::none().is_empty());
    }
}
