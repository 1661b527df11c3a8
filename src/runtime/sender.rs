//! Send pipeline: per-connection queued, non-blocking writes.
//!
//! `enqueue` never blocks; success means the bytes are durably queued, not
//! that they reached the wire. The send lock serializes concurrent senders
//! so each chunk is transmitted contiguously and in submission order, and
//! WRITE interest is kept in step with queue emptiness under that same
//! lock: armed iff the queue is non-empty.

use std::io::{self, Write};

use tracing::trace;

use super::connection::Connection;
use super::poller::{Interest, Poller};

/// Interest mask for a connection with nothing queued.
fn base_interest() -> Interest {
    Interest::READ | Interest::ERROR
}

impl Connection {
    /// Queue `bytes` for transmission, attempting one immediate write if
    /// the queue is empty. Errors other than `WouldBlock` are returned so
    /// the caller can run the close path.
    pub fn enqueue(&self, poller: &Poller, bytes: Vec<u8>) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let mut queue = self.send_queue.lock().unwrap();

        if !queue.is_empty() {
            // Earlier chunks are still pending; preserve FIFO order.
            // WRITE interest is already armed.
            queue.push_back(bytes);
            return Ok(());
        }

        match (&self.stream).write(&bytes) {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(n) => {
                trace!(fd = self.handle(), sent = n, total = bytes.len(), "partial write");
                queue.push_back(bytes[n..].to_vec());
                poller.modify(self.handle(), base_interest() | Interest::WRITE)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                queue.push_back(bytes);
                poller.modify(self.handle(), base_interest() | Interest::WRITE)
            }
            Err(e) => Err(e),
        }
    }

    /// Drain the send queue on writable readiness.
    ///
    /// Stops on `WouldBlock`, leaving WRITE armed; clears WRITE interest
    /// once the queue is empty.
    pub fn flush(&self, poller: &Poller) -> io::Result<()> {
        let mut queue = self.send_queue.lock().unwrap();

        while let Some(head) = queue.front() {
            match (&self.stream).write(head) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) if n == head.len() => {
                    queue.pop_front();
                }
                Ok(n) => {
                    // Short write: replace the head with its unsent tail.
                    let tail = head[n..].to_vec();
                    *queue.front_mut().unwrap() = tail;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if queue.is_empty() {
            poller.modify(self.handle(), base_interest())?;
        }
        Ok(())
    }

    /// Number of queued chunks awaiting transmission.
    pub fn queued_chunks(&self) -> usize {
        self.send_queue.lock().unwrap().len()
    }

    /// Total queued bytes awaiting transmission.
    pub fn queued_bytes(&self) -> usize {
        self.send_queue.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoType;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    fn small_buffer_pair() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        // Shrink the kernel buffers so a modest payload overflows them.
        let sock = socket2::SockRef::from(&server);
        sock.set_send_buffer_size(8 * 1024).unwrap();
        let sock = socket2::SockRef::from(&client);
        sock.set_recv_buffer_size(8 * 1024).unwrap();

        (Arc::new(Connection::new(server, peer, true)), client)
    }

    fn registered(conn: &Connection) -> Poller {
        let poller = Poller::new(IoType::Epoll).unwrap();
        poller
            .add(conn.handle(), Interest::READ | Interest::ERROR)
            .unwrap();
        poller
    }

    #[test]
    fn immediate_write_leaves_queue_empty() {
        let (conn, mut client) = small_buffer_pair();
        let poller = registered(&conn);

        conn.enqueue(&poller, b"hello".to_vec()).unwrap();
        assert_eq!(conn.queued_bytes(), 0);

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn overflow_queues_and_drains_in_order() {
        let (conn, mut client) = small_buffer_pair();
        let poller = registered(&conn);

        // Write far more than the kernel buffers hold: the tail must queue.
        let total = 1024 * 1024;
        let chunk: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        conn.enqueue(&poller, chunk.clone()).unwrap();
        assert!(conn.queued_bytes() > 0, "payload should overflow the socket");

        // Drain from the client side, flushing whenever the socket has room.
        client
            .set_read_timeout(Some(std::time::Duration::from_millis(50)))
            .unwrap();
        let mut received = Vec::with_capacity(total);
        let mut buf = [0u8; 16384];
        while received.len() < total {
            conn.flush(&poller).unwrap();
            match client.read(&mut buf) {
                Ok(0) => panic!("unexpected EOF"),
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }

        assert_eq!(received, chunk);
        assert_eq!(conn.queued_bytes(), 0);
    }

    #[test]
    fn chunks_drain_fifo() {
        let (conn, mut client) = small_buffer_pair();
        let poller = registered(&conn);

        // Saturate the socket so subsequent chunks stack up behind it.
        let filler = vec![0xEEu8; 512 * 1024];
        conn.enqueue(&poller, filler.clone()).unwrap();
        conn.enqueue(&poller, b"first".to_vec()).unwrap();
        conn.enqueue(&poller, b"second".to_vec()).unwrap();
        assert!(conn.queued_chunks() >= 2);

        client
            .set_read_timeout(Some(std::time::Duration::from_millis(50)))
            .unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 16384];
        let expected = filler.len() + 5 + 6;
        while received.len() < expected {
            conn.flush(&poller).unwrap();
            match client.read(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }

        assert_eq!(&received[filler.len()..], b"firstsecond");
    }
}
