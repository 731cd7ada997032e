//! TCP control-connection plumbing: the writer thread and interleaved
//! channel endpoints.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::protocol::message::InterleavedFrame;
use crate::transport::queue::{QueueItem, SendQueue};

/// Error callback invoked once when the writer thread dies on an I/O
/// failure.
pub type WriteErrorHandler = Box<dyn FnOnce(RtspError) + Send>;

/// Sole owner of a connection's TCP write half.
///
/// Responses, requests, and interleaved frames from any thread serialize
/// through the bounded queue; the writer thread is the only code that
/// touches the socket. This is the single point of mutual exclusion in
/// the connection model.
pub struct ConnWriter {
    queue: Arc<SendQueue>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ConnWriter {
    pub fn start(
        mut stream: TcpStream,
        write_timeout: Duration,
        on_error: WriteErrorHandler,
    ) -> Arc<ConnWriter> {
        let queue = Arc::new(SendQueue::default());
        let _ = stream.set_write_timeout(Some(write_timeout));

        let writer_queue = queue.clone();
        let handle = thread::spawn(move || {
            let mut on_error = Some(on_error);
            while let Some(item) = writer_queue.pop() {
                if let Err(e) = stream.write_all(&item.into_bytes()) {
                    tracing::debug!(error = %e, "control connection write error");
                    writer_queue.close();
                    if let Some(on_error) = on_error.take() {
                        on_error(RtspError::Network(e));
                    }
                    break;
                }
            }
        });

        Arc::new(ConnWriter {
            queue,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a serialized RTSP message. Control writes are never dropped.
    pub fn send_control(&self, bytes: Vec<u8>) -> Result<()> {
        self.queue.push(QueueItem::Control(bytes))
    }

    /// Queue an interleaved RTP frame on the given channel.
    pub fn send_frame_rtp(&self, channel: u8, payload: Vec<u8>) -> Result<()> {
        let frame = InterleavedFrame { channel, payload };
        self.queue.push(QueueItem::Rtp(frame.serialize()))
    }

    /// Queue an interleaved RTCP frame on the given channel.
    pub fn send_frame_rtcp(&self, channel: u8, payload: Vec<u8>) -> Result<()> {
        let frame = InterleavedFrame { channel, payload };
        self.queue.push(QueueItem::Rtcp(frame.serialize()))
    }

    /// Close the queue and join the writer thread.
    pub fn close(&self) {
        self.queue.close();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Per-connection allocator of even/odd interleaved channel pairs.
#[derive(Debug, Default)]
pub struct ChannelAllocator {
    next: u8,
    exhausted: bool,
}

impl ChannelAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next even/odd pair in [0, 255].
    pub fn allocate_pair(&mut self) -> Result<(u8, u8)> {
        if self.exhausted {
            return Err(RtspError::Unsupported(
                "interleaved channels exhausted".to_string(),
            ));
        }
        let rtp = self.next;
        match self.next.checked_add(2) {
            Some(next) => self.next = next,
            None => self.exhausted = true,
        }
        Ok((rtp, rtp + 1))
    }

    /// Mark an externally requested pair as used so later allocations do
    /// not collide with it.
    pub fn reserve(&mut self, rtp_channel: u8) {
        if rtp_channel >= self.next {
            match rtp_channel.checked_add(2) {
                Some(next) => self.next = next,
                None => self.exhausted = true,
            }
        }
    }
}

/// Interleaved transport for one set-up media: an even/odd channel pair
/// sharing the control connection's writer.
pub struct TcpEndpoint {
    writer: Arc<ConnWriter>,
    rtp_channel: u8,
    rtcp_channel: u8,
}

impl TcpEndpoint {
    pub fn new(writer: Arc<ConnWriter>, rtp_channel: u8, rtcp_channel: u8) -> Self {
        TcpEndpoint {
            writer,
            rtp_channel,
            rtcp_channel,
        }
    }

    pub fn channels(&self) -> (u8, u8) {
        (self.rtp_channel, self.rtcp_channel)
    }

    pub fn send_rtp(&self, payload: Vec<u8>) -> Result<()> {
        self.writer.send_frame_rtp(self.rtp_channel, payload)
    }

    pub fn send_rtcp(&self, payload: Vec<u8>) -> Result<()> {
        self.writer.send_frame_rtcp(self.rtcp_channel, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn channel_pairs_are_even_odd() {
        let mut alloc = ChannelAllocator::new();
        assert_eq!(alloc.allocate_pair().unwrap(), (0, 1));
        assert_eq!(alloc.allocate_pair().unwrap(), (2, 3));
        alloc.reserve(6);
        assert_eq!(alloc.allocate_pair().unwrap(), (8, 9));
    }

    #[test]
    fn channel_allocator_exhausts() {
        let mut alloc = ChannelAllocator::new();
        alloc.reserve(254);
        assert!(alloc.allocate_pair().is_err());
    }

    #[test]
    fn writer_serializes_messages_and_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();

        let writer = ConnWriter::start(client, Duration::from_secs(2), Box::new(|_| {}));
        writer.send_control(b"RTSP/1.0 200 OK\r\n\r\n".to_vec()).unwrap();
        let endpoint = TcpEndpoint::new(writer.clone(), 0, 1);
        endpoint.send_rtp(vec![0xAA, 0xBB]).unwrap();
        endpoint.send_rtcp(vec![0xCC]).unwrap();

        let mut received = Vec::new();
        let message_len = b"RTSP/1.0 200 OK\r\n\r\n".len();
        let expected_len = message_len + 6 + 5;
        server_side
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        while received.len() < expected_len {
            let mut buf = [0u8; 64];
            let n = server_side.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }

        assert!(received.starts_with(b"RTSP/1.0 200 OK\r\n\r\n"));
        let frames = &received[message_len..];
        assert_eq!(&frames[..6], &[b'$', 0, 0, 2, 0xAA, 0xBB]);
        assert_eq!(&frames[6..], &[b'$', 1, 0, 1, 0xCC]);

        writer.close();
    }
}
