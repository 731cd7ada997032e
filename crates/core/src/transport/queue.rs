//! Bounded outbound packet queue shared by every transport variant.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RtspError};

/// Default queue capacity in packets.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A queue continuously full beyond this deadline marks the transport as
/// fatally congested.
pub const CONGESTION_DEADLINE: Duration = Duration::from_secs(5);

/// One queued write.
#[derive(Debug)]
pub enum QueueItem {
    /// RTSP message bytes. Never dropped.
    Control(Vec<u8>),
    /// RTP packet bytes, droppable under backpressure.
    Rtp(Vec<u8>),
    /// RTCP packet bytes. Preserved under backpressure.
    Rtcp(Vec<u8>),
}

impl QueueItem {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            QueueItem::Control(bytes) | QueueItem::Rtp(bytes) | QueueItem::Rtcp(bytes) => bytes,
        }
    }
}

struct State {
    items: VecDeque<QueueItem>,
    closed: bool,
    full_since: Option<Instant>,
    congested: bool,
}

/// Bounded producer/consumer queue between senders and the writer thread.
///
/// `push` never blocks: on overflow the oldest RTP item is dropped (or
/// the incoming RTP packet, when nothing droppable remains) while control
/// and RTCP items always get through. A queue that stays at capacity past
/// [`CONGESTION_DEADLINE`] flips to congested and every further push
/// fails, which callers treat as fatal for the session.
pub struct SendQueue {
    state: Mutex<State>,
    ready: Condvar,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        SendQueue {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
                full_since: None,
                congested: false,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    pub fn push(&self, item: QueueItem) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RtspError::Closed);
        }
        if state.congested {
            return Err(RtspError::Timeout("transport congested".to_string()));
        }

        if state.items.len() >= self.capacity {
            let now = Instant::now();
            match state.full_since {
                None => state.full_since = Some(now),
                Some(since) if now.duration_since(since) > CONGESTION_DEADLINE => {
                    state.congested = true;
                    tracing::warn!("outbound queue congested, closing transport");
                    return Err(RtspError::Timeout("transport congested".to_string()));
                }
                Some(_) => {}
            }

            if matches!(item, QueueItem::Rtp(_)) {
                let oldest_rtp = state
                    .items
                    .iter()
                    .position(|queued| matches!(queued, QueueItem::Rtp(_)));
                match oldest_rtp {
                    Some(index) => {
                        state.items.remove(index);
                        tracing::trace!("dropped oldest RTP packet under backpressure");
                    }
                    None => {
                        // No RTP in the queue; shedding the incoming
                        // packet keeps control and RTCP intact.
                        tracing::trace!("dropped incoming RTP packet under backpressure");
                        return Ok(());
                    }
                }
            }
        } else {
            state.full_since = None;
        }

        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Blocking pop; `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<QueueItem> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                if state.items.len() < self.capacity {
                    state.full_since = None;
                }
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        SendQueue::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let queue = SendQueue::new(8);
        queue.push(QueueItem::Control(vec![1])).unwrap();
        queue.push(QueueItem::Rtp(vec![2])).unwrap();
        queue.push(QueueItem::Rtcp(vec![3])).unwrap();
        assert_eq!(queue.pop().unwrap().into_bytes(), vec![1]);
        assert_eq!(queue.pop().unwrap().into_bytes(), vec![2]);
        assert_eq!(queue.pop().unwrap().into_bytes(), vec![3]);
    }

    #[test]
    fn overflow_drops_oldest_rtp_keeps_rtcp() {
        let queue = SendQueue::new(3);
        queue.push(QueueItem::Rtp(vec![1])).unwrap();
        queue.push(QueueItem::Rtcp(vec![2])).unwrap();
        queue.push(QueueItem::Rtp(vec![3])).unwrap();
        // Queue full: this push evicts RTP [1].
        queue.push(QueueItem::Rtp(vec![4])).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().into_bytes(), vec![2]);
        assert_eq!(queue.pop().unwrap().into_bytes(), vec![3]);
        assert_eq!(queue.pop().unwrap().into_bytes(), vec![4]);
    }

    #[test]
    fn overflow_without_droppable_rtp_sheds_incoming() {
        let queue = SendQueue::new(2);
        queue.push(QueueItem::Rtcp(vec![1])).unwrap();
        queue.push(QueueItem::Control(vec![2])).unwrap();
        queue.push(QueueItem::Rtp(vec![3])).unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().into_bytes(), vec![1]);
        assert_eq!(queue.pop().unwrap().into_bytes(), vec![2]);
    }

    #[test]
    fn control_passes_even_when_full() {
        let queue = SendQueue::new(2);
        queue.push(QueueItem::Rtp(vec![1])).unwrap();
        queue.push(QueueItem::Rtp(vec![2])).unwrap();
        queue.push(QueueItem::Control(vec![3])).unwrap();
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn close_unblocks_pop() {
        let queue = std::sync::Arc::new(SendQueue::new(4));
        let popper = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pop())
        };
        std::thread::sleep(Duration::from_millis(50));
        queue.close();
        assert!(popper.join().unwrap().is_none());
        assert!(matches!(
            queue.push(QueueItem::Control(vec![1])),
            Err(RtspError::Closed)
        ));
    }
}
