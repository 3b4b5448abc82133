//! Linked-segment byte buffer shared between one producer and one consumer.
//!
//! Segments are fixed-capacity `BytesMut` chunks that are never reallocated,
//! so the regions handed out for vectored syscalls keep their addresses for
//! as long as the segment lives. Metadata (segment list, lengths) is guarded
//! by a mutex; the payload regions are only ever touched by the side that
//! owns them — the producer writes nothing but spare capacity, the consumer
//! reads nothing but committed bytes — which keeps the unlocked
//! `readv`/`sendmsg` windows race-free.
//!
//! Used in both directions: the poller produces into a connection's input
//! buffer and consumes from its output buffer; user code does the reverse.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::poll::MAX_IOVECS;

pub struct LinkedBuffer {
    segments: Mutex<VecDeque<BytesMut>>,
    /// Committed (readable) bytes; updated under the lock, read lock-free.
    len: AtomicUsize,
    seg_size: usize,
}

impl LinkedBuffer {
    pub fn new(seg_size: usize) -> Self {
        LinkedBuffer {
            segments: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            seg_size: seg_size.max(64),
        }
    }

    /// Committed bytes available to the consumer.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expose writable spare regions for a vectored read. Guarantees at
    /// least one segment's worth of spare space; the regions stay valid
    /// until the matching `ack_written`.
    pub fn writable_iovs(&self, iovs: &mut Vec<libc::iovec>) {
        let mut segments = self.segments.lock();

        let spare_total: usize = segments.iter().map(spare).sum();
        if spare_total < self.seg_size {
            segments.push_back(BytesMut::with_capacity(self.seg_size));
        }

        for seg in segments.iter_mut() {
            if iovs.len() >= MAX_IOVECS {
                break;
            }
            if spare(seg) == 0 {
                continue;
            }
            let region = seg.spare_capacity_mut();
            iovs.push(libc::iovec {
                iov_base: region.as_mut_ptr() as *mut libc::c_void,
                iov_len: region.len(),
            });
        }
    }

    /// Commit `n` bytes written into the regions from `writable_iovs`.
    pub fn ack_written(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut segments = self.segments.lock();
        let mut rem = n;
        for seg in segments.iter_mut() {
            let room = spare(seg);
            if room == 0 {
                continue;
            }
            let take = rem.min(room);
            // The bytes were produced by the kernel into spare capacity.
            unsafe { seg.set_len(seg.len() + take) };
            rem -= take;
            if rem == 0 {
                break;
            }
        }
        debug_assert_eq!(rem, 0, "acked more bytes than exposed spare");
        self.len.fetch_add(n - rem, Ordering::Release);
    }

    /// Copy `data` in at the write frontier.
    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut segments = self.segments.lock();
        let mut rem = data;
        while !rem.is_empty() {
            if segments.back().map_or(true, |s| spare(s) == 0) {
                segments.push_back(BytesMut::with_capacity(self.seg_size));
            }
            let seg = segments.back_mut().unwrap();
            let take = rem.len().min(spare(seg));
            seg.extend_from_slice(&rem[..take]);
            rem = &rem[take..];
        }
        self.len.fetch_add(data.len(), Ordering::Release);
    }

    /// Expose committed regions for a vectored write. The regions stay
    /// valid until the matching `consume`.
    pub fn readable_iovs(&self, iovs: &mut Vec<libc::iovec>) {
        let segments = self.segments.lock();
        for seg in segments.iter() {
            if iovs.len() >= MAX_IOVECS {
                break;
            }
            if seg.is_empty() {
                continue;
            }
            iovs.push(libc::iovec {
                iov_base: seg.as_ptr() as *mut libc::c_void,
                iov_len: seg.len(),
            });
        }
    }

    /// Drop `n` committed bytes from the front (at most what is
    /// committed). Returns the number actually dropped.
    pub fn consume(&self, n: usize) -> usize {
        let mut segments = self.segments.lock();
        let mut rem = n;
        while rem > 0 {
            let Some(seg) = segments.front_mut() else { break };
            let take = rem.min(seg.len());
            if take == 0 {
                break;
            }
            let _ = seg.split_to(take);
            rem -= take;
            if seg.is_empty() && seg.capacity() == 0 {
                segments.pop_front();
            }
        }
        let dropped = n - rem;
        self.len.fetch_sub(dropped, Ordering::Release);
        dropped
    }

    /// Take exactly `n` committed bytes. `None` if fewer are available.
    /// Single-segment reads hand the bytes out without copying.
    pub fn next(&self, n: usize) -> Option<Bytes> {
        let mut segments = self.segments.lock();
        if self.len.load(Ordering::Acquire) < n {
            return None;
        }
        if n == 0 {
            return Some(Bytes::new());
        }

        let out = if segments.front().map_or(0, |s| s.len()) >= n {
            let seg = segments.front_mut().unwrap();
            let out = seg.split_to(n).freeze();
            if seg.is_empty() && seg.capacity() == 0 {
                segments.pop_front();
            }
            out
        } else {
            let mut acc = BytesMut::with_capacity(n);
            let mut rem = n;
            while rem > 0 {
                let seg = segments.front_mut().unwrap();
                let take = rem.min(seg.len());
                debug_assert!(take > 0, "committed bytes must be contiguous from the front");
                acc.extend_from_slice(&seg.split_to(take));
                rem -= take;
                if seg.is_empty() && seg.capacity() == 0 {
                    segments.pop_front();
                }
            }
            acc.freeze()
        };
        self.len.fetch_sub(n, Ordering::Release);
        Some(out)
    }

    /// Copy out the first `n` committed bytes without consuming them.
    pub fn peek(&self, n: usize) -> Option<Bytes> {
        let segments = self.segments.lock();
        if self.len.load(Ordering::Acquire) < n {
            return None;
        }
        let mut acc = BytesMut::with_capacity(n);
        let mut rem = n;
        for seg in segments.iter() {
            if rem == 0 {
                break;
            }
            let take = rem.min(seg.len());
            acc.extend_from_slice(&seg[..take]);
            rem -= take;
        }
        Some(acc.freeze())
    }
}

fn spare(seg: &BytesMut) -> usize {
    seg.capacity() - seg.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_next_round_trip() {
        let buf = LinkedBuffer::new(64);
        buf.append(b"hello world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.next(5).unwrap().as_ref(), b"hello");
        assert_eq!(buf.len(), 6);
        assert!(buf.next(7).is_none());
        assert_eq!(buf.next(6).unwrap().as_ref(), b" world");
        assert!(buf.is_empty());
    }

    #[test]
    fn reads_span_segments() {
        let buf = LinkedBuffer::new(64);
        let payload: Vec<u8> = (0..500).map(|i| (i % 251) as u8).collect();
        buf.append(&payload);
        assert_eq!(buf.len(), 500);
        let got = buf.next(500).unwrap();
        assert_eq!(got.as_ref(), &payload[..]);
    }

    #[test]
    fn peek_does_not_consume() {
        let buf = LinkedBuffer::new(16);
        buf.append(b"abcdefghijklmnopqrstuvwxyz");
        assert_eq!(buf.peek(26).unwrap().as_ref(), b"abcdefghijklmnopqrstuvwxyz");
        assert_eq!(buf.len(), 26);
        assert_eq!(buf.next(3).unwrap().as_ref(), b"abc");
    }

    #[test]
    fn vectored_write_path_commits_in_order() {
        let buf = LinkedBuffer::new(32);
        // Leave a partially filled tail so the next expose spans two
        // segments.
        buf.append(&[b'x'; 20]);

        let mut iovs = Vec::with_capacity(MAX_IOVECS);
        buf.writable_iovs(&mut iovs);
        assert!(!iovs.is_empty());

        // Simulate a kernel readv: fill the regions in order.
        let mut written = 0usize;
        let mut stamp = 0u8;
        for iov in &iovs {
            let region =
                unsafe { std::slice::from_raw_parts_mut(iov.iov_base as *mut u8, iov.iov_len) };
            for b in region.iter_mut() {
                *b = stamp;
                stamp = stamp.wrapping_add(1);
            }
            written += region.len();
        }
        buf.ack_written(written);
        assert_eq!(buf.len(), 20 + written);

        let _ = buf.next(20).unwrap();
        let got = buf.next(written).unwrap();
        let mut expect = 0u8;
        for b in got.iter() {
            assert_eq!(*b, expect);
            expect = expect.wrapping_add(1);
        }
    }

    #[test]
    fn readable_iovs_cover_committed_bytes() {
        let buf = LinkedBuffer::new(16);
        buf.append(&[b'a'; 40]);
        let mut iovs = Vec::with_capacity(MAX_IOVECS);
        buf.readable_iovs(&mut iovs);
        let total: usize = iovs.iter().map(|v| v.iov_len).sum();
        assert_eq!(total, 40);

        assert_eq!(buf.consume(25), 25);
        assert_eq!(buf.len(), 15);
        assert_eq!(buf.consume(100), 15);
        assert!(buf.is_empty());
    }
}
