//! Triple-buffered frame slots
//!
//! Each stream owns a pair of decode/publish slots plus a scratch slot for
//! readers. The producer decodes into the slot that is *not* published and
//! flips the publish index when it is done; readers copy the published slot
//! into scratch under the same short lock that guards the flip, so a copy is
//! always of exactly one frame.
//!
//! ```text
//!   producer                      readers
//!   acquire_decode_target() ─┐
//!     (slot 1 - published)   │
//!   decode (no shared lock)  │
//!   DecodeTarget::publish() ─┴─► [published lock] ◄── copy_current()
//!                                  index flip          slot[index] → scratch
//! ```
//!
//! Slots are sized once at construction. A resize builds a new pool; the old
//! one lives until the last transfer handler referencing it is dropped.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::capture::frame::{Frame, FrameMetadata, SequenceNumber, Stream, StreamGeometry};

/// Keeps a slot's allocation alive behind a [`Bytes`] handle.
struct SlotOwner(Arc<Vec<u8>>);

impl AsRef<[u8]> for SlotOwner {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

fn frame_from_slot(
    buffer: Arc<Vec<u8>>,
    stream: Stream,
    geometry: StreamGeometry,
    sequence: SequenceNumber,
    timestamp: Instant,
) -> Frame {
    Frame {
        data: Bytes::from_owner(SlotOwner(buffer)),
        meta: Arc::new(FrameMetadata {
            stream,
            sequence,
            width: geometry.width,
            height: geometry.height,
            stride: geometry.stride,
        }),
        timestamp,
    }
}

struct Published {
    index: usize,
    /// `None` until the first publish.
    sequence: Option<SequenceNumber>,
    timestamp: Instant,
    /// Reader scratch slot; rewritten in place when no frame handed out
    /// earlier still references it.
    scratch: Arc<Vec<u8>>,
}

/// Slots of one stream.
pub struct StreamSlots {
    stream: Stream,
    geometry: StreamGeometry,
    pair: [Mutex<Vec<u8>>; 2],
    /// Serializes producers so only one decode target exists at a time.
    producer: Mutex<()>,
    published: Mutex<Published>,
}

/// Exclusive write access to the off-duty slot of a pair.
///
/// Only obtainable through [`StreamSlots::acquire_decode_target`], which
/// never hands out the published slot. Dropping it without calling
/// [`DecodeTarget::publish`] leaves the published frame untouched.
pub struct DecodeTarget<'a> {
    slots: &'a StreamSlots,
    index: usize,
    buffer: MutexGuard<'a, Vec<u8>>,
    _producer: MutexGuard<'a, ()>,
}

impl StreamSlots {
    pub fn new(stream: Stream, geometry: StreamGeometry) -> Self {
        let len = geometry.byte_len();
        Self {
            stream,
            geometry,
            pair: [Mutex::new(vec![0; len]), Mutex::new(vec![0; len])],
            producer: Mutex::new(()),
            published: Mutex::new(Published {
                index: 0,
                sequence: None,
                timestamp: Instant::now(),
                scratch: Arc::new(vec![0; len]),
            }),
        }
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn geometry(&self) -> StreamGeometry {
        self.geometry
    }

    /// Lock the slot that is not currently published.
    pub fn acquire_decode_target(&self) -> DecodeTarget<'_> {
        let producer = self.producer.lock();
        // Only a producer flips the index, and we hold the producer lock.
        let index = 1 - self.published.lock().index;
        DecodeTarget {
            slots: self,
            index,
            buffer: self.pair[index].lock(),
            _producer: producer,
        }
    }

    /// Copy the published frame into the scratch slot and hand it out.
    ///
    /// Returns `None` if nothing has been published yet.
    pub fn copy_current(&self) -> Option<Frame> {
        let mut published = self.published.lock();
        let sequence = published.sequence?;
        // Never contended: the producer only locks the other slot.
        let source = self.pair[published.index].lock();
        let len = self.geometry.byte_len();

        if let Some(scratch) = Arc::get_mut(&mut published.scratch) {
            scratch.copy_from_slice(&source[..len]);
        } else {
            published.scratch = Arc::new(source[..len].to_vec());
        }

        Some(frame_from_slot(
            published.scratch.clone(),
            self.stream,
            self.geometry,
            sequence,
            published.timestamp,
        ))
    }

    pub fn published_sequence(&self) -> Option<SequenceNumber> {
        self.published.lock().sequence
    }

    pub fn published_index(&self) -> usize {
        self.published.lock().index
    }
}

impl<'a> DecodeTarget<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn geometry(&self) -> StreamGeometry {
        self.slots.geometry
    }

    pub fn buffer(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Make this slot the published one.
    pub fn publish(self, sequence: SequenceNumber) {
        let DecodeTarget {
            slots,
            index,
            buffer,
            _producer,
        } = self;
        drop(buffer);

        let mut published = slots.published.lock();
        published.index = index;
        published.sequence = Some(sequence);
        published.timestamp = Instant::now();
    }
}

/// Both streams' slots for one negotiated resolution.
pub struct FramePool {
    full: StreamSlots,
    proxy: StreamSlots,
}

impl FramePool {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            full: StreamSlots::new(Stream::Full, StreamGeometry::full(width, height)),
            proxy: StreamSlots::new(Stream::Proxy, StreamGeometry::proxy(width, height)),
        }
    }

    pub fn slots(&self, stream: Stream) -> &StreamSlots {
        match stream {
            Stream::Full => &self.full,
            Stream::Proxy => &self.proxy,
        }
    }

    /// Bytes held by all six slots.
    pub fn allocated_bytes(&self) -> usize {
        3 * (self.full.geometry.byte_len() + self.proxy.geometry.byte_len())
    }
}

/// Single-thread mode slot: decoded in place and handed out directly.
///
/// If a frame from the previous decode is still held by a caller, the slot
/// is copied on write instead of overwritten.
pub struct DirectSlot {
    stream: Stream,
    geometry: StreamGeometry,
    buffer: Arc<Vec<u8>>,
}

impl DirectSlot {
    pub fn new(stream: Stream, geometry: StreamGeometry) -> Self {
        Self {
            stream,
            geometry,
            buffer: Arc::new(vec![0; geometry.byte_len()]),
        }
    }

    pub fn geometry(&self) -> StreamGeometry {
        self.geometry
    }

    pub fn decode_with<F, E>(&mut self, sequence: SequenceNumber, decode: F) -> Result<Frame, E>
    where
        F: FnOnce(&mut [u8], StreamGeometry) -> Result<(), E>,
    {
        decode(Arc::make_mut(&mut self.buffer).as_mut_slice(), self.geometry)?;
        Ok(frame_from_slot(
            self.buffer.clone(),
            self.stream,
            self.geometry,
            sequence,
            Instant::now(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(slots: &StreamSlots, value: u8, sequence: u32) {
        let mut target = slots.acquire_decode_target();
        target.buffer().fill(value);
        target.publish(SequenceNumber(sequence));
    }

    #[test]
    fn nothing_published_reads_none() {
        let slots = StreamSlots::new(Stream::Full, StreamGeometry::full(8, 2));
        assert!(slots.copy_current().is_none());
        assert_eq!(slots.published_sequence(), None);
    }

    #[test]
    fn decode_target_is_never_the_published_slot() {
        let slots = StreamSlots::new(Stream::Full, StreamGeometry::full(8, 2));
        for i in 0..5 {
            let published = slots.published_index();
            let target = slots.acquire_decode_target();
            assert_ne!(target.index(), published);
            target.publish(SequenceNumber(i));
            assert_ne!(slots.published_index(), published);
        }
    }

    #[test]
    fn abandoned_target_keeps_previous_frame() {
        let slots = StreamSlots::new(Stream::Full, StreamGeometry::full(4, 1));
        fill(&slots, 7, 1);

        let mut target = slots.acquire_decode_target();
        target.buffer().fill(99);
        drop(target);

        let frame = slots.copy_current().unwrap();
        assert_eq!(frame.sequence(), SequenceNumber(1));
        assert!(frame.data.iter().all(|&v| v == 7));
    }

    #[test]
    fn held_frame_is_not_overwritten_by_later_reads() {
        let slots = StreamSlots::new(Stream::Full, StreamGeometry::full(4, 2));
        fill(&slots, 1, 10);
        let first = slots.copy_current().unwrap();

        fill(&slots, 2, 11);
        let second = slots.copy_current().unwrap();

        assert!(first.data.iter().all(|&v| v == 1));
        assert!(second.data.iter().all(|&v| v == 2));
        assert_eq!(first.sequence(), SequenceNumber(10));
        assert_eq!(second.sequence(), SequenceNumber(11));
    }

    #[test]
    fn scratch_is_reused_once_released() {
        let slots = StreamSlots::new(Stream::Proxy, StreamGeometry::proxy(64, 64));
        fill(&slots, 3, 1);
        let ptr = slots.copy_current().unwrap().data.as_ptr();
        fill(&slots, 4, 2);
        let frame = slots.copy_current().unwrap();
        assert_eq!(frame.data.as_ptr(), ptr);
        assert!(frame.data.iter().all(|&v| v == 4));
    }

    #[test]
    fn pool_sizes_both_streams() {
        let pool = FramePool::new(1246, 800);
        assert_eq!(pool.slots(Stream::Full).geometry().stride, 1248);
        assert_eq!(pool.slots(Stream::Proxy).geometry().width, 156);
        assert_eq!(pool.allocated_bytes(), 3 * (1248 * 800 + 156 * 100));
    }

    #[test]
    fn direct_slot_copies_on_write_while_frame_held() {
        let mut slot = DirectSlot::new(Stream::Full, StreamGeometry::full(4, 1));
        let first = slot
            .decode_with(SequenceNumber(1), |buf, _| {
                buf.fill(5);
                Ok::<_, ()>(())
            })
            .unwrap();
        let second = slot
            .decode_with(SequenceNumber(2), |buf, _| {
                buf.fill(6);
                Ok::<_, ()>(())
            })
            .unwrap();
        assert!(first.data.iter().all(|&v| v == 5));
        assert!(second.data.iter().all(|&v| v == 6));
    }
}
