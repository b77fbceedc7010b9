use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Edge length of the square pixel block averaged into one proxy pixel.
pub const PROXY_BLOCK: u32 = 8;

/// Row strides of the full stream are padded to this many bytes.
pub const ROW_ALIGN: u32 = 4;

/// The two independently sampled image streams decoded from each transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    /// Full-resolution luma image.
    Full,
    /// One pixel per 8×8 block of the full image.
    Proxy,
}

impl Stream {
    pub const ALL: [Stream; 2] = [Stream::Full, Stream::Proxy];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Stream::Full => 0,
            Stream::Proxy => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Full => "full",
            Stream::Proxy => "proxy",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding of the payload a driver hands over for each transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferFormat {
    /// Packed 8-bit luma, `width * height` bytes, no row padding.
    RawLuma,
    /// One JPEG image per transfer.
    Mjpeg,
}

/// Hardware-assigned transfer counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceNumber(pub u32);

impl SequenceNumber {
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Number of transfers skipped between `previous` and `self`.
    ///
    /// A jump from N to N+k yields k-1. Equal numbers yield zero. The counter
    /// is allowed to wrap.
    pub fn missed_since(self, previous: SequenceNumber) -> u32 {
        self.0.wrapping_sub(previous.0).saturating_sub(1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Dimensions and row layout of one decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    pub width: u32,
    pub height: u32,
    /// Bytes per row, including padding.
    pub stride: u32,
}

impl StreamGeometry {
    /// Full stream layout: row stride is the width rounded up to [`ROW_ALIGN`].
    pub fn full(width: u32, height: u32) -> Self {
        let stride = width.div_ceil(ROW_ALIGN) * ROW_ALIGN;
        Self {
            width,
            height,
            stride,
        }
    }

    /// Proxy stream layout: one byte per [`PROXY_BLOCK`]-sized block, unpadded.
    pub fn proxy(width: u32, height: u32) -> Self {
        let blocks_x = width.div_ceil(PROXY_BLOCK);
        let blocks_y = height.div_ceil(PROXY_BLOCK);
        Self {
            width: blocks_x,
            height: blocks_y,
            stride: blocks_x,
        }
    }

    pub fn for_stream(stream: Stream, width: u32, height: u32) -> Self {
        match stream {
            Stream::Full => Self::full(width, height),
            Stream::Proxy => Self::proxy(width, height),
        }
    }

    /// Size in bytes of a buffer holding one image.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// Decoded image handed to readers
#[derive(Clone)]
pub struct Frame {
    /// Stable image bytes, `meta.stride * meta.height` long. Never rewritten
    /// while any clone of this frame is alive.
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// When the frame was published (or pulled, in single-thread mode)
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub stream: Stream,
    pub sequence: SequenceNumber,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

impl Frame {
    #[inline]
    pub fn sequence(&self) -> SequenceNumber {
        self.meta.sequence
    }

    #[inline]
    pub fn geometry(&self) -> StreamGeometry {
        StreamGeometry {
            width: self.meta.width,
            height: self.meta.height,
            stride: self.meta.stride,
        }
    }

    /// Visible pixels of row `y`, padding excluded; `None` past the last row.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.meta.height {
            return None;
        }
        let start = y as usize * self.meta.stride as usize;
        self.data.get(start..start + self.meta.width as usize)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("len", &self.data.len())
            .finish()
    }
}

/// What a consumer learned from one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The producer has not advanced since the previous read.
    Repeat,
    /// A frame not seen before; `missed` transfers were skipped in between.
    New { missed: u32 },
}

/// Consumer-side bookkeeping of the last sequence number seen on a stream.
#[derive(Debug, Default, Clone)]
pub struct FrameCursor {
    last: Option<SequenceNumber>,
    missed_total: u64,
    seen: u64,
}

impl FrameCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sequence: SequenceNumber) -> Observation {
        let observation = match self.last {
            Some(last) if last == sequence => return Observation::Repeat,
            Some(last) => Observation::New {
                missed: sequence.missed_since(last),
            },
            None => Observation::New { missed: 0 },
        };
        if let Observation::New { missed } = observation {
            self.missed_total += u64::from(missed);
        }
        self.seen += 1;
        self.last = Some(sequence);
        observation
    }

    pub fn last(&self) -> Option<SequenceNumber> {
        self.last
    }

    pub fn missed_total(&self) -> u64 {
        self.missed_total
    }

    /// Distinct frames observed.
    pub fn seen(&self) -> u64 {
        self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_stride_rounds_up_to_four() {
        let g = StreamGeometry::full(1246, 800);
        assert_eq!(g.stride, 1248);
        assert_eq!(g.byte_len(), 1248 * 800);

        assert_eq!(StreamGeometry::full(1280, 1).stride, 1280);
        assert_eq!(StreamGeometry::full(1, 1).stride, 4);
    }

    #[test]
    fn proxy_dimensions_round_up_to_blocks() {
        let g = StreamGeometry::proxy(1246, 800);
        assert_eq!((g.width, g.height, g.stride), (156, 100, 156));

        let g = StreamGeometry::proxy(7, 9);
        assert_eq!((g.width, g.height), (1, 2));
    }

    #[test]
    fn missed_since_counts_gap() {
        assert_eq!(SequenceNumber(15).missed_since(SequenceNumber(10)), 4);
        assert_eq!(SequenceNumber(11).missed_since(SequenceNumber(10)), 0);
        assert_eq!(SequenceNumber(10).missed_since(SequenceNumber(10)), 0);
        assert_eq!(SequenceNumber(1).missed_since(SequenceNumber(u32::MAX)), 1);
    }

    #[test]
    fn cursor_tracks_repeats_and_gaps() {
        let mut cursor = FrameCursor::new();
        assert_eq!(cursor.observe(SequenceNumber(5)), Observation::New { missed: 0 });
        assert_eq!(cursor.observe(SequenceNumber(5)), Observation::Repeat);
        assert_eq!(cursor.observe(SequenceNumber(9)), Observation::New { missed: 3 });
        assert_eq!(cursor.missed_total(), 3);
        assert_eq!(cursor.seen(), 2);
        assert_eq!(cursor.last(), Some(SequenceNumber(9)));
    }

    #[test]
    fn row_excludes_padding_and_stops_at_height() {
        let geometry = StreamGeometry::full(3, 2);
        let frame = Frame {
            data: Bytes::from(vec![1, 2, 3, 0, 4, 5, 6, 0]),
            meta: Arc::new(FrameMetadata {
                stream: Stream::Full,
                sequence: SequenceNumber(1),
                width: geometry.width,
                height: geometry.height,
                stride: geometry.stride,
            }),
            timestamp: Instant::now(),
        };
        assert_eq!(frame.row(0), Some(&[1, 2, 3][..]));
        assert_eq!(frame.row(1), Some(&[4, 5, 6][..]));
        assert_eq!(frame.row(2), None);
        assert_eq!(frame.row(u32::MAX), None);
    }
}
