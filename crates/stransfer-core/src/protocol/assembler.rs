//! Frame assembly from a byte stream.
//!
//! Serial reads hand back arbitrary slices of the stream: half a frame, two
//! frames, or line noise before the next magic marker. The assembler
//! buffers bytes and extracts complete frames:
//! - garbage before a magic marker is skipped
//! - a frame that fails its checksum is dropped as a whole
//! - a header with an impossible length drops one byte and resynchronises
//! - a header that claims more bytes than arrived is skipped when a complete
//!   frame already follows it

use tracing::trace;

use super::frame::{HEADER_LEN, MAGIC};
use super::{FrameCodec, FrameError};
use crate::record::{GlobalRecord, PackageRecord};

/// Buffer that turns stream chunks into decoded frames
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    codec: FrameCodec,
    buffer: Vec<u8>,
    discarded: usize,
}

impl FrameAssembler {
    /// Create an empty assembler using `codec` for decoding
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buffer: Vec::with_capacity(1024),
            discarded: 0,
        }
    }

    /// Append bytes read from the transport
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes waiting to be decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes skipped while resynchronising
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Try to extract the next frame.
    ///
    /// Returns:
    /// - `Some(Ok(..))` for a complete, valid frame
    /// - `Some(Err(..))` for a damaged frame (already removed from the buffer)
    /// - `None` if more bytes are needed
    pub fn next_frame(&mut self) -> Option<Result<(GlobalRecord, PackageRecord), FrameError>> {
        self.sync_to_magic();
        if self.buffer.is_empty() {
            return None;
        }

        match self.codec.decode_with_len(&self.buffer) {
            Ok((global, package, consumed)) => {
                self.buffer.drain(..consumed);
                Some(Ok((global, package)))
            }
            Err(FrameError::Truncated { .. }) => self.frame_after_stall(),
            Err(err) => {
                let skip = self.codec.frame_len(&self.buffer).unwrap_or(1);
                trace!("assembler: dropping {} bytes after {}", skip, err);
                self.drop_front(skip);
                Some(Err(err))
            }
        }
    }

    /// The error describing a partially received frame, if any
    ///
    /// Only a complete header counts; a stray marker byte is not a frame.
    pub fn pending_error(&self) -> Option<FrameError> {
        if self.buffer.len() < HEADER_LEN {
            return None;
        }
        match self.codec.frame_len(&self.buffer) {
            Err(err @ FrameError::Truncated { .. }) => Some(err),
            _ => None,
        }
    }

    /// Give up on a stalled partial frame so the next marker can be found
    pub fn skip_stalled(&mut self) {
        if !self.buffer.is_empty() {
            self.drop_front(1);
        }
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.discarded += self.buffer.len();
        self.buffer.clear();
    }

    /// Look past a stalled header for a complete frame
    fn frame_after_stall(&mut self) -> Option<Result<(GlobalRecord, PackageRecord), FrameError>> {
        let mut offset = 1;
        while let Some(pos) = self.buffer[offset..]
            .windows(MAGIC.len())
            .position(|window| window == MAGIC)
        {
            let start = offset + pos;
            if let Ok((global, package, consumed)) = self.codec.decode_with_len(&self.buffer[start..])
            {
                trace!("assembler: skipped {} bytes of stalled header", start);
                self.drop_front(start);
                self.buffer.drain(..consumed);
                return Some(Ok((global, package)));
            }
            offset = start + 1;
        }
        None
    }

    fn drop_front(&mut self, count: usize) {
        let count = count.min(self.buffer.len());
        self.buffer.drain(..count);
        self.discarded += count;
    }

    fn sync_to_magic(&mut self) {
        let found = self
            .buffer
            .windows(MAGIC.len())
            .position(|window| window == MAGIC);

        match found {
            Some(0) => {}
            Some(pos) => {
                trace!("assembler: skipped {} bytes of noise", pos);
                self.drop_front(pos);
            }
            None => {
                // A trailing first marker byte may be the start of the next frame
                let keep = usize::from(self.buffer.last() == Some(&MAGIC[0]));
                let noise = self.buffer.len() - keep;
                self.drop_front(noise);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameSection;

    fn frame(sequence: u32, payload: &[u8]) -> (GlobalRecord, PackageRecord, Vec<u8>) {
        let package = PackageRecord::from(payload);
        let global = GlobalRecord::for_package(1, 0, 0, sequence, &package);
        let bytes = FrameCodec::default().encode(&global, &package).unwrap();
        (global, package, bytes)
    }

    #[test]
    fn test_reassembles_fragmented_frame() {
        let (global, package, bytes) = frame(1, b"hello");
        let mut assembler = FrameAssembler::new(FrameCodec::default());

        for chunk in bytes.chunks(3) {
            assert!(assembler.next_frame().is_none());
            assembler.push(chunk);
        }

        let (g, p) = assembler.next_frame().unwrap().unwrap();
        assert_eq!(g, global);
        assert_eq!(p, package);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_skips_leading_noise() {
        let (global, _, bytes) = frame(2, b"abc");
        let mut assembler = FrameAssembler::new(FrameCodec::default());
        assembler.push(&[0x00, 0xA5, 0x11, 0xFF]);
        assembler.push(&bytes);

        let (g, _) = assembler.next_frame().unwrap().unwrap();
        assert_eq!(g, global);
        assert_eq!(assembler.discarded(), 4);
    }

    #[test]
    fn test_drops_damaged_frame_and_recovers() {
        let (_, _, mut damaged) = frame(1, b"first");
        let last = damaged.len() - 6;
        damaged[last] ^= 0xFF;
        let (global, _, good) = frame(2, b"second");

        let mut assembler = FrameAssembler::new(FrameCodec::default());
        assembler.push(&damaged);
        assembler.push(&good);

        assert!(matches!(
            assembler.next_frame(),
            Some(Err(FrameError::ChecksumMismatch {
                section: FrameSection::Package,
                ..
            }))
        ));
        let (g, _) = assembler.next_frame().unwrap().unwrap();
        assert_eq!(g, global);
    }

    #[test]
    fn test_pending_error_reports_truncation() {
        let (_, _, bytes) = frame(1, b"partial");
        let mut assembler = FrameAssembler::new(FrameCodec::default());
        assembler.push(&bytes[..10]);
        assert!(assembler.next_frame().is_none());
        assert!(matches!(
            assembler.pending_error(),
            Some(FrameError::Truncated { .. })
        ));

        assembler.skip_stalled();
        assert!(assembler.next_frame().is_none());
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_impossible_length_drops_one_byte() {
        let (global, _, good) = frame(3, b"after");
        let mut assembler = FrameAssembler::new(FrameCodec::default());
        assembler.push(&[0xA5, 0x5A, 0xFF, 0xFF, 0xFF, 0xFF]);
        assembler.push(&good);

        assert!(matches!(
            assembler.next_frame(),
            Some(Err(FrameError::MalformedLength(_)))
        ));
        assert_eq!(assembler.discarded(), 1);

        let (g, _) = assembler.next_frame().unwrap().unwrap();
        assert_eq!(g, global);
        assert_eq!(assembler.discarded(), 6);
        assert!(assembler.next_frame().is_none());
    }

    #[test]
    fn test_stalled_header_does_not_hide_frame() {
        let (global, package, good) = frame(4, &[0x33; 16]);
        let mut assembler = FrameAssembler::new(FrameCodec::default());
        // Marker and a plausible 256-byte length, then nothing of that frame
        assembler.push(&[0xA5, 0x5A, 0x00, 0x00, 0x01, 0x00]);
        assembler.push(&good);

        let (g, p) = assembler.next_frame().unwrap().unwrap();
        assert_eq!(g, global);
        assert_eq!(p, package);
        assert_eq!(assembler.discarded(), 6);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_stray_marker_byte_is_not_pending() {
        let mut assembler = FrameAssembler::new(FrameCodec::default());
        assembler.push(&[0x00, 0xA5]);
        assert!(assembler.next_frame().is_none());
        assert_eq!(assembler.buffered(), 1);
        assert_eq!(assembler.pending_error(), None);
    }

    #[test]
    fn test_clear_discards_buffer() {
        let (_, _, bytes) = frame(5, b"dropped");
        let mut assembler = FrameAssembler::new(FrameCodec::default());
        assembler.push(&bytes[..12]);
        assembler.clear();
        assert_eq!(assembler.buffered(), 0);
        assert_eq!(assembler.discarded(), 12);
        assert!(assembler.next_frame().is_none());
    }
}
