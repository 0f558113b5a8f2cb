//! In-band demultiplexer separating synchronous reply bytes from async frames.
//!
//! Controllers push unsolicited binary blocks on the same socket used for
//! command replies. Each block starts with a fixed 4-byte mark, followed by an
//! 8-byte header (packed length/frame number, checksum) and `length * 2` bytes
//! of payload. Everything else belongs to the synchronous stream.

use bytes::{Bytes, BytesMut};

/// Async frame signature, as a little-endian word.
pub const ASYNC_SIGNATURE: u32 = 0xbebe_cafe;

/// Number of bits the frame number is shifted by in the packed length word.
pub const FRAME_NUMBER_SHIFT: u32 = 24;

const LENGTH_MASK: u32 = (1 << FRAME_NUMBER_SHIFT) - 1;
const SIGNATURE_BYTES: [u8; 4] = ASYNC_SIGNATURE.to_le_bytes();
const HEADER_LEN: usize = 8;

/// One decoded asynchronous frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncFrame {
    /// Frame counter (top 8 bits of the packed word).
    pub frame_number: u8,
    /// Payload length in 16-bit words (low 24 bits of the packed word).
    pub length_words: u32,
    /// Checksum announced by the sender.
    pub checksum: u32,
    /// Raw payload, `length_words * 2` bytes.
    pub payload: Bytes,
}

impl AsyncFrame {
    /// Sum of the little-endian 16-bit payload words, truncated to 32 bits.
    pub fn computed_checksum(&self) -> u32 {
        self.payload
            .chunks_exact(2)
            .fold(0u32, |acc, w| acc.wrapping_add(u32::from(u16::from_le_bytes([w[0], w[1]]))))
    }

    /// Whether the announced checksum matches the payload.
    pub fn checksum_matches(&self) -> bool {
        self.computed_checksum() == self.checksum
    }

    /// Encode the frame the way a controller puts it on the wire.
    pub fn to_wire(&self) -> Vec<u8> {
        let packed = (self.length_words & LENGTH_MASK) | (u32::from(self.frame_number) << FRAME_NUMBER_SHIFT);
        let mut out = Vec::with_capacity(12 + self.payload.len());
        out.extend_from_slice(&SIGNATURE_BYTES);
        out.extend_from_slice(&packed.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Build a frame around `payload` with a correct checksum.
    ///
    /// An odd trailing byte is padded with zero.
    pub fn new(frame_number: u8, payload: &[u8]) -> Self {
        let mut data = payload.to_vec();
        if data.len() % 2 == 1 {
            data.push(0);
        }
        let mut frame = Self {
            frame_number,
            length_words: (data.len() / 2) as u32,
            checksum: 0,
            payload: Bytes::from(data),
        };
        frame.checksum = frame.computed_checksum();
        frame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Scanning for the signature; holds the number of bytes matched so far.
    Normal(usize),
    /// Collecting the 8 header bytes.
    Header,
    /// Collecting payload bytes.
    Payload,
}

/// Byte-level state machine run by the channel's receiver task.
///
/// Bytes that partially matched the signature are flushed unmodified into the
/// synchronous stream as soon as the match fails, so no byte is ever dropped
/// or duplicated.
#[derive(Debug)]
pub struct FrameDemux {
    state: State,
    header: [u8; HEADER_LEN],
    header_len: usize,
    frame_number: u8,
    length_words: u32,
    checksum: u32,
    payload: BytesMut,
    expected: usize,
}

impl Default for FrameDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDemux {
    /// Create a demultiplexer in the scanning state.
    pub fn new() -> Self {
        Self {
            state: State::Normal(0),
            header: [0; HEADER_LEN],
            header_len: 0,
            frame_number: 0,
            length_words: 0,
            checksum: 0,
            payload: BytesMut::new(),
            expected: 0,
        }
    }

    /// Whether the demultiplexer is mid-frame or holds a partial signature.
    pub fn is_idle(&self) -> bool {
        self.state == State::Normal(0)
    }

    /// Feed one chunk of inbound bytes.
    ///
    /// Synchronous bytes are appended to `sync_out` in arrival order and
    /// completed frames to `frames`.
    pub fn feed(&mut self, chunk: &[u8], sync_out: &mut Vec<u8>, frames: &mut Vec<AsyncFrame>) {
        let mut i = 0;
        while i < chunk.len() {
            match self.state {
                State::Normal(matched) => {
                    let byte = chunk[i];
                    i += 1;
                    if byte == SIGNATURE_BYTES[matched] {
                        if matched + 1 == SIGNATURE_BYTES.len() {
                            self.state = State::Header;
                            self.header_len = 0;
                        } else {
                            self.state = State::Normal(matched + 1);
                        }
                        continue;
                    }
                    // The signature has no proper prefix that is also a suffix,
                    // so only the current byte can restart a match.
                    sync_out.extend_from_slice(&SIGNATURE_BYTES[..matched]);
                    if byte == SIGNATURE_BYTES[0] {
                        self.state = State::Normal(1);
                    } else {
                        sync_out.push(byte);
                        self.state = State::Normal(0);
                    }
                }
                State::Header => {
                    let take = (HEADER_LEN - self.header_len).min(chunk.len() - i);
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&chunk[i..i + take]);
                    self.header_len += take;
                    i += take;
                    if self.header_len == HEADER_LEN {
                        self.start_payload(frames);
                    }
                }
                State::Payload => {
                    let take = (self.expected - self.payload.len()).min(chunk.len() - i);
                    self.payload.extend_from_slice(&chunk[i..i + take]);
                    i += take;
                    if self.payload.len() == self.expected {
                        self.emit(frames);
                    }
                }
            }
        }
    }

    fn start_payload(&mut self, frames: &mut Vec<AsyncFrame>) {
        let packed = u32::from_le_bytes([self.header[0], self.header[1], self.header[2], self.header[3]]);
        self.checksum = u32::from_le_bytes([self.header[4], self.header[5], self.header[6], self.header[7]]);
        self.length_words = packed & LENGTH_MASK;
        self.frame_number = (packed >> FRAME_NUMBER_SHIFT) as u8;
        self.expected = self.length_words as usize * 2;
        self.payload = BytesMut::with_capacity(self.expected);
        tracing::trace!(
            frame = self.frame_number,
            words = self.length_words,
            checksum = format_args!("0x{:08x}", self.checksum),
            "async frame header"
        );
        if self.expected == 0 {
            self.emit(frames);
        } else {
            self.state = State::Payload;
        }
    }

    fn emit(&mut self, frames: &mut Vec<AsyncFrame>) {
        frames.push(AsyncFrame {
            frame_number: self.frame_number,
            length_words: self.length_words,
            checksum: self.checksum,
            payload: std::mem::take(&mut self.payload).freeze(),
        });
        self.state = State::Normal(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&[u8]]) -> (Vec<u8>, Vec<AsyncFrame>) {
        let mut demux = FrameDemux::new();
        let mut sync = Vec::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            demux.feed(chunk, &mut sync, &mut frames);
        }
        (sync, frames)
    }

    #[test]
    fn plain_text_passes_through() {
        let (sync, frames) = run(&[b"?POS 12\n"]);
        assert_eq!(sync, b"?POS 12\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn frame_between_replies_is_removed() {
        let frame = AsyncFrame::new(7, &[1, 2, 3, 4]);
        let mut stream = b"?FPOS 1\n".to_vec();
        stream.extend(frame.to_wire());
        stream.extend_from_slice(b"?FPOS 2\n");

        let (sync, frames) = run(&[&stream]);
        assert_eq!(sync, b"?FPOS 1\n?FPOS 2\n");
        assert_eq!(frames, vec![frame.clone()]);
        assert_eq!(frames[0].frame_number, 7);
        assert!(frames[0].checksum_matches());
    }

    #[test]
    fn partial_signature_is_flushed() {
        // FE CA BE then a mismatch, then a full restart on FE
        let mut stream = vec![b'a', 0xfe, 0xca, 0xbe, b'b', 0xfe, 0xfe];
        stream.push(b'c');
        let (sync, frames) = run(&[&stream[..2], &stream[2..5], &stream[5..]]);
        assert_eq!(sync, stream);
        assert!(frames.is_empty());
    }

    #[test]
    fn zero_length_frame_is_emitted_immediately() {
        let frame = AsyncFrame::new(3, &[]);
        let (sync, frames) = run(&[&frame.to_wire()]);
        assert!(sync.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].length_words, 0);
    }

    #[test]
    fn byte_by_byte_delivery() {
        let frame = AsyncFrame::new(255, b"abcdef");
        let mut stream = b"OK\n".to_vec();
        stream.extend(frame.to_wire());
        let chunks: Vec<&[u8]> = stream.chunks(1).collect();
        let (sync, frames) = run(&chunks);
        assert_eq!(sync, b"OK\n");
        assert_eq!(frames, vec![frame]);
    }
}
