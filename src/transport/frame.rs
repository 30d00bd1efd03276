//! Length-prefixed framing: `[u32 big-endian payload length][payload]`.

use crate::error::{Error, Result};

/// Width of the length prefix in bytes.
pub const LEN_PREFIX: usize = 4;

/// Prefix payload with its length.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::MalformedPacket(format!("payload too big: {}", payload.len())))?;

    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Accumulates stream bytes and cuts them into frames.
#[derive(Default, Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn payload_len(&self) -> Option<usize> {
        let prefix: [u8; LEN_PREFIX] = self.buf.get(..LEN_PREFIX)?.try_into().ok()?;
        Some(u32::from_be_bytes(prefix) as usize)
    }

    /// True if the buffer holds at least one complete frame.
    pub fn has_frame(&self) -> bool {
        self.payload_len()
            .map(|len| self.buf.len() >= LEN_PREFIX + len)
            .unwrap_or(false)
    }

    /// Take payload of the first complete frame.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if !self.has_frame() {
            return None;
        }
        let len = self.payload_len()?;
        let payload = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..LEN_PREFIX + len);
        Some(payload)
    }

    /// Count of buffered bytes that do not form a complete frame yet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode_prefix() {
        let frame = encode(b"hello").unwrap();
        assert_eq!(&frame[..LEN_PREFIX], &[0, 0, 0, 5]);
        assert_eq!(&frame[LEN_PREFIX..], b"hello");

        let frame = encode(b"").unwrap();
        assert_eq!(frame, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_frames_split_across_reads() {
        let mut stream = encode(b"first").unwrap();
        stream.extend(encode(b"").unwrap());
        stream.extend(encode(b"third frame").unwrap());

        let mut buffer = FrameBuffer::default();
        let mut frames = vec![];
        for byte in stream {
            buffer.extend(&[byte]);
            while let Some(frame) = buffer.next_frame() {
                frames.push(frame);
            }
        }

        assert_eq!(
            frames,
            vec![b"first".to_vec(), b"".to_vec(), b"third frame".to_vec()]
        );
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_incomplete_frame() {
        struct TestCase {
            bytes: Vec<u8>,
            has_frame: bool,
        }

        let cases = [
            TestCase {
                bytes: vec![],
                has_frame: false,
            },
            TestCase {
                bytes: vec![0, 0],
                has_frame: false,
            },
            TestCase {
                bytes: vec![0, 0, 0, 3, b'a', b'b'],
                has_frame: false,
            },
            TestCase {
                bytes: vec![0, 0, 0, 3, b'a', b'b', b'c'],
                has_frame: true,
            },
        ];

        for tc in cases {
            let mut buffer = FrameBuffer::default();
            buffer.extend(&tc.bytes);
            assert_eq!(buffer.has_frame(), tc.has_frame);
            assert_eq!(buffer.next_frame().is_some(), tc.has_frame);
        }
    }
}
