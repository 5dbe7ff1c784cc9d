use crate::error::{Error, ErrorKind};

/// Number of chunks `len` bytes split into, `ceil(len / chunk_size)`.
///
/// # Panics
///
/// Panics if `chunk_size` is zero.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    assert!(chunk_size > 0, "chunk size must be positive");
    len / chunk_size + (len % chunk_size != 0) as usize
}

/// Splits `payload` into ordered chunks of `chunk_size` bytes. The last chunk holds
/// `len % chunk_size` bytes, or `chunk_size` if that's zero.
///
/// # Panics
///
/// Panics if `chunk_size` is zero.
pub fn split(payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    assert!(chunk_size > 0, "chunk size must be positive");
    payload.chunks(chunk_size).map(|c| c.to_vec()).collect()
}

/// Accumulates the packets of a frame up to a fixed capacity.
#[derive(Debug)]
pub(in crate) struct FrameBuffer {
    buf: Vec<u8>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity,
        }
    }

    /// Appends `packet`. Leaves the buffer untouched if the result wouldn't fit.
    pub fn push(&mut self, packet: &[u8]) -> Result<(), Error> {
        let len = self.buf.len() + packet.len();
        if len > self.capacity {
            return Err(Error::new(ErrorKind::FrameOverflow,
                format!("frame of {} bytes exceeds the limit of {} bytes", len, self.capacity)));
        }
        self.buf.extend_from_slice(packet);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunking_rule() {
        let payload: Vec<u8> = (0..60).collect();
        let chunks = split(&payload, 20);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 20));

        let payload: Vec<u8> = (0..61).collect();
        let chunks = split(&payload, 20);
        assert_eq!(chunks.len(), chunk_count(61, 20));
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].len(), 1);

        assert_eq!(chunk_count(0, 20), 0);
        assert_eq!(chunk_count(1, 20), 1);
    }

    #[test]
    fn chunk_count_of_huge_lengths() {
        assert_eq!(chunk_count(usize::MAX, 1), usize::MAX);
        assert_eq!(chunk_count(usize::MAX, 2), usize::MAX / 2 + 1);
        assert_eq!(chunk_count(usize::MAX - 1, usize::MAX), 1);
    }

    #[test]
    #[should_panic(expected = "chunk size must be positive")]
    fn zero_chunk_size_panics() {
        split(&[1, 2, 3], 0);
    }

    #[test]
    fn split_concat_restores_payload() {
        let payload: Vec<u8> = (0..=255).cycle().take(1000).collect();
        for chunk_size in &[1, 2, 3, 7, 20, 182, 244, 999, 1000, 1001] {
            let chunks = split(&payload, *chunk_size);
            assert_eq!(chunks.len(), chunk_count(payload.len(), *chunk_size), "{}", chunk_size);
            assert!(chunks.iter().all(|c| c.len() <= *chunk_size));
            assert_eq!(chunks.concat(), payload, "{}", chunk_size);
        }
    }

    #[test]
    fn buffer_overflow() {
        let mut b = FrameBuffer::new(4);
        b.push(&[1, 2]).unwrap();
        b.push(&[3, 4]).unwrap();
        let err = b.push(&[5]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FrameOverflow);
        assert_eq!(b.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(b.into_vec(), vec![1, 2, 3, 4]);
    }
}
