//! Frames: one logical publication as an ordered buffer sequence.

/// One publication. Buffer 0, when present, is a 4-byte little-endian length
/// prefix used by socket transports; the shared-memory channel carries only
/// the buffers after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    buffers: Vec<Vec<u8>>,
}

impl Frame {
    /// Build a frame from payload buffers, prepending the length prefix.
    pub fn message<I>(payloads: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let payloads: Vec<Vec<u8>> = payloads.into_iter().collect();
        let total: u32 = payloads.iter().map(|b| b.len() as u32).sum();

        let mut buffers = Vec::with_capacity(payloads.len() + 1);
        buffers.push(total.to_le_bytes().to_vec());
        buffers.extend(payloads);
        Self { buffers }
    }

    /// Wrap raw buffers as-is. The caller is responsible for the prefix
    /// convention.
    pub fn from_buffers(buffers: Vec<Vec<u8>>) -> Self {
        Self { buffers }
    }

    /// All buffers, prefix included.
    pub fn buffers(&self) -> &[Vec<u8>] {
        &self.buffers
    }

    /// The buffers that travel through the shared-memory channel: everything
    /// after the prefix.
    pub fn payload_buffers(&self) -> &[Vec<u8>] {
        if self.buffers.is_empty() {
            &[]
        } else {
            &self.buffers[1..]
        }
    }

    /// Logical frame size: the payload bytes, prefix excluded.
    pub fn payload_len(&self) -> usize {
        self.payload_buffers().iter().map(Vec::len).sum()
    }
}
