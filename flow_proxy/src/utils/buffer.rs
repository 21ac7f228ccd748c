use std::ops::{Deref, DerefMut};

const FRONT_MARGIN: usize = 64;

/// Owned byte region that can grow or shrink at either end.
///
/// Prefixing reuses the front margin when it is large enough, so a header can
/// be put in front of a payload without moving the payload.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
}

impl Buffer {
    /// `len` zeroed bytes.
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0; len],
            head: 0,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert_front(&mut self, bytes: &[u8]) {
        if self.head < bytes.len() {
            let mut data = Vec::with_capacity(FRONT_MARGIN + bytes.len() + self.len());
            data.resize(FRONT_MARGIN + bytes.len(), 0);
            data.extend_from_slice(&self.data[self.head..]);
            self.data = data;
            self.head = FRONT_MARGIN + bytes.len();
        }
        self.head -= bytes.len();
        self.data[self.head..self.head + bytes.len()].copy_from_slice(bytes);
    }

    pub fn shrink_front(&mut self, len: usize) {
        assert!(len <= self.len(), "shrinking past the end of the buffer");
        self.head += len;
    }

    pub fn insert_back(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn shrink_back(&mut self, len: usize) {
        assert!(len <= self.len(), "shrinking past the start of the buffer");
        self.data.truncate(self.data.len() - len);
    }

    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.data.truncate(self.head + len);
        }
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        if self.head > 0 {
            self.data.drain(..self.head);
        }
        self.data
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[self.head..]
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(value: Vec<u8>) -> Self {
        Self {
            data: value,
            head: 0,
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(value: &[u8]) -> Self {
        value.to_vec().into()
    }
}

impl<const N: usize> From<&[u8; N]> for Buffer {
    fn from(value: &[u8; N]) -> Self {
        value.to_vec().into()
    }
}

impl From<bytes::BytesMut> for Buffer {
    fn from(value: bytes::BytesMut) -> Self {
        Vec::from(value).into()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len()).finish()
    }
}
