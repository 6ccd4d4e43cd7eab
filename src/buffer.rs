//! Owned message buffers.
//!
//! A [`Buffer`] is moved from the reading side through the router into the
//! write queue of the other side; no two stages ever share one.
//! File descriptors travel inside the buffer and move with it.

use std::os::unix::io::OwnedFd;

#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    /// Bytes filled (while reading) or already sent (while writing).
    pos: usize,
    fds: Vec<OwnedFd>,
    send_credentials: bool,
}

impl Buffer {
    /// Zeroed buffer of exactly `size` bytes, cursor at the start.
    pub fn with_size(size: usize) -> Self {
        Self {
            data: vec![0; size],
            ..Self::default()
        }
    }

    /// Buffer holding `data`, ready to be written from the start.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// The part after the cursor.
    #[inline]
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    #[inline]
    pub fn remaining_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.pos..]
    }

    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.pos == self.data.len()
    }

    /// Reset the cursor so a filled buffer can be written out.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    pub fn attach_fds(&mut self, fds: Vec<OwnedFd>) {
        self.fds.extend(fds);
    }

    /// Move the attached fds out; they are closed when the caller drops them.
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    pub fn send_credentials(&self) -> bool {
        self.send_credentials
    }

    pub fn set_send_credentials(&mut self, value: bool) {
        self.send_credentials = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_is_clamped() {
        let mut buf = Buffer::with_size(4);
        buf.advance(3);
        assert_eq!(buf.remaining().len(), 1);
        buf.advance(10);
        assert!(buf.is_complete());
        buf.rewind();
        assert_eq!(buf.remaining().len(), 4);
    }
}
