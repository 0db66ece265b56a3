//! Byte queue sitting between a stream's producer and its device.
//!
//! The queue tracks a read index (what the device consumed) and a write index
//! (what was rendered). Gaps opened by seeking forward read back as silence.
//! A bounded history before the read index is retained so rendered data can be
//! rewound and played again.

use thiserror::Error;

/// Push would exceed the queue's maximum length
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("render queue full: {length} + {pushed} bytes exceeds {max_length}")]
pub struct QueueFull {
    /// Bytes queued before the push
    pub length: usize,
    /// Bytes the push tried to add
    pub pushed: usize,
    /// Configured limit
    pub max_length: usize,
}

/// Render queue with seek, rewind and silence fill
#[derive(Debug, Clone)]
pub struct RenderQueue {
    data: Vec<u8>,
    base: i64,
    read_index: i64,
    write_index: i64,
    max_length: usize,
    max_rewind: usize,
    silence: u8,
}

impl RenderQueue {
    /// Empty queue
    ///
    /// `max_rewind` bytes of already-read data are kept for rewinding;
    /// `silence` is the byte used to fill gaps.
    pub fn new(max_length: usize, max_rewind: usize, silence: u8) -> Self {
        Self {
            data: Vec::new(),
            base: 0,
            read_index: 0,
            write_index: 0,
            max_length,
            max_rewind,
            silence,
        }
    }

    fn end(&self) -> i64 {
        self.base + self.data.len() as i64
    }

    /// Bytes between read and write index
    pub fn length(&self) -> usize {
        (self.write_index - self.read_index).max(0) as usize
    }

    /// Whether any data can be peeked
    pub fn is_readable(&self) -> bool {
        self.length() > 0
    }

    /// Absolute read position
    pub fn read_index(&self) -> i64 {
        self.read_index
    }

    /// Absolute write position
    pub fn write_index(&self) -> i64 {
        self.write_index
    }

    /// History retained for rewinds
    pub fn max_rewind(&self) -> usize {
        self.max_rewind
    }

    /// Change the retained history
    pub fn set_max_rewind(&mut self, max_rewind: usize) {
        self.max_rewind = max_rewind;
        self.trim_history();
    }

    /// Change the maximum queued length
    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = max_length;
    }

    /// Byte used for silence
    pub fn silence_byte(&self) -> u8 {
        self.silence
    }

    /// Append at the write index, overwriting anything past it.
    ///
    /// # Errors
    /// Returns [`QueueFull`] when the queued length would exceed the maximum.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), QueueFull> {
        let length = self.length();
        if length + chunk.len() > self.max_length {
            return Err(QueueFull {
                length,
                pushed: chunk.len(),
                max_length: self.max_length,
            });
        }

        self.truncate_at(self.write_index);
        self.data.extend_from_slice(chunk);
        self.write_index += chunk.len() as i64;
        Ok(())
    }

    /// Move the write index. Forward seeks leave silence behind, backward
    /// seeks discard what was rendered past the new position.
    pub fn seek(&mut self, offset: i64) {
        let target = self.write_index + offset;
        if offset >= 0 {
            self.truncate_at(self.write_index);
            let fill = (target - self.end()).max(0) as usize;
            self.data.resize(self.data.len() + fill, self.silence);
        } else {
            self.truncate_at(target);
        }
        self.write_index = target;
    }

    fn truncate_at(&mut self, index: i64) {
        if index <= self.base {
            self.data.clear();
            self.base = index;
            return;
        }
        let keep = (index - self.base) as usize;
        if keep < self.data.len() {
            self.data.truncate(keep);
        } else if keep > self.data.len() {
            self.data.resize(keep, self.silence);
        }
    }

    /// Readable bytes at the read index, at most `max`
    pub fn peek(&self, max: usize) -> Option<&[u8]> {
        let length = self.length().min(max);
        if length == 0 || self.read_index < self.base {
            return None;
        }
        let start = (self.read_index - self.base) as usize;
        let end = (start + length).min(self.data.len());
        (start < end).then(|| &self.data[start..end])
    }

    /// Advance the read index
    pub fn drop_bytes(&mut self, nbytes: usize) {
        self.read_index += nbytes as i64;
        self.trim_history();
    }

    /// Move the read index back so `nbytes` are played again
    pub fn rewind(&mut self, nbytes: usize) {
        self.read_index -= nbytes as i64;
        if self.read_index < self.base {
            let missing = (self.base - self.read_index) as usize;
            let mut front = vec![self.silence; missing];
            front.append(&mut self.data);
            self.data = front;
            self.base = self.read_index;
        }
    }

    /// Discard everything not yet read, pulling the write index back to the
    /// read index
    pub fn flush_write(&mut self) {
        self.write_index = self.read_index;
        self.truncate_at(self.write_index);
    }

    /// Skip everything queued
    pub fn flush_read(&mut self) {
        self.read_index = self.write_index;
        self.trim_history();
    }

    /// Replace queued data with silence, keeping the length
    pub fn silence(&mut self) {
        let start = (self.read_index - self.base).max(0) as usize;
        let end = ((self.write_index - self.base).max(0) as usize).min(self.data.len());
        if start < end {
            self.data[start..end].fill(self.silence);
        }
    }

    fn trim_history(&mut self) {
        let keep_from = self.read_index.min(self.write_index) - self.max_rewind as i64;
        if keep_from > self.base {
            let n = ((keep_from - self.base) as usize).min(self.data.len());
            self.data.drain(..n);
            self.base += n as i64;
        }
        if self.data.is_empty() && self.base < self.write_index {
            self.base = self.write_index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_peek_drop() {
        let mut q = RenderQueue::new(1024, 0, 0);
        q.push(&[1, 2, 3, 4]).unwrap();
        assert_eq!(q.length(), 4);
        assert_eq!(q.peek(2), Some(&[1, 2][..]));
        q.drop_bytes(2);
        assert_eq!(q.peek(16), Some(&[3, 4][..]));
        q.drop_bytes(2);
        assert!(!q.is_readable());
    }

    #[test]
    fn forward_seek_reads_silence() {
        let mut q = RenderQueue::new(1024, 0, 0x80);
        q.seek(3);
        q.push(&[7]).unwrap();
        assert_eq!(q.peek(16), Some(&[0x80, 0x80, 0x80, 7][..]));
    }

    #[test]
    fn backward_seek_discards_rendered_tail() {
        let mut q = RenderQueue::new(1024, 0, 0);
        q.push(&[1, 2, 3, 4]).unwrap();
        q.seek(-2);
        assert_eq!(q.length(), 2);
        q.push(&[9]).unwrap();
        assert_eq!(q.peek(16), Some(&[1, 2, 9][..]));
    }

    #[test]
    fn rewind_replays_history() {
        let mut q = RenderQueue::new(1024, 4, 0);
        q.push(&[1, 2, 3, 4, 5, 6]).unwrap();
        q.drop_bytes(6);
        q.rewind(3);
        assert_eq!(q.peek(16), Some(&[4, 5, 6][..]));
    }

    #[test]
    fn rewind_beyond_history_yields_silence() {
        let mut q = RenderQueue::new(1024, 1, 0);
        q.push(&[1, 2, 3]).unwrap();
        q.drop_bytes(3);
        q.rewind(3);
        assert_eq!(q.peek(16), Some(&[0, 0, 3][..]));
    }

    #[test]
    fn push_respects_max_length() {
        let mut q = RenderQueue::new(4, 0, 0);
        q.push(&[1, 2, 3]).unwrap();
        let err = q.push(&[4, 5]).unwrap_err();
        assert_eq!(err.length, 3);
        assert_eq!(q.length(), 3);
    }

    #[test]
    fn flush_and_silence() {
        let mut q = RenderQueue::new(1024, 0, 0);
        q.push(&[1, 2, 3]).unwrap();
        q.silence();
        assert_eq!(q.peek(16), Some(&[0, 0, 0][..]));
        q.flush_write();
        assert_eq!(q.length(), 0);
        q.push(&[5]).unwrap();
        q.flush_read();
        assert!(!q.is_readable());
    }
}
