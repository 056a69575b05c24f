//! Bounded in-memory pipe between an export producer and a chunk reader
//!
//! The writer buffers bytes into blocks and sends each block over a bounded
//! channel, so a slow reader stalls the producer once `capacity` blocks are
//! queued. Dropping the writer ends the stream. The reader pulls with a
//! deadline and returns whatever it has when the deadline passes.

use std::io::{self, Write};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

/// Create a pipe holding at most `capacity` blocks of `block_size` bytes
pub fn pipe(capacity: usize, block_size: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (
        PipeWriter {
            tx: Some(tx),
            buf: Vec::with_capacity(block_size),
            block_size: block_size.max(1),
        },
        PipeReader {
            rx,
            pending: Vec::new(),
            pos: 0,
            closed: false,
        },
    )
}

pub struct PipeWriter {
    tx: Option<Sender<Vec<u8>>>,
    buf: Vec<u8>,
    block_size: usize,
}

impl PipeWriter {
    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(&mut self.buf, Vec::with_capacity(self.block_size));
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe writer closed"))?;
        tx.send(block)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "download reader went away"))
    }

    /// Send buffered bytes and end the stream
    pub fn close(mut self) -> io::Result<()> {
        let result = self.send_buffered();
        self.tx = None;
        result
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.block_size - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= self.block_size {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let _ = self.send_buffered();
    }
}

/// Bytes returned by one [`PipeReader::read_chunk`] call
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    /// The writer is gone and every byte has been returned
    pub eof: bool,
}

pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
    closed: bool,
}

impl PipeReader {
    /// Read up to `max` bytes, waiting no later than `deadline`
    ///
    /// A deadline that passes returns what was read so far (possibly
    /// nothing) without ending the stream.
    pub fn read_chunk(&mut self, max: usize, deadline: Instant) -> Chunk {
        let mut data = Vec::with_capacity(max.min(64 * 1024));
        while data.len() < max {
            if self.pos < self.pending.len() {
                let n = (max - data.len()).min(self.pending.len() - self.pos);
                data.extend_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                continue;
            }
            if self.closed {
                break;
            }
            match self.rx.recv_deadline(deadline) {
                Ok(block) => {
                    self.pending = block;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => self.closed = true,
            }
        }

        let eof = self.closed && self.pos >= self.pending.len();
        Chunk { data, eof }
    }

    pub fn is_eof(&self) -> bool {
        self.closed && self.pos >= self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn test_reads_across_blocks_then_eof() {
        let (mut writer, mut reader) = pipe(4, 3);
        writer.write_all(b"abcdefgh").unwrap();
        writer.close().unwrap();

        let first = reader.read_chunk(5, soon(100));
        assert_eq!(first.data, b"abcde");
        assert!(!first.eof);

        let rest = reader.read_chunk(5, soon(100));
        assert_eq!(rest.data, b"fgh");
        assert!(rest.eof);

        let end = reader.read_chunk(5, soon(100));
        assert!(end.data.is_empty());
        assert!(end.eof);
    }

    #[test]
    fn test_timeout_returns_partial_chunk() {
        let (mut writer, mut reader) = pipe(4, 2);
        writer.write_all(b"xy").unwrap();

        let chunk = reader.read_chunk(10, soon(50));
        assert_eq!(chunk.data, b"xy");
        assert!(!chunk.eof);

        let empty = reader.read_chunk(10, soon(20));
        assert!(empty.data.is_empty());
        assert!(!empty.eof);
        drop(writer);
        assert!(reader.read_chunk(10, soon(50)).eof);
    }

    #[test]
    fn test_flush_sends_partial_block() {
        let (mut writer, mut reader) = pipe(4, 1024);
        writer.write_all(b"hello").unwrap();
        writer.flush().unwrap();
        assert_eq!(reader.read_chunk(1024, soon(50)).data, b"hello");
    }

    #[test]
    fn test_backpressure_blocks_writer() {
        let (mut writer, mut reader) = pipe(1, 1);
        let producer = thread::spawn(move || {
            writer.write_all(b"abc").unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        let mut collected = Vec::new();
        while collected.len() < 3 {
            collected.extend(reader.read_chunk(3, soon(500)).data);
        }
        producer.join().unwrap();
        assert_eq!(collected, b"abc");
    }

    #[test]
    fn test_writer_fails_when_reader_dropped() {
        let (mut writer, reader) = pipe(1, 1);
        drop(reader);
        let err = writer.write_all(b"a").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
