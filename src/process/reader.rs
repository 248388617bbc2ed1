//! Stream readers.
//!
//! Each piped stream gets a reader thread that pushes chunks into one
//! channel, so stdout and stderr are drained together and a full pipe on
//! one side can never stall the other. The consumer waits on the channel
//! with a deadline instead of polling.

use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Instant;

use tracing::{debug, trace};

use super::PipeReader;
use crate::command::StreamKind;
use crate::error::{Error, Result};

/// Default read chunk size.
pub const READ_BUFFER_SIZE: usize = 4096;

/// How many extra bytes to pull in when a chunk ends inside a UTF-8
/// sequence.
const MAX_EXTRA_BYTES: usize = 3;

/// Read from `reader`, retrying on `Interrupted` and treating `EIO` from a
/// closed PTY as end of stream.
pub(crate) fn read_retrying<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
            Err(e) => return Err(e),
        }
    }
}

/// Read up to `buf_size` bytes and decode them as UTF-8.
///
/// A chunk may end in the middle of a multi-byte character. In that case
/// up to three more bytes are read one at a time until the text decodes.
/// Returns `Ok(None)` at end of stream and [`Error::Decode`] for data that
/// is not UTF-8.
pub fn read_decode_safely<R: Read + ?Sized>(reader: &mut R, buf_size: usize) -> Result<Option<String>> {
    let mut data = vec![0u8; buf_size.max(1)];
    let n = read_retrying(reader, &mut data)?;
    if n == 0 {
        return Ok(None);
    }
    data.truncate(n);

    let mut extra = 0;
    loop {
        match std::str::from_utf8(&data) {
            Ok(_) => break,
            Err(e) if e.error_len().is_none() && extra < MAX_EXTRA_BYTES => {
                let mut byte = [0u8; 1];
                if read_retrying(reader, &mut byte)? == 0 {
                    return Err(Error::Decode(format!("stream ended inside a character: {}", e)));
                }
                data.push(byte[0]);
                extra += 1;
            }
            Err(e) => return Err(Error::Decode(e.to_string())),
        }
    }

    String::from_utf8(data)
        .map(Some)
        .map_err(|e| Error::Decode(e.to_string()))
}

/// Decodes raw chunks whose boundaries may fall inside a character. The
/// incomplete tail of one chunk is carried over to the next.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    tail: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, bytes: &[u8]) -> Result<String> {
        self.tail.extend_from_slice(bytes);
        let complete = match std::str::from_utf8(&self.tail) {
            Ok(_) => self.tail.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => return Err(Error::Decode(e.to_string())),
        };
        let rest = self.tail.split_off(complete);
        let text = std::mem::replace(&mut self.tail, rest);
        String::from_utf8(text).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Fails if the stream ended inside a character.
    pub fn finish(&mut self) -> Result<()> {
        if self.tail.is_empty() {
            return Ok(());
        }
        let len = std::mem::take(&mut self.tail).len();
        Err(Error::Decode(format!("stream ended inside a character ({} bytes left)", len)))
    }
}

/// Splits decoded text into lines, holding back a trailing partial line.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Append text and return every line it completes, without line endings.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.pending.push_str(text);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// The unterminated remainder, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// How reader threads treat the bytes they read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// Pass bytes through untouched.
    Raw,
    /// Decode as UTF-8 (see [`read_decode_safely`]).
    Decoded,
}

/// Something a reader thread observed.
#[derive(Debug)]
pub(crate) enum Event {
    Data {
        kind: StreamKind,
        bytes: Vec<u8>,
        /// Set when the reader decoded the chunk itself.
        text: Option<String>,
    },
    Failed(Error),
}

impl Event {
    /// The text of a data event, decoding raw bytes through `decoder`.
    pub fn into_text(self, decoder: &mut Utf8Decoder) -> Result<(StreamKind, String)> {
        match self {
            Event::Data { kind, text: Some(text), .. } => Ok((kind, text)),
            Event::Data { kind, bytes, text: None } => Ok((kind, decoder.push(&bytes)?)),
            Event::Failed(error) => Err(error),
        }
    }
}

enum Message {
    Data {
        index: usize,
        bytes: Vec<u8>,
        text: Option<String>,
    },
    Closed {
        index: usize,
    },
    Failed {
        index: usize,
        error: Error,
    },
}

/// Outcome of waiting on a [`Collector`].
#[derive(Debug)]
pub(crate) enum Next {
    Event(Event),
    Finished,
    TimedOut,
}

/// Drains a set of streams on background threads and buffers everything
/// they produce.
pub(crate) struct Collector {
    rx: Receiver<Message>,
    kinds: Vec<StreamKind>,
    buffers: Vec<Vec<u8>>,
    open: usize,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("kinds", &self.kinds)
            .field("open", &self.open)
            .finish()
    }
}

impl Collector {
    /// Start one reader thread per stream.
    pub fn start(streams: Vec<(StreamKind, PipeReader)>, mode: ReadMode, buf_size: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut kinds = Vec::with_capacity(streams.len());
        for (index, (kind, reader)) in streams.into_iter().enumerate() {
            kinds.push(kind);
            spawn_reader(index, kind, reader, tx.clone(), mode, buf_size)?;
        }
        let open = kinds.len();
        Ok(Self {
            rx,
            buffers: vec![Vec::new(); open],
            kinds,
            open,
        })
    }

    /// Wait for the next event, buffering any data.
    pub fn next(&mut self, deadline: Option<Instant>) -> Next {
        loop {
            if self.open == 0 {
                return Next::Finished;
            }
            let message = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Next::TimedOut;
                    }
                    match self.rx.recv_timeout(deadline - now) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => return Next::TimedOut,
                        Err(RecvTimeoutError::Disconnected) => return Next::Finished,
                    }
                }
                None => match self.rx.recv() {
                    Ok(message) => message,
                    Err(_) => return Next::Finished,
                },
            };
            match message {
                Message::Data { index, bytes, text } => {
                    self.buffers[index].extend_from_slice(&bytes);
                    return Next::Event(Event::Data {
                        kind: self.kinds[index],
                        bytes,
                        text,
                    });
                }
                Message::Closed { .. } => self.open -= 1,
                Message::Failed { index, error } => {
                    debug!("reader for {} failed: {}", self.kinds[index], error);
                    self.open -= 1;
                    return Next::Event(Event::Failed(error));
                }
            }
        }
    }

    /// Everything read so far, stdout and stderr each concatenated in
    /// stream order.
    pub fn output(&self) -> (Vec<u8>, Vec<u8>) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        for (kind, buffer) in self.kinds.iter().zip(&self.buffers) {
            match kind {
                StreamKind::Stderr => stderr.extend_from_slice(buffer),
                _ => stdout.extend_from_slice(buffer),
            }
        }
        (stdout, stderr)
    }

    /// Output decoded lossily.
    pub fn output_text(&self) -> (String, String) {
        let (stdout, stderr) = self.output();
        (
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        )
    }
}

fn spawn_reader(
    index: usize,
    kind: StreamKind,
    mut reader: PipeReader,
    tx: Sender<Message>,
    mode: ReadMode,
    buf_size: usize,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("pipewright-{}", kind))
        .spawn(move || {
            let mut buf = vec![0u8; buf_size.max(1)];
            loop {
                let chunk = match mode {
                    ReadMode::Raw => match read_retrying(&mut reader, &mut buf) {
                        Ok(0) => None,
                        Ok(n) => Some(Ok((buf[..n].to_vec(), None))),
                        Err(e) => Some(Err(Error::from(e))),
                    },
                    ReadMode::Decoded => match read_decode_safely(&mut reader, buf_size) {
                        Ok(None) => None,
                        Ok(Some(text)) => Some(Ok((text.as_bytes().to_vec(), Some(text)))),
                        Err(e) => Some(Err(e)),
                    },
                };
                match chunk {
                    None => {
                        trace!("{} reader: EOF", kind);
                        break;
                    }
                    Some(Ok((bytes, text))) => {
                        trace!("{} reader: read {} bytes", kind, bytes.len());
                        if tx.send(Message::Data { index, bytes, text }).is_err() {
                            return;
                        }
                    }
                    Some(Err(error)) => {
                        let _ = tx.send(Message::Failed { index, error });
                        return;
                    }
                }
            }
            let _ = tx.send(Message::Closed { index });
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    /// Returns at most `step` bytes per read.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn decode_all(data: &[u8], step: usize, buf_size: usize) -> Result<String> {
        let mut reader = Trickle {
            data: data.to_vec(),
            pos: 0,
            step,
        };
        let mut out = String::new();
        while let Some(text) = read_decode_safely(&mut reader, buf_size)? {
            out.push_str(&text);
        }
        Ok(out)
    }

    #[test]
    fn test_decode_split_characters_at_every_chunk_size() {
        let text = "héllo wörld ✓ 𝄞 done\n";
        for size in 1..=text.len() {
            assert_eq!(decode_all(text.as_bytes(), size, size).unwrap(), text, "chunk size {}", size);
        }
    }

    #[test]
    fn test_decode_with_large_buffer_small_reads() {
        let text = "𝄞𝄞𝄞";
        assert_eq!(decode_all(text.as_bytes(), 1, READ_BUFFER_SIZE).unwrap(), text);
    }

    #[test]
    fn test_decode_rejects_invalid_bytes() {
        let err = decode_all(&[b'a', 0xff, b'b'], 8, 8).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_truncated_stream() {
        let err = decode_all(&[0xF0, 0x9D], 8, 8).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_decoder_carries_split_characters() {
        let bytes = "aé𝄞b".as_bytes();
        for split in 0..=bytes.len() {
            let mut decoder = Utf8Decoder::default();
            let mut text = decoder.push(&bytes[..split]).unwrap();
            text.push_str(&decoder.push(&bytes[split..]).unwrap());
            assert_eq!(text, "aé𝄞b", "split at {}", split);
            assert!(decoder.finish().is_ok());
        }
    }

    #[test]
    fn test_decoder_errors() {
        let mut decoder = Utf8Decoder::default();
        assert!(matches!(decoder.push(&[b'a', 0xff]), Err(Error::Decode(_))));

        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(&[b'x', 0xF0, 0x9D]).unwrap(), "x");
        assert!(matches!(decoder.finish(), Err(Error::Decode(_))));
    }

    #[test]
    fn test_line_buffer() {
        let mut lines = LineBuffer::default();
        assert!(lines.push("par").is_empty());
        assert_eq!(lines.push("tial\r\nnext\nla"), vec!["partial", "next"]);
        assert_eq!(lines.finish(), Some("la".to_string()));
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_collector_orders_output_by_stream() {
        let streams = vec![
            (StreamKind::Stdout, PipeReader::Stream(Box::new(Cursor::new(b"one".to_vec())))),
            (StreamKind::Stderr, PipeReader::Stream(Box::new(Cursor::new(b"err".to_vec())))),
            (StreamKind::Stdout, PipeReader::Stream(Box::new(Cursor::new(b"two".to_vec())))),
        ];
        let mut collector = Collector::start(streams, ReadMode::Raw, 2).unwrap();
        let deadline = Some(Instant::now() + Duration::from_secs(5));
        loop {
            match collector.next(deadline) {
                Next::Finished => break,
                Next::TimedOut => panic!("collector timed out"),
                Next::Event(_) => {}
            }
        }
        let (out, err) = collector.output();
        assert_eq!(out, b"onetwo");
        assert_eq!(err, b"err");
    }
}
