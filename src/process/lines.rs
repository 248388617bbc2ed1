//! Line-by-line output streaming.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{Collector, Event, LineBuffer, Next, Process, ReadMode, Utf8Decoder, READ_BUFFER_SIZE};
use crate::command::{Retcode, StreamKind};
use crate::error::{Error, Result};

/// Options for [`Process::iter_lines`].
#[derive(Debug, Clone)]
pub struct LinesOptions {
    /// Exit codes accepted at end of stream.
    pub retcode: Retcode,
    /// Deadline for the whole process.
    pub timeout: Option<Duration>,
    /// Longest allowed gap between two lines.
    pub line_timeout: Option<Duration>,
    /// Read chunk size.
    pub buffer_size: usize,
}

impl Default for LinesOptions {
    fn default() -> Self {
        Self {
            retcode: Retcode::default(),
            timeout: None,
            line_timeout: None,
            buffer_size: READ_BUFFER_SIZE,
        }
    }
}

impl LinesOptions {
    /// Deadlines and read size from the `execution` section of `config`.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            retcode: Retcode::default(),
            timeout: config.execution.timeout_secs.map(Duration::from_secs),
            line_timeout: config.execution.line_timeout_secs.map(Duration::from_secs),
            buffer_size: config.execution.read_buffer_size.max(1),
        }
    }

    pub fn retcode(mut self, retcode: impl Into<Retcode>) -> Self {
        self.retcode = retcode.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = Some(timeout);
        self
    }
}

/// Iterator over `(stream, line)` pairs of a running process.
///
/// Lines come without their terminator. After the last line the process
/// is waited for and its exit code checked; a rejected code is yielded as
/// a final error. A timeout kills and reaps the process before the error
/// is yielded.
pub struct Lines<'a> {
    process: &'a mut Process,
    options: LinesOptions,
    collector: Option<Collector>,
    buffers: [LineBuffer; 2],
    decoders: [Utf8Decoder; 2],
    pending: VecDeque<(StreamKind, String)>,
    error: Option<Error>,
    deadline: Option<Instant>,
    last_line: Instant,
    done: bool,
}

impl<'a> Lines<'a> {
    pub(crate) fn new(process: &'a mut Process, options: LinesOptions) -> Self {
        let now = Instant::now();
        let deadline = options.timeout.map(|t| now + t);
        let (collector, error) = match process.start_collector(ReadMode::Decoded, options.buffer_size) {
            Ok(collector) => (Some(collector), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            process,
            options,
            collector,
            buffers: [LineBuffer::default(), LineBuffer::default()],
            decoders: [Utf8Decoder::default(), Utf8Decoder::default()],
            pending: VecDeque::new(),
            done: error.is_some(),
            error,
            deadline,
            last_line: now,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let line = self.options.line_timeout.map(|t| self.last_line + t);
        match (self.deadline, line) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn buffer_index(kind: StreamKind) -> usize {
        match kind {
            StreamKind::Stderr => 1,
            _ => 0,
        }
    }

    fn timed_out(&mut self) -> Error {
        let overall = self.deadline.map_or(false, |d| Instant::now() >= d);
        if overall {
            return self.process.timed_out(self.options.timeout);
        }
        debug!("no line from {:?} within line timeout", self.process.argv());
        self.process.kill_and_reap();
        Error::LineTimeout {
            argv: self.process.argv().to_vec(),
            timeout: self.options.line_timeout.unwrap_or_default(),
            host: self.process.host().map(String::from),
        }
    }

    fn fail(&mut self, error: Error) {
        self.process.kill_and_reap();
        self.done = true;
        self.error = Some(error);
    }

    fn finish(&mut self) {
        self.done = true;
        for decoder in &mut self.decoders {
            if let Err(e) = decoder.finish() {
                self.error = Some(e);
                return;
            }
        }
        for kind in [StreamKind::Stdout, StreamKind::Stderr] {
            if let Some(rest) = self.buffers[Self::buffer_index(kind)].finish() {
                self.pending.push_back((kind, rest));
            }
        }
        let code = match self.process.wait_until(self.deadline, self.options.timeout) {
            Ok(code) => code,
            Err(e) => {
                self.error = Some(e);
                return;
            }
        };
        let (stdout, stderr) = self
            .collector
            .as_ref()
            .map(Collector::output_text)
            .unwrap_or_default();
        if let Err(e) = self.process.verify(&self.options.retcode, Some(code), &stdout, &stderr) {
            self.error = Some(e);
        }
    }
}

impl Iterator for Lines<'_> {
    type Item = Result<(StreamKind, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(Ok(line));
            }
            if self.done {
                return self.error.take().map(Err);
            }
            let deadline = self.next_deadline();
            let next = match self.collector.as_mut() {
                Some(collector) => collector.next(deadline),
                None => Next::Finished,
            };
            match next {
                Next::Event(event) => {
                    let index = match &event {
                        Event::Data { kind, .. } => Self::buffer_index(*kind),
                        Event::Failed(_) => 0,
                    };
                    let (kind, text) = match event.into_text(&mut self.decoders[index]) {
                        Ok(data) => data,
                        Err(error) => {
                            self.fail(error);
                            continue;
                        }
                    };
                    let lines = self.buffers[index].push(&text);
                    if !lines.is_empty() {
                        self.last_line = Instant::now();
                    }
                    self.pending.extend(lines.into_iter().map(|l| (kind, l)));
                }
                Next::TimedOut => {
                    self.done = true;
                    self.error = Some(self.timed_out());
                }
                Next::Finished => self.finish(),
            }
        }
    }
}
