//! Cleanup of terminal output from TTY sessions.

use vte::{Params, Parser, Perform};

/// Strips terminal control sequences from PTY output.
pub struct OutputSanitizer;

impl OutputSanitizer {
    /// Strip ANSI escape sequences and carriage returns from raw bytes.
    pub fn strip_ansi(input: &[u8]) -> String {
        let mut extractor = PlainText::default();
        let mut parser = Parser::new();
        parser.advance(&mut extractor, input);
        String::from_utf8_lossy(&extractor.output).into_owned()
    }

    pub fn strip_ansi_str(input: &str) -> String {
        Self::strip_ansi(input.as_bytes())
    }

    /// Clean one line read from a TTY. Plain lines are returned as they are.
    pub fn clean_line(line: &str) -> String {
        if line.contains('\x1b') || line.contains('\r') {
            Self::strip_ansi_str(line)
        } else {
            line.to_string()
        }
    }
}

#[derive(Default)]
struct PlainText {
    output: Vec<u8>,
}

impl Perform for PlainText {
    fn print(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.output
            .extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }

    fn execute(&mut self, byte: u8) {
        // keep newline and tab; \r is terminal line discipline noise
        if matches!(byte, b'\n' | b'\t') {
            self.output.push(byte);
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}

    fn csi_dispatch(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}
