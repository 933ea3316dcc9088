//! Interactive command channel: a line-oriented control protocol over a text
//! stream. Input is read one character at a time; listeners see every
//! character, then every completed line parsed into a command and its
//! arguments.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One parsed line: the first whitespace-delimited token is the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    /// `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let name = tokens.next()?.to_string();
        Some(Self {
            name,
            args: tokens.map(String::from).collect(),
        })
    }
}

pub trait CommandListener: Send {
    fn on_char(&mut self, _c: char) {}

    fn on_command(&mut self, _command: &Command) {}
}

/// Why [`CommandChannel::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEnd {
    EndOfInput,
    Shutdown,
}

pub struct CommandChannel {
    listeners: Vec<Box<dyn CommandListener>>,
    shutdown: Arc<AtomicBool>,
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandChannel {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn CommandListener>) {
        self.listeners.push(listener);
    }

    /// Set to stop the channel before the next character is read.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn run<R: Read>(&mut self, input: R) -> io::Result<ChannelEnd> {
        let mut line = String::new();
        let mut decoder = Utf8Decoder::default();
        let mut decoded = Vec::with_capacity(2);
        for byte in input.bytes() {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(ChannelEnd::Shutdown);
            }
            decoded.clear();
            decoder.push(byte?, &mut decoded);
            for &c in &decoded {
                self.feed(c, &mut line);
                if self.shutdown.load(Ordering::Relaxed) {
                    return Ok(ChannelEnd::Shutdown);
                }
            }
        }
        if let Some(c) = decoder.finish() {
            self.feed(c, &mut line);
        }
        if !line.is_empty() {
            self.complete(&line);
        }
        Ok(ChannelEnd::EndOfInput)
    }

    fn feed(&mut self, c: char, line: &mut String) {
        for listener in self.listeners.iter_mut() {
            listener.on_char(c);
        }
        if c == '\n' {
            let text = std::mem::take(line);
            self.complete(text.trim_end_matches('\r'));
        } else {
            line.push(c);
        }
    }

    fn complete(&mut self, text: &str) {
        if let Some(command) = Command::parse(text) {
            for listener in self.listeners.iter_mut() {
                listener.on_command(&command);
            }
        }
    }
}

/// Byte-at-a-time UTF-8 decoding. Each malformed sequence becomes one U+FFFD;
/// the byte that exposed it is decoded again on its own.
#[derive(Default)]
struct Utf8Decoder {
    pending: [u8; 4],
    len: usize,
}

impl Utf8Decoder {
    fn push(&mut self, byte: u8, out: &mut Vec<char>) {
        self.pending[self.len] = byte;
        self.len += 1;
        match std::str::from_utf8(&self.pending[..self.len]) {
            Ok(s) => {
                out.extend(s.chars());
                self.len = 0;
            }
            // A prefix of at most three bytes; four are always complete or invalid.
            Err(e) if e.error_len().is_none() => {}
            Err(_) if self.len == 1 => {
                out.push(char::REPLACEMENT_CHARACTER);
                self.len = 0;
            }
            Err(_) => {
                out.push(char::REPLACEMENT_CHARACTER);
                self.len = 0;
                self.push(byte, out);
            }
        }
    }

    /// Input ended inside a sequence.
    fn finish(&mut self) -> Option<char> {
        let truncated = self.len > 0;
        self.len = 0;
        truncated.then_some(char::REPLACEMENT_CHARACTER)
    }
}
