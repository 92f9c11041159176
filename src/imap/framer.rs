//! Byte-accurate command framing
//!
//! IMAP interleaves text lines with raw binary literals (`{N}` followed by
//! exactly N bytes), so this is the only layer allowed to touch raw bytes
//! for sizing. Lengths are byte lengths, never character counts; a multibyte
//! APPEND payload must pass through untouched.

use std::mem;

/// One framed command: the textual line (without CRLF, without the `{N}`
/// suffix when a literal followed) plus the literal bytes if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub line: Vec<u8>,
    pub literal: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Command(CommandFrame),
    /// A synchronising literal was announced; the caller must send
    /// `+ Ready for literal data` before more bytes arrive.
    SendContinuation,
    /// Protocol violation. `close` ends the connection after the BAD line.
    Reject { message: String, close: bool },
}

enum State {
    Line,
    Literal { size: usize },
}

pub struct Framer {
    buf: Vec<u8>,
    state: State,
    pending_line: Vec<u8>,
    /// Swallow one CRLF left over after a completed literal.
    swallow_crlf: bool,
    max_line: usize,
    max_literal: usize,
}

impl Framer {
    pub fn new(max_line: usize, max_literal: usize) -> Self {
        Self {
            buf: Vec::new(),
            state: State::Line,
            pending_line: Vec::new(),
            swallow_crlf: false,
            max_line,
            max_literal,
        }
    }

    /// True while literal bytes are outstanding; the connection loop uses
    /// this to arm the literal timeout and halt further reads growing the
    /// buffer past the literal bound.
    pub fn awaiting_literal(&self) -> bool {
        matches!(self.state, State::Literal { .. })
    }

    /// Feed raw bytes from the socket; returns every event they complete.
    pub fn feed(&mut self, data: &[u8]) -> Vec<FrameEvent> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            match self.state {
                State::Line => {
                    if self.swallow_crlf {
                        if self.buf.starts_with(b"\r\n") {
                            self.buf.drain(..2);
                            self.swallow_crlf = false;
                        } else if self.buf.is_empty() || self.buf == b"\r" {
                            break;
                        } else {
                            self.swallow_crlf = false;
                        }
                    }

                    let crlf = match find_crlf(&self.buf) {
                        Some(pos) => pos,
                        None => {
                            if self.buf.len() > self.max_line {
                                events.push(FrameEvent::Reject {
                                    message: "Command line too long".to_string(),
                                    close: true,
                                });
                                self.buf.clear();
                            }
                            break;
                        }
                    };

                    if crlf > self.max_line {
                        events.push(FrameEvent::Reject {
                            message: "Command line too long".to_string(),
                            close: true,
                        });
                        self.buf.clear();
                        break;
                    }

                    let line: Vec<u8> = self.buf.drain(..crlf + 2).take(crlf).collect();

                    match parse_literal_suffix(&line) {
                        Some((prefix_len, size, non_sync)) => {
                            if size > self.max_literal {
                                events.push(FrameEvent::Reject {
                                    message: "Literal too large".to_string(),
                                    // A synchronising client stops after the
                                    // BAD; a non-sync literal streams its
                                    // payload regardless, so cut it off.
                                    close: non_sync,
                                });
                                self.pending_line.clear();
                                continue;
                            }
                            self.pending_line = line[..prefix_len].to_vec();
                            self.state = State::Literal { size };
                            if !non_sync {
                                events.push(FrameEvent::SendContinuation);
                            }
                        }
                        None => {
                            events.push(FrameEvent::Command(CommandFrame {
                                line,
                                literal: None,
                            }));
                        }
                    }
                }
                State::Literal { size } => {
                    if self.buf.len() < size {
                        break;
                    }
                    let literal: Vec<u8> = self.buf.drain(..size).collect();
                    let line = mem::take(&mut self.pending_line);
                    self.state = State::Line;
                    self.swallow_crlf = true;
                    events.push(FrameEvent::Command(CommandFrame {
                        line,
                        literal: Some(literal),
                    }));
                }
            }
        }

        events
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// `...{N}` or `...{N+}` at end of line: (prefix length, N, non_sync).
fn parse_literal_suffix(line: &[u8]) -> Option<(usize, usize, bool)> {
    if line.last() != Some(&b'}') {
        return None;
    }
    let open = line.iter().rposition(|&b| b == b'{')?;
    let inner = &line[open + 1..line.len() - 1];
    let (digits, non_sync) = match inner.last() {
        Some(b'+') => (&inner[..inner.len() - 1], true),
        _ => (inner, false),
    };
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let size: usize = std::str::from_utf8(digits).ok()?.parse().ok()?;
    // Trim the space commonly preceding the literal marker.
    let mut prefix_len = open;
    if prefix_len > 0 && line[prefix_len - 1] == b' ' {
        prefix_len -= 1;
    }
    Some((prefix_len, size, non_sync))
}
