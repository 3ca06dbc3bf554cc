//! Newline-delimited JSON marshaler.
//!
//! Each message is one JSON object on its own line:
//!
//! ```text
//! {"command":"SHOUT","args":["hello"],"kwargs":{}}\n
//! ```
//!
//! `args` and `kwargs` may be omitted on input. Blank lines are skipped, and a
//! trailing `\r` is tolerated so line-oriented tools (telnet, netcat) can talk
//! to a server directly.

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use super::{BoxFuture, BoxedReader, Marshaler, MessageEncoder, MessageReceiver};
use crate::error::{ConveyorError, Result};
use crate::message::{KwArgs, Message, MessageRef, Value};

/// Default maximum line length (1 MB), excluding the newline.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// JSON lines marshaler factory.
#[derive(Debug, Clone)]
pub struct JsonMarshaler {
    max_line_length: usize,
}

impl JsonMarshaler {
    /// Create a marshaler with the default line limit.
    pub fn new() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    /// Set the longest accepted line, in bytes.
    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }
}

impl Default for JsonMarshaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Marshaler for JsonMarshaler {
    fn create(&self, reader: BoxedReader) -> (Box<dyn MessageReceiver>, Box<dyn MessageEncoder>) {
        let receiver = JsonReceiver {
            reader: BufReader::new(reader),
            line: Vec::new(),
            max_line_length: self.max_line_length,
        };
        (Box::new(receiver), Box::new(JsonEncoder))
    }
}

struct JsonReceiver {
    reader: BufReader<BoxedReader>,
    line: Vec<u8>,
    max_line_length: usize,
}

impl MessageReceiver for JsonReceiver {
    fn receive(&mut self) -> BoxFuture<'_, Result<Message>> {
        Box::pin(async move {
            loop {
                self.line.clear();
                // One extra byte leaves room for the newline itself.
                let limit = self.max_line_length as u64 + 1;
                let n = (&mut self.reader)
                    .take(limit)
                    .read_until(b'\n', &mut self.line)
                    .await?;

                if n == 0 {
                    return Err(ConveyorError::ConnectionClosed);
                }

                if self.line.last() != Some(&b'\n') {
                    if self.line.len() as u64 >= limit {
                        return Err(ConveyorError::Protocol(format!(
                            "Line exceeds maximum of {} bytes",
                            self.max_line_length
                        )));
                    }
                    return Err(ConveyorError::Protocol(
                        "Stream ended in the middle of a line".to_string(),
                    ));
                }

                let content = trim_line_end(&self.line);
                if content.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }

                return Ok(serde_json::from_slice(content)?);
            }
        })
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

struct JsonEncoder;

impl MessageEncoder for JsonEncoder {
    fn encode(&self, command: &str, args: &[Value], kwargs: &KwArgs) -> Result<Bytes> {
        let mut line = serde_json::to_vec(&MessageRef {
            command,
            args,
            kwargs,
        })?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }
}
