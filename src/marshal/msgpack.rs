//! Length-prefixed MessagePack marshaler using `rmp-serde`.
//!
//! Every message travels as one frame: a 4-byte big-endian length followed by
//! a MessagePack map `{command, args, kwargs}`.
//!
//! **Always `to_vec_named`, never `to_vec`**: peers written against other
//! MessagePack libraries expect struct-as-map, not positional arrays.

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use super::frame_buffer::{build_frame, FrameBuffer, DEFAULT_MAX_PAYLOAD_SIZE};
use super::{BoxFuture, BoxedReader, Marshaler, MessageEncoder, MessageReceiver};
use crate::error::{ConveyorError, Result};
use crate::message::{KwArgs, Message, MessageRef, Value};

/// MessagePack marshaler factory.
#[derive(Debug, Clone)]
pub struct MsgPackMarshaler {
    max_payload_size: u32,
}

impl MsgPackMarshaler {
    /// Create a marshaler with the default 16MB payload limit.
    pub fn new() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Set the largest accepted payload, in bytes.
    pub fn with_max_payload(mut self, max_payload_size: u32) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }
}

impl Default for MsgPackMarshaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Marshaler for MsgPackMarshaler {
    fn create(&self, reader: BoxedReader) -> (Box<dyn MessageReceiver>, Box<dyn MessageEncoder>) {
        let receiver = MsgPackReceiver {
            reader,
            frames: FrameBuffer::with_max_payload(self.max_payload_size),
        };
        (Box::new(receiver), Box::new(MsgPackEncoder))
    }
}

struct MsgPackReceiver {
    reader: BoxedReader,
    frames: FrameBuffer,
}

impl MessageReceiver for MsgPackReceiver {
    fn receive(&mut self) -> BoxFuture<'_, Result<Message>> {
        Box::pin(async move {
            loop {
                if let Some(payload) = self.frames.try_extract()? {
                    return Ok(rmp_serde::from_slice(&payload)?);
                }

                let n = self.reader.read_buf(self.frames.buffer_mut()).await?;
                if n == 0 {
                    if self.frames.is_mid_frame() {
                        return Err(ConveyorError::Protocol(
                            "Stream ended in the middle of a frame".to_string(),
                        ));
                    }
                    return Err(ConveyorError::ConnectionClosed);
                }
            }
        })
    }
}

struct MsgPackEncoder;

impl MessageEncoder for MsgPackEncoder {
    fn encode(&self, command: &str, args: &[Value], kwargs: &KwArgs) -> Result<Bytes> {
        // CRITICAL: to_vec_named, NOT to_vec!
        let payload = rmp_serde::to_vec_named(&MessageRef {
            command,
            args,
            kwargs,
        })?;
        build_frame(&payload)
    }
}
