//! Messages exchanged over attendant connections.
//!
//! A [`Message`] is a command name plus positional and named arguments.
//! Arguments are untyped: they use [`serde_json::Value`] as the common value
//! model, so every marshaler decodes into the same shape regardless of the
//! wire format.
//!
//! # Example
//!
//! ```
//! use conveyor::message::{KwArgs, Message};
//! use serde_json::json;
//!
//! let mut kwargs = KwArgs::new();
//! kwargs.insert("loud".to_string(), json!(true));
//!
//! let msg = Message::new("SHOUT", vec![json!("hello")], kwargs);
//! assert_eq!(msg.command(), "SHOUT");
//! assert_eq!(msg.args()[0], json!("hello"));
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Untyped argument value.
pub use serde_json::Value;

/// Positional arguments.
pub type Args = Vec<Value>;

/// Named arguments.
pub type KwArgs = HashMap<String, Value>;

/// An immutable, decoded message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    command: String,
    #[serde(default)]
    args: Args,
    #[serde(default)]
    kwargs: KwArgs,
}

impl Message {
    /// Create a message from its parts.
    pub fn new(command: impl Into<String>, args: Args, kwargs: KwArgs) -> Self {
        Self {
            command: command.into(),
            args,
            kwargs,
        }
    }

    /// Create a message with no arguments.
    pub fn command_only(command: impl Into<String>) -> Self {
        Self::new(command, Args::new(), KwArgs::new())
    }

    /// The command name.
    #[inline]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Positional arguments, in order.
    #[inline]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Named arguments.
    #[inline]
    pub fn kwargs(&self) -> &KwArgs {
        &self.kwargs
    }

    /// Decompose into `(command, args, kwargs)`.
    pub fn into_parts(self) -> (String, Args, KwArgs) {
        (self.command, self.args, self.kwargs)
    }
}

/// Borrowed view used by encoders, so sending never clones arguments.
#[derive(Serialize)]
pub(crate) struct MessageRef<'a> {
    pub command: &'a str,
    pub args: &'a [Value],
    pub kwargs: &'a KwArgs,
}
