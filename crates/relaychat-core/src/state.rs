//! UI-agnostic conversation state
//!
//! The conversation is an append-only log. Observers are called
//! synchronously after every append, which is how a UI learns that it should
//! scroll to the newest message.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Typed by the user
    Outgoing,
    /// Returned by the relay, including the fetch error placeholder
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub text: String,
}

impl Message {
    pub fn outgoing(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Outgoing,
            text: text.into(),
        }
    }

    pub fn incoming(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Incoming,
            text: text.into(),
        }
    }

    pub fn is_outgoing(&self) -> bool {
        self.kind == MessageKind::Outgoing
    }
}

/// Called with the new message and its index
pub type Observer = Box<dyn FnMut(&Message, usize) + Send>;

#[derive(Default)]
pub struct Conversation {
    messages: Vec<Message>,
    observers: Vec<Observer>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and notify observers in subscription order.
    /// Returns the index of the new message.
    pub fn append(&mut self, message: Message) -> usize {
        self.messages.push(message);
        let index = self.messages.len() - 1;
        for observer in self.observers.iter_mut() {
            observer(&self.messages[index], index);
        }
        index
    }

    pub fn snapshot(&self) -> &[Message] {
        &self.messages
    }

    pub fn subscribe<F>(&mut self, observer: F)
    where
        F: FnMut(&Message, usize) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// True when the newest message is an outgoing one still waiting for
    /// its reply
    pub fn awaiting_reply(&self) -> bool {
        self.last().map_or(false, Message::is_outgoing)
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("messages", &self.messages)
            .field("observers", &self.observers.len())
            .finish()
    }
}
