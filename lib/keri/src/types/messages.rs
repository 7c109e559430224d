//! Inbound messages: events, witness receipts and forwards

use serde::{Deserialize, Serialize};

use super::events::SignedEvent;

/// A witness's signature over the SAID of an event it has seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub pre: String,
    pub sn: u64,
    pub said: String,
    /// Non-transferable witness prefix, which is also its public key
    pub witness: String,
    pub signature: String,
}

impl Receipt {
    /// Escrow identity; one receipt per witness per event.
    pub fn id(&self) -> String {
        format!("{}:{}", self.said, self.witness)
    }
}

/// An event wrapped for delivery to another identifier's mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forward {
    pub recipient: String,
    pub topic: String,
    pub message: SignedEvent,
}

pub fn forward(recipient: &str, topic: &str, message: SignedEvent) -> Forward {
    Forward {
        recipient: recipient.to_string(),
        topic: topic.to_string(),
        message,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "camelCase")]
pub enum Message {
    Event(SignedEvent),
    Receipt(Receipt),
    Forward(Box<Forward>),
}

impl From<SignedEvent> for Message {
    fn from(signed: SignedEvent) -> Self {
        Self::Event(signed)
    }
}

impl From<Receipt> for Message {
    fn from(receipt: Receipt) -> Self {
        Self::Receipt(receipt)
    }
}

impl From<Forward> for Message {
    fn from(fwd: Forward) -> Self {
        Self::Forward(Box::new(fwd))
    }
}
