//! Out-of-band replies waiting for the next broadcast tick.

use shared::{CodecError, Message, MessageKind};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// A reply packed at enqueue time.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub kind: MessageKind,
    pub device_name: String,
    pub bytes: Vec<u8>,
}

impl PendingMessage {
    pub fn pack(message: &Message) -> Result<Self, CodecError> {
        Ok(Self {
            kind: message.kind(),
            device_name: message.device_name.clone(),
            bytes: message.pack()?,
        })
    }
}

/// Replies per client, in the order they were queued.
///
/// Guarded by its own lock, independent of the client registry.
#[derive(Debug, Default)]
pub struct PendingMessageQueue {
    messages: Mutex<HashMap<u32, Vec<PendingMessage>>>,
}

impl PendingMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packs `message` and appends it to the client's queue.
    pub async fn push(&self, client_id: u32, message: &Message) -> Result<(), CodecError> {
        let pending = PendingMessage::pack(message)?;
        self.messages
            .lock()
            .await
            .entry(client_id)
            .or_default()
            .push(pending);
        Ok(())
    }

    /// Removes and returns everything queued. Entries are gone whether or not
    /// the caller manages to deliver them.
    pub async fn take_all(&self) -> HashMap<u32, Vec<PendingMessage>> {
        std::mem::take(&mut *self.messages.lock().await)
    }

    pub async fn forget(&self, client_id: u32) {
        self.messages.lock().await.remove(&client_id);
    }

    pub async fn len(&self, client_id: u32) -> usize {
        self.messages
            .lock()
            .await
            .get(&client_id)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{MessageBody, StatusBody};

    #[tokio::test]
    async fn test_push_preserves_order_per_client() {
        let queue = PendingMessageQueue::new();
        let status = Message::new("", MessageBody::Status(StatusBody::ok()));
        let ack = Message::new("", MessageBody::StopTrackingData);

        queue.push(1, &status).await.unwrap();
        queue.push(2, &status).await.unwrap();
        queue.push(1, &ack).await.unwrap();
        assert_eq!(queue.len(1).await, 2);

        let taken = queue.take_all().await;
        let kinds: Vec<MessageKind> = taken[&1].iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MessageKind::Status, MessageKind::StopTrackingData]);
        assert_eq!(taken[&2].len(), 1);

        assert!(queue.take_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_forget_drops_client_queue() {
        let queue = PendingMessageQueue::new();
        queue
            .push(3, &Message::new("", MessageBody::GetStatus))
            .await
            .unwrap();
        queue.forget(3).await;
        assert_eq!(queue.len(3).await, 0);
    }

    #[tokio::test]
    async fn test_unpackable_message_is_not_queued() {
        let queue = PendingMessageQueue::new();
        let message = Message::new("ADeviceNameLongerThanTwenty", MessageBody::GetStatus);
        assert!(queue.push(4, &message).await.is_err());
        assert_eq!(queue.len(4).await, 0);
    }
}
