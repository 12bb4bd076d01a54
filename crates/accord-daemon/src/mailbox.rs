//! Sealed protocol-message transport over the directory mailbox.
//!
//! Outbound messages are sealed to the recipient's published mailbox key
//! and posted to its directory mailbox with a TTL. Inbound messages are
//! drained, opened with the local key, validated, and deleted; anything
//! that fails to open or validate is dropped (and deleted) as a protocol
//! violation.

use std::sync::Arc;

use tracing::{debug, warn};

use accord_core::protocol::engine::MessageSender;
use accord_core::protocol::message::ProtocolMessage;
use accord_core::protocol::signing::{PartyKey, SealedEnvelope};

use crate::exchange::types::{split_party_id, PostMessageBody};
use crate::exchange::{Directory, PartyKind};
use crate::keycache::KeyCache;

/// Sends sealed messages to counter parties of one kind.
pub struct MailboxSender {
    directory: Arc<dyn Directory>,
    keys: Arc<KeyCache>,
    recipient_kind: PartyKind,
    ttl: u64,
}

impl MailboxSender {
    /// Creates a sender targeting nodes or agbots.
    #[must_use]
    pub fn new(
        directory: Arc<dyn Directory>,
        keys: Arc<KeyCache>,
        recipient_kind: PartyKind,
        ttl: u64,
    ) -> Self {
        Self {
            directory,
            keys,
            recipient_kind,
            ttl,
        }
    }
}

impl MessageSender for MailboxSender {
    fn send(&self, to: &str, payload: &[u8]) -> Result<(), String> {
        let key = self
            .keys
            .mailbox_key(to, self.recipient_kind)
            .map_err(|e| e.to_string())?;
        let sealed = SealedEnvelope::seal(&key, payload);
        let message = serde_json::to_string(&sealed).map_err(|e| e.to_string())?;
        let (org, id) = split_party_id(to);
        self.directory
            .post_message(
                org,
                self.recipient_kind,
                id,
                &PostMessageBody {
                    message,
                    ttl: self.ttl,
                },
            )
            .map_err(|e| e.to_string())
    }
}

/// Drains the local party's mailbox, returning validated messages.
///
/// Every message is deleted from the mailbox whether or not it was
/// usable; undecipherable or malformed payloads are logged and dropped.
pub fn drain(
    directory: &Arc<dyn Directory>,
    own_kind: PartyKind,
    org: &str,
    id: &str,
    key: &PartyKey,
) -> Vec<ProtocolMessage> {
    let messages = match directory.get_messages(org, own_kind, id) {
        Ok(messages) => messages,
        Err(err) => {
            warn!(%err, "mailbox drain failed");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for entry in messages {
        match open_one(&entry.message, key) {
            Ok(msg) => {
                debug!(msg_type = msg.msg_type(), agreement_id = msg.agreement_id(), "mailbox message");
                out.push(msg);
            }
            Err(reason) => {
                warn!(msg_id = entry.msg_id, reason, "dropping undecipherable mailbox message");
            }
        }
        if let Err(err) = directory.delete_message(org, own_kind, id, entry.msg_id) {
            warn!(msg_id = entry.msg_id, %err, "could not delete consumed mailbox message");
        }
    }
    out
}

fn open_one(sealed_text: &str, key: &PartyKey) -> Result<ProtocolMessage, String> {
    let sealed: SealedEnvelope =
        serde_json::from_str(sealed_text).map_err(|e| format!("bad envelope: {e}"))?;
    let plaintext = key.open(&sealed).map_err(|e| e.to_string())?;
    ProtocolMessage::parse(&plaintext).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use accord_core::protocol::message::{BaseMessage, DataReceived};

    use crate::exchange::mem::MemDirectory;
    use crate::exchange::types::Node;

    #[test]
    fn test_seal_post_drain_round_trip() {
        let node_key = PartyKey::generate();
        let dir = MemDirectory::new();
        dir.put_node(
            "myorg",
            "node1",
            &Node {
                public_key: hex::encode(node_key.mailbox_public()),
                ..Default::default()
            },
        )
        .unwrap();
        let directory: Arc<dyn Directory> = Arc::new(dir);
        let keys = Arc::new(KeyCache::new(directory.clone(), Duration::from_secs(60)));
        let sender = MailboxSender::new(directory.clone(), keys, PartyKind::Node, 180);

        let msg = ProtocolMessage::DataReceived(DataReceived {
            base: BaseMessage::new("accord-basic", 2, "ab".repeat(16)),
        });
        sender
            .send("myorg/node1", &msg.to_bytes().unwrap())
            .unwrap();

        let drained = drain(&directory, PartyKind::Node, "myorg", "node1", &node_key);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0], msg);

        // The mailbox is empty after the drain.
        assert!(drain(&directory, PartyKind::Node, "myorg", "node1", &node_key).is_empty());
    }

    #[test]
    fn test_garbage_is_dropped_and_deleted() {
        let node_key = PartyKey::generate();
        let dir = MemDirectory::new();
        dir.post_message(
            "myorg",
            PartyKind::Node,
            "node1",
            &PostMessageBody {
                message: "not an envelope".into(),
                ttl: 60,
            },
        )
        .unwrap();
        let directory: Arc<dyn Directory> = Arc::new(dir);
        let drained = drain(&directory, PartyKind::Node, "myorg", "node1", &node_key);
        assert!(drained.is_empty());
        assert!(drain(&directory, PartyKind::Node, "myorg", "node1", &node_key).is_empty());
    }
}
