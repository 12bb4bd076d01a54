//! In-memory [`Directory`] implementation.
//!
//! Backs the end-to-end tests and self-contained development runs: a full
//! directory (nodes, agbots, mailboxes, patterns, node health) living in
//! one process, with a controllable clock.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::types::{
    Agbot, MailboxMessage, Node, NodeAgreementState, NodeHealthRequest, NodeHealthResponse,
    NodeHealthStatus, NodePut, NodeSearchRequest, NodeSummary, Pattern, PatternSearchRequest,
    PostMessageBody, ServedPattern,
};
use super::{Directory, DirectoryError, PartyKind};

#[derive(Default)]
struct MemState {
    /// Full node id to record.
    nodes: HashMap<String, Node>,
    /// Full agbot id to record.
    agbots: HashMap<String, Agbot>,
    /// Full party id to pending messages.
    mailboxes: HashMap<String, Vec<MailboxMessage>>,
    /// (org, name) to pattern.
    patterns: BTreeMap<(String, String), Pattern>,
    /// Full agbot id to assignments.
    served: HashMap<String, Vec<ServedPattern>>,
    /// Full node id to agreement states.
    node_agreements: HashMap<String, BTreeMap<String, NodeAgreementState>>,
}

/// The in-memory directory.
#[derive(Default)]
pub struct MemDirectory {
    state: Mutex<MemState>,
    clock: AtomicU64,
    next_msg_id: AtomicU64,
    node_fetches: AtomicUsize,
}

impl MemDirectory {
    /// Creates an empty directory at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the directory's idea of "now", seconds since the epoch.
    pub fn set_now(&self, now: u64) {
        self.clock.store(now, Ordering::SeqCst);
    }

    /// Current directory time.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Registers an agbot record.
    pub fn put_agbot(&self, org: &str, id: &str, agbot: Agbot) {
        self.lock().agbots.insert(format!("{org}/{id}"), agbot);
    }

    /// Installs a pattern definition.
    pub fn put_pattern(&self, org: &str, name: &str, pattern: Pattern) {
        self.lock()
            .patterns
            .insert((org.to_string(), name.to_string()), pattern);
    }

    /// Assigns a pattern to an agbot.
    pub fn serve_pattern(&self, agbot: &str, pattern_org: &str, pattern: &str) {
        self.lock()
            .served
            .entry(agbot.to_string())
            .or_default()
            .push(ServedPattern {
                pattern_org: pattern_org.to_string(),
                pattern: pattern.to_string(),
            });
    }

    /// How many times node records were fetched; test instrumentation.
    #[must_use]
    pub fn node_fetch_count(&self) -> usize {
        self.node_fetches.load(Ordering::SeqCst)
    }

    /// Agreement ids currently recorded for a node.
    #[must_use]
    pub fn agreements_on_node(&self, node: &str) -> Vec<String> {
        self.lock()
            .node_agreements
            .get(node)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn fresh_enough(&self, last_heartbeat: u64, seconds_stale: u64) -> bool {
        // Zero disables staleness filtering entirely.
        seconds_stale == 0 || last_heartbeat + seconds_stale >= self.now()
    }
}

impl Directory for MemDirectory {
    fn get_node(&self, org: &str, id: &str) -> Result<Option<Node>, DirectoryError> {
        self.node_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().nodes.get(&format!("{org}/{id}")).cloned())
    }

    fn put_node(&self, org: &str, id: &str, node: &NodePut) -> Result<(), DirectoryError> {
        let mut put = node.clone();
        put.last_heartbeat = self.now();
        self.lock().nodes.insert(format!("{org}/{id}"), put);
        Ok(())
    }

    fn get_agbot(&self, org: &str, id: &str) -> Result<Option<Agbot>, DirectoryError> {
        Ok(self.lock().agbots.get(&format!("{org}/{id}")).cloned())
    }

    fn heartbeat(&self, org: &str, id: &str) -> Result<(), DirectoryError> {
        let now = self.now();
        if let Some(node) = self.lock().nodes.get_mut(&format!("{org}/{id}")) {
            node.last_heartbeat = now;
        }
        Ok(())
    }

    fn search_nodes(
        &self,
        org: &str,
        request: &NodeSearchRequest,
    ) -> Result<Vec<NodeSummary>, DirectoryError> {
        let state = self.lock();
        let mut out = Vec::new();
        for (full_id, node) in &state.nodes {
            if !full_id.starts_with(&format!("{org}/")) {
                continue;
            }
            if !self.fresh_enough(node.last_heartbeat, request.seconds_stale) {
                continue;
            }
            let urls: Vec<&str> = node
                .registered_services
                .iter()
                .map(|s| s.url.as_str())
                .collect();
            if !request.service_urls.iter().all(|u| urls.contains(&u.as_str())) {
                continue;
            }
            out.push(NodeSummary {
                id: full_id.clone(),
                name: node.name.clone(),
                public_key: node.public_key.clone(),
                msg_end_point: node.msg_end_point.clone(),
                registered_services: node.registered_services.clone(),
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn search_pattern(
        &self,
        org: &str,
        pattern: &str,
        request: &PatternSearchRequest,
    ) -> Result<Vec<NodeSummary>, DirectoryError> {
        let state = self.lock();
        let wanted = format!("{org}/{pattern}");
        let mut out = Vec::new();
        for (full_id, node) in &state.nodes {
            if node.pattern != wanted {
                continue;
            }
            if !self.fresh_enough(node.last_heartbeat, request.seconds_stale) {
                continue;
            }
            out.push(NodeSummary {
                id: full_id.clone(),
                name: node.name.clone(),
                public_key: node.public_key.clone(),
                msg_end_point: node.msg_end_point.clone(),
                registered_services: node.registered_services.clone(),
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn get_patterns(
        &self,
        org: &str,
        name: Option<&str>,
    ) -> Result<BTreeMap<String, Pattern>, DirectoryError> {
        let state = self.lock();
        let mut out = BTreeMap::new();
        for ((pat_org, pat_name), pattern) in &state.patterns {
            if pat_org != org {
                continue;
            }
            if name.is_some_and(|n| n != pat_name.as_str()) {
                continue;
            }
            out.insert(pat_name.clone(), pattern.clone());
        }
        Ok(out)
    }

    fn served_patterns(&self, org: &str, id: &str) -> Result<Vec<ServedPattern>, DirectoryError> {
        Ok(self
            .lock()
            .served
            .get(&format!("{org}/{id}"))
            .cloned()
            .unwrap_or_default())
    }

    fn post_message(
        &self,
        org: &str,
        _kind: PartyKind,
        id: &str,
        body: &PostMessageBody,
    ) -> Result<(), DirectoryError> {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.now();
        self.lock()
            .mailboxes
            .entry(format!("{org}/{id}"))
            .or_default()
            .push(MailboxMessage {
                msg_id,
                sender: String::new(),
                message: body.message.clone(),
                time_sent: now,
            });
        Ok(())
    }

    fn get_messages(
        &self,
        org: &str,
        _kind: PartyKind,
        id: &str,
    ) -> Result<Vec<MailboxMessage>, DirectoryError> {
        Ok(self
            .lock()
            .mailboxes
            .get(&format!("{org}/{id}"))
            .cloned()
            .unwrap_or_default())
    }

    fn delete_message(
        &self,
        org: &str,
        _kind: PartyKind,
        id: &str,
        msg_id: u64,
    ) -> Result<(), DirectoryError> {
        if let Some(mailbox) = self.lock().mailboxes.get_mut(&format!("{org}/{id}")) {
            mailbox.retain(|m| m.msg_id != msg_id);
        }
        Ok(())
    }

    fn node_health(
        &self,
        _org: &str,
        _pattern: Option<&str>,
        request: &NodeHealthRequest,
    ) -> Result<NodeHealthResponse, DirectoryError> {
        if request.node_orgs.is_empty() {
            return Ok(NodeHealthResponse::default());
        }
        let state = self.lock();
        let mut out = NodeHealthResponse::default();
        for (full_id, node) in &state.nodes {
            let (node_org, _) = super::types::split_party_id(full_id);
            if !request.node_orgs.iter().any(|o| o == node_org) {
                continue;
            }
            out.nodes.insert(
                full_id.clone(),
                NodeHealthStatus {
                    last_heartbeat: node.last_heartbeat,
                    agreements: state
                        .node_agreements
                        .get(full_id)
                        .map(|m| m.keys().cloned().collect())
                        .unwrap_or_default(),
                },
            );
        }
        Ok(out)
    }

    fn put_node_agreement(
        &self,
        org: &str,
        id: &str,
        agreement_id: &str,
        state: &NodeAgreementState,
    ) -> Result<(), DirectoryError> {
        self.lock()
            .node_agreements
            .entry(format!("{org}/{id}"))
            .or_default()
            .insert(agreement_id.to_string(), state.clone());
        Ok(())
    }

    fn delete_node_agreement(
        &self,
        org: &str,
        id: &str,
        agreement_id: &str,
    ) -> Result<(), DirectoryError> {
        if let Some(map) = self.lock().node_agreements.get_mut(&format!("{org}/{id}")) {
            map.remove(agreement_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::RegisteredService;

    fn node_with_service(url: &str) -> Node {
        Node {
            name: "n".into(),
            registered_services: vec![RegisteredService {
                url: url.into(),
                org: "myorg".into(),
                version: "1.2.0".into(),
                arch: "amd64".into(),
                ..Default::default()
            }],
            public_key: "ab".repeat(32),
            arch: "amd64".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_search_filters_by_service_and_staleness() {
        let dir = MemDirectory::new();
        dir.set_now(1000);
        dir.put_node("myorg", "fresh", &node_with_service("https://svc/a"))
            .unwrap();
        dir.set_now(5000);

        // seconds_stale = 0 disables the filter.
        let hits = dir
            .search_nodes(
                "myorg",
                &NodeSearchRequest {
                    service_urls: vec!["https://svc/a".into()],
                    seconds_stale: 0,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);

        // A tight staleness window hides the node registered at t=1000.
        let hits = dir
            .search_nodes(
                "myorg",
                &NodeSearchRequest {
                    service_urls: vec!["https://svc/a".into()],
                    seconds_stale: 60,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(hits.is_empty());

        // A heartbeat brings it back.
        dir.heartbeat("myorg", "fresh").unwrap();
        let hits = dir
            .search_nodes(
                "myorg",
                &NodeSearchRequest {
                    service_urls: vec!["https://svc/a".into()],
                    seconds_stale: 60,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_mailbox_post_drain_delete() {
        let dir = MemDirectory::new();
        dir.post_message(
            "myorg",
            PartyKind::Node,
            "node1",
            &PostMessageBody {
                message: "sealed".into(),
                ttl: 180,
            },
        )
        .unwrap();
        let msgs = dir.get_messages("myorg", PartyKind::Node, "node1").unwrap();
        assert_eq!(msgs.len(), 1);
        dir.delete_message("myorg", PartyKind::Node, "node1", msgs[0].msg_id)
            .unwrap();
        assert!(dir
            .get_messages("myorg", PartyKind::Node, "node1")
            .unwrap()
            .is_empty());
    }
}
