//! The consumer worker ("agbot").
//!
//! Owns every consumer-side agreement: it converges the patterns it is
//! assigned to serve into consumer policies, searches the directory for
//! candidate nodes, initiates proposals, drives the consumer half of the
//! protocol over the sealed mailbox, and executes the cancellations the
//! governance loop decides on.
//!
//! At-most-once: a pending table keyed by (org, policy, node) guarantees
//! one outstanding agreement per triple; a cooldown table rate-limits
//! re-attempts against candidates that recently failed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use accord_core::agreement::{Agreement, AgreementRole, AgreementState};
use accord_core::anchor::{AnchorEvent, AnchorEventKind};
use accord_core::events::{Event, EventKind};
use accord_core::persistence::records::{category, LogSeverity};
use accord_core::policy::manager::PolicySide;
use accord_core::policy::protocols::AgreementProtocol;
use accord_core::policy::workload::{next_choice, priority_order};
use accord_core::policy::Policy;
use accord_core::protocol::canonical::terms_hash;
use accord_core::protocol::engine::{choose_anchor, ProtocolEngine};
use accord_core::protocol::message::{MeterReading, ProposalReply, ProtocolMessage};
use accord_core::protocol::signing::new_agreement_id;
use accord_core::protocol::PROTOCOL_NAME;
use accord_core::reason::{
    describe, AB_CANCEL_BC_WRITE_FAILED, AB_CANCEL_DISCOVERED, AB_CANCEL_NEGATIVE_REPLY,
    AB_CANCEL_NO_REPLY,
};

use crate::context::WorkerContext;
use crate::exchange::types::{NodeSearchRequest, NodeSummary, PatternSearchRequest};
use crate::exchange::PartyKind;
use crate::mailbox::{self, MailboxSender};
use crate::now_secs;
use crate::runtime::{Disposition, Worker};

mod pattern;

pub use pattern::{pattern_policy_name, policy_from_pattern_service};

/// Commands processed by the agbot worker.
#[derive(Debug)]
pub enum AgbotCommand {
    /// Initiate an agreement with a matched candidate.
    MakeAgreement {
        /// Consumer policy the match was made for.
        consumer: Arc<Policy>,
        /// The candidate's effective producer policy.
        producer: Box<Policy>,
        /// Organization of the consumer policy.
        org: String,
        /// The candidate node.
        node: NodeSummary,
    },
    /// Cancel an agreement with a classified reason.
    Cancel {
        /// Agreement id.
        agreement_id: String,
        /// Classified reason code.
        reason: u32,
    },
    /// An anchor event referencing one of our agreements.
    AnchorSeen(AnchorEvent),
    /// Governance observed verified data flow.
    DataSeen {
        /// Agreement id.
        agreement_id: String,
    },
    /// A consumer policy disappeared; drop its pending work.
    PolicyGone {
        /// Organization.
        org: String,
        /// Policy name.
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    org: String,
    policy: String,
    node: String,
}

/// The consumer worker.
pub struct AgbotWorker {
    ctx: WorkerContext,
    engine: ProtocolEngine,
    sender: MailboxSender,
    party_id: String,
    /// (org, policy, node) -> agreement id; bounds proposals to one per
    /// triple until the agreement archives.
    pending: HashMap<PendingKey, String>,
    /// Candidates attempted or failed recently, with the attempt time.
    cooldown: HashMap<PendingKey, Instant>,
    /// Last directory search per (org, policy).
    last_search: HashMap<(String, String), Instant>,
    /// Failed attempts per workload choice, per (org, policy), indexed in
    /// priority order; drives fallback to the next workload.
    workload_failures: HashMap<(String, String), Vec<u32>>,
}

impl AgbotWorker {
    /// Creates the worker.
    #[must_use]
    pub fn new(ctx: WorkerContext) -> Self {
        let sender = MailboxSender::new(
            ctx.directory.clone(),
            ctx.keys.clone(),
            PartyKind::Node,
            ctx.config.exchange.message_ttl,
        );
        let party_id = ctx.config.party_id();
        Self {
            ctx,
            engine: ProtocolEngine::new(),
            sender,
            party_id,
            pending: HashMap::new(),
            cooldown: HashMap::new(),
            last_search: HashMap::new(),
            workload_failures: HashMap::new(),
        }
    }

    fn log(&self, severity: LogSeverity, message: &str) {
        if let Err(err) = self
            .ctx
            .store
            .log_event(now_secs(), severity, category::AGREEMENT, message)
        {
            error!(%err, "event log write failed");
        }
    }

    fn forget(&mut self, agreement: &Agreement) {
        self.ctx
            .policies
            .cancel_agreement(&agreement.id, &agreement.policy_name, &agreement.org);
        self.pending.retain(|_, id| id != &agreement.id);
    }

    fn archive(&mut self, mut agreement: Agreement) {
        if agreement.state != AgreementState::Archived {
            if let Err(err) = agreement.mark_archived(now_secs()) {
                error!(agreement_id = %agreement.id, %err, "cannot archive");
                return;
            }
        }
        if let Err(err) = self.ctx.store.archive_agreement(&agreement) {
            error!(agreement_id = %agreement.id, %err, "archive write failed");
            return;
        }
        self.forget(&agreement);
        info!(agreement_id = %agreement.id, reason = agreement.terminated_reason, "agreement archived");
    }

    fn save(&self, agreement: &Agreement) {
        if let Err(err) = self.ctx.store.save_agreement(agreement) {
            error!(agreement_id = %agreement.id, %err, "agreement write failed");
        }
    }

    fn send(&self, msg: &ProtocolMessage, to: &str) -> bool {
        match self.engine.send(msg, to, &self.sender) {
            Ok(()) => true,
            Err(err) => {
                warn!(to, msg_type = msg.msg_type(), %err, "protocol send failed");
                false
            }
        }
    }

    // ---- command handlers ----------------------------------------------

    fn make_agreement(
        &mut self,
        consumer: &Arc<Policy>,
        producer: &Policy,
        org: &str,
        node: &NodeSummary,
    ) {
        let key = PendingKey {
            org: org.to_string(),
            policy: consumer.header.name.clone(),
            node: node.id.clone(),
        };
        if self.pending.contains_key(&key) {
            return;
        }
        if self
            .cooldown
            .get(&key)
            .is_some_and(|at| at.elapsed() < self.ctx.config.agbot.retry_interval)
        {
            return;
        }
        // Every attempt starts a cooldown window for the triple.
        self.cooldown.insert(key.clone(), Instant::now());

        if !self.ctx.policies.has_capacity(consumer, org) {
            debug!(policy = %consumer.header.name, "policy at its agreement cap");
            return;
        }
        let matched = match self.ctx.policies.matches(producer, consumer) {
            Ok(matched) => matched,
            Err(err) => {
                debug!(node = %node.id, %err, "candidate does not match after all");
                return;
            }
        };
        let attempts = self
            .workload_failures
            .get(&(org.to_string(), consumer.header.name.clone()))
            .cloned()
            .unwrap_or_default();
        let Some(choice) = next_choice(&matched.workloads, &attempts) else {
            debug!(policy = %consumer.header.name, "all workload choices exhausted");
            return;
        };
        let workload = matched.workloads[choice].clone();
        let agreement_id = new_agreement_id();

        let proposal = match self.engine.build_proposal(
            &agreement_id,
            producer,
            consumer,
            &matched,
            &workload,
            &self.party_id,
        ) {
            Ok(proposal) => proposal,
            Err(err) => {
                error!(%err, "proposal construction failed");
                return;
            }
        };

        if let Err(err) = self
            .ctx
            .policies
            .record_agreement(&agreement_id, consumer, org)
        {
            debug!(%err, "could not bind agreement to policy");
            return;
        }

        let mut agreement = Agreement::new(
            agreement_id.clone(),
            AgreementRole::Consumer,
            self.engine.name(),
            matched.protocol.protocol_version,
            node.id.clone(),
            consumer.header.name.clone(),
            org,
            proposal.ts_and_cs.clone(),
            terms_hash(&proposal.ts_and_cs),
            proposal.producer_policy.clone(),
            workload,
            now_secs(),
        );
        agreement.anchor = choose_anchor(&matched);

        if !self.send(&ProtocolMessage::Proposal(proposal), &node.id) {
            self.ctx
                .policies
                .cancel_agreement(&agreement_id, &consumer.header.name, org);
            return;
        }

        self.save(&agreement);
        self.pending.insert(key, agreement_id.clone());
        self.log(
            LogSeverity::Info,
            &format!("proposal {agreement_id} sent to {}", node.id),
        );
        info!(agreement_id = %agreement.id, node = %node.id, "proposal sent");
    }

    fn cancel(&mut self, agreement_id: &str, reason: u32) {
        let agreement = match self.ctx.store.find_agreement(agreement_id) {
            Ok(Some(agreement)) => agreement,
            Ok(None) => return,
            Err(err) => {
                error!(agreement_id, %err, "store read failed");
                return;
            }
        };
        if agreement.role != AgreementRole::Consumer {
            return;
        }

        if agreement.state == AgreementState::Terminating {
            self.finish_terminating(agreement);
            return;
        }

        let mut agreement = agreement;
        let had_anchor_record = agreement.reply_received != 0;
        if let Err(err) = agreement.mark_terminating(now_secs(), reason, describe(reason)) {
            error!(agreement_id, %err, "cannot terminate");
            return;
        }
        self.log(
            LogSeverity::Info,
            &format!("agreement {agreement_id} terminating: {}", describe(reason)),
        );
        if reason == AB_CANCEL_NO_REPLY {
            self.note_workload_failure(&agreement);
        }

        // Tell the producer, best effort.
        let cancel = self
            .engine
            .build_cancel(agreement.protocol_version, agreement_id, reason);
        self.send(
            &ProtocolMessage::Cancel(cancel),
            &agreement.counter_party_id,
        );

        if had_anchor_record && reason != AB_CANCEL_BC_WRITE_FAILED {
            // The create record is on the anchor; witness the termination
            // and archive when the cancel event comes back.
            if self
                .ctx
                .anchor
                .write_terminate(AnchorEventKind::ConsumerTerm, agreement_id, reason)
                .is_err()
            {
                agreement.anchor_write_failed = true;
                self.log(
                    LogSeverity::Error,
                    &format!("anchor write for {agreement_id} failed"),
                );
            }
            self.save(&agreement);
            self.cooldown_counter_party(&agreement);
        } else {
            // Nothing on the anchor to wait for.
            self.cooldown_counter_party(&agreement);
            self.archive(agreement);
        }
    }

    /// A terminating agreement revisited by governance: retry a failed
    /// anchor write, and force the archive after the finalize window.
    fn finish_terminating(&mut self, mut agreement: Agreement) {
        if agreement.anchor_write_failed
            && self
                .ctx
                .anchor
                .write_terminate(
                    AnchorEventKind::ConsumerTerm,
                    &agreement.id,
                    agreement.terminated_reason,
                )
                .is_ok()
        {
            agreement.anchor_write_failed = false;
            self.save(&agreement);
        }
        let waited = now_secs().saturating_sub(agreement.terminated);
        if waited > self.ctx.config.agbot.finalize_timeout.as_secs() {
            self.archive(agreement);
        }
    }

    /// Returns `true` when the event arrived ahead of the reply and
    /// should be retried after the mailbox drains.
    fn anchor_seen(&mut self, event: &AnchorEvent) -> bool {
        let agreement = match self.ctx.store.find_agreement(&event.agreement_id) {
            Ok(Some(agreement)) => agreement,
            // Unknown or already archived: redelivery is harmless.
            Ok(None) => return false,
            Err(err) => {
                error!(agreement_id = %event.agreement_id, %err, "store read failed");
                return false;
            }
        };
        if agreement.role != AgreementRole::Consumer {
            return false;
        }

        match event.kind {
            AnchorEventKind::AgreementCreate => {
                if agreement.state == AgreementState::Proposed {
                    // Our own create echoed before the reply was drained.
                    return true;
                }
                if agreement.state == AgreementState::Replied {
                    let mut agreement = agreement;
                    let now = now_secs();
                    if agreement.mark_confirmed(now).is_ok()
                        && agreement.mark_execution_started(now).is_ok()
                    {
                        self.save(&agreement);
                        // Advertise our signing address so the producer can
                        // verify metering notifications.
                        let update = self.engine.build_consumer_update(
                            agreement.protocol_version,
                            &agreement.id,
                            &self.ctx.identity,
                        );
                        self.send(
                            &ProtocolMessage::ConsumerUpdate(update),
                            &agreement.counter_party_id,
                        );
                        self.log(
                            LogSeverity::Info,
                            &format!("agreement {} confirmed on the anchor", agreement.id),
                        );
                        info!(agreement_id = %agreement.id, "agreement active");
                    }
                }
            }
            kind if kind.is_termination() => {
                if agreement.state == AgreementState::Terminating {
                    self.archive(agreement);
                } else {
                    let mut agreement = agreement;
                    let reason = AB_CANCEL_DISCOVERED;
                    if agreement
                        .mark_terminating(now_secs(), reason, describe(reason))
                        .is_ok()
                    {
                        self.cooldown_counter_party(&agreement);
                        self.archive(agreement);
                    }
                }
            }
            _ => {}
        }
        false
    }

    fn data_seen(&mut self, agreement_id: &str) {
        let Ok(Some(mut agreement)) = self.ctx.store.find_agreement(agreement_id) else {
            return;
        };
        if agreement.role != AgreementRole::Consumer
            || agreement.state != AgreementState::Active
        {
            return;
        }
        let now = now_secs();
        if agreement.mark_data_verified(now).is_err() {
            return;
        }

        // Tell the producer data arrived.
        let notice = self
            .engine
            .build_data_received(agreement.protocol_version, agreement_id);
        self.send(
            &ProtocolMessage::DataReceived(notice),
            &agreement.counter_party_id,
        );

        // Metering, when the terms ask for it and the interval elapsed.
        if let Ok(terms) = serde_json::from_str::<Policy>(&agreement.ts_and_cs) {
            let meter = &terms.data_verification.metering;
            let due = agreement
                .last_meter
                .as_ref()
                .map_or(true, |m| now.saturating_sub(m.current_time) >= meter.notification_interval);
            if meter.tokens > 0 && due {
                let reading = MeterReading {
                    amount: meter.tokens,
                    current_time: now,
                    agreement_hash: agreement.terms_hash.clone(),
                    consumer_signature: String::new(),
                };
                let notification = self.engine.build_meter_notification(
                    agreement.protocol_version,
                    agreement_id,
                    reading,
                    &self.ctx.identity,
                );
                agreement.last_meter = Some(notification.meter.clone());
                self.send(
                    &ProtocolMessage::MeterNotification(notification),
                    &agreement.counter_party_id,
                );
            }
        }
        self.save(&agreement);
    }

    fn cooldown_counter_party(&mut self, agreement: &Agreement) {
        self.cooldown.insert(
            PendingKey {
                org: agreement.org.clone(),
                policy: agreement.policy_name.clone(),
                node: agreement.counter_party_id.clone(),
            },
            Instant::now(),
        );
    }

    /// Charges a failed attempt against the workload choice the agreement
    /// carried, so the next proposal can fall back to a lower priority.
    fn note_workload_failure(&mut self, agreement: &Agreement) {
        let Some(consumer) = self.ctx.policies.find(
            PolicySide::Consumer,
            &agreement.org,
            &agreement.policy_name,
        ) else {
            return;
        };
        let ordered = priority_order(&consumer.workloads);
        let Some(index) = ordered
            .iter()
            .position(|w| w.same_workload(&agreement.workload))
        else {
            return;
        };
        let attempts = self
            .workload_failures
            .entry((agreement.org.clone(), agreement.policy_name.clone()))
            .or_default();
        if attempts.len() <= index {
            attempts.resize(index + 1, 0);
        }
        attempts[index] += 1;
    }

    // ---- mailbox -------------------------------------------------------

    fn handle_message(&mut self, msg: ProtocolMessage, commands: &mut Vec<AgbotCommand>) {
        match msg {
            ProtocolMessage::ProposalReply(reply) => self.handle_reply(&reply),
            ProtocolMessage::DataReceivedAck(ack) => {
                if let Ok(Some(mut agreement)) =
                    self.ctx.store.find_agreement(&ack.base.agreement_id)
                {
                    agreement.data_notification = now_secs();
                    self.save(&agreement);
                }
            }
            ProtocolMessage::ProducerUpdate(update) => {
                if let Ok(Some(mut agreement)) =
                    self.ctx.store.find_agreement(&update.base.agreement_id)
                {
                    let hash = terms_hash(&agreement.ts_and_cs);
                    match accord_core::protocol::signing::verify_hash(
                        &update.address,
                        &hash,
                        &update.signature,
                    ) {
                        Ok(true) => {
                            agreement.counter_party_address = update.address.clone();
                            agreement.terms_signature = update.signature.clone();
                            self.save(&agreement);
                            let ack = self.engine.build_producer_update_ack(
                                update.base.version,
                                &update.base.agreement_id,
                            );
                            self.send(
                                &ProtocolMessage::ProducerUpdateAck(ack),
                                &agreement.counter_party_id,
                            );
                        }
                        _ => warn!(
                            agreement_id = %update.base.agreement_id,
                            "producer update signature did not verify, dropped"
                        ),
                    }
                }
            }
            ProtocolMessage::Cancel(cancel) => {
                commands.push(AgbotCommand::Cancel {
                    agreement_id: cancel.base.agreement_id,
                    reason: AB_CANCEL_DISCOVERED,
                });
            }
            ProtocolMessage::ConsumerUpdateAck(_) | ProtocolMessage::MeterNotification(_) => {}
            other => {
                debug!(msg_type = other.msg_type(), "ignoring unexpected message");
            }
        }
    }

    fn handle_reply(&mut self, reply: &ProposalReply) {
        let agreement_id = reply.base.agreement_id.clone();
        let agreement = match self.ctx.store.find_agreement(&agreement_id) {
            Ok(Some(agreement)) => agreement,
            Ok(None) => {
                debug!(agreement_id, "reply for unknown agreement, dropped");
                return;
            }
            Err(err) => {
                error!(agreement_id, %err, "store read failed");
                return;
            }
        };
        if agreement.state != AgreementState::Proposed {
            // Redelivered reply; the first one won.
            debug!(agreement_id, state = %agreement.state, "duplicate reply ignored");
            return;
        }

        if !reply.accept {
            let mut agreement = agreement;
            let reason = AB_CANCEL_NEGATIVE_REPLY;
            if agreement
                .mark_terminating(now_secs(), reason, describe(reason))
                .is_ok()
            {
                self.log(
                    LogSeverity::Info,
                    &format!("agreement {agreement_id} rejected by producer"),
                );
                self.note_workload_failure(&agreement);
                self.cooldown_counter_party(&agreement);
                self.archive(agreement);
            }
            return;
        }

        match self.engine.verify_reply(&agreement.ts_and_cs, reply) {
            Ok(true) => {}
            Ok(false) => {
                warn!(agreement_id, "reply signature does not verify, dropped");
                return;
            }
            Err(err) => {
                warn!(agreement_id, %err, "malformed reply signature, dropped");
                return;
            }
        }

        let mut agreement = agreement;
        if agreement
            .mark_replied(now_secs(), &reply.address, &reply.signature)
            .is_err()
        {
            return;
        }
        if reply.anchor.is_some() {
            agreement.anchor = reply.anchor.clone();
        }

        // Witness creation before confirming to the producer.
        if self.ctx.anchor.write_create(&agreement_id).is_err() {
            let reason = AB_CANCEL_BC_WRITE_FAILED;
            let ack = self
                .engine
                .build_reply_ack(agreement.protocol_version, &agreement_id, false);
            self.send(&ProtocolMessage::ReplyAck(ack), &agreement.counter_party_id);
            if agreement
                .mark_terminating(now_secs(), reason, describe(reason))
                .is_ok()
            {
                agreement.anchor_write_failed = true;
                self.log(
                    LogSeverity::Error,
                    &format!("anchor create for {agreement_id} failed"),
                );
                self.cooldown_counter_party(&agreement);
                self.archive(agreement);
            }
            return;
        }

        let ack = self
            .engine
            .build_reply_ack(agreement.protocol_version, &agreement_id, true);
        self.send(&ProtocolMessage::ReplyAck(ack), &agreement.counter_party_id);
        self.save(&agreement);
        self.log(
            LogSeverity::Info,
            &format!("agreement {agreement_id} replied, awaiting anchor"),
        );
    }

    // ---- search --------------------------------------------------------

    fn search(&mut self) -> Vec<AgbotCommand> {
        let mut commands = Vec::new();
        for (org, policy) in self.ctx.policies.all_entries(PolicySide::Consumer) {
            let search_key = (org.clone(), policy.header.name.clone());
            if self
                .last_search
                .get(&search_key)
                .is_some_and(|at| at.elapsed() < self.ctx.config.agbot.search_interval)
            {
                continue;
            }
            self.last_search.insert(search_key, Instant::now());

            let candidates = self.find_candidates(&org, &policy);
            for node in candidates {
                let key = PendingKey {
                    org: org.clone(),
                    policy: policy.header.name.clone(),
                    node: node.id.clone(),
                };
                if self.pending.contains_key(&key) {
                    continue;
                }
                if self
                    .cooldown
                    .get(&key)
                    .is_some_and(|at| at.elapsed() < self.ctx.config.agbot.retry_interval)
                {
                    continue;
                }
                if !self.ctx.policies.has_capacity(&policy, &org) {
                    break;
                }
                let Some(producer) = derive_producer_policy(&node, &policy) else {
                    self.cooldown.insert(key, Instant::now());
                    continue;
                };
                commands.push(AgbotCommand::MakeAgreement {
                    consumer: policy.clone(),
                    producer: Box::new(producer),
                    org: org.clone(),
                    node,
                });
            }
        }
        commands
    }

    fn find_candidates(&self, org: &str, policy: &Policy) -> Vec<NodeSummary> {
        let stale = self.ctx.config.agbot.stale_seconds;
        let result = if let Some(pattern_id) = &policy.pattern_id {
            let (pattern_org, pattern_name) =
                pattern_id.split_once('/').unwrap_or((org, pattern_id.as_str()));
            let service_url = policy
                .workloads
                .first()
                .map(|w| w.workload_url.clone())
                .unwrap_or_default();
            self.ctx.directory.search_pattern(
                pattern_org,
                pattern_name,
                &PatternSearchRequest {
                    service_url,
                    seconds_stale: stale,
                    ..Default::default()
                },
            )
        } else {
            self.ctx.directory.search_nodes(
                org,
                &NodeSearchRequest {
                    service_urls: policy.api_specs.iter().map(|s| s.spec_ref.clone()).collect(),
                    seconds_stale: stale,
                    ..Default::default()
                },
            )
        };
        match result {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(policy = %policy.header.name, %err, "directory search failed");
                Vec::new()
            }
        }
    }

    // ---- served patterns ----------------------------------------------

    fn converge_served_patterns(&mut self) {
        let (org, id) = (
            self.ctx.config.exchange.org.clone(),
            self.ctx.config.exchange.id.clone(),
        );
        let served = match self.ctx.directory.served_patterns(&org, &id) {
            Ok(served) => served,
            Err(err) => {
                warn!(%err, "cannot read served patterns");
                return;
            }
        };

        let mut seen: HashSet<(String, String)> = HashSet::new();
        for assignment in &served {
            let patterns = match self
                .ctx
                .directory
                .get_patterns(&assignment.pattern_org, Some(&assignment.pattern))
            {
                Ok(patterns) => patterns,
                Err(err) => {
                    warn!(pattern = %assignment.pattern, %err, "cannot read pattern");
                    continue;
                }
            };
            for (pattern_name, pattern) in &patterns {
                for service in &pattern.services {
                    // Agreement-less services are launched by node
                    // configuration and never negotiated.
                    if service.agreement_less {
                        continue;
                    }
                    let name = pattern_policy_name(
                        &assignment.pattern_org,
                        pattern_name,
                        &service.service_url,
                    );
                    seen.insert((assignment.pattern_org.clone(), name.clone()));
                    if self
                        .ctx
                        .policies
                        .find(PolicySide::Consumer, &assignment.pattern_org, &name)
                        .is_some()
                    {
                        continue;
                    }
                    match policy_from_pattern_service(assignment, pattern_name, pattern, service) {
                        Some(policy) => {
                            info!(policy = %name, pattern = %pattern_name, "generated consumer policy");
                            let change = self.ctx.policies.register(
                                PolicySide::Consumer,
                                &assignment.pattern_org,
                                policy,
                            );
                            self.ctx.bus.publish(change.into());
                        }
                        None => warn!(
                            pattern = %pattern_name,
                            service = %service.service_url,
                            "pattern service entry is not usable"
                        ),
                    }
                }
            }
        }

        // Drop generated policies whose assignment went away.
        for (org, policy) in self.ctx.policies.all_entries(PolicySide::Consumer) {
            if policy.pattern_id.is_none() {
                continue;
            }
            let key = (org.clone(), policy.header.name.clone());
            if !seen.contains(&key) {
                info!(policy = %policy.header.name, "dropping unserved pattern policy");
                if let Ok(change) =
                    self.ctx
                        .policies
                        .delete(PolicySide::Consumer, &org, &policy.header.name)
                {
                    self.ctx.bus.publish(change.into());
                }
                let name = policy.header.name.clone();
                self.pending
                    .retain(|k, _| !(k.org == org && k.policy == name));
            }
        }
    }
}

impl Worker for AgbotWorker {
    type Command = AgbotCommand;

    fn name(&self) -> &'static str {
        "agbot"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::AgreementTimeout,
            EventKind::Anchor,
            EventKind::DataVerified,
            EventKind::PolicyDeleted,
        ]
    }

    fn commands_for(&mut self, event: &Event) -> Vec<AgbotCommand> {
        match event {
            Event::AgreementTimeout {
                agreement_id,
                reason,
                role: AgreementRole::Consumer,
                ..
            } => vec![AgbotCommand::Cancel {
                agreement_id: agreement_id.clone(),
                reason: *reason,
            }],
            Event::Anchor(anchor_event) => vec![AgbotCommand::AnchorSeen(anchor_event.clone())],
            Event::DataVerified { agreement_id } => vec![AgbotCommand::DataSeen {
                agreement_id: agreement_id.clone(),
            }],
            Event::PolicyDeleted {
                side: PolicySide::Consumer,
                org,
                name,
            } => vec![AgbotCommand::PolicyGone {
                org: org.clone(),
                name: name.clone(),
            }],
            _ => Vec::new(),
        }
    }

    fn handle_command(&mut self, cmd: AgbotCommand) -> Disposition<AgbotCommand> {
        match cmd {
            AgbotCommand::MakeAgreement {
                consumer,
                producer,
                org,
                node,
            } => self.make_agreement(&consumer, &producer, &org, &node),
            AgbotCommand::Cancel {
                agreement_id,
                reason,
            } => self.cancel(&agreement_id, reason),
            AgbotCommand::AnchorSeen(event) => {
                if self.anchor_seen(&event) {
                    return Disposition::Requeue(AgbotCommand::AnchorSeen(event));
                }
            }
            AgbotCommand::DataSeen { agreement_id } => self.data_seen(&agreement_id),
            AgbotCommand::PolicyGone { org, name } => {
                self.pending
                    .retain(|k, _| !(k.org == org && k.policy == name));
            }
        }
        Disposition::Done
    }

    fn no_command_work(&mut self) -> Vec<AgbotCommand> {
        let mut commands = Vec::new();
        self.converge_served_patterns();
        let (org, id) = (
            self.ctx.config.exchange.org.clone(),
            self.ctx.config.exchange.id.clone(),
        );
        for msg in mailbox::drain(
            &self.ctx.directory,
            PartyKind::Agbot,
            &org,
            &id,
            &self.ctx.identity,
        ) {
            self.handle_message(msg, &mut commands);
        }
        commands.extend(self.search());
        commands
    }

    fn tick_interval(&self) -> Duration {
        self.ctx.config.exchange.poll_interval
    }
}

/// Builds a candidate's effective producer policy from the services it
/// registered with the directory.
///
/// Each registered service carries its generated producer policy; when it
/// does not, a minimal one is synthesized from the service facts. Returns
/// `None` when the node does not run every required service.
#[must_use]
pub fn derive_producer_policy(node: &NodeSummary, consumer: &Policy) -> Option<Policy> {
    let mut merged: Option<Policy> = None;
    for spec in &consumer.api_specs {
        let service = node.registered_services.iter().find(|s| {
            s.url == spec.spec_ref && (s.org.is_empty() || s.org == spec.org)
        })?;

        let parsed: Policy = if service.policy.is_empty() {
            synthesize_service_policy(service, spec)
        } else {
            match serde_json::from_str(&service.policy) {
                Ok(policy) => policy,
                Err(err) => {
                    warn!(node = %node.id, service = %service.url, %err, "unparseable producer policy");
                    return None;
                }
            }
        };

        merged = Some(match merged {
            None => parsed,
            Some(mut combined) => {
                combined.api_specs.extend(parsed.api_specs);
                combined.properties = accord_core::policy::property::merge_properties(
                    &combined.properties,
                    &parsed.properties,
                );
                combined
            }
        });
    }
    merged
}

fn synthesize_service_policy(
    service: &crate::exchange::types::RegisteredService,
    spec: &accord_core::policy::api_spec::ApiSpec,
) -> Policy {
    use accord_core::policy::api_spec::ApiSpec;
    use accord_core::version::{Version, VersionRange};

    let mut policy = Policy::named(format!("service-{}", service.url));
    let version = service
        .version
        .parse::<Version>()
        .map(VersionRange::exact)
        .unwrap_or_default();
    policy.api_specs = vec![ApiSpec::new(
        service.url.clone(),
        if service.org.is_empty() {
            spec.org.clone()
        } else {
            service.org.clone()
        },
        version,
        if service.arch.is_empty() {
            spec.arch.clone()
        } else {
            service.arch.clone()
        },
    )];
    policy.properties = service.properties.clone();
    policy.agreement_protocols = vec![AgreementProtocol::new(PROTOCOL_NAME)];
    policy.max_agreements = 1;
    policy
}
