//! The producer worker ("node").
//!
//! Owns the node's configuration lifecycle and every producer-side
//! agreement: it resolves the node's pattern into service definitions,
//! generates producer policies from services and attributes, registers
//! with the directory and heartbeats it, decides on incoming proposals
//! (re-running the match locally; the consumer's claim is not trusted),
//! and tears agreements down when governance or the counter party says
//! so. Workload launch itself is the container collaborator's job; this
//! worker posts `AgreementReached` and reacts to `WorkloadStarted` /
//! `WorkloadFault`.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use accord_core::agreement::{Agreement, AgreementRole, AgreementState};
use accord_core::anchor::{AnchorEvent, AnchorEventKind};
use accord_core::attributes::AttributeVariant;
use accord_core::events::{Event, EventKind};
use accord_core::persistence::records::{category, ConfigState, LogSeverity};
use accord_core::policy::data_verification::{DataVerification, Meter};
use accord_core::policy::manager::PolicySide;
use accord_core::policy::protocols::AgreementProtocol;
use accord_core::policy::Policy;
use accord_core::protocol::canonical::to_canonical_json;
use accord_core::protocol::engine::ProtocolEngine;
use accord_core::protocol::message::{Proposal, ProposalReply, ProtocolMessage};
use accord_core::protocol::signing::verify_hash;
use accord_core::protocol::PROTOCOL_NAME;
use accord_core::reason::{
    describe, AB_CANCEL_DISCOVERED, CANCEL_AGBOT_REQUESTED, CANCEL_NODE_SHUTDOWN,
};
use accord_core::service::{ServiceDefinition, ServiceInstance, UserInputSpec};
use accord_core::version::Version;

use crate::context::WorkerContext;
use crate::exchange::types::{NodeAgreementState, NodePut, RegisteredService};
use crate::exchange::PartyKind;
use crate::mailbox::{self, MailboxSender};
use crate::now_secs;
use crate::runtime::{Disposition, SubworkerSet, Worker};

/// Commands processed by the node worker.
#[derive(Debug)]
pub enum NodeCommand {
    /// Announce the node to the directory (registration recorded).
    Register,
    /// Resolve pattern, configure services, publish producer policies.
    Configure,
    /// Cancel an agreement with a classified reason.
    Cancel {
        /// Agreement id.
        agreement_id: String,
        /// Classified reason code.
        reason: u32,
    },
    /// An anchor event referencing one of our agreements.
    AnchorSeen(AnchorEvent),
    /// The container collaborator reports the workload running.
    WorkloadStarted {
        /// Agreement id.
        agreement_id: String,
    },
    /// Tear everything down; the node is being unconfigured.
    Unconfigure,
}

/// The producer worker.
pub struct NodeWorker {
    ctx: WorkerContext,
    engine: ProtocolEngine,
    sender: MailboxSender,
    subworkers: SubworkerSet,
    heartbeat_running: bool,
}

impl NodeWorker {
    /// Creates the worker.
    #[must_use]
    pub fn new(ctx: WorkerContext) -> Self {
        let sender = MailboxSender::new(
            ctx.directory.clone(),
            ctx.keys.clone(),
            PartyKind::Agbot,
            ctx.config.exchange.message_ttl,
        );
        Self {
            ctx,
            engine: ProtocolEngine::new(),
            sender,
            subworkers: SubworkerSet::new(),
            heartbeat_running: false,
        }
    }

    /// Starts the heartbeat subworker once the node has a registration.
    fn ensure_heartbeat(&mut self) {
        if self.heartbeat_running {
            return;
        }
        self.heartbeat_running = true;
        let directory = self.ctx.directory.clone();
        let store = self.ctx.store.clone();
        self.subworkers.spawn(
            "heartbeat",
            self.ctx.config.node.heartbeat_interval,
            move || {
                let Ok(Some(node)) = store.find_node() else {
                    return;
                };
                if node.config_state == ConfigState::Unconfiguring {
                    return;
                }
                if let Err(err) = directory.heartbeat(&node.org, &node.id) {
                    warn!(%err, "directory heartbeat failed");
                }
            },
        );
    }

    fn log(&self, severity: LogSeverity, category: &str, message: &str) {
        if let Err(err) = self.ctx.store.log_event(now_secs(), severity, category, message) {
            error!(%err, "event log write failed");
        }
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

    fn publish_agreement_state(&self, agreement: &Agreement) {
        let node = self.ctx.config.exchange.id.clone();
        let org = self.ctx.config.exchange.org.clone();
        let state = NodeAgreementState {
            state: agreement.state.as_str().to_string(),
            workload: agreement.workload.workload_url.clone(),
        };
        if let Err(err) =
            self.ctx
                .directory
                .put_node_agreement(&org, &node, &agreement.id, &state)
        {
            warn!(agreement_id = %agreement.id, %err, "could not publish agreement state");
        }
    }

    fn retract_agreement_state(&self, agreement_id: &str) {
        let node = self.ctx.config.exchange.id.clone();
        let org = self.ctx.config.exchange.org.clone();
        if let Err(err) = self
            .ctx
            .directory
            .delete_node_agreement(&org, &node, agreement_id)
        {
            warn!(agreement_id, %err, "could not retract agreement state");
        }
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
        self.ctx
            .policies
            .cancel_agreement(&agreement.id, &agreement.policy_name, &agreement.org);
        self.release_instances(&agreement.id);
        self.retract_agreement_state(&agreement.id);
        info!(agreement_id = %agreement.id, reason = agreement.terminated_reason, "agreement archived");
    }

    /// Unbinds the agreement from its service instances; instances left
    /// with no agreements (and not agreement-less) are cleaned up.
    fn release_instances(&self, agreement_id: &str) {
        let instances = match self.ctx.store.service_instances() {
            Ok(instances) => instances,
            Err(err) => {
                error!(%err, "cannot list service instances");
                return;
            }
        };
        for mut instance in instances {
            if !instance.associated_agreements.iter().any(|a| a == agreement_id) {
                continue;
            }
            let garbage = instance.release_agreement(agreement_id);
            if garbage {
                instance.cleanup_start_time = now_secs();
                if let Err(err) = self.ctx.store.save_service_instance(&instance) {
                    error!(%err, "instance write failed");
                    continue;
                }
                if let Err(err) = self.ctx.store.delete_service_instance(&instance.instance_id) {
                    error!(%err, "instance delete failed");
                }
                self.log(
                    LogSeverity::Info,
                    category::SERVICE,
                    &format!("service instance {} cleaned up", instance.instance_id),
                );
            } else if let Err(err) = self.ctx.store.save_service_instance(&instance) {
                error!(%err, "instance write failed");
            }
        }
    }

    // ---- registration and configuration --------------------------------

    fn register(&mut self) {
        let node = match self.ctx.store.find_node() {
            Ok(Some(node)) => node,
            Ok(None) => {
                warn!("register requested but no node record exists");
                return;
            }
            Err(err) => {
                error!(%err, "store read failed");
                return;
            }
        };
        let put = NodePut {
            name: node.name.clone(),
            pattern: node.pattern.clone().unwrap_or_default(),
            registered_services: Vec::new(),
            msg_end_point: String::new(),
            public_key: hex::encode(self.ctx.identity.mailbox_public()),
            arch: std::env::consts::ARCH.to_string(),
            last_heartbeat: 0,
        };
        match self.ctx.directory.put_node(&node.org, &node.id, &put) {
            Ok(()) => {
                self.log(
                    LogSeverity::Info,
                    category::NODE_CONFIG,
                    &format!("node {}/{} announced to directory", node.org, node.id),
                );
            }
            Err(err) => {
                error!(%err, "node registration with directory failed");
                self.log(
                    LogSeverity::Error,
                    category::EXCHANGE,
                    &format!("directory registration failed: {err}"),
                );
            }
        }
    }

    fn configure(&mut self) {
        let node = match self.ctx.store.find_node() {
            Ok(Some(node)) => node,
            _ => return,
        };

        if let Some(pattern_full) = node.pattern.clone() {
            self.resolve_pattern(&node.org, &pattern_full);
        }

        let defs = match self.ctx.store.service_defs() {
            Ok(defs) => defs,
            Err(err) => {
                error!(%err, "cannot list service definitions");
                return;
            }
        };
        let attributes = self.ctx.store.attributes().unwrap_or_default();

        let mut registered = Vec::new();
        for def in &defs {
            let supplied: Vec<String> = attributes
                .iter()
                .filter(|a| a.applies_to(&def.spec_ref, &def.org))
                .filter_map(|a| match &a.variant {
                    AttributeVariant::UserInput { inputs } => {
                        Some(inputs.keys().cloned().collect::<Vec<_>>())
                    }
                    _ => None,
                })
                .flatten()
                .collect();
            let missing = def.missing_inputs(&supplied);
            if !missing.is_empty() {
                self.log(
                    LogSeverity::Error,
                    category::NODE_CONFIG,
                    &format!(
                        "service {} is missing required inputs: {}",
                        def.spec_ref,
                        missing.join(", ")
                    ),
                );
                continue;
            }

            let policy = producer_policy_for(def, &attributes);
            let policy_text = to_canonical_json(&policy).unwrap_or_default();
            registered.push(RegisteredService {
                url: def.spec_ref.clone(),
                org: def.org.clone(),
                version: def.version.min.to_string(),
                arch: def.arch.clone(),
                properties: policy.properties.clone(),
                policy: policy_text,
            });
            let change = self
                .ctx
                .policies
                .register(PolicySide::Producer, &node.org, policy);
            self.ctx.bus.publish(change.into());
        }

        let put = NodePut {
            name: node.name.clone(),
            pattern: node.pattern.clone().unwrap_or_default(),
            registered_services: registered,
            msg_end_point: String::new(),
            public_key: hex::encode(self.ctx.identity.mailbox_public()),
            arch: std::env::consts::ARCH.to_string(),
            last_heartbeat: 0,
        };
        if let Err(err) = self.ctx.directory.put_node(&node.org, &node.id, &put) {
            error!(%err, "service registration with directory failed");
            return;
        }
        self.log(
            LogSeverity::Info,
            category::NODE_CONFIG,
            "node configured; services registered with directory",
        );
        info!(services = defs.len(), "node configured");
    }

    /// Resolves the node's pattern into service definitions. An existing
    /// definition wins over the pattern's (the prior registration is kept).
    fn resolve_pattern(&mut self, node_org: &str, pattern_full: &str) {
        let (pattern_org, pattern_name) = pattern_full
            .split_once('/')
            .unwrap_or((node_org, pattern_full));
        let patterns = match self
            .ctx
            .directory
            .get_patterns(pattern_org, Some(pattern_name))
        {
            Ok(patterns) => patterns,
            Err(err) => {
                error!(pattern = pattern_full, %err, "cannot resolve pattern");
                return;
            }
        };
        let existing: Vec<String> = self
            .ctx
            .store
            .service_defs()
            .unwrap_or_default()
            .iter()
            .map(|d| d.id.clone())
            .collect();

        for pattern in patterns.values() {
            for service in &pattern.services {
                let id = service_def_id(&service.service_url, &service.service_org);
                if existing.contains(&id) {
                    // Duplicate service on autoconfig: the prior
                    // registration wins.
                    debug!(service = %service.service_url, "service already configured");
                    continue;
                }
                let mut versions: Vec<Version> = service
                    .service_versions
                    .iter()
                    .filter_map(|v| v.version.parse().ok())
                    .collect();
                versions.sort_unstable();
                let Some(lowest) = versions.first().copied() else {
                    continue;
                };
                let def = ServiceDefinition {
                    id,
                    spec_ref: service.service_url.clone(),
                    org: service.service_org.clone(),
                    version: accord_core::version::VersionRange {
                        min: lowest,
                        min_inclusive: true,
                        max: None,
                        max_inclusive: false,
                    },
                    arch: service.service_arch.clone(),
                    agreement_less: service.agreement_less,
                    available_version: versions
                        .last()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    upgrade: accord_core::service::UpgradePolicy::default(),
                    user_inputs: Vec::<UserInputSpec>::new(),
                };
                if let Err(err) = self.ctx.store.save_service_def(&def) {
                    error!(%err, "service definition write failed");
                }
            }
        }
    }

    // ---- protocol ------------------------------------------------------

    fn handle_proposal(&mut self, proposal: &Proposal) {
        let agreement_id = proposal.base.agreement_id.clone();

        // Duplicate proposals replay the original reply; exactly one
        // agreement record ever exists per id.
        match self.ctx.store.find_agreement(&agreement_id) {
            Ok(Some(existing)) => {
                debug!(agreement_id, "duplicate proposal, replaying reply");
                let reply = ProposalReply {
                    base: proposal.base.clone(),
                    accept: true,
                    signature: existing.terms_signature.clone(),
                    address: self.ctx.identity.address(),
                    anchor: existing.anchor.clone(),
                };
                self.send(&ProtocolMessage::ProposalReply(reply), &proposal.consumer_id);
                return;
            }
            Ok(None) => {}
            Err(err) => {
                error!(agreement_id, %err, "store read failed");
                return;
            }
        }
        if matches!(self.ctx.store.find_archived(&agreement_id), Ok(Some(_))) {
            debug!(agreement_id, "proposal for archived agreement ignored");
            return;
        }

        let node = match self.ctx.store.find_node() {
            Ok(Some(node)) if node.config_state == ConfigState::Configured => node,
            _ => {
                debug!(agreement_id, "proposal received while not configured, ignored");
                return;
            }
        };

        let locals = self.ctx.policies.get_all(PolicySide::Producer, &node.org);
        let decision = match self
            .engine
            .decide_on_proposal(proposal, &locals, &self.ctx.identity)
        {
            Ok(decision) => decision,
            Err(err) => {
                warn!(agreement_id, %err, "undecidable proposal dropped");
                return;
            }
        };

        let mut reply = decision.reply;

        // Bind to the policy before answering; a full cap turns the
        // acceptance into a rejection.
        if reply.accept {
            if let Some(policy_name) = &decision.policy_name {
                let bound = self
                    .ctx
                    .policies
                    .find(PolicySide::Producer, &node.org, policy_name)
                    .map(|policy| {
                        self.ctx
                            .policies
                            .record_agreement(&agreement_id, &policy, &node.org)
                    });
                if let Some(Err(err)) = bound {
                    warn!(agreement_id, %err, "cannot bind agreement, rejecting");
                    reply.accept = false;
                    reply.signature = String::new();
                    reply.address = String::new();
                    reply.anchor = None;
                }
            }
        }

        // Persist the record before the reply leaves: once the consumer
        // can see the acceptance, the agreement must already exist here.
        if reply.accept {
            if let (Some(terms), Some(hash), Some(policy_name)) = (
                decision.terms.as_ref(),
                decision.terms_hash.clone(),
                decision.policy_name.clone(),
            ) {
                let workload = terms.workloads.first().cloned().unwrap_or_default();
                let mut agreement = Agreement::new(
                    agreement_id.clone(),
                    AgreementRole::Producer,
                    self.engine.name(),
                    proposal.base.version,
                    proposal.consumer_id.clone(),
                    policy_name,
                    node.org.clone(),
                    proposal.ts_and_cs.clone(),
                    hash,
                    proposal.producer_policy.clone(),
                    workload,
                    now_secs(),
                );
                agreement.terms_signature = reply.signature.clone();
                self.save(&agreement);
                self.publish_agreement_state(&agreement);
            }
        }

        let accepted = reply.accept;
        self.send(
            &ProtocolMessage::ProposalReply(reply),
            &proposal.consumer_id,
        );
        self.log(
            LogSeverity::Info,
            category::AGREEMENT,
            &format!(
                "proposal {agreement_id} from {} {}",
                proposal.consumer_id,
                if accepted { "accepted" } else { "rejected" }
            ),
        );
    }

    fn handle_reply_ack(&mut self, agreement_id: &str, proceed: bool) {
        let agreement = match self.ctx.store.find_agreement(agreement_id) {
            Ok(Some(agreement)) => agreement,
            _ => return,
        };
        if !proceed {
            let mut agreement = agreement;
            let reason = CANCEL_AGBOT_REQUESTED;
            if agreement
                .mark_terminating(now_secs(), reason, describe(reason))
                .is_ok()
            {
                self.archive(agreement);
            }
            return;
        }
        if agreement.state == AgreementState::Proposed {
            let mut agreement = agreement;
            let address = self.ctx.identity.address();
            let signature = agreement.terms_signature.clone();
            if agreement.mark_replied(now_secs(), &address, &signature).is_ok() {
                self.save(&agreement);
            }
        }
    }

    fn handle_message(&mut self, msg: ProtocolMessage, commands: &mut Vec<NodeCommand>) {
        match msg {
            ProtocolMessage::Proposal(proposal) => self.handle_proposal(&proposal),
            ProtocolMessage::ReplyAck(ack) => {
                self.handle_reply_ack(&ack.base.agreement_id, ack.proceed);
            }
            ProtocolMessage::DataReceived(notice) => {
                if let Ok(Some(mut agreement)) =
                    self.ctx.store.find_agreement(&notice.base.agreement_id)
                {
                    agreement.data_notification = now_secs();
                    self.save(&agreement);
                    let ack = self
                        .engine
                        .build_data_received_ack(notice.base.version, &notice.base.agreement_id);
                    self.send(
                        &ProtocolMessage::DataReceivedAck(ack),
                        &agreement.counter_party_id,
                    );
                }
            }
            ProtocolMessage::MeterNotification(notification) => {
                if let Ok(Some(mut agreement)) = self
                    .ctx
                    .store
                    .find_agreement(&notification.base.agreement_id)
                {
                    let reading = &notification.meter;
                    let verified = if agreement.counter_party_address.is_empty() {
                        false
                    } else {
                        verify_hash(
                            &agreement.counter_party_address,
                            &reading.reading_hash(),
                            &reading.consumer_signature,
                        )
                        .unwrap_or(false)
                    };
                    if verified && reading.agreement_hash == agreement.terms_hash {
                        agreement.last_meter = Some(reading.clone());
                        self.save(&agreement);
                    } else {
                        warn!(
                            agreement_id = %agreement.id,
                            "metering notification did not verify, dropped"
                        );
                    }
                }
            }
            ProtocolMessage::ConsumerUpdate(update) => {
                if let Ok(Some(mut agreement)) =
                    self.ctx.store.find_agreement(&update.base.agreement_id)
                {
                    agreement.counter_party_address = update.address.clone();
                    self.save(&agreement);
                    let ack = self
                        .engine
                        .build_consumer_update_ack(update.base.version, &update.base.agreement_id);
                    self.send(
                        &ProtocolMessage::ConsumerUpdateAck(ack),
                        &agreement.counter_party_id,
                    );
                }
            }
            ProtocolMessage::Cancel(cancel) => {
                commands.push(NodeCommand::Cancel {
                    agreement_id: cancel.base.agreement_id,
                    reason: CANCEL_AGBOT_REQUESTED,
                });
            }
            other => {
                debug!(msg_type = other.msg_type(), "ignoring unexpected message");
            }
        }
    }

    // ---- lifecycle -----------------------------------------------------

    fn cancel(&mut self, agreement_id: &str, reason: u32) {
        let agreement = match self.ctx.store.find_agreement(agreement_id) {
            Ok(Some(agreement)) => agreement,
            _ => return,
        };
        if agreement.role != AgreementRole::Producer {
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
            category::AGREEMENT,
            &format!("agreement {agreement_id} terminating: {}", describe(reason)),
        );

        let cancel = self
            .engine
            .build_cancel(agreement.protocol_version, agreement_id, reason);
        self.send(
            &ProtocolMessage::Cancel(cancel),
            &agreement.counter_party_id,
        );

        if had_anchor_record {
            if self
                .ctx
                .anchor
                .write_terminate(AnchorEventKind::ProducerTerm, agreement_id, reason)
                .is_err()
            {
                agreement.anchor_write_failed = true;
                self.log(
                    LogSeverity::Error,
                    category::ANCHOR,
                    &format!("anchor write for {agreement_id} failed"),
                );
            }
            self.save(&agreement);
        } else {
            self.archive(agreement);
        }
    }

    fn finish_terminating(&mut self, mut agreement: Agreement) {
        if agreement.anchor_write_failed
            && self
                .ctx
                .anchor
                .write_terminate(
                    AnchorEventKind::ProducerTerm,
                    &agreement.id,
                    agreement.terminated_reason,
                )
                .is_ok()
        {
            agreement.anchor_write_failed = false;
            self.save(&agreement);
        }
        let waited = now_secs().saturating_sub(agreement.terminated);
        if waited > self.ctx.config.node.finalize_timeout.as_secs() {
            self.archive(agreement);
        }
    }

    /// Returns `true` when the event arrived ahead of the handshake and
    /// should be retried after the mailbox drains.
    fn anchor_seen(&mut self, event: &AnchorEvent) -> bool {
        let agreement = match self.ctx.store.find_agreement(&event.agreement_id) {
            Ok(Some(agreement)) => agreement,
            _ => return false,
        };
        if agreement.role != AgreementRole::Producer {
            return false;
        }
        match event.kind {
            AnchorEventKind::AgreementCreate => {
                if agreement.state == AgreementState::Proposed {
                    // The create can outrun the consumer's reply-ack.
                    return true;
                }
                if agreement.state == AgreementState::Replied {
                    let mut agreement = agreement;
                    if agreement.mark_confirmed(now_secs()).is_ok() {
                        self.save(&agreement);
                        self.publish_agreement_state(&agreement);
                        self.start_workload(&agreement);
                    }
                }
            }
            kind if kind.is_termination() => {
                if agreement.state == AgreementState::Terminating {
                    self.archive(agreement);
                } else {
                    // A termination we did not initiate: discovered.
                    let mut agreement = agreement;
                    let reason = AB_CANCEL_DISCOVERED;
                    if agreement
                        .mark_terminating(now_secs(), reason, describe(reason))
                        .is_ok()
                    {
                        self.archive(agreement);
                    }
                }
            }
            _ => {}
        }
        false
    }

    /// Creates the instance record and hands the launch to the container
    /// collaborator via the bus.
    fn start_workload(&mut self, agreement: &Agreement) {
        let workload = &agreement.workload;
        let mut instance = ServiceInstance::new(
            format!("{}-{}", short_id(&agreement.id), sanitize(&workload.workload_url)),
            workload.workload_url.clone(),
            workload.org.clone(),
            workload.version.clone(),
            workload.arch.clone(),
        );
        instance.associate_agreement(&agreement.id);
        if let Err(err) = self.ctx.store.save_service_instance(&instance) {
            error!(agreement_id = %agreement.id, %err, "instance write failed");
        }
        self.ctx.bus.publish(Event::AgreementReached {
            agreement_id: agreement.id.clone(),
            protocol: agreement.protocol.clone(),
        });
        self.log(
            LogSeverity::Info,
            category::AGREEMENT,
            &format!("agreement {} confirmed; launching workload", agreement.id),
        );
    }

    fn workload_started(&mut self, agreement_id: &str) {
        let Ok(Some(mut agreement)) = self.ctx.store.find_agreement(agreement_id) else {
            return;
        };
        if agreement.state != AgreementState::Confirmed {
            return;
        }
        let now = now_secs();
        if agreement.mark_execution_started(now).is_err() {
            return;
        }
        self.save(&agreement);
        self.publish_agreement_state(&agreement);

        if let Ok(instances) = self.ctx.store.service_instances() {
            for mut instance in instances {
                if instance.associated_agreements.iter().any(|a| a == agreement_id)
                    && instance.execution_start_time == 0
                {
                    instance.execution_start_time = now;
                    let _ = self.ctx.store.save_service_instance(&instance);
                }
            }
        }
        info!(agreement_id, "workload executing");
    }

    fn unconfigure(&mut self) {
        let node = match self.ctx.store.find_node() {
            Ok(Some(mut node)) => {
                node.config_state = ConfigState::Unconfiguring;
                if let Err(err) = self.ctx.store.save_node(&node) {
                    error!(%err, "node record write failed");
                }
                node
            }
            _ => return,
        };
        self.log(
            LogSeverity::Info,
            category::NODE_CONFIG,
            "node unconfiguring; cancelling all agreements",
        );

        let agreements = self.ctx.store.agreements().unwrap_or_default();
        for agreement in agreements {
            if agreement.role == AgreementRole::Producer {
                self.cancel(&agreement.id, CANCEL_NODE_SHUTDOWN);
            }
        }
        for (org, policy) in self.ctx.policies.all_entries(PolicySide::Producer) {
            if org == node.org {
                if let Ok(change) =
                    self.ctx
                        .policies
                        .delete(PolicySide::Producer, &org, &policy.header.name)
                {
                    self.ctx.bus.publish(change.into());
                }
            }
        }
    }

}

impl Worker for NodeWorker {
    type Command = NodeCommand;

    fn name(&self) -> &'static str {
        "node"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![
            EventKind::NodeRegistered,
            EventKind::NodeConfigured,
            EventKind::NodeUnconfiguring,
            EventKind::AgreementTimeout,
            EventKind::Anchor,
            EventKind::WorkloadStarted,
            EventKind::WorkloadFault,
        ]
    }

    fn commands_for(&mut self, event: &Event) -> Vec<NodeCommand> {
        match event {
            Event::NodeRegistered { .. } => vec![NodeCommand::Register],
            Event::NodeConfigured { .. } => vec![NodeCommand::Configure],
            Event::NodeUnconfiguring => vec![NodeCommand::Unconfigure],
            Event::AgreementTimeout {
                agreement_id,
                reason,
                role: AgreementRole::Producer,
                ..
            } => vec![NodeCommand::Cancel {
                agreement_id: agreement_id.clone(),
                reason: *reason,
            }],
            Event::Anchor(anchor_event) => vec![NodeCommand::AnchorSeen(anchor_event.clone())],
            Event::WorkloadStarted { agreement_id } => vec![NodeCommand::WorkloadStarted {
                agreement_id: agreement_id.clone(),
            }],
            Event::WorkloadFault {
                agreement_id,
                failure_code,
                ..
            } => vec![NodeCommand::Cancel {
                agreement_id: agreement_id.clone(),
                reason: *failure_code,
            }],
            _ => Vec::new(),
        }
    }

    fn handle_command(&mut self, cmd: NodeCommand) -> Disposition<NodeCommand> {
        match cmd {
            NodeCommand::Register => self.register(),
            NodeCommand::Configure => self.configure(),
            NodeCommand::Cancel {
                agreement_id,
                reason,
            } => self.cancel(&agreement_id, reason),
            NodeCommand::AnchorSeen(event) => {
                if self.anchor_seen(&event) {
                    return Disposition::Requeue(NodeCommand::AnchorSeen(event));
                }
            }
            NodeCommand::WorkloadStarted { agreement_id } => self.workload_started(&agreement_id),
            NodeCommand::Unconfigure => self.unconfigure(),
        }
        Disposition::Done
    }

    fn no_command_work(&mut self) -> Vec<NodeCommand> {
        let mut commands = Vec::new();
        let node = match self.ctx.store.find_node() {
            Ok(Some(node)) => node,
            _ => return commands,
        };
        self.ensure_heartbeat();
        for msg in mailbox::drain(
            &self.ctx.directory,
            PartyKind::Node,
            &node.org,
            &node.id,
            &self.ctx.identity,
        ) {
            self.handle_message(msg, &mut commands);
        }
        commands
    }

    fn tick_interval(&self) -> Duration {
        self.ctx.config.exchange.poll_interval
    }

    fn drain(&mut self) {
        self.subworkers.drain();
    }
}

/// Builds the producer policy for one service from its definition and the
/// attributes scoped to it.
#[must_use]
pub fn producer_policy_for(
    def: &ServiceDefinition,
    attributes: &[accord_core::attributes::Attribute],
) -> Policy {
    use accord_core::policy::api_spec::ApiSpec;
    use accord_core::policy::property::{Property, PropertyValue};

    let mut policy = Policy::named(format!("device-{}", sanitize(&def.spec_ref)));
    policy.api_specs = vec![ApiSpec::new(
        def.spec_ref.clone(),
        def.org.clone(),
        def.version.clone(),
        def.arch.clone(),
    )];
    policy.agreement_protocols = vec![AgreementProtocol::new(PROTOCOL_NAME)];
    policy.properties = vec![Property::new(
        "arch",
        PropertyValue::Text(def.arch.clone()),
    )];
    policy.max_agreements = 1;

    for attribute in attributes {
        if attribute.host_only || !attribute.applies_to(&def.spec_ref, &def.org) {
            continue;
        }
        match &attribute.variant {
            AttributeVariant::Compute { cpus, ram } => {
                policy.properties.push(Property::new("cpus", PropertyValue::Int(*cpus)));
                policy.properties.push(Property::new("ram", PropertyValue::Int(*ram)));
            }
            AttributeVariant::Property { mappings } => {
                for prop in mappings {
                    if !policy.properties.iter().any(|p| p.name == prop.name) {
                        policy.properties.push(prop.clone());
                    }
                }
            }
            AttributeVariant::CounterPartyProperty { expression } => {
                policy.counter_party_properties = Some(expression.clone());
            }
            AttributeVariant::AgreementProtocol { protocols } => {
                policy.agreement_protocols = protocols.clone();
            }
            AttributeVariant::Metering {
                tokens,
                per_time_unit,
                notification_interval,
            } => {
                policy.data_verification = DataVerification {
                    enabled: true,
                    metering: Meter {
                        tokens: *tokens,
                        per_time_unit: per_time_unit.clone(),
                        notification_interval: *notification_interval,
                    },
                    ..policy.data_verification.clone()
                };
            }
            AttributeVariant::Ha { partners } => {
                policy.ha_group = Some(accord_core::policy::HaGroup {
                    partners: partners.clone(),
                });
            }
            AttributeVariant::UserInput { .. } => {}
        }
    }
    policy
}

fn service_def_id(url: &str, org: &str) -> String {
    format!("{org}_{}", sanitize(url))
}

fn sanitize(url: &str) -> String {
    url.replace(|c: char| !c.is_ascii_alphanumeric() && c != '-', "-")
}

fn short_id(agreement_id: &str) -> &str {
    agreement_id.get(..8).unwrap_or(agreement_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_core::attributes::Attribute;
    use accord_core::policy::property::CompareOp;
    use accord_core::policy::property::Constraint;

    fn def() -> ServiceDefinition {
        ServiceDefinition {
            id: "myorg_svc-a".into(),
            spec_ref: "https://svc/a".into(),
            org: "myorg".into(),
            version: "1.2.0".parse().unwrap(),
            arch: "amd64".into(),
            agreement_less: false,
            available_version: "1.2.0".into(),
            upgrade: Default::default(),
            user_inputs: vec![],
        }
    }

    #[test]
    fn test_producer_policy_from_attributes() {
        let attributes = vec![
            Attribute {
                id: "a1".into(),
                label: String::new(),
                publishable: true,
                host_only: false,
                service_specs: vec![],
                variant: AttributeVariant::Compute { cpus: 2, ram: 2048 },
            },
            Attribute {
                id: "a2".into(),
                label: String::new(),
                publishable: false,
                host_only: false,
                service_specs: vec![],
                variant: AttributeVariant::CounterPartyProperty {
                    expression: Constraint::Require {
                        name: "tier".into(),
                        op: CompareOp::Eq,
                        value: "gold".into(),
                    },
                },
            },
        ];
        let policy = producer_policy_for(&def(), &attributes);
        assert_eq!(policy.api_specs[0].spec_ref, "https://svc/a");
        assert!(policy.properties.iter().any(|p| p.name == "ram"));
        assert!(policy.counter_party_properties.is_some());
        assert_eq!(policy.max_agreements, 1);
        assert_eq!(policy.agreement_protocols[0].name, PROTOCOL_NAME);
    }

    #[test]
    fn test_host_only_attributes_stay_local() {
        let attributes = vec![Attribute {
            id: "a1".into(),
            label: String::new(),
            publishable: false,
            host_only: true,
            service_specs: vec![],
            variant: AttributeVariant::Compute { cpus: 8, ram: 65536 },
        }];
        let policy = producer_policy_for(&def(), &attributes);
        assert!(!policy.properties.iter().any(|p| p.name == "ram"));
    }
}
