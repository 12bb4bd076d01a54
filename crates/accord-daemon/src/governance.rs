//! The governance loop.
//!
//! A per-tick verifier of every non-archived agreement. Governance is the
//! cancellation authority: it never mutates agreement records itself, it
//! classifies what it finds and posts `AgreementTimeout` (and
//! `DataVerified`) events; the owning worker executes the change. This
//! keeps every mutation of an agreement on its owner's single thread.
//!
//! Checks: proposal no-reply timeouts, anchor-confirmation timeouts,
//! workload start timeouts, data verification windows, node heartbeat
//! and agreement-presence, policy drift, service upgrade coordination,
//! and retry/force-archive of stuck terminations.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use tracing::{debug, error, info, warn};

use accord_core::agreement::{Agreement, AgreementRole, AgreementState};
use accord_core::events::{Event, EventKind};
use accord_core::policy::manager::PolicySide;
use accord_core::policy::Policy;
use accord_core::reason::{
    AB_CANCEL_AG_MISSING, AB_CANCEL_NODE_HEARTBEAT, AB_CANCEL_NO_DATA_RECEIVED,
    AB_CANCEL_NO_REPLY, AB_CANCEL_NOT_FINALIZED_TIMEOUT, AB_CANCEL_POLICY_CHANGED,
    CANCEL_NOT_EXECUTED_TIMEOUT, CANCEL_NOT_FINALIZED_TIMEOUT, CANCEL_NO_REPLY_ACK,
    CANCEL_POLICY_CHANGED, CANCEL_SERVICE_UPGRADE_REQUIRED,
};

use crate::context::WorkerContext;
use crate::exchange::types::{split_party_id, NodeHealthRequest};
use crate::now_secs;
use crate::runtime::{Disposition, Worker};

/// Commands processed by the governance worker.
#[derive(Debug)]
pub enum GovernanceCommand {
    /// A policy changed or vanished; run the drift checks now.
    Recheck,
}

/// The governance worker.
pub struct GovernanceWorker {
    ctx: WorkerContext,
    verify_client: Option<Client>,
    /// Last data-verification poll per agreement.
    last_data_poll: HashMap<String, Instant>,
    /// Last node-status (heartbeat/presence) check per agreement.
    last_status_check: HashMap<String, Instant>,
}

impl GovernanceWorker {
    /// Creates the worker.
    #[must_use]
    pub fn new(ctx: WorkerContext) -> Self {
        let verify_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(20))
            .build()
            .ok();
        Self {
            ctx,
            verify_client,
            last_data_poll: HashMap::new(),
            last_status_check: HashMap::new(),
        }
    }

    fn request_cancel(&self, agreement: &Agreement, reason: u32) {
        info!(
            agreement_id = %agreement.id,
            reason,
            state = %agreement.state,
            "governance requests cancellation"
        );
        self.ctx.bus.publish(Event::AgreementTimeout {
            agreement_id: agreement.id.clone(),
            protocol: agreement.protocol.clone(),
            reason,
            role: agreement.role,
        });
    }

    fn run_checks(&mut self) {
        let now = now_secs();
        let agreements = match self.ctx.store.agreements() {
            Ok(agreements) => agreements,
            Err(err) => {
                error!(%err, "cannot list agreements");
                return;
            }
        };
        for agreement in &agreements {
            match agreement.role {
                AgreementRole::Consumer => self.check_consumer(agreement, now),
                AgreementRole::Producer => self.check_producer(agreement, now),
            }
        }
        self.check_upgrades();

        // Forget per-agreement pacing state for records that are gone.
        let live: Vec<&str> = agreements.iter().map(|a| a.id.as_str()).collect();
        self.last_data_poll.retain(|id, _| live.contains(&id.as_str()));
        self.last_status_check
            .retain(|id, _| live.contains(&id.as_str()));
    }

    // ---- consumer side --------------------------------------------------

    fn check_consumer(&mut self, agreement: &Agreement, now: u64) {
        let config = &self.ctx.config.agbot;
        match agreement.state {
            AgreementState::Proposed => {
                if now.saturating_sub(agreement.created) > config.proposal_timeout.as_secs() {
                    self.request_cancel(agreement, AB_CANCEL_NO_REPLY);
                }
            }
            AgreementState::Replied => {
                if now.saturating_sub(agreement.reply_received) > config.finalize_timeout.as_secs()
                {
                    self.request_cancel(agreement, AB_CANCEL_NOT_FINALIZED_TIMEOUT);
                }
            }
            AgreementState::Confirmed | AgreementState::Active => {
                if self.consumer_drifted(agreement) {
                    self.request_cancel(agreement, AB_CANCEL_POLICY_CHANGED);
                    return;
                }
                let Some(terms) = parse_terms(agreement) else {
                    return;
                };
                if agreement.state == AgreementState::Active
                    && self.data_verification_failed(agreement, &terms, now)
                {
                    self.request_cancel(agreement, AB_CANCEL_NO_DATA_RECEIVED);
                    return;
                }
                self.check_node_health(agreement, &terms, now);
            }
            AgreementState::Terminating => {
                // Re-post so the owner retries a failed anchor write and
                // eventually force-archives.
                self.request_cancel(agreement, agreement.terminated_reason);
            }
            AgreementState::Archived => {}
        }
    }

    fn consumer_drifted(&self, agreement: &Agreement) -> bool {
        let Some(consumer) = self.ctx.policies.find(
            PolicySide::Consumer,
            &agreement.org,
            &agreement.policy_name,
        ) else {
            // The policy the agreement was made under no longer exists.
            return true;
        };
        let Ok(producer) = serde_json::from_str::<Policy>(&agreement.producer_policy) else {
            warn!(agreement_id = %agreement.id, "stored producer policy unparseable");
            return false;
        };
        match self.ctx.policies.matches(&producer, &consumer) {
            Ok(_) => false,
            Err(err) => {
                debug!(agreement_id = %agreement.id, %err, "consumer policy drift");
                true
            }
        }
    }

    /// Polls the verification endpoint at the terms' check rate and posts
    /// `DataVerified` on success. Returns `true` when the no-data window
    /// has been exceeded.
    fn data_verification_failed(&mut self, agreement: &Agreement, terms: &Policy, now: u64) -> bool {
        let verification = &terms.data_verification;
        if !verification.enabled {
            return false;
        }

        let due = self
            .last_data_poll
            .get(&agreement.id)
            .map_or(true, |at| at.elapsed().as_secs() >= verification.check_rate);
        if due && !verification.url.is_empty() {
            self.last_data_poll
                .insert(agreement.id.clone(), Instant::now());
            if self.poll_verify_endpoint(&verification.url, &verification.url_user, &agreement.id) {
                self.ctx.bus.publish(Event::DataVerified {
                    agreement_id: agreement.id.clone(),
                });
                // The owner refreshes the timestamp; this tick keeps the
                // old one, which is fine inside the window.
                return false;
            }
        }

        let last_seen = agreement
            .data_verified
            .max(agreement.execution_started)
            .max(agreement.confirmed);
        last_seen != 0 && now.saturating_sub(last_seen) > verification.interval
    }

    fn poll_verify_endpoint(&self, url: &str, user: &str, agreement_id: &str) -> bool {
        let Some(client) = &self.verify_client else {
            return false;
        };
        let mut request = client.get(url).query(&[("agreementId", agreement_id)]);
        if !user.is_empty() {
            request = request.basic_auth(user, None::<&str>);
        }
        match request.send() {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(url, %err, "data verification poll failed");
                false
            }
        }
    }

    fn check_node_health(&mut self, agreement: &Agreement, terms: &Policy, now: u64) {
        let health = &terms.node_health;
        let check_every = health
            .check_agreement_status
            .min(health.missing_heartbeat_interval)
            .max(1);
        let due = self
            .last_status_check
            .get(&agreement.id)
            .map_or(true, |at| at.elapsed().as_secs() >= check_every);
        if !due {
            return;
        }
        self.last_status_check
            .insert(agreement.id.clone(), Instant::now());

        let (node_org, _) = split_party_id(&agreement.counter_party_id);
        if node_org.is_empty() {
            return;
        }
        let response = match self.ctx.directory.node_health(
            node_org,
            None,
            &NodeHealthRequest {
                since: 0,
                node_orgs: vec![node_org.to_string()],
            },
        ) {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "node health query failed");
                return;
            }
        };

        let Some(status) = response.nodes.get(&agreement.counter_party_id) else {
            // The node vanished from the directory altogether.
            self.request_cancel(agreement, AB_CANCEL_NODE_HEARTBEAT);
            return;
        };
        if now.saturating_sub(status.last_heartbeat) > health.missing_heartbeat_interval {
            self.request_cancel(agreement, AB_CANCEL_NODE_HEARTBEAT);
            return;
        }
        // Give the node one status interval after confirmation to publish
        // the agreement before treating absence as loss.
        let settled = agreement.confirmed != 0
            && now.saturating_sub(agreement.confirmed) > health.check_agreement_status;
        if settled && !status.agreements.iter().any(|id| id == &agreement.id) {
            self.request_cancel(agreement, AB_CANCEL_AG_MISSING);
        }
    }

    // ---- producer side --------------------------------------------------

    fn check_producer(&mut self, agreement: &Agreement, now: u64) {
        let config = &self.ctx.config.node;
        match agreement.state {
            AgreementState::Proposed => {
                // We replied; the consumer never acknowledged.
                if now.saturating_sub(agreement.created)
                    > self.ctx.config.agbot.proposal_timeout.as_secs()
                {
                    self.request_cancel(agreement, CANCEL_NO_REPLY_ACK);
                }
            }
            AgreementState::Replied => {
                if now.saturating_sub(agreement.reply_received) > config.finalize_timeout.as_secs()
                {
                    self.request_cancel(agreement, CANCEL_NOT_FINALIZED_TIMEOUT);
                }
            }
            AgreementState::Confirmed => {
                if now.saturating_sub(agreement.confirmed)
                    > config.workload_start_timeout.as_secs()
                {
                    self.request_cancel(agreement, CANCEL_NOT_EXECUTED_TIMEOUT);
                }
            }
            AgreementState::Active => {
                if self.producer_drifted(agreement) {
                    self.request_cancel(agreement, CANCEL_POLICY_CHANGED);
                }
            }
            AgreementState::Terminating => {
                self.request_cancel(agreement, agreement.terminated_reason);
            }
            AgreementState::Archived => {}
        }
    }

    fn producer_drifted(&self, agreement: &Agreement) -> bool {
        let Some(local) = self.ctx.policies.find(
            PolicySide::Producer,
            &agreement.org,
            &agreement.policy_name,
        ) else {
            return true;
        };
        let Some(terms) = parse_terms(agreement) else {
            return false;
        };
        match self.ctx.policies.matches(&local, &terms) {
            Ok(_) => false,
            Err(err) => {
                debug!(agreement_id = %agreement.id, %err, "producer policy drift");
                true
            }
        }
    }

    // ---- upgrades -------------------------------------------------------

    /// Coordinates service upgrades: marks instances running a stale
    /// version, cancels their agreements when the upgrade is active, and
    /// performs the swap once no agreements remain.
    fn check_upgrades(&mut self) {
        let defs = self.ctx.store.service_defs().unwrap_or_default();
        let instances = self.ctx.store.service_instances().unwrap_or_default();
        let agreements = self.ctx.store.agreements().unwrap_or_default();

        for def in &defs {
            if !def.upgrade.auto_upgrade || def.agreement_less || def.available_version.is_empty() {
                continue;
            }
            for instance in &instances {
                if instance.spec_ref != def.spec_ref
                    || instance.org != def.org
                    || instance.agreement_less
                    || instance.version == def.available_version
                {
                    continue;
                }

                let mut instance = instance.clone();
                if !instance.pending_upgrade {
                    instance.pending_upgrade = true;
                    if let Err(err) = self.ctx.store.save_service_instance(&instance) {
                        error!(%err, "instance write failed");
                        continue;
                    }
                    info!(
                        instance = %instance.instance_id,
                        from = %instance.version,
                        to = %def.available_version,
                        "service upgrade pending"
                    );
                }

                if instance.associated_agreements.is_empty() {
                    instance.version = def.available_version.clone();
                    instance.pending_upgrade = false;
                    instance.execution_start_time = 0;
                    if let Err(err) = self.ctx.store.save_service_instance(&instance) {
                        error!(%err, "instance write failed");
                    } else {
                        info!(instance = %instance.instance_id, "service upgraded");
                    }
                } else if def.upgrade.active_upgrade {
                    // Active upgrade cancels everything immediately,
                    // in-flight proposals included.
                    for agreement_id in &instance.associated_agreements {
                        if let Some(agreement) =
                            agreements.iter().find(|a| &a.id == agreement_id)
                        {
                            self.request_cancel(agreement, CANCEL_SERVICE_UPGRADE_REQUIRED);
                        }
                    }
                }
            }
        }
    }
}

impl Worker for GovernanceWorker {
    type Command = GovernanceCommand;

    fn name(&self) -> &'static str {
        "governance"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        vec![EventKind::PolicyChanged, EventKind::PolicyDeleted]
    }

    fn commands_for(&mut self, event: &Event) -> Vec<GovernanceCommand> {
        match event {
            Event::PolicyChanged { .. } | Event::PolicyDeleted { .. } => {
                vec![GovernanceCommand::Recheck]
            }
            _ => Vec::new(),
        }
    }

    fn handle_command(&mut self, cmd: GovernanceCommand) -> Disposition<GovernanceCommand> {
        match cmd {
            GovernanceCommand::Recheck => self.run_checks(),
        }
        Disposition::Done
    }

    fn no_command_work(&mut self) -> Vec<GovernanceCommand> {
        self.run_checks();
        Vec::new()
    }

    fn tick_interval(&self) -> Duration {
        self.ctx.config.governance.tick
    }
}

fn parse_terms(agreement: &Agreement) -> Option<Policy> {
    match serde_json::from_str(&agreement.ts_and_cs) {
        Ok(terms) => Some(terms),
        Err(err) => {
            warn!(agreement_id = %agreement.id, %err, "stored terms unparseable");
            None
        }
    }
}
