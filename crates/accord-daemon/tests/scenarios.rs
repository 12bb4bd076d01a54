//! End-to-end negotiation scenarios.
//!
//! Two parties (one agbot, one node) run against a shared in-memory
//! directory and anchor log. Each party has its own store, bus, policy
//! manager, and identity, exactly as two processes would; the tests pump
//! the workers by hand so every step is deterministic.

use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use accord_core::agreement::AgreementState;
use accord_core::attributes::{Attribute, AttributeVariant};
use accord_core::config::Config;
use accord_core::events::Event;
use accord_core::persistence::records::{ConfigState, NodeRecord};
use accord_core::persistence::Store;
use accord_core::policy::api_spec::ApiSpec;
use accord_core::policy::manager::{PolicyManager, PolicySide};
use accord_core::policy::property::{CompareOp, Constraint, Property, PropertyValue};
use accord_core::policy::protocols::AgreementProtocol;
use accord_core::policy::workload::Workload;
use accord_core::policy::Policy;
use accord_core::protocol::signing::PartyKey;
use accord_core::protocol::{PROTOCOL_CURRENT_VERSION, PROTOCOL_NAME};
use accord_core::service::ServiceDefinition;

use accord_daemon::agbot::AgbotWorker;
use accord_daemon::anchor::{AnchorLog, AnchorLogError, AnchorWorker, AnchorWriter, MemAnchorLog};
use accord_daemon::context::WorkerContext;
use accord_daemon::exchange::mem::MemDirectory;
use accord_daemon::exchange::types::{Agbot, PostMessageBody};
use accord_daemon::exchange::{Directory, PartyKind};
use accord_daemon::governance::GovernanceWorker;
use accord_daemon::keycache::KeyCache;
use accord_daemon::node::{NodeCommand, NodeWorker};
use accord_daemon::now_secs;
use accord_daemon::runtime::{EventQueue, MessageBus, Worker};

const SERVICE_URL: &str = "https://svc/a";
const WORKLOAD_URL: &str = "https://wl/a";

/// An anchor whose writes succeed but are never observable: agreements
/// created against it never confirm.
struct BlackholeAnchor;

impl AnchorLog for BlackholeAnchor {
    fn append(
        &self,
        _record: &accord_core::anchor::RawAnchorRecord,
    ) -> Result<(), AnchorLogError> {
        Ok(())
    }

    fn poll(
        &self,
        _after: u64,
    ) -> Result<(Vec<accord_core::anchor::RawAnchorRecord>, u64), AnchorLogError> {
        Ok((Vec::new(), 0))
    }
}

/// One worker plus its bus subscription and command queue, pumped the
/// same way the runtime pumps it: one pass per step, requeued commands
/// retried on the next pass.
struct Pumped<W: Worker> {
    worker: W,
    queue: EventQueue,
    pending: std::collections::VecDeque<W::Command>,
}

impl<W: Worker> Pumped<W> {
    fn new(bus: &MessageBus, worker: W) -> Self {
        let queue = bus.subscribe(worker.name(), &worker.subscriptions());
        Self {
            worker,
            queue,
            pending: std::collections::VecDeque::new(),
        }
    }

    fn process(&mut self) {
        let mut remaining = self.pending.len();
        while remaining > 0 {
            remaining -= 1;
            let Some(cmd) = self.pending.pop_front() else {
                break;
            };
            if let accord_daemon::runtime::Disposition::Requeue(cmd) =
                self.worker.handle_command(cmd)
            {
                self.pending.push_back(cmd);
            }
        }
    }

    fn deliver(&mut self) {
        while let Some(event) = self.queue.pop(Duration::from_millis(5)) {
            let commands = self.worker.commands_for(&event);
            self.pending.extend(commands);
        }
        self.process();
    }

    fn tick(&mut self) {
        self.deliver();
        let commands = self.worker.no_command_work();
        self.pending.extend(commands);
        self.process();
        self.deliver();
    }
}

fn build_ctx(
    config: Config,
    dir: &Arc<MemDirectory>,
    log: &Arc<dyn AnchorLog>,
) -> WorkerContext {
    let directory: Arc<dyn Directory> = dir.clone();
    WorkerContext {
        config: Arc::new(config),
        store: Arc::new(Store::open_in_memory().unwrap()),
        policies: Arc::new(PolicyManager::new(PROTOCOL_CURRENT_VERSION)),
        directory: directory.clone(),
        anchor: Arc::new(AnchorWriter::new(log.clone(), 1)),
        bus: MessageBus::new(),
        keys: Arc::new(KeyCache::new(directory, Duration::from_secs(600))),
        identity: Arc::new(PartyKey::generate()),
    }
}

struct ConsumerSide {
    ctx: WorkerContext,
    agbot: Pumped<AgbotWorker>,
    governance: Pumped<GovernanceWorker>,
    anchor: Pumped<AnchorWorker>,
}

impl ConsumerSide {
    fn new(
        dir: &Arc<MemDirectory>,
        log: &Arc<dyn AnchorLog>,
        tweak: impl FnOnce(&mut Config),
    ) -> Self {
        let mut config = Config::default();
        config.exchange.org = "myorg".into();
        config.exchange.id = "agbot1".into();
        config.agbot.enabled = true;
        config.agbot.search_interval = Duration::ZERO;
        config.agbot.retry_interval = Duration::ZERO;
        config.agbot.stale_seconds = 0;
        tweak(&mut config);

        let ctx = build_ctx(config, dir, log);
        let agbot = Pumped::new(&ctx.bus, AgbotWorker::new(ctx.clone()));
        let governance = Pumped::new(&ctx.bus, GovernanceWorker::new(ctx.clone()));
        let anchor = Pumped::new(
            &ctx.bus,
            AnchorWorker::new(log.clone(), ctx.bus.clone(), Duration::from_millis(1)),
        );
        dir.put_agbot(
            "myorg",
            "agbot1",
            Agbot {
                public_key: hex::encode(ctx.identity.mailbox_public()),
                ..Default::default()
            },
        );
        Self {
            ctx,
            agbot,
            governance,
            anchor,
        }
    }

    fn tick(&mut self) {
        self.anchor.tick();
        self.agbot.tick();
        self.governance.tick();
        self.agbot.deliver();
    }
}

struct ProducerSide {
    ctx: WorkerContext,
    node: Pumped<NodeWorker>,
    governance: Pumped<GovernanceWorker>,
    anchor: Pumped<AnchorWorker>,
    /// Keeps the node's on-disk store alive for the test's duration.
    _data_dir: tempfile::TempDir,
}

impl ProducerSide {
    fn new(
        dir: &Arc<MemDirectory>,
        log: &Arc<dyn AnchorLog>,
        service_range: &str,
        attributes: Vec<Attribute>,
        tweak: impl FnOnce(&mut Config),
    ) -> Self {
        let mut config = Config::default();
        config.exchange.org = "myorg".into();
        config.exchange.id = "node2".into();
        config.node.enabled = true;
        tweak(&mut config);

        // The node runs against a real on-disk store.
        let data_dir = tempfile::tempdir().unwrap();
        let mut ctx = build_ctx(config, dir, log);
        ctx.store = Arc::new(Store::open(data_dir.path().join("accord.db")).unwrap());
        ctx.store
            .save_node(&NodeRecord {
                org: "myorg".into(),
                id: "node2".into(),
                name: "edge node".into(),
                token: "tok".into(),
                pattern: None,
                config_state: ConfigState::Configured,
            })
            .unwrap();
        ctx.store
            .save_service_def(&ServiceDefinition {
                id: "myorg_svc-a".into(),
                spec_ref: SERVICE_URL.into(),
                org: "myorg".into(),
                version: service_range.parse().unwrap(),
                arch: "amd64".into(),
                agreement_less: false,
                available_version: String::new(),
                upgrade: Default::default(),
                user_inputs: vec![],
            })
            .unwrap();
        for attribute in &attributes {
            ctx.store.save_attribute(attribute).unwrap();
        }

        let node = Pumped::new(&ctx.bus, NodeWorker::new(ctx.clone()));
        let governance = Pumped::new(&ctx.bus, GovernanceWorker::new(ctx.clone()));
        let anchor = Pumped::new(
            &ctx.bus,
            AnchorWorker::new(log.clone(), ctx.bus.clone(), Duration::from_millis(1)),
        );
        let mut side = Self {
            ctx,
            node,
            governance,
            anchor,
            _data_dir: data_dir,
        };
        // Generate producer policies and register with the directory.
        let _ = side.node.worker.handle_command(NodeCommand::Configure);
        side
    }

    fn tick(&mut self) {
        self.anchor.tick();
        self.node.tick();
        self.governance.tick();
        self.node.deliver();
    }
}

fn consumer_policy(range: &str, max_agreements: u32) -> Policy {
    let mut policy = Policy::named("workload-svcA");
    policy.api_specs = vec![ApiSpec::new(
        SERVICE_URL,
        "myorg",
        range.parse().unwrap(),
        "amd64",
    )];
    policy.agreement_protocols = vec![AgreementProtocol::new(PROTOCOL_NAME)];
    policy.workloads = vec![Workload {
        workload_url: WORKLOAD_URL.into(),
        org: "myorg".into(),
        version: "1.0.0".into(),
        arch: "amd64".into(),
        deployment: "{\"services\":{}}".into(),
        ..Default::default()
    }];
    policy.properties = vec![Property::new("ram", PropertyValue::Int(2048))];
    policy.max_agreements = max_agreements;
    policy
}

fn shared_world() -> (Arc<MemDirectory>, Arc<MemAnchorLog>, Arc<dyn AnchorLog>) {
    let dir = Arc::new(MemDirectory::new());
    dir.set_now(now_secs());
    let mem_log = Arc::new(MemAnchorLog::new());
    let log: Arc<dyn AnchorLog> = mem_log.clone();
    (dir, mem_log, log)
}

fn create_count(log: &MemAnchorLog) -> usize {
    log.records()
        .iter()
        .filter(|r| r.topics.first().is_some_and(|t| t == "AGREEMENT_CREATE"))
        .count()
}

/// Drives a fresh pair through proposal, reply, anchoring, and workload
/// start; returns the agreement id.
fn run_happy_path(consumer: &mut ConsumerSide, producer: &mut ProducerSide) -> String {
    consumer.tick(); // search, match, propose
    producer.tick(); // decide, reply
    consumer.tick(); // verify reply, anchor create, reply-ack
    producer.tick(); // reply-ack processed
    consumer.tick(); // anchor create observed: confirmed, active
    producer.tick(); // anchor create observed: confirmed, launch requested

    let agreement_id = producer.ctx.store.agreements().unwrap()[0].id.clone();
    producer.ctx.bus.publish(Event::WorkloadStarted {
        agreement_id: agreement_id.clone(),
    });
    producer.tick();
    agreement_id
}

#[test]
fn test_happy_path_single_active_agreement() {
    let (dir, mem_log, log) = shared_world();
    let mut producer = ProducerSide::new(&dir, &log, "1.2.0", vec![], |_| {});
    let mut consumer = ConsumerSide::new(&dir, &log, |_| {});
    consumer.ctx.policies.register(
        PolicySide::Consumer,
        "myorg",
        consumer_policy("[1.0.0,2.0.0)", 1),
    );

    let agreement_id = run_happy_path(&mut consumer, &mut producer);

    let consumer_agreements = consumer.ctx.store.agreements().unwrap();
    assert_eq!(consumer_agreements.len(), 1);
    assert_eq!(consumer_agreements[0].state, AgreementState::Active);
    assert_eq!(consumer_agreements[0].counter_party_id, "myorg/node2");

    let producer_agreement = producer
        .ctx
        .store
        .find_agreement(&agreement_id)
        .unwrap()
        .unwrap();
    assert_eq!(producer_agreement.state, AgreementState::Active);

    // Retry ticks: the pending table and the agreement cap keep the
    // proposal from being re-sent.
    for _ in 0..3 {
        consumer.tick();
        producer.tick();
    }
    assert_eq!(consumer.ctx.store.agreements().unwrap().len(), 1);
    assert_eq!(producer.ctx.store.agreements().unwrap().len(), 1);
    assert_eq!(create_count(&mem_log), 1);
}

#[test]
fn test_version_incompatible_sends_no_proposal() {
    let (dir, mem_log, log) = shared_world();
    // The node offers exactly 1.2.0.
    let mut producer = ProducerSide::new(&dir, &log, "[1.2.0,1.2.0]", vec![], |_| {});
    let mut consumer = ConsumerSide::new(&dir, &log, |_| {});
    consumer.ctx.policies.register(
        PolicySide::Consumer,
        "myorg",
        consumer_policy("[2.0.0,3.0.0)", 1),
    );

    for _ in 0..3 {
        consumer.tick();
        producer.tick();
    }

    assert!(consumer.ctx.store.agreements().unwrap().is_empty());
    assert!(producer.ctx.store.agreements().unwrap().is_empty());
    assert_eq!(create_count(&mem_log), 0);
}

#[test]
fn test_producer_rejection_yields_negative_reply() {
    let (dir, mem_log, log) = shared_world();
    // The node insists on 4 GiB of RAM; the consumer advertises 2 GiB.
    let attributes = vec![Attribute {
        id: "cpp".into(),
        label: String::new(),
        publishable: false,
        host_only: false,
        service_specs: vec![],
        variant: AttributeVariant::CounterPartyProperty {
            expression: Constraint::Require {
                name: "ram".into(),
                op: CompareOp::Gte,
                value: "4096".into(),
            },
        },
    }];
    let mut producer = ProducerSide::new(&dir, &log, "1.2.0", attributes, |_| {});
    let mut consumer = ConsumerSide::new(&dir, &log, |_| {});
    consumer.ctx.policies.register(
        PolicySide::Consumer,
        "myorg",
        consumer_policy("[1.0.0,2.0.0)", 1),
    );

    consumer.tick(); // propose
    let agreement_id = consumer.ctx.store.agreements().unwrap()[0].id.clone();
    producer.tick(); // reject
    consumer.tick(); // process the rejection

    let archived = consumer
        .ctx
        .store
        .find_archived(&agreement_id)
        .unwrap()
        .unwrap();
    assert_eq!(archived.state, AgreementState::Archived);
    assert_eq!(archived.terminated_reason, 202);

    // The node never created an agreement record for it.
    assert!(producer.ctx.store.agreements().unwrap().is_empty());
    assert!(producer
        .ctx
        .store
        .find_archived(&agreement_id)
        .unwrap()
        .is_none());
    assert_eq!(create_count(&mem_log), 0);
}

#[test]
fn test_missing_anchor_confirmation_times_out_both_sides() {
    let dir = Arc::new(MemDirectory::new());
    dir.set_now(now_secs());
    let log: Arc<dyn AnchorLog> = Arc::new(BlackholeAnchor);

    let mut producer = ProducerSide::new(&dir, &log, "1.2.0", vec![], |config| {
        config.node.finalize_timeout = Duration::ZERO;
    });
    let mut consumer = ConsumerSide::new(&dir, &log, |config| {
        config.agbot.finalize_timeout = Duration::ZERO;
    });
    consumer.ctx.policies.register(
        PolicySide::Consumer,
        "myorg",
        consumer_policy("[1.0.0,2.0.0)", 1),
    );

    consumer.tick(); // propose
    producer.tick(); // reply
    consumer.tick(); // reply processed; anchor create vanishes into the void
    producer.tick(); // reply-ack processed

    let consumer_id = consumer.ctx.store.agreements().unwrap()[0].id.clone();
    assert_eq!(
        consumer.ctx.store.agreements().unwrap()[0].state,
        AgreementState::Replied
    );

    // The finalize window passes with no anchor event.
    sleep(Duration::from_millis(1100));
    consumer.tick(); // governance: not finalized -> terminating
    producer.tick();
    sleep(Duration::from_millis(1100));
    consumer.tick(); // governance again: force archive
    producer.tick();

    let consumer_archived = consumer
        .ctx
        .store
        .find_archived(&consumer_id)
        .unwrap()
        .unwrap();
    assert_eq!(consumer_archived.terminated_reason, 200);

    let producer_archived = producer
        .ctx
        .store
        .find_archived(&consumer_id)
        .unwrap()
        .unwrap();
    assert_eq!(producer_archived.terminated_reason, 100);
}

#[test]
fn test_policy_drift_cancels_and_propagates() {
    let (dir, _mem_log, log) = shared_world();
    let mut producer = ProducerSide::new(&dir, &log, "1.2.0", vec![], |_| {});
    let mut consumer = ConsumerSide::new(&dir, &log, |_| {});
    consumer.ctx.policies.register(
        PolicySide::Consumer,
        "myorg",
        consumer_policy("[1.0.0,2.0.0)", 1),
    );

    let agreement_id = run_happy_path(&mut consumer, &mut producer);

    // The consumer policy changes underneath the active agreement: it now
    // demands a property the node does not advertise.
    let mut revised = consumer_policy("[1.0.0,2.0.0)", 1);
    revised.counter_party_properties = Some(Constraint::Require {
        name: "gpu".into(),
        op: CompareOp::Eq,
        value: "true".into(),
    });
    consumer
        .ctx
        .policies
        .register(PolicySide::Consumer, "myorg", revised);

    consumer.tick(); // governance detects the drift; cancel + anchor write
    consumer.tick(); // the consumer's own term event archives it
    producer.tick(); // the term event reaches the producer
    producer.tick();

    let consumer_archived = consumer
        .ctx
        .store
        .find_archived(&agreement_id)
        .unwrap()
        .unwrap();
    assert_eq!(consumer_archived.terminated_reason, 204);

    let producer_archived = producer
        .ctx
        .store
        .find_archived(&agreement_id)
        .unwrap()
        .unwrap();
    assert_eq!(producer_archived.terminated_reason, 205);
}

#[test]
fn test_duplicate_proposal_replays_reply() {
    let (dir, mem_log, log) = shared_world();
    let mut producer = ProducerSide::new(&dir, &log, "1.2.0", vec![], |_| {});
    let mut consumer = ConsumerSide::new(&dir, &log, |_| {});
    consumer.ctx.policies.register(
        PolicySide::Consumer,
        "myorg",
        consumer_policy("[1.0.0,2.0.0)", 1),
    );

    consumer.tick(); // proposal lands in the node's mailbox
    let in_flight = dir.get_messages("myorg", PartyKind::Node, "node2").unwrap();
    assert_eq!(in_flight.len(), 1);

    producer.tick(); // reply sent

    // The directory redelivers the identical proposal.
    dir.post_message(
        "myorg",
        PartyKind::Node,
        "node2",
        &PostMessageBody {
            message: in_flight[0].message.clone(),
            ttl: 60,
        },
    )
    .unwrap();
    producer.tick(); // duplicate: the original reply is replayed

    consumer.tick(); // first reply wins, second is ignored
    producer.tick();
    consumer.tick();
    producer.tick();

    assert_eq!(consumer.ctx.store.agreements().unwrap().len(), 1);
    assert_eq!(producer.ctx.store.agreements().unwrap().len(), 1);
    assert_eq!(create_count(&mem_log), 1);
}
