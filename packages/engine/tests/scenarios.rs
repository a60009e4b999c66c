//! End-to-end pipeline scenarios against the embedded backend, the
//! in-memory stores, and the scriptable chain adapter.

use std::sync::Arc;
use std::time::Duration;

use engine_core::chain::{ChainRegistry, MockChainAdapter};
use engine_core::coordinator::QueueName;
use engine_core::events::{EventType, PipelineEvent};
use engine_core::fanout::{Push, SubscriberFilter};
use engine_core::model::{Plan, PlanStep, TxSpec, TxStatus};
use engine_core::pipeline::{EngineDeps, Pipeline};
use engine_core::risk::ApprovalPriority;
use engine_core::storage::{ApprovalStore, MemoryStores, TransactionStore};
use engine_core::{EngineConfig, EngineError};
use parking_lot::Mutex;
use uuid::Uuid;

const FROM: &str = "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
const TO: &str = "0xBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";

struct Harness {
    pipeline: Arc<Pipeline>,
    stores: Arc<MemoryStores>,
    adapter: Arc<MockChainAdapter>,
    recorded: Arc<Mutex<Vec<PipelineEvent>>>,
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        broadcast_backoff: Duration::from_millis(5),
        confirm_timeout: Duration::from_millis(500),
        confirm_interval: Duration::from_millis(10),
        sweep_interval: Duration::from_millis(50),
        ..EngineConfig::default()
    }
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn start(config: EngineConfig) -> Harness {
    init_tracing();
    let adapter = Arc::new(MockChainAdapter::new(42220));
    let mut registry = ChainRegistry::new();
    registry.register(adapter.clone());
    let (deps, stores, _backend) = EngineDeps::in_memory(Arc::new(registry));
    let pipeline = Pipeline::start(config, deps);

    // Record every bus event for ordering assertions.
    let recorded: Arc<Mutex<Vec<PipelineEvent>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let recorded = recorded.clone();
        let mut rx = pipeline.events().subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                recorded.lock().push(event);
            }
        });
    }

    Harness {
        pipeline,
        stores,
        adapter,
        recorded,
    }
}

fn spec(risk: f64) -> TxSpec {
    TxSpec::builder()
        .chain_id(42220i64)
        .from_address(FROM)
        .to_address(TO)
        .value("1000000000000000")
        .risk_score(risk)
        .user_id("u42")
        .build()
}

async fn wait_for_status(
    stores: &MemoryStores,
    tx_id: Uuid,
    status: TxStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(tx)) = TransactionStore::get(stores, tx_id).await {
            if tx.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn event_order(recorded: &[PipelineEvent], tx_id: Uuid) -> Vec<EventType> {
    let id = tx_id.to_string();
    recorded
        .iter()
        .filter(|e| e.payload_str("transaction_id") == Some(id.as_str()))
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn s1_happy_transfer_confirms_in_order() {
    let h = start(fast_config());
    let tx_id = h.pipeline.submit_transaction(spec(0.2)).await.unwrap();

    assert!(wait_for_status(&h.stores, tx_id, TxStatus::Confirmed, Duration::from_secs(3)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let order = event_order(&h.recorded.lock(), tx_id);
    let lifecycle: Vec<EventType> = order
        .into_iter()
        .filter(|t| {
            matches!(
                t,
                EventType::TransactionPending
                    | EventType::TransactionSubmitted
                    | EventType::TransactionConfirmed
                    | EventType::TransactionFailed
            )
        })
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            EventType::TransactionPending,
            EventType::TransactionSubmitted,
            EventType::TransactionConfirmed,
        ]
    );

    // No approval record was created for a low-risk transfer.
    let approval = ApprovalStore::find_by_transaction(h.stores.as_ref(), tx_id)
        .await
        .unwrap();
    assert!(approval.is_none());

    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn s2_approval_then_confirmation() {
    let h = start(fast_config());
    let tx_id = h.pipeline.submit_transaction(spec(0.75)).await.unwrap();

    // Parked awaiting approval; no broadcast happened.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let tx = TransactionStore::get(h.stores.as_ref(), tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TxStatus::AwaitingApproval);
    assert_eq!(h.adapter.broadcast_calls(), 0);

    let approval = ApprovalStore::find_by_transaction(h.stores.as_ref(), tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(approval.priority, ApprovalPriority::High);
    let window = approval.expires_at - approval.requested_at;
    assert_eq!(window.num_minutes(), 60);

    h.pipeline
        .approve(approval.id, "admin", None)
        .await
        .unwrap();
    assert!(wait_for_status(&h.stores, tx_id, TxStatus::Confirmed, Duration::from_secs(3)).await);

    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn s3_rejection_drops_the_transaction() {
    let h = start(fast_config());
    let tx_id = h.pipeline.submit_transaction(spec(0.9)).await.unwrap();

    let approval = ApprovalStore::find_by_transaction(h.stores.as_ref(), tx_id)
        .await
        .unwrap()
        .unwrap();
    h.pipeline
        .reject(approval.id, "admin", "off-policy")
        .await
        .unwrap();

    let tx = TransactionStore::get(h.stores.as_ref(), tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TxStatus::Rejected);
    assert_eq!(tx.memo.as_deref(), Some("Error: Rejected: off-policy"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let recorded = h.recorded.lock();
    assert!(recorded
        .iter()
        .any(|e| e.event_type == EventType::ApprovalRejected));
    let failed = recorded
        .iter()
        .find(|e| e.event_type == EventType::TransactionFailed)
        .expect("transaction:failed must be published");
    assert_eq!(failed.payload_str("error"), Some("Rejected: off-policy"));
    drop(recorded);

    assert_eq!(h.adapter.broadcast_calls(), 0);
    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn s4_expiry_sweep_auto_expires() {
    let mut config = fast_config();
    config.approval_ttl = Duration::from_millis(50);
    let h = start(config);

    let tx_id = h.pipeline.submit_transaction(spec(0.6)).await.unwrap();
    let approval = ApprovalStore::find_by_transaction(h.stores.as_ref(), tx_id)
        .await
        .unwrap()
        .unwrap();

    // Let the TTL elapse and the sweeper fire.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let swept = ApprovalStore::get(h.stores.as_ref(), approval.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        swept.status,
        engine_core::model::ApprovalStatus::Expired
    );
    assert_eq!(swept.resolution.as_deref(), Some("Auto-expired"));

    // The transaction stays parked for reconciliation.
    let tx = TransactionStore::get(h.stores.as_ref(), tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TxStatus::AwaitingApproval);

    assert!(h
        .recorded
        .lock()
        .iter()
        .any(|e| e.event_type == EventType::ApprovalExpired));

    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn s5_retryable_broadcast_self_heals() {
    let h = start(fast_config());
    h.adapter.push_broadcast_failure("nonce too low");
    h.adapter.push_broadcast_failure("nonce too low");

    let tx_id = h.pipeline.submit_transaction(spec(0.2)).await.unwrap();
    assert!(wait_for_status(&h.stores, tx_id, TxStatus::Confirmed, Duration::from_secs(3)).await);

    assert_eq!(h.adapter.broadcast_calls(), 3);
    let order = event_order(&h.recorded.lock(), tx_id);
    assert!(!order.contains(&EventType::TransactionFailed));

    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn s6_simulation_revert_is_fatal() {
    let h = start(fast_config());
    h.adapter
        .fail_simulation("ERC20: transfer amount exceeds balance");

    let mut simulated = spec(0.2);
    simulated.simulate = true;
    let tx_id = h.pipeline.submit_transaction(simulated).await.unwrap();

    assert!(wait_for_status(&h.stores, tx_id, TxStatus::Failed, Duration::from_secs(3)).await);
    let tx = TransactionStore::get(h.stores.as_ref(), tx_id)
        .await
        .unwrap()
        .unwrap();
    assert!(tx.simulation_result.is_some());
    assert!(tx
        .memo
        .unwrap()
        .contains("ERC20: transfer amount exceeds balance"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let recorded = h.recorded.lock();
    let failed = recorded
        .iter()
        .find(|e| e.event_type == EventType::TransactionFailed)
        .expect("transaction:failed must be published");
    assert!(failed
        .payload_str("error")
        .unwrap()
        .contains("ERC20: transfer amount exceeds balance"));
    drop(recorded);

    // Fatal: one job attempt, no broadcast.
    assert_eq!(h.adapter.broadcast_calls(), 0);
    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn s7_subscriber_filtering() {
    let h = start(fast_config());

    let mut all = h.pipeline.subscribe(SubscriberFilter::all());
    let mut filtered = h.pipeline.subscribe(
        SubscriberFilter::only([EventType::TransactionConfirmed]).with_user_id("u42"),
    );
    tokio::task::yield_now().await;

    let tx_id = h.pipeline.submit_transaction(spec(0.2)).await.unwrap();
    assert!(wait_for_status(&h.stores, tx_id, TxStatus::Confirmed, Duration::from_secs(3)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut all_types = Vec::new();
    while let Some(push) = all.try_recv() {
        if let Push::Event(event) = push {
            all_types.push(event.event_type);
        }
    }
    let mut filtered_types = Vec::new();
    while let Some(push) = filtered.try_recv() {
        if let Push::Event(event) = push {
            filtered_types.push(event.event_type);
        }
    }

    // The wildcard subscriber saw the submitted event; the filtered one
    // saw only the confirmation.
    assert!(all_types.contains(&EventType::TransactionSubmitted));
    assert!(all_types.contains(&EventType::TransactionConfirmed));
    assert_eq!(filtered_types, vec![EventType::TransactionConfirmed]);

    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

fn step(id: &str, index: i32, deps: &[&str], parallel: bool) -> PlanStep {
    PlanStep::builder()
        .id(id)
        .index(index)
        .chain_id(42220i64)
        .from_address(FROM)
        .to_address(TO)
        .value("1000")
        .depends_on(deps.iter().map(|d| d.to_string()).collect::<Vec<_>>())
        .parallelizable(parallel)
        .build()
}

#[tokio::test]
async fn plan_executes_in_dependency_order() {
    let h = start(fast_config());

    let plan = Plan::builder()
        .steps(vec![
            step("transfer", 0, &[], true),
            step("swap", 1, &["transfer"], true),
            step("stake", 2, &["swap"], true),
        ])
        .build();
    let plan_id = h
        .pipeline
        .submit_plan(plan, Some("u42".into()), None)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let done = h
            .recorded
            .lock()
            .iter()
            .any(|e| e.event_type == EventType::PlanCompleted);
        if done {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "plan did not complete in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let txs = TransactionStore::find_by_plan(h.stores.as_ref(), plan_id)
        .await
        .unwrap();
    assert_eq!(txs.len(), 3);
    assert!(txs.iter().all(|t| t.status == TxStatus::Confirmed));

    // Dependency ordering: a step is submitted only after its dependency
    // confirmed.
    let by_step = |step_id: &str| {
        txs.iter()
            .find(|t| t.step_id.as_deref() == Some(step_id))
            .map(|t| t.id)
            .unwrap()
    };
    let recorded = h.recorded.lock();
    let position = |tx_id: Uuid, ty: EventType| {
        let id = tx_id.to_string();
        recorded
            .iter()
            .position(|e| {
                e.event_type == ty && e.payload_str("transaction_id") == Some(id.as_str())
            })
            .unwrap()
    };
    let transfer = by_step("transfer");
    let swap = by_step("swap");
    let stake = by_step("stake");
    assert!(
        position(transfer, EventType::TransactionConfirmed)
            < position(swap, EventType::TransactionPending)
    );
    assert!(
        position(swap, EventType::TransactionConfirmed)
            < position(stake, EventType::TransactionPending)
    );
    drop(recorded);

    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn plan_stops_scheduling_after_a_step_failure() {
    let h = start(fast_config());

    // "swap" is blocked outright by the risk gate; "stake" depends on it
    // and must never be submitted.
    let mut blocked = step("swap", 1, &["transfer"], true);
    blocked.risk_score = 0.99;
    let plan = Plan::builder()
        .steps(vec![
            step("transfer", 0, &[], true),
            blocked,
            step("stake", 2, &["swap"], true),
        ])
        .build();
    let plan_id = h
        .pipeline
        .submit_plan(plan, Some("u42".into()), None)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let failed = h
            .recorded
            .lock()
            .iter()
            .any(|e| e.event_type == EventType::PlanFailed);
        if failed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "plan did not fail in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let txs = TransactionStore::find_by_plan(h.stores.as_ref(), plan_id)
        .await
        .unwrap();
    let steps: Vec<Option<&str>> = txs.iter().map(|t| t.step_id.as_deref()).collect();
    assert!(steps.contains(&Some("transfer")));
    assert!(steps.contains(&Some("swap")));
    assert!(!steps.contains(&Some("stake")), "dependent step must not run");

    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn duplicate_plan_submission_dedupes() {
    let h = start(fast_config());
    let plan = Plan::builder().steps(vec![step("only", 0, &[], true)]).build();

    let first = h
        .pipeline
        .submit_plan(plan.clone(), Some("u42".into()), None)
        .await
        .unwrap();
    let second = h
        .pipeline
        .submit_plan(plan, Some("u42".into()), None)
        .await
        .unwrap();
    assert_eq!(first, second);

    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn blocked_submission_returns_an_error() {
    let h = start(fast_config());
    let err = h.pipeline.submit_transaction(spec(0.97)).await.unwrap_err();
    assert!(matches!(err, EngineError::RiskBlocked { .. }));
    assert_eq!(h.adapter.broadcast_calls(), 0);
    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn rate_limit_caps_submissions() {
    let mut config = fast_config();
    config.submit_rate_limit = 2;
    let h = start(config);

    h.pipeline.submit_transaction(spec(0.1)).await.unwrap();
    h.pipeline.submit_transaction(spec(0.1)).await.unwrap();
    let err = h.pipeline.submit_transaction(spec(0.1)).await.unwrap_err();
    assert!(matches!(err, EngineError::RateLimited(_)));

    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn stats_aggregate_queues_subscribers_and_approvals() {
    let h = start(fast_config());

    let _sub = h.pipeline.subscribe(SubscriberFilter::all());
    let tx_id = h.pipeline.submit_transaction(spec(0.6)).await.unwrap();
    let _ = tx_id;

    let stats = h.pipeline.stats().await.unwrap();
    assert_eq!(stats.subscribers, 1);
    assert_eq!(stats.approvals.pending, 1);
    assert!(stats.queues.contains_key("plan"));
    assert!(stats.queues.contains_key("transaction"));
    assert!(stats.queues.contains_key("simulation"));
    assert!(stats.queues.contains_key("notification"));

    h.pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn notification_delivers_through_the_queue() {
    use engine_core::model::{Channel, Notification};
    use engine_core::workers::RecordingSender;

    let adapter = Arc::new(MockChainAdapter::new(42220));
    let mut registry = ChainRegistry::new();
    registry.register(adapter);
    let (mut deps, _stores, _backend) = EngineDeps::in_memory(Arc::new(registry));

    let in_app = Arc::new(RecordingSender::new(Channel::InApp));
    let email = Arc::new(RecordingSender::new(Channel::Email));
    email.set_fail(true);
    deps.senders = vec![in_app.clone(), email.clone()];

    let pipeline = Pipeline::start(fast_config(), deps);
    pipeline
        .submit_notification(
            Notification::builder()
                .title("Transaction confirmed")
                .body("your transfer confirmed in block 1204321")
                .channels(vec![Channel::InApp, Channel::Email])
                .build(),
        )
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while in_app.sent().is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "notification was not delivered"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The failed email channel did not fail the job.
    assert_eq!(in_app.sent().len(), 1);
    assert!(email.sent().is_empty());

    pipeline.shutdown(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn paused_transaction_queue_defers_broadcast() {
    let h = start(fast_config());
    h.pipeline.pause(QueueName::Transaction).await.unwrap();

    let tx_id = h.pipeline.submit_transaction(spec(0.1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.adapter.broadcast_calls(), 0);

    h.pipeline.resume(QueueName::Transaction).await.unwrap();
    assert!(wait_for_status(&h.stores, tx_id, TxStatus::Confirmed, Duration::from_secs(3)).await);

    h.pipeline.shutdown(Duration::from_millis(300)).await;
}
