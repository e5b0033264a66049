//! End-to-end scenarios for the delivery engine, driven cycle by cycle
//! against the in-memory store and the mock executor.

use chrono::{Duration, Utc};
use playflow_config::Config;
use playflow_core::{Engine, EngineBuilder, OrderRequest};
use playflow_store::{CreateOrderOutcome, StoreError, StoreInterface};
use playflow_types::{
	LedgerEntryKind, OrderStatus, ProxyNode, ProxyNodeStatus, ProxyTier, TaskStatus,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn test_config(max_attempts: u32, orphan_threshold_secs: u64) -> Config {
	let raw = format!(
		r#"
		[engine]
		id = "playflow-test"

		[worker]
		batch_size = 50
		max_concurrent = 8
		cycle_interval_ms = 1000
		orphan_threshold_secs = {orphan_threshold_secs}
		execution_timeout_secs = 5
		max_attempts = {max_attempts}

		[planner]
		split_size = 500
		instant_threshold = 1000
		force_task_delivery = true
		delivery_window_secs = 0

		[executor]
		backend = "mock"
		"#
	);
	Config::from_toml_str(&raw).unwrap()
}

async fn engine_with(config: Config) -> Engine {
	EngineBuilder::new(config).build().unwrap()
}

async fn seed_user(engine: &Engine, balance: Decimal) -> Uuid {
	let user_id = Uuid::new_v4();
	engine.store().upsert_user(user_id, balance).await.unwrap();
	user_id
}

fn datacenter_node() -> ProxyNode {
	ProxyNode {
		id: Uuid::new_v4(),
		endpoint: "10.0.0.1:8080".into(),
		tier: ProxyTier::Datacenter,
		country: None,
		capacity: 100,
		current_load: 0,
		status: ProxyNodeStatus::Online,
		auth: None,
	}
}

async fn run_to_terminal(engine: &Engine, order_id: Uuid) -> playflow_types::Order {
	for _ in 0..60 {
		engine.worker().run_cycle().await.unwrap();
		let order = engine.store().get_order(order_id).await.unwrap();
		if order.status.is_terminal() {
			return order;
		}
	}
	panic!("order did not reach a terminal state");
}

fn request(user_id: Uuid, quantity: u64) -> OrderRequest {
	OrderRequest {
		user_id,
		target_url: "https://example.com/track/42".into(),
		quantity,
		price_per_unit: dec!(0.0002),
		external_key: None,
	}
}

fn created(outcome: CreateOrderOutcome) -> playflow_types::Order {
	match outcome {
		CreateOrderOutcome::Created(order) => order,
		CreateOrderOutcome::Existing(_) => panic!("expected a fresh order"),
	}
}

// S1: clean run, thirty tasks, everything delivered.
#[tokio::test]
async fn full_delivery_without_failures() {
	let engine = engine_with(test_config(3, 120)).await;
	let user_id = seed_user(&engine, dec!(100)).await;
	engine.store().insert_node(&datacenter_node()).await.unwrap();

	let order = created(engine.submit_order(request(user_id, 15000)).await.unwrap());
	let tasks = engine.store().tasks_for_order(order.id).await.unwrap();
	assert_eq!(tasks.len(), 30);

	let done = run_to_terminal(&engine, order.id).await;
	assert_eq!(done.status, OrderStatus::Completed);
	assert_eq!(done.delivered, 15000);
	assert_eq!(done.failed_permanent, 0);
	assert_eq!(done.remains, 0);
	assert_eq!(done.refund_amount, Decimal::ZERO);
	assert_eq!(done.notes.as_deref(), Some("Delivered: 15,000 | Failed: 0"));

	let tasks = engine.store().tasks_for_order(order.id).await.unwrap();
	assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));

	let report = engine.validator().validate_order(order.id).await.unwrap();
	assert!(report.is_clean(), "violations: {:?}", report.violations);
}

// S2 (tightened to one attempt): every failed task is refunded exactly once
// and the conservation law holds at the terminal state.
#[tokio::test]
async fn failed_tasks_are_refunded_and_quantities_conserved() {
	let engine = engine_with(test_config(1, 120)).await;
	let user_id = seed_user(&engine, dec!(100)).await;
	engine.store().insert_node(&datacenter_node()).await.unwrap();
	engine
		.injection()
		.unwrap()
		.update(|s| s.fail_percent = 25);

	let order = created(engine.submit_order(request(user_id, 15000)).await.unwrap());
	let done = run_to_terminal(&engine, order.id).await;

	assert_eq!(done.delivered + done.failed_permanent, 15000);
	assert_eq!(done.remains, 0);
	assert_eq!(
		done.refund_amount,
		dec!(0.0002) * Decimal::from(done.failed_permanent)
	);

	let refunds: Vec<_> = engine
		.store()
		.ledger_entries_for_order(order.id)
		.await
		.unwrap()
		.into_iter()
		.filter(|e| e.kind == LedgerEntryKind::Refund)
		.collect();
	let refunded_total: Decimal = refunds.iter().map(|e| e.amount).sum();
	assert_eq!(refunded_total, done.refund_amount);

	if done.failed_permanent > 0 {
		assert_eq!(done.status, OrderStatus::Completed);
		assert!(done.notes.unwrap().contains("(PARTIAL)"));
	}

	let report = engine.validator().validate_order(order.id).await.unwrap();
	assert!(report.is_clean(), "violations: {:?}", report.violations);
}

// S3: tasks orphaned by a dead worker are reclaimed, attempts intact.
#[tokio::test]
async fn orphaned_tasks_are_reclaimed_by_the_next_cycle() {
	let engine = engine_with(test_config(3, 30)).await;
	let user_id = seed_user(&engine, dec!(100)).await;
	engine.store().insert_node(&datacenter_node()).await.unwrap();

	let order = created(engine.submit_order(request(user_id, 2000)).await.unwrap());
	let tasks = engine.store().tasks_for_order(order.id).await.unwrap();
	assert_eq!(tasks.len(), 4);

	// A worker claimed two tasks five minutes ago and died.
	let stale = Utc::now() - Duration::seconds(300);
	let cutoff = stale - Duration::seconds(30);
	for task in &tasks[..2] {
		match engine
			.store()
			.claim_task(task.id, TaskStatus::Pending, cutoff, "dead-worker", stale)
			.await
			.unwrap()
		{
			playflow_store::ClaimOutcome::Claimed(_) => {}
			playflow_store::ClaimOutcome::Lost => panic!("seed claim should win"),
		}
	}
	assert_eq!(engine.startup_orphan_count().await.unwrap(), 2);

	let done = run_to_terminal(&engine, order.id).await;
	assert_eq!(done.status, OrderStatus::Completed);
	assert_eq!(done.delivered, 2000);

	let status = engine.worker().status();
	assert!(status.recovered_orphans >= 2);

	// Reclaim incremented the dead worker's attempt counter.
	let tasks = engine.store().tasks_for_order(order.id).await.unwrap();
	assert!(tasks[..2].iter().all(|t| t.attempts == 2));
	assert!(tasks[2..].iter().all(|t| t.attempts == 1));
}

// S4: concurrent duplicate submissions with one external key debit once.
#[tokio::test]
async fn duplicate_external_key_submissions_converge() {
	let engine = engine_with(test_config(3, 120)).await;
	let user_id = seed_user(&engine, dec!(100)).await;

	let make_request = || OrderRequest {
		user_id,
		target_url: "https://example.com/track/42".into(),
		quantity: 5000,
		price_per_unit: dec!(0.0002),
		external_key: Some("client-key-9".into()),
	};
	let (a, b) = tokio::join!(
		engine.submit_order(make_request()),
		engine.submit_order(make_request()),
	);
	let (a, b) = (a.unwrap(), b.unwrap());

	assert_eq!(a.order().id, b.order().id);
	let fresh = matches!(a, CreateOrderOutcome::Created(_)) as usize
		+ matches!(b, CreateOrderOutcome::Created(_)) as usize;
	assert_eq!(fresh, 1);

	// Debited exactly once: 5000 * 0.0002 = 1.
	assert_eq!(
		engine.store().user_balance(user_id).await.unwrap(),
		dec!(99.0000)
	);

	let report = engine.validator().validate_all().await.unwrap();
	assert!(report.is_clean(), "violations: {:?}", report.violations);
}

// S5: a rate-limiting node is taken offline and traffic converges on the
// healthy one.
#[tokio::test]
async fn rate_limited_node_is_offlined_and_bypassed() {
	let engine = engine_with(test_config(1, 120)).await;
	let user_id = seed_user(&engine, dec!(100)).await;
	let node_a = datacenter_node();
	engine.store().insert_node(&node_a).await.unwrap();
	engine.injection().unwrap().ban_node(node_a.id);

	// With only the rate-limited node online, the first attempts hit it,
	// offline it, and are refunded (single-attempt budget).
	let first = created(engine.submit_order(request(user_id, 2000)).await.unwrap());
	let first = run_to_terminal(&engine, first.id).await;
	assert_eq!(
		engine.store().get_node(node_a.id).await.unwrap().status,
		ProxyNodeStatus::Offline
	);
	assert_eq!(first.delivered, 0);
	assert_eq!(first.failed_permanent, 2000);
	assert_eq!(first.refund_amount, dec!(0.4000));

	// A healthy node joins; subsequent selections never touch node A again.
	let node_b = datacenter_node();
	engine.store().insert_node(&node_b).await.unwrap();
	let second = created(engine.submit_order(request(user_id, 2000)).await.unwrap());
	let second = run_to_terminal(&engine, second.id).await;

	assert_eq!(second.delivered, 2000);
	let tasks = engine.store().tasks_for_order(second.id).await.unwrap();
	for task in &tasks {
		assert_eq!(task.status, TaskStatus::Completed);
		assert_eq!(task.proxy_node_id, Some(node_b.id));
	}
	assert_eq!(
		second.refund_amount,
		dec!(0.0002) * Decimal::from(second.failed_permanent)
	);
}

// S6: reconciliation flags a refund mismatch once, not twice.
#[tokio::test]
async fn reconciliation_flags_mismatch_without_duplicates() {
	// Refunds disabled: tasks get flagged refunded but the order keeps
	// refund_amount = 0, which is exactly the mismatch shape.
	let raw = r#"
		[engine]
		id = "playflow-test"

		[worker]
		batch_size = 50
		max_concurrent = 8
		max_attempts = 1

		[planner]
		split_size = 500
		force_task_delivery = true
		delivery_window_secs = 0

		[ledger]
		refund_enabled = false

		[executor]
		backend = "mock"
	"#;
	let engine = engine_with(Config::from_toml_str(raw).unwrap()).await;
	let user_id = seed_user(&engine, dec!(100)).await;
	engine.store().insert_node(&datacenter_node()).await.unwrap();
	engine.injection().unwrap().update(|s| s.fail_percent = 100);

	let order = created(engine.submit_order(request(user_id, 1500)).await.unwrap());
	let done = run_to_terminal(&engine, order.id).await;
	assert_eq!(done.failed_permanent, 1500);
	assert_eq!(done.refund_amount, Decimal::ZERO);

	let first = engine.reconciliation().reconcile_once().await.unwrap();
	assert_eq!(first.anomalies_recorded, 1);
	let second = engine.reconciliation().reconcile_once().await.unwrap();
	assert_eq!(second.anomalies_recorded, 0);

	let open = engine.store().open_anomalies().await.unwrap();
	assert_eq!(open.len(), 1);
	assert_eq!(open[0].order_id, order.id);
}

// Boundary: an order whose remains hit zero without finalization converges
// on the next cycle.
#[tokio::test]
async fn stalled_complete_order_converges() {
	let engine = engine_with(test_config(3, 120)).await;
	let user_id = seed_user(&engine, dec!(100)).await;
	engine.store().insert_node(&datacenter_node()).await.unwrap();

	let order = created(engine.submit_order(request(user_id, 1500)).await.unwrap());
	let tasks = engine.store().tasks_for_order(order.id).await.unwrap();

	// Drive all tasks to completion directly, simulating a crash after the
	// last progress update but before finalization.
	let now = Utc::now();
	let cutoff = now - Duration::seconds(120);
	for task in &tasks {
		engine
			.store()
			.claim_task(task.id, TaskStatus::Pending, cutoff, "w", now)
			.await
			.unwrap();
		engine
			.store()
			.complete_task(task.id, order.id, task.quantity, now)
			.await
			.unwrap();
	}
	assert_eq!(
		engine.store().get_order(order.id).await.unwrap().status,
		OrderStatus::Running
	);

	engine.worker().run_cycle().await.unwrap();
	let converged = engine.store().get_order(order.id).await.unwrap();
	assert_eq!(converged.status, OrderStatus::Completed);
}

// Instant path: small orders below the threshold skip tasks entirely.
#[tokio::test]
async fn small_orders_complete_instantly_when_allowed() {
	let raw = r#"
		[engine]
		id = "playflow-test"

		[planner]
		instant_threshold = 1000

		[executor]
		backend = "mock"
	"#;
	let engine = engine_with(Config::from_toml_str(raw).unwrap()).await;
	let user_id = seed_user(&engine, dec!(100)).await;

	let order = created(engine.submit_order(request(user_id, 800)).await.unwrap());
	assert_eq!(order.status, OrderStatus::Completed);
	assert_eq!(order.delivered, 800);
	assert!(engine.store().tasks_for_order(order.id).await.unwrap().is_empty());
}

// Cancellation refunds every open slice through the idempotent path.
#[tokio::test]
async fn cancellation_abandons_and_refunds_open_tasks() {
	let engine = engine_with(test_config(3, 120)).await;
	let user_id = seed_user(&engine, dec!(100)).await;

	let order = created(engine.submit_order(request(user_id, 2000)).await.unwrap());
	let balance_after_debit = engine.store().user_balance(user_id).await.unwrap();

	let cancelled = engine.cancel_order(order.id).await.unwrap();
	assert_eq!(cancelled.status, OrderStatus::Cancelled);
	assert_eq!(cancelled.failed_permanent, 2000);
	assert_eq!(cancelled.remains, 0);
	assert_eq!(cancelled.refund_amount, dec!(0.4000));
	assert_eq!(
		engine.store().user_balance(user_id).await.unwrap(),
		balance_after_debit + dec!(0.4000)
	);

	// Cancelling again refunds nothing further.
	let again = engine.cancel_order(order.id).await.unwrap();
	assert_eq!(again.refund_amount, dec!(0.4000));
}

// Insufficient balance rejects the order without writing anything.
#[tokio::test]
async fn insufficient_balance_rejects_order() {
	let engine = engine_with(test_config(3, 120)).await;
	let user_id = seed_user(&engine, dec!(0.5)).await;

	let result = engine.submit_order(request(user_id, 15000)).await;
	assert!(matches!(
		result,
		Err(playflow_core::EngineError::Store(StoreError::InsufficientBalance))
	));
	assert!(engine.store().all_orders().await.unwrap().is_empty());
	assert_eq!(engine.store().user_balance(user_id).await.unwrap(), dec!(0.5));
}
