//! SQLite store backend.
//!
//! Durable state lives in a single SQLite database. Every status transition
//! and counter mutation is the literal conditional `UPDATE` from the store
//! contract; multi-row operations (order creation, completion, refunds) run
//! inside one transaction on a single mutex-guarded connection, so concurrent
//! workers within a process and across processes serialize on the database.
//!
//! Timestamps are stored as unix milliseconds, money as decimal strings.

use crate::{
	ClaimOutcome, CreateOrderOutcome, OrderProgress, PlanOutcome, RefundOutcome, StoreError,
	StoreInterface,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playflow_types::{
	AnomalyKind, AnomalySeverity, FlaggedUser, LedgerEntry, LedgerEntryKind, Order, OrderStatus,
	ProxyAuth, ProxyNode, ProxyNodeStatus, ProxyTier, RefundAnomaly, RefundEvent, Task, TaskStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;
use uuid::Uuid;

/// SQLite-backed store implementation.
pub struct SqliteStore {
	conn: Mutex<Connection>,
}

impl SqliteStore {
	/// Opens (or creates) the database at `path` and ensures the schema.
	pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
		let conn = Connection::open(path)?;
		conn.pragma_update(None, "foreign_keys", true)?;
		conn.pragma_update(None, "journal_mode", "WAL")?;
		conn.pragma_update(None, "synchronous", "NORMAL")?;
		conn.pragma_update(None, "temp_store", "MEMORY")?;
		Self::create_tables(&conn)?;
		Ok(Self {
			conn: Mutex::new(conn),
		})
	}

	/// Opens an in-memory database; used by tests.
	pub fn open_in_memory() -> Result<Self, StoreError> {
		let conn = Connection::open_in_memory()?;
		conn.pragma_update(None, "foreign_keys", true)?;
		Self::create_tables(&conn)?;
		Ok(Self {
			conn: Mutex::new(conn),
		})
	}

	fn create_tables(conn: &Connection) -> Result<(), StoreError> {
		conn.execute_batch(
			r#"
			CREATE TABLE IF NOT EXISTS users (
				id TEXT PRIMARY KEY,
				balance TEXT NOT NULL
			);

			CREATE TABLE IF NOT EXISTS orders (
				id TEXT PRIMARY KEY,
				user_id TEXT NOT NULL,
				target_url TEXT NOT NULL,
				quantity INTEGER NOT NULL,
				delivered INTEGER NOT NULL DEFAULT 0,
				failed_permanent INTEGER NOT NULL DEFAULT 0,
				remains INTEGER NOT NULL,
				price_per_unit TEXT NOT NULL,
				total_cost TEXT NOT NULL,
				refund_amount TEXT NOT NULL DEFAULT '0',
				status TEXT NOT NULL,
				external_key TEXT,
				created_at INTEGER NOT NULL,
				started_at INTEGER,
				estimated_completion_at INTEGER,
				completed_at INTEGER,
				notes TEXT
			);
			CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_external_key
				ON orders(user_id, external_key) WHERE external_key IS NOT NULL;
			CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);

			CREATE TABLE IF NOT EXISTS order_tasks (
				id TEXT PRIMARY KEY,
				order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
				sequence_number INTEGER NOT NULL,
				quantity INTEGER NOT NULL,
				scheduled_at INTEGER NOT NULL,
				status TEXT NOT NULL,
				attempts INTEGER NOT NULL DEFAULT 0,
				max_attempts INTEGER NOT NULL,
				retry_after INTEGER,
				execution_started_at INTEGER,
				worker_id TEXT,
				proxy_node_id TEXT,
				idempotency_token TEXT NOT NULL,
				refunded INTEGER NOT NULL DEFAULT 0,
				error_message TEXT,
				completed_at INTEGER,
				UNIQUE (order_id, idempotency_token)
			);
			CREATE INDEX IF NOT EXISTS idx_tasks_status_scheduled
				ON order_tasks(status, scheduled_at);
			CREATE INDEX IF NOT EXISTS idx_tasks_status_retry
				ON order_tasks(status, retry_after);
			CREATE INDEX IF NOT EXISTS idx_tasks_status_started
				ON order_tasks(status, execution_started_at);
			CREATE INDEX IF NOT EXISTS idx_tasks_unrefunded
				ON order_tasks(order_id) WHERE status = 'FAILED_PERMANENT' AND refunded = 0;

			CREATE TABLE IF NOT EXISTS balance_transactions (
				id TEXT PRIMARY KEY,
				user_id TEXT NOT NULL,
				order_id TEXT,
				task_id TEXT,
				amount TEXT NOT NULL,
				balance_before TEXT NOT NULL,
				balance_after TEXT NOT NULL,
				kind TEXT NOT NULL,
				reason TEXT NOT NULL,
				at INTEGER NOT NULL
			);
			CREATE INDEX IF NOT EXISTS idx_ledger_order ON balance_transactions(order_id);

			CREATE TABLE IF NOT EXISTS refund_events (
				id TEXT PRIMARY KEY,
				user_id TEXT NOT NULL,
				order_id TEXT NOT NULL,
				task_id TEXT NOT NULL,
				amount TEXT NOT NULL,
				at INTEGER NOT NULL
			);
			CREATE INDEX IF NOT EXISTS idx_refund_events_at ON refund_events(at);

			CREATE TABLE IF NOT EXISTS refund_anomalies (
				id TEXT PRIMARY KEY,
				order_id TEXT NOT NULL,
				kind TEXT NOT NULL,
				expected TEXT NOT NULL,
				actual TEXT NOT NULL,
				severity TEXT NOT NULL,
				detected_at INTEGER NOT NULL,
				resolved_at INTEGER
			);

			CREATE TABLE IF NOT EXISTS flagged_users (
				user_id TEXT PRIMARY KEY,
				refund_events INTEGER NOT NULL,
				window_start INTEGER NOT NULL,
				flagged_at INTEGER NOT NULL
			);

			CREATE TABLE IF NOT EXISTS proxy_nodes (
				id TEXT PRIMARY KEY,
				endpoint TEXT NOT NULL,
				tier TEXT NOT NULL,
				country TEXT,
				capacity INTEGER NOT NULL,
				current_load INTEGER NOT NULL DEFAULT 0,
				status TEXT NOT NULL,
				auth_username TEXT,
				auth_password TEXT
			);
			CREATE INDEX IF NOT EXISTS idx_nodes_tier_status ON proxy_nodes(tier, status);
			"#,
		)?;
		Ok(())
	}
}

fn millis(at: DateTime<Utc>) -> i64 {
	at.timestamp_millis()
}

fn from_millis(raw: i64) -> Result<DateTime<Utc>, StoreError> {
	DateTime::<Utc>::from_timestamp_millis(raw)
		.ok_or_else(|| StoreError::Backend(format!("timestamp out of range: {raw}")))
}

fn opt_millis(raw: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
	raw.map(from_millis).transpose()
}

fn decimal(raw: &str) -> Result<Decimal, StoreError> {
	Decimal::from_str(raw).map_err(|e| StoreError::Backend(format!("bad decimal '{raw}': {e}")))
}

fn uuid(raw: &str) -> Result<Uuid, StoreError> {
	Uuid::parse_str(raw).map_err(|e| StoreError::Backend(format!("bad uuid '{raw}': {e}")))
}

fn opt_uuid(raw: Option<String>) -> Result<Option<Uuid>, StoreError> {
	raw.as_deref().map(uuid).transpose()
}

fn parse<T: FromStr<Err = String>>(raw: &str) -> Result<T, StoreError> {
	raw.parse().map_err(StoreError::Backend)
}

fn row_to_order(row: &Row<'_>) -> Result<Order, StoreError> {
	Ok(Order {
		id: uuid(&row.get::<_, String>("id").map_err(StoreError::from)?)?,
		user_id: uuid(&row.get::<_, String>("user_id").map_err(StoreError::from)?)?,
		target_url: row.get("target_url").map_err(StoreError::from)?,
		quantity: row.get::<_, i64>("quantity").map_err(StoreError::from)? as u64,
		delivered: row.get::<_, i64>("delivered").map_err(StoreError::from)? as u64,
		failed_permanent: row.get::<_, i64>("failed_permanent").map_err(StoreError::from)? as u64,
		remains: row.get::<_, i64>("remains").map_err(StoreError::from)? as u64,
		price_per_unit: decimal(&row.get::<_, String>("price_per_unit").map_err(StoreError::from)?)?,
		total_cost: decimal(&row.get::<_, String>("total_cost").map_err(StoreError::from)?)?,
		refund_amount: decimal(&row.get::<_, String>("refund_amount").map_err(StoreError::from)?)?,
		status: parse::<OrderStatus>(&row.get::<_, String>("status").map_err(StoreError::from)?)?,
		external_key: row.get("external_key").map_err(StoreError::from)?,
		created_at: from_millis(row.get("created_at").map_err(StoreError::from)?)?,
		started_at: opt_millis(row.get("started_at").map_err(StoreError::from)?)?,
		estimated_completion_at: opt_millis(
			row.get("estimated_completion_at").map_err(StoreError::from)?,
		)?,
		completed_at: opt_millis(row.get("completed_at").map_err(StoreError::from)?)?,
		notes: row.get("notes").map_err(StoreError::from)?,
	})
}

fn row_to_task(row: &Row<'_>) -> Result<Task, StoreError> {
	Ok(Task {
		id: uuid(&row.get::<_, String>("id").map_err(StoreError::from)?)?,
		order_id: uuid(&row.get::<_, String>("order_id").map_err(StoreError::from)?)?,
		sequence_number: row.get::<_, i64>("sequence_number").map_err(StoreError::from)? as u32,
		quantity: row.get::<_, i64>("quantity").map_err(StoreError::from)? as u64,
		scheduled_at: from_millis(row.get("scheduled_at").map_err(StoreError::from)?)?,
		status: parse::<TaskStatus>(&row.get::<_, String>("status").map_err(StoreError::from)?)?,
		attempts: row.get::<_, i64>("attempts").map_err(StoreError::from)? as u32,
		max_attempts: row.get::<_, i64>("max_attempts").map_err(StoreError::from)? as u32,
		retry_after: opt_millis(row.get("retry_after").map_err(StoreError::from)?)?,
		execution_started_at: opt_millis(
			row.get("execution_started_at").map_err(StoreError::from)?,
		)?,
		worker_id: row.get("worker_id").map_err(StoreError::from)?,
		proxy_node_id: opt_uuid(row.get("proxy_node_id").map_err(StoreError::from)?)?,
		idempotency_token: row.get("idempotency_token").map_err(StoreError::from)?,
		refunded: row.get::<_, i64>("refunded").map_err(StoreError::from)? != 0,
		error_message: row.get("error_message").map_err(StoreError::from)?,
		completed_at: opt_millis(row.get("completed_at").map_err(StoreError::from)?)?,
	})
}

fn row_to_node(row: &Row<'_>) -> Result<ProxyNode, StoreError> {
	let auth_username: Option<String> = row.get("auth_username").map_err(StoreError::from)?;
	let auth_password: Option<String> = row.get("auth_password").map_err(StoreError::from)?;
	let auth = match (auth_username, auth_password) {
		(Some(username), Some(password)) => Some(ProxyAuth { username, password }),
		_ => None,
	};
	Ok(ProxyNode {
		id: uuid(&row.get::<_, String>("id").map_err(StoreError::from)?)?,
		endpoint: row.get("endpoint").map_err(StoreError::from)?,
		tier: parse::<ProxyTier>(&row.get::<_, String>("tier").map_err(StoreError::from)?)?,
		country: row.get("country").map_err(StoreError::from)?,
		capacity: row.get::<_, i64>("capacity").map_err(StoreError::from)? as u32,
		current_load: row.get::<_, i64>("current_load").map_err(StoreError::from)? as u32,
		status: parse::<ProxyNodeStatus>(&row.get::<_, String>("status").map_err(StoreError::from)?)?,
		auth,
	})
}

fn row_to_ledger_entry(row: &Row<'_>) -> Result<LedgerEntry, StoreError> {
	Ok(LedgerEntry {
		id: uuid(&row.get::<_, String>("id").map_err(StoreError::from)?)?,
		user_id: uuid(&row.get::<_, String>("user_id").map_err(StoreError::from)?)?,
		order_id: opt_uuid(row.get("order_id").map_err(StoreError::from)?)?,
		task_id: opt_uuid(row.get("task_id").map_err(StoreError::from)?)?,
		amount: decimal(&row.get::<_, String>("amount").map_err(StoreError::from)?)?,
		balance_before: decimal(&row.get::<_, String>("balance_before").map_err(StoreError::from)?)?,
		balance_after: decimal(&row.get::<_, String>("balance_after").map_err(StoreError::from)?)?,
		kind: parse::<LedgerEntryKind>(&row.get::<_, String>("kind").map_err(StoreError::from)?)?,
		reason: row.get("reason").map_err(StoreError::from)?,
		at: from_millis(row.get("at").map_err(StoreError::from)?)?,
	})
}

const ORDER_COLUMNS: &str = "id, user_id, target_url, quantity, delivered, failed_permanent, \
	remains, price_per_unit, total_cost, refund_amount, status, external_key, created_at, \
	started_at, estimated_completion_at, completed_at, notes";

const TASK_COLUMNS: &str = "id, order_id, sequence_number, quantity, scheduled_at, status, \
	attempts, max_attempts, retry_after, execution_started_at, worker_id, proxy_node_id, \
	idempotency_token, refunded, error_message, completed_at";

const NODE_COLUMNS: &str =
	"id, endpoint, tier, country, capacity, current_load, status, auth_username, auth_password";

fn select_order(conn: &Connection, order_id: Uuid) -> Result<Order, StoreError> {
	let raw = conn
		.query_row(
			&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
			params![order_id.to_string()],
			|row| Ok(row_to_order(row)),
		)
		.optional()?
		.ok_or(StoreError::NotFound)?;
	raw
}

fn select_task(conn: &Connection, task_id: Uuid) -> Result<Task, StoreError> {
	let raw = conn
		.query_row(
			&format!("SELECT {TASK_COLUMNS} FROM order_tasks WHERE id = ?1"),
			params![task_id.to_string()],
			|row| Ok(row_to_task(row)),
		)
		.optional()?
		.ok_or(StoreError::NotFound)?;
	raw
}

fn order_progress(conn: &Connection, order_id: Uuid) -> Result<OrderProgress, StoreError> {
	let order = select_order(conn, order_id)?;
	Ok(OrderProgress {
		order_id,
		quantity: order.quantity,
		delivered: order.delivered,
		failed_permanent: order.failed_permanent,
		remains: order.remains,
		refund_amount: order.refund_amount,
		status: order.status,
	})
}

fn insert_task_row(tx: &Transaction<'_>, task: &Task) -> Result<(), StoreError> {
	tx.execute(
		&format!(
			"INSERT INTO order_tasks ({TASK_COLUMNS}) \
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
		),
		params![
			task.id.to_string(),
			task.order_id.to_string(),
			task.sequence_number as i64,
			task.quantity as i64,
			millis(task.scheduled_at),
			task.status.as_str(),
			task.attempts as i64,
			task.max_attempts as i64,
			task.retry_after.map(millis),
			task.execution_started_at.map(millis),
			task.worker_id.as_deref(),
			task.proxy_node_id.map(|id| id.to_string()),
			task.idempotency_token,
			task.refunded as i64,
			task.error_message.as_deref(),
			task.completed_at.map(millis),
		],
	)?;
	Ok(())
}

#[allow(clippy::too_many_arguments)]
fn append_ledger_row(
	conn: &Connection,
	user_id: Uuid,
	order_id: Option<Uuid>,
	task_id: Option<Uuid>,
	amount: Decimal,
	balance_before: Decimal,
	balance_after: Decimal,
	kind: LedgerEntryKind,
	reason: &str,
	at: DateTime<Utc>,
) -> Result<LedgerEntry, StoreError> {
	let entry = LedgerEntry {
		id: Uuid::new_v4(),
		user_id,
		order_id,
		task_id,
		amount,
		balance_before,
		balance_after,
		kind,
		reason: reason.to_string(),
		at,
	};
	conn.execute(
		"INSERT INTO balance_transactions \
		 (id, user_id, order_id, task_id, amount, balance_before, balance_after, kind, reason, at) \
		 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
		params![
			entry.id.to_string(),
			entry.user_id.to_string(),
			entry.order_id.map(|id| id.to_string()),
			entry.task_id.map(|id| id.to_string()),
			entry.amount.to_string(),
			entry.balance_before.to_string(),
			entry.balance_after.to_string(),
			entry.kind.as_str(),
			entry.reason,
			millis(entry.at),
		],
	)?;
	Ok(entry)
}

/// Reads a user's balance and applies a delta inside the caller's
/// transaction. Returns `(before, after)`; a negative result rejects.
fn shift_balance(
	conn: &Connection,
	user_id: Uuid,
	delta: Decimal,
) -> Result<(Decimal, Decimal), StoreError> {
	let raw: String = conn
		.query_row(
			"SELECT balance FROM users WHERE id = ?1",
			params![user_id.to_string()],
			|row| row.get(0),
		)
		.optional()?
		.ok_or(StoreError::NotFound)?;
	let before = decimal(&raw)?;
	let after = before + delta;
	if after < Decimal::ZERO {
		return Err(StoreError::InsufficientBalance);
	}
	conn.execute(
		"UPDATE users SET balance = ?1 WHERE id = ?2",
		params![after.to_string(), user_id.to_string()],
	)?;
	Ok((before, after))
}

#[async_trait]
impl StoreInterface for SqliteStore {
	async fn upsert_user(&self, user_id: Uuid, balance: Decimal) -> Result<(), StoreError> {
		let conn = self.conn.lock().await;
		conn.execute(
			"INSERT INTO users (id, balance) VALUES (?1, ?2) \
			 ON CONFLICT(id) DO UPDATE SET balance = excluded.balance",
			params![user_id.to_string(), balance.to_string()],
		)?;
		Ok(())
	}

	async fn user_balance(&self, user_id: Uuid) -> Result<Decimal, StoreError> {
		let conn = self.conn.lock().await;
		let raw: String = conn
			.query_row(
				"SELECT balance FROM users WHERE id = ?1",
				params![user_id.to_string()],
				|row| row.get(0),
			)
			.optional()?
			.ok_or(StoreError::NotFound)?;
		decimal(&raw)
	}

	async fn credit_user(
		&self,
		user_id: Uuid,
		amount: Decimal,
		reason: &str,
	) -> Result<LedgerEntry, StoreError> {
		let mut conn = self.conn.lock().await;
		let tx = conn.transaction()?;
		let (before, after) = shift_balance(&tx, user_id, amount)?;
		let entry = append_ledger_row(
			&tx,
			user_id,
			None,
			None,
			amount,
			before,
			after,
			LedgerEntryKind::Credit,
			reason,
			Utc::now(),
		)?;
		tx.commit()?;
		Ok(entry)
	}

	async fn create_order_with_tasks(
		&self,
		order: &Order,
		tasks: &[Task],
	) -> Result<CreateOrderOutcome, StoreError> {
		let mut conn = self.conn.lock().await;
		let tx = conn.transaction()?;

		if let Some(key) = &order.external_key {
			let existing = tx
				.query_row(
					&format!(
						"SELECT {ORDER_COLUMNS} FROM orders \
						 WHERE user_id = ?1 AND external_key = ?2"
					),
					params![order.user_id.to_string(), key],
					|row| Ok(row_to_order(row)),
				)
				.optional()?;
			if let Some(existing) = existing {
				return Ok(CreateOrderOutcome::Existing(existing?));
			}
		}

		let (before, after) = shift_balance(&tx, order.user_id, -order.total_cost)?;
		append_ledger_row(
			&tx,
			order.user_id,
			Some(order.id),
			None,
			-order.total_cost,
			before,
			after,
			LedgerEntryKind::Debit,
			&format!("Debit for order {}", order.id),
			order.created_at,
		)?;

		tx.execute(
			&format!(
				"INSERT INTO orders ({ORDER_COLUMNS}) \
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
			),
			params![
				order.id.to_string(),
				order.user_id.to_string(),
				order.target_url,
				order.quantity as i64,
				order.delivered as i64,
				order.failed_permanent as i64,
				order.remains as i64,
				order.price_per_unit.to_string(),
				order.total_cost.to_string(),
				order.refund_amount.to_string(),
				order.status.as_str(),
				order.external_key.as_deref(),
				millis(order.created_at),
				order.started_at.map(millis),
				order.estimated_completion_at.map(millis),
				order.completed_at.map(millis),
				order.notes.as_deref(),
			],
		)?;
		for task in tasks {
			insert_task_row(&tx, task)?;
		}
		tx.commit()?;
		Ok(CreateOrderOutcome::Created(order.clone()))
	}

	async fn get_order(&self, order_id: Uuid) -> Result<Order, StoreError> {
		let conn = self.conn.lock().await;
		select_order(&conn, order_id)
	}

	async fn all_orders(&self) -> Result<Vec<Order>, StoreError> {
		let conn = self.conn.lock().await;
		let mut stmt =
			conn.prepare(&format!("SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at"))?;
		let rows = stmt.query_map([], |row| Ok(row_to_order(row)))?;
		rows.collect::<Result<Result<Vec<_>, _>, _>>()?
	}

	async fn terminal_orders_with_refund_activity(&self) -> Result<Vec<Order>, StoreError> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(&format!(
			"SELECT {ORDER_COLUMNS} FROM orders \
			 WHERE status IN ('COMPLETED', 'CANCELLED', 'FAILED') \
			   AND (refund_amount != '0' \
			        OR EXISTS (SELECT 1 FROM order_tasks \
			                    WHERE order_tasks.order_id = orders.id AND refunded = 1))"
		))?;
		let rows = stmt.query_map([], |row| Ok(row_to_order(row)))?;
		rows.collect::<Result<Result<Vec<_>, _>, _>>()?
	}

	async fn orders_ready_to_finalize(&self) -> Result<Vec<Uuid>, StoreError> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(
			"SELECT id FROM orders \
			 WHERE remains = 0 AND status NOT IN ('COMPLETED', 'CANCELLED', 'FAILED')",
		)?;
		let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
		let mut ids = Vec::new();
		for raw in rows {
			ids.push(uuid(&raw?)?);
		}
		Ok(ids)
	}

	async fn finalize_order_if_complete(
		&self,
		order_id: Uuid,
		now: DateTime<Utc>,
	) -> Result<Option<Order>, StoreError> {
		let mut conn = self.conn.lock().await;
		let tx = conn.transaction()?;
		let order = select_order(&tx, order_id)?;
		if order.status.is_terminal() || order.remains != 0 {
			return Ok(None);
		}
		let mut completed = order;
		completed.status = OrderStatus::Completed;
		completed.completed_at = Some(now);
		let notes = completed.completion_notes();
		completed.notes = Some(notes.clone());
		let updated = tx.execute(
			"UPDATE orders SET status = 'COMPLETED', completed_at = ?1, notes = ?2 \
			 WHERE id = ?3 AND remains = 0 \
			   AND status NOT IN ('COMPLETED', 'CANCELLED', 'FAILED')",
			params![millis(now), notes, order_id.to_string()],
		)?;
		tx.commit()?;
		Ok((updated > 0).then_some(completed))
	}

	async fn complete_order_instantly(
		&self,
		order_id: Uuid,
		now: DateTime<Utc>,
	) -> Result<Order, StoreError> {
		let mut conn = self.conn.lock().await;
		let tx = conn.transaction()?;
		tx.execute(
			"UPDATE orders SET delivered = quantity, remains = 0, status = 'COMPLETED', \
			        started_at = COALESCE(started_at, ?1), completed_at = ?1 \
			 WHERE id = ?2",
			params![millis(now), order_id.to_string()],
		)?;
		let mut order = select_order(&tx, order_id)?;
		let notes = order.completion_notes();
		tx.execute(
			"UPDATE orders SET notes = ?1 WHERE id = ?2",
			params![notes, order_id.to_string()],
		)?;
		order.notes = Some(notes);
		tx.commit()?;
		Ok(order)
	}

	async fn set_order_cancelled(
		&self,
		order_id: Uuid,
		now: DateTime<Utc>,
	) -> Result<Order, StoreError> {
		let mut conn = self.conn.lock().await;
		let tx = conn.transaction()?;
		tx.execute(
			"UPDATE orders SET status = 'CANCELLED', completed_at = ?1 WHERE id = ?2",
			params![millis(now), order_id.to_string()],
		)?;
		let mut order = select_order(&tx, order_id)?;
		let notes = order.completion_notes();
		tx.execute(
			"UPDATE orders SET notes = ?1 WHERE id = ?2",
			params![notes, order_id.to_string()],
		)?;
		order.notes = Some(notes);
		tx.commit()?;
		Ok(order)
	}

	async fn insert_tasks(&self, order_id: Uuid, tasks: &[Task]) -> Result<PlanOutcome, StoreError> {
		let mut conn = self.conn.lock().await;
		let tx = conn.transaction()?;
		select_order(&tx, order_id)?;

		for task in tasks {
			let exists: Option<i64> = tx
				.query_row(
					"SELECT 1 FROM order_tasks WHERE order_id = ?1 AND idempotency_token = ?2",
					params![order_id.to_string(), task.idempotency_token],
					|row| row.get(0),
				)
				.optional()?;
			if exists.is_some() {
				// The batch was (at least partially) planned before; the
				// all-or-nothing write means fully planned.
				return Ok(PlanOutcome::AlreadyPlanned);
			}
		}
		for task in tasks {
			insert_task_row(&tx, task)?;
		}
		tx.commit()?;
		Ok(PlanOutcome::Inserted)
	}

	async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
		let conn = self.conn.lock().await;
		select_task(&conn, task_id)
	}

	async fn tasks_for_order(&self, order_id: Uuid) -> Result<Vec<Task>, StoreError> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(&format!(
			"SELECT {TASK_COLUMNS} FROM order_tasks WHERE order_id = ?1 ORDER BY sequence_number"
		))?;
		let rows = stmt.query_map(params![order_id.to_string()], |row| Ok(row_to_task(row)))?;
		rows.collect::<Result<Result<Vec<_>, _>, _>>()?
	}

	async fn due_tasks(
		&self,
		now: DateTime<Utc>,
		orphan_cutoff: DateTime<Utc>,
		batch: usize,
	) -> Result<Vec<Task>, StoreError> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(&format!(
			"SELECT {TASK_COLUMNS} FROM order_tasks \
			 WHERE (status = 'PENDING' AND scheduled_at <= ?1) \
			    OR (status = 'FAILED_RETRYING' AND retry_after <= ?1) \
			    OR (status = 'EXECUTING' AND execution_started_at <= ?2) \
			 ORDER BY scheduled_at \
			 LIMIT ?3",
		))?;
		let rows = stmt.query_map(
			params![millis(now), millis(orphan_cutoff), batch as i64],
			|row| Ok(row_to_task(row)),
		)?;
		rows.collect::<Result<Result<Vec<_>, _>, _>>()?
	}

	async fn claim_task(
		&self,
		task_id: Uuid,
		expected_status: TaskStatus,
		orphan_cutoff: DateTime<Utc>,
		worker_id: &str,
		now: DateTime<Utc>,
	) -> Result<ClaimOutcome, StoreError> {
		let conn = self.conn.lock().await;
		let updated = conn.execute(
			"UPDATE order_tasks \
			 SET status = 'EXECUTING', execution_started_at = ?1, worker_id = ?2, \
			     attempts = attempts + 1 \
			 WHERE id = ?3 AND status = ?4 \
			   AND (execution_started_at IS NULL OR execution_started_at <= ?5)",
			params![
				millis(now),
				worker_id,
				task_id.to_string(),
				expected_status.as_str(),
				millis(orphan_cutoff),
			],
		)?;
		if updated == 0 {
			return Ok(ClaimOutcome::Lost);
		}
		Ok(ClaimOutcome::Claimed(select_task(&conn, task_id)?))
	}

	async fn set_task_proxy(&self, task_id: Uuid, node_id: Uuid) -> Result<(), StoreError> {
		let conn = self.conn.lock().await;
		conn.execute(
			"UPDATE order_tasks SET proxy_node_id = ?1 WHERE id = ?2",
			params![node_id.to_string(), task_id.to_string()],
		)?;
		Ok(())
	}

	async fn complete_task(
		&self,
		task_id: Uuid,
		order_id: Uuid,
		quantity: u64,
		now: DateTime<Utc>,
	) -> Result<OrderProgress, StoreError> {
		let mut conn = self.conn.lock().await;
		let tx = conn.transaction()?;
		let updated = tx.execute(
			"UPDATE order_tasks SET status = 'COMPLETED', completed_at = ?1 \
			 WHERE id = ?2 AND status = 'EXECUTING'",
			params![millis(now), task_id.to_string()],
		)?;
		if updated > 0 {
			tx.execute(
				"UPDATE orders SET delivered = delivered + ?1, \
				        remains = MAX(remains - ?1, 0) \
				 WHERE id = ?2",
				params![quantity as i64, order_id.to_string()],
			)?;
		}
		let progress = order_progress(&tx, order_id)?;
		tx.commit()?;
		Ok(progress)
	}

	async fn fail_task_retrying(
		&self,
		task_id: Uuid,
		retry_after: DateTime<Utc>,
		error: &str,
	) -> Result<(), StoreError> {
		let conn = self.conn.lock().await;
		conn.execute(
			"UPDATE order_tasks SET status = 'FAILED_RETRYING', retry_after = ?1, \
			        error_message = ?2 \
			 WHERE id = ?3 AND status = 'EXECUTING'",
			params![millis(retry_after), Task::truncate_error(error), task_id.to_string()],
		)?;
		Ok(())
	}

	async fn fail_task_permanent(
		&self,
		task_id: Uuid,
		order_id: Uuid,
		quantity: u64,
		error: &str,
	) -> Result<OrderProgress, StoreError> {
		let mut conn = self.conn.lock().await;
		let tx = conn.transaction()?;
		let updated = tx.execute(
			"UPDATE order_tasks SET status = 'FAILED_PERMANENT', error_message = ?1 \
			 WHERE id = ?2 AND status = 'EXECUTING'",
			params![Task::truncate_error(error), task_id.to_string()],
		)?;
		if updated > 0 {
			tx.execute(
				"UPDATE orders SET failed_permanent = failed_permanent + ?1, \
				        remains = MAX(remains - ?1, 0) \
				 WHERE id = ?2",
				params![quantity as i64, order_id.to_string()],
			)?;
		}
		let progress = order_progress(&tx, order_id)?;
		tx.commit()?;
		Ok(progress)
	}

	async fn abandon_open_tasks(
		&self,
		order_id: Uuid,
		error: &str,
	) -> Result<Vec<Task>, StoreError> {
		let mut conn = self.conn.lock().await;
		let tx = conn.transaction()?;
		let open: Vec<Task> = {
			let mut stmt = tx.prepare(&format!(
				"SELECT {TASK_COLUMNS} FROM order_tasks \
				 WHERE order_id = ?1 \
				   AND status NOT IN ('COMPLETED', 'FAILED_PERMANENT') \
				 ORDER BY sequence_number"
			))?;
			let rows = stmt.query_map(params![order_id.to_string()], |row| Ok(row_to_task(row)))?;
			rows.collect::<Result<Result<Vec<_>, _>, _>>()??
		};

		let mut abandoned = Vec::with_capacity(open.len());
		for task in open {
			tx.execute(
				"UPDATE order_tasks SET status = 'FAILED_PERMANENT', error_message = ?1 \
				 WHERE id = ?2",
				params![Task::truncate_error(error), task.id.to_string()],
			)?;
			tx.execute(
				"UPDATE orders SET failed_permanent = failed_permanent + ?1, \
				        remains = MAX(remains - ?1, 0) \
				 WHERE id = ?2",
				params![task.quantity as i64, order_id.to_string()],
			)?;
			let mut snapshot = task;
			snapshot.status = TaskStatus::FailedPermanent;
			snapshot.error_message = Some(Task::truncate_error(error));
			abandoned.push(snapshot);
		}
		tx.commit()?;
		Ok(abandoned)
	}

	async fn executing_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
		let conn = self.conn.lock().await;
		let count: i64 = conn.query_row(
			"SELECT COUNT(*) FROM order_tasks \
			 WHERE status = 'EXECUTING' AND execution_started_at <= ?1",
			params![millis(cutoff)],
			|row| row.get(0),
		)?;
		Ok(count as u64)
	}

	async fn apply_refund(
		&self,
		task_id: Uuid,
		order_id: Uuid,
		user_id: Uuid,
		amount: Decimal,
		credit: bool,
		now: DateTime<Utc>,
	) -> Result<RefundOutcome, StoreError> {
		let mut conn = self.conn.lock().await;
		let tx = conn.transaction()?;

		let flipped = tx.execute(
			"UPDATE order_tasks SET refunded = 1 WHERE id = ?1 AND refunded = 0",
			params![task_id.to_string()],
		)?;
		if flipped == 0 {
			return Ok(RefundOutcome::AlreadyRefunded);
		}
		if !credit {
			tx.commit()?;
			return Ok(RefundOutcome::BookkeepingOnly);
		}

		let (before, after) = shift_balance(&tx, user_id, amount)?;
		let entry = append_ledger_row(
			&tx,
			user_id,
			Some(order_id),
			Some(task_id),
			amount,
			before,
			after,
			LedgerEntryKind::Refund,
			&format!("Refund for failed task {task_id}"),
			now,
		)?;

		let order = select_order(&tx, order_id)?;
		let new_total = order.refund_amount + amount;
		tx.execute(
			"UPDATE orders SET refund_amount = ?1 WHERE id = ?2",
			params![new_total.to_string(), order_id.to_string()],
		)?;

		tx.execute(
			"INSERT INTO refund_events (id, user_id, order_id, task_id, amount, at) \
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
			params![
				Uuid::new_v4().to_string(),
				user_id.to_string(),
				order_id.to_string(),
				task_id.to_string(),
				amount.to_string(),
				millis(now),
			],
		)?;
		tx.commit()?;
		Ok(RefundOutcome::Applied(entry))
	}

	async fn ledger_entries_for_order(
		&self,
		order_id: Uuid,
	) -> Result<Vec<LedgerEntry>, StoreError> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(
			"SELECT id, user_id, order_id, task_id, amount, balance_before, balance_after, \
			        kind, reason, at \
			 FROM balance_transactions WHERE order_id = ?1 ORDER BY at",
		)?;
		let rows =
			stmt.query_map(params![order_id.to_string()], |row| Ok(row_to_ledger_entry(row)))?;
		rows.collect::<Result<Result<Vec<_>, _>, _>>()?
	}

	async fn refund_events_since(
		&self,
		since: DateTime<Utc>,
	) -> Result<Vec<RefundEvent>, StoreError> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(
			"SELECT id, user_id, order_id, task_id, amount, at \
			 FROM refund_events WHERE at >= ?1 ORDER BY at",
		)?;
		let rows = stmt.query_map(params![millis(since)], |row| {
			let id: String = row.get(0)?;
			let user_id: String = row.get(1)?;
			let order_id: String = row.get(2)?;
			let task_id: String = row.get(3)?;
			let amount: String = row.get(4)?;
			let at: i64 = row.get(5)?;
			Ok((id, user_id, order_id, task_id, amount, at))
		})?;
		let mut events = Vec::new();
		for row in rows {
			let (id, user_id, order_id, task_id, amount, at) = row?;
			events.push(RefundEvent {
				id: uuid(&id)?,
				user_id: uuid(&user_id)?,
				order_id: uuid(&order_id)?,
				task_id: uuid(&task_id)?,
				amount: decimal(&amount)?,
				at: from_millis(at)?,
			});
		}
		Ok(events)
	}

	async fn record_anomaly(&self, anomaly: &RefundAnomaly) -> Result<(), StoreError> {
		let conn = self.conn.lock().await;
		conn.execute(
			"INSERT INTO refund_anomalies \
			 (id, order_id, kind, expected, actual, severity, detected_at, resolved_at) \
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
			params![
				anomaly.id.to_string(),
				anomaly.order_id.to_string(),
				anomaly.kind.as_str(),
				anomaly.expected.to_string(),
				anomaly.actual.to_string(),
				anomaly.severity.as_str(),
				millis(anomaly.detected_at),
				anomaly.resolved_at.map(millis),
			],
		)?;
		Ok(())
	}

	async fn open_anomaly_exists(
		&self,
		order_id: Uuid,
		kind: AnomalyKind,
	) -> Result<bool, StoreError> {
		let conn = self.conn.lock().await;
		let found: Option<i64> = conn
			.query_row(
				"SELECT 1 FROM refund_anomalies \
				 WHERE order_id = ?1 AND kind = ?2 AND resolved_at IS NULL",
				params![order_id.to_string(), kind.as_str()],
				|row| row.get(0),
			)
			.optional()?;
		Ok(found.is_some())
	}

	async fn open_anomalies(&self) -> Result<Vec<RefundAnomaly>, StoreError> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(
			"SELECT id, order_id, kind, expected, actual, severity, detected_at, resolved_at \
			 FROM refund_anomalies WHERE resolved_at IS NULL ORDER BY detected_at",
		)?;
		let rows = stmt.query_map([], |row| {
			let id: String = row.get(0)?;
			let order_id: String = row.get(1)?;
			let kind: String = row.get(2)?;
			let expected: String = row.get(3)?;
			let actual: String = row.get(4)?;
			let severity: String = row.get(5)?;
			let detected_at: i64 = row.get(6)?;
			let resolved_at: Option<i64> = row.get(7)?;
			Ok((id, order_id, kind, expected, actual, severity, detected_at, resolved_at))
		})?;
		let mut anomalies = Vec::new();
		for row in rows {
			let (id, order_id, kind, expected, actual, severity, detected_at, resolved_at) = row?;
			anomalies.push(RefundAnomaly {
				id: uuid(&id)?,
				order_id: uuid(&order_id)?,
				kind: parse::<AnomalyKind>(&kind)?,
				expected: decimal(&expected)?,
				actual: decimal(&actual)?,
				severity: parse::<AnomalySeverity>(&severity)?,
				detected_at: from_millis(detected_at)?,
				resolved_at: opt_millis(resolved_at)?,
			});
		}
		Ok(anomalies)
	}

	async fn flag_user(&self, flagged: &FlaggedUser) -> Result<(), StoreError> {
		let conn = self.conn.lock().await;
		conn.execute(
			"INSERT INTO flagged_users (user_id, refund_events, window_start, flagged_at) \
			 VALUES (?1, ?2, ?3, ?4) \
			 ON CONFLICT(user_id) DO UPDATE SET refund_events = excluded.refund_events, \
			     window_start = excluded.window_start, flagged_at = excluded.flagged_at",
			params![
				flagged.user_id.to_string(),
				flagged.refund_events as i64,
				millis(flagged.window_start),
				millis(flagged.flagged_at),
			],
		)?;
		Ok(())
	}

	async fn flagged_users(&self) -> Result<Vec<FlaggedUser>, StoreError> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(
			"SELECT user_id, refund_events, window_start, flagged_at FROM flagged_users",
		)?;
		let rows = stmt.query_map([], |row| {
			let user_id: String = row.get(0)?;
			let refund_events: i64 = row.get(1)?;
			let window_start: i64 = row.get(2)?;
			let flagged_at: i64 = row.get(3)?;
			Ok((user_id, refund_events, window_start, flagged_at))
		})?;
		let mut flagged = Vec::new();
		for row in rows {
			let (user_id, refund_events, window_start, flagged_at) = row?;
			flagged.push(FlaggedUser {
				user_id: uuid(&user_id)?,
				refund_events: refund_events as u64,
				window_start: from_millis(window_start)?,
				flagged_at: from_millis(flagged_at)?,
			});
		}
		Ok(flagged)
	}

	async fn insert_node(&self, node: &ProxyNode) -> Result<(), StoreError> {
		let conn = self.conn.lock().await;
		conn.execute(
			&format!("INSERT INTO proxy_nodes ({NODE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
			params![
				node.id.to_string(),
				node.endpoint,
				node.tier.as_str(),
				node.country.as_deref(),
				node.capacity as i64,
				node.current_load as i64,
				node.status.as_str(),
				node.auth.as_ref().map(|a| a.username.as_str()),
				node.auth.as_ref().map(|a| a.password.as_str()),
			],
		)?;
		Ok(())
	}

	async fn get_node(&self, node_id: Uuid) -> Result<ProxyNode, StoreError> {
		let conn = self.conn.lock().await;
		conn.query_row(
			&format!("SELECT {NODE_COLUMNS} FROM proxy_nodes WHERE id = ?1"),
			params![node_id.to_string()],
			|row| Ok(row_to_node(row)),
		)
		.optional()?
		.ok_or(StoreError::NotFound)?
	}

	async fn list_candidates(
		&self,
		tier: ProxyTier,
		country: Option<&str>,
		limit: usize,
	) -> Result<Vec<ProxyNode>, StoreError> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(&format!(
			"SELECT {NODE_COLUMNS} FROM proxy_nodes \
			 WHERE tier = ?1 AND status = 'ONLINE' AND current_load < capacity \
			   AND (?2 IS NULL OR country = ?2) \
			 ORDER BY id LIMIT ?3"
		))?;
		let rows = stmt.query_map(params![tier.as_str(), country, limit as i64], |row| {
			Ok(row_to_node(row))
		})?;
		rows.collect::<Result<Result<Vec<_>, _>, _>>()?
	}

	async fn lease_node(&self, node_id: Uuid) -> Result<bool, StoreError> {
		let conn = self.conn.lock().await;
		let updated = conn.execute(
			"UPDATE proxy_nodes SET current_load = current_load + 1 \
			 WHERE id = ?1 AND status = 'ONLINE' AND current_load < capacity",
			params![node_id.to_string()],
		)?;
		Ok(updated > 0)
	}

	async fn release_node(&self, node_id: Uuid) -> Result<(), StoreError> {
		let conn = self.conn.lock().await;
		conn.execute(
			"UPDATE proxy_nodes SET current_load = MAX(current_load - 1, 0) WHERE id = ?1",
			params![node_id.to_string()],
		)?;
		Ok(())
	}

	async fn set_node_status(
		&self,
		node_id: Uuid,
		status: ProxyNodeStatus,
	) -> Result<(), StoreError> {
		let conn = self.conn.lock().await;
		conn.execute(
			"UPDATE proxy_nodes SET status = ?1 WHERE id = ?2",
			params![status.as_str(), node_id.to_string()],
		)?;
		Ok(())
	}

	async fn all_nodes(&self) -> Result<Vec<ProxyNode>, StoreError> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM proxy_nodes"))?;
		let rows = stmt.query_map([], |row| Ok(row_to_node(row)))?;
		rows.collect::<Result<Result<Vec<_>, _>, _>>()?
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;
	use rust_decimal_macros::dec;

	fn sample_task(order_id: Uuid, seq: u32, quantity: u64) -> Task {
		Task {
			id: Uuid::new_v4(),
			order_id,
			sequence_number: seq,
			quantity,
			scheduled_at: Utc::now(),
			status: TaskStatus::Pending,
			attempts: 0,
			max_attempts: 3,
			retry_after: None,
			execution_started_at: None,
			worker_id: None,
			proxy_node_id: None,
			idempotency_token: format!("token-{seq}"),
			refunded: false,
			error_message: None,
			completed_at: None,
		}
	}

	async fn seeded() -> (SqliteStore, Order, Vec<Task>) {
		let store = SqliteStore::open_in_memory().unwrap();
		let user_id = Uuid::new_v4();
		store.upsert_user(user_id, dec!(100)).await.unwrap();
		let order =
			Order::new(user_id, "https://example.com/track", 1000, dec!(0.0002), None).unwrap();
		let tasks = vec![sample_task(order.id, 0, 500), sample_task(order.id, 1, 500)];
		store.create_order_with_tasks(&order, &tasks).await.unwrap();
		(store, order, tasks)
	}

	#[tokio::test]
	async fn order_round_trips_through_schema() {
		let (store, order, tasks) = seeded().await;
		let loaded = store.get_order(order.id).await.unwrap();
		assert_eq!(loaded.quantity, 1000);
		assert_eq!(loaded.price_per_unit, dec!(0.0002));
		assert_eq!(loaded.total_cost, dec!(0.2000));
		assert_eq!(loaded.status, OrderStatus::Pending);

		let loaded_tasks = store.tasks_for_order(order.id).await.unwrap();
		assert_eq!(loaded_tasks.len(), 2);
		assert_eq!(loaded_tasks[0].id, tasks[0].id);
		assert_eq!(loaded_tasks[1].sequence_number, 1);
	}

	#[tokio::test]
	async fn debit_writes_ledger_row() {
		let (store, order, _) = seeded().await;
		assert_eq!(store.user_balance(order.user_id).await.unwrap(), dec!(99.8000));
		let ledger = store.ledger_entries_for_order(order.id).await.unwrap();
		assert_eq!(ledger.len(), 1);
		assert_eq!(ledger[0].kind, LedgerEntryKind::Debit);
		assert_eq!(ledger[0].amount, dec!(-0.2000));
		assert_eq!(ledger[0].balance_after, dec!(99.8000));
	}

	#[tokio::test]
	async fn insufficient_balance_rolls_back_everything() {
		let store = SqliteStore::open_in_memory().unwrap();
		let user_id = Uuid::new_v4();
		store.upsert_user(user_id, dec!(0.01)).await.unwrap();
		let order =
			Order::new(user_id, "https://example.com", 1000, dec!(0.0002), None).unwrap();
		let tasks = vec![sample_task(order.id, 0, 1000)];

		let result = store.create_order_with_tasks(&order, &tasks).await;
		assert!(matches!(result, Err(StoreError::InsufficientBalance)));
		assert!(matches!(store.get_order(order.id).await, Err(StoreError::NotFound)));
		assert_eq!(store.user_balance(user_id).await.unwrap(), dec!(0.01));
	}

	#[tokio::test]
	async fn claim_is_a_single_conditional_update() {
		let (store, _, tasks) = seeded().await;
		let now = Utc::now();
		let cutoff = now - Duration::seconds(120);

		let won = store
			.claim_task(tasks[0].id, TaskStatus::Pending, cutoff, "worker-a", now)
			.await
			.unwrap();
		match won {
			ClaimOutcome::Claimed(task) => {
				assert_eq!(task.status, TaskStatus::Executing);
				assert_eq!(task.attempts, 1);
				assert_eq!(task.worker_id.as_deref(), Some("worker-a"));
			}
			ClaimOutcome::Lost => panic!("expected claim"),
		}

		let lost = store
			.claim_task(tasks[0].id, TaskStatus::Pending, cutoff, "worker-b", now)
			.await
			.unwrap();
		assert!(matches!(lost, ClaimOutcome::Lost));
	}

	#[tokio::test]
	async fn complete_and_fail_advance_order_atomically() {
		let (store, order, tasks) = seeded().await;
		let now = Utc::now();
		let cutoff = now - Duration::seconds(120);
		for task in &tasks {
			store
				.claim_task(task.id, TaskStatus::Pending, cutoff, "worker-a", now)
				.await
				.unwrap();
		}

		let progress = store.complete_task(tasks[0].id, order.id, 500, now).await.unwrap();
		assert_eq!(progress.delivered, 500);
		assert_eq!(progress.remains, 500);

		let progress = store
			.fail_task_permanent(tasks[1].id, order.id, 500, "boom")
			.await
			.unwrap();
		assert_eq!(progress.failed_permanent, 500);
		assert_eq!(progress.remains, 0);
		assert!(progress.is_fully_accounted());

		let finalized = store.finalize_order_if_complete(order.id, now).await.unwrap();
		let finalized = finalized.expect("order should finalize");
		assert_eq!(finalized.status, OrderStatus::Completed);
		assert!(finalized.notes.unwrap().contains("Delivered: 500"));

		// Finalizing again is a no-op.
		assert!(store
			.finalize_order_if_complete(order.id, now)
			.await
			.unwrap()
			.is_none());
	}

	#[tokio::test]
	async fn refund_is_idempotent_across_retries() {
		let (store, order, tasks) = seeded().await;
		let now = Utc::now();
		let amount = dec!(0.1000);

		let first = store
			.apply_refund(tasks[0].id, order.id, order.user_id, amount, true, now)
			.await
			.unwrap();
		assert!(matches!(first, RefundOutcome::Applied(_)));
		let second = store
			.apply_refund(tasks[0].id, order.id, order.user_id, amount, true, now)
			.await
			.unwrap();
		assert!(matches!(second, RefundOutcome::AlreadyRefunded));

		assert_eq!(store.user_balance(order.user_id).await.unwrap(), dec!(99.9000));
		assert_eq!(store.get_order(order.id).await.unwrap().refund_amount, amount);
		assert_eq!(
			store
				.refund_events_since(now - Duration::hours(1))
				.await
				.unwrap()
				.len(),
			1
		);
	}

	#[tokio::test]
	async fn due_query_and_orphan_probe() {
		let (store, _, tasks) = seeded().await;
		let now = Utc::now();
		let cutoff = now - Duration::seconds(120);

		store
			.claim_task(tasks[0].id, TaskStatus::Pending, cutoff, "worker-a", now - Duration::seconds(300))
			.await
			.unwrap();

		assert_eq!(store.executing_older_than(cutoff).await.unwrap(), 1);

		let due = store.due_tasks(now, cutoff, 10).await.unwrap();
		// The orphaned EXECUTING task and the still-pending one.
		assert_eq!(due.len(), 2);
	}

	#[tokio::test]
	async fn duplicate_external_key_is_idempotent() {
		let store = SqliteStore::open_in_memory().unwrap();
		let user_id = Uuid::new_v4();
		store.upsert_user(user_id, dec!(10)).await.unwrap();

		let first = Order::new(
			user_id,
			"https://example.com",
			500,
			dec!(0.0002),
			Some("key-1".into()),
		)
		.unwrap();
		store.create_order_with_tasks(&first, &[]).await.unwrap();

		let second = Order::new(
			user_id,
			"https://example.com",
			500,
			dec!(0.0002),
			Some("key-1".into()),
		)
		.unwrap();
		let outcome = store.create_order_with_tasks(&second, &[]).await.unwrap();
		assert!(matches!(outcome, CreateOrderOutcome::Existing(o) if o.id == first.id));
		assert_eq!(store.user_balance(user_id).await.unwrap(), dec!(9.9000));
	}

	#[tokio::test]
	async fn state_survives_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("playflow.db");
		let user_id = Uuid::new_v4();
		let order =
			Order::new(user_id, "https://example.com", 1000, dec!(0.0002), None).unwrap();

		{
			let store = SqliteStore::open(&path).unwrap();
			store.upsert_user(user_id, dec!(10)).await.unwrap();
			store
				.create_order_with_tasks(&order, &[sample_task(order.id, 0, 1000)])
				.await
				.unwrap();
		}

		let store = SqliteStore::open(&path).unwrap();
		let loaded = store.get_order(order.id).await.unwrap();
		assert_eq!(loaded.quantity, 1000);
		assert_eq!(store.tasks_for_order(order.id).await.unwrap().len(), 1);
		assert_eq!(store.user_balance(user_id).await.unwrap(), dec!(9.8000));
	}

	#[tokio::test]
	async fn node_lifecycle() {
		let store = SqliteStore::open_in_memory().unwrap();
		let node = ProxyNode {
			id: Uuid::new_v4(),
			endpoint: "10.0.0.1:8080".into(),
			tier: ProxyTier::Datacenter,
			country: Some("US".into()),
			capacity: 2,
			current_load: 0,
			status: ProxyNodeStatus::Online,
			auth: Some(ProxyAuth {
				username: "u".into(),
				password: "p".into(),
			}),
		};
		store.insert_node(&node).await.unwrap();

		let candidates = store
			.list_candidates(ProxyTier::Datacenter, Some("US"), 10)
			.await
			.unwrap();
		assert_eq!(candidates.len(), 1);
		assert!(candidates[0].auth.is_some());

		assert!(store.lease_node(node.id).await.unwrap());
		assert!(store.lease_node(node.id).await.unwrap());
		assert!(!store.lease_node(node.id).await.unwrap());

		store.set_node_status(node.id, ProxyNodeStatus::Offline).await.unwrap();
		assert!(store
			.list_candidates(ProxyTier::Datacenter, None, 10)
			.await
			.unwrap()
			.is_empty());
	}
}
