#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use kisaan_domain::{Conversation, ConversationId, FarmerId, Message, MessageId};
use tracing::info;

use crate::{
	ConversationPatch, MessageStore, NewMessage, StoreError, UserDirectory, UserProfile, apply_patch, build_message,
	unix_ms_now,
};

const CONVERSATION_COLS: &str = "id, farmer_id, last_message_id, last_activity, unread_count, total_messages, active, created_at";

const MESSAGE_COLS: &str = "id, conversation_id, sender_id, sender_kind, message_type, content, media_url, \
	media_duration_secs, media_size_bytes, is_proactive, alert_type, status, read_at, created_at";

type ConversationRow = (String, String, Option<String>, i64, i64, i64, i64, i64);

type MessageRow = (
	String,
	String,
	String,
	String,
	String,
	String,
	Option<String>,
	Option<i64>,
	Option<i64>,
	i64,
	Option<String>,
	String,
	Option<i64>,
	i64,
);

fn decode_conversation(row: ConversationRow) -> Result<Conversation, StoreError> {
	let (id, farmer_id, last_message_id, last_activity, unread_count, total_messages, active, created_at) = row;

	Ok(Conversation {
		id: id.parse().map_err(|e| StoreError::backend(anyhow!("conversation id: {e}")))?,
		farmer_id: FarmerId::new(farmer_id).map_err(|e| StoreError::backend(anyhow!("farmer id: {e}")))?,
		last_message_id: last_message_id
			.map(|s| s.parse().map_err(|e| StoreError::backend(anyhow!("last message id: {e}"))))
			.transpose()?,
		last_activity_unix_ms: last_activity,
		unread_count: unread_count.max(0) as u32,
		total_messages: total_messages.max(0) as u64,
		active: active != 0,
		created_at_unix_ms: created_at,
	})
}

fn decode_message(row: MessageRow) -> Result<Message, StoreError> {
	let (
		id,
		conversation_id,
		sender_id,
		sender_kind,
		message_type,
		content,
		media_url,
		media_duration_secs,
		media_size_bytes,
		is_proactive,
		alert_type,
		status,
		read_at,
		created_at,
	) = row;

	Ok(Message {
		id: id.parse().map_err(|e| StoreError::backend(anyhow!("message id: {e}")))?,
		conversation_id: conversation_id
			.parse()
			.map_err(|e| StoreError::backend(anyhow!("conversation id: {e}")))?,
		sender_id,
		sender_kind: sender_kind
			.parse()
			.map_err(|e| StoreError::backend(anyhow!("sender kind: {e}")))?,
		message_type: message_type
			.parse()
			.map_err(|e| StoreError::backend(anyhow!("message type: {e}")))?,
		content,
		media_url,
		media_duration_secs: media_duration_secs.map(|v| v.max(0) as u32),
		media_size_bytes: media_size_bytes.map(|v| v.max(0) as u64),
		is_proactive: is_proactive != 0,
		alert_type: alert_type
			.map(|s| s.parse().map_err(|e| StoreError::backend(anyhow!("alert type: {e}"))))
			.transpose()?,
		status: status.parse().map_err(|e| StoreError::backend(anyhow!("status: {e}")))?,
		read_at_unix_ms: read_at,
		created_at_unix_ms: created_at,
	})
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

async fn connect_backend(database_url: &str, run_migrations: bool) -> anyhow::Result<SqlBackend> {
	if database_url.starts_with("sqlite:") {
		let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
		if run_migrations {
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
		}
		Ok(SqlBackend::Sqlite(pool))
	} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
		let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
		if run_migrations {
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
		}
		Ok(SqlBackend::Postgres(pool))
	} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
		let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
		if run_migrations {
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
		}
		Ok(SqlBackend::Mysql(pool))
	} else {
		Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
	}
}

/// SQL-backed message store (sqlite, postgres or mysql).
#[derive(Clone)]
pub struct SqlMessageStore {
	backend: SqlBackend,
}

impl SqlMessageStore {
	/// Connect and run migrations.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = connect_backend(database_url, true).await?;
		info!("message store connected");
		Ok(Self { backend })
	}

	async fn fetch_conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
		let sql_q = format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE id = ?");
		let pg_q = format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE id = $1");

		let row: Option<ConversationRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&sql_q)
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.map_err(StoreError::backend)?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&pg_q)
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.map_err(StoreError::backend)?,
			SqlBackend::Mysql(pool) => sqlx::query_as(&sql_q)
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.map_err(StoreError::backend)?,
		};

		row.map(decode_conversation).transpose()
	}

	async fn store_conversation(&self, convo: &Conversation) -> Result<(), StoreError> {
		let sql_q = "UPDATE conversations SET last_message_id = ?, last_activity = ?, unread_count = ?, \
			total_messages = ?, active = ? WHERE id = ?";
		let pg_q = "UPDATE conversations SET last_message_id = $1, last_activity = $2, unread_count = $3, \
			total_messages = $4, active = $5 WHERE id = $6";

		let last_message_id = convo.last_message_id.map(|m| m.to_string());

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(sql_q)
					.bind(last_message_id)
					.bind(convo.last_activity_unix_ms)
					.bind(convo.unread_count as i64)
					.bind(convo.total_messages as i64)
					.bind(convo.active as i64)
					.bind(convo.id.to_string())
					.execute(pool)
					.await
					.map_err(StoreError::backend)?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(pg_q)
					.bind(last_message_id)
					.bind(convo.last_activity_unix_ms)
					.bind(convo.unread_count as i64)
					.bind(convo.total_messages as i64)
					.bind(convo.active as i64)
					.bind(convo.id.to_string())
					.execute(pool)
					.await
					.map_err(StoreError::backend)?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(sql_q)
					.bind(last_message_id)
					.bind(convo.last_activity_unix_ms)
					.bind(convo.unread_count as i64)
					.bind(convo.total_messages as i64)
					.bind(convo.active as i64)
					.bind(convo.id.to_string())
					.execute(pool)
					.await
					.map_err(StoreError::backend)?;
			}
		}

		Ok(())
	}
}

#[async_trait::async_trait]
impl MessageStore for SqlMessageStore {
	async fn find_conversation(&self, farmer_id: &FarmerId) -> Result<Option<Conversation>, StoreError> {
		let sql_q = format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE farmer_id = ?");
		let pg_q = format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE farmer_id = $1");

		let row: Option<ConversationRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&sql_q)
				.bind(farmer_id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(StoreError::backend)?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&pg_q)
				.bind(farmer_id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(StoreError::backend)?,
			SqlBackend::Mysql(pool) => sqlx::query_as(&sql_q)
				.bind(farmer_id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(StoreError::backend)?,
		};

		row.map(decode_conversation).transpose()
	}

	async fn create_conversation(&self, farmer_id: &FarmerId) -> Result<Conversation, StoreError> {
		if self.find_conversation(farmer_id).await?.is_some() {
			return Err(StoreError::Conflict(format!("conversation exists for farmer {farmer_id}")));
		}

		let now = unix_ms_now();
		let convo = Conversation {
			id: ConversationId::new_v4(),
			farmer_id: farmer_id.clone(),
			last_message_id: None,
			last_activity_unix_ms: now,
			unread_count: 0,
			total_messages: 0,
			active: true,
			created_at_unix_ms: now,
		};

		let sql_q = "INSERT INTO conversations (id, farmer_id, last_message_id, last_activity, unread_count, \
			total_messages, active, created_at) VALUES (?, ?, NULL, ?, 0, 0, 1, ?)";
		let pg_q = "INSERT INTO conversations (id, farmer_id, last_message_id, last_activity, unread_count, \
			total_messages, active, created_at) VALUES ($1, $2, NULL, $3, 0, 0, 1, $4)";

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(sql_q)
					.bind(convo.id.to_string())
					.bind(farmer_id.as_str())
					.bind(now)
					.bind(now)
					.execute(pool)
					.await
					.map_err(StoreError::backend)?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(pg_q)
					.bind(convo.id.to_string())
					.bind(farmer_id.as_str())
					.bind(now)
					.bind(now)
					.execute(pool)
					.await
					.map_err(StoreError::backend)?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(sql_q)
					.bind(convo.id.to_string())
					.bind(farmer_id.as_str())
					.bind(now)
					.bind(now)
					.execute(pool)
					.await
					.map_err(StoreError::backend)?;
			}
		}

		Ok(convo)
	}

	async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
		self.fetch_conversation(id).await
	}

	async fn append_message(&self, msg: NewMessage) -> Result<Message, StoreError> {
		if self.fetch_conversation(msg.conversation_id).await?.is_none() {
			return Err(StoreError::NotFound(format!("conversation {}", msg.conversation_id)));
		}

		let message = build_message(msg, MessageId::new_v4(), unix_ms_now());

		let sql_q = format!("INSERT INTO messages ({MESSAGE_COLS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");
		let pg_q = format!(
			"INSERT INTO messages ({MESSAGE_COLS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
		);

		macro_rules! bind_message {
			($query:expr) => {
				$query
					.bind(message.id.to_string())
					.bind(message.conversation_id.to_string())
					.bind(message.sender_id.as_str())
					.bind(message.sender_kind.as_str())
					.bind(message.message_type.as_str())
					.bind(message.content.as_str())
					.bind(message.media_url.as_deref())
					.bind(message.media_duration_secs.map(|v| v as i64))
					.bind(message.media_size_bytes.map(|v| v as i64))
					.bind(message.is_proactive as i64)
					.bind(message.alert_type.map(|a| a.as_str()))
					.bind(message.status.as_str())
					.bind(message.read_at_unix_ms)
					.bind(message.created_at_unix_ms)
			};
		}

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				bind_message!(sqlx::query(&sql_q))
					.execute(pool)
					.await
					.map_err(StoreError::backend)?;
			}
			SqlBackend::Postgres(pool) => {
				bind_message!(sqlx::query(&pg_q))
					.execute(pool)
					.await
					.map_err(StoreError::backend)?;
			}
			SqlBackend::Mysql(pool) => {
				bind_message!(sqlx::query(&sql_q))
					.execute(pool)
					.await
					.map_err(StoreError::backend)?;
			}
		}

		Ok(message)
	}

	async fn update_conversation(&self, id: ConversationId, patch: ConversationPatch) -> Result<(), StoreError> {
		let Some(mut convo) = self.fetch_conversation(id).await? else {
			return Err(StoreError::NotFound(format!("conversation {id}")));
		};

		apply_patch(&mut convo, patch, unix_ms_now());
		self.store_conversation(&convo).await
	}

	async fn mark_messages_read(&self, id: ConversationId, read_at_unix_ms: i64) -> Result<u64, StoreError> {
		if self.fetch_conversation(id).await?.is_none() {
			return Err(StoreError::NotFound(format!("conversation {id}")));
		}

		let sql_q = "UPDATE messages SET status = 'read', read_at = ? WHERE conversation_id = ? \
			AND sender_kind = 'ai_agent' AND status <> 'read'";
		let pg_q = "UPDATE messages SET status = 'read', read_at = $1 WHERE conversation_id = $2 \
			AND sender_kind = 'ai_agent' AND status <> 'read'";

		let updated = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(sql_q)
				.bind(read_at_unix_ms)
				.bind(id.to_string())
				.execute(pool)
				.await
				.map_err(StoreError::backend)?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query(pg_q)
				.bind(read_at_unix_ms)
				.bind(id.to_string())
				.execute(pool)
				.await
				.map_err(StoreError::backend)?
				.rows_affected(),
			SqlBackend::Mysql(pool) => sqlx::query(sql_q)
				.bind(read_at_unix_ms)
				.bind(id.to_string())
				.execute(pool)
				.await
				.map_err(StoreError::backend)?
				.rows_affected(),
		};

		let reset_sql = "UPDATE conversations SET unread_count = 0 WHERE id = ?";
		let reset_pg = "UPDATE conversations SET unread_count = 0 WHERE id = $1";

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(reset_sql)
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(StoreError::backend)?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(reset_pg)
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(StoreError::backend)?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(reset_sql)
					.bind(id.to_string())
					.execute(pool)
					.await
					.map_err(StoreError::backend)?;
			}
		}

		Ok(updated)
	}

	async fn recent_messages(&self, id: ConversationId, limit: u32) -> Result<Vec<Message>, StoreError> {
		let sql_q = format!("SELECT {MESSAGE_COLS} FROM messages WHERE conversation_id = ? ORDER BY seq DESC LIMIT ?");
		let pg_q = format!("SELECT {MESSAGE_COLS} FROM messages WHERE conversation_id = $1 ORDER BY seq DESC LIMIT $2");

		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&sql_q)
				.bind(id.to_string())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.map_err(StoreError::backend)?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&pg_q)
				.bind(id.to_string())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.map_err(StoreError::backend)?,
			SqlBackend::Mysql(pool) => sqlx::query_as(&sql_q)
				.bind(id.to_string())
				.bind(limit as i64)
				.fetch_all(pool)
				.await
				.map_err(StoreError::backend)?,
		};

		let mut messages = rows.into_iter().map(decode_message).collect::<Result<Vec<_>, _>>()?;
		messages.reverse();
		Ok(messages)
	}

	async fn list_active_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
		let sql_q = format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE active <> 0 ORDER BY created_at");
		let pg_q = sql_q.clone();

		let rows: Vec<ConversationRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&sql_q).fetch_all(pool).await.map_err(StoreError::backend)?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&pg_q).fetch_all(pool).await.map_err(StoreError::backend)?,
			SqlBackend::Mysql(pool) => sqlx::query_as(&sql_q).fetch_all(pool).await.map_err(StoreError::backend)?,
		};

		rows.into_iter().map(decode_conversation).collect()
	}
}

/// SQL-backed user directory (shares the message store schema).
#[derive(Clone)]
pub struct SqlUserDirectory {
	backend: SqlBackend,
}

impl SqlUserDirectory {
	/// Connect without running migrations (the message store owns the schema).
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = connect_backend(database_url, false).await?;
		Ok(Self { backend })
	}
}

type UserRow = (String, String, String, Option<String>, Option<String>);

#[async_trait::async_trait]
impl UserDirectory for SqlUserDirectory {
	async fn find_user(&self, id: &str) -> Result<Option<UserProfile>, StoreError> {
		let sql_q = "SELECT id, name, role, location, preferred_language FROM users WHERE id = ?";
		let pg_q = "SELECT id, name, role, location, preferred_language FROM users WHERE id = $1";

		let row: Option<UserRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(sql_q)
				.bind(id)
				.fetch_optional(pool)
				.await
				.map_err(StoreError::backend)?,
			SqlBackend::Postgres(pool) => sqlx::query_as(pg_q)
				.bind(id)
				.fetch_optional(pool)
				.await
				.map_err(StoreError::backend)?,
			SqlBackend::Mysql(pool) => sqlx::query_as(sql_q)
				.bind(id)
				.fetch_optional(pool)
				.await
				.map_err(StoreError::backend)?,
		};

		let Some((id, name, role, location, preferred_language)) = row else {
			return Ok(None);
		};

		Ok(Some(UserProfile {
			id,
			name,
			role: role.parse().map_err(|e| StoreError::backend(anyhow!("user role: {e}")))?,
			location,
			preferred_language,
		}))
	}
}
