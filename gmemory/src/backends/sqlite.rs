//! SQLite-backed thread store.
//!
//! One document per thread, with usage counters applied as in-place SQL
//! increments so concurrent sessions never race a read-modify-write cycle.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use gcommon::{BoxFuture, ErrorCode, ErrorRecord, ThreadId, UsdMicros};
use gprovider::ProviderKind;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::MemoryError;
use crate::store::ThreadStore;
use crate::types::{StoredContext, ThreadPatch, ThreadRecord, UsageAggregate, UsageIncrement};

pub fn default_sqlite_path() -> PathBuf {
    PathBuf::from("gantry-threads.sqlite3")
}

#[derive(Debug)]
pub struct SqliteThreadStore {
    connection: Mutex<Connection>,
}

impl SqliteThreadStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|error| {
                MemoryError::storage(format!("failed to create sqlite parent directory: {error}"))
            })?;
        }

        let connection = Connection::open(path).map_err(|error| {
            MemoryError::storage(format!("failed to open sqlite database: {error}"))
        })?;

        Self::from_connection(connection)
    }

    pub fn new_in_memory() -> Result<Self, MemoryError> {
        let connection = Connection::open_in_memory().map_err(|error| {
            MemoryError::storage(format!("failed to open in-memory sqlite database: {error}"))
        })?;

        Self::from_connection(connection)
    }

    fn from_connection(connection: Connection) -> Result<Self, MemoryError> {
        connection
            .busy_timeout(Duration::from_secs(5))
            .map_err(|error| {
                MemoryError::storage(format!("failed to configure sqlite busy timeout: {error}"))
            })?;

        let store = Self {
            connection: Mutex::new(connection),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>, MemoryError> {
        self.connection
            .lock()
            .map_err(|_| MemoryError::storage("sqlite store lock poisoned"))
    }

    fn initialize_schema(&self) -> Result<(), MemoryError> {
        let conn = self.connection()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                total_used INTEGER NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_cost_micros INTEGER NOT NULL,
                image_tokens INTEGER NOT NULL,
                cache_prompt_tokens INTEGER NOT NULL,
                cache_cost_micros INTEGER NOT NULL,
                credits_used INTEGER NOT NULL,
                last_response_model TEXT,
                last_error_code TEXT,
                last_error_message TEXT,
                last_error_platform TEXT,
                last_error_status INTEGER
            );

            CREATE TABLE IF NOT EXISTS thread_context (
                thread_id TEXT PRIMARY KEY,
                messages_json TEXT NOT NULL,
                summary TEXT
            );
            ",
        )
        .map_err(storage_error)
    }
}

impl ThreadStore for SqliteThreadStore {
    fn get<'a>(
        &'a self,
        thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, Result<Option<ThreadRecord>, MemoryError>> {
        Box::pin(async move {
            let conn = self.connection()?;
            conn.query_row(
                "SELECT thread_id, provider, model, total_used, prompt_tokens,
                        completion_tokens, total_cost_micros, image_tokens,
                        cache_prompt_tokens, cache_cost_micros, credits_used,
                        last_response_model, last_error_code, last_error_message,
                        last_error_platform, last_error_status
                 FROM threads WHERE thread_id = ?1",
                params![thread_id.as_str()],
                row_to_record,
            )
            .optional()
            .map_err(storage_error)?
            .transpose()
        })
    }

    fn create_if_missing<'a>(
        &'a self,
        record: ThreadRecord,
    ) -> BoxFuture<'a, Result<bool, MemoryError>> {
        Box::pin(async move {
            let conn = self.connection()?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO threads (
                        thread_id, provider, model, total_used, prompt_tokens,
                        completion_tokens, total_cost_micros, image_tokens,
                        cache_prompt_tokens, cache_cost_micros, credits_used,
                        last_response_model, last_error_code, last_error_message,
                        last_error_platform, last_error_status
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    params![
                        record.id.as_str(),
                        record.provider.to_string(),
                        record.model,
                        record.usage.total_used as i64,
                        record.usage.prompt as i64,
                        record.usage.completion as i64,
                        record.usage.total_cost.as_micros() as i64,
                        record.usage.image as i64,
                        record.usage.cache_prompt as i64,
                        record.usage.cache_cost.as_micros() as i64,
                        record.credits_used as i64,
                        record.last_response_model,
                        record.last_error.as_ref().map(|error| error.code.as_str()),
                        record.last_error.as_ref().map(|error| error.message.clone()),
                        record.last_error.as_ref().map(|error| error.platform.clone()),
                        record.last_error.as_ref().map(|error| error.status as i64),
                    ],
                )
                .map_err(storage_error)?;

            Ok(inserted > 0)
        })
    }

    fn apply_usage<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        increment: UsageIncrement,
    ) -> BoxFuture<'a, Result<(), MemoryError>> {
        Box::pin(async move {
            let conn = self.connection()?;
            let updated = conn
                .execute(
                    "UPDATE threads SET
                        total_used = total_used + ?1,
                        prompt_tokens = prompt_tokens + ?2,
                        completion_tokens = completion_tokens + ?3,
                        total_cost_micros = total_cost_micros + ?4,
                        image_tokens = image_tokens + ?5,
                        cache_prompt_tokens = cache_prompt_tokens + ?6,
                        cache_cost_micros = cache_cost_micros + ?7,
                        credits_used = credits_used + ?8
                     WHERE thread_id = ?9",
                    params![
                        increment.total_used as i64,
                        increment.prompt as i64,
                        increment.completion as i64,
                        increment.cost.as_micros() as i64,
                        increment.image as i64,
                        increment.cache_prompt as i64,
                        increment.cache_cost.as_micros() as i64,
                        increment.credits as i64,
                        thread_id.as_str(),
                    ],
                )
                .map_err(storage_error)?;

            if updated == 0 {
                return Err(MemoryError::not_found(format!(
                    "thread '{thread_id}' does not exist"
                )));
            }

            Ok(())
        })
    }

    fn set_fields<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        patch: ThreadPatch,
    ) -> BoxFuture<'a, Result<(), MemoryError>> {
        Box::pin(async move {
            if patch.is_empty() {
                return Ok(());
            }

            let conn = self.connection()?;
            let updated = conn
                .execute(
                    "UPDATE threads SET
                        last_response_model = COALESCE(?1, last_response_model),
                        last_error_code = COALESCE(?2, last_error_code),
                        last_error_message = COALESCE(?3, last_error_message),
                        last_error_platform = COALESCE(?4, last_error_platform),
                        last_error_status = COALESCE(?5, last_error_status)
                     WHERE thread_id = ?6",
                    params![
                        patch.last_response_model,
                        patch.last_error.as_ref().map(|error| error.code.as_str()),
                        patch.last_error.as_ref().map(|error| error.message.clone()),
                        patch.last_error.as_ref().map(|error| error.platform.clone()),
                        patch.last_error.as_ref().map(|error| error.status as i64),
                        thread_id.as_str(),
                    ],
                )
                .map_err(storage_error)?;

            if updated == 0 {
                return Err(MemoryError::not_found(format!(
                    "thread '{thread_id}' does not exist"
                )));
            }

            Ok(())
        })
    }

    fn load_context<'a>(
        &'a self,
        thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, Result<StoredContext, MemoryError>> {
        Box::pin(async move {
            let conn = self.connection()?;
            let row = conn
                .query_row(
                    "SELECT messages_json, summary FROM thread_context WHERE thread_id = ?1",
                    params![thread_id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                        ))
                    },
                )
                .optional()
                .map_err(storage_error)?;

            let Some((messages_json, summary)) = row else {
                return Ok(StoredContext::default());
            };

            let messages = serde_json::from_str(&messages_json).map_err(|error| {
                MemoryError::serialization(format!("failed to decode context messages: {error}"))
            })?;

            Ok(StoredContext { messages, summary })
        })
    }

    fn save_context<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        context: StoredContext,
    ) -> BoxFuture<'a, Result<(), MemoryError>> {
        Box::pin(async move {
            let messages_json = serde_json::to_string(&context.messages).map_err(|error| {
                MemoryError::serialization(format!("failed to encode context messages: {error}"))
            })?;

            let conn = self.connection()?;
            conn.execute(
                "INSERT INTO thread_context (thread_id, messages_json, summary)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(thread_id) DO UPDATE SET
                    messages_json = excluded.messages_json,
                    summary = excluded.summary",
                params![thread_id.as_str(), messages_json, context.summary],
            )
            .map_err(storage_error)?;

            Ok(())
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ThreadRecord, MemoryError>> {
    let thread_id: String = row.get(0)?;
    let provider: String = row.get(1)?;
    let model: String = row.get(2)?;
    let usage = UsageAggregate {
        total_used: row.get::<_, i64>(3)? as u64,
        prompt: row.get::<_, i64>(4)? as u64,
        completion: row.get::<_, i64>(5)? as u64,
        total_cost: UsdMicros::from_micros(row.get::<_, i64>(6)? as u64),
        image: row.get::<_, i64>(7)? as u64,
        cache_prompt: row.get::<_, i64>(8)? as u64,
        cache_cost: UsdMicros::from_micros(row.get::<_, i64>(9)? as u64),
    };
    let credits_used = row.get::<_, i64>(10)? as u64;
    let last_response_model: Option<String> = row.get(11)?;
    let last_error_code: Option<String> = row.get(12)?;
    let last_error_message: Option<String> = row.get(13)?;
    let last_error_platform: Option<String> = row.get(14)?;
    let last_error_status: Option<i64> = row.get(15)?;

    let Some(provider) = ProviderKind::parse(&provider) else {
        return Ok(Err(MemoryError::serialization(format!(
            "thread '{thread_id}' references unknown provider '{provider}'"
        ))));
    };

    let last_error = match (last_error_code, last_error_message, last_error_platform) {
        (Some(code), Some(message), Some(platform)) => match ErrorCode::parse(&code) {
            Some(code) => {
                let mut record = ErrorRecord::new(code, platform, message);
                if let Some(status) = last_error_status {
                    record = record.with_status(status as u16);
                }
                Some(record)
            }
            None => {
                return Ok(Err(MemoryError::serialization(format!(
                    "thread '{thread_id}' references unknown error code '{code}'"
                ))));
            }
        },
        _ => None,
    };

    Ok(Ok(ThreadRecord {
        id: ThreadId::from(thread_id),
        provider,
        model,
        usage,
        credits_used,
        last_response_model,
        last_error,
    }))
}

fn storage_error(error: rusqlite::Error) -> MemoryError {
    MemoryError::storage(error.to_string())
}
