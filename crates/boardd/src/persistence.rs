use std::path::Path;
use std::time::Duration;

use board_core::status::ThreadStatus;
use board_core::types::{ChatId, LegacyExecution, Thread, ThreadChat, ThreadId, UserId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::store::{AttemptRef, AttemptStore, QueueCandidate, ReattemptUpdate, StatusUpdate};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
}

/// SQLite-backed thread and chat storage.
///
/// Every worker owns its own store. Status changes are single conditional
/// `UPDATE` statements, so the database serializes competing writers.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

const THREAD_COLUMNS: &str = "thread_id, user_id, repo_full_name, pr_number, automation_id, \
     archived, is_backlog, version, status, error_message, scheduled_at, reattempt_at, \
     created_at, updated_at";

const CHAT_COLUMNS: &str = "chat_id, user_id, thread_id, status, error_message, scheduled_at, \
     reattempt_at, created_at, updated_at";

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_busy_timeout(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS threads (
    thread_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    repo_full_name TEXT NOT NULL,
    pr_number INTEGER,
    automation_id TEXT,
    archived INTEGER NOT NULL DEFAULT 0,
    is_backlog INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    error_message TEXT,
    scheduled_at TEXT,
    reattempt_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_threads_user_status ON threads(user_id, status, created_at);
CREATE INDEX IF NOT EXISTS idx_threads_user_updated ON threads(user_id, archived, updated_at);

CREATE TABLE IF NOT EXISTS thread_chats (
    chat_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    thread_id TEXT NOT NULL REFERENCES threads(thread_id),
    status TEXT NOT NULL,
    error_message TEXT,
    scheduled_at TEXT,
    reattempt_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chats_user_status ON thread_chats(user_id, status, created_at);
CREATE INDEX IF NOT EXISTS idx_chats_thread ON thread_chats(thread_id, created_at);

CREATE TABLE IF NOT EXISTS sandbox_creations (
    creation_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    chat_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sandbox_creations_user ON sandbox_creations(user_id, created_at);
"#,
        )?;
        Ok(())
    }

    pub fn insert_thread(&self, thread: &Thread) -> Result<(), PersistenceError> {
        insert_thread_row(&self.conn, thread)
    }

    /// Insert a thread and its first chat in one transaction, so the thread
    /// is never visible as a legacy row without its chat.
    pub fn insert_thread_with_chat(
        &self,
        thread: &Thread,
        chat: &ThreadChat,
    ) -> Result<(), PersistenceError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut chat_thread = thread.clone();
        chat_thread.version = chat_thread.version.max(1);
        insert_thread_row(&tx, &chat_thread)?;
        insert_chat_row(&tx, chat)?;
        tx.commit()?;
        Ok(())
    }

    /// Insert a chat and move its thread off the legacy path. Returns `false`
    /// when the thread does not exist for the chat's owner.
    pub fn insert_chat(&self, chat: &ThreadChat) -> Result<bool, PersistenceError> {
        let tx = self.conn.unchecked_transaction()?;
        let bumped = tx.execute(
            "UPDATE threads SET version = MAX(version, 1), updated_at = ?3 \
             WHERE thread_id = ?1 AND user_id = ?2",
            params![chat.thread_id.as_ref(), chat.user_id.as_ref(), ts(chat.updated_at)],
        )?;
        if bumped == 0 {
            return Ok(false);
        }
        insert_chat_row(&tx, chat)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn load_thread(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
    ) -> Result<Option<Thread>, PersistenceError> {
        let thread = self
            .conn
            .query_row(
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE thread_id = ?1 AND user_id = ?2"),
                params![thread_id.as_ref(), user_id.as_ref()],
                thread_from_row,
            )
            .optional()?;
        Ok(thread)
    }

    pub fn load_chat(
        &self,
        user_id: &UserId,
        chat_id: &ChatId,
    ) -> Result<Option<ThreadChat>, PersistenceError> {
        let chat = self
            .conn
            .query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM thread_chats WHERE chat_id = ?1 AND user_id = ?2"),
                params![chat_id.as_ref(), user_id.as_ref()],
                chat_from_row,
            )
            .optional()?;
        Ok(chat)
    }

    /// Most recently updated first.
    pub fn list_threads_for_user(
        &self,
        user_id: &UserId,
        archived: bool,
    ) -> Result<Vec<Thread>, PersistenceError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads WHERE user_id = ?1 AND archived = ?2 \
             ORDER BY updated_at DESC, thread_id ASC"
        ))?;
        let rows = stmt.query_map(params![user_id.as_ref(), archived], thread_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_chats_for_thread(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
    ) -> Result<Vec<ThreadChat>, PersistenceError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHAT_COLUMNS} FROM thread_chats WHERE thread_id = ?1 AND user_id = ?2 \
             ORDER BY created_at ASC, chat_id ASC"
        ))?;
        let rows = stmt.query_map(params![thread_id.as_ref(), user_id.as_ref()], chat_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_chats_for_user(&self, user_id: &UserId) -> Result<Vec<ThreadChat>, PersistenceError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHAT_COLUMNS} FROM thread_chats WHERE user_id = ?1 \
             ORDER BY created_at ASC, chat_id ASC"
        ))?;
        let rows = stmt.query_map(params![user_id.as_ref()], chat_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn set_archived(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
        archived: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let changed = self.conn.execute(
            "UPDATE threads SET archived = ?1, updated_at = ?2 WHERE thread_id = ?3 AND user_id = ?4",
            params![archived, ts(at), thread_id.as_ref(), user_id.as_ref()],
        )?;
        Ok(changed > 0)
    }

    pub fn set_backlog(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
        is_backlog: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let changed = self.conn.execute(
            "UPDATE threads SET is_backlog = ?1, updated_at = ?2 WHERE thread_id = ?3 AND user_id = ?4",
            params![is_backlog, ts(at), thread_id.as_ref(), user_id.as_ref()],
        )?;
        Ok(changed > 0)
    }

    /// Delete a thread together with its chats.
    pub fn delete_thread(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
    ) -> Result<bool, PersistenceError> {
        let tx = self.conn.unchecked_transaction()?;
        let deleted = tx.execute(
            "DELETE FROM threads WHERE thread_id = ?1 AND user_id = ?2",
            params![thread_id.as_ref(), user_id.as_ref()],
        )?;
        if deleted == 0 {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM thread_chats WHERE thread_id = ?1",
            params![thread_id.as_ref()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Attempts of `user_id` currently holding a concurrency slot.
    pub fn count_active_attempts(&self, user_id: &UserId) -> Result<usize, PersistenceError> {
        let active = ThreadStatus::ALL
            .iter()
            .copied()
            .filter(|status| status.occupies_slot())
            .collect::<Vec<_>>();
        self.count_attempts(user_id, &active)
    }

    /// Attempts of `user_id` in any of `statuses`, legacy rows included.
    pub fn count_attempts(
        &self,
        user_id: &UserId,
        statuses: &[ThreadStatus],
    ) -> Result<usize, PersistenceError> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let wanted = status_list(statuses.iter().copied());
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT \
                   (SELECT COUNT(*) FROM threads \
                    WHERE user_id = ?1 AND version = 0 AND status IN ({wanted})) \
                 + (SELECT COUNT(*) FROM thread_chats c JOIN threads t ON t.thread_id = c.thread_id \
                    WHERE c.user_id = ?1 AND t.version > 0 AND c.status IN ({wanted}))"
            ),
            params![user_id.as_ref()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn record_sandbox_creation(
        &self,
        user_id: &UserId,
        attempt: &AttemptRef,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.conn.execute(
            "INSERT INTO sandbox_creations (user_id, thread_id, chat_id, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id.as_ref(),
                attempt.thread_id().as_ref(),
                attempt.chat_id().map(ChatId::to_string),
                ts(at)
            ],
        )?;
        Ok(())
    }

    /// Sandbox creations of `user_id` strictly after `since`, oldest first.
    pub fn sandbox_creations_since(
        &self,
        user_id: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT created_at FROM sandbox_creations \
             WHERE user_id = ?1 AND created_at > ?2 \
             ORDER BY created_at ASC, creation_id ASC",
        )?;
        let rows = stmt.query_map(params![user_id.as_ref(), ts(since)], |row| parse_ts(row, 0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Drop sandbox creations at or before `cutoff`. Returns the number removed.
    pub fn prune_sandbox_creations(&self, cutoff: DateTime<Utc>) -> Result<usize, PersistenceError> {
        let removed = self.conn.execute(
            "DELETE FROM sandbox_creations WHERE created_at <= ?1",
            params![ts(cutoff)],
        )?;
        Ok(removed)
    }

    /// Users owning at least one attempt the queue could promote.
    pub fn list_users_with_queued_work(&self) -> Result<Vec<UserId>, PersistenceError> {
        let waiting = status_list([
            ThreadStatus::QueuedTasksConcurrency,
            ThreadStatus::QueuedSandboxCreationRateLimit,
            ThreadStatus::QueuedAgentRateLimit,
        ]);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT user_id FROM threads \
             WHERE version = 0 AND archived = 0 AND is_backlog = 0 AND status IN ({waiting}) \
             UNION \
             SELECT c.user_id FROM thread_chats c JOIN threads t ON t.thread_id = c.thread_id \
             WHERE t.version > 0 AND t.archived = 0 AND t.is_backlog = 0 AND c.status IN ({waiting}) \
             ORDER BY 1 ASC"
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(UserId::new(row?));
        }
        Ok(out)
    }
}

impl AttemptStore for SqliteStore {
    fn compare_and_set_status(&self, update: &StatusUpdate) -> Result<bool, PersistenceError> {
        let (write_reattempt, reattempt_at) = match update.reattempt {
            ReattemptUpdate::Keep => (false, None),
            ReattemptUpdate::Clear => (true, None),
            ReattemptUpdate::Set(at) => (true, Some(ts(at))),
        };

        let changed = match &update.attempt {
            AttemptRef::Chat { thread_id, chat_id } => self.conn.execute(
                "UPDATE thread_chats SET status = ?1, \
                   reattempt_at = CASE WHEN ?2 THEN ?3 ELSE reattempt_at END, \
                   updated_at = ?4 \
                 WHERE chat_id = ?5 AND thread_id = ?6 AND user_id = ?7 AND status = ?8",
                params![
                    update.to.as_str(),
                    write_reattempt,
                    reattempt_at,
                    ts(update.at),
                    chat_id.as_ref(),
                    thread_id.as_ref(),
                    update.user_id.as_ref(),
                    update.from.as_str(),
                ],
            )?,
            AttemptRef::Legacy { thread_id } => self.conn.execute(
                "UPDATE threads SET status = ?1, \
                   reattempt_at = CASE WHEN ?2 THEN ?3 ELSE reattempt_at END, \
                   updated_at = ?4 \
                 WHERE thread_id = ?5 AND user_id = ?6 AND version = 0 AND status = ?7",
                params![
                    update.to.as_str(),
                    write_reattempt,
                    reattempt_at,
                    ts(update.at),
                    thread_id.as_ref(),
                    update.user_id.as_ref(),
                    update.from.as_str(),
                ],
            )?,
        };
        Ok(changed > 0)
    }

    fn scan_queued(
        &self,
        user_id: &UserId,
        statuses: &[ThreadStatus],
    ) -> Result<Vec<QueueCandidate>, PersistenceError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let wanted = status_list(statuses.iter().copied());
        let mut stmt = self.conn.prepare(&format!(
            "SELECT thread_id, NULL AS chat_id, status, reattempt_at, created_at FROM threads \
             WHERE user_id = ?1 AND version = 0 AND archived = 0 AND is_backlog = 0 \
               AND status IN ({wanted}) \
             UNION ALL \
             SELECT c.thread_id, c.chat_id, c.status, c.reattempt_at, c.created_at \
             FROM thread_chats c JOIN threads t ON t.thread_id = c.thread_id \
             WHERE c.user_id = ?1 AND t.version > 0 AND t.archived = 0 AND t.is_backlog = 0 \
               AND c.status IN ({wanted}) \
             ORDER BY 5 ASC, 1 ASC, 2 ASC"
        ))?;
        let rows = stmt.query_map(params![user_id.as_ref()], |row| {
            let thread_id = ThreadId::new(row.get::<_, String>(0)?);
            let chat_id = row.get::<_, Option<String>>(1)?.map(ChatId::new);
            Ok(QueueCandidate {
                attempt: AttemptRef::new(thread_id, chat_id),
                status: parse_status(row, 2)?,
                reattempt_at: parse_optional_ts(row, 3)?,
                created_at: parse_ts(row, 4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn attempt_statuses_for_thread(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
    ) -> Result<Option<Vec<ThreadStatus>>, PersistenceError> {
        let Some(thread) = self.load_thread(user_id, thread_id)? else {
            return Ok(None);
        };
        if thread.is_legacy() {
            return Ok(Some(vec![thread.legacy.status]));
        }
        let statuses = self
            .list_chats_for_thread(user_id, thread_id)?
            .into_iter()
            .map(|chat| chat.status)
            .collect();
        Ok(Some(statuses))
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Status tags are a closed set of static identifiers, safe to inline.
fn status_list(statuses: impl IntoIterator<Item = ThreadStatus>) -> String {
    statuses
        .into_iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_thread_row(conn: &Connection, thread: &Thread) -> Result<(), PersistenceError> {
    let pr_number = thread.pr_number.map(|n| n as i64);
    conn.execute(
        &format!(
            "INSERT INTO threads ({THREAD_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            thread.id.as_ref(),
            thread.user_id.as_ref(),
            thread.repo_full_name,
            pr_number,
            thread.automation_id,
            thread.archived,
            thread.is_backlog,
            thread.version,
            thread.legacy.status.as_str(),
            thread.legacy.error_message,
            thread.legacy.scheduled_at.map(ts),
            thread.legacy.reattempt_at.map(ts),
            ts(thread.created_at),
            ts(thread.updated_at),
        ],
    )?;
    Ok(())
}

fn insert_chat_row(conn: &Connection, chat: &ThreadChat) -> Result<(), PersistenceError> {
    conn.execute(
        &format!(
            "INSERT INTO thread_chats ({CHAT_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            chat.id.as_ref(),
            chat.user_id.as_ref(),
            chat.thread_id.as_ref(),
            chat.status.as_str(),
            chat.error_message,
            chat.scheduled_at.map(ts),
            chat.reattempt_at.map(ts),
            ts(chat.created_at),
            ts(chat.updated_at),
        ],
    )?;
    Ok(())
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<ThreadStatus> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|err| conversion_error(idx, err))
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| conversion_error(idx, err))
}

fn parse_optional_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| {
        DateTime::parse_from_rfc3339(&value)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|err| conversion_error(idx, err))
    })
    .transpose()
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<Thread> {
    let pr_number: Option<i64> = row.get(3)?;
    Ok(Thread {
        id: ThreadId::new(row.get::<_, String>(0)?),
        user_id: UserId::new(row.get::<_, String>(1)?),
        repo_full_name: row.get(2)?,
        pr_number: pr_number.and_then(|n| u64::try_from(n).ok()),
        automation_id: row.get(4)?,
        archived: row.get(5)?,
        is_backlog: row.get(6)?,
        version: row.get(7)?,
        legacy: LegacyExecution {
            status: parse_status(row, 8)?,
            error_message: row.get(9)?,
            scheduled_at: parse_optional_ts(row, 10)?,
            reattempt_at: parse_optional_ts(row, 11)?,
        },
        created_at: parse_ts(row, 12)?,
        updated_at: parse_ts(row, 13)?,
    })
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadChat> {
    Ok(ThreadChat {
        id: ChatId::new(row.get::<_, String>(0)?),
        user_id: UserId::new(row.get::<_, String>(1)?),
        thread_id: ThreadId::new(row.get::<_, String>(2)?),
        status: parse_status(row, 3)?,
        error_message: row.get(4)?,
        scheduled_at: parse_optional_ts(row, 5)?,
        reattempt_at: parse_optional_ts(row, 6)?,
        created_at: parse_ts(row, 7)?,
        updated_at: parse_ts(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use board_core::status::ThreadStatus;
    use board_core::types::{ChatId, Thread, ThreadChat, ThreadId, UserId};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::SqliteStore;
    use crate::store::{AttemptRef, AttemptStore, ReattemptUpdate, StatusUpdate};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn mk_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("in-memory db");
        store.migrate().expect("migrate");
        store
    }

    fn user() -> UserId {
        UserId::new("U1")
    }

    fn legacy_thread(id: &str, status: ThreadStatus, at: DateTime<Utc>) -> Thread {
        Thread::new(ThreadId::new(id), user(), "acme/app", status, at)
    }

    fn chat_thread(
        store: &SqliteStore,
        id: &str,
        chats: &[(&str, ThreadStatus, DateTime<Utc>)],
    ) -> Thread {
        let thread = legacy_thread(id, ThreadStatus::Draft, t0());
        store.insert_thread(&thread).expect("insert thread");
        for (chat_id, status, at) in chats {
            let chat = ThreadChat::new(ChatId::new(*chat_id), &thread, *status, *at);
            assert!(store.insert_chat(&chat).expect("insert chat"));
        }
        thread
    }

    fn cas(attempt: AttemptRef, from: ThreadStatus, to: ThreadStatus) -> StatusUpdate {
        StatusUpdate {
            user_id: user(),
            attempt,
            from,
            to,
            reattempt: ReattemptUpdate::for_target(to, None),
            at: t0() + Duration::minutes(5),
        }
    }

    #[test]
    fn insert_and_load_thread_roundtrip() {
        let store = mk_store();
        let mut thread = legacy_thread("T1", ThreadStatus::Queued, t0());
        thread.pr_number = Some(42);
        thread.automation_id = Some("auto-1".to_string());
        store.insert_thread(&thread).expect("insert");

        let loaded = store
            .load_thread(&user(), &ThreadId::new("T1"))
            .expect("load")
            .expect("thread exists");
        assert_eq!(loaded, thread);

        let foreign = store
            .load_thread(&UserId::new("U2"), &ThreadId::new("T1"))
            .expect("load foreign");
        assert!(foreign.is_none());
    }

    #[test]
    fn insert_chat_bumps_version_and_requires_owner() {
        let store = mk_store();
        let thread = chat_thread(&store, "T1", &[("C1", ThreadStatus::Queued, t0())]);

        let loaded = store
            .load_thread(&user(), &thread.id)
            .expect("load")
            .expect("thread exists");
        assert_eq!(loaded.version, 1);

        let mut foreign = ThreadChat::new(ChatId::new("C2"), &thread, ThreadStatus::Queued, t0());
        foreign.user_id = UserId::new("U2");
        assert!(!store.insert_chat(&foreign).expect("insert foreign chat"));
        assert_eq!(
            store
                .list_chats_for_thread(&user(), &thread.id)
                .expect("chats")
                .len(),
            1
        );
    }

    #[test]
    fn insert_thread_with_chat_commits_both_rows_at_version_one() {
        let store = mk_store();
        let thread = legacy_thread("T1", ThreadStatus::Draft, t0());
        let chat = ThreadChat::new(ChatId::new("C1"), &thread, ThreadStatus::Queued, t0());
        store
            .insert_thread_with_chat(&thread, &chat)
            .expect("insert thread with chat");

        let loaded = store
            .load_thread(&user(), &thread.id)
            .expect("load")
            .expect("thread exists");
        assert_eq!(loaded.version, 1);
        assert_eq!(
            store.list_chats_for_thread(&user(), &thread.id).expect("chats"),
            vec![chat]
        );
    }

    #[test]
    fn insert_thread_with_chat_rolls_back_when_the_chat_fails() {
        let store = mk_store();
        chat_thread(&store, "T0", &[("C1", ThreadStatus::Queued, t0())]);

        let thread = legacy_thread("T1", ThreadStatus::Draft, t0());
        let duplicate = ThreadChat::new(ChatId::new("C1"), &thread, ThreadStatus::Queued, t0());
        assert!(store.insert_thread_with_chat(&thread, &duplicate).is_err());
        assert!(store
            .load_thread(&user(), &thread.id)
            .expect("load")
            .is_none());
    }

    #[test]
    fn sandbox_creations_are_windowed_per_user_and_pruned() {
        let store = mk_store();
        let attempt = AttemptRef::new(ThreadId::new("T1"), Some(ChatId::new("C1")));
        for offset in [0, 30, 90] {
            store
                .record_sandbox_creation(&user(), &attempt, t0() + Duration::seconds(offset))
                .expect("record");
        }
        store
            .record_sandbox_creation(&UserId::new("U2"), &attempt, t0() + Duration::seconds(90))
            .expect("record other user");

        assert_eq!(
            store
                .sandbox_creations_since(&user(), t0() + Duration::seconds(30))
                .expect("since"),
            vec![t0() + Duration::seconds(90)]
        );
        assert_eq!(
            store
                .sandbox_creations_since(&user(), t0() - Duration::seconds(1))
                .expect("all")
                .len(),
            3
        );

        assert_eq!(
            store
                .prune_sandbox_creations(t0() + Duration::seconds(30))
                .expect("prune"),
            2
        );
        assert_eq!(
            store
                .sandbox_creations_since(&user(), t0() - Duration::seconds(1))
                .expect("after prune"),
            vec![t0() + Duration::seconds(90)]
        );
    }

    #[test]
    fn compare_and_set_applies_once() {
        let store = mk_store();
        let thread = chat_thread(&store, "T1", &[("C1", ThreadStatus::Queued, t0())]);
        let attempt = AttemptRef::new(thread.id.clone(), Some(ChatId::new("C1")));

        let update = cas(attempt.clone(), ThreadStatus::Queued, ThreadStatus::Booting);
        assert!(store.compare_and_set_status(&update).expect("first"));
        assert!(!store.compare_and_set_status(&update).expect("second"));

        let chat = store
            .load_chat(&user(), &ChatId::new("C1"))
            .expect("load chat")
            .expect("chat exists");
        assert_eq!(chat.status, ThreadStatus::Booting);
        assert_eq!(chat.updated_at, t0() + Duration::minutes(5));
    }

    #[test]
    fn compare_and_set_rejects_wrong_owner() {
        let store = mk_store();
        let thread = chat_thread(&store, "T1", &[("C1", ThreadStatus::Queued, t0())]);
        let mut update = cas(
            AttemptRef::new(thread.id, Some(ChatId::new("C1"))),
            ThreadStatus::Queued,
            ThreadStatus::Booting,
        );
        update.user_id = UserId::new("U2");
        assert!(!store.compare_and_set_status(&update).expect("cas"));
    }

    #[test]
    fn reattempt_is_set_kept_and_cleared() {
        let store = mk_store();
        chat_thread(&store, "T1", &[("C1", ThreadStatus::Working, t0())]);
        let attempt = AttemptRef::new(ThreadId::new("T1"), Some(ChatId::new("C1")));
        let retry_at = t0() + Duration::minutes(30);
        let load = || {
            store
                .load_chat(&user(), &ChatId::new("C1"))
                .expect("load")
                .expect("exists")
        };

        let mut update = cas(
            attempt.clone(),
            ThreadStatus::Working,
            ThreadStatus::QueuedAgentRateLimit,
        );
        update.reattempt = ReattemptUpdate::Set(retry_at);
        assert!(store.compare_and_set_status(&update).expect("set"));
        assert_eq!(load().reattempt_at, Some(retry_at));

        let keep = cas(
            attempt.clone(),
            ThreadStatus::QueuedAgentRateLimit,
            ThreadStatus::QueuedSandboxCreationRateLimit,
        );
        assert_eq!(keep.reattempt, ReattemptUpdate::Keep);
        assert!(store.compare_and_set_status(&keep).expect("keep"));
        assert_eq!(load().reattempt_at, Some(retry_at));

        let clear = cas(
            attempt,
            ThreadStatus::QueuedSandboxCreationRateLimit,
            ThreadStatus::Queued,
        );
        assert!(store.compare_and_set_status(&clear).expect("clear"));
        assert_eq!(load().reattempt_at, None);
    }

    #[test]
    fn legacy_update_is_guarded_by_version() {
        let store = mk_store();
        store
            .insert_thread(&legacy_thread("T1", ThreadStatus::Queued, t0()))
            .expect("insert");
        let legacy = AttemptRef::new(ThreadId::new("T1"), None);
        assert!(store
            .compare_and_set_status(&cas(legacy.clone(), ThreadStatus::Queued, ThreadStatus::Booting))
            .expect("legacy cas"));

        let thread = store
            .load_thread(&user(), &ThreadId::new("T1"))
            .expect("load")
            .expect("exists");
        let chat = ThreadChat::new(ChatId::new("C1"), &thread, ThreadStatus::Queued, t0());
        assert!(store.insert_chat(&chat).expect("insert chat"));

        assert!(!store
            .compare_and_set_status(&cas(legacy, ThreadStatus::Booting, ThreadStatus::Working))
            .expect("versioned thread"));
    }

    #[test]
    fn scan_queued_orders_across_legacy_and_chat_rows() {
        let store = mk_store();
        store
            .insert_thread(&legacy_thread(
                "T-legacy",
                ThreadStatus::QueuedTasksConcurrency,
                t0() + Duration::seconds(2),
            ))
            .expect("insert legacy");
        chat_thread(
            &store,
            "T-chat",
            &[
                ("C2", ThreadStatus::QueuedTasksConcurrency, t0() + Duration::seconds(3)),
                ("C1", ThreadStatus::QueuedTasksConcurrency, t0() + Duration::seconds(1)),
                ("C3", ThreadStatus::Working, t0()),
            ],
        );

        let found = store
            .scan_queued(&user(), &[ThreadStatus::QueuedTasksConcurrency])
            .expect("scan");
        let order = found
            .iter()
            .map(|candidate| {
                candidate
                    .chat_id()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| candidate.thread_id().to_string())
            })
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["C1", "T-legacy", "C2"]);
    }

    #[test]
    fn scan_queued_skips_archived_backlog_and_other_users() {
        let store = mk_store();
        for (id, archived, backlog) in [("T1", true, false), ("T2", false, true), ("T3", false, false)]
        {
            let mut thread = legacy_thread(id, ThreadStatus::QueuedTasksConcurrency, t0());
            thread.archived = archived;
            thread.is_backlog = backlog;
            store.insert_thread(&thread).expect("insert");
        }
        let mut other = legacy_thread("T4", ThreadStatus::QueuedTasksConcurrency, t0());
        other.user_id = UserId::new("U2");
        store.insert_thread(&other).expect("insert other");

        let found = store
            .scan_queued(&user(), &[ThreadStatus::QueuedTasksConcurrency])
            .expect("scan");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].thread_id(), &ThreadId::new("T3"));
        assert!(store.scan_queued(&user(), &[]).expect("empty scan").is_empty());
    }

    #[test]
    fn counts_active_attempts_and_users_with_queued_work() {
        let store = mk_store();
        store
            .insert_thread(&legacy_thread("T1", ThreadStatus::Working, t0()))
            .expect("insert");
        chat_thread(
            &store,
            "T2",
            &[
                ("C1", ThreadStatus::Booting, t0()),
                ("C2", ThreadStatus::QueuedAgentRateLimit, t0()),
                ("C3", ThreadStatus::Complete, t0()),
            ],
        );
        let mut other = legacy_thread("T3", ThreadStatus::QueuedTasksConcurrency, t0());
        other.user_id = UserId::new("U0");
        store.insert_thread(&other).expect("insert other");

        assert_eq!(store.count_active_attempts(&user()).expect("count"), 2);
        assert_eq!(
            store.list_users_with_queued_work().expect("users"),
            vec![UserId::new("U0"), user()]
        );
    }

    #[test]
    fn attempt_statuses_follow_thread_version() {
        let store = mk_store();
        store
            .insert_thread(&legacy_thread("T1", ThreadStatus::Scheduled, t0()))
            .expect("insert");
        chat_thread(
            &store,
            "T2",
            &[
                ("C1", ThreadStatus::Complete, t0()),
                ("C2", ThreadStatus::Working, t0() + Duration::seconds(1)),
            ],
        );

        assert_eq!(
            store
                .attempt_statuses_for_thread(&user(), &ThreadId::new("T1"))
                .expect("legacy"),
            Some(vec![ThreadStatus::Scheduled])
        );
        assert_eq!(
            store
                .attempt_statuses_for_thread(&user(), &ThreadId::new("T2"))
                .expect("chats"),
            Some(vec![ThreadStatus::Complete, ThreadStatus::Working])
        );
        assert_eq!(
            store
                .attempt_statuses_for_thread(&user(), &ThreadId::new("missing"))
                .expect("missing"),
            None
        );
    }

    #[test]
    fn archive_backlog_and_delete_cascade() {
        let store = mk_store();
        let thread = chat_thread(&store, "T1", &[("C1", ThreadStatus::Queued, t0())]);

        assert!(store
            .set_archived(&user(), &thread.id, true, t0())
            .expect("archive"));
        assert!(store
            .list_threads_for_user(&user(), false)
            .expect("active")
            .is_empty());
        assert_eq!(
            store
                .list_threads_for_user(&user(), true)
                .expect("archived")
                .len(),
            1
        );
        assert!(store
            .set_backlog(&user(), &thread.id, true, t0())
            .expect("backlog"));
        assert!(!store
            .set_backlog(&UserId::new("U2"), &thread.id, true, t0())
            .expect("foreign backlog"));

        assert!(!store
            .delete_thread(&UserId::new("U2"), &thread.id)
            .expect("foreign delete"));
        assert!(store.delete_thread(&user(), &thread.id).expect("delete"));
        assert!(store
            .list_chats_for_user(&user())
            .expect("chats")
            .is_empty());
    }

    #[test]
    fn concurrent_connections_apply_a_transition_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("board.sqlite");
        let setup = SqliteStore::open(&path).expect("open");
        setup.migrate().expect("migrate");
        chat_thread(&setup, "T1", &[("C1", ThreadStatus::Queued, t0())]);

        let barrier = Arc::new(Barrier::new(4));
        let handles = (0..4)
            .map(|_| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let store = SqliteStore::open(&path).expect("open worker");
                    let update = cas(
                        AttemptRef::new(ThreadId::new("T1"), Some(ChatId::new("C1"))),
                        ThreadStatus::Queued,
                        ThreadStatus::Booting,
                    );
                    barrier.wait();
                    store.compare_and_set_status(&update).expect("cas")
                })
            })
            .collect::<Vec<_>>();

        let applied = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|applied| *applied)
            .count();
        assert_eq!(applied, 1);
    }
}
