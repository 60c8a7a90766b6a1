//! Board service: storage, notification and backpressure behind one API.

use std::collections::HashMap;
use std::time::Duration;

use board_core::column::{project_column, BoardColumn};
use board_core::config::{BoardConfig, LimitsConfig};
use board_core::events::ThreadEvent;
use board_core::status::ThreadStatus;
use board_core::types::{ChatId, PullRequestSnapshot, Thread, ThreadChat, ThreadId, UserId};
use board_notify::ChangeDispatcher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::lifecycle::{transition, LifecycleError, TransitionOutcome, TransitionRequest};
use crate::persistence::{PersistenceError, SqliteStore};
use crate::queue::{self, Backpressure, DequeuedAttempt, QueueError};
use crate::rate_limiter::{SandboxRateLimiter, SandboxWindowConfig};
use crate::store::{AttemptRef, AttemptStore, QueueCandidate};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("thread not found: {thread_id}")]
    ThreadNotFound { thread_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewThread {
    pub user_id: UserId,
    pub repo_full_name: String,
    pub pr_number: Option<u64>,
    pub automation_id: Option<String>,
    pub is_backlog: bool,
    pub status: ThreadStatus,
    /// Create the first chat right away instead of a legacy thread row.
    pub with_chat: bool,
}

impl NewThread {
    pub fn new(user_id: UserId, repo_full_name: impl Into<String>, status: ThreadStatus) -> Self {
        Self {
            user_id,
            repo_full_name: repo_full_name.into(),
            pr_number: None,
            automation_id: None,
            is_backlog: false,
            status,
            with_chat: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedThread {
    pub thread: Thread,
    pub chat: Option<ThreadChat>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardCard {
    pub thread: Thread,
    pub combined_status: ThreadStatus,
    pub column: BoardColumn,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub cards: Vec<BoardCard>,
}

impl Board {
    pub fn column(&self, column: BoardColumn) -> Vec<&BoardCard> {
        self.cards.iter().filter(|card| card.column == column).collect()
    }

    pub fn counts(&self) -> Vec<(BoardColumn, usize)> {
        BoardColumn::ALL
            .iter()
            .map(|column| (*column, self.column(*column).len()))
            .collect()
    }
}

pub struct BoardService {
    pub store: SqliteStore,
    pub publisher: ChangeDispatcher,
    pub limits: LimitsConfig,
    sandbox_limiter: SandboxRateLimiter,
}

impl BoardService {
    pub fn new(store: SqliteStore, publisher: ChangeDispatcher, limits: LimitsConfig) -> Self {
        let window = SandboxWindowConfig::from_limits(&limits);
        Self {
            store,
            publisher,
            limits,
            sandbox_limiter: SandboxRateLimiter::new(window),
        }
    }

    pub fn open(config: &BoardConfig, publisher: ChangeDispatcher) -> Result<Self, ServiceError> {
        let store = SqliteStore::open_with_busy_timeout(
            &config.storage.sqlite_path,
            Duration::from_millis(config.storage.busy_timeout_ms),
        )?;
        let svc = Self::new(store, publisher, config.limits.clone());
        svc.bootstrap()?;
        Ok(svc)
    }

    pub fn bootstrap(&self) -> Result<(), ServiceError> {
        self.store.migrate()?;
        Ok(())
    }

    pub fn create_thread(
        &self,
        new: NewThread,
        at: DateTime<Utc>,
    ) -> Result<CreatedThread, ServiceError> {
        let initial = if new.with_chat {
            ThreadStatus::Draft
        } else {
            new.status
        };
        let mut thread = Thread::new(
            ThreadId::new(Uuid::new_v4().to_string()),
            new.user_id,
            new.repo_full_name,
            initial,
            at,
        );
        thread.pr_number = new.pr_number;
        thread.automation_id = new.automation_id;
        thread.is_backlog = new.is_backlog;

        let chat = if new.with_chat {
            thread.version = 1;
            let chat = ThreadChat::new(ChatId::new(Uuid::new_v4().to_string()), &thread, new.status, at);
            self.store.insert_thread_with_chat(&thread, &chat)?;
            Some(chat)
        } else {
            self.store.insert_thread(&thread)?;
            None
        };

        info!(user = %thread.user_id, thread = %thread.id, "thread created");
        self.publisher.publish_logged(
            &thread.user_id,
            &ThreadEvent::created(thread.id.clone(), thread.archived, thread.automation_id.clone()),
        );
        Ok(CreatedThread { thread, chat })
    }

    /// Start a new chat on an existing thread. The first chat moves the
    /// thread off its legacy row.
    pub fn add_chat(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
        status: ThreadStatus,
        at: DateTime<Utc>,
    ) -> Result<ThreadChat, ServiceError> {
        let thread = self
            .store
            .load_thread(user_id, thread_id)?
            .ok_or_else(|| ServiceError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            })?;
        let chat = ThreadChat::new(ChatId::new(Uuid::new_v4().to_string()), &thread, status, at);
        if !self.store.insert_chat(&chat)? {
            return Err(ServiceError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            });
        }

        if let Some(statuses) = self.store.attempt_statuses_for_thread(user_id, thread_id)? {
            let combined = board_core::status::combined_status(&statuses);
            self.publisher.publish_logged(
                user_id,
                &ThreadEvent::status_changed(thread_id.clone(), Some(chat.id.clone()), combined),
            );
        }
        Ok(chat)
    }

    /// Guarded transition. Booting an attempt counts as a sandbox creation.
    pub fn transition(
        &self,
        request: &TransitionRequest,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, ServiceError> {
        let outcome = transition(&self.store, &self.publisher, request, at)?;
        if outcome.applied && request.to == ThreadStatus::Booting {
            let attempt = AttemptRef::new(request.thread_id.clone(), request.chat_id.clone());
            self.store
                .record_sandbox_creation(&request.user_id, &attempt, at)?;
        }
        Ok(outcome)
    }

    pub fn set_archived(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
        archived: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        if !self.store.set_archived(user_id, thread_id, archived, at)? {
            return Ok(false);
        }
        let automation_id = self.automation_id(user_id, thread_id)?;
        self.publisher.publish_logged(
            user_id,
            &ThreadEvent::archived(thread_id.clone(), archived, automation_id),
        );
        Ok(true)
    }

    pub fn set_backlog(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
        is_backlog: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        if !self.store.set_backlog(user_id, thread_id, is_backlog, at)? {
            return Ok(false);
        }
        let automation_id = self.automation_id(user_id, thread_id)?;
        self.publisher.publish_logged(
            user_id,
            &ThreadEvent::backlog(thread_id.clone(), is_backlog, automation_id),
        );
        Ok(true)
    }

    fn automation_id(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
    ) -> Result<Option<String>, ServiceError> {
        Ok(self
            .store
            .load_thread(user_id, thread_id)?
            .and_then(|thread| thread.automation_id))
    }

    /// New messages on a thread never change its status, only its transcript.
    pub fn record_messages(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
        chat_id: Option<ChatId>,
    ) -> Result<(), ServiceError> {
        if self.store.load_thread(user_id, thread_id)?.is_none() {
            return Err(ServiceError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            });
        }
        self.publisher
            .publish_logged(user_id, &ThreadEvent::messages(thread_id.clone(), chat_id));
        Ok(())
    }

    pub fn delete_thread(&self, user_id: &UserId, thread_id: &ThreadId) -> Result<bool, ServiceError> {
        if !self.store.delete_thread(user_id, thread_id)? {
            return Ok(false);
        }
        info!(user = %user_id, thread = %thread_id, "thread deleted");
        self.publisher
            .publish_logged(user_id, &ThreadEvent::deleted(thread_id.clone()));
        Ok(true)
    }

    /// Forget sandbox creations that can no longer affect any window.
    pub fn prune_sandbox_history(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
        let cutoff = self.sandbox_limiter.window_start(now);
        Ok(self.store.prune_sandbox_creations(cutoff)?)
    }

    pub fn backpressure(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Backpressure, ServiceError> {
        let active = self.store.count_active_attempts(user_id)?;
        let creations = self
            .store
            .sandbox_creations_since(user_id, self.sandbox_limiter.window_start(now))?;
        Ok(Backpressure {
            concurrency_limit_reached: active >= self.limits.max_concurrent_tasks,
            sandbox_rate_limit_reached: self.sandbox_limiter.is_limited(&creations, now),
        })
    }

    /// Slots left once running attempts and attempts already promoted to
    /// `queued` are accounted for.
    pub fn free_slots(&self, user_id: &UserId) -> Result<usize, ServiceError> {
        let mut taken = ThreadStatus::ALL
            .iter()
            .copied()
            .filter(|status| status.occupies_slot())
            .collect::<Vec<_>>();
        taken.push(ThreadStatus::Queued);
        let used = self.store.count_attempts(user_id, &taken)?;
        Ok(self.limits.max_concurrent_tasks.saturating_sub(used))
    }

    pub fn eligible(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueCandidate>, ServiceError> {
        let backpressure = self.backpressure(user_id, now)?;
        Ok(queue::eligible(&self.store, user_id, backpressure, now)?)
    }

    pub fn dequeue_one(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<DequeuedAttempt>, ServiceError> {
        let candidates = self.eligible(user_id, now)?;
        Ok(queue::dequeue_one(
            &self.store,
            &self.publisher,
            user_id,
            &candidates,
            now,
        )?)
    }

    /// Promote up to `slots` attempts, one `dequeue_one` per slot.
    pub fn drain_queue(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
        slots: usize,
    ) -> Result<Vec<DequeuedAttempt>, ServiceError> {
        let mut promoted = Vec::new();
        for _ in 0..slots {
            match self.dequeue_one(user_id, now)? {
                Some(attempt) => promoted.push(attempt),
                None => break,
            }
        }
        Ok(promoted)
    }

    /// Project every thread of `user_id` onto the board.
    ///
    /// `pr_lookup` supplies pull request state, which lives outside this store.
    pub fn board<F>(
        &self,
        user_id: &UserId,
        archived: bool,
        pr_lookup: F,
    ) -> Result<Board, ServiceError>
    where
        F: Fn(&Thread) -> Option<PullRequestSnapshot>,
    {
        let threads = self.store.list_threads_for_user(user_id, archived)?;
        let mut chats_by_thread: HashMap<ThreadId, Vec<ThreadChat>> = HashMap::new();
        for chat in self.store.list_chats_for_user(user_id)? {
            chats_by_thread
                .entry(chat.thread_id.clone())
                .or_default()
                .push(chat);
        }

        let cards = threads
            .into_iter()
            .map(|thread| {
                let chats = chats_by_thread
                    .get(&thread.id)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let combined_status = thread.combined_status(chats);
                let pr = pr_lookup(&thread);
                let column = project_column(combined_status, thread.is_backlog, pr.as_ref());
                BoardCard {
                    thread,
                    combined_status,
                    column,
                }
            })
            .collect();
        Ok(Board { cards })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use board_core::column::BoardColumn;
    use board_core::config::{BoardConfig, LimitsConfig};
    use board_core::events::ThreadEvent;
    use board_core::refetch::ViewFilter;
    use board_core::status::ThreadStatus;
    use board_core::types::{
        ChecksStatus, PullRequestSnapshot, PullRequestState, ThreadId, UserId,
    };
    use board_notify::{BroadcastHub, ChangeDispatcher, RefetchReason, ViewWatcher};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{BoardService, NewThread, ServiceError};
    use crate::lifecycle::TransitionRequest;
    use crate::persistence::SqliteStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn user() -> UserId {
        UserId::new("U1")
    }

    fn mk_service_with(limits: LimitsConfig) -> (BoardService, BroadcastHub) {
        let store = SqliteStore::open_in_memory().expect("db");
        let hub = BroadcastHub::new(64);
        let service = BoardService::new(
            store,
            ChangeDispatcher::new(vec![Arc::new(hub.clone())]),
            limits,
        );
        service.bootstrap().expect("bootstrap");
        (service, hub)
    }

    fn mk_service() -> (BoardService, BroadcastHub) {
        mk_service_with(LimitsConfig::default())
    }

    fn chat_thread(service: &BoardService, status: ThreadStatus, at: DateTime<Utc>) -> ThreadId {
        let mut new = NewThread::new(user(), "acme/app", status);
        new.with_chat = true;
        service.create_thread(new, at).expect("create").thread.id
    }

    #[test]
    fn create_thread_publishes_created_event() {
        let (service, hub) = mk_service();
        let mut rx = hub.subscribe(&user());
        let mut new = NewThread::new(user(), "acme/app", ThreadStatus::Draft);
        new.automation_id = Some("auto-1".to_string());
        let created = service.create_thread(new, t0()).expect("create");

        assert!(created.chat.is_none());
        assert!(created.thread.is_legacy());
        let envelope = rx.try_recv().expect("created event");
        assert_eq!(
            envelope.event,
            ThreadEvent::created(created.thread.id, false, Some("auto-1".to_string()))
        );
    }

    #[test]
    fn create_thread_with_chat_commits_thread_and_chat_together() {
        let (service, hub) = mk_service();
        let mut rx = hub.subscribe(&user());
        let mut new = NewThread::new(user(), "acme/app", ThreadStatus::Queued);
        new.with_chat = true;
        let created = service.create_thread(new, t0()).expect("create");

        let chat = created.chat.expect("first chat");
        assert_eq!(created.thread.version, 1);
        let stored = service
            .store
            .load_thread(&user(), &created.thread.id)
            .expect("load")
            .expect("exists");
        assert_eq!(stored, created.thread);
        assert_eq!(
            service
                .store
                .list_chats_for_thread(&user(), &created.thread.id)
                .expect("chats"),
            vec![chat]
        );
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn add_chat_versions_thread_and_reports_missing_threads() {
        let (service, _hub) = mk_service();
        let created = service
            .create_thread(NewThread::new(user(), "acme/app", ThreadStatus::Complete), t0())
            .expect("create");
        let chat = service
            .add_chat(&user(), &created.thread.id, ThreadStatus::Queued, t0())
            .expect("add chat");
        assert_eq!(chat.thread_id, created.thread.id);

        let thread = service
            .store
            .load_thread(&user(), &created.thread.id)
            .expect("load")
            .expect("exists");
        assert_eq!(thread.version, 1);

        let missing = service.add_chat(&user(), &ThreadId::new("nope"), ThreadStatus::Queued, t0());
        assert!(matches!(missing, Err(ServiceError::ThreadNotFound { .. })));
    }

    #[test]
    fn backpressure_tracks_active_attempts_and_sandbox_window() {
        let limits = LimitsConfig {
            max_concurrent_tasks: 1,
            sandbox_creations_per_window: 1,
            sandbox_window_secs: 60,
        };
        let (service, _hub) = mk_service_with(limits);
        let thread_id = chat_thread(&service, ThreadStatus::Queued, t0());
        let chat = service
            .store
            .list_chats_for_thread(&user(), &thread_id)
            .expect("chats")
            .remove(0);

        let idle = service.backpressure(&user(), t0()).expect("idle");
        assert!(!idle.concurrency_limit_reached);
        assert!(!idle.sandbox_rate_limit_reached);

        let boot = TransitionRequest::new(
            user(),
            thread_id,
            Some(chat.id),
            ThreadStatus::Queued,
            ThreadStatus::Booting,
        );
        assert!(service.transition(&boot, t0()).expect("boot").applied);

        let busy = service.backpressure(&user(), t0()).expect("busy");
        assert!(busy.concurrency_limit_reached);
        assert!(busy.sandbox_rate_limit_reached);
        assert!(
            !service
                .backpressure(&user(), t0() + Duration::seconds(61))
                .expect("later")
                .sandbox_rate_limit_reached
        );
    }

    #[test]
    fn sandbox_window_is_shared_by_services_on_one_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = BoardConfig::default();
        config.storage.sqlite_path = dir.path().join("board.sqlite");
        config.limits = LimitsConfig {
            max_concurrent_tasks: 5,
            sandbox_creations_per_window: 1,
            sandbox_window_secs: 60,
        };
        let cli = BoardService::open(&config, ChangeDispatcher::default()).expect("open cli");
        let daemon = BoardService::open(&config, ChangeDispatcher::default()).expect("open daemon");

        let thread_id = chat_thread(&cli, ThreadStatus::Queued, t0());
        let chat = cli
            .store
            .list_chats_for_thread(&user(), &thread_id)
            .expect("chats")
            .remove(0);
        let boot = TransitionRequest::new(
            user(),
            thread_id,
            Some(chat.id),
            ThreadStatus::Queued,
            ThreadStatus::Booting,
        );
        assert!(cli.transition(&boot, t0()).expect("boot").applied);
        drop(cli);

        let seen = daemon
            .backpressure(&user(), t0() + Duration::seconds(1))
            .expect("backpressure");
        assert!(!seen.concurrency_limit_reached);
        assert!(seen.sandbox_rate_limit_reached);
        assert!(
            !daemon
                .backpressure(&user(), t0() + Duration::seconds(61))
                .expect("later")
                .sandbox_rate_limit_reached
        );
    }

    #[test]
    fn prune_sandbox_history_keeps_the_live_window() {
        let limits = LimitsConfig {
            max_concurrent_tasks: 5,
            sandbox_creations_per_window: 1,
            sandbox_window_secs: 60,
        };
        let (service, _hub) = mk_service_with(limits);
        for offset in [0, 50] {
            let at = t0() + Duration::seconds(offset);
            let thread_id = chat_thread(&service, ThreadStatus::Queued, at);
            let chat = service
                .store
                .list_chats_for_thread(&user(), &thread_id)
                .expect("chats")
                .remove(0);
            let boot = TransitionRequest::new(
                user(),
                thread_id,
                Some(chat.id),
                ThreadStatus::Queued,
                ThreadStatus::Booting,
            );
            assert!(service.transition(&boot, at).expect("boot").applied);
        }

        let now = t0() + Duration::seconds(70);
        assert_eq!(service.prune_sandbox_history(now).expect("prune"), 1);
        assert_eq!(service.prune_sandbox_history(now).expect("prune again"), 0);
        assert!(
            service
                .backpressure(&user(), now)
                .expect("backpressure")
                .sandbox_rate_limit_reached
        );
    }

    #[test]
    fn drain_queue_stops_at_slot_count_and_at_empty_queue() {
        let (service, _hub) = mk_service();
        for offset in 0..3 {
            chat_thread(
                &service,
                ThreadStatus::QueuedTasksConcurrency,
                t0() + Duration::seconds(offset),
            );
        }

        assert_eq!(service.free_slots(&user()).expect("slots"), 3);
        let promoted = service.drain_queue(&user(), t0(), 2).expect("drain");
        assert_eq!(promoted.len(), 2);
        assert_eq!(service.free_slots(&user()).expect("slots"), 1);

        let rest = service.drain_queue(&user(), t0(), 5).expect("drain rest");
        assert_eq!(rest.len(), 1);
        assert!(service.dequeue_one(&user(), t0()).expect("empty").is_none());
    }

    #[test]
    fn board_projects_columns_with_pull_request_state() {
        let (service, _hub) = mk_service();
        let working = chat_thread(&service, ThreadStatus::Working, t0());
        let done = chat_thread(&service, ThreadStatus::Complete, t0());
        let mut review = NewThread::new(user(), "acme/app", ThreadStatus::Complete);
        review.pr_number = Some(7);
        let review = service.create_thread(review, t0()).expect("create").thread.id;
        let mut parked = NewThread::new(user(), "acme/app", ThreadStatus::Working);
        parked.is_backlog = true;
        let parked = service.create_thread(parked, t0()).expect("create").thread.id;

        let board = service
            .board(&user(), false, |thread| {
                thread.pr_number.map(|_| PullRequestSnapshot {
                    state: PullRequestState::Open,
                    checks: Some(ChecksStatus::Passing),
                })
            })
            .expect("board");

        let column_of = |id: &ThreadId| {
            board
                .cards
                .iter()
                .find(|card| &card.thread.id == id)
                .map(|card| card.column)
                .expect("card present")
        };
        assert_eq!(column_of(&working), BoardColumn::InProgress);
        assert_eq!(column_of(&done), BoardColumn::Done);
        assert_eq!(column_of(&review), BoardColumn::InReview);
        assert_eq!(column_of(&parked), BoardColumn::Backlog);
        assert_eq!(board.column(BoardColumn::Cancelled).len(), 0);
    }

    #[test]
    fn archive_delete_and_messages_drive_view_refetch() {
        let (service, hub) = mk_service();
        let thread_id = chat_thread(&service, ThreadStatus::Working, t0());

        let mut watcher = ViewWatcher::subscribe(&hub, user(), ViewFilter::active());
        watcher.replace_known([thread_id.clone()]);

        service
            .record_messages(&user(), &thread_id, None)
            .expect("messages");
        assert_eq!(watcher.drain().expect("drain"), None);

        assert!(service
            .set_archived(&user(), &thread_id, true, t0())
            .expect("archive"));
        assert!(matches!(
            watcher.drain().expect("drain"),
            Some(RefetchReason::Event(_))
        ));

        assert!(service.delete_thread(&user(), &thread_id).expect("delete"));
        assert!(!service.delete_thread(&user(), &thread_id).expect("again"));
        assert!(matches!(
            service.record_messages(&user(), &thread_id, None),
            Err(ServiceError::ThreadNotFound { .. })
        ));
    }
}
