//! In-memory upload session table.
//!
//! The table lock only covers insert, lookup and removal. Every session sits
//! behind its own async mutex, and any read-check-write-update sequence on a
//! session runs while holding that mutex, so at most one append per session is
//! in flight. Sessions in different entries never contend.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time;
use uuid::Uuid;

/// Server-side state of one in-progress upload.
#[derive(Clone, Debug)]
pub struct UploadSession {
    pub file_path: PathBuf,
    /// Zero while the length is deferred.
    pub declared_size: u64,
    pub offset: u64,
    pub expires_at: DateTime<Utc>,
    closed: bool,
}

impl UploadSession {
    pub fn new(file_path: PathBuf, declared_size: u64, expires_at: DateTime<Utc>) -> Self {
        Self {
            file_path,
            declared_size,
            offset: 0,
            expires_at,
            closed: false,
        }
    }

    pub fn is_length_deferred(&self) -> bool {
        self.declared_size == 0
    }

    pub fn is_complete(&self) -> bool {
        self.declared_size > 0 && self.offset == self.declared_size
    }

    /// Marks the record as completed or terminated. Holders that were waiting
    /// on the lock see it as unknown afterwards.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

pub type SessionHandle = Arc<Mutex<UploadSession>>;
pub type SessionGuard = OwnedMutexGuard<UploadSession>;

#[derive(Debug, PartialEq, Eq)]
pub enum LockError {
    NotFound,
    /// Another request held the session past the wait timeout.
    Busy,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: Uuid, session: UploadSession) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(id, Arc::new(Mutex::new(session)));
    }

    pub async fn get(&self, id: &Uuid) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// Removes the entry and hands back its handle so the caller can retire it.
    pub async fn remove(&self, id: &Uuid) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Locks one session for exclusive use, waiting at most `timeout`.
    pub async fn acquire(&self, id: &Uuid, timeout: Duration) -> Result<SessionGuard, LockError> {
        let handle = self.get(id).await.ok_or(LockError::NotFound)?;
        let guard = time::timeout(timeout, handle.lock_owned())
            .await
            .map_err(|_| LockError::Busy)?;
        if guard.is_closed() {
            return Err(LockError::NotFound);
        }
        Ok(guard)
    }

    /// Runs `f` on the canonical session while holding its lock.
    pub async fn mutate<F, R>(&self, id: &Uuid, timeout: Duration, f: F) -> Result<R, LockError>
    where
        F: FnOnce(&mut UploadSession) -> R,
    {
        let mut guard = self.acquire(id, timeout).await?;
        Ok(f(&mut *guard))
    }

    pub async fn snapshot(&self, id: &Uuid, timeout: Duration) -> Result<UploadSession, LockError> {
        self.mutate(id, timeout, |session| session.clone()).await
    }

    /// Removes every idle session whose expiry is at or before `now`.
    /// Sessions locked by an in-flight request are skipped until the next sweep.
    pub async fn take_expired(&self, now: DateTime<Utc>) -> Vec<(Uuid, SessionHandle)> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, handle)| {
                handle
                    .try_lock()
                    .map(|session| session.expires_at <= now)
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id).map(|handle| (id, handle)))
            .collect()
    }

    pub async fn drain(&self) -> Vec<(Uuid, SessionHandle)> {
        let mut sessions = self.sessions.write().await;
        sessions.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const WAIT: Duration = Duration::from_secs(5);

    fn session(size: u64) -> UploadSession {
        UploadSession::new(
            PathBuf::from("/tmp/file.bin"),
            size,
            Utc::now() + ChronoDuration::hours(1),
        )
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.insert(id, session(10)).await;
        assert!(registry.get(&id).await.is_some());
        assert_eq!(registry.len().await, 1);
        assert!(registry.remove(&id).await.is_some());
        assert!(registry.get(&id).await.is_none());
        assert_eq!(
            registry.snapshot(&id, WAIT).await.err(),
            Some(LockError::NotFound)
        );
    }

    #[tokio::test]
    async fn closed_session_reads_as_unknown() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.insert(id, session(10)).await;
        registry
            .mutate(&id, WAIT, |session| session.close())
            .await
            .expect("mutate");
        assert_eq!(registry.acquire(&id, WAIT).await.err(), Some(LockError::NotFound));
    }

    #[tokio::test]
    async fn busy_session_times_out() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.insert(id, session(10)).await;
        let _held = registry.acquire(&id, WAIT).await.expect("first lock");
        let second = registry.acquire(&id, Duration::from_millis(50)).await;
        assert_eq!(second.err(), Some(LockError::Busy));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mutations_are_serialized() {
        let registry = Arc::new(SessionRegistry::new());
        let id = Uuid::new_v4();
        registry.insert(id, session(1000)).await;

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .mutate(&id, WAIT, |session| {
                        let current = session.offset;
                        std::thread::yield_now();
                        session.offset = current + 1;
                    })
                    .await
                    .expect("mutate");
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }

        let snapshot = registry.snapshot(&id, WAIT).await.expect("snapshot");
        assert_eq!(snapshot.offset, 50);
    }

    #[tokio::test]
    async fn take_expired_skips_live_and_busy_sessions() {
        let registry = SessionRegistry::new();
        let now = Utc::now();
        let live = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let busy = Uuid::new_v4();
        registry.insert(live, session(10)).await;
        let mut expired = session(10);
        expired.expires_at = now - ChronoDuration::seconds(1);
        registry.insert(stale, expired.clone()).await;
        registry.insert(busy, expired).await;

        let _held = registry.acquire(&busy, WAIT).await.expect("lock busy");
        let taken = registry.take_expired(now).await;

        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].0, stale);
        assert!(registry.get(&live).await.is_some());
        assert!(registry.get(&busy).await.is_some());
    }
}
