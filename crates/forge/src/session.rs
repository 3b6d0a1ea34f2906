use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held while a turn runs for one session key
pub type SessionGuard = OwnedMutexGuard<()>;

/// Per-session execution guards.
///
/// The agent runtime does not serialize turns itself. Callers take a guard
/// for the session key before processing a message so that two turns on the
/// same conversation never interleave.
#[derive(Debug, Default)]
pub struct SessionGuards {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionGuards {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, session: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Drop entries nobody holds or waits on
        locks.retain(|key, lock| key == session || Arc::strong_count(lock) > 1);
        locks
            .entry(session.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait until no other turn runs for this session
    pub async fn acquire(&self, session: &str) -> SessionGuard {
        self.lock_for(session).lock_owned().await
    }

    /// Take the guard only if the session is idle
    pub fn try_acquire(&self, session: &str) -> Option<SessionGuard> {
        self.lock_for(session).try_lock_owned().ok()
    }

    /// Number of sessions with a tracked guard
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_session_is_exclusive() {
        let guards = SessionGuards::new();
        let held = guards.acquire("a").await;
        assert!(guards.try_acquire("a").is_none());
        assert!(guards.try_acquire("b").is_some());
        drop(held);
        assert!(guards.try_acquire("a").is_some());
    }

    #[tokio::test]
    async fn test_turns_on_one_session_never_overlap() {
        let guards = Arc::new(SessionGuards::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let guards = guards.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _guard = guards.acquire("shared").await;
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let guards = SessionGuards::new();
        for i in 0..10 {
            let _guard = guards.acquire(&format!("s{i}")).await;
        }
        assert_eq!(guards.tracked(), 1);
    }
}
