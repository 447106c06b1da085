//! Per-key async mutexes.
//!
//! Operations on one Progress record or one exam attempt run one at a time
//! inside this process. When several keys are needed they are taken in the
//! order attempt, then progress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

const PRUNE_ABOVE: usize = 1024;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress_key(student_id: &str, course_id: Uuid) -> String {
        format!("progress:{student_id}:{course_id}")
    }

    pub fn attempt_key(attempt_id: Uuid) -> String {
        format!("attempt:{attempt_id}")
    }

    pub async fn lock(&self, key: String) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if map.len() > PRUNE_ABOVE {
                // nobody else holds or waits on these
                map.retain(|_, m| Arc::strong_count(m) > 1);
            }
            map.entry(key).or_default().clone()
        };
        slot.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let counter = Arc::new(AsyncMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks.lock("progress:a:b".into()).await;
                counter.lock().await.push(("enter", i));
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.lock().await.push(("leave", i));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let log = counter.lock().await;
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, "enter");
            assert_eq!(pair[1].0, "leave");
            assert_eq!(pair[0].1, pair[1].1);
        }
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(KeyedLocks::attempt_key(Uuid::new_v4())).await;
        let b = tokio::time::timeout(
            Duration::from_millis(50),
            locks.lock(KeyedLocks::attempt_key(Uuid::new_v4())),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
