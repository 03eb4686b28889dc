use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

type Slots<K> = Mutex<HashMap<K, Arc<AsyncMutex<()>>>>;

/// One async writer lock per attempt. Different attempts never contend.
/// Check-ins take a separate lock per exam and student identifier.
#[derive(Default)]
pub struct AttemptLocks {
    slots: Slots<Uuid>,
    check_ins: Slots<(Uuid, String)>,
}

fn slot_for<K: std::hash::Hash + Eq>(slots: &Slots<K>, key: K) -> Arc<AsyncMutex<()>> {
    let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
    // Drop slots nobody holds or waits on.
    if slots.len() > 1024 {
        slots.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
    slots.entry(key).or_default().clone()
}

impl AttemptLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, attempt_id: Uuid) -> OwnedMutexGuard<()> {
        slot_for(&self.slots, attempt_id).lock_owned().await
    }

    pub async fn acquire_check_in(&self, exam_id: Uuid, student_identifier: &str) -> OwnedMutexGuard<()> {
        slot_for(&self.check_ins, (exam_id, student_identifier.to_string()))
            .lock_owned()
            .await
    }

    pub fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_attempt_is_serialized() {
        let locks = Arc::new(AttemptLocks::new());
        let id = Uuid::new_v4();
        let guard = locks.acquire(id).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(id).await; })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_attempts_do_not_contend() {
        let locks = AttemptLocks::new();
        let _a = locks.acquire(Uuid::new_v4()).await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.acquire(Uuid::new_v4()))
            .await
            .expect("second attempt lock should be free");
        assert_eq!(locks.tracked(), 2);
    }

    #[tokio::test]
    async fn check_ins_serialize_per_exam_and_identifier() {
        let locks = AttemptLocks::new();
        let exam = Uuid::new_v4();
        let _held = locks.acquire_check_in(exam, "4012").await;

        let same = tokio::time::timeout(Duration::from_millis(30), locks.acquire_check_in(exam, "4012")).await;
        assert!(same.is_err());

        let _other_student = tokio::time::timeout(Duration::from_millis(50), locks.acquire_check_in(exam, "4013"))
            .await
            .expect("another identifier should not wait");
        let _other_exam = tokio::time::timeout(Duration::from_millis(50), locks.acquire_check_in(Uuid::new_v4(), "4012"))
            .await
            .expect("another exam should not wait");
    }
}
