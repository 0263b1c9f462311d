use tracing::{debug, error};

use crate::db::Database;
use crate::error::StoreResult;
use crate::models::{AuditEvent, AuditFilter, NewAuditEvent};

/// Append-only audit ledger.
#[derive(Clone)]
pub struct AuditLog {
    db: Database,
    max_query_limit: usize,
}

impl AuditLog {
    pub fn new(db: Database, max_query_limit: usize) -> Self {
        Self {
            db,
            max_query_limit: max_query_limit.max(1),
        }
    }

    pub async fn try_record(&self, event: NewAuditEvent) -> StoreResult<i64> {
        let event = event.validate()?;
        self.db
            .run_blocking(move |db| db.insert_audit_event(&event))
            .await
    }

    /// Best-effort append. A failure is logged and never reaches the caller,
    /// so the action being audited is not rolled back.
    pub async fn record(&self, event: NewAuditEvent) {
        let category = event.category;
        let action = event.action.clone();
        match self.try_record(event).await {
            Ok(id) => debug!("Audit: recorded {} {} as #{}", category, action, id),
            Err(e) => error!("Audit: failed to record {} {}: {}", category, action, e),
        }
    }

    /// Newest first. `limit` is clamped to `1..=max_query_limit`.
    pub async fn query(
        &self,
        guild_id: u64,
        filter: AuditFilter,
        limit: usize,
    ) -> StoreResult<Vec<AuditEvent>> {
        let limit = limit.clamp(1, self.max_query_limit);
        self.db
            .run_blocking(move |db| db.query_audit_events(guild_id, &filter, limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditCategory;
    use chrono::{Duration, Utc};

    fn audit_log(max: usize) -> AuditLog {
        let db = Database::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        AuditLog::new(db, max)
    }

    #[tokio::test]
    async fn test_events_come_back_newest_first() {
        let log = audit_log(100);
        for i in 0..25 {
            log.record(
                NewAuditEvent::new(AuditCategory::Moderation, "warn")
                    .target(i)
                    .guild(500),
            )
            .await;
        }

        let events = log.query(500, AuditFilter::default(), 100).await.unwrap();
        assert_eq!(events.len(), 25);
        for pair in events.windows(2) {
            assert!(pair[0].id > pair[1].id);
            assert!(pair[0].created_at >= pair[1].created_at);
        }
        assert_eq!(events[0].target_id, Some(24));
        assert_eq!(events[24].target_id, Some(0));
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let log = audit_log(3);
        for _ in 0..5 {
            log.record(NewAuditEvent::new(AuditCategory::Appeal, "appeal_denied").guild(1))
                .await;
        }

        assert_eq!(log.query(1, AuditFilter::default(), 50).await.unwrap().len(), 3);
        assert_eq!(log.query(1, AuditFilter::default(), 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_since_filter() {
        let log = audit_log(10);
        log.record(NewAuditEvent::new(AuditCategory::Verification, "verified").guild(2))
            .await;

        let past = Utc::now() - Duration::hours(1);
        let future = Utc::now() + Duration::hours(1);
        let filter = AuditFilter::default().with_since(past);
        assert_eq!(log.query(2, filter, 10).await.unwrap().len(), 1);
        let filter = AuditFilter::default().with_since(future);
        assert!(log.query(2, filter, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_action_rejected_by_try_record() {
        let log = audit_log(10);
        assert!(log
            .try_record(NewAuditEvent::new(AuditCategory::Config, ""))
            .await
            .is_err());

        // record swallows the same failure.
        log.record(NewAuditEvent::new(AuditCategory::Config, "").guild(3))
            .await;
        assert!(log.query(3, AuditFilter::default(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_survives_missing_table() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        db.lock().unwrap().execute("DROP TABLE audit_log", []).unwrap();
        let log = AuditLog::new(db, 10);

        log.record(NewAuditEvent::new(AuditCategory::Moderation, "ban").guild(9))
            .await;
        assert!(log
            .try_record(NewAuditEvent::new(AuditCategory::Moderation, "ban"))
            .await
            .is_err());
    }
}
