use crate::error::{Error, Result};
use crate::models::attempt::Attempt;
use crate::models::evidence::EvidenceRecord;
use crate::models::exam::{Exam, ExamItem, ItemOption};
use crate::models::security_event::{NewSecurityEvent, SecurityEvent};
use crate::models::tenant::RiskThresholds;
use crate::services::store::{AttemptStore, AuditEntry, ExamCatalog};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use uuid::Uuid;

const ATTEMPT_COLUMNS: &str = r#"
    id, exam_id, student_name, student_identifier, item_order, start_time, timer_reset_used,
    completed_at, finalized_by, answers, score, review_status, penalized_items, penalty_points,
    teacher_comment, identity_status, photo_id_path, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: String| Error::Internal(format!("Corrupt {} column: {}", column, e)))
}

fn attempt_from_row(row: &PgRow) -> Result<Attempt> {
    let finalized_by: Option<String> = row.try_get("finalized_by")?;
    Ok(Attempt {
        id: row.try_get("id")?,
        exam_id: row.try_get("exam_id")?,
        student_name: row.try_get("student_name")?,
        student_identifier: row.try_get("student_identifier")?,
        item_order: row.try_get::<Json<Vec<String>>, _>("item_order")?.0,
        start_time: row.try_get("start_time")?,
        timer_reset_used: row.try_get("timer_reset_used")?,
        completed_at: row.try_get("completed_at")?,
        finalized_by: finalized_by
            .map(|s| s.parse())
            .transpose()
            .map_err(|e: String| Error::Internal(format!("Corrupt finalized_by column: {}", e)))?,
        answers: row.try_get::<Json<BTreeMap<String, String>>, _>("answers")?.0,
        score: row.try_get("score")?,
        review_status: parse_column(row, "review_status")?,
        penalized_items: row.try_get::<Json<BTreeSet<String>>, _>("penalized_items")?.0,
        penalty_points: row.try_get("penalty_points")?,
        teacher_comment: row.try_get("teacher_comment")?,
        identity_status: parse_column(row, "identity_status")?,
        photo_id_path: row.try_get("photo_id_path")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<SecurityEvent> {
    Ok(SecurityEvent {
        seq: row.try_get("seq")?,
        attempt_id: row.try_get("attempt_id")?,
        event_type: parse_column(row, "event_type")?,
        timestamp: row.try_get("timestamp")?,
        metadata: row.try_get("metadata")?,
    })
}

fn evidence_from_row(row: &PgRow) -> Result<EvidenceRecord> {
    Ok(EvidenceRecord {
        id: row.try_get("id")?,
        attempt_id: row.try_get("attempt_id")?,
        kind: parse_column(row, "kind")?,
        file_path: row.try_get("file_path")?,
        status: parse_column(row, "status")?,
        attempt_number: row.try_get("attempt_number")?,
        analysis: row.try_get("analysis")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl AttemptStore for PgStore {
    async fn insert_attempt(&self, attempt: &Attempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO attempts (
                id, exam_id, student_name, student_identifier, item_order, start_time, timer_reset_used,
                completed_at, finalized_by, answers, score, review_status, penalized_items, penalty_points,
                teacher_comment, identity_status, photo_id_path, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.exam_id)
        .bind(&attempt.student_name)
        .bind(&attempt.student_identifier)
        .bind(Json(&attempt.item_order))
        .bind(attempt.start_time)
        .bind(attempt.timer_reset_used)
        .bind(attempt.completed_at)
        .bind(attempt.finalized_by.map(|f| f.as_str()))
        .bind(Json(&attempt.answers))
        .bind(attempt.score)
        .bind(attempt.review_status.as_str())
        .bind(Json(&attempt.penalized_items))
        .bind(attempt.penalty_points)
        .bind(&attempt.teacher_comment)
        .bind(attempt.identity_status.as_str())
        .bind(&attempt.photo_id_path)
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<Attempt>> {
        let row = sqlx::query(&format!("SELECT {} FROM attempts WHERE id = $1", ATTEMPT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    async fn find_student_attempts(&self, exam_id: Uuid, student_identifier: &str) -> Result<Vec<Attempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM attempts WHERE exam_id = $1 AND student_identifier = $2 ORDER BY created_at",
            ATTEMPT_COLUMNS
        ))
        .bind(exam_id)
        .bind(student_identifier)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn list_exam_attempts(&self, exam_id: Uuid) -> Result<Vec<Attempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM attempts WHERE exam_id = $1 ORDER BY created_at DESC",
            ATTEMPT_COLUMNS
        ))
        .bind(exam_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn list_running_attempts(&self) -> Result<Vec<Attempt>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {} FROM attempts
               WHERE start_time IS NOT NULL
                 AND completed_at IS NULL
                 AND review_status NOT IN ('approved', 'rejected')"#,
            ATTEMPT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn update_attempt(&self, attempt: &Attempt) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE attempts
            SET item_order = $2, start_time = $3, timer_reset_used = $4, completed_at = $5,
                finalized_by = $6, answers = $7, score = $8, review_status = $9,
                penalized_items = $10, penalty_points = $11, teacher_comment = $12,
                identity_status = $13, photo_id_path = $14, updated_at = $15
            WHERE id = $1
            "#,
        )
        .bind(attempt.id)
        .bind(Json(&attempt.item_order))
        .bind(attempt.start_time)
        .bind(attempt.timer_reset_used)
        .bind(attempt.completed_at)
        .bind(attempt.finalized_by.map(|f| f.as_str()))
        .bind(Json(&attempt.answers))
        .bind(attempt.score)
        .bind(attempt.review_status.as_str())
        .bind(Json(&attempt.penalized_items))
        .bind(attempt.penalty_points)
        .bind(&attempt.teacher_comment)
        .bind(attempt.identity_status.as_str())
        .bind(&attempt.photo_id_path)
        .bind(attempt.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Attempt {} not found", attempt.id)));
        }
        Ok(())
    }

    async fn append_event(&self, event: NewSecurityEvent) -> Result<SecurityEvent> {
        let row = sqlx::query(
            r#"
            INSERT INTO security_events (attempt_id, event_type, timestamp, metadata)
            VALUES ($1, $2, $3, $4)
            RETURNING seq, attempt_id, event_type, timestamp, metadata
            "#,
        )
        .bind(event.attempt_id)
        .bind(event.event_type.as_str())
        .bind(event.timestamp)
        .bind(&event.metadata)
        .fetch_one(&self.pool)
        .await?;
        event_from_row(&row)
    }

    async fn list_events(&self, attempt_id: Uuid) -> Result<Vec<SecurityEvent>> {
        let rows = sqlx::query(
            r#"SELECT seq, attempt_id, event_type, timestamp, metadata
               FROM security_events WHERE attempt_id = $1 ORDER BY timestamp, seq"#,
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn insert_evidence(&self, record: &EvidenceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO evidence_records (id, attempt_id, kind, file_path, status, attempt_number, analysis, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.attempt_id)
        .bind(record.kind.as_str())
        .bind(&record.file_path)
        .bind(record.status.as_str())
        .bind(record.attempt_number)
        .bind(&record.analysis)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_evidence(&self, record: &EvidenceRecord) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE evidence_records SET status = $2, analysis = $3, updated_at = $4 WHERE id = $1"#,
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(&record.analysis)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Evidence {} not found", record.id)));
        }
        Ok(())
    }

    async fn list_evidence(&self, attempt_id: Uuid) -> Result<Vec<EvidenceRecord>> {
        let rows = sqlx::query(
            r#"SELECT id, attempt_id, kind, file_path, status, attempt_number, analysis, created_at, updated_at
               FROM evidence_records WHERE attempt_id = $1 ORDER BY created_at"#,
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(evidence_from_row).collect()
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO audit_logs (id, actor, action, attempt_id, changes, created_at) VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(entry.id)
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(entry.attempt_id)
        .bind(&entry.changes)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ExamCatalog for PgStore {
    async fn exam(&self, exam_id: Uuid) -> Result<Option<Exam>> {
        let Some(row) = sqlx::query(
            r#"SELECT id, tenant_id, title, duration_seconds, shuffle_items FROM exams WHERE id = $1"#,
        )
        .bind(exam_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let item_rows = sqlx::query(
            r#"SELECT item_id, stem, options, points, position
               FROM exam_items WHERE exam_id = $1 ORDER BY position, item_id"#,
        )
        .bind(exam_id)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(item_rows.len());
        for r in &item_rows {
            let options: JsonValue = r.try_get("options")?;
            items.push(ExamItem {
                item_id: r.try_get("item_id")?,
                stem: r.try_get("stem")?,
                options: serde_json::from_value::<Vec<ItemOption>>(options)?,
                points: r.try_get("points")?,
                position: r.try_get("position")?,
            });
        }

        Ok(Some(Exam {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            title: row.try_get("title")?,
            duration_seconds: row.try_get("duration_seconds")?,
            shuffle_items: row.try_get("shuffle_items")?,
            items,
        }))
    }

    async fn risk_thresholds(&self, tenant_id: Uuid) -> Result<RiskThresholds> {
        let row = sqlx::query(
            r#"SELECT risk_threshold_medium, risk_threshold_high FROM tenants WHERE id = $1"#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let medium: i64 = r.try_get("risk_threshold_medium")?;
                let high: i64 = r.try_get("risk_threshold_high")?;
                RiskThresholds::new(medium, high).map_err(Error::Internal)
            }
            None => Ok(RiskThresholds::default()),
        }
    }
}
