use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::config::REPORT_FILE_NAME;
use crate::error::PipelineError;
use crate::models::{Report, StoredReport};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub fn normalize_session(raw: &str) -> anyhow::Result<String> {
    let session = raw.trim();
    anyhow::ensure!(!session.is_empty(), "session key must not be blank");
    anyhow::ensure!(
        session.len() <= 128,
        "session key is longer than 128 characters"
    );
    Ok(session.to_string())
}

pub fn expiry_for(created_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    created_at + ttl
}

/// Same rule as the `expires_at > $2` filter of [`fetch_latest_report`].
pub fn is_live(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at > now
}

/// Turns an empty lookup into [`PipelineError::NoReportAvailable`].
pub fn require_report<T>(found: Option<T>, session: &str) -> anyhow::Result<T> {
    found.ok_or_else(|| {
        anyhow::Error::from(PipelineError::NoReportAvailable(session.to_string()))
    })
}

pub fn is_missing_report(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::NoReportAvailable(_))
    )
}

/// Stores a finished report as the newest one of `session`.
pub async fn save_report(
    pool: &PgPool,
    session: &str,
    report: &Report,
    ttl: Duration,
) -> anyhow::Result<StoredReport> {
    let created_at = Utc::now();
    let stored = StoredReport {
        id: Uuid::new_v4(),
        session: session.to_string(),
        file_name: REPORT_FILE_NAME.to_string(),
        accuracy: report.accuracy,
        row_count: i32::try_from(report.rows.len()).context("report has too many rows")?,
        spreadsheet: report.spreadsheet.clone(),
        created_at,
        expires_at: expiry_for(created_at, ttl),
    };

    sqlx::query(
        r#"
        INSERT INTO grade_reports.reports
        (id, session, file_name, accuracy, row_count, spreadsheet, created_at, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(stored.id)
    .bind(&stored.session)
    .bind(&stored.file_name)
    .bind(stored.accuracy)
    .bind(stored.row_count)
    .bind(&stored.spreadsheet)
    .bind(stored.created_at)
    .bind(stored.expires_at)
    .execute(pool)
    .await
    .context("failed to store report")?;

    info!(
        id = %stored.id,
        session = %stored.session,
        rows = stored.row_count,
        expires_at = %stored.expires_at,
        "report stored"
    );
    Ok(stored)
}

/// Latest unexpired report of `session`, or [`PipelineError::NoReportAvailable`].
pub async fn fetch_latest_report(
    pool: &PgPool,
    session: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<StoredReport> {
    let row = sqlx::query(
        r#"
        SELECT id, session, file_name, accuracy, row_count, spreadsheet, created_at, expires_at
        FROM grade_reports.reports
        WHERE session = $1 AND expires_at > $2
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(session)
    .bind(now)
    .fetch_optional(pool)
    .await
    .context("failed to look up report")?;

    let stored = row
        .map(|row| StoredReport {
            id: row.get("id"),
            session: row.get("session"),
            file_name: row.get("file_name"),
            accuracy: row.get("accuracy"),
            row_count: row.get("row_count"),
            spreadsheet: row.get("spreadsheet"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
        })
        .filter(|stored| is_live(stored.expires_at, now));
    require_report(stored, session)
}

pub async fn purge_expired(pool: &PgPool, now: DateTime<Utc>) -> anyhow::Result<u64> {
    let result = sqlx::query("DELETE FROM grade_reports.reports WHERE expires_at <= $1")
        .bind(now)
        .execute(pool)
        .await
        .context("failed to purge expired reports")?;

    info!(deleted = result.rows_affected(), "expired reports purged");
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_adds_ttl_to_creation_time() {
        let created_at = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let expires_at = expiry_for(created_at, Duration::hours(24));
        assert_eq!(expires_at.to_rfc3339(), "2026-03-02T10:00:00+00:00");
    }

    #[test]
    fn session_keys_are_trimmed_and_non_blank() {
        assert_eq!(normalize_session("  aula-3b ").unwrap(), "aula-3b");
        assert!(normalize_session("   ").is_err());
        assert!(normalize_session(&"x".repeat(129)).is_err());
    }

    fn at(timestamp: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(timestamp)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn reports_expire_at_their_deadline() {
        let expires_at = expiry_for(at("2026-03-01T10:00:00Z"), Duration::hours(24));
        assert!(is_live(expires_at, at("2026-03-02T09:59:59Z")));
        assert!(!is_live(expires_at, at("2026-03-02T10:00:00Z")));
        assert!(!is_live(expires_at, at("2026-03-05T00:00:00Z")));
    }

    #[test]
    fn download_before_any_run_has_no_report() {
        let err = require_report(None::<StoredReport>, "aula-3b").unwrap_err();
        assert!(is_missing_report(&err));
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NoReportAvailable(session)) if session == "aula-3b"
        ));
        assert_eq!(require_report(Some(7), "aula-3b").unwrap(), 7);
    }

    #[test]
    fn expired_report_is_not_downloadable() {
        let created_at = at("2026-03-01T10:00:00Z");
        let stored = StoredReport {
            id: Uuid::new_v4(),
            session: "aula-3b".to_string(),
            file_name: REPORT_FILE_NAME.to_string(),
            accuracy: Some(1.0),
            row_count: 3,
            spreadsheet: Vec::new(),
            created_at,
            expires_at: expiry_for(created_at, Duration::hours(24)),
        };

        let now = at("2026-03-01T12:00:00Z");
        let live = Some(stored.clone()).filter(|stored| is_live(stored.expires_at, now));
        assert_eq!(require_report(live, "aula-3b").unwrap().id, stored.id);

        let now = at("2026-03-03T10:00:00Z");
        let expired = Some(stored).filter(|stored| is_live(stored.expires_at, now));
        assert!(is_missing_report(&require_report(expired, "aula-3b").unwrap_err()));
    }

    #[test]
    fn store_failures_are_not_missing_reports() {
        let err = anyhow::anyhow!("connection refused").context("failed to look up report");
        assert!(!is_missing_report(&err));
        let err = anyhow::Error::from(PipelineError::Internal("boom".into()));
        assert!(!is_missing_report(&err));
    }
}
