use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use jobfabrik::{
    backend::{Backend, BackendError, CompleteJob, JobCriteria, NewJob, Uniqueness},
    job::{Job, JobId, JobKind, JOB_NAME_ATTRIB},
};
use sqlx::types::Json;

use crate::{
    handle_update, map_err,
    query::{ToQuery, JOB_COLUMNS},
    types, JobFabrikPgBackend,
};

impl JobFabrikPgBackend {
    async fn find_unique(
        conn: &mut sqlx::PgConnection,
        job: &NewJob,
    ) -> sqlx::Result<Option<i64>> {
        match &job.unique {
            Uniqueness::JobName(name) => {
                let sql = format!(
                    "SELECT id FROM jobfabrik_jobs WHERE kind = $1 AND data ->> '{JOB_NAME_ATTRIB}' = $2 \
                     ORDER BY id LIMIT 1 FOR UPDATE"
                );
                sqlx::query_scalar::<_, i64>(&sql)
                    .bind(job.kind.as_str())
                    .bind(name.as_str())
                    .fetch_optional(conn)
                    .await
            }
            Uniqueness::Data(data) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM jobfabrik_jobs WHERE kind = $1 AND data @> $2 \
                     ORDER BY id LIMIT 1 FOR UPDATE",
                )
                .bind(job.kind.as_str())
                .bind(Json(data))
                .fetch_optional(conn)
                .await
            }
        }
    }

    async fn save_job(&self, job: NewJob) -> sqlx::Result<i64> {
        let mut tx = self.pool.begin().await?;
        // Serializes saves of one kind so two racing saves cannot both insert.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(job.kind.as_str())
            .execute(&mut *tx)
            .await?;

        let id = match Self::find_unique(&mut *tx, &job).await? {
            Some(id) => {
                sqlx::query(
                    r#"UPDATE jobfabrik_jobs
                    SET
                        data = $2,
                        next_run_at = $3,
                        repeat_interval = $4,
                        repeat_timezone = $5
                    WHERE id = $1"#,
                )
                .bind(id)
                .bind(Json(&job.data))
                .bind(job.next_run_at)
                .bind(&job.repeat_interval)
                .bind(&job.repeat_timezone)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    r#"INSERT INTO jobfabrik_jobs (
                        kind,
                        data,
                        next_run_at,
                        repeat_interval,
                        repeat_timezone
                    ) VALUES ($1, $2, $3, $4, $5)
                    RETURNING id"#,
                )
                .bind(job.kind.as_str())
                .bind(Json(&job.data))
                .bind(job.next_run_at)
                .bind(&job.repeat_interval)
                .bind(&job.repeat_timezone)
                .fetch_one(&mut *tx)
                .await?
            }
        };
        tx.commit().await?;
        Ok(id)
    }
}

#[async_trait]
impl Backend for JobFabrikPgBackend {
    async fn save(&self, job: NewJob) -> Result<JobId, BackendError> {
        self.save_job(job).await.map(JobId::from).map_err(map_err)
    }

    async fn find(&self, criteria: &JobCriteria) -> Result<Vec<Job>, BackendError> {
        criteria
            .select()
            .build_query_as::<types::Job>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn cancel(&self, criteria: &JobCriteria) -> Result<u64, BackendError> {
        Ok(criteria
            .delete()
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_err)?
            .rows_affected())
    }

    async fn lock_next_due(
        &self,
        kind: JobKind,
        lock_lifetime: TimeDelta,
    ) -> Result<Option<Job>, BackendError> {
        let now = Utc::now();
        sqlx::query_as::<_, types::Job>(&format!(
            r#"UPDATE jobfabrik_jobs
            SET
                locked_at = $2,
                last_run_at = $2
            WHERE id IN (
                SELECT id FROM jobfabrik_jobs
                WHERE kind = $1
                    AND next_run_at <= $2
                    AND (locked_at IS NULL OR locked_at < $3)
                ORDER BY next_run_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}"#
        ))
        .bind(kind.as_str())
        .bind(now)
        .bind(now - lock_lifetime)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(Job::try_from)
        .transpose()
    }

    async fn touch(&self, id: JobId) -> Result<(), BackendError> {
        let result = sqlx::query("UPDATE jobfabrik_jobs SET locked_at = $2 WHERE id = $1")
            .bind(i64::from(id))
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map(|done| done.rows_affected());
        handle_update(result, id)
    }

    async fn complete(&self, id: JobId, completion: CompleteJob) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"UPDATE jobfabrik_jobs
            SET
                data = $2,
                last_finished_at = $3,
                next_run_at = $4,
                locked_at = NULL,
                fail_count = fail_count + CASE WHEN $5::TEXT IS NULL THEN 0 ELSE 1 END,
                fail_reason = COALESCE($5, fail_reason),
                failed_at = CASE WHEN $5::TEXT IS NULL THEN failed_at ELSE $3 END
            WHERE id = $1"#,
        )
        .bind(i64::from(id))
        .bind(Json(&completion.data))
        .bind(completion.finished_at)
        .bind(completion.next_run_at)
        .bind(&completion.failure)
        .execute(&self.pool)
        .await
        .map(|done| done.rows_affected());
        handle_update(result, id)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, BackendError> {
        Ok(sqlx::query(
            r#"DELETE FROM jobfabrik_jobs
            WHERE repeat_interval IS NULL
                AND next_run_at IS NULL
                AND last_finished_at < $1"#,
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(map_err)?
        .rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use jobfabrik::job::JobData;
    use serde_json::json;
    use sqlx::PgPool;

    use super::*;

    fn new_job(name: &str, unique: Uniqueness) -> NewJob {
        let mut data = JobData::new();
        data.insert(JOB_NAME_ATTRIB.to_owned(), json!(name));
        data.insert("instance_id".to_owned(), json!("abc"));
        NewJob {
            kind: JobKind::ScheduledBackup,
            data,
            next_run_at: Utc::now() - TimeDelta::seconds(1),
            repeat_interval: Some("*/1 * * * *".to_owned()),
            repeat_timezone: None,
            unique,
        }
    }

    #[sqlx::test]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn save_replaces_the_record_with_the_same_name(pool: PgPool) {
        let backend: JobFabrikPgBackend = pool.into();
        let unique = Uniqueness::JobName("abc_ScheduledBackup".to_owned());

        let first = backend
            .save(new_job("abc_ScheduledBackup", unique.clone()))
            .await
            .unwrap();
        let mut replacement = new_job("abc_ScheduledBackup", unique);
        replacement.repeat_interval = Some("0 0 * * *".to_owned());
        let second = backend.save(replacement).await.unwrap();

        assert_eq!(first, second);
        let jobs = backend
            .find(&JobCriteria::named(JobKind::ScheduledBackup, "abc_ScheduledBackup"))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].repeat_interval.as_deref(), Some("0 0 * * *"));
    }

    #[sqlx::test]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn data_uniqueness_matches_on_contained_entries(pool: PgPool) {
        let backend: JobFabrikPgBackend = pool.into();
        let mut unique = JobData::new();
        unique.insert("instance_id".to_owned(), json!("abc"));

        let first = backend
            .save(new_job("abc_ScheduledBackup_1", Uniqueness::Data(unique.clone())))
            .await
            .unwrap();
        let second = backend
            .save(new_job("abc_ScheduledBackup_2", Uniqueness::Data(unique)))
            .await
            .unwrap();

        assert_eq!(first, second);
        let jobs = backend
            .find(&JobCriteria::name_prefix(JobKind::ScheduledBackup, "abc_"))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_name(), Some("abc_ScheduledBackup_2"));
    }

    #[sqlx::test]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn claimed_records_are_not_claimed_twice(pool: PgPool) {
        let backend: JobFabrikPgBackend = pool.into();
        let id = backend
            .save(new_job(
                "abc_ScheduledBackup",
                Uniqueness::JobName("abc_ScheduledBackup".to_owned()),
            ))
            .await
            .unwrap();
        let lifetime = TimeDelta::minutes(10);

        let claimed = backend
            .lock_next_due(JobKind::ScheduledBackup, lifetime)
            .await
            .unwrap()
            .unwrap();
        let again = backend
            .lock_next_due(JobKind::ScheduledBackup, lifetime)
            .await
            .unwrap();

        assert_eq!(claimed.id, id);
        assert!(claimed.locked_at.is_some());
        assert!(again.is_none());
    }

    #[sqlx::test]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn complete_releases_the_lock_and_records_failures(pool: PgPool) {
        let backend: JobFabrikPgBackend = pool.into();
        let job = new_job(
            "abc_ScheduledBackup",
            Uniqueness::JobName("abc_ScheduledBackup".to_owned()),
        );
        let data = job.data.clone();
        let id = backend.save(job).await.unwrap();
        backend
            .lock_next_due(JobKind::ScheduledBackup, TimeDelta::minutes(10))
            .await
            .unwrap();

        backend
            .complete(
                id,
                CompleteJob {
                    data,
                    finished_at: Utc::now(),
                    next_run_at: None,
                    failure: Some("boom".to_owned()),
                },
            )
            .await
            .unwrap();

        let job = &backend
            .find(&JobCriteria::named(JobKind::ScheduledBackup, "abc_ScheduledBackup"))
            .await
            .unwrap()[0];
        assert!(job.locked_at.is_none());
        assert_eq!(job.fail_count, 1);
        assert_eq!(job.fail_reason.as_deref(), Some("boom"));
        assert!(job.next_run_at.is_none());
    }

    #[sqlx::test]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn touching_a_missing_record_is_not_found(pool: PgPool) {
        let backend: JobFabrikPgBackend = pool.into();

        let result = backend.touch(42.into()).await;

        assert!(matches!(result, Err(BackendError::JobNotFound(_))));
    }
}
