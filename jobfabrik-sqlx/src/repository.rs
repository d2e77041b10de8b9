use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobfabrik::{
    backend::BackendError,
    job::JobKind,
    repository::{JobRunRecord, NewSchedule, Repository, ScheduleDefinition, User},
};
use sqlx::types::Json;

use crate::{map_err, types, JobFabrikPgBackend};

const SCHEDULE_COLUMNS: &str = r#"
    name,
    job_type,
    interval,
    data,
    run_only_once,
    created_by,
    updated_by,
    created_at,
    updated_at
"#;

#[async_trait]
impl Repository for JobFabrikPgBackend {
    async fn save_schedule(
        &self,
        schedule: NewSchedule,
        user: &User,
    ) -> Result<ScheduleDefinition, BackendError> {
        sqlx::query_as::<_, types::Schedule>(&format!(
            r#"INSERT INTO jobfabrik_schedules (
                name,
                job_type,
                interval,
                data,
                run_only_once,
                created_by,
                updated_by,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $6, $7, $7)
            ON CONFLICT (name, job_type) DO UPDATE SET
                interval = EXCLUDED.interval,
                data = EXCLUDED.data,
                run_only_once = EXCLUDED.run_only_once,
                updated_by = EXCLUDED.updated_by,
                updated_at = EXCLUDED.updated_at
            RETURNING {SCHEDULE_COLUMNS}"#
        ))
        .bind(&schedule.name)
        .bind(&schedule.job_type)
        .bind(&schedule.interval)
        .bind(Json(&schedule.data))
        .bind(schedule.run_only_once)
        .bind(&user.name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?
        .try_into()
    }

    async fn find_schedule(
        &self,
        name: &str,
        job_type: &str,
    ) -> Result<Option<ScheduleDefinition>, BackendError> {
        sqlx::query_as::<_, types::Schedule>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM jobfabrik_schedules WHERE name = $1 AND job_type = $2"
        ))
        .bind(name)
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(ScheduleDefinition::try_from)
        .transpose()
    }

    async fn delete_schedule(&self, name: &str, job_type: &str) -> Result<u64, BackendError> {
        Ok(
            sqlx::query("DELETE FROM jobfabrik_schedules WHERE name = $1 AND job_type = $2")
                .bind(name)
                .bind(job_type)
                .execute(&self.pool)
                .await
                .map_err(map_err)?
                .rows_affected(),
        )
    }

    async fn purge_one_shot_schedules(&self, before: DateTime<Utc>) -> Result<u64, BackendError> {
        Ok(sqlx::query(
            "DELETE FROM jobfabrik_schedules WHERE run_only_once AND updated_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(map_err)?
        .rows_affected())
    }

    async fn append_run(&self, record: JobRunRecord) -> Result<(), BackendError> {
        sqlx::query(
            r#"INSERT INTO jobfabrik_job_runs (
                name,
                job_type,
                interval,
                data,
                response,
                status_code,
                status_message,
                started_at,
                processed_by,
                created_by
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(&record.name)
        .bind(record.job_type.as_str())
        .bind(&record.interval)
        .bind(Json(&record.data))
        .bind(&record.response)
        .bind(&record.status_code)
        .bind(&record.status_message)
        .bind(record.started_at)
        .bind(&record.processed_by)
        .bind(&record.created_by)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn recent_runs(
        &self,
        name: &str,
        kind: JobKind,
        limit: usize,
    ) -> Result<Vec<JobRunRecord>, BackendError> {
        sqlx::query_as::<_, types::JobRun>(
            r#"SELECT
                name,
                job_type,
                interval,
                data,
                response,
                status_code,
                status_message,
                started_at,
                processed_by,
                created_by
            FROM jobfabrik_job_runs
            WHERE name = $1 AND job_type = $2
            ORDER BY id DESC
            LIMIT $3"#,
        )
        .bind(name)
        .bind(kind.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .into_iter()
        .map(JobRunRecord::try_from)
        .collect()
    }
}
