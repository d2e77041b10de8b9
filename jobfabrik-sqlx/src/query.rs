use jobfabrik::{
    backend::{JobCriteria, NameMatch},
    job::JOB_NAME_ATTRIB,
};
use sqlx::{Postgres, QueryBuilder};

pub(crate) const JOB_COLUMNS: &str = r#"
    id,
    kind,
    data,
    repeat_interval,
    repeat_timezone,
    next_run_at,
    last_run_at,
    last_finished_at,
    locked_at,
    failed_at,
    fail_count,
    fail_reason
"#;

pub(crate) trait ToQuery {
    fn select(&self) -> QueryBuilder<'_, Postgres>;
    fn delete(&self) -> QueryBuilder<'_, Postgres>;
}

impl ToQuery for JobCriteria {
    fn select(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobfabrik_jobs"));
        push_filter(&mut builder, self);
        builder.push(" ORDER BY next_run_at ASC NULLS LAST, id ASC");
        builder
    }

    fn delete(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new("DELETE FROM jobfabrik_jobs");
        push_filter(&mut builder, self);
        builder
    }
}

fn push_filter<'a>(builder: &mut QueryBuilder<'a, Postgres>, criteria: &'a JobCriteria) {
    builder.push(" WHERE kind = ");
    builder.push_bind(criteria.kind.as_str());
    match &criteria.name {
        NameMatch::Exact(name) => {
            builder.push(format!(" AND data ->> '{JOB_NAME_ATTRIB}' = "));
            builder.push_bind(name.as_str());
        }
        NameMatch::Prefix(prefix) => {
            builder.push(format!(" AND starts_with(data ->> '{JOB_NAME_ATTRIB}', "));
            builder.push_bind(prefix.as_str());
            builder.push(")");
        }
    }
    if criteria.scheduled_only {
        builder.push(" AND next_run_at IS NOT NULL");
    }
}
