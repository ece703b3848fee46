use remindr::backend::{Query, Selection};
use sqlx::{Postgres, QueryBuilder};

use crate::types::{JobStatus, JOB_COLUMNS};

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Postgres>;
}

impl ToQuery for Query {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM remindr_jobs WHERE"));
        handle_query(&mut builder, self);
        builder.push(" ORDER BY created_at DESC, id DESC");
        builder
    }
}

/// Pushes the selection predicate: due pending jobs, or processing jobs with an expired lease and
/// attempts left.
pub(crate) fn push_selectable(builder: &mut QueryBuilder<'_, Postgres>, selection: &Selection) {
    builder.push(" ((status = 'pending' AND scheduled_for <= ");
    builder.push_bind(selection.now);
    builder.push(") OR (status = 'processing' AND claimed_at < ");
    builder.push_bind(selection.lease_cutoff());
    builder.push(" AND attempt_count < ");
    builder.push_bind(i32::from(selection.max_attempts));
    builder.push("))");
}

fn handle_query(builder: &mut QueryBuilder<'_, Postgres>, query: &Query) {
    match query {
        Query::Not(inner) => {
            builder.push(" NOT (");
            handle_query(builder, inner);
            builder.push(")");
        }
        Query::And(queries) => join(builder, queries, " AND", " TRUE"),
        Query::Or(queries) => join(builder, queries, " OR", " FALSE"),
        Query::IdEquals(id) => {
            builder.push(" id = ");
            builder.push_bind(i32::from(*id));
        }
        Query::UserEqual(user_id) => {
            builder.push(" user_id = ");
            builder.push_bind(user_id.as_str().to_owned());
        }
        Query::FirmEqual(firm_id) => {
            builder.push(" firm_id = ");
            builder.push_bind(firm_id.as_str().to_owned());
        }
        Query::KindEqual(kind) => {
            builder.push(" kind = ");
            builder.push_bind(kind.as_str());
        }
        Query::StatusEqual(status) => {
            builder.push(" status = ");
            builder.push_bind(JobStatus::from(*status));
        }
        Query::ScheduledDateEqual(date) => {
            builder.push(" scheduled_date = ");
            builder.push_bind(*date);
        }
    }
}

fn join(builder: &mut QueryBuilder<'_, Postgres>, queries: &[Query], op: &str, empty: &str) {
    match queries.split_last() {
        None => {
            builder.push(empty);
        }
        Some((last, elements)) => {
            builder.push(" (");
            elements.iter().for_each(|query| {
                handle_query(builder, query);
                builder.push(op);
            });
            handle_query(builder, last);
            builder.push(")");
        }
    }
}
