use crate::error::AppError;
use crate::models::{UsageEntry, UsageQuery};

/// True when `entry` satisfies every predicate set on `query`.
pub fn matches(entry: &UsageEntry, query: &UsageQuery) -> bool {
    if query.start_date.is_some_and(|start| entry.timestamp < start) {
        return false;
    }
    if query.end_date.is_some_and(|end| entry.timestamp > end) {
        return false;
    }
    if query
        .instance_id
        .as_deref()
        .is_some_and(|id| entry.instance_id != id)
    {
        return false;
    }
    if query
        .session_id
        .as_deref()
        .is_some_and(|id| entry.session_id.as_deref() != Some(id))
    {
        return false;
    }
    if query
        .model
        .as_deref()
        .is_some_and(|m| !entry.model.eq_ignore_ascii_case(m.trim()))
    {
        return false;
    }
    true
}

/// Filters, orders newest first and paginates.
///
/// Entries sharing a timestamp keep their input order.
pub fn select<I>(entries: I, query: &UsageQuery) -> Result<Vec<UsageEntry>, AppError>
where
    I: IntoIterator<Item = Result<UsageEntry, AppError>>,
{
    let mut hits = Vec::new();
    for entry in entries {
        let entry = entry?;
        if matches(&entry, query) {
            hits.push(entry);
        }
    }

    hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    Ok(hits
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .collect())
}
