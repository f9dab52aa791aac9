//! Shared SQL helpers: error classification, sort allow-lists, row codecs.

use chrono::{DateTime, Utc};
use labgw_core::model::Metadata;
use labgw_core::{GatewayError, GatewayResult};
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::repository::{Filter, SortOrder};

/// Map a sqlx error onto the gateway taxonomy.
///
/// Connection-level failures are transient (worth a bounded retry);
/// constraint violations become `AlreadyExists`; everything else is a
/// permanent unavailability.
pub(crate) fn map_sqlx_error(entity: &'static str, err: sqlx::Error) -> GatewayError {
    match &err {
        sqlx::Error::RowNotFound => GatewayError::NotFound(entity),
        sqlx::Error::Database(db_err) => {
            // 23505 = unique_violation, 40P01 = deadlock_detected
            match db_err.code().as_deref() {
                Some("23505") => GatewayError::AlreadyExists(entity),
                Some("40P01") | Some("40001") => {
                    GatewayError::unavailable_transient(format!("{entity}: {db_err}"))
                }
                _ => GatewayError::unavailable_permanent(format!("{entity}: {db_err}")),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Protocol(_) => {
            GatewayError::unavailable_transient(format!("{entity}: {err}"))
        }
        _ => GatewayError::unavailable_permanent(format!("{entity}: {err}")),
    }
}

/// Resolve the sort column for a filter against a per-entity allow-list.
///
/// The resolved name is interpolated into SQL, so anything outside the
/// allow-list is rejected up front with `InvalidArgument`.
pub(crate) fn resolve_sort(
    filter: &Filter,
    allowed: &[&'static str],
    default: &'static str,
) -> GatewayResult<(&'static str, SortOrder)> {
    match filter.sort_by.as_deref() {
        None | Some("") => Ok((default, filter.order)),
        Some(requested) => allowed
            .iter()
            .find(|col| **col == requested)
            .map(|col| (*col, filter.order))
            .ok_or_else(|| {
                GatewayError::validation(format!("invalid sort field: {requested}"))
            }),
    }
}

/// Clamp limit/offset to sane bounds before they reach SQL.
pub(crate) fn clamp_page(filter: &Filter, max_limit: i64) -> (i64, i64) {
    let limit = if filter.limit <= 0 {
        i64::from(labgw_core::limits::DEFAULT_PAGE_SIZE)
    } else {
        filter.limit.min(max_limit)
    };
    (limit, filter.offset.max(0))
}

/// Decode a JSONB column into the metadata bag, tolerating NULL.
pub(crate) fn metadata_from_row(row: &PgRow, column: &str) -> GatewayResult<Metadata> {
    let value: Option<serde_json::Value> = row
        .try_get(column)
        .map_err(|e| GatewayError::Internal(format!("decode {column}: {e}")))?;
    match value {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| GatewayError::Internal(format!("decode {column}: {e}"))),
        None => Ok(Metadata::new()),
    }
}

/// Encode the metadata bag for a JSONB bind.
pub(crate) fn metadata_to_json(metadata: &Metadata) -> GatewayResult<serde_json::Value> {
    serde_json::to_value(metadata)
        .map_err(|e| GatewayError::Internal(format!("encode metadata: {e}")))
}

pub(crate) fn required_timestamp(row: &PgRow, column: &str) -> GatewayResult<DateTime<Utc>> {
    row.try_get(column)
        .map_err(|e| GatewayError::Internal(format!("decode {column}: {e}")))
}

pub(crate) fn optional_timestamp(
    row: &PgRow,
    column: &str,
) -> GatewayResult<Option<DateTime<Utc>>> {
    row.try_get(column)
        .map_err(|e| GatewayError::Internal(format!("decode {column}: {e}")))
}

pub(crate) fn required_string(row: &PgRow, column: &str) -> GatewayResult<String> {
    row.try_get(column)
        .map_err(|e| GatewayError::Internal(format!("decode {column}: {e}")))
}

pub(crate) fn optional_string(row: &PgRow, column: &str) -> GatewayResult<Option<String>> {
    row.try_get(column)
        .map_err(|e| GatewayError::Internal(format!("decode {column}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_sort_allows_listed_columns() {
        let filter = Filter {
            sort_by: Some("name".into()),
            ..Filter::default()
        };
        let (col, _) = resolve_sort(&filter, &["id", "name"], "id").unwrap();
        assert_eq!(col, "name");
    }

    #[test]
    fn test_resolve_sort_rejects_unlisted_columns() {
        let filter = Filter {
            sort_by: Some("password; DROP TABLE devices".into()),
            ..Filter::default()
        };
        assert!(resolve_sort(&filter, &["id", "name"], "id").is_err());
    }

    #[test]
    fn test_resolve_sort_defaults() {
        let filter = Filter::default();
        let (col, order) = resolve_sort(&filter, &["id"], "updated_at").unwrap();
        assert_eq!(col, "updated_at");
        assert_eq!(order, SortOrder::Desc);
    }

    #[test]
    fn test_clamp_page() {
        let mut filter = Filter::default();
        filter.limit = 0;
        assert_eq!(clamp_page(&filter, 1000), (50, 0));

        filter.limit = 5000;
        assert_eq!(clamp_page(&filter, 1000), (1000, 0));

        filter.limit = 20;
        filter.offset = -5;
        assert_eq!(clamp_page(&filter, 1000), (20, 0));
    }
}
