//! Export query composition
//!
//! The column list is order-significant: the first column must be the record
//! identifier, and downstream consumers of `audit.dat` address fields by
//! position. Both dialects produce the same columns; they differ only in how
//! the per-record detail list is aggregated into `audit_associated_logs`.
//! A NULL parameter aggregates as an empty string so later parameters keep
//! their positions.

use vigil_core_audit::{RecordId, ServiceId};

use super::format::{DETAILS_COLUMN, DETAIL_ID_PREFIX, DETAIL_SEPARATOR};

/// SQL dialect of an export source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

pub const AUDIT_COLUMNS: &str = "audit_main.id, audit_main.node_id, audit_main.time, \
audit_main.audit_level, audit_main.name, audit_main.message, audit_main.ip_address, \
audit_main.user_name, audit_main.user_id, audit_main.signature, \
audit_admin.id, audit_admin.entity_kind, audit_admin.entity_id, audit_admin.action, \
audit_message.id, audit_message.status, audit_message.request_id, audit_message.service_id, \
audit_message.operation_name, audit_message.authenticated, audit_message.authentication_type, \
audit_message.request_length, audit_message.response_length, audit_message.request_zipxml, \
audit_message.response_zipxml, audit_message.response_status, audit_message.routing_latency, \
audit_system.id, audit_system.component, audit_system.action";

const KIND_JOINS: &str = "LEFT OUTER JOIN audit_admin ON audit_main.id = audit_admin.id \
LEFT OUTER JOIN audit_message ON audit_main.id = audit_message.id \
LEFT OUTER JOIN audit_system ON audit_main.id = audit_system.id";

/// Export query with `clause` (a WHERE clause, possibly empty) applied
pub fn compose_sql(dialect: Dialect, clause: &str) -> String {
    match dialect {
        Dialect::MySql => format!(
            "SELECT {AUDIT_COLUMNS}, \
             GROUP_CONCAT('{DETAIL_ID_PREFIX}', audit_detail.message_id, '{DETAIL_SEPARATOR}', \
             (SELECT COALESCE(GROUP_CONCAT(COALESCE(value, '') ORDER BY position ASC SEPARATOR '{DETAIL_SEPARATOR}'), '') \
             FROM audit_detail_params WHERE audit_detail_params.detail_id = audit_detail.id) \
             ORDER BY ordinal SEPARATOR '{DETAIL_SEPARATOR}') AS {DETAILS_COLUMN} \
             FROM audit_main {KIND_JOINS} \
             LEFT OUTER JOIN audit_detail ON audit_main.id = audit_detail.record_id{clause} \
             GROUP BY audit_main.id ORDER BY audit_main.id"
        ),
        Dialect::Sqlite => format!(
            "SELECT {AUDIT_COLUMNS}, \
             (SELECT group_concat('{DETAIL_ID_PREFIX}' || d.message_id || \
             COALESCE((SELECT '{DETAIL_SEPARATOR}' || group_concat(COALESCE(p.value, ''), '{DETAIL_SEPARATOR}' ORDER BY p.position) \
             FROM audit_detail_params p WHERE p.detail_id = d.id), ''), '{DETAIL_SEPARATOR}' ORDER BY d.ordinal) \
             FROM audit_detail d WHERE d.record_id = audit_main.id) AS {DETAILS_COLUMN} \
             FROM audit_main {KIND_JOINS}{clause} \
             ORDER BY audit_main.id"
        ),
    }
}

/// WHERE clause for a time window and optional service filter
///
/// Bounds are inclusive; `None` leaves a side open.
pub fn compose_where_clause(
    from_time: Option<i64>,
    to_time: Option<i64>,
    service_ids: &[ServiceId],
) -> String {
    let mut conditions = Vec::new();
    if let Some(from) = from_time {
        conditions.push(format!("audit_main.time >= {}", from));
    }
    if let Some(to) = to_time {
        conditions.push(format!("audit_main.time <= {}", to));
    }
    if !service_ids.is_empty() {
        let list = service_ids
            .iter()
            .map(|id| format!("X'{}'", id.to_hex()))
            .collect::<Vec<_>>()
            .join(", ");
        conditions.push(format!("audit_message.service_id IN ({})", list));
    }

    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

/// WHERE clause for an inclusive identifier range
pub fn compose_id_where_clause(start: RecordId, end: RecordId) -> String {
    format!(" WHERE audit_main.id >= {} AND audit_main.id <= {}", start, end)
}

/// Count query matching [`compose_where_clause`]
pub fn compose_count_sql(
    from_time: Option<i64>,
    to_time: Option<i64>,
    service_ids: &[ServiceId],
) -> String {
    let mut sql = String::from("SELECT COUNT(*) FROM audit_main");
    if !service_ids.is_empty() {
        sql.push_str(" JOIN audit_message ON audit_main.id = audit_message.id");
    }
    sql.push_str(&compose_where_clause(from_time, to_time, service_ids));
    sql
}

/// Count query matching [`compose_id_where_clause`]
pub fn compose_count_by_id_sql(start: RecordId, end: RecordId) -> String {
    format!(
        "SELECT COUNT(*) FROM audit_main{}",
        compose_id_where_clause(start, end)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_clause_empty() {
        assert_eq!(compose_where_clause(None, None, &[]), "");
    }

    #[test]
    fn test_where_clause_full() {
        let clause = compose_where_clause(
            Some(10),
            Some(20),
            &[ServiceId::from_u128(1), ServiceId::from_u128(2)],
        );
        assert_eq!(
            clause,
            " WHERE audit_main.time >= 10 AND audit_main.time <= 20 AND audit_message.service_id IN \
             (X'00000000000000000000000000000001', X'00000000000000000000000000000002')"
        );
    }

    #[test]
    fn test_count_sql_joins_messages_for_service_filter() {
        let sql = compose_count_sql(None, Some(5), &[ServiceId::from_u128(9)]);
        assert!(sql.starts_with("SELECT COUNT(*) FROM audit_main JOIN audit_message"));
        assert!(sql.contains("audit_main.time <= 5"));
        assert_eq!(
            compose_count_sql(None, None, &[]),
            "SELECT COUNT(*) FROM audit_main"
        );
    }

    #[test]
    fn test_id_range() {
        assert_eq!(
            compose_count_by_id_sql(3, 7),
            "SELECT COUNT(*) FROM audit_main WHERE audit_main.id >= 3 AND audit_main.id <= 7"
        );
    }

    #[test]
    fn test_select_starts_with_id_and_ends_with_details() {
        for dialect in [Dialect::MySql, Dialect::Sqlite] {
            let sql = compose_sql(dialect, &compose_id_where_clause(1, 2));
            assert!(sql.starts_with("SELECT audit_main.id, audit_main.node_id"));
            assert!(sql.contains("AS audit_associated_logs"));
            assert!(sql.contains("WHERE audit_main.id >= 1 AND audit_main.id <= 2"));
            assert!(sql.ends_with("ORDER BY audit_main.id"));
        }
        assert!(compose_sql(Dialect::MySql, "").contains("GROUP BY audit_main.id"));
    }
}
