/*!
 * SQLite-backed record store and export source
 *
 * Schema mirrors the export column layout: one `audit_main` row per record,
 * one row in the kind table, and details with positional parameters in
 * `audit_detail`/`audit_detail_params`. Message bodies are stored
 * zstd-compressed in the `_zipxml` columns and service ids as 16-byte blobs.
 * Identifiers come from `AUTOINCREMENT`, so a deleted id is never reused and
 * the archiver's high-water mark stays meaningful.
 *
 * File databases run in WAL mode and every export query opens its own
 * read-only connection, so a slow export consumer never holds the writer
 * connection. In-memory databases have a single connection and exports
 * share it.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use tracing::debug;
use vigil_core_audit::{
    AdminAction, AdminAudit, AuditDetail, AuditLevel, AuditRecord, EntityKind, MessageAudit,
    MessageCatalog, RecordId, RecordKind, ServiceId, SystemAudit,
};

use crate::error::{Result, VigilError};
use crate::export::format::{compress_text, decompress_text};
use crate::export::{Dialect, ExportSource, RowVisitor, SqlValue};
use crate::store::{RecordStore, SearchCriteria};

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS audit_main (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT NOT NULL,
    time INTEGER NOT NULL,
    audit_level TEXT NOT NULL,
    name TEXT,
    message TEXT NOT NULL,
    ip_address TEXT,
    user_name TEXT,
    user_id TEXT,
    signature TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_main_time ON audit_main(time);

CREATE TABLE IF NOT EXISTS audit_admin (
    id INTEGER PRIMARY KEY REFERENCES audit_main(id) ON DELETE CASCADE,
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    action TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_message (
    id INTEGER PRIMARY KEY REFERENCES audit_main(id) ON DELETE CASCADE,
    status INTEGER NOT NULL,
    request_id TEXT,
    service_id BLOB,
    operation_name TEXT,
    authenticated INTEGER NOT NULL,
    authentication_type INTEGER,
    request_length INTEGER NOT NULL,
    response_length INTEGER NOT NULL,
    request_zipxml BLOB,
    response_zipxml BLOB,
    response_status INTEGER NOT NULL,
    routing_latency INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_message_service ON audit_message(service_id);

CREATE TABLE IF NOT EXISTS audit_system (
    id INTEGER PRIMARY KEY REFERENCES audit_main(id) ON DELETE CASCADE,
    component TEXT NOT NULL,
    action TEXT NOT NULL,
    client_component INTEGER NOT NULL DEFAULT 0,
    always_audit INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS audit_detail (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL REFERENCES audit_main(id) ON DELETE CASCADE,
    message_id INTEGER NOT NULL,
    ordinal INTEGER NOT NULL,
    level INTEGER NOT NULL,
    exception TEXT,
    source TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_detail_record ON audit_detail(record_id);

CREATE TABLE IF NOT EXISTS audit_detail_params (
    detail_id INTEGER NOT NULL REFERENCES audit_detail(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    value TEXT,
    PRIMARY KEY (detail_id, position)
);
";

const SELECT_RECORDS: &str = "SELECT audit_main.id, audit_main.node_id, audit_main.time, \
audit_main.audit_level, audit_main.name, audit_main.message, audit_main.ip_address, \
audit_main.user_name, audit_main.user_id, audit_main.signature, \
audit_admin.entity_kind, audit_admin.entity_id, audit_admin.action, \
audit_message.id, audit_message.status, audit_message.request_id, audit_message.service_id, \
audit_message.operation_name, audit_message.authenticated, audit_message.authentication_type, \
audit_message.request_length, audit_message.response_length, audit_message.request_zipxml, \
audit_message.response_zipxml, audit_message.response_status, audit_message.routing_latency, \
audit_system.component, audit_system.action, audit_system.client_component, audit_system.always_audit \
FROM audit_main \
LEFT OUTER JOIN audit_admin ON audit_main.id = audit_admin.id \
LEFT OUTER JOIN audit_message ON audit_main.id = audit_message.id \
LEFT OUTER JOIN audit_system ON audit_main.id = audit_system.id";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Record store over a single SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    catalog: Arc<MessageCatalog>,
    max_size: Option<u64>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("Opened audit database {} (journal mode {})", path.display(), mode);
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            catalog: Arc::new(MessageCatalog::builtin()),
            max_size: None,
        })
    }

    /// Run `f` on the export connection; only in-memory stores share the writer
    fn with_export_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        match self.path {
            Some(ref path) => {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                f(&conn)
            }
            None => {
                let conn = self.conn.lock();
                f(&*conn)
            }
        }
    }

    /// Catalog used to re-render detail text when reading records back
    pub fn with_catalog(mut self, catalog: Arc<MessageCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Bytes the audit database may grow to
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM audit_main", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn insert_children(tx: &Transaction<'_>, id: RecordId, record: &AuditRecord) -> Result<()> {
        match &record.kind {
            RecordKind::Admin(admin) => {
                tx.execute(
                    "INSERT INTO audit_admin (id, entity_kind, entity_id, action) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        id,
                        admin.entity_kind.name(),
                        admin.entity_id,
                        admin.action.code().to_string()
                    ],
                )?;
            }
            RecordKind::Message(msg) => {
                let request = msg.request_body.as_deref().map(compress_text).transpose()?;
                let response = msg.response_body.as_deref().map(compress_text).transpose()?;
                tx.execute(
                    "INSERT INTO audit_message (id, status, request_id, service_id, operation_name, \
                     authenticated, authentication_type, request_length, response_length, \
                     request_zipxml, response_zipxml, response_status, routing_latency) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        id,
                        msg.status,
                        msg.request_id,
                        msg.service_id.map(|s| s.as_bytes().to_vec()),
                        msg.operation_name,
                        msg.authenticated,
                        msg.authentication_type,
                        msg.request_length,
                        msg.response_length,
                        request,
                        response,
                        msg.response_status,
                        msg.routing_latency
                    ],
                )?;
            }
            RecordKind::System(system) => {
                tx.execute(
                    "INSERT INTO audit_system (id, component, action, client_component, always_audit) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        id,
                        system.component,
                        system.action,
                        system.client_component,
                        system.always_audit
                    ],
                )?;
            }
        }

        for detail in &record.details {
            tx.execute(
                "INSERT INTO audit_detail (record_id, message_id, ordinal, level, exception, source) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    detail.message_id,
                    detail.ordinal,
                    detail.level.value(),
                    detail.exception,
                    detail.source
                ],
            )?;
            let detail_id = tx.last_insert_rowid();
            for (position, value) in detail.params.iter().enumerate() {
                tx.execute(
                    "INSERT INTO audit_detail_params (detail_id, position, value) VALUES (?1, ?2, ?3)",
                    params![detail_id, position as i64, value],
                )?;
            }
        }
        Ok(())
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
        let level: String = row.get(3)?;
        let kind = if let Some(entity_kind) = row.get::<_, Option<String>>(10)? {
            let action: String = row.get(12)?;
            RecordKind::Admin(AdminAudit {
                entity_kind: entity_kind.parse().unwrap_or(EntityKind::Other),
                entity_id: row.get(11)?,
                action: AdminAction::from_code(action.chars().next().unwrap_or('O')),
            })
        } else if row.get::<_, Option<i64>>(13)?.is_some() {
            let service_id = row
                .get::<_, Option<Vec<u8>>>(16)?
                .and_then(|bytes| <[u8; 16]>::try_from(bytes).ok())
                .map(ServiceId::from_bytes);
            let request: Option<Vec<u8>> = row.get(22)?;
            let response: Option<Vec<u8>> = row.get(23)?;
            RecordKind::Message(MessageAudit {
                status: row.get(14)?,
                request_id: row.get(15)?,
                service_id,
                operation_name: row.get(17)?,
                authenticated: row.get(18)?,
                authentication_type: row.get(19)?,
                request_length: row.get(20)?,
                response_length: row.get(21)?,
                request_body: request.and_then(|b| decompress_text(&b).ok()),
                response_body: response.and_then(|b| decompress_text(&b).ok()),
                response_status: row.get(24)?,
                routing_latency: row.get(25)?,
            })
        } else {
            RecordKind::System(SystemAudit {
                component: row.get::<_, Option<String>>(26)?.unwrap_or_default(),
                action: row.get::<_, Option<String>>(27)?.unwrap_or_default(),
                client_component: row.get::<_, Option<bool>>(28)?.unwrap_or(false),
                always_audit: row.get::<_, Option<bool>>(29)?.unwrap_or(true),
            })
        };

        Ok(AuditRecord {
            id: Some(row.get(0)?),
            level: level.parse().unwrap_or(AuditLevel::Info),
            node_id: row.get(1)?,
            name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            message: row.get(5)?,
            time_millis: row.get(2)?,
            ip_address: row.get(6)?,
            user_name: row.get(7)?,
            user_id: row.get(8)?,
            signature: row.get(9)?,
            details: Vec::new(),
            kind,
        })
    }

    fn load_details(&self, conn: &Connection, record: &mut AuditRecord) -> Result<()> {
        let Some(id) = record.id else {
            return Ok(());
        };
        let mut stmt = conn.prepare_cached(
            "SELECT id, message_id, ordinal, level, exception, source FROM audit_detail \
             WHERE record_id = ?1 ORDER BY ordinal",
        )?;
        let mut params_stmt = conn.prepare_cached(
            "SELECT value FROM audit_detail_params WHERE detail_id = ?1 ORDER BY position",
        )?;

        let rows = stmt
            .query_map([id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i32>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, i32>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (detail_id, message_id, ordinal, level, exception, source) in rows {
            let params: Vec<String> = params_stmt
                .query_map([detail_id], |row| row.get::<_, Option<String>>(0))?
                .map(|value| value.map(Option::unwrap_or_default))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let text = match self.catalog.get(message_id) {
                Some(message) => message.format(&params),
                None => params.join(" "),
            };
            record.details.push(AuditDetail {
                message_id,
                level: AuditLevel::from_value(level),
                params,
                exception,
                ordinal,
                source,
                text,
                persist: true,
            });
        }
        Ok(())
    }
}

impl RecordStore for SqliteStore {
    fn save(&self, record: &mut AuditRecord) -> Result<RecordId> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO audit_main (node_id, time, audit_level, name, message, ip_address, \
             user_name, user_id, signature) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.node_id,
                record.time_millis,
                record.level.name(),
                record.name,
                record.message,
                record.ip_address,
                record.user_name,
                record.user_id,
                record.signature
            ],
        )?;
        let id = tx.last_insert_rowid();
        Self::insert_children(&tx, id, record)?;
        tx.commit()?;
        record.id = Some(id);
        Ok(id)
    }

    fn update(&self, record: &AuditRecord) -> Result<()> {
        let id = record
            .id
            .ok_or_else(|| VigilError::Store("cannot update a record without an id".to_string()))?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE audit_main SET node_id = ?2, time = ?3, audit_level = ?4, name = ?5, \
             message = ?6, ip_address = ?7, user_name = ?8, user_id = ?9, signature = ?10 \
             WHERE id = ?1",
            params![
                id,
                record.node_id,
                record.time_millis,
                record.level.name(),
                record.name,
                record.message,
                record.ip_address,
                record.user_name,
                record.user_id,
                record.signature
            ],
        )?;
        if changed == 0 {
            return Err(VigilError::Store(format!("no record with id {}", id)));
        }
        for table in ["audit_admin", "audit_message", "audit_system"] {
            tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table), [id])?;
        }
        tx.execute("DELETE FROM audit_detail WHERE record_id = ?1", [id])?;
        Self::insert_children(&tx, id, record)?;
        tx.commit()?;
        Ok(())
    }

    fn min_id_above(&self, floor: RecordId) -> Result<Option<RecordId>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT MIN(id) FROM audit_main WHERE id > ?1",
                [floor],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(id)
    }

    fn delete_range(&self, start: RecordId, end: RecordId) -> Result<u64> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM audit_main WHERE id >= ?1 AND id <= ?2",
            [start, end],
        )?;
        Ok(deleted as u64)
    }

    fn current_size(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let bytes: i64 = conn.query_row(
            "SELECT (page_count - freelist_count) * page_size \
             FROM pragma_page_count(), pragma_freelist_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )?;
        Ok(bytes.max(0) as u64)
    }

    fn max_size(&self) -> Result<Option<u64>> {
        Ok(self.max_size)
    }

    fn find(&self, criteria: &SearchCriteria) -> Result<Vec<AuditRecord>> {
        let conn = self.conn.lock();
        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(from) = criteria.from_time {
            values.push(from.into());
            conditions.push(format!("audit_main.time >= ?{}", values.len()));
        }
        if let Some(to) = criteria.to_time {
            values.push(to.into());
            conditions.push(format!("audit_main.time <= ?{}", values.len()));
        }
        if let Some(ref node) = criteria.node_id {
            values.push(node.clone().into());
            conditions.push(format!("audit_main.node_id = ?{}", values.len()));
        }

        let mut sql = SELECT_RECORDS.to_string();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY audit_main.id");

        let mut stmt = conn.prepare(&sql)?;
        let candidates = stmt
            .query_map(rusqlite::params_from_iter(values), Self::record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let limit = criteria.limit.unwrap_or(usize::MAX);
        let mut found = Vec::new();
        for mut record in candidates {
            if found.len() >= limit {
                break;
            }
            if !criteria.matches(&record) {
                continue;
            }
            self.load_details(&conn, &mut record)?;
            found.push(record);
        }
        Ok(found)
    }
}

fn to_sql_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(n) => SqlValue::Integer(n),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

impl ExportSource for SqliteStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn count(&self, sql: &str) -> Result<u64> {
        self.with_export_conn(|conn| {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        })
    }

    fn query(&self, sql: &str, visitor: &mut dyn RowVisitor) -> Result<()> {
        self.with_export_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            visitor.columns(&names)?;

            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let values = (0..names.len())
                    .map(|i| row.get_ref(i).map(to_sql_value))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                if !visitor.row(&values)? {
                    break;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;
    use crate::download::DownloadManager;
    use crate::export::Exporter;
    use std::io::{Cursor, Read};
    use std::thread;
    use std::time::Instant;
    use vigil_core_audit::{messages, AuditSigner};
    use zip::ZipArchive;

    fn message(time: i64) -> AuditRecord {
        let mut record = AuditRecord::message(
            AuditLevel::Warning,
            "billing",
            "Routing failed",
            MessageAudit {
                status: 3,
                request_id: Some("req-1".to_string()),
                service_id: Some(ServiceId::from_u128(0xbeef)),
                operation_name: Some("charge".to_string()),
                authenticated: true,
                authentication_type: Some(1),
                request_length: 18,
                response_length: 0,
                request_body: Some("<charge amount=1/>".to_string()),
                response_body: None,
                response_status: 502,
                routing_latency: 40,
            },
        )
        .with_node("node-1")
        .with_time(time)
        .with_user("alice", "u-1")
        .with_ip("10.0.0.1");
        let mut detail = AuditDetail::new(&messages::MESSAGE_TOO_LARGE, vec!["10", "5"]);
        detail.ordinal = 0;
        record.details.push(detail);
        record
    }

    #[test]
    fn test_save_and_find_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let signer = AuditSigner::from_bytes(b"sqlite");
        let mut record = message(1_000);
        signer.sign_record(&mut record);
        let id = store.save(&mut record).unwrap();

        let found = store.find(&SearchCriteria::default()).unwrap();
        assert_eq!(found.len(), 1);
        let loaded = &found[0];
        assert_eq!(loaded.id, Some(id));
        assert_eq!(loaded.kind, record.kind);
        assert_eq!(loaded.details[0].text, record.details[0].text);
        assert!(signer.verify_record(loaded).is_ok());
    }

    #[test]
    fn test_admin_and_system_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut admin = AuditRecord::admin(
            AuditLevel::Info,
            EntityKind::Policy,
            "p-9",
            AdminAction::Updated,
            "Policy updated",
        );
        let mut system = AuditRecord::system(AuditLevel::Severe, "archiver", "halt", "halted")
            .optional();
        store.save(&mut admin).unwrap();
        store.save(&mut system).unwrap();

        let found = store.find(&SearchCriteria::default()).unwrap();
        assert_eq!(found[0].kind, admin.kind);
        assert_eq!(found[1].kind, system.kind);

        let criteria = SearchCriteria {
            kind: Some("system".to_string()),
            ..Default::default()
        };
        assert_eq!(store.find(&criteria).unwrap().len(), 1);
    }

    #[test]
    fn test_update_replaces_children() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record = message(1_000);
        store.save(&mut record).unwrap();
        record.details.clear();
        record.message = "Routing retried".to_string();
        store.update(&record).unwrap();

        let loaded = &store.find(&SearchCriteria::default()).unwrap()[0];
        assert_eq!(loaded.message, "Routing retried");
        assert!(loaded.details.is_empty());
    }

    #[test]
    fn test_ids_not_reused_after_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        for t in 0..3 {
            store.save(&mut message(t)).unwrap();
        }
        assert_eq!(store.min_id_above(0).unwrap(), Some(1));
        assert_eq!(store.delete_range(1, 3).unwrap(), 3);
        assert_eq!(store.min_id_above(0).unwrap(), None);
        let id = store.save(&mut message(9)).unwrap();
        assert_eq!(id, 4);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_size_reported() {
        let store = SqliteStore::open_in_memory().unwrap().with_max_size(1 << 20);
        assert!(store.current_size().unwrap() > 0);
        assert_eq!(store.max_size().unwrap(), Some(1 << 20));
    }

    #[test]
    fn test_export_from_sqlite() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.save(&mut message(1_000)).unwrap();
        store
            .save(&mut AuditRecord::system(AuditLevel::Info, "boot", "start", "Node started"))
            .unwrap();

        let exporter = Exporter::new(store.clone(), Arc::new(MessageCatalog::builtin()))
            .with_signer(AuditSigner::from_bytes(b"k"));
        let mut out = Cursor::new(Vec::new());
        let info = exporter
            .export_time_range(None, None, &[ServiceId::from_u128(0xbeef)], &mut out)
            .unwrap();
        assert_eq!(info.records_exported, 1);

        out.set_position(0);
        let mut archive = ZipArchive::new(out).unwrap();
        let mut data = String::new();
        archive
            .by_name("audit.dat")
            .unwrap()
            .read_to_string(&mut data)
            .unwrap();
        let lines: Vec<&str> = data.lines().collect();
        let header: Vec<&str> = lines[0].split(':').collect();
        assert_eq!(header.len(), 31);
        assert_eq!(header[0], "id");
        assert_eq!(header[30], "audit_associated_logs");

        let row = lines[1];
        assert!(row.starts_with("1:node-1:1000:WARNING:billing:Routing failed:10.0.0.1:alice:u-1:"));
        assert!(row.contains(&ServiceId::from_u128(0xbeef).to_hex()));
        assert!(row.contains(":HTTP Basic:"));
        assert!(row.contains("<charge amount=1/>"));
        assert!(row.ends_with(
            "[-7\\\\\\:Message body of 10 bytes exceeds the audit limit of 5 bytes and was not saved]"
        ));
    }

    #[test]
    fn test_null_detail_param_keeps_positions() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.save(&mut message(1_000)).unwrap();
        store
            .conn
            .lock()
            .execute("UPDATE audit_detail_params SET value = NULL WHERE position = 0", [])
            .unwrap();

        let exporter = Exporter::new(store.clone(), Arc::new(MessageCatalog::builtin()));
        let mut out = Cursor::new(Vec::new());
        exporter.export_time_range(None, None, &[], &mut out).unwrap();

        out.set_position(0);
        let mut data = String::new();
        ZipArchive::new(out)
            .unwrap()
            .by_name("audit.dat")
            .unwrap()
            .read_to_string(&mut data)
            .unwrap();
        assert!(data.contains("Message body of  bytes exceeds the audit limit of 5 bytes"));
    }

    /// Saves `record` on another thread, failing if it waits longer than 5s
    fn save_elsewhere(store: &Arc<SqliteStore>, time: i64) -> Result<RecordId> {
        let store = store.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = tx.send(store.save(&mut message(time)));
        });
        rx.recv_timeout(Duration::from_secs(5))
            .map_err(|_| VigilError::Store("save blocked behind an export".to_string()))?
    }

    /// Writes a record from another thread for every exported row
    struct WritingVisitor {
        store: Arc<SqliteStore>,
        rows: usize,
    }

    impl RowVisitor for WritingVisitor {
        fn columns(&mut self, _names: &[String]) -> Result<()> {
            Ok(())
        }

        fn row(&mut self, _values: &[SqlValue]) -> Result<bool> {
            self.rows += 1;
            save_elsewhere(&self.store, 5_000)?;
            Ok(true)
        }
    }

    #[test]
    fn test_export_query_does_not_block_writers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("audit.db")).unwrap());
        for t in 0..5 {
            store.save(&mut message(t)).unwrap();
        }

        let mut visitor = WritingVisitor {
            store: store.clone(),
            rows: 0,
        };
        let sql = crate::export::sql::compose_sql(Dialect::Sqlite, "");
        store.query(&sql, &mut visitor).unwrap();

        // The query reads a snapshot taken before the concurrent writes
        assert_eq!(visitor.rows, 5);
        assert_eq!(store.count().unwrap(), 10);
    }

    #[test]
    fn test_unread_download_leaves_store_writable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("audit.db")).unwrap());
        for t in 0..50 {
            store.save(&mut message(t)).unwrap();
        }

        let config = DownloadConfig {
            chunk_size: 64,
            pipe_blocks: 1,
            ..Default::default()
        };
        let manager =
            DownloadManager::new(store.clone(), Arc::new(MessageCatalog::builtin()), &config)
                .unwrap();
        let token = manager.open(None, None, &[]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.downloaded_count(&token).unwrap() < 50 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(manager.downloaded_count(&token).unwrap(), 50);

        // Nothing has been read, yet the store still takes writes
        assert!(save_elsewhere(&store, 9_000).is_ok());
        assert_eq!(store.count().unwrap(), 51);
        assert!(manager.close(&token));
    }
}
