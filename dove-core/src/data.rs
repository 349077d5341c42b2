use crate::model::{Channel, Mirror, NodeRecord, RunStatus, ScanCounts, ScanRun, ScanScope};
use crate::reconcile::ReconcilePlan;
use dove_scanner::{CanonicalKey, Scheme};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result, Row, params};
use std::fs;
use std::io;
use std::path::Path;

/// The persistence side of a reconciliation pass.
///
/// The canonical key is a uniqueness constraint: `apply_create` fails for a
/// key that is already stored.
pub trait Inventory {
    fn list_inventory(&self) -> Result<Vec<NodeRecord>>;
    fn apply_create(&self, record: &NodeRecord) -> Result<()>;
    fn apply_update(&self, record: &NodeRecord) -> Result<()>;
    fn apply_delete(&self, key: &CanonicalKey) -> Result<()>;

    /// Apply a whole plan atomically: deletes, then updates, then creates.
    fn commit(&self, plan: &ReconcilePlan) -> Result<()>;
}

pub struct Database {
    conn: Connection,
}

pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Database {
    pub fn drop(path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Optimize for concurrent writes
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
-- Verified proxy endpoints
CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    protocol TEXT NOT NULL CHECK(protocol IN ('vless', 'vmess', 'trojan', 'ss')),
    host TEXT NOT NULL,
    port INTEGER NOT NULL CHECK(port BETWEEN 1 AND 65535),
    user_id TEXT NOT NULL,

    raw_link TEXT NOT NULL,
    remark TEXT,
    source TEXT,

    last_ping_ms INTEGER,
    last_speed_kbps REAL,
    last_checked INTEGER,
    is_working BOOLEAN NOT NULL DEFAULT 0,

    created_at INTEGER NOT NULL,

    UNIQUE(protocol, host, port, user_id)
);

CREATE INDEX IF NOT EXISTS idx_nodes_working ON nodes(is_working);

-- Pages that publish links in bulk
CREATE TABLE IF NOT EXISTS mirrors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL UNIQUE,
    active BOOLEAN NOT NULL DEFAULT 1,
    last_checked INTEGER,
    created_at INTEGER NOT NULL
);

-- Public channels whose messages carry links
CREATE TABLE IF NOT EXISTS channels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    active BOOLEAN NOT NULL DEFAULT 1,
    last_checked INTEGER,
    created_at INTEGER NOT NULL
);

-- One row per reconciliation pass
CREATE TABLE IF NOT EXISTS scan_runs (
    id TEXT PRIMARY KEY,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    status TEXT NOT NULL CHECK(status IN ('running', 'completed', 'failed', 'cancelled')),
    scope TEXT NOT NULL CHECK(scope IN ('all', 'channels', 'mirrors')),
    links_collected INTEGER NOT NULL DEFAULT 0,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_scan_runs_start ON scan_runs(start_time);
            ",
        )?;
        Ok(())
    }

    // Scan run bookkeeping
    pub fn create_scan_run(&self, scope: ScanScope) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let timestamp = current_timestamp();

        self.conn.execute(
            "INSERT INTO scan_runs (id, start_time, status, scope) VALUES (?1, ?2, ?3, ?4)",
            params![&run_id, timestamp, RunStatus::Running.as_str(), scope.as_str()],
        )?;

        Ok(run_id)
    }

    pub fn complete_scan_run(&self, run_id: &str, counts: &ScanCounts) -> Result<()> {
        let timestamp = current_timestamp();
        self.conn.execute(
            "UPDATE scan_runs
             SET status = ?1, end_time = ?2, links_collected = ?3, created = ?4, updated = ?5, deleted = ?6
             WHERE id = ?7",
            params![
                RunStatus::Completed.as_str(),
                timestamp,
                counts.links_collected as i64,
                counts.created as i64,
                counts.updated as i64,
                counts.deleted as i64,
                run_id
            ],
        )?;
        Ok(())
    }

    pub fn fail_scan_run(&self, run_id: &str) -> Result<()> {
        self.finish_scan_run(run_id, RunStatus::Failed)
    }

    pub fn cancel_scan_run(&self, run_id: &str) -> Result<()> {
        self.finish_scan_run(run_id, RunStatus::Cancelled)
    }

    fn finish_scan_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let timestamp = current_timestamp();
        self.conn.execute(
            "UPDATE scan_runs SET status = ?1, end_time = ?2 WHERE id = ?3",
            params![status.as_str(), timestamp, run_id],
        )?;
        Ok(())
    }

    pub fn get_scan_run(&self, run_id: &str) -> Result<Option<ScanRun>> {
        self.conn
            .query_row(
                "SELECT id, start_time, end_time, status, scope, links_collected, created, updated, deleted
                 FROM scan_runs WHERE id = ?1",
                params![run_id],
                |row| {
                    Ok(ScanRun {
                        id: row.get(0)?,
                        start_time: row.get(1)?,
                        end_time: row.get(2)?,
                        status: row.get(3)?,
                        scope: row.get(4)?,
                        counts: ScanCounts {
                            links_collected: row.get::<_, i64>(5)? as usize,
                            created: row.get::<_, i64>(6)? as usize,
                            updated: row.get::<_, i64>(7)? as usize,
                            deleted: row.get::<_, i64>(8)? as usize,
                        },
                    })
                },
            )
            .optional()
    }

    // Mirror management
    pub fn add_mirror(&self, name: &str, url: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO mirrors (name, url, created_at) VALUES (?1, ?2, ?3)",
            params![name, url, current_timestamp()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Returns false when no mirror had that name.
    pub fn remove_mirror(&self, name: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM mirrors WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }

    pub fn list_mirrors(&self) -> Result<Vec<Mirror>> {
        self.query_mirrors("SELECT id, name, url, active, last_checked, created_at FROM mirrors ORDER BY name")
    }

    pub fn active_mirrors(&self) -> Result<Vec<Mirror>> {
        self.query_mirrors(
            "SELECT id, name, url, active, last_checked, created_at FROM mirrors WHERE active = 1 ORDER BY name",
        )
    }

    fn query_mirrors(&self, sql: &str) -> Result<Vec<Mirror>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mirrors = stmt
            .query_map([], |row| {
                Ok(Mirror {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    url: row.get(2)?,
                    active: row.get(3)?,
                    last_checked: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(mirrors)
    }

    pub fn touch_mirror(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE mirrors SET last_checked = ?1 WHERE id = ?2",
            params![current_timestamp(), id],
        )?;
        Ok(())
    }

    // Channel management
    pub fn add_channel(&self, username: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO channels (username, created_at) VALUES (?1, ?2)",
            params![normalize_channel(username), current_timestamp()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn remove_channel(&self, username: &str) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM channels WHERE username = ?1",
            params![normalize_channel(username)],
        )?;
        Ok(removed > 0)
    }

    pub fn list_channels(&self) -> Result<Vec<Channel>> {
        self.query_channels(
            "SELECT id, username, active, last_checked, created_at FROM channels ORDER BY username",
        )
    }

    pub fn active_channels(&self) -> Result<Vec<Channel>> {
        self.query_channels(
            "SELECT id, username, active, last_checked, created_at FROM channels WHERE active = 1 ORDER BY username",
        )
    }

    fn query_channels(&self, sql: &str) -> Result<Vec<Channel>> {
        let mut stmt = self.conn.prepare(sql)?;
        let channels = stmt
            .query_map([], |row| {
                Ok(Channel {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    active: row.get(2)?,
                    last_checked: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(channels)
    }

    pub fn touch_channel(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE channels SET last_checked = ?1 WHERE id = ?2",
            params![current_timestamp(), id],
        )?;
        Ok(())
    }

    // Feed
    pub fn working_links(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT raw_link FROM nodes WHERE is_working = 1 ORDER BY id")?;
        let links = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>>>()?;
        Ok(links)
    }

    pub fn get_node(&self, key: &CanonicalKey) -> Result<Option<NodeRecord>> {
        self.conn
            .query_row(
                &format!(
                    "{} WHERE protocol = ?1 AND host = ?2 AND port = ?3 AND user_id = ?4",
                    NODE_COLUMNS
                ),
                params![key.scheme.as_str(), &key.host, key.port, &key.identity],
                node_from_row,
            )
            .optional()
    }
}

impl Inventory for Database {
    fn list_inventory(&self) -> Result<Vec<NodeRecord>> {
        let mut stmt = self.conn.prepare(&format!("{} ORDER BY id", NODE_COLUMNS))?;
        let records = stmt
            .query_map([], node_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(records)
    }

    fn apply_create(&self, record: &NodeRecord) -> Result<()> {
        insert_node(&self.conn, record)
    }

    fn apply_update(&self, record: &NodeRecord) -> Result<()> {
        update_node(&self.conn, record)
    }

    fn apply_delete(&self, key: &CanonicalKey) -> Result<()> {
        delete_node(&self.conn, key)
    }

    fn commit(&self, plan: &ReconcilePlan) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for key in &plan.to_delete {
            delete_node(&tx, key)?;
        }
        for record in &plan.to_update {
            update_node(&tx, record)?;
        }
        for record in &plan.to_create {
            insert_node(&tx, record)?;
        }
        tx.commit()
    }
}

const NODE_COLUMNS: &str = "SELECT protocol, host, port, user_id, raw_link, remark, source,
        last_ping_ms, last_speed_kbps, last_checked, is_working
     FROM nodes";

fn node_from_row(row: &Row<'_>) -> Result<NodeRecord> {
    let protocol: String = row.get(0)?;
    let scheme = Scheme::parse(&protocol)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(0, "protocol".into(), Type::Text))?;

    Ok(NodeRecord {
        key: CanonicalKey {
            scheme,
            host: row.get(1)?,
            port: row.get(2)?,
            identity: row.get(3)?,
        },
        raw_link: row.get(4)?,
        remark: row.get(5)?,
        source: row.get(6)?,
        last_ping_ms: row.get::<_, Option<i64>>(7)?.map(|ms| ms as u64),
        last_speed_kbps: row.get(8)?,
        last_checked: row.get(9)?,
        is_working: row.get(10)?,
    })
}

fn insert_node(conn: &Connection, record: &NodeRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO nodes (
            protocol, host, port, user_id, raw_link, remark, source,
            last_ping_ms, last_speed_kbps, last_checked, is_working, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            record.key.scheme.as_str(),
            &record.key.host,
            record.key.port,
            &record.key.identity,
            &record.raw_link,
            &record.remark,
            &record.source,
            record.last_ping_ms.map(|ms| ms as i64),
            record.last_speed_kbps,
            record.last_checked,
            record.is_working,
            current_timestamp(),
        ],
    )?;
    Ok(())
}

fn update_node(conn: &Connection, record: &NodeRecord) -> Result<()> {
    let changed = conn.execute(
        "UPDATE nodes
         SET raw_link = ?1, remark = ?2, source = ?3, last_ping_ms = ?4,
             last_speed_kbps = ?5, last_checked = ?6, is_working = ?7
         WHERE protocol = ?8 AND host = ?9 AND port = ?10 AND user_id = ?11",
        params![
            &record.raw_link,
            &record.remark,
            &record.source,
            record.last_ping_ms.map(|ms| ms as i64),
            record.last_speed_kbps,
            record.last_checked,
            record.is_working,
            record.key.scheme.as_str(),
            &record.key.host,
            record.key.port,
            &record.key.identity,
        ],
    )?;
    if changed == 0 {
        return Err(rusqlite::Error::QueryReturnedNoRows);
    }
    Ok(())
}

fn delete_node(conn: &Connection, key: &CanonicalKey) -> Result<()> {
    conn.execute(
        "DELETE FROM nodes WHERE protocol = ?1 AND host = ?2 AND port = ?3 AND user_id = ?4",
        params![key.scheme.as_str(), &key.host, key.port, &key.identity],
    )?;
    Ok(())
}

/// Channel usernames are stored without a leading `@`.
fn normalize_channel(username: &str) -> &str {
    username.trim().trim_start_matches('@')
}
