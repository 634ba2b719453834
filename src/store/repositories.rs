//! Per-entity upsert repositories
//!
//! One repository per derived aggregate (exploded DNS, hostname,
//! uconn, host, frequency). Each exposes `create_indexes` plus an
//! upsert shaped for its entity: bulk maps for the DNS-derived tables,
//! one record at a time with an explicit source-role flag for hosts.
//!
//! The uconn and host-duration row helpers are shared with the writer
//! pool's session so both paths produce identical rows.

use crate::aggregate::{FrequencyRecord, HostRecord, UconnPair};
use crate::store::error::{StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type SharedConn = Arc<Mutex<Connection>>;

fn lock(conn: &SharedConn) -> StoreResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| StoreError::Serialization(format!("connection lock poisoned: {e}")))
}

/// Upsert one uconn row. Shared by the repository and writer sessions.
pub(crate) fn upsert_uconn_row(
    conn: &Connection,
    database: &str,
    pair: &UconnPair,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO uconn (db, src, dst, is_local_src, is_local_dst,
                            connection_count, total_bytes, avg_bytes,
                            total_duration, max_duration, ts_list, orig_bytes_list)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT (db, src, dst) DO UPDATE SET
            is_local_src = excluded.is_local_src,
            is_local_dst = excluded.is_local_dst,
            connection_count = excluded.connection_count,
            total_bytes = excluded.total_bytes,
            avg_bytes = excluded.avg_bytes,
            total_duration = excluded.total_duration,
            max_duration = excluded.max_duration,
            ts_list = excluded.ts_list,
            orig_bytes_list = excluded.orig_bytes_list",
        params![
            database,
            pair.src,
            pair.dst,
            pair.is_local_src,
            pair.is_local_dst,
            pair.connection_count,
            pair.total_bytes,
            pair.avg_bytes,
            pair.total_duration,
            pair.max_duration,
            serde_json::to_string(&pair.ts_list)?,
            serde_json::to_string(&pair.orig_bytes_list)?,
        ],
    )?;
    Ok(())
}

/// Raise a host's stored max duration, inserting a stub row when the
/// address has not been seen yet. Locality is settled later by the
/// host builder.
pub(crate) fn bump_host_duration(
    conn: &Connection,
    database: &str,
    ip: &str,
    max_duration: f64,
) -> StoreResult<()> {
    let Some(host) = HostRecord::from_address(ip, false, max_duration) else {
        return Ok(());
    };
    conn.execute(
        "INSERT INTO host (db, ip, local, ipv4, max_duration, ipv4_binary)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (db, ip) DO UPDATE SET
            max_duration = MAX(host.max_duration, excluded.max_duration)",
        params![
            database,
            host.ip,
            host.local,
            host.ipv4,
            host.max_duration,
            host.ipv4_binary,
        ],
    )?;
    Ok(())
}

fn upsert_host_row(conn: &Connection, database: &str, host: &HostRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO host (db, ip, local, ipv4, max_duration, ipv4_binary)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (db, ip) DO UPDATE SET
            local = excluded.local,
            max_duration = MAX(host.max_duration, excluded.max_duration)",
        params![
            database,
            host.ip,
            host.local,
            host.ipv4,
            host.max_duration,
            host.ipv4_binary,
        ],
    )?;
    Ok(())
}

/// Per-domain query-count aggregate
pub struct ExplodedDnsRepository {
    conn: SharedConn,
    database: String,
}

impl ExplodedDnsRepository {
    pub fn new(conn: SharedConn, database: &str) -> Self {
        Self {
            conn,
            database: database.to_string(),
        }
    }

    pub fn create_indexes(&self) -> StoreResult<()> {
        lock(&self.conn)?.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_exploded_dns_domain
                 ON exploded_dns (db, domain);",
        )?;
        Ok(())
    }

    /// Bulk upsert; counts are additive across runs.
    pub fn upsert(&self, domain_counts: &HashMap<String, i64>) -> StoreResult<()> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO exploded_dns (db, domain, query_count)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (db, domain) DO UPDATE SET
                    query_count = exploded_dns.query_count + excluded.query_count",
            )?;
            for (domain, count) in domain_counts {
                stmt.execute(params![self.database, domain, count])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn query_count(&self, domain: &str) -> StoreResult<Option<i64>> {
        let conn = lock(&self.conn)?;
        let count = conn
            .query_row(
                "SELECT query_count FROM exploded_dns WHERE db = ?1 AND domain = ?2",
                params![self.database, domain],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count)
    }
}

/// Per-domain resolved-IP lists
pub struct HostnameRepository {
    conn: SharedConn,
    database: String,
}

impl HostnameRepository {
    pub fn new(conn: SharedConn, database: &str) -> Self {
        Self {
            conn,
            database: database.to_string(),
        }
    }

    pub fn create_indexes(&self) -> StoreResult<()> {
        lock(&self.conn)?.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_hostname_domain
                 ON hostname (db, domain);",
        )?;
        Ok(())
    }

    /// Bulk upsert; incoming observations are appended to any stored
    /// list, duplicates preserved as observed.
    pub fn upsert(&self, hostname_map: &HashMap<String, Vec<String>>) -> StoreResult<()> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        for (domain, ips) in hostname_map {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT ips FROM hostname WHERE db = ?1 AND domain = ?2",
                    params![self.database, domain],
                    |row| row.get(0),
                )
                .optional()?;

            let mut merged: Vec<String> = match existing {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Vec::new(),
            };
            merged.extend(ips.iter().cloned());

            tx.execute(
                "INSERT OR REPLACE INTO hostname (db, domain, ips) VALUES (?1, ?2, ?3)",
                params![self.database, domain, serde_json::to_string(&merged)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn resolutions(&self, domain: &str) -> StoreResult<Vec<String>> {
        let conn = lock(&self.conn)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT ips FROM hostname WHERE db = ?1 AND domain = ?2",
                params![self.database, domain],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }
}

/// Connection-pair aggregate rows
pub struct UconnRepository {
    conn: SharedConn,
    database: String,
}

impl UconnRepository {
    pub fn new(conn: SharedConn, database: &str) -> Self {
        Self {
            conn,
            database: database.to_string(),
        }
    }

    pub fn create_indexes(&self) -> StoreResult<()> {
        lock(&self.conn)?.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_uconn_pair
                 ON uconn (db, src, dst);",
        )?;
        Ok(())
    }

    /// Upsert one pair directly, bypassing the writer pool.
    pub fn upsert(&self, pair: &UconnPair) -> StoreResult<()> {
        let conn = lock(&self.conn)?;
        upsert_uconn_row(&conn, &self.database, pair)
    }

    pub fn get(&self, src: &str, dst: &str) -> StoreResult<Option<UconnPair>> {
        let conn = lock(&self.conn)?;
        let row = conn
            .query_row(
                "SELECT src, dst, is_local_src, is_local_dst, connection_count,
                        total_bytes, avg_bytes, total_duration, max_duration,
                        ts_list, orig_bytes_list
                 FROM uconn WHERE db = ?1 AND src = ?2 AND dst = ?3",
                params![self.database, src, dst],
                |row| {
                    Ok((
                        UconnPair {
                            src: row.get(0)?,
                            dst: row.get(1)?,
                            is_local_src: row.get(2)?,
                            is_local_dst: row.get(3)?,
                            connection_count: row.get(4)?,
                            total_bytes: row.get(5)?,
                            avg_bytes: row.get(6)?,
                            total_duration: row.get(7)?,
                            max_duration: row.get(8)?,
                            ts_list: Vec::new(),
                            orig_bytes_list: Vec::new(),
                        },
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((mut pair, ts_raw, bytes_raw)) => {
                pair.ts_list = serde_json::from_str(&ts_raw)?;
                pair.orig_bytes_list = serde_json::from_str(&bytes_raw)?;
                Ok(Some(pair))
            }
            None => Ok(None),
        }
    }

    pub fn count(&self) -> StoreResult<i64> {
        let conn = lock(&self.conn)?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM uconn WHERE db = ?1",
            params![self.database],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Per-address host summaries
pub struct HostRepository {
    conn: SharedConn,
    database: String,
}

impl HostRepository {
    pub fn new(conn: SharedConn, database: &str) -> Self {
        Self {
            conn,
            database: database.to_string(),
        }
    }

    pub fn create_indexes(&self) -> StoreResult<()> {
        lock(&self.conn)?.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_host_ip ON host (db, ip);
             CREATE INDEX IF NOT EXISTS idx_host_binary ON host (db, ipv4_binary);",
        )?;
        Ok(())
    }

    /// Upsert one host from the given role of a pair. Source and
    /// destination roles carry different locality semantics, hence the
    /// explicit flag. Returns false when the address is not IPv4.
    pub fn upsert(&self, pair: &UconnPair, is_source: bool) -> StoreResult<bool> {
        let (ip, local) = if is_source {
            (&pair.src, pair.is_local_src)
        } else {
            (&pair.dst, pair.is_local_dst)
        };

        let Some(host) = HostRecord::from_address(ip, local, pair.max_duration) else {
            return Ok(false);
        };

        let conn = lock(&self.conn)?;
        upsert_host_row(&conn, &self.database, &host)?;
        Ok(true)
    }

    pub fn get(&self, ip: &str) -> StoreResult<Option<HostRecord>> {
        let conn = lock(&self.conn)?;
        let host = conn
            .query_row(
                "SELECT ip, local, ipv4, max_duration, ipv4_binary
                 FROM host WHERE db = ?1 AND ip = ?2",
                params![self.database, ip],
                |row| {
                    Ok(HostRecord {
                        ip: row.get(0)?,
                        local: row.get(1)?,
                        ipv4: row.get(2)?,
                        max_duration: row.get(3)?,
                        ipv4_binary: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(host)
    }
}

/// Strobe frequency records
pub struct FrequencyRepository {
    conn: SharedConn,
    database: String,
}

impl FrequencyRepository {
    pub fn new(conn: SharedConn, database: &str) -> Self {
        Self {
            conn,
            database: database.to_string(),
        }
    }

    pub fn create_indexes(&self) -> StoreResult<()> {
        lock(&self.conn)?.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_freq_pair ON freq (db, src, dst);",
        )?;
        Ok(())
    }

    pub fn insert(&self, record: &FrequencyRecord) -> StoreResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO freq (db, src, dst, connection_count) VALUES (?1, ?2, ?3, ?4)",
            params![self.database, record.src, record.dst, record.connection_count],
        )?;
        Ok(())
    }

    pub fn all(&self) -> StoreResult<Vec<FrequencyRecord>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT src, dst, connection_count FROM freq WHERE db = ?1 ORDER BY src, dst",
        )?;
        let rows = stmt.query_map(params![self.database], |row| {
            Ok(FrequencyRecord {
                src: row.get(0)?,
                dst: row.get(1)?,
                connection_count: row.get(2)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}
