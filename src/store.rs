//! SQLite-backed list store.
//!
//! One connection guarded by a mutex serializes every write, which keeps the
//! per-list uniqueness check atomic, and lets a read (e.g. the effective
//! blacklist, which consults both tables) observe a single consistent state.

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::model::{format_timestamp, InsertOutcome, ListEntry, ListFilter, ListKind, ListOrder, NewEntry};
use crate::normalizer::{render_net, to_net};

/// Rows committed per transaction in `insert_many`. A failure part-way through
/// a batch leaves earlier chunks committed.
const BATCH_CHUNK: usize = 500;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS blacklist (
        ip TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        added_at TEXT NOT NULL,
        reason TEXT,
        comment TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_blacklist_source ON blacklist(source);

    CREATE TABLE IF NOT EXISTS whitelist (
        ip TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        added_at TEXT NOT NULL,
        reason TEXT,
        comment TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_whitelist_source ON whitelist(source);
"#;

/// Fixed statements for one list table.
struct ListTable {
    insert: &'static str,
    select: &'static str,
    count: &'static str,
}

const BLACKLIST: ListTable = ListTable {
    insert: "INSERT OR IGNORE INTO blacklist (ip, source, added_at, reason, comment) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
    select: "SELECT l.ip, l.source, l.added_at, l.reason, l.comment FROM blacklist l",
    count: "SELECT COUNT(*) FROM blacklist",
};

const WHITELIST: ListTable = ListTable {
    insert: "INSERT OR IGNORE INTO whitelist (ip, source, added_at, reason, comment) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
    select: "SELECT l.ip, l.source, l.added_at, l.reason, l.comment FROM whitelist l",
    count: "SELECT COUNT(*) FROM whitelist",
};

const SELECT_EFFECTIVE: &str = "SELECT l.ip, l.source, l.added_at, l.reason, l.comment \
     FROM blacklist l WHERE NOT EXISTS (SELECT 1 FROM whitelist w WHERE w.ip = l.ip)";

const SELECT_WHITELIST_ADDRESSES: &str = "SELECT ip FROM whitelist";

impl ListKind {
    fn table(self) -> &'static ListTable {
        match self {
            ListKind::Blacklist => &BLACKLIST,
            ListKind::Whitelist => &WHITELIST,
        }
    }
}

/// Thread-safe handle to the list database.
#[derive(Clone)]
pub struct ListStore {
    conn: Arc<Mutex<Connection>>,
}

impl ListStore {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Opened list database {} (journal_mode={})", path.display(), mode);

        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert one row. `added_at` is assigned here.
    pub fn insert(
        &self,
        kind: ListKind,
        ip_or_cidr: &str,
        source: &str,
        reason: Option<&str>,
        comment: Option<&str>,
    ) -> Result<InsertOutcome, StoreError> {
        let added_at = format_timestamp(&Utc::now());
        let conn = self.conn()?;
        let changed = conn.execute(
            kind.table().insert,
            params![ip_or_cidr, source, added_at, reason, comment],
        )?;

        if changed == 0 {
            debug!("{} already present in {}", ip_or_cidr, kind);
            Ok(InsertOutcome::AlreadyPresent)
        } else {
            info!("Added {} to {} from source {}", ip_or_cidr, kind, source);
            Ok(InsertOutcome::Inserted)
        }
    }

    /// Insert-or-ignore a batch. Returns the number of newly stored rows;
    /// duplicates within the batch or against existing rows are skipped.
    pub fn insert_many(&self, kind: ListKind, entries: &[NewEntry]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let mut inserted = 0usize;
        let mut processed = 0usize;

        for chunk in entries.chunks(BATCH_CHUNK) {
            match insert_chunk(&mut conn, kind, chunk) {
                Ok(n) => {
                    inserted += n;
                    processed += chunk.len();
                }
                Err(e) => {
                    warn!(
                        committed = inserted,
                        remaining = entries.len() - processed,
                        "Bulk insert into {} interrupted: {}",
                        kind,
                        e
                    );
                    return Err(e);
                }
            }
        }

        info!(
            "Added {} IPs to {} ({} skipped as duplicates)",
            inserted,
            kind,
            entries.len() - inserted
        );
        Ok(inserted)
    }

    /// Raw rows of one list, without precedence applied.
    pub fn list(&self, kind: ListKind, filter: &ListFilter) -> Result<Vec<ListEntry>, StoreError> {
        let conn = self.conn()?;
        let (sql, args) = filtered_query(kind.table().select, false, filter);
        let mut entries = query_entries(&conn, kind, &sql, &args)?;
        drop(conn);

        sort_entries(&mut entries, filter.order);
        Ok(entries)
    }

    /// Blacklist rows with every whitelisted address suppressed.
    ///
    /// Exact matches are excluded in SQL. A blacklist row covered by a
    /// whitelisted range is dropped, and a blacklisted range that contains
    /// whitelisted addresses is narrowed to the sub-ranges around them.
    /// Raw rows are never modified.
    pub fn effective_blacklist(&self, filter: &ListFilter) -> Result<Vec<ListEntry>, StoreError> {
        let conn = self.conn()?;
        let (sql, args) = filtered_query(SELECT_EFFECTIVE, true, filter);
        let candidates = query_entries(&conn, ListKind::Blacklist, &sql, &args)?;
        let allowed = whitelist_nets(&conn)?;
        drop(conn);

        let mut entries = apply_precedence(candidates, &allowed);
        sort_entries(&mut entries, filter.order);
        Ok(entries)
    }

    /// Number of raw rows in a list
    pub fn count(&self, kind: ListKind) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(kind.table().count, [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

fn insert_chunk(
    conn: &mut Connection,
    kind: ListKind,
    chunk: &[NewEntry],
) -> Result<usize, StoreError> {
    let tx = conn.transaction()?;
    let mut inserted = 0usize;
    {
        let mut stmt = tx.prepare_cached(kind.table().insert)?;
        for entry in chunk {
            inserted += stmt.execute(params![
                entry.ip_or_cidr,
                entry.source,
                format_timestamp(&entry.added_at),
                entry.reason,
                entry.comment,
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

/// Append filter conditions to a base select. Conditions are fixed text;
/// caller values only ever travel as bound parameters.
fn filtered_query(base: &str, has_where: bool, filter: &ListFilter) -> (String, Vec<String>) {
    let mut conditions: Vec<&str> = Vec::new();
    let mut args: Vec<String> = Vec::new();

    if let Some(ref source) = filter.source {
        conditions.push("l.source = ?");
        args.push(source.clone());
    }
    if let Some(ref from) = filter.from {
        conditions.push("l.added_at >= ?");
        args.push(format_timestamp(from));
    }
    if let Some(ref to) = filter.to {
        conditions.push("l.added_at <= ?");
        args.push(format_timestamp(to));
    }

    let mut sql = base.to_string();
    for (i, condition) in conditions.iter().enumerate() {
        sql.push_str(if i == 0 && !has_where { " WHERE " } else { " AND " });
        sql.push_str(condition);
    }
    sql.push_str(" ORDER BY l.rowid");
    (sql, args)
}

fn query_entries(
    conn: &Connection,
    kind: ListKind,
    sql: &str,
    args: &[String],
) -> Result<Vec<ListEntry>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| row_to_entry(row, kind))?;
    let entries = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

fn row_to_entry(row: &Row<'_>, kind: ListKind) -> rusqlite::Result<ListEntry> {
    let added_at: String = row.get(2)?;
    let added_at = DateTime::parse_from_rfc3339(&added_at)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(ListEntry {
        ip_or_cidr: row.get(0)?,
        list: kind,
        source: row.get(1)?,
        added_at,
        reason: row.get(3)?,
        comment: row.get(4)?,
    })
}

/// Whitelisted addresses split into exact hosts and ranges.
struct AllowedNets {
    hosts: HashSet<IpNet>,
    ranges: Vec<IpNet>,
}

fn whitelist_nets(conn: &Connection) -> Result<AllowedNets, StoreError> {
    let mut stmt = conn.prepare(SELECT_WHITELIST_ADDRESSES)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut allowed = AllowedNets {
        hosts: HashSet::new(),
        ranges: Vec::new(),
    };
    for row in rows {
        let raw = row?;
        match to_net(&raw) {
            Some(net) if net.prefix_len() == net.max_prefix_len() => {
                allowed.hosts.insert(net);
            }
            Some(net) => allowed.ranges.push(net),
            None => warn!("Ignoring unparsable whitelist row: {}", raw),
        }
    }
    Ok(allowed)
}

fn apply_precedence(candidates: Vec<ListEntry>, allowed: &AllowedNets) -> Vec<ListEntry> {
    if allowed.ranges.is_empty() && allowed.hosts.is_empty() {
        return candidates;
    }

    let mut effective = Vec::with_capacity(candidates.len());
    for entry in candidates {
        let Some(net) = to_net(&entry.ip_or_cidr) else {
            effective.push(entry);
            continue;
        };

        if allowed.ranges.iter().any(|range| covers(range, &net)) || allowed.hosts.contains(&net) {
            continue;
        }
        if net.prefix_len() == net.max_prefix_len() {
            effective.push(entry);
            continue;
        }

        let holes: Vec<IpNet> = allowed
            .hosts
            .iter()
            .chain(allowed.ranges.iter())
            .filter(|hole| covers(&net, hole))
            .copied()
            .collect();
        if holes.is_empty() {
            effective.push(entry);
            continue;
        }

        for piece in carve(net, &holes) {
            effective.push(ListEntry {
                ip_or_cidr: render_net(&piece),
                ..entry.clone()
            });
        }
    }
    effective
}

/// Split `net` into the largest sub-ranges that avoid every hole.
fn carve(net: IpNet, holes: &[IpNet]) -> Vec<IpNet> {
    if holes.iter().any(|hole| covers(hole, &net)) {
        return Vec::new();
    }
    let inner: Vec<IpNet> = holes.iter().filter(|h| covers(&net, h)).copied().collect();
    if inner.is_empty() {
        return vec![net];
    }
    match net.subnets(net.prefix_len() + 1) {
        Ok(halves) => halves.flat_map(|half| carve(half, &inner)).collect(),
        Err(_) => Vec::new(),
    }
}

/// Check if `container` fully contains `contained` (same address family only).
fn covers(container: &IpNet, contained: &IpNet) -> bool {
    match (container, contained) {
        (IpNet::V4(c), IpNet::V4(t)) => c.contains(t),
        (IpNet::V6(c), IpNet::V6(t)) => c.contains(t),
        _ => false,
    }
}

fn sort_entries(entries: &mut [ListEntry], order: ListOrder) {
    if order == ListOrder::Address {
        // Unparsable rows sort last, keeping their relative order.
        entries.sort_by_key(|entry| {
            let net = to_net(&entry.ip_or_cidr);
            (net.is_none(), net)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> ListStore {
        ListStore::open_in_memory().unwrap()
    }

    fn ips(entries: &[ListEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.ip_or_cidr.as_str()).collect()
    }

    fn new_entry(ip: &str, source: &str, added_at: DateTime<Utc>) -> NewEntry {
        NewEntry {
            ip_or_cidr: ip.to_string(),
            source: source.to_string(),
            added_at,
            reason: None,
            comment: None,
        }
    }

    #[test]
    fn test_insert_then_duplicate() {
        let store = store();
        let first = store
            .insert(ListKind::Blacklist, "1.2.3.4", "manual", Some("scan"), None)
            .unwrap();
        let second = store
            .insert(ListKind::Blacklist, "1.2.3.4", "other", None, None)
            .unwrap();

        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::AlreadyPresent);
        assert_eq!(store.count(ListKind::Blacklist).unwrap(), 1);

        // The original row is untouched by the duplicate
        let rows = store.list(ListKind::Blacklist, &ListFilter::default()).unwrap();
        assert_eq!(rows[0].source, "manual");
        assert_eq!(rows[0].reason.as_deref(), Some("scan"));
    }

    #[test]
    fn test_uniqueness_is_per_list() {
        let store = store();
        store.insert(ListKind::Blacklist, "1.2.3.4", "a", None, None).unwrap();
        let outcome = store.insert(ListKind::Whitelist, "1.2.3.4", "a", None, None).unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
        assert_eq!(store.count(ListKind::Blacklist).unwrap(), 1);
        assert_eq!(store.count(ListKind::Whitelist).unwrap(), 1);
    }

    #[test]
    fn test_insert_many_counts_only_new_rows() {
        let store = store();
        store.insert(ListKind::Blacklist, "10.0.0.1", "manual", None, None).unwrap();

        let now = Utc::now();
        let batch = vec![
            new_entry("10.0.0.1", "feed", now),
            new_entry("10.0.0.2", "feed", now),
            new_entry("10.0.0.2", "feed", now),
            new_entry("10.0.0.3", "feed", now),
        ];
        let inserted = store.insert_many(ListKind::Blacklist, &batch).unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(store.count(ListKind::Blacklist).unwrap(), 3);
    }

    #[test]
    fn test_insert_many_spans_chunks() {
        let store = store();
        let now = Utc::now();
        let batch: Vec<NewEntry> = (0..(BATCH_CHUNK as u32 + 20))
            .map(|i| new_entry(&std::net::Ipv4Addr::from(0x0a00_0000 + i).to_string(), "feed", now))
            .collect();
        assert_eq!(store.insert_many(ListKind::Blacklist, &batch).unwrap(), batch.len());
    }

    #[test]
    fn test_insert_many_keeps_chunks_committed_before_failure() {
        let store = store();
        let now = Utc::now();
        let addr = |i: u32| std::net::Ipv4Addr::from(0x0a00_0000 + i).to_string();

        let existing: Vec<NewEntry> = (0..100).map(|i| new_entry(&addr(i), "old", now)).collect();
        store.insert_many(ListKind::Blacklist, &existing).unwrap();

        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_marker BEFORE INSERT ON blacklist \
                 WHEN NEW.ip = '192.0.2.99' BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        // First chunk: 100 duplicates and 400 new rows; the second chunk fails
        let mut batch: Vec<NewEntry> = (0..BATCH_CHUNK as u32).map(|i| new_entry(&addr(i), "feed", now)).collect();
        batch.push(new_entry("192.0.2.98", "feed", now));
        batch.push(new_entry("192.0.2.99", "feed", now));

        assert!(store.insert_many(ListKind::Blacklist, &batch).is_err());
        assert_eq!(store.count(ListKind::Blacklist).unwrap(), BATCH_CHUNK);
    }

    #[test]
    fn test_concurrent_writers_keep_one_row_per_address() {
        let store = store();
        let now = Utc::now();
        let addrs: Vec<String> = (0..300u32)
            .map(|i| std::net::Ipv4Addr::from(0xc633_6400 + i).to_string())
            .collect();
        let batch: Vec<NewEntry> = addrs.iter().map(|a| new_entry(a, "bulk", now)).collect();

        let inserted: usize = std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for _ in 0..3 {
                handles.push(scope.spawn(|| store.insert_many(ListKind::Blacklist, &batch).unwrap()));
                handles.push(scope.spawn(|| {
                    addrs
                        .iter()
                        .rev()
                        .filter(|a| {
                            store.insert(ListKind::Blacklist, a, "single", None, None).unwrap()
                                == InsertOutcome::Inserted
                        })
                        .count()
                }));
            }
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(inserted, addrs.len());
        assert_eq!(store.count(ListKind::Blacklist).unwrap(), addrs.len());
        let rows = store.list(ListKind::Blacklist, &ListFilter::default()).unwrap();
        let distinct: std::collections::BTreeSet<&str> = rows.iter().map(|r| r.ip_or_cidr.as_str()).collect();
        assert_eq!(distinct.len(), rows.len());
    }

    #[test]
    fn test_effective_blacklist_suppresses_whitelist() {
        let store = store();
        store.insert(ListKind::Blacklist, "1.1.1.1", "a", None, None).unwrap();
        store.insert(ListKind::Blacklist, "2.2.2.2", "a", None, None).unwrap();
        store.insert(ListKind::Whitelist, "2.2.2.2", "b", None, None).unwrap();

        let effective = store.effective_blacklist(&ListFilter::default()).unwrap();
        assert_eq!(ips(&effective), vec!["1.1.1.1"]);

        // Both raw rows persist
        let raw = store.list(ListKind::Blacklist, &ListFilter::default()).unwrap();
        assert_eq!(raw.len(), 2);
    }

    #[test]
    fn test_effective_blacklist_whitelist_range_covers_host() {
        let store = store();
        store.insert(ListKind::Blacklist, "192.168.1.7", "a", None, None).unwrap();
        store.insert(ListKind::Blacklist, "8.8.8.8", "a", None, None).unwrap();
        store.insert(ListKind::Whitelist, "192.168.0.0/16", "b", None, None).unwrap();

        let effective = store.effective_blacklist(&ListFilter::default()).unwrap();
        assert_eq!(ips(&effective), vec!["8.8.8.8"]);
    }

    #[test]
    fn test_effective_blacklist_carves_range_around_whitelisted_host() {
        let store = store();
        store.insert(ListKind::Blacklist, "10.0.0.0/30", "a", Some("r"), None).unwrap();
        store.insert(ListKind::Whitelist, "10.0.0.1", "b", None, None).unwrap();

        let effective = store.effective_blacklist(&ListFilter::default()).unwrap();
        assert_eq!(ips(&effective), vec!["10.0.0.0", "10.0.0.2/31"]);
        assert!(effective.iter().all(|e| e.reason.as_deref() == Some("r")));
    }

    #[test]
    fn test_effective_blacklist_source_filter() {
        let store = store();
        store.insert(ListKind::Blacklist, "1.1.1.1", "fail2ban", None, None).unwrap();
        store.insert(ListKind::Blacklist, "2.2.2.2", "blocklist.de", None, None).unwrap();

        let effective = store
            .effective_blacklist(&ListFilter::by_source("fail2ban"))
            .unwrap();
        assert_eq!(ips(&effective), vec!["1.1.1.1"]);
    }

    #[test]
    fn test_insertion_order_and_address_order() {
        let store = store();
        for ip in ["9.9.9.9", "::1", "1.1.1.1", "5.5.5.5"] {
            store.insert(ListKind::Blacklist, ip, "a", None, None).unwrap();
        }

        let by_insertion = store.list(ListKind::Blacklist, &ListFilter::default()).unwrap();
        assert_eq!(ips(&by_insertion), vec!["9.9.9.9", "::1", "1.1.1.1", "5.5.5.5"]);

        let filter = ListFilter::default().ordered(ListOrder::Address);
        let by_address = store.list(ListKind::Blacklist, &filter).unwrap();
        assert_eq!(ips(&by_address), vec!["1.1.1.1", "5.5.5.5", "9.9.9.9", "::1"]);
    }

    #[test]
    fn test_date_range_filter() {
        let store = store();
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        store
            .insert_many(
                ListKind::Whitelist,
                &[new_entry("1.1.1.1", "a", early), new_entry("2.2.2.2", "a", late)],
            )
            .unwrap();

        let filter = ListFilter {
            from: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            ..ListFilter::default()
        };
        assert_eq!(ips(&store.list(ListKind::Whitelist, &filter).unwrap()), vec!["2.2.2.2"]);

        let filter = ListFilter {
            to: Some(early),
            ..ListFilter::default()
        };
        assert_eq!(ips(&store.list(ListKind::Whitelist, &filter).unwrap()), vec!["1.1.1.1"]);
    }

    #[test]
    fn test_batch_shares_timestamp() {
        let store = store();
        let ts = Utc.with_ymd_and_hms(2024, 2, 2, 2, 2, 2).unwrap();
        store
            .insert_many(
                ListKind::Blacklist,
                &[new_entry("1.1.1.1", "a", ts), new_entry("1.1.1.2", "a", ts)],
            )
            .unwrap();
        let rows = store.list(ListKind::Blacklist, &ListFilter::default()).unwrap();
        assert!(rows.iter().all(|r| r.added_at == ts));
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lists.db");
        {
            let store = ListStore::open(&path).unwrap();
            store.insert(ListKind::Blacklist, "1.2.3.4", "a", None, None).unwrap();
        }
        let reopened = ListStore::open(&path).unwrap();
        assert_eq!(reopened.count(ListKind::Blacklist).unwrap(), 1);
    }

    #[test]
    fn test_carve_excludes_nested_range() {
        let net: IpNet = "10.0.0.0/24".parse().unwrap();
        let hole: IpNet = "10.0.0.128/25".parse().unwrap();
        assert_eq!(carve(net, &[hole]), vec!["10.0.0.0/25".parse::<IpNet>().unwrap()]);
    }

    #[test]
    fn test_covers_mixed_families() {
        let v4: IpNet = "0.0.0.0/0".parse().unwrap();
        let v6: IpNet = "::1/128".parse().unwrap();
        assert!(!covers(&v4, &v6));
    }
}
