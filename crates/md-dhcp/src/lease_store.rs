use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::allocator::{AllocError, BitmapAllocator};
use crate::config::{Pool, Role};
use crate::hwaddr::MacAddr;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("no subnet pools configured")]
    NoPools,
    #[error("invalid pool {role}: {source}")]
    InvalidPool {
        role: Role,
        #[source]
        source: AllocError,
    },
    #[error("failed to open lease log {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed lease log line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("no pool at index {0}")]
    UnknownPool(usize),
    #[error("pool {role} has no free address")]
    AllocationExhausted { role: Role },
    #[error("failed to persist lease for {mac}: {source}")]
    Persistence {
        mac: MacAddr,
        #[source]
        source: std::io::Error,
    },
}

/// One lease record, as kept in memory and in the lease log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    /// Absolute expiry, Unix seconds.
    pub expiry: u64,
    pub role: Role,
}

impl Lease {
    /// Log line: `<mac> <ip> <expiry> <role>\n`.
    pub fn to_line(&self) -> String {
        format!("{} {} {} {}\n", self.mac, self.ip, self.expiry, self.role)
    }

    fn parse_line(line_no: usize, line: &str) -> Result<Self, LeaseError> {
        let malformed = |reason: String| LeaseError::Malformed {
            line: line_no,
            reason,
        };

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [mac, ip, expiry, role] = tokens.as_slice() else {
            return Err(malformed(format!(
                "want 4 fields, got {}: {line}",
                tokens.len()
            )));
        };

        Ok(Self {
            mac: mac
                .parse()
                .map_err(|_| malformed(format!("malformed hardware address: {mac}")))?,
            ip: ip
                .parse()
                .map_err(|_| malformed(format!("expected an IPv4 address, got: {ip}")))?,
            expiry: expiry
                .parse()
                .map_err(|_| malformed(format!("expected a unix timestamp, got: {expiry}")))?,
            role: role
                .parse()
                .map_err(|_| malformed(format!("unknown role: {role}")))?,
        })
    }

    pub fn remaining_secs(&self, now: SystemTime) -> u64 {
        self.expiry.saturating_sub(unix_secs(now))
    }
}

/// Result of a successful assign/extend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub ip: Ipv4Addr,
    pub lease_time: Duration,
    pub expiry: u64,
}

struct LeaseState {
    records: HashMap<MacAddr, Lease>,
    allocators: Vec<BitmapAllocator>,
    log: File,
}

/// Authoritative MAC → lease table, the per-pool bitmaps and the
/// append-only lease log, all behind one lock.
pub struct LeaseStore {
    pools: Vec<Pool>,
    path: PathBuf,
    state: Mutex<LeaseState>,
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// `t + d` as Unix seconds, rounded to the nearest whole second.
fn rounded_unix_secs(t: SystemTime, d: Duration) -> u64 {
    let at = t.duration_since(UNIX_EPOCH).unwrap_or_default() + d;
    at.as_secs() + u64::from(at.subsec_millis() >= 500)
}

/// Rebuild the table from log lines. A later line for a MAC supersedes the
/// earlier one; a later line for an address held by another MAC evicts that
/// MAC, so no address is ever held twice.
fn replay(content: &str) -> Result<HashMap<MacAddr, Lease>, LeaseError> {
    let mut records: HashMap<MacAddr, Lease> = HashMap::new();
    let mut holders: HashMap<Ipv4Addr, MacAddr> = HashMap::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let lease = Lease::parse_line(index + 1, line)?;

        if let Some(previous) = records.get(&lease.mac) {
            if previous.ip != lease.ip && holders.get(&previous.ip) == Some(&lease.mac) {
                holders.remove(&previous.ip);
            }
        }
        if let Some(holder) = holders.insert(lease.ip, lease.mac) {
            if holder != lease.mac {
                warn!(
                    "Lease log line {} gives {} to {}, already held by {}; dropping {}",
                    index + 1,
                    lease.ip,
                    lease.mac,
                    holder,
                    holder
                );
                records.remove(&holder);
            }
        }
        records.insert(lease.mac, lease);
    }
    Ok(records)
}

impl LeaseStore {
    /// Build the allocators for `pools`, then replay the lease log at `path`
    /// (created empty if missing) to rebuild the table and the bitmaps.
    pub fn open(pools: Vec<Pool>, path: impl AsRef<Path>) -> Result<Self, LeaseError> {
        if pools.is_empty() {
            return Err(LeaseError::NoPools);
        }
        let path = path.as_ref().to_path_buf();

        let mut allocators = pools
            .iter()
            .map(|pool| {
                BitmapAllocator::new(pool.start, pool.stop).map_err(|source| {
                    LeaseError::InvalidPool {
                        role: pool.role,
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let open_err = |source| LeaseError::Open {
            path: path.clone(),
            source,
        };
        let mut log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(open_err)?;
        let mut content = String::new();
        log.read_to_string(&mut content).map_err(open_err)?;

        let records = replay(&content)?;

        for lease in records.values() {
            let own_pool = pools.iter().position(|p| p.role == lease.role);
            let marked = own_pool.is_some_and(|i| allocators[i].mark(lease.ip))
                || allocators.iter_mut().any(|a| a.mark(lease.ip));
            if !marked {
                warn!(
                    "Lease {} -> {} lies outside every configured pool",
                    lease.mac, lease.ip
                );
            }
        }

        info!("Loaded {} DHCPv4 leases from {}", records.len(), path.display());

        Ok(Self {
            pools,
            path,
            state: Mutex::new(LeaseState {
                records,
                allocators,
                log,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub fn pool(&self, index: usize) -> Option<&Pool> {
        self.pools.get(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pool index for `mac`: the pool of its recorded role, or 0 for
    /// unknown clients.
    pub fn classify(&self, mac: MacAddr) -> usize {
        let state = self.lock();
        state
            .records
            .get(&mac)
            .and_then(|lease| self.pools.iter().position(|p| p.role == lease.role))
            .unwrap_or(0)
    }

    pub fn assign_or_extend(&self, mac: MacAddr, pool_index: usize) -> Result<Assignment, LeaseError> {
        self.assign_or_extend_at(mac, pool_index, SystemTime::now())
    }

    /// Allocate a new lease for an unseen `mac`, or extend an existing one
    /// so it covers at least one full lease period from `now`.
    ///
    /// The log line is written and synced before the table changes; if that
    /// fails the table (and bitmap) are left exactly as they were.
    pub fn assign_or_extend_at(
        &self,
        mac: MacAddr,
        pool_index: usize,
        now: SystemTime,
    ) -> Result<Assignment, LeaseError> {
        let pool = self
            .pools
            .get(pool_index)
            .ok_or(LeaseError::UnknownPool(pool_index))?;
        let target = rounded_unix_secs(now, pool.lease_time);

        let mut guard = self.lock();
        let state = &mut *guard;

        let lease = match state.records.get(&mac) {
            None => {
                debug!("MAC address {} is new, leasing new IPv4 address", mac);
                let ip = state.allocators[pool_index]
                    .allocate()
                    .map_err(|_| LeaseError::AllocationExhausted { role: pool.role })?;
                let lease = Lease {
                    mac,
                    ip,
                    expiry: target,
                    role: pool.role,
                };
                if let Err(source) = append(&mut state.log, &lease) {
                    state.allocators[pool_index].release(ip);
                    return Err(LeaseError::Persistence { mac, source });
                }
                state.records.insert(mac, lease.clone());
                lease
            }
            Some(existing) if existing.expiry < target => {
                let lease = Lease {
                    expiry: target,
                    ..existing.clone()
                };
                append(&mut state.log, &lease)
                    .map_err(|source| LeaseError::Persistence { mac, source })?;
                state.records.insert(mac, lease.clone());
                lease
            }
            Some(existing) => existing.clone(),
        };

        Ok(Assignment {
            ip: lease.ip,
            lease_time: pool.lease_time,
            expiry: lease.expiry,
        })
    }

    pub fn get(&self, mac: MacAddr) -> Option<Lease> {
        self.lock().records.get(&mac).cloned()
    }

    /// Snapshot of all records, ordered by address.
    pub fn records(&self) -> Vec<Lease> {
        let mut records: Vec<Lease> = self.lock().records.values().cloned().collect();
        records.sort_by_key(|l| (l.ip, l.mac));
        records
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw lease log contents.
    pub fn raw_log(&self) -> std::io::Result<String> {
        std::fs::read_to_string(&self.path)
    }
}

/// Append one line and sync it. On failure the log is cut back to its
/// previous length so a torn line never reaches the next replay.
fn append(log: &mut File, lease: &Lease) -> std::io::Result<()> {
    let previous_len = log.metadata()?.len();
    let written = log
        .write_all(lease.to_line().as_bytes())
        .and_then(|()| log.sync_data());
    if let Err(e) = written {
        truncate_to(log, previous_len);
        return Err(e);
    }
    Ok(())
}

fn truncate_to(log: &File, len: u64) {
    if let Err(e) = log.set_len(len).and_then(|()| log.sync_data()) {
        warn!("Failed to trim lease log back to {} bytes: {}", len, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn pool(role: Role, start: u8, stop: u8, secs: u64) -> Pool {
        Pool {
            role,
            start: Ipv4Addr::new(192, 168, 0, start),
            stop: Ipv4Addr::new(192, 168, 0, stop),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            router: Some(Ipv4Addr::new(192, 168, 0, 1)),
            dns: Some(Ipv4Addr::new(192, 168, 0, 2)),
            lease_time: Duration::from_secs(secs),
        }
    }

    fn pools() -> Vec<Pool> {
        vec![
            pool(Role::Guest, 10, 20, 60),
            pool(Role::Staff, 100, 110, 3600),
        ]
    }

    fn store_in(dir: &TempDir) -> LeaseStore {
        LeaseStore::open(pools(), dir.path().join("lease.txt")).unwrap()
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_open_creates_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.is_empty());
        assert!(dir.path().join("lease.txt").exists());
        assert_eq!(store.raw_log().unwrap(), "");
    }

    #[test]
    fn test_open_rejects_bad_pools() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.txt");
        assert!(matches!(
            LeaseStore::open(vec![], &path),
            Err(LeaseError::NoPools)
        ));
        assert!(matches!(
            LeaseStore::open(vec![pool(Role::Guest, 20, 10, 60)], &path),
            Err(LeaseError::InvalidPool { role: Role::Guest, .. })
        ));
    }

    #[test]
    fn test_unknown_mac_classifies_to_pool_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.classify(mac(1)), 0);
    }

    #[test]
    fn test_classify_uses_recorded_role() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.txt");
        std::fs::write(&path, "aa:bb:cc:dd:ee:01 192.168.0.100 4000000000 staff\n").unwrap();

        let store = LeaseStore::open(pools(), &path).unwrap();
        assert_eq!(store.classify(mac(1)), 1);
    }

    #[test]
    fn test_new_leases_are_sequential_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let first = store.assign_or_extend_at(mac(1), 0, at(1000)).unwrap();
        let second = store.assign_or_extend_at(mac(2), 0, at(1000)).unwrap();
        assert_eq!(first.ip, Ipv4Addr::new(192, 168, 0, 10));
        assert_eq!(second.ip, Ipv4Addr::new(192, 168, 0, 11));
        assert_eq!(first.lease_time, Duration::from_secs(60));
        assert_eq!(first.expiry, 1060);

        assert_eq!(
            store.raw_log().unwrap(),
            "aa:bb:cc:dd:ee:01 192.168.0.10 1060 guest\n\
             aa:bb:cc:dd:ee:02 192.168.0.11 1060 guest\n"
        );
    }

    #[test]
    fn test_renewal_keeps_address_and_never_shrinks_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let first = store.assign_or_extend_at(mac(1), 0, at(1000)).unwrap();
        let mut last_expiry = first.expiry;
        for t in [1000, 1010, 1005, 1030, 1030] {
            let renewed = store.assign_or_extend_at(mac(1), 0, at(t)).unwrap();
            assert_eq!(renewed.ip, first.ip);
            assert!(renewed.expiry >= last_expiry);
            last_expiry = renewed.expiry;
        }
        assert_eq!(last_expiry, 1090);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unchanged_renewal_is_not_logged() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.assign_or_extend_at(mac(1), 0, at(1000)).unwrap();
        store.assign_or_extend_at(mac(1), 0, at(1000)).unwrap();
        store.assign_or_extend_at(mac(1), 0, at(1001)).unwrap();
        assert_eq!(store.raw_log().unwrap().lines().count(), 2);
    }

    #[test]
    fn test_expiry_rounds_to_whole_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let now = at(1000) + Duration::from_millis(600);
        let a = store.assign_or_extend_at(mac(1), 0, now).unwrap();
        assert_eq!(a.expiry, 1061);
    }

    #[test]
    fn test_exhaustion_leaves_table_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            LeaseStore::open(vec![pool(Role::Guest, 10, 10, 60)], dir.path().join("l")).unwrap();

        store.assign_or_extend_at(mac(1), 0, at(1000)).unwrap();
        let err = store.assign_or_extend_at(mac(2), 0, at(1000)).unwrap_err();
        assert!(matches!(err, LeaseError::AllocationExhausted { role: Role::Guest }));
        assert!(store.get(mac(2)).is_none());
        assert_eq!(store.raw_log().unwrap().lines().count(), 1);
    }

    #[test]
    fn test_unknown_pool_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(matches!(
            store.assign_or_extend(mac(1), 7),
            Err(LeaseError::UnknownPool(7))
        ));
    }

    #[test]
    fn test_persistence_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.txt");
        let store = LeaseStore::open(pools(), &path).unwrap();
        store.assign_or_extend_at(mac(1), 0, at(1000)).unwrap();

        // Swap in a read-only handle so every append fails.
        store.lock().log = File::open(&path).unwrap();

        let err = store.assign_or_extend_at(mac(2), 0, at(1000)).unwrap_err();
        assert!(matches!(err, LeaseError::Persistence { .. }));
        assert!(store.get(mac(2)).is_none());

        let err = store.assign_or_extend_at(mac(1), 0, at(2000)).unwrap_err();
        assert!(matches!(err, LeaseError::Persistence { .. }));
        assert_eq!(store.get(mac(1)).unwrap().expiry, 1060);

        // The address taken by the failed allocation went back to the pool.
        let state = store.lock();
        assert!(!state.allocators[0].is_allocated(Ipv4Addr::new(192, 168, 0, 11)));
    }

    #[test]
    fn test_restart_reproduces_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.txt");

        let before = {
            let store = LeaseStore::open(pools(), &path).unwrap();
            for i in 1..=5 {
                store.assign_or_extend_at(mac(i), 0, at(1000)).unwrap();
            }
            store.assign_or_extend_at(mac(9), 1, at(1000)).unwrap();
            store.assign_or_extend_at(mac(1), 0, at(1500)).unwrap();
            store.records()
        };

        let reopened = LeaseStore::open(pools(), &path).unwrap();
        assert_eq!(reopened.records(), before);
        assert_eq!(reopened.get(mac(1)).unwrap().expiry, 1560);
        assert_eq!(reopened.classify(mac(9)), 1);

        // Rebuilt bitmap: the next new client skips every replayed address.
        let next = reopened.assign_or_extend_at(mac(6), 0, at(1600)).unwrap();
        assert_eq!(next.ip, Ipv4Addr::new(192, 168, 0, 15));
    }

    #[test]
    fn test_malformed_log_lines_fail_startup() {
        let cases = [
            "aa:bb:cc:dd:ee:01 192.168.0.10 1060\n",
            "aa:bb:cc:dd:ee 192.168.0.10 1060 guest\n",
            "aa:bb:cc:dd:ee:01 fe80::1 1060 guest\n",
            "aa:bb:cc:dd:ee:01 192.168.0.10 soon guest\n",
            "aa:bb:cc:dd:ee:01 192.168.0.10 1060 admin\n",
            "aa:bb:cc:dd:ee:01 192.168.0.10 1060 guest extra\n",
        ];
        for content in cases {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("lease.txt");
            std::fs::write(&path, format!("aa:bb:cc:dd:ee:02 192.168.0.11 1 guest\n{content}"))
                .unwrap();
            match LeaseStore::open(pools(), &path) {
                Err(LeaseError::Malformed { line, .. }) => assert_eq!(line, 2, "{content}"),
                other => panic!("expected malformed error for {content:?}, got {:?}", other.err()),
            }
        }
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.txt");
        std::fs::write(&path, "\naa:bb:cc:dd:ee:01 192.168.0.10 1060 guest\n\n").unwrap();
        let store = LeaseStore::open(pools(), &path).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_torn_append_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.txt");
        let store = LeaseStore::open(pools(), &path).unwrap();
        store.assign_or_extend_at(mac(1), 0, at(1000)).unwrap();

        {
            let mut state = store.lock();
            let len = state.log.metadata().unwrap().len();
            state.log.write_all(b"aa:bb:cc:dd:ee:02 192.16").unwrap();
            truncate_to(&state.log, len);
        }

        assert_eq!(
            store.raw_log().unwrap(),
            "aa:bb:cc:dd:ee:01 192.168.0.10 1060 guest\n"
        );
        let reopened = LeaseStore::open(pools(), &path).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_replay_never_gives_one_address_to_two_macs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.txt");

        // Two stores over one log allocate independently.
        let first = LeaseStore::open(pools(), &path).unwrap();
        let second = LeaseStore::open(pools(), &path).unwrap();
        let a = first.assign_or_extend_at(mac(1), 0, at(1000)).unwrap();
        let b = second.assign_or_extend_at(mac(2), 0, at(1000)).unwrap();
        assert_eq!(a.ip, b.ip);

        let reopened = LeaseStore::open(pools(), &path).unwrap();
        assert!(reopened.get(mac(1)).is_none());
        assert_eq!(reopened.get(mac(2)).unwrap().ip, Ipv4Addr::new(192, 168, 0, 10));

        let again = reopened.assign_or_extend_at(mac(1), 0, at(1100)).unwrap();
        assert_eq!(again.ip, Ipv4Addr::new(192, 168, 0, 11));
    }

    #[test]
    fn test_replay_frees_address_a_mac_moved_away_from() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.txt");
        std::fs::write(
            &path,
            "aa:bb:cc:dd:ee:01 192.168.0.10 1060 guest\n\
             aa:bb:cc:dd:ee:01 192.168.0.12 1070 guest\n\
             aa:bb:cc:dd:ee:02 192.168.0.10 1080 guest\n",
        )
        .unwrap();

        let store = LeaseStore::open(pools(), &path).unwrap();
        assert_eq!(store.get(mac(1)).unwrap().ip, Ipv4Addr::new(192, 168, 0, 12));
        assert_eq!(store.get(mac(2)).unwrap().ip, Ipv4Addr::new(192, 168, 0, 10));
    }

    #[test]
    fn test_remaining_secs() {
        let lease = Lease {
            mac: mac(1),
            ip: Ipv4Addr::new(192, 168, 0, 10),
            expiry: 1060,
            role: Role::Guest,
        };
        assert_eq!(lease.remaining_secs(at(1000)), 60);
        assert_eq!(lease.remaining_secs(at(2000)), 0);
    }

    #[test]
    fn test_concurrent_assignments_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(store_in(&dir));

        let handles: Vec<_> = (1..=11)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.assign_or_extend(mac(i), 0).unwrap().ip)
            })
            .collect();
        let mut ips: Vec<Ipv4Addr> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ips.sort();
        ips.dedup();
        assert_eq!(ips.len(), 11);
        assert!(store.assign_or_extend(mac(12), 0).is_err());
    }
}
