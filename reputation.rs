//! Reputation scoring and ban persistence (§3 ReputationDelta/BanRecord,
//! §4.C). In-memory cache backed by atomic-rename file persistence, in the
//! style of node-state persistence via a `Store` abstraction, but adapted
//! here to the crate's own `data_dir` since the persistent key/data store is
//! an external collaborator (§1) rather than something this crate can reach
//! into.

use std::collections::HashMap;
use std::io::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::types::{now_unix, BanRecord, BanTarget, NodeId, ReputationDelta, REPUTATION_DEAD_THRESHOLD, REPUTATION_DEFAULT, REPUTATION_MAX, REPUTATION_MIN};

const REPUTATION_FILE: &str = "reputation.dat";
const BANS_FILE: &str = "bans.dat";
const DECAY_STEP: i32 = 5;
const DECAY_INTERVAL_SECS: u64 = 24 * 3600;

#[derive(Debug, thiserror::Error)]
pub enum ReputationError {
    #[error("io error persisting {file}: {source}")]
    Io {
        file: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt record in {0}")]
    Corrupt(&'static str),
}

struct ScoreEntry {
    score: i32,
    last_decay: u64,
}

struct OffenseHistory {
    /// Offenses within the rolling 30-day window, most recent last.
    timestamps: Vec<u64>,
}

const OFFENSE_WINDOW_SECS: u64 = 30 * 86_400;

struct Inner {
    scores: HashMap<NodeId, ScoreEntry>,
    bans: HashMap<BanTarget, BanRecord>,
    offenses: HashMap<BanTarget, OffenseHistory>,
    whitelist: std::collections::HashSet<IpAddr>,
    dirty: bool,
}

/// Persistent, disk-backed reputation and ban store. The in-memory table is
/// authoritative; `checkpoint` flushes it to `data_dir` on an atomic
/// rename-after-write schedule driven by the scheduler (§4.C: every 60s when
/// dirty).
pub struct ReputationStore {
    data_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl ReputationStore {
    /// Loads `reputation.dat`/`bans.dat` from `data_dir`, falling back to the
    /// `.bak` companion on a corrupt primary, and to an empty store (with a
    /// warning) if neither is readable.
    pub fn load(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let scores = load_scores(&data_dir).unwrap_or_else(|| {
            debug!("no reputation store found, starting empty");
            HashMap::new()
        });
        let bans = load_bans(&data_dir).unwrap_or_else(|| {
            debug!("no ban store found, starting empty");
            HashMap::new()
        });
        ReputationStore {
            data_dir,
            inner: Mutex::new(Inner {
                scores,
                bans,
                offenses: HashMap::new(),
                whitelist: std::collections::HashSet::new(),
                dirty: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("reputation store mutex poisoned")
    }

    pub fn score(&self, id: &NodeId) -> i32 {
        self.lock()
            .scores
            .get(id)
            .map(|e| e.score)
            .unwrap_or(REPUTATION_DEFAULT)
    }

    pub fn is_dead(&self, id: &NodeId) -> bool {
        self.score(id) < REPUTATION_DEAD_THRESHOLD
    }

    /// Applies a reputation delta, clamped to `[0, 200]` (§3).
    pub fn apply(&self, id: NodeId, delta: ReputationDelta) -> i32 {
        let mut inner = self.lock();
        let now = now_unix();
        let entry = inner.scores.entry(id).or_insert(ScoreEntry {
            score: REPUTATION_DEFAULT,
            last_decay: now,
        });
        entry.score = (entry.score + delta.value()).clamp(REPUTATION_MIN, REPUTATION_MAX);
        inner.dirty = true;
        entry.score
    }

    /// Pulls every score 5 points toward 100 once per `DECAY_INTERVAL_SECS`
    /// elapsed, prorated for however many intervals have actually passed
    /// since the last decay (§3: "every 24h... moves 5 points toward 100").
    pub fn decay_all(&self) {
        let now = now_unix();
        let mut inner = self.lock();
        for entry in inner.scores.values_mut() {
            let elapsed = now.saturating_sub(entry.last_decay);
            let intervals = elapsed / DECAY_INTERVAL_SECS;
            if intervals == 0 {
                continue;
            }
            for _ in 0..intervals {
                entry.score = step_toward(entry.score, 100, DECAY_STEP);
            }
            entry.last_decay = now;
        }
        inner.dirty = true;
    }

    pub fn whitelist(&self, ip: IpAddr) {
        self.lock().whitelist.insert(ip);
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.lock().whitelist.contains(ip)
    }

    /// Bans `target` for this `reason`, escalating the base duration by
    /// `2^(n-1)` for the `n`-th offense of this kind within the rolling
    /// 30-day window, capped at 30 days (§3, §4.C). Whitelisted IPs are
    /// never banned (§3).
    pub fn ban(&self, target: BanTarget, reason: crate::types::BanReason) {
        if let BanTarget::Ip(ip) = target {
            if self.is_whitelisted(&ip) {
                debug!(%ip, "refusing to ban whitelisted address");
                return;
            }
        }
        let mut inner = self.lock();
        let now = now_unix();
        let history = inner
            .offenses
            .entry(target)
            .or_insert_with(|| OffenseHistory { timestamps: Vec::new() });
        history.timestamps.retain(|&t| now.saturating_sub(t) < OFFENSE_WINDOW_SECS);
        history.timestamps.push(now);
        let offense_count = history.timestamps.len() as u32;

        let base = reason.base_duration_secs();
        let exponent = offense_count.saturating_sub(1).min(20);
        let duration = base
            .saturating_mul(1u64 << exponent)
            .min(30 * 86_400);

        inner.bans.insert(
            target,
            BanRecord {
                target,
                reason,
                offense_count,
                banned_at: now,
                expires_at: now + duration,
            },
        );
        inner.dirty = true;
    }

    pub fn unban(&self, target: BanTarget) {
        let mut inner = self.lock();
        inner.bans.remove(&target);
        inner.dirty = true;
    }

    /// Auto-expires the record in the same call if it has lapsed (§4.C).
    pub fn is_banned(&self, target: BanTarget) -> bool {
        let mut inner = self.lock();
        let now = now_unix();
        if let Some(record) = inner.bans.get(&target) {
            if !record.is_active(now) {
                inner.bans.remove(&target);
                inner.dirty = true;
                return false;
            }
            return true;
        }
        false
    }

    pub fn active_ban_count(&self) -> usize {
        let inner = self.lock();
        let now = now_unix();
        inner.bans.values().filter(|b| b.is_active(now)).count()
    }

    pub fn reputation_histogram(&self) -> Vec<i32> {
        self.lock().scores.values().map(|e| e.score).collect()
    }

    /// Writes both stores to disk if dirty since the last checkpoint, via
    /// `write -> rename -> rename(prior to .bak)`. Persistence failures are
    /// logged and retried on the next tick; the in-memory state stays
    /// authoritative in the meantime (§7 Persistence error policy).
    pub fn checkpoint(&self) -> Result<(), ReputationError> {
        let (scores_snapshot, bans_snapshot, dirty) = {
            let mut inner = self.lock();
            let dirty = inner.dirty;
            inner.dirty = false;
            (
                inner
                    .scores
                    .iter()
                    .map(|(id, e)| (*id, e.score, e.last_decay))
                    .collect::<Vec<_>>(),
                inner.bans.values().cloned().collect::<Vec<_>>(),
                dirty,
            )
        };
        if !dirty {
            return Ok(());
        }
        write_atomic(&self.data_dir, REPUTATION_FILE, &encode_scores(&scores_snapshot))?;
        write_atomic(&self.data_dir, BANS_FILE, &encode_bans(&bans_snapshot))?;
        Ok(())
    }
}

fn step_toward(value: i32, target: i32, step: i32) -> i32 {
    if value == target {
        value
    } else if value < target {
        (value + step).min(target)
    } else {
        (value - step).max(target)
    }
}

fn encode_scores(entries: &[(NodeId, i32, u64)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (id, score, last_decay) in entries {
        buf.extend_from_slice(id.as_bytes());
        buf.extend_from_slice(&score.to_be_bytes());
        buf.extend_from_slice(&last_decay.to_be_bytes());
    }
    buf
}

fn decode_scores(bytes: &[u8]) -> Result<HashMap<NodeId, ScoreEntry>, ReputationError> {
    const RECORD_LEN: usize = 20 + 4 + 8;
    if bytes.len() % RECORD_LEN != 0 {
        return Err(ReputationError::Corrupt(REPUTATION_FILE));
    }
    let mut out = HashMap::new();
    for chunk in bytes.chunks_exact(RECORD_LEN) {
        let mut id = [0u8; 20];
        id.copy_from_slice(&chunk[..20]);
        let score = i32::from_be_bytes(chunk[20..24].try_into().unwrap());
        let last_decay = u64::from_be_bytes(chunk[24..32].try_into().unwrap());
        out.insert(NodeId(id), ScoreEntry { score, last_decay });
    }
    Ok(out)
}

fn encode_bans(records: &[BanRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    for r in records {
        match r.target {
            BanTarget::NodeId(id) => {
                buf.push(0);
                buf.extend_from_slice(id.as_bytes());
            }
            BanTarget::Ip(ip) => {
                buf.push(1);
                match ip {
                    IpAddr::V4(v4) => {
                        buf.push(4);
                        buf.extend_from_slice(&v4.octets());
                        buf.extend_from_slice(&[0u8; 12]);
                    }
                    IpAddr::V6(v6) => {
                        buf.push(6);
                        buf.extend_from_slice(&v6.octets());
                    }
                }
            }
        }
        buf.push(r.reason as u8);
        buf.extend_from_slice(&r.offense_count.to_be_bytes());
        buf.extend_from_slice(&r.banned_at.to_be_bytes());
        buf.extend_from_slice(&r.expires_at.to_be_bytes());
    }
    buf
}

fn decode_bans(bytes: &[u8]) -> Result<HashMap<BanTarget, BanRecord>, ReputationError> {
    let mut out = HashMap::new();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        if cursor + 1 > bytes.len() {
            return Err(ReputationError::Corrupt(BANS_FILE));
        }
        let target_tag = bytes[cursor];
        cursor += 1;
        let target = match target_tag {
            0 => {
                if cursor + 20 > bytes.len() {
                    return Err(ReputationError::Corrupt(BANS_FILE));
                }
                let mut id = [0u8; 20];
                id.copy_from_slice(&bytes[cursor..cursor + 20]);
                cursor += 20;
                BanTarget::NodeId(NodeId(id))
            }
            1 => {
                if cursor + 1 > bytes.len() {
                    return Err(ReputationError::Corrupt(BANS_FILE));
                }
                let family = bytes[cursor];
                cursor += 1;
                if cursor + 16 > bytes.len() {
                    return Err(ReputationError::Corrupt(BANS_FILE));
                }
                let ip = match family {
                    4 => {
                        let mut octets = [0u8; 4];
                        octets.copy_from_slice(&bytes[cursor..cursor + 4]);
                        IpAddr::from(octets)
                    }
                    6 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(&bytes[cursor..cursor + 16]);
                        IpAddr::from(octets)
                    }
                    _ => return Err(ReputationError::Corrupt(BANS_FILE)),
                };
                cursor += 16;
                BanTarget::Ip(ip)
            }
            _ => return Err(ReputationError::Corrupt(BANS_FILE)),
        };
        if cursor + 1 + 4 + 8 + 8 > bytes.len() {
            return Err(ReputationError::Corrupt(BANS_FILE));
        }
        let reason_byte = bytes[cursor];
        cursor += 1;
        let reason = decode_ban_reason(reason_byte)?;
        let offense_count = u32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
        cursor += 4;
        let banned_at = u64::from_be_bytes(bytes[cursor..cursor + 8].try_into().unwrap());
        cursor += 8;
        let expires_at = u64::from_be_bytes(bytes[cursor..cursor + 8].try_into().unwrap());
        cursor += 8;
        out.insert(
            target,
            BanRecord {
                target,
                reason,
                offense_count,
                banned_at,
                expires_at,
            },
        );
    }
    Ok(out)
}

fn decode_ban_reason(byte: u8) -> Result<crate::types::BanReason, ReputationError> {
    use crate::types::BanReason::*;
    Ok(match byte {
        0 => HandshakeFailure,
        1 => ProtocolViolation,
        2 => InvalidSignature,
        3 => NetworkIdMismatch,
        4 => MalformedFrame,
        5 => OversizedMessage,
        6 => DecompressionBomb,
        7 => ExcessiveConnectionAttempts,
        8 => FloodingDiscovery,
        9 => Spoofing,
        10 => DuplicatePeerAbuse,
        11 => ManualBan,
        12 => LowReputation,
        _ => return Err(ReputationError::Corrupt(BANS_FILE)),
    })
}

fn load_scores(dir: &Path) -> Option<HashMap<NodeId, ScoreEntry>> {
    load_with_backup(dir, REPUTATION_FILE, decode_scores)
}

fn load_bans(dir: &Path) -> Option<HashMap<BanTarget, BanRecord>> {
    load_with_backup(dir, BANS_FILE, decode_bans)
}

fn load_with_backup<T>(
    dir: &Path,
    file: &'static str,
    decode: impl Fn(&[u8]) -> Result<T, ReputationError>,
) -> Option<T> {
    let primary = dir.join(file);
    if let Ok(bytes) = std::fs::read(&primary) {
        match decode(&bytes) {
            Ok(value) => return Some(value),
            Err(e) => warn!(file, error = %e, "corrupt store, falling back to .bak"),
        }
    }
    let backup = dir.join(format!("{file}.bak"));
    if let Ok(bytes) = std::fs::read(&backup) {
        match decode(&bytes) {
            Ok(value) => return Some(value),
            Err(e) => warn!(file, error = %e, "backup store also corrupt, starting empty"),
        }
    }
    None
}

/// `write -> fsync -> rename -> fsync(dir)`, keeping the previous file as
/// `<name>.bak` (§6 Persistent state layout).
fn write_atomic(dir: &Path, file: &'static str, bytes: &[u8]) -> Result<(), ReputationError> {
    std::fs::create_dir_all(dir).map_err(|source| ReputationError::Io { file, source })?;
    let target = dir.join(file);
    let backup = dir.join(format!("{file}.bak"));
    let tmp = dir.join(format!("{file}.tmp"));

    let mut f = std::fs::File::create(&tmp).map_err(|source| ReputationError::Io { file, source })?;
    f.write_all(bytes).map_err(|source| ReputationError::Io { file, source })?;
    f.sync_all().map_err(|source| ReputationError::Io { file, source })?;
    drop(f);

    if target.exists() {
        std::fs::rename(&target, &backup).map_err(|source| ReputationError::Io { file, source })?;
    }
    std::fs::rename(&tmp, &target).map_err(|source| ReputationError::Io { file, source })?;

    if let Ok(dir_handle) = std::fs::File::open(dir) {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BanReason;

    #[test]
    fn reputation_bounds_and_dead_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::load(dir.path());
        let id = NodeId::zero();
        for _ in 0..50 {
            store.apply(id, ReputationDelta::PingSuccess);
        }
        assert_eq!(store.score(&id), REPUTATION_MAX);
        for _ in 0..50 {
            store.apply(id, ReputationDelta::PingTimeout);
        }
        assert_eq!(store.score(&id), REPUTATION_MIN);
        assert!(store.is_dead(&id));
    }

    #[test]
    fn ban_graduation_doubles_per_offense() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::load(dir.path());
        let ip = IpAddr::from([10, 0, 0, 1]);
        let target = BanTarget::Ip(ip);
        store.ban(target, BanReason::ProtocolViolation);
        store.ban(target, BanReason::ProtocolViolation);
        store.ban(target, BanReason::ProtocolViolation);
        let record = store.lock().bans.get(&target).cloned().unwrap();
        let base = BanReason::ProtocolViolation.base_duration_secs();
        assert_eq!(record.expires_at - record.banned_at, base * 4);
        assert_eq!(record.offense_count, 3);
    }

    #[test]
    fn whitelisted_ip_is_never_banned() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::load(dir.path());
        let ip = IpAddr::from([10, 0, 0, 2]);
        store.whitelist(ip);
        store.ban(BanTarget::Ip(ip), BanReason::InvalidSignature);
        assert!(!store.is_banned(BanTarget::Ip(ip)));
    }

    #[test]
    fn ban_auto_expires() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::load(dir.path());
        let target = BanTarget::Ip(IpAddr::from([10, 0, 0, 3]));
        {
            let mut inner = store.lock();
            inner.bans.insert(
                target,
                BanRecord {
                    target,
                    reason: BanReason::MalformedFrame,
                    offense_count: 1,
                    banned_at: 0,
                    expires_at: 1,
                },
            );
        }
        assert!(!store.is_banned(target));
    }

    #[test]
    fn decay_moves_score_five_points_toward_100_per_elapsed_day() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::load(dir.path());
        let low = NodeId([1u8; 20]);
        let high = NodeId([2u8; 20]);
        store.apply(low, ReputationDelta::PingTimeout);
        store.apply(high, ReputationDelta::PingSuccess);
        {
            let mut inner = store.lock();
            inner.scores.get_mut(&low).unwrap().score = 40;
            inner.scores.get_mut(&low).unwrap().last_decay = now_unix() - DECAY_INTERVAL_SECS;
            inner.scores.get_mut(&high).unwrap().score = 150;
            inner.scores.get_mut(&high).unwrap().last_decay = now_unix() - DECAY_INTERVAL_SECS;
        }
        store.decay_all();
        assert_eq!(store.score(&low), 45);
        assert_eq!(store.score(&high), 145);
    }

    #[test]
    fn checkpoint_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let id = NodeId::zero();
        {
            let store = ReputationStore::load(dir.path());
            store.apply(id, ReputationDelta::PingSuccess);
            store.ban(BanTarget::Ip(IpAddr::from([1, 2, 3, 4])), BanReason::Spoofing);
            store.checkpoint().unwrap();
        }
        let reloaded = ReputationStore::load(dir.path());
        assert_eq!(reloaded.score(&id), REPUTATION_DEFAULT + 5);
        assert!(reloaded.is_banned(BanTarget::Ip(IpAddr::from([1, 2, 3, 4]))));
    }
}
