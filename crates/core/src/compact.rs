//! Tiered compaction of the inactive log file.
//!
//! Patches older than the cutoff are dropped -- history beyond the cutoff
//! degrades to snapshot granularity. Snapshots are grouped by commit and
//! assigned to logarithmic retention tiers by age: everything within the
//! cutoff survives, and each tier beyond it (spanning
//! `base_interval * multiplier^k`) keeps at most `slots_per_tier` groups,
//! preferring the most recent. The snapshot at the active schema's commit
//! is pinned; aborted schema markers are always discarded and stale
//! pending markers with them.
//!
//! Execution: collect surviving positions, rewrite the file in place (the
//! log layer bumps its generation), then remove-and-re-add every
//! surviving index segment with its new position and generation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use logd_dlog::{LogEntry, SchemaState};
use logd_value::KindedPath;

use crate::error::{Error, Result};
use crate::schema::SchemaTracker;
use crate::segment::SegmentRef;
use crate::state::StateCtx;

#[derive(Clone, Copy, Debug)]
pub struct CompactionConfig {
    /// Patches younger than this always survive; older ones are dropped.
    pub cutoff: Duration,
    /// Width of retention tier 0; tier `k` spans `base_interval *
    /// multiplier^k`.
    pub base_interval: Duration,
    /// Snapshot groups kept per tier beyond the cutoff.
    pub slots_per_tier: usize,
    pub multiplier: u32,
    /// How long the pre-compaction physical file lingers for late readers.
    pub grace_period: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            cutoff: Duration::from_secs(60 * 60),
            base_interval: Duration::from_secs(60 * 60),
            slots_per_tier: 4,
            multiplier: 2,
            grace_period: logd_dlog::DEFAULT_GRACE,
        }
    }
}

impl CompactionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 2 {
            return Err(Error::invalid("compaction multiplier must be at least 2"));
        }
        if self.slots_per_tier == 0 {
            return Err(Error::invalid("compaction needs at least one slot per tier"));
        }
        if self.cutoff.is_zero() || self.base_interval.is_zero() {
            return Err(Error::invalid(
                "compaction cutoff and base interval must be positive",
            ));
        }
        Ok(())
    }

    /// Retention tier of a snapshot group `age` old. `None` means within
    /// the cutoff (tier -1, keep unconditionally).
    fn tier(&self, age: Duration) -> Option<u32> {
        let excess = age.checked_sub(self.cutoff)?;
        let ratio = excess.as_secs_f64() / self.base_interval.as_secs_f64();
        // Tier k spans base*multiplier^k, so the boundary below age k is
        // the geometric series sum; inverting it gives the tier index.
        let m = self.multiplier as f64;
        let k = ((ratio * (m - 1.0)) + 1.0).log(m).floor();
        Some(k.max(0.0) as u32)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionOutcome {
    pub records_kept: usize,
    pub records_dropped: usize,
    pub segments_removed: usize,
}

pub(crate) fn run(
    ctx: &StateCtx<'_>,
    schema: &SchemaTracker,
    config: &CompactionConfig,
    now: DateTime<Utc>,
) -> Result<CompactionOutcome> {
    config.validate()?;
    let file = ctx.dlog.active().other();
    debug!(
        "compacting {file}: cutoff {}, base interval {}, {} slot(s)/tier",
        humantime::format_duration(config.cutoff),
        humantime::format_duration(config.base_interval),
        config.slots_per_tier
    );
    let segments = ctx.index.segments_in_file(file);

    // One record per position; several segments can share it.
    let mut records: BTreeMap<u64, (LogEntry, Vec<Arc<SegmentRef>>)> = BTreeMap::new();
    for seg in segments {
        match records.entry(seg.pos) {
            std::collections::btree_map::Entry::Occupied(mut have) => {
                have.get_mut().1.push(seg)
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                let entry = ctx.dlog.read_entry_at(seg.file, seg.pos, seg.generation)?;
                slot.insert((entry, vec![seg]));
            }
        }
    }

    let active_schema = schema.active();
    let pending_schema = schema.pending();

    // Patch retention is a pure age check; snapshots go through grouping.
    let mut keep: Vec<u64> = Vec::new();
    let mut snapshot_groups: BTreeMap<u64, Vec<(u64, &LogEntry)>> = BTreeMap::new();
    for (pos, (entry, _)) in &records {
        if !entry.is_snapshot() {
            let age = age_of(now, entry);
            if age <= config.cutoff {
                keep.push(*pos);
            }
            continue;
        }
        match &entry.schema {
            Some(marker) if marker.state == SchemaState::Aborted => continue,
            Some(marker) if marker.state == SchemaState::Pending => {
                let still_pending = pending_schema
                    .as_ref()
                    .is_some_and(|p| p.schema == marker.schema && p.commit == entry.commit);
                if !still_pending {
                    continue;
                }
            }
            _ => {}
        }
        snapshot_groups.entry(entry.commit).or_default().push((*pos, entry));
    }

    // Tier assignment per snapshot group.
    let mut tiers: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
    for (commit, members) in &snapshot_groups {
        let pinned = active_schema.as_ref().is_some_and(|a| a.commit == *commit);
        let age = members
            .iter()
            .map(|(_, entry)| age_of(now, entry))
            .min()
            .unwrap_or_default();
        if pinned || config.tier(age).is_none() {
            keep.extend(members.iter().map(|(pos, _)| *pos));
        } else if let Some(tier) = config.tier(age) {
            tiers.entry(tier).or_default().push(*commit);
        }
    }
    for (tier, mut commits) in tiers {
        commits.sort_unstable();
        let cut = commits.len().saturating_sub(config.slots_per_tier);
        for commit in commits.drain(cut..) {
            keep.extend(snapshot_groups[&commit].iter().map(|(pos, _)| *pos));
        }
        debug!("compaction tier {tier}: kept newest {} group(s)", config.slots_per_tier);
    }

    keep.sort_unstable();
    keep.dedup();

    let mapping = ctx.dlog.compact_inactive(&keep, config.grace_period)?;
    let moved: HashMap<u64, u64> = mapping.into_iter().collect();
    let generation = ctx.dlog.generation(file);

    // Remove-and-re-add every segment of the file: survivors come back at
    // their new position under the new generation, the rest disappear.
    let mut outcome = CompactionOutcome::default();
    let mut newest_surviving_snapshot: Option<u64> = None;
    for (pos, (entry, segs)) in records {
        match moved.get(&pos) {
            Some(new_pos) => {
                outcome.records_kept += 1;
                if entry.is_snapshot() && entry.scope.is_none() {
                    newest_surviving_snapshot =
                        newest_surviving_snapshot.max(Some(entry.commit));
                }
                for seg in segs {
                    ctx.index.remove(&seg);
                    ctx.index.add(SegmentRef {
                        pos: *new_pos,
                        generation,
                        ..(*seg).clone()
                    });
                }
            }
            None => {
                outcome.records_dropped += 1;
                for seg in segs {
                    ctx.index.remove(&seg);
                    outcome.segments_removed += 1;
                }
            }
        }
    }

    // Seed the compacted tier of the cache with the baseline state at the
    // newest surviving snapshot. Best effort only.
    if let Some(commit) = newest_surviving_snapshot {
        match ctx.read_state_at(&KindedPath::root(), commit, None) {
            Ok(state) => ctx.cache.put_compacted(
                KindedPath::root(),
                commit,
                state.map(Arc::new),
                commit,
            ),
            Err(e) => warn!("could not seed compacted state cache: {e}"),
        }
    }

    info!(
        "compaction of {file}: kept {} record(s), dropped {} ({} segment(s) retired)",
        outcome.records_kept, outcome.records_dropped, outcome.segments_removed
    );
    Ok(outcome)
}

fn age_of(now: DateTime<Utc>, entry: &LogEntry) -> Duration {
    (now - entry.timestamp).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CompactionConfig {
        CompactionConfig {
            cutoff: Duration::from_secs(3600),
            base_interval: Duration::from_secs(3600),
            slots_per_tier: 2,
            multiplier: 2,
            grace_period: Duration::from_secs(0),
        }
    }

    #[test]
    fn validation() {
        assert!(config().validate().is_ok());
        assert!(CompactionConfig {
            multiplier: 1,
            ..config()
        }
        .validate()
        .is_err());
        assert!(CompactionConfig {
            slots_per_tier: 0,
            ..config()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn tier_assignment_is_monotonic() {
        let config = config();
        assert_eq!(config.tier(Duration::from_secs(60)), None);
        assert_eq!(config.tier(Duration::from_secs(3600)), None);

        let mut last = 0;
        for hours in [2u64, 3, 5, 9, 17, 33] {
            let tier = config
                .tier(Duration::from_secs(hours * 3600))
                .expect("beyond cutoff");
            assert!(tier >= last, "tiers must not shrink with age");
            last = tier;
        }
        // First hour past the cutoff is tier 0.
        assert_eq!(config.tier(Duration::from_secs(3600 + 60)), Some(0));
    }
}
