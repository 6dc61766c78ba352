use std::cmp::Ordering;

use crate::{segment::SegmentInfo, store::SegmentDirectory, OpCode};

/// closed segments eligible for cleaning, rebuilt from the directory before every pass and never
/// carried over to the next one
pub(crate) struct Candidates {
    segs: Vec<SegmentInfo>,
    now: u32,
}

impl Candidates {
    pub(crate) fn refresh(dir: &dyn SegmentDirectory) -> Self {
        Self {
            segs: dir.closed_segments(),
            now: dir.now(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(segs: Vec<SegmentInfo>, now: u32) -> Self {
        Self { segs, now }
    }

    pub(crate) fn len(&self) -> usize {
        self.segs.len()
    }

    /// the sparsest in-memory segment whose utilization is within `max_utilization`, ties go to
    /// the one freeing more seglets and then to the lower id; segments which can't free a single
    /// seglet are never chosen
    pub(crate) fn segment_to_compact(&self, max_utilization: u32) -> Option<SegmentInfo> {
        self.segs
            .iter()
            .filter(|s| s.memory_utilization() <= max_utilization && s.freeable_seglets() > 0)
            .min_by(|a, b| {
                a.memory_utilization()
                    .cmp(&b.memory_utilization())
                    .then_with(|| b.freeable_seglets().cmp(&a.freeable_seglets()))
                    .then_with(|| a.handle.cmp(&b.handle))
            })
            .copied()
    }

    /// segments for a disk cleaning pass, best cost-benefit first, stop before the live bytes
    /// would exceed `max_live_bytes`
    ///
    /// full segments are never picked, and the set is dropped when even perfectly packed
    /// survivors wouldn't free a seglet or a backup segment, otherwise stable data would be
    /// rewritten over and over
    pub(crate) fn segments_to_clean(&self, max_live_bytes: u64) -> Vec<SegmentInfo> {
        let mut scored: Vec<(f64, &SegmentInfo)> = self
            .segs
            .iter()
            .filter(|s| s.live_bytes < s.segment_size as u64)
            .map(|s| (cost_benefit(s, self.now), s))
            .collect();
        scored.sort_by(|(x, a), (y, b)| by_score(*x, a, *y, b));

        let mut total = 0u64;
        let mut out = Vec::new();
        for (_, s) in scored {
            if total + s.live_bytes > max_live_bytes {
                break;
            }
            total += s.live_bytes;
            out.push(*s);
        }

        let Some(first) = out.first() else {
            return out;
        };
        let seglets: u64 = out.iter().map(|x| x.seglets as u64).sum();
        let survivors = total.div_ceil(first.segment_size as u64) as usize;
        if !frees_space(
            out.len(),
            seglets,
            survivors,
            total.div_ceil(first.seglet_size as u64),
        ) {
            log::debug!(
                "{} segments with {} live bytes in {} seglets can't be packed tighter",
                out.len(),
                total,
                seglets
            );
            out.clear();
        }
        out
    }
}

/// whether moving what `sources` segments hold in `source_seglets` into `survivors` segments of
/// `survivor_seglets` releases memory or backup space without growing the other
pub(crate) fn frees_space(
    sources: usize,
    source_seglets: u64,
    survivors: usize,
    survivor_seglets: u64,
) -> bool {
    survivors <= sources
        && survivor_seglets <= source_seglets
        && (survivors < sources || survivor_seglets < source_seglets)
}

/// benefit is the free space reclaimed times the age of the data, cost is reading the segment
/// plus writing its live data back, empty segments are free to clean
pub(crate) fn cost_benefit(s: &SegmentInfo, now: u32) -> f64 {
    if s.live_bytes == 0 {
        return f64::INFINITY;
    }
    let u = (s.live_bytes as f64 / s.segment_size as f64).min(1.0);
    let age = now.saturating_sub(s.created) as f64;
    (1.0 - u) * age / (1.0 + u)
}

/// higher score first, then older, then lower id
fn by_score(x: f64, a: &SegmentInfo, y: f64, b: &SegmentInfo) -> Ordering {
    y.total_cmp(&x)
        .then_with(|| a.created.cmp(&b.created))
        .then_with(|| a.handle.cmp(&b.handle))
}

/// the compaction candidate must respect the ceiling, otherwise cleaning could consume more
/// seglets than it frees
pub(crate) fn check_compactable(s: &SegmentInfo, max_utilization: u32) -> Result<(), OpCode> {
    if s.memory_utilization() > max_utilization || s.freeable_seglets() == 0 {
        log::error!(
            "segment {} utilization {}% over ceiling {}% or nothing to free",
            s.handle,
            s.memory_utilization(),
            max_utilization
        );
        return Err(OpCode::Invariant);
    }
    Ok(())
}
