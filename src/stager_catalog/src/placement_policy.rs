use crate::{DiskServerStatus, FileSystem, FileSystemStatus};

/// Monitoring view of one filesystem offered to a placement decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementCandidate {
    pub free: u64,
    pub weight: f64,
    pub fs_deviation: f64,
    /// Bytes the decision needs to place (or read from) this filesystem.
    pub file_size: u64,
}

impl PlacementCandidate {
    pub fn from_file_system(fs: &FileSystem, file_size: u64) -> Self {
        Self {
            free: fs.free,
            weight: fs.weight,
            fs_deviation: fs.fs_deviation,
            file_size,
        }
    }
}

/// Scores filesystems for recall targets, job targets and migration sources.
/// `None` means the candidate does not qualify. Higher scores win.
pub trait PlacementPolicy: Send + Sync {
    fn score_target(&self, candidate: &PlacementCandidate) -> Option<f64>;
    fn score_source(&self, candidate: &PlacementCandidate) -> Option<f64>;
}

/// Weight minus deviation, with a free space reserve kept on every target.
#[derive(Debug, Clone)]
pub struct WeightedFreeSpacePolicy {
    pub reserved_bytes: u64,
}

impl Default for WeightedFreeSpacePolicy {
    fn default() -> Self {
        Self { reserved_bytes: 0 }
    }
}

impl PlacementPolicy for WeightedFreeSpacePolicy {
    fn score_target(&self, candidate: &PlacementCandidate) -> Option<f64> {
        let needed = candidate.file_size.saturating_add(self.reserved_bytes);
        if candidate.free < needed {
            return None;
        }
        Some(candidate.weight - candidate.fs_deviation)
    }

    fn score_source(&self, candidate: &PlacementCandidate) -> Option<f64> {
        Some(candidate.weight - candidate.fs_deviation)
    }
}

pub(crate) fn is_schedulable(fs_status: FileSystemStatus, server_status: DiskServerStatus) -> bool {
    fs_status == FileSystemStatus::Production && server_status == DiskServerStatus::Production
}

/// Highest score wins; the earliest candidate wins ties.
pub(crate) fn pick_best<T>(scored: impl IntoIterator<Item = (T, Option<f64>)>) -> Option<T> {
    let mut best: Option<(T, f64)> = None;
    for (item, score) in scored {
        let Some(score) = score else {
            continue;
        };
        match &best {
            Some((_, best_score)) if *best_score >= score => {}
            _ => best = Some((item, score)),
        }
    }
    best.map(|(item, _)| item)
}
