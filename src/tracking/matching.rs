//! Descriptor matching between a frame and a keyframe.

use crate::vocabulary::{hamming_distance, Descriptor};

/// ORB-SLAM matching thresholds
pub const TH_HIGH: u32 = 100; // Max descriptor distance for acceptance
pub const TH_LOW: u32 = 50; // Stricter threshold
pub const NN_RATIO: f32 = 0.75; // Ratio test threshold (best/second_best)

/// A correspondence between two descriptor sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

/// Brute-force matching with a distance threshold and Lowe's ratio test.
///
/// Each train descriptor is used at most once; when two queries claim the
/// same train descriptor the closer one wins.
pub fn match_descriptors(query: &[Descriptor], train: &[Descriptor], max_distance: u32) -> Vec<Match> {
    let mut best_for_train: Vec<Option<Match>> = vec![None; train.len()];

    for (qi, q) in query.iter().enumerate() {
        let mut best: Option<(usize, u32)> = None;
        let mut second = u32::MAX;
        for (ti, t) in train.iter().enumerate() {
            let d = hamming_distance(q, t);
            match best {
                Some((_, bd)) if d >= bd => second = second.min(d),
                _ => {
                    if let Some((_, bd)) = best {
                        second = second.min(bd);
                    }
                    best = Some((ti, d));
                }
            }
        }

        let Some((ti, d)) = best else { continue };
        if d > max_distance {
            continue;
        }
        if second != u32::MAX && (d as f32) > NN_RATIO * second as f32 {
            continue;
        }

        let candidate = Match {
            query_idx: qi,
            train_idx: ti,
            distance: d,
        };
        match best_for_train[ti] {
            Some(existing) if existing.distance <= d => {}
            _ => best_for_train[ti] = Some(candidate),
        }
    }

    let mut matches: Vec<Match> = best_for_train.into_iter().flatten().collect();
    matches.sort_by_key(|m| m.query_idx);
    matches
}
