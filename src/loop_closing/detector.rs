//! Loop detection using Bag-of-Words with temporal consistency checking,
//! followed by appearance + geometric verification.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::atlas::keyframe_db::KeyFrameDatabase;
use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::{align_points_ransac, AlignmentConfig, SE3};
use crate::settings::LoopClosingSettings;
use crate::tracking::matching::{match_descriptors, TH_LOW};
use crate::vocabulary::OrbVocabulary;

/// Configuration for loop detection.
#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// Minimum BoW score ratio compared to best covisible keyframe.
    /// Candidates must score at least this fraction of the best covisible score.
    pub min_score_ratio: f64,

    /// Number of consecutive keyframes required for temporal consistency.
    pub consistency_threshold: usize,

    /// Maximum number of keyframes to check in the covisibility group.
    pub max_covisibles_to_check: usize,

    /// Minimum gap (in keyframe ids) between current and loop candidate.
    /// Prevents detecting recent keyframes as loops.
    pub min_temporal_gap: usize,

    /// Descriptor matches to map points needed to accept a loop.
    pub min_matches: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            min_score_ratio: 0.75,
            consistency_threshold: 3,
            max_covisibles_to_check: 10,
            min_temporal_gap: 10,
            min_matches: 40,
        }
    }
}

impl LoopDetectorConfig {
    pub fn from_settings(settings: &LoopClosingSettings) -> Self {
        Self {
            min_score_ratio: settings.min_score_ratio,
            consistency_threshold: settings.consistency_threshold.max(1),
            min_temporal_gap: settings.min_temporal_gap,
            ..Default::default()
        }
    }
}

/// A potential loop closure candidate.
#[derive(Debug, Clone)]
pub struct LoopCandidate {
    /// Current keyframe ID that detected the loop.
    pub current_kf_id: KeyFrameId,

    /// Loop keyframe ID (the older keyframe we're closing back to).
    pub loop_kf_id: KeyFrameId,

    /// BoW similarity score between current and loop keyframe.
    pub bow_score: f64,

    /// Covisible keyframes of the loop keyframe, forming its region.
    pub loop_covisibles: Vec<KeyFrameId>,
}

/// Tracks temporal consistency of loop detections.
///
/// A loop is only considered valid if we detect similar candidates
/// for `consistency_threshold` consecutive keyframes.
pub struct ConsistencyChecker {
    consistency_threshold: usize,

    /// Candidate regions of recent keyframes.
    /// Each entry is (keyframe_id, set of candidate keyframe IDs).
    history: VecDeque<(KeyFrameId, HashSet<KeyFrameId>)>,
}

impl ConsistencyChecker {
    pub fn new(consistency_threshold: usize) -> Self {
        Self {
            consistency_threshold: consistency_threshold.max(1),
            history: VecDeque::new(),
        }
    }

    /// Add candidates for a new keyframe and check for consistency.
    ///
    /// Returns the best-scoring candidate whose region appeared in the
    /// previous `consistency_threshold - 1` keyframes. A keyframe without
    /// candidates breaks every chain.
    pub fn add_and_check(&mut self, kf_id: KeyFrameId, candidates: &[LoopCandidate]) -> Option<LoopCandidate> {
        if candidates.is_empty() {
            self.clear();
            return None;
        }

        // Build set of candidate keyframe IDs (including their covisibles)
        let mut candidate_set: HashSet<KeyFrameId> = HashSet::new();
        for c in candidates {
            candidate_set.insert(c.loop_kf_id);
            candidate_set.extend(c.loop_covisibles.iter().copied());
        }

        let counts: HashMap<KeyFrameId, usize> = candidates
            .iter()
            .map(|c| (c.loop_kf_id, self.consecutive_count(c) + 1))
            .collect();

        let best = candidates
            .iter()
            .filter(|c| counts.get(&c.loop_kf_id).copied().unwrap_or(0) >= self.consistency_threshold)
            .max_by(|a, b| a.bow_score.total_cmp(&b.bow_score))
            .cloned();

        self.history.push_back((kf_id, candidate_set));
        while self.history.len() >= self.consistency_threshold {
            self.history.pop_front();
        }

        // Avoid repeated detections of the same loop
        if best.is_some() {
            self.clear();
        }
        best
    }

    /// Number of immediately preceding keyframes whose candidate region
    /// overlaps this candidate's region.
    fn consecutive_count(&self, candidate: &LoopCandidate) -> usize {
        self.history
            .iter()
            .rev()
            .take_while(|(_, set)| {
                set.contains(&candidate.loop_kf_id)
                    || candidate.loop_covisibles.iter().any(|id| set.contains(id))
            })
            .count()
    }

    /// Clear the consistency history.
    pub fn clear(&mut self) {
        self.history.clear();
    }
}

/// Detect loop closure candidates for a given keyframe.
///
/// 1. Computes a minimum BoW score from the keyframe's covisible neighbors
/// 2. Queries the keyframe database for candidates above it
/// 3. Drops connected and temporally close keyframes
///
/// Returned candidates are sorted by score, best first.
pub fn detect_loop_candidates(
    map: &Map,
    keyframe_db: &KeyFrameDatabase,
    kf_id: KeyFrameId,
    config: &LoopDetectorConfig,
) -> Vec<LoopCandidate> {
    let Some(current_kf) = map.get_keyframe(kf_id) else {
        return Vec::new();
    };
    let Some(current_bow) = current_kf.bow_vector() else {
        return Vec::new();
    };

    let connected = connected_keyframes(kf_id, map);

    // Threshold is a fraction of the best covisible score
    let best_covisible_score = connected
        .iter()
        .filter(|id| **id != kf_id)
        .filter_map(|id| map.get_keyframe(*id))
        .filter_map(|kf| kf.bow_vector())
        .take(config.max_covisibles_to_check)
        .map(|bow| OrbVocabulary::score(current_bow, bow))
        .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))));
    let Some(best_covisible_score) = best_covisible_score else {
        return Vec::new();
    };
    let min_score = best_covisible_score * config.min_score_ratio;

    let mut candidates: Vec<LoopCandidate> = keyframe_db
        .detect_loop_candidates(map, kf_id, min_score)
        .into_iter()
        .filter(|c| !connected.contains(&c.keyframe_id))
        .filter(|c| kf_id.0.abs_diff(c.keyframe_id.0) >= config.min_temporal_gap as u64)
        .filter_map(|c| {
            let kf = map.get_keyframe(c.keyframe_id).filter(|kf| !kf.is_bad)?;
            Some(LoopCandidate {
                current_kf_id: kf_id,
                loop_kf_id: c.keyframe_id,
                bow_score: c.score,
                loop_covisibles: kf.get_covisibles().copied().collect(),
            })
        })
        .collect();

    candidates.sort_by(|a, b| b.bow_score.total_cmp(&a.bow_score));
    candidates
}

/// All keyframes connected to the given keyframe (covisibles + tree neighbors).
fn connected_keyframes(kf_id: KeyFrameId, map: &Map) -> HashSet<KeyFrameId> {
    let mut connected = HashSet::new();
    connected.insert(kf_id);

    if let Some(kf) = map.get_keyframe(kf_id) {
        connected.extend(kf.get_covisibles().copied());
        connected.extend(kf.parent_id);
        connected.extend(kf.children_ids.iter().copied());
    }

    connected
}

/// A loop that passed verification.
#[derive(Debug, Clone)]
pub struct VerifiedLoop {
    pub current_kf_id: KeyFrameId,
    pub loop_kf_id: KeyFrameId,

    /// Current keyframe feature index → loop map point.
    pub matched_map_points: Vec<(usize, MapPointId)>,

    /// Pose of the current keyframe (T_wc) implied by the loop, for sensors
    /// with depth.
    pub corrected_pose: Option<SE3>,
}

/// Verify a loop candidate.
///
/// The current keyframe's descriptors are matched against the loop
/// keyframe's map points. With depth the matches must also agree on one
/// rigid transform.
pub fn verify_loop_candidate(
    map: &Map,
    candidate: &LoopCandidate,
    has_depth: bool,
    config: &LoopDetectorConfig,
) -> Option<VerifiedLoop> {
    let current = map.get_keyframe(candidate.current_kf_id)?;
    let loop_kf = map.get_keyframe(candidate.loop_kf_id)?;

    let matched: Vec<(usize, MapPointId)> = match_descriptors(&current.descriptors, &loop_kf.descriptors, TH_LOW)
        .into_iter()
        .filter_map(|m| {
            let mp_id = loop_kf.get_map_point(m.train_idx)?;
            map.get_map_point(mp_id).filter(|mp| !mp.is_bad)?;
            Some((m.query_idx, mp_id))
        })
        .collect();

    if matched.len() < config.min_matches {
        return None;
    }

    if !has_depth {
        return Some(VerifiedLoop {
            current_kf_id: candidate.current_kf_id,
            loop_kf_id: candidate.loop_kf_id,
            matched_map_points: matched,
            corrected_pose: None,
        });
    }

    let mut used = Vec::with_capacity(matched.len());
    let mut source = Vec::with_capacity(matched.len());
    let mut target = Vec::with_capacity(matched.len());
    for &(feat_idx, mp_id) in &matched {
        let p_cam = current.points_cam.get(feat_idx).copied().flatten();
        let p_world = map.get_map_point(mp_id).map(|mp| mp.position);
        if let (Some(p_cam), Some(p_world)) = (p_cam, p_world) {
            source.push(p_cam);
            target.push(p_world);
            used.push((feat_idx, mp_id));
        }
    }

    let alignment_config = AlignmentConfig {
        min_inliers: (config.min_matches / 2).max(3),
        ..Default::default()
    };
    let alignment = align_points_ransac(&source, &target, &alignment_config)?;
    let inliers = alignment.inliers.iter().map(|&i| used[i]).collect();

    Some(VerifiedLoop {
        current_kf_id: candidate.current_kf_id,
        loop_kf_id: candidate.loop_kf_id,
        matched_map_points: inliers,
        corrected_pose: Some(alignment.transform),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(current: u64, loop_kf: u64, score: f64, covisibles: &[u64]) -> LoopCandidate {
        LoopCandidate {
            current_kf_id: KeyFrameId::new(current),
            loop_kf_id: KeyFrameId::new(loop_kf),
            bow_score: score,
            loop_covisibles: covisibles.iter().map(|&i| KeyFrameId::new(i)).collect(),
        }
    }

    #[test]
    fn test_consistency_checker() {
        let mut checker = ConsistencyChecker::new(3);

        // First detection - not consistent yet
        let result = checker.add_and_check(KeyFrameId::new(10), &[candidate(10, 1, 0.8, &[2, 3])]);
        assert!(result.is_none());

        // Second detection - still not consistent
        let result = checker.add_and_check(KeyFrameId::new(11), &[candidate(11, 1, 0.85, &[2])]);
        assert!(result.is_none());

        // Third detection - a neighbor of the region counts too
        let result = checker.add_and_check(KeyFrameId::new(12), &[candidate(12, 2, 0.9, &[])]);
        assert_eq!(result.unwrap().loop_kf_id, KeyFrameId::new(2));
    }

    #[test]
    fn test_consistency_checker_no_match() {
        let mut checker = ConsistencyChecker::new(3);

        // Different candidates each time
        for i in 10..15 {
            let result = checker.add_and_check(KeyFrameId::new(i), &[candidate(i, i - 9, 0.8, &[])]);
            assert!(result.is_none());
        }
    }

    #[test]
    fn test_gap_breaks_consistency() {
        let mut checker = ConsistencyChecker::new(2);
        assert!(checker.add_and_check(KeyFrameId::new(10), &[candidate(10, 1, 0.8, &[])]).is_none());
        assert!(checker.add_and_check(KeyFrameId::new(11), &[]).is_none());
        assert!(checker.add_and_check(KeyFrameId::new(12), &[candidate(12, 1, 0.8, &[])]).is_none());
        assert!(checker.add_and_check(KeyFrameId::new(13), &[candidate(13, 1, 0.8, &[])]).is_some());
    }

    #[test]
    fn test_threshold_one_accepts_immediately() {
        let mut checker = ConsistencyChecker::new(1);
        let found = checker.add_and_check(
            KeyFrameId::new(5),
            &[candidate(5, 1, 0.4, &[]), candidate(5, 2, 0.9, &[])],
        );
        assert_eq!(found.unwrap().loop_kf_id, KeyFrameId::new(2));
    }
}
