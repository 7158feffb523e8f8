//! KeyFrameDatabase - place recognition index over visual words.
//!
//! An inverted index from vocabulary word to the KeyFrames that contain it.
//! Queries score candidates with the vocabulary's L1 BoW score and then
//! group them with their covisible neighbours, keeping only the groups that
//! score close to the best one:
//! - loop detection excludes the query's own covisibility neighbourhood
//! - relocalization considers every KeyFrame
//!
//! The vocabulary reference is not persisted. A deserialized index must be
//! re-bound with [`KeyFrameDatabase::set_vocabulary`] before BoW vectors
//! can be computed through it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::atlas::map::{KeyFrame, KeyFrameId, Map};
use crate::vocabulary::{BowVector, Descriptor, OrbVocabulary};

/// Number of covisible neighbours used when accumulating group scores.
const GROUP_SIZE: usize = 10;

/// Fraction of the best common-word count a candidate needs.
const MIN_COMMON_WORDS_RATIO: f64 = 0.8;

/// Fraction of the best accumulated group score a candidate needs.
const MIN_GROUP_SCORE_RATIO: f64 = 0.75;

/// Candidate keyframe with similarity score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub score: f64,
    /// Score accumulated over the candidate's covisibility group.
    pub group_score: f64,
}

#[derive(Default, Serialize, Deserialize)]
pub struct KeyFrameDatabase {
    /// word_id -> keyframes containing the word.
    inverted_file: HashMap<u32, BTreeSet<KeyFrameId>>,

    #[serde(skip)]
    vocabulary: Option<Arc<OrbVocabulary>>,
}

impl KeyFrameDatabase {
    pub fn new(vocabulary: Arc<OrbVocabulary>) -> Self {
        Self {
            inverted_file: HashMap::new(),
            vocabulary: Some(vocabulary),
        }
    }

    pub fn set_vocabulary(&mut self, vocabulary: Arc<OrbVocabulary>) {
        self.vocabulary = Some(vocabulary);
    }

    pub fn vocabulary(&self) -> Option<&Arc<OrbVocabulary>> {
        self.vocabulary.as_ref()
    }

    /// BoW vector of a descriptor set, if a vocabulary is bound.
    pub fn transform(&self, descriptors: &[Descriptor]) -> Option<BowVector> {
        self.vocabulary.as_ref().map(|v| v.transform(descriptors))
    }

    /// Compute and store the KeyFrame's BoW vector. Returns false without a
    /// bound vocabulary.
    pub fn compute_bow(&self, kf: &mut KeyFrame) -> bool {
        match self.transform(&kf.descriptors) {
            Some(bow) => {
                kf.bow_vector = Some(bow);
                true
            }
            None => false,
        }
    }

    /// Index a KeyFrame under every word of its BoW vector.
    pub fn add(&mut self, kf: &KeyFrame) {
        if let Some(bow) = kf.bow_vector() {
            for word in bow.keys() {
                self.inverted_file.entry(*word).or_default().insert(kf.id);
            }
        }
    }

    pub fn erase(&mut self, kf_id: KeyFrameId) {
        self.inverted_file.retain(|_, kfs| {
            kfs.remove(&kf_id);
            !kfs.is_empty()
        });
    }

    pub fn clear(&mut self) {
        self.inverted_file.clear();
    }

    /// Number of indexed words.
    pub fn num_words(&self) -> usize {
        self.inverted_file.len()
    }

    pub fn contains(&self, kf_id: KeyFrameId) -> bool {
        self.inverted_file.values().any(|kfs| kfs.contains(&kf_id))
    }

    /// Loop candidates for `kf_id` scoring at least `min_score`.
    ///
    /// KeyFrames connected to the query in the covisibility graph are never
    /// returned.
    pub fn detect_loop_candidates(&self, map: &Map, kf_id: KeyFrameId, min_score: f64) -> Vec<Candidate> {
        let Some(kf) = map.get_keyframe(kf_id) else {
            return Vec::new();
        };
        let Some(bow) = kf.bow_vector() else {
            return Vec::new();
        };

        let mut excluded: HashSet<KeyFrameId> = kf.get_covisibles().copied().collect();
        excluded.insert(kf_id);

        self.query(map, bow, &excluded, min_score)
    }

    /// Relocalization candidates for a frame's BoW vector.
    pub fn detect_relocalization_candidates(&self, map: &Map, bow: &BowVector) -> Vec<Candidate> {
        self.query(map, bow, &HashSet::new(), 0.0)
    }

    fn query(
        &self,
        map: &Map,
        bow: &BowVector,
        excluded: &HashSet<KeyFrameId>,
        min_score: f64,
    ) -> Vec<Candidate> {
        // Count words shared with the query
        let mut common_words: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in bow.keys() {
            if let Some(kfs) = self.inverted_file.get(word) {
                for kf_id in kfs {
                    if !excluded.contains(kf_id) {
                        *common_words.entry(*kf_id).or_insert(0) += 1;
                    }
                }
            }
        }

        let Some(&max_common) = common_words.values().max() else {
            return Vec::new();
        };
        let min_common = (max_common as f64 * MIN_COMMON_WORDS_RATIO) as usize;

        let mut scores: HashMap<KeyFrameId, f64> = HashMap::new();
        for (kf_id, n) in &common_words {
            if *n < min_common.max(1) {
                continue;
            }
            let Some(kf_bow) = map
                .get_keyframe(*kf_id)
                .filter(|kf| !kf.is_bad)
                .and_then(|kf| kf.bow_vector())
            else {
                continue;
            };
            let score = OrbVocabulary::score(bow, kf_bow);
            if score >= min_score {
                scores.insert(*kf_id, score);
            }
        }

        if scores.is_empty() {
            return Vec::new();
        }

        // Accumulate over covisibility groups
        let mut candidates: Vec<Candidate> = scores
            .iter()
            .map(|(kf_id, score)| {
                let neighbours = map
                    .get_keyframe(*kf_id)
                    .map(|kf| kf.get_best_covisibles(GROUP_SIZE))
                    .unwrap_or_default();
                let group_score = score
                    + neighbours
                        .iter()
                        .filter_map(|n| scores.get(n))
                        .sum::<f64>();
                Candidate {
                    keyframe_id: *kf_id,
                    score: *score,
                    group_score,
                }
            })
            .collect();

        let best_group = candidates
            .iter()
            .map(|c| c.group_score)
            .fold(0.0_f64, f64::max);
        let min_group = MIN_GROUP_SCORE_RATIO * best_group;
        candidates.retain(|c| c.group_score >= min_group);
        candidates.sort_by(|a, b| {
            b.group_score
                .partial_cmp(&a.group_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.keyframe_id.cmp(&b.keyframe_id))
        });
        candidates
    }
}

impl std::fmt::Debug for KeyFrameDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrameDatabase")
            .field("num_words", &self.inverted_file.len())
            .field("vocabulary_bound", &self.vocabulary.is_some())
            .finish()
    }
}
