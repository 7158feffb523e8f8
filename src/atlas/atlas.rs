//! Atlas - the shared world model.
//!
//! The Atlas owns the single `Map` that Tracking, Local Mapping and Loop
//! Closing operate on, together with the `KeyFrameDatabase` used for place
//! recognition (relocalization and loop detection). Both live behind one
//! lock in [`crate::system::SharedState`], so the index never disagrees with
//! the map it describes.

use std::sync::Arc;

use crate::atlas::map::{KeyFrameId, Map};
use crate::vocabulary::OrbVocabulary;

use super::keyframe_db::KeyFrameDatabase;

pub struct Atlas {
    pub map: Map,
    /// Keyframe database for place recognition.
    pub keyframe_db: KeyFrameDatabase,
}

impl Atlas {
    /// Create an empty Atlas whose index is bound to `vocabulary`.
    pub fn new(vocabulary: Arc<OrbVocabulary>) -> Self {
        Self {
            map: Map::new(),
            keyframe_db: KeyFrameDatabase::new(vocabulary),
        }
    }

    /// Assemble an Atlas from deserialized parts.
    pub fn from_parts(map: Map, keyframe_db: KeyFrameDatabase) -> Self {
        Self { map, keyframe_db }
    }

    /// Compute the KeyFrame's BoW vector and add it to the index.
    pub fn index_keyframe(&mut self, kf_id: KeyFrameId) -> bool {
        let Some(kf) = self.map.get_keyframe_mut(kf_id) else {
            return false;
        };
        if kf.bow_vector.is_none() && !self.keyframe_db.compute_bow(kf) {
            return false;
        }
        self.keyframe_db.add(kf);
        true
    }

    /// Flag a KeyFrame bad in the map and drop it from the index.
    pub fn cull_keyframe(&mut self, kf_id: KeyFrameId) -> bool {
        if !self.map.set_keyframe_bad(kf_id) {
            return false;
        }
        self.keyframe_db.erase(kf_id);
        true
    }

    /// Drop every KeyFrame and MapPoint and empty the index.
    pub fn clear(&mut self) {
        self.map.clear();
        self.keyframe_db.clear();
    }
}

impl std::fmt::Debug for Atlas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atlas")
            .field("map", &self.map)
            .field("keyframe_db", &self.keyframe_db)
            .finish()
    }
}
