//! State shared between the pipeline stages.
//!
//! The `SharedState` struct holds all data that needs to be accessed by
//! multiple threads, protected by appropriate synchronization primitives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::atlas::atlas::Atlas;
use crate::atlas::persistence::LoadedAtlas;
use crate::tracking::frame::FrameIdAllocator;
use crate::vocabulary::OrbVocabulary;

/// Shared state accessible by Tracking, Local Mapping, Loop Closing and the
/// orchestrator.
pub struct SharedState {
    /// The map and its place-recognition index.
    /// Protected by RwLock: Tracking and the viewer read, the mapping stages write.
    pub atlas: RwLock<Atlas>,

    /// The vocabulary every BoW vector is computed with.
    pub vocabulary: Arc<OrbVocabulary>,

    /// Frame id source, rewound on reset and moved past loaded keyframes.
    pub frame_ids: FrameIdAllocator,

    /// Flow control: when true, Tracking should not create new keyframes.
    /// Set by Local Mapping when the keyframe queue is too long.
    pub stop_keyframe_creation: AtomicBool,

    /// Bumped every time the atlas is replaced by a loaded one.
    generation: AtomicU64,
}

impl SharedState {
    /// Create a new SharedState around an empty Atlas.
    pub fn new(vocabulary: Arc<OrbVocabulary>) -> Arc<Self> {
        let atlas = Atlas::new(Arc::clone(&vocabulary));
        Self::with_atlas(atlas, vocabulary, 0)
    }

    /// Create a new SharedState around an existing (loaded) Atlas.
    pub fn with_atlas(atlas: Atlas, vocabulary: Arc<OrbVocabulary>, next_frame_id: u64) -> Arc<Self> {
        let frame_ids = FrameIdAllocator::new();
        frame_ids.reset_to(next_frame_id);
        Arc::new(Self {
            atlas: RwLock::new(atlas),
            vocabulary,
            frame_ids,
            stop_keyframe_creation: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }

    /// Swap in a loaded atlas and move the frame ids past its keyframes.
    ///
    /// The caller must have stopped every stage that mutates the map.
    pub fn replace_atlas(&self, loaded: LoadedAtlas) {
        *self.atlas.write() = loaded.atlas;
        self.frame_ids.reset_to(loaded.next_frame_id);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of times the atlas was replaced.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Check if keyframe creation should be stopped (flow control).
    pub fn should_stop_keyframe_creation(&self) -> bool {
        self.stop_keyframe_creation.load(Ordering::SeqCst)
    }

    /// Set the stop_keyframe_creation flag.
    pub fn set_stop_keyframe_creation(&self, value: bool) {
        self.stop_keyframe_creation.store(value, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("next_frame_id", &self.frame_ids.peek())
            .field("stop_keyframe_creation", &self.should_stop_keyframe_creation())
            .finish_non_exhaustive()
    }
}
