//! KeyFrame decision criteria.

/// Fraction of the reference keyframe's tracked points below which a new
/// keyframe is needed.
const MIN_TRACKED_RATIO: f64 = 0.9;

/// Tracked points below which the frame is too weak to become a keyframe.
const MIN_TRACKED_FOR_KEYFRAME: usize = 15;

/// What the tracker knows about the current frame when deciding.
#[derive(Debug, Clone, Copy)]
pub struct KeyFrameCandidate {
    /// Features of the current frame matched to map points.
    pub tracked_points: usize,
    /// Map points observed by the reference keyframe.
    pub reference_points: usize,
    /// Whether Local Mapping is idle and accepting keyframes.
    pub mapping_idle: bool,
}

/// Decides whether the current frame should become a KeyFrame.
///
/// - At most `max_frames` frames pass between keyframes
/// - No keyframe before `min_frames` frames have passed
/// - A keyframe is needed when tracking against the reference weakens
#[derive(Debug, Clone)]
pub struct KeyFrameDecision {
    min_frames: usize,
    max_frames: usize,
    frames_since_kf: usize,
}

impl KeyFrameDecision {
    pub fn new(min_frames: usize, max_frames: usize) -> Self {
        Self {
            min_frames,
            max_frames: max_frames.max(1),
            frames_since_kf: 0,
        }
    }

    /// Count one tracked frame and decide. The counter restarts when the
    /// answer is yes.
    pub fn should_create_keyframe(&mut self, candidate: KeyFrameCandidate) -> bool {
        self.frames_since_kf += 1;

        if candidate.tracked_points < MIN_TRACKED_FOR_KEYFRAME {
            return false;
        }

        let timeout = self.frames_since_kf >= self.max_frames;
        let ready = self.frames_since_kf >= self.min_frames && candidate.mapping_idle;
        let weak = candidate.reference_points > 0
            && (candidate.tracked_points as f64) < MIN_TRACKED_RATIO * candidate.reference_points as f64;

        let create = (timeout || ready) && (weak || timeout);
        if create {
            self.frames_since_kf = 0;
        }
        create
    }

    /// Restart the counter after a keyframe was created elsewhere
    /// (initialization, relocalization).
    pub fn reset(&mut self) {
        self.frames_since_kf = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(tracked: usize, reference: usize) -> KeyFrameCandidate {
        KeyFrameCandidate {
            tracked_points: tracked,
            reference_points: reference,
            mapping_idle: true,
        }
    }

    #[test]
    fn test_timeout_forces_keyframe() {
        let mut decision = KeyFrameDecision::new(0, 3);
        assert!(!decision.should_create_keyframe(candidate(100, 100)));
        assert!(!decision.should_create_keyframe(candidate(100, 100)));
        assert!(decision.should_create_keyframe(candidate(100, 100)));
        assert!(!decision.should_create_keyframe(candidate(100, 100)));
    }

    #[test]
    fn test_weak_tracking_triggers_keyframe() {
        let mut decision = KeyFrameDecision::new(0, 30);
        assert!(decision.should_create_keyframe(candidate(50, 100)));
    }

    #[test]
    fn test_busy_mapping_defers_until_timeout() {
        let mut decision = KeyFrameDecision::new(0, 2);
        let busy = KeyFrameCandidate {
            mapping_idle: false,
            ..candidate(50, 100)
        };
        assert!(!decision.should_create_keyframe(busy));
        assert!(decision.should_create_keyframe(busy));
    }

    #[test]
    fn test_too_few_points_never_creates() {
        let mut decision = KeyFrameDecision::new(0, 1);
        assert!(!decision.should_create_keyframe(candidate(3, 100)));
    }
}
