//! Loop Closing stage.
//!
//! The pipeline consists of:
//! 1. **Detection** (`detector.rs`): BoW-based loop candidate detection with consistency checking
//! 2. **Verification** (`detector.rs`): descriptor matches to the loop's map points,
//!    plus a rigid alignment when keyframes carry depth
//! 3. **Registration** (`loop_closer.rs`): loop edges and point fusion while Local Mapping is stopped
//! 4. **Global pass** (`loop_closer.rs`): background refinement of every map point,
//!    flagged as busy on the stage control while in flight

pub mod detector;
pub mod loop_closer;

pub use detector::{detect_loop_candidates, verify_loop_candidate, ConsistencyChecker, LoopCandidate, LoopDetectorConfig, VerifiedLoop};
pub use loop_closer::{register_loop, run_global_pass, LoopCloser, LoopCloserConfig, LoopCloserStats};
