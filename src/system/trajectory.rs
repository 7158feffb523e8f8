//! Trajectory export.
//!
//! Frame poses are stored relative to their reference keyframe, so they
//! follow the keyframes when the map is corrected. Export rebuilds absolute
//! poses and expresses them relative to the first keyframe.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;

use crate::atlas::map::Map;
use crate::error::{Result, SlamError};
use crate::geometry::SE3;
use crate::tracking::TrajectoryHistory;

/// A timestamped camera pose (T_wc).
#[derive(Debug, Clone, PartialEq)]
pub struct StampedPose {
    pub timestamp: f64,
    pub pose: SE3,
}

/// Pose of the first keyframe, the origin of every exported trajectory.
fn origin(map: &Map) -> Result<SE3> {
    map.origin_keyframe_id()
        .and_then(|id| map.resolve_pose(id))
        .ok_or(SlamError::EmptyMap)
}

/// Absolute poses of every tracked frame.
///
/// Lost frames are skipped, as are frames whose reference keyframe is no
/// longer in the map. Culled reference keyframes are resolved through the
/// spanning tree.
pub fn frame_poses(history: &TrajectoryHistory, map: &Map) -> Result<Vec<StampedPose>> {
    let origin = origin(map)?;
    let mut poses = Vec::with_capacity(history.len());

    for record in history.records() {
        if record.lost {
            continue;
        }
        let Some(reference) = record.reference else {
            continue;
        };
        let Some(reference_pose) = map.resolve_pose(reference) else {
            debug!("Trajectory: reference {} not in the map, frame at {:.6} skipped", reference, record.timestamp);
            continue;
        };
        poses.push(StampedPose {
            timestamp: record.timestamp,
            pose: origin.between(&reference_pose.compose(&record.relative_pose)),
        });
    }
    Ok(poses)
}

/// Poses of the good keyframes, in creation order.
pub fn keyframe_poses(map: &Map) -> Result<Vec<StampedPose>> {
    let origin = origin(map)?;
    Ok(map
        .keyframe_ids()
        .into_iter()
        .filter_map(|id| map.get_keyframe(id))
        .filter(|kf| !kf.is_bad)
        .map(|kf| StampedPose {
            timestamp: kf.timestamp,
            pose: origin.between(&kf.pose),
        })
        .collect())
}

/// One line per pose: `timestamp tx ty tz qx qy qz qw`.
pub fn write_tum(path: &Path, poses: &[StampedPose], value_precision: usize) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for p in poses {
        let t = &p.pose.translation;
        let q = p.pose.rotation.quaternion();
        writeln!(
            out,
            "{:.6} {:.prec$} {:.prec$} {:.prec$} {:.prec$} {:.prec$} {:.prec$} {:.prec$}",
            p.timestamp,
            t.x,
            t.y,
            t.z,
            q.i,
            q.j,
            q.k,
            q.w,
            prec = value_precision
        )?;
    }
    out.flush()?;
    Ok(())
}

/// One line per pose: the row-major 3x4 matrix `[R|t]`.
pub fn write_kitti(path: &Path, poses: &[StampedPose]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for p in poses {
        let r = p.pose.rotation_matrix();
        let t = &p.pose.translation;
        let row = |i: usize| format!("{:.9} {:.9} {:.9} {:.9}", r[(i, 0)], r[(i, 1)], r[(i, 2)], t[i]);
        writeln!(out, "{} {} {}", row(0), row(1), row(2))?;
    }
    out.flush()?;
    Ok(())
}
