//! Rigid alignment of 3D point correspondences using Horn's method with RANSAC.
//!
//! Stereo and RGB-D frames carry metric depth, so two views of the same
//! points are related by a rigid transform (scale fixed to 1). The tracker
//! uses this to place a frame against the map and Loop Closing to verify a
//! loop candidate.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::SE3;

/// Configuration for the RANSAC alignment.
#[derive(Debug, Clone)]
pub struct AlignmentConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Inlier threshold in meters (point-to-point error).
    pub inlier_threshold: f64,
    /// Minimum number of inliers required.
    pub min_inliers: usize,
    /// Probability of finding a good model.
    pub probability: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            inlier_threshold: 0.075, // 7.5cm
            min_inliers: 15,
            probability: 0.99,
        }
    }
}

/// Result of a successful alignment.
#[derive(Debug, Clone)]
pub struct Alignment {
    /// Transform T such that `target ≈ T * source`.
    pub transform: SE3,
    /// Indices of inlier correspondences.
    pub inliers: Vec<usize>,
    /// Mean squared error of inliers.
    pub mse: f64,
}

/// Find the rigid transform taking `source` onto `target`.
///
/// Sampling is seeded, so the same input always yields the same result.
pub fn align_points_ransac(
    source: &[Vector3<f64>],
    target: &[Vector3<f64>],
    config: &AlignmentConfig,
) -> Option<Alignment> {
    let n = source.len();
    if n < 3 || n != target.len() || n < config.min_inliers {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(n as u64);
    let mut best: Option<Alignment> = None;
    let mut max_iter = config.max_iterations;
    let mut iteration = 0;

    while iteration < max_iter {
        iteration += 1;
        let sample = sample_three_indices(&mut rng, n);
        let src: Vec<_> = sample.iter().map(|&i| source[i]).collect();
        let dst: Vec<_> = sample.iter().map(|&i| target[i]).collect();

        let Some(transform) = horn(&src, &dst) else {
            continue;
        };
        let (inliers, mse) = find_inliers(source, target, &transform, config.inlier_threshold);

        if inliers.len() > best.as_ref().map_or(0, |b| b.inliers.len()) {
            if inliers.len() >= config.min_inliers {
                let ratio = inliers.len() as f64 / n as f64;
                max_iter = max_iter.min(iteration.saturating_add(adaptive_iterations(ratio, config.probability)));
            }
            best = Some(Alignment { transform, inliers, mse });
        }
    }

    let mut best = best.filter(|b| b.inliers.len() >= config.min_inliers)?;

    // Refine on all inliers
    let src: Vec<_> = best.inliers.iter().map(|&i| source[i]).collect();
    let dst: Vec<_> = best.inliers.iter().map(|&i| target[i]).collect();
    if let Some(refined) = horn(&src, &dst) {
        let (inliers, mse) = find_inliers(source, target, &refined, config.inlier_threshold);
        if inliers.len() >= best.inliers.len() {
            best = Alignment {
                transform: refined,
                inliers,
                mse,
            };
        }
    }

    Some(best)
}

/// Closed-form rigid alignment (Horn / Kabsch via SVD).
pub fn horn(source: &[Vector3<f64>], target: &[Vector3<f64>]) -> Option<SE3> {
    if source.len() < 3 || source.len() != target.len() {
        return None;
    }

    let c_src = centroid(source);
    let c_dst = centroid(target);

    // Cross-covariance matrix: H = sum(p_src * p_dst^T)
    let mut h = Matrix3::zeros();
    for (s, d) in source.iter().zip(target) {
        h += (s - c_src) * (d - c_dst).transpose();
    }
    if h.norm() < 1e-12 {
        return None;
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v = svd.v_t?.transpose();

    let mut rotation = v * u.transpose();
    if rotation.determinant() < 0.0 {
        let mut v_fixed = v;
        for i in 0..3 {
            v_fixed[(i, 2)] = -v_fixed[(i, 2)];
        }
        rotation = v_fixed * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation));
    let translation = c_dst - rotation * c_src;
    Some(SE3::new(rotation, translation))
}

fn centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    let sum: Vector3<f64> = points.iter().sum();
    sum / points.len() as f64
}

fn find_inliers(
    source: &[Vector3<f64>],
    target: &[Vector3<f64>],
    transform: &SE3,
    threshold: f64,
) -> (Vec<usize>, f64) {
    let threshold_sq = threshold * threshold;
    let mut inliers = Vec::new();
    let mut sum_sq = 0.0;
    for (i, (s, d)) in source.iter().zip(target).enumerate() {
        let err = (transform.transform_point(s) - d).norm_squared();
        if err < threshold_sq {
            inliers.push(i);
            sum_sq += err;
        }
    }
    let mse = if inliers.is_empty() {
        f64::INFINITY
    } else {
        sum_sq / inliers.len() as f64
    };
    (inliers, mse)
}

fn sample_three_indices(rng: &mut impl Rng, n: usize) -> [usize; 3] {
    let a = rng.gen_range(0..n);
    let mut b = rng.gen_range(0..n);
    while b == a {
        b = rng.gen_range(0..n);
    }
    let mut c = rng.gen_range(0..n);
    while c == a || c == b {
        c = rng.gen_range(0..n);
    }
    [a, b, c]
}

/// k = log(1 - p) / log(1 - w^3)
fn adaptive_iterations(inlier_ratio: f64, probability: f64) -> usize {
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let log_denom = (1.0 - inlier_ratio.powi(3)).ln();
    if log_denom.abs() < 1e-10 {
        return usize::MAX;
    }
    ((1.0 - probability).ln() / log_denom).ceil().max(1.0) as usize
}
