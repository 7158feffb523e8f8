//! EuRoC MAV stereo sequences (`mav0/cam0`, `mav0/cam1`).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use image::GrayImage;

use super::load_gray;

#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub timestamp_ns: u64,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct StereoImagePair {
    pub left: GrayImage,
    pub right: GrayImage,
    pub timestamp_ns: u64,
}

#[derive(Debug)]
pub struct EurocDataset {
    dataset_path: PathBuf,
    pub cam0_entries: Vec<ImageEntry>,
    pub cam1_entries: Vec<ImageEntry>,
}

impl EurocDataset {
    /// Open the `mav0` directory of a sequence.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let cam0_entries = load_image_list(root.join("cam0/data.csv"))?;
        let cam1_entries = load_image_list(root.join("cam1/data.csv"))?;

        if cam0_entries.len() != cam1_entries.len() {
            bail!(
                "cam0 and cam1 have different number of frames ({} vs {})",
                cam0_entries.len(),
                cam1_entries.len()
            );
        }

        Ok(Self {
            dataset_path: root,
            cam0_entries,
            cam1_entries,
        })
    }

    pub fn len(&self) -> usize {
        self.cam0_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cam0_entries.is_empty()
    }

    /// Timestamp of a frame in seconds.
    pub fn timestamp(&self, idx: usize) -> Option<f64> {
        self.cam0_entries.get(idx).map(|e| e.timestamp_ns as f64 * 1e-9)
    }

    pub fn stereo_pair(&self, idx: usize) -> Result<StereoImagePair> {
        let left_entry = self
            .cam0_entries
            .get(idx)
            .with_context(|| format!("No left frame at index {}", idx))?;
        let right_entry = self
            .cam1_entries
            .get(idx)
            .with_context(|| format!("No right frame at index {}", idx))?;

        // Expect synchronized timestamps
        let left = load_gray(&self.dataset_path.join("cam0/data").join(&left_entry.filename))?;
        let right = load_gray(&self.dataset_path.join("cam1/data").join(&right_entry.filename))?;

        Ok(StereoImagePair {
            left,
            right,
            timestamp_ns: left_entry.timestamp_ns,
        })
    }
}

fn load_image_list(csv_path: PathBuf) -> Result<Vec<ImageEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 2 {
            continue;
        }
        let ts: u64 = rec[0]
            .trim()
            .parse()
            .with_context(|| format!("Bad timestamp {:?} in {}", &rec[0], csv_path.display()))?;
        entries.push(ImageEntry {
            timestamp_ns: ts,
            filename: rec[1].trim().to_string(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_camera(root: &Path, cam: &str, stamps: &[u64]) {
        let dir = root.join(cam).join("data");
        fs::create_dir_all(&dir).unwrap();
        let mut csv = String::from("#timestamp [ns],filename\n");
        for (i, ts) in stamps.iter().enumerate() {
            let name = format!("{}.png", ts);
            csv.push_str(&format!("{},{}\n", ts, name));
            GrayImage::from_pixel(4, 3, image::Luma([i as u8 * 10]))
                .save(dir.join(&name))
                .unwrap();
        }
        fs::write(root.join(cam).join("data.csv"), csv).unwrap();
    }

    #[test]
    fn test_reads_synchronized_pairs() {
        let dir = tempfile::tempdir().unwrap();
        write_camera(dir.path(), "cam0", &[1_403_636_579_763_555_584, 1_403_636_579_813_555_456]);
        write_camera(dir.path(), "cam1", &[1_403_636_579_763_555_584, 1_403_636_579_813_555_456]);

        let dataset = EurocDataset::new(dir.path()).unwrap();
        assert_eq!(dataset.len(), 2);
        assert!((dataset.timestamp(1).unwrap() - 1_403_636_579.813_555_456).abs() < 1e-6);

        let pair = dataset.stereo_pair(1).unwrap();
        assert_eq!(pair.left.dimensions(), (4, 3));
        assert_eq!(pair.right.get_pixel(0, 0)[0], 10);
        assert!(dataset.stereo_pair(2).is_err());
    }

    #[test]
    fn test_mismatched_cameras_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_camera(dir.path(), "cam0", &[1, 2]);
        write_camera(dir.path(), "cam1", &[1]);
        assert!(EurocDataset::new(dir.path()).is_err());
    }
}
