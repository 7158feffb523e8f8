//! TUM RGB-D sequences.
//!
//! Monocular runs read `rgb.txt` (`timestamp filename`); RGB-D runs read an
//! `associations.txt` produced by the TUM `associate.py` tool
//! (`t_rgb rgb_file t_depth depth_file`). Both are space separated with `#`
//! comment lines.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::{ReaderBuilder, Trim};
use image::GrayImage;

use crate::tracking::frame::DepthImage;

use super::{load_depth, load_gray};

#[derive(Debug, Clone)]
struct TumEntry {
    timestamp: f64,
    image: String,
    depth: Option<String>,
}

#[derive(Debug)]
pub struct TumDataset {
    root: PathBuf,
    entries: Vec<TumEntry>,
}

impl TumDataset {
    /// Monocular sequence listed in `<root>/rgb.txt`.
    pub fn monocular<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let entries = read_list(&root.join("rgb.txt"), false)?;
        Ok(Self { root, entries })
    }

    /// RGB-D sequence listed in an associations file.
    pub fn rgbd<P: AsRef<Path>>(root: P, associations: &Path) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let entries = read_list(associations, true)?;
        Ok(Self { root, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timestamp(&self, idx: usize) -> Option<f64> {
        self.entries.get(idx).map(|e| e.timestamp)
    }

    pub fn image(&self, idx: usize) -> Result<GrayImage> {
        let entry = self.entry(idx)?;
        load_gray(&self.root.join(&entry.image))
    }

    pub fn depth(&self, idx: usize) -> Result<DepthImage> {
        let entry = self.entry(idx)?;
        let depth = entry
            .depth
            .as_ref()
            .with_context(|| format!("Frame {} has no depth image", idx))?;
        load_depth(&self.root.join(depth))
    }

    fn entry(&self, idx: usize) -> Result<&TumEntry> {
        self.entries
            .get(idx)
            .with_context(|| format!("No frame at index {}", idx))
    }
}

fn read_list(path: &Path, with_depth: bool) -> Result<Vec<TumEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .flexible(true)
        .trim(Trim::All)
        .comment(Some(b'#'))
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let needed = if with_depth { 4 } else { 2 };
    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let fields: Vec<&str> = rec.iter().filter(|f| !f.is_empty()).collect();
        if fields.len() < needed {
            continue;
        }
        let timestamp: f64 = fields[0]
            .parse()
            .with_context(|| format!("Bad timestamp {:?} in {}", fields[0], path.display()))?;
        entries.push(TumEntry {
            timestamp,
            image: fields[1].to_string(),
            depth: with_depth.then(|| fields[3].to_string()),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::fs;

    fn write_frame(root: &Path, name: &str) {
        fs::create_dir_all(root.join("rgb")).unwrap();
        fs::create_dir_all(root.join("depth")).unwrap();
        GrayImage::from_pixel(5, 4, Luma([7])).save(root.join("rgb").join(name)).unwrap();
        DepthImage::from_pixel(5, 4, Luma([5000u16]))
            .save(root.join("depth").join(name))
            .unwrap();
    }

    #[test]
    fn test_monocular_list() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "1305031102.175304.png");
        fs::write(
            dir.path().join("rgb.txt"),
            "# color images\n# file: 'rgbd_dataset_freiburg1_xyz.bag'\n# timestamp filename\n1305031102.175304 rgb/1305031102.175304.png\n",
        )
        .unwrap();

        let dataset = TumDataset::monocular(dir.path()).unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.timestamp(0), Some(1305031102.175304));
        assert_eq!(dataset.image(0).unwrap().get_pixel(0, 0)[0], 7);
        assert!(dataset.depth(0).is_err());
    }

    #[test]
    fn test_associations_list() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "a.png");
        let associations = dir.path().join("associations.txt");
        fs::write(&associations, "1.0 rgb/a.png 1.01 depth/a.png\n\n2.0 rgb/b.png\n").unwrap();

        let dataset = TumDataset::rgbd(dir.path(), &associations).unwrap();
        assert_eq!(dataset.len(), 1);
        let depth = dataset.depth(0).unwrap();
        assert_eq!(depth.get_pixel(4, 3)[0], 5000);
    }
}
