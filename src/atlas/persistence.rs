//! Map file reading and writing.
//!
//! A map file is the postcard encoding of the [`Map`] immediately followed by
//! the postcard encoding of the [`KeyFrameDatabase`]. There is no header or
//! version field.
//!
//! Callers are responsible for quiescence: nothing may mutate the atlas
//! while it is being written or replaced.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::atlas::atlas::Atlas;
use crate::atlas::keyframe_db::KeyFrameDatabase;
use crate::atlas::map::Map;
use crate::error::{Result, SlamError};
use crate::vocabulary::OrbVocabulary;

/// Suffix every map file must carry.
pub const MAP_FILE_SUFFIX: &str = ".bin";

/// A freshly read atlas, plus the frame id the next frame should receive.
pub struct LoadedAtlas {
    pub atlas: Atlas,
    pub next_frame_id: u64,
}

/// Whether `path` names a map file.
pub fn has_map_suffix(path: &Path) -> bool {
    path.to_string_lossy().ends_with(MAP_FILE_SUFFIX)
}

/// Serialize the map then the index into `path`.
///
/// Failure to create the destination is reported as [`SlamError::MapWrite`].
pub fn write_atlas(path: &Path, atlas: &Atlas) -> Result<()> {
    let file = File::create(path).map_err(|source| SlamError::MapWrite {
        path: path.to_path_buf(),
        source,
    })?;
    let map_bytes = postcard::to_allocvec(&atlas.map)?;
    let db_bytes = postcard::to_allocvec(&atlas.keyframe_db)?;

    let mut writer = BufWriter::new(file);
    writer
        .write_all(&map_bytes)
        .and_then(|_| writer.write_all(&db_bytes))
        .and_then(|_| writer.flush())
        .map_err(|source| SlamError::MapWrite {
            path: path.to_path_buf(),
            source,
        })?;

    info!(
        "Map saved to {}: {} keyframes, {} map points",
        path.display(),
        atlas.map.num_keyframes(),
        atlas.map.num_map_points()
    );
    Ok(())
}

/// Read a map file written by [`write_atlas`].
///
/// The vocabulary is re-bound into the index, every keyframe's BoW vector is
/// recomputed and the next frame id is recovered as one past the largest
/// frame id stored in the map.
pub fn read_atlas(path: &Path, vocabulary: &Arc<OrbVocabulary>) -> Result<LoadedAtlas> {
    let mut bytes = Vec::new();
    File::open(path)
        .and_then(|mut file| file.read_to_end(&mut bytes))
        .map_err(|source| SlamError::MapRead {
            path: path.to_path_buf(),
            source,
        })?;

    let (mut map, rest): (Map, &[u8]) = postcard::take_from_bytes(&bytes)?;
    let mut keyframe_db: KeyFrameDatabase = postcard::from_bytes(rest)?;

    keyframe_db.set_vocabulary(Arc::clone(vocabulary));
    for kf in map.keyframes_mut() {
        keyframe_db.compute_bow(kf);
    }

    let next_frame_id = map.max_frame_id().map_or(0, |max| max + 1);
    map.inform_big_change();

    info!(
        "Map loaded from {}: {} keyframes, {} map points, next frame id {}",
        path.display(),
        map.num_keyframes(),
        map.num_map_points(),
        next_frame_id
    );

    Ok(LoadedAtlas {
        atlas: Atlas::from_parts(map, keyframe_db),
        next_frame_id,
    })
}
