//! ORB vocabulary for Bag-of-Words place recognition.
//!
//! A hierarchical k-means tree over 256-bit ORB descriptors, in the DBoW2
//! layout. Two on-disk encodings are supported, chosen by file suffix:
//! - `.txt`: the DBoW2 text format
//! - `.bin`: a little-endian binary dump of the same node table
//!
//! # Key Types
//!
//! - [`BowVector`]: histogram of word occurrences with TF-IDF weights
//! - [`OrbVocabulary`]: the vocabulary tree with quantization methods

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// A 256-bit binary ORB descriptor.
pub type Descriptor = [u8; 32];

/// Bag-of-Words vector: word_id -> TF-IDF weight (L1-normalized).
pub type BowVector = HashMap<u32, f64>;

/// Node records reserved up front when reading the binary encoding. The
/// stored count is not trusted beyond this; short input fails on read.
const MAX_PREALLOCATED_NODES: usize = 1 << 20;

/// Errors that can occur when loading a vocabulary.
#[derive(Debug, Error)]
pub enum VocabularyError {
    #[error("vocabulary I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vocabulary parse error: {0}")]
    Parse(String),

    #[error("unsupported vocabulary encoding {0:?} (expected .txt or .bin)")]
    UnsupportedEncoding(String),

    #[error("vocabulary has no words")]
    Empty,
}

/// A node in the vocabulary tree.
#[derive(Debug, Clone)]
pub struct VocabNode {
    /// Parent node ID (u32::MAX for root)
    pub parent: u32,
    /// Child node IDs (empty for leaf nodes)
    pub children: Vec<u32>,
    pub descriptor: Descriptor,
    /// IDF weight (non-zero for leaf nodes)
    pub weight: f64,
    /// Word ID if this is a leaf node
    pub word_id: Option<u32>,
}

impl VocabNode {
    fn new(parent: u32) -> Self {
        Self {
            parent,
            children: Vec::new(),
            descriptor: [0u8; 32],
            weight: 0.0,
            word_id: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// One node record as stored by either encoding (root excluded).
struct NodeRecord {
    parent: u32,
    is_leaf: bool,
    descriptor: Descriptor,
    weight: f64,
}

/// Header values shared by both encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    k: i32,
    l: i32,
    scoring: i32,
    weighting: i32,
}

/// ORB vocabulary tree (DBoW2 layout).
#[derive(Debug)]
pub struct OrbVocabulary {
    /// All nodes in the tree (nodes[0] is root)
    nodes: Vec<VocabNode>,
    /// Word ID to node ID mapping
    words: Vec<u32>,
    header: Header,
}

impl OrbVocabulary {
    /// Load a vocabulary, picking the encoding from the file suffix.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let path = path.as_ref();
        let name = path.to_string_lossy();
        if name.ends_with(".txt") {
            Self::load_from_text(path)
        } else if name.ends_with(".bin") {
            Self::load_from_binary(path)
        } else {
            Err(VocabularyError::UnsupportedEncoding(name.into_owned()))
        }
    }

    /// Load vocabulary from DBoW2 text format.
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf desc[0] desc[1] ... desc[31] weight
    /// ...
    /// ```
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| VocabularyError::Parse("empty vocabulary file".to_string()))??;
        let fields: Vec<&str> = header_line.split_whitespace().collect();
        if fields.len() < 2 {
            return Err(VocabularyError::Parse(
                "invalid header, expected: k L [scoring weighting]".to_string(),
            ));
        }
        let parse_i32 = |s: Option<&&str>, what: &str| -> Result<i32, VocabularyError> {
            match s {
                Some(v) => v
                    .parse()
                    .map_err(|_| VocabularyError::Parse(format!("invalid {} value", what))),
                None => Ok(0),
            }
        };
        let header = Header {
            k: parse_i32(fields.first(), "k")?,
            l: parse_i32(fields.get(1), "L")?,
            scoring: parse_i32(fields.get(2), "scoring")?,
            weighting: parse_i32(fields.get(3), "weighting")?,
        };

        let mut records = Vec::new();
        for (line_num, line) in lines.enumerate() {
            let line = line?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            // parent is_leaf desc[32] weight
            if parts.len() < 35 {
                continue;
            }
            let bad = |what: &str| VocabularyError::Parse(format!("invalid {} at line {}", what, line_num + 2));

            let parent: u32 = parts[0].parse().map_err(|_| bad("parent_id"))?;
            let mut descriptor = [0u8; 32];
            for (i, byte_str) in parts[2..34].iter().enumerate() {
                descriptor[i] = byte_str.parse().map_err(|_| bad("descriptor byte"))?;
            }
            let weight: f64 = parts[34].parse().map_err(|_| bad("weight"))?;

            records.push(NodeRecord {
                parent,
                is_leaf: parts[1] == "1",
                descriptor,
                weight,
            });
        }

        Self::build(header, records)
    }

    /// Load vocabulary from the binary encoding.
    pub fn load_from_binary<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        Self::read_binary(&mut reader)
    }

    fn read_binary<R: Read>(reader: &mut R) -> Result<Self, VocabularyError> {
        let count = reader.read_u32::<LittleEndian>()?;
        let header = Header {
            k: reader.read_i32::<LittleEndian>()?,
            l: reader.read_i32::<LittleEndian>()?,
            scoring: reader.read_i32::<LittleEndian>()?,
            weighting: reader.read_i32::<LittleEndian>()?,
        };

        let mut records = Vec::with_capacity((count as usize).min(MAX_PREALLOCATED_NODES));
        for _ in 0..count {
            let parent = reader.read_u32::<LittleEndian>()?;
            let mut descriptor = [0u8; 32];
            reader.read_exact(&mut descriptor)?;
            let weight = reader.read_f32::<LittleEndian>()? as f64;
            let is_leaf = reader.read_u8()? != 0;
            records.push(NodeRecord {
                parent,
                is_leaf,
                descriptor,
                weight,
            });
        }

        Self::build(header, records)
    }

    /// Write the vocabulary in the binary encoding.
    pub fn save_to_binary<P: AsRef<Path>>(&self, path: P) -> Result<(), VocabularyError> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        writer.write_u32::<LittleEndian>((self.nodes.len() - 1) as u32)?;
        writer.write_i32::<LittleEndian>(self.header.k)?;
        writer.write_i32::<LittleEndian>(self.header.l)?;
        writer.write_i32::<LittleEndian>(self.header.scoring)?;
        writer.write_i32::<LittleEndian>(self.header.weighting)?;
        for node in &self.nodes[1..] {
            writer.write_u32::<LittleEndian>(node.parent)?;
            writer.write_all(&node.descriptor)?;
            writer.write_f32::<LittleEndian>(node.weight as f32)?;
            writer.write_u8(node.is_leaf() as u8)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn build(header: Header, records: Vec<NodeRecord>) -> Result<Self, VocabularyError> {
        let mut nodes = vec![VocabNode::new(u32::MAX)];
        let mut words = Vec::new();

        for record in records {
            let node_id = nodes.len() as u32;
            if record.parent as usize >= nodes.len() {
                return Err(VocabularyError::Parse(format!(
                    "node {} references unknown parent {}",
                    node_id, record.parent
                )));
            }
            let mut node = VocabNode::new(record.parent);
            node.descriptor = record.descriptor;
            node.weight = record.weight;
            if record.is_leaf {
                node.word_id = Some(words.len() as u32);
                words.push(node_id);
            }
            nodes[record.parent as usize].children.push(node_id);
            nodes.push(node);
        }

        if words.is_empty() {
            return Err(VocabularyError::Empty);
        }

        tracing::info!(
            "Loaded vocabulary: k={}, L={}, {} nodes, {} words",
            header.k,
            header.l,
            nodes.len(),
            words.len()
        );

        Ok(Self { nodes, words, header })
    }

    /// Branching factor and depth.
    pub fn params(&self) -> (usize, usize) {
        (self.header.k.max(0) as usize, self.header.l.max(0) as usize)
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Quantize a single descriptor to its word id by descending the tree.
    pub fn word_of(&self, desc: &Descriptor) -> u32 {
        self.leaf_of(desc).0
    }

    fn leaf_of(&self, desc: &Descriptor) -> (u32, usize) {
        let mut node_id = 0usize;

        while let Some((&first, rest)) = self.nodes[node_id].children.split_first() {
            let mut best_child = first;
            let mut best_dist = hamming_distance(desc, &self.nodes[first as usize].descriptor);
            for &child in rest {
                let dist = hamming_distance(desc, &self.nodes[child as usize].descriptor);
                if dist < best_dist {
                    best_dist = dist;
                    best_child = child;
                }
            }
            node_id = best_child as usize;
        }

        (self.nodes[node_id].word_id.unwrap_or(0), node_id)
    }

    /// Transform descriptors into an L1-normalized BoW vector.
    pub fn transform(&self, descriptors: &[Descriptor]) -> BowVector {
        let mut bow = BowVector::new();
        for desc in descriptors {
            let (word_id, leaf) = self.leaf_of(desc);
            *bow.entry(word_id).or_insert(0.0) += self.nodes[leaf].weight;
        }

        let sum: f64 = bow.values().sum();
        if sum > 0.0 {
            for v in bow.values_mut() {
                *v /= sum;
            }
        }
        bow
    }

    /// L1 similarity score in [0, 1]: `1 - 0.5 * ||v1 - v2||_1`.
    pub fn score(v1: &BowVector, v2: &BowVector) -> f64 {
        let mut diff_sum = 0.0;
        for (word_id, w1) in v1 {
            let w2 = v2.get(word_id).copied().unwrap_or(0.0);
            diff_sum += (w1 - w2).abs();
        }
        for (word_id, w2) in v2 {
            if !v1.contains_key(word_id) {
                diff_sum += w2.abs();
            }
        }
        1.0 - 0.5 * diff_sum
    }
}

/// Hamming distance between two 256-bit descriptors.
#[inline]
pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}
