//! Filter labels, label medoids, and dummy-point forwarding.
//!
//! Labels live in flat arrays (per-point offset + count into one label
//! vector) rather than per-point allocations; filtered search probes them on
//! every neighbor, so the lookup has to stay allocation-free.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::fs;
use std::hash::Hash;
use std::path::Path;

use rand::Rng;
use tracing::{debug, info};

use crate::error::{AnnError, Result};

/// Label id type stored per point: `u32` or `u16`.
pub trait LabelId:
    Copy + Eq + Ord + Hash + Debug + Default + Send + Sync + 'static
{
    fn from_u64(v: u64) -> Self;
    fn parse(s: &str) -> Option<Self>;
}

impl LabelId for u32 {
    fn from_u64(v: u64) -> Self {
        v as u32
    }

    fn parse(s: &str) -> Option<Self> {
        s.trim().parse().ok()
    }
}

impl LabelId for u16 {
    fn from_u64(v: u64) -> Self {
        v as u16
    }

    fn parse(s: &str) -> Option<Self> {
        s.trim().parse().ok()
    }
}

/// Dummy-point forwarding: index-internal duplicates mapped back to their
/// real id on output.
#[derive(Debug, Default)]
pub struct DummyForwarding {
    dummy_points: HashSet<u32>,
    dummy_to_real: HashMap<u32, u32>,
}

impl DummyForwarding {
    /// True if `id` is an index-internal duplicate.
    #[inline]
    pub fn is_dummy(&self, id: u32) -> bool {
        self.dummy_points.contains(&id)
    }

    /// Forward a dummy id to its real id; real ids map to themselves.
    #[inline]
    pub fn resolve(&self, id: u32) -> u32 {
        self.dummy_to_real.get(&id).copied().unwrap_or(id)
    }

    pub fn is_empty(&self) -> bool {
        self.dummy_points.is_empty()
    }
}

/// All filter-related tables for one index.
#[derive(Debug)]
pub struct FilterData<L: LabelId> {
    /// Per-point start into `labels`.
    offsets: Vec<u32>,
    /// Per-point label count.
    counts: Vec<u32>,
    /// Flat label storage.
    labels: Vec<L>,
    /// Label name -> id, from the labels map file.
    label_map: HashMap<String, L>,
    /// Label -> entry-point medoids.
    filter_to_medoids: HashMap<L, Vec<u32>>,
    universal_label: Option<L>,
    pub dummies: DummyForwarding,
}

impl<L: LabelId> FilterData<L> {
    /// Load every filter file that exists next to the disk index.
    /// Returns `None` when the index carries no labels.
    pub fn load(disk_index_path: &Path, num_points: usize) -> Result<Option<Self>> {
        let sibling = |suffix: &str| {
            let mut name = disk_index_path.as_os_str().to_os_string();
            name.push(suffix);
            std::path::PathBuf::from(name)
        };

        let labels_path = sibling("_labels.txt");
        if !labels_path.is_file() {
            return Ok(None);
        }

        let (offsets, counts, labels) = parse_label_file(&labels_path)?;
        if offsets.len() != num_points {
            return Err(AnnError::Load(format!(
                "label file covers {} points, index has {num_points}",
                offsets.len()
            )));
        }

        let label_map = parse_label_map(&sibling("_labels_map.txt"))?;
        let filter_to_medoids = parse_labels_to_medoids(&sibling("_labels_to_medoids.txt"))?;

        let universal_label = {
            let path = sibling("_universal_label.txt");
            if path.is_file() {
                let text = fs::read_to_string(&path)?;
                let label = L::parse(text.trim()).ok_or_else(|| {
                    AnnError::Format(format!("bad universal label {:?}", text.trim()))
                })?;
                info!(?label, "universal label enabled");
                Some(label)
            } else {
                None
            }
        };

        let dummies = parse_dummy_map(&sibling("_dummy_map.txt"))?;

        debug!(
            points = offsets.len(),
            total_labels = labels.len(),
            medoid_labels = filter_to_medoids.len(),
            "loaded filter data"
        );
        Ok(Some(Self {
            offsets,
            counts,
            labels,
            label_map,
            filter_to_medoids,
            universal_label,
            dummies,
        }))
    }

    /// True if `point_id` carries `label`.
    #[inline]
    pub fn point_has_label(&self, point_id: u32, label: L) -> bool {
        let start = self.offsets[point_id as usize] as usize;
        let n = self.counts[point_id as usize] as usize;
        self.labels[start..start + n].contains(&label)
    }

    /// True if `point_id` passes the filter: carries the label itself or
    /// the universal label.
    #[inline]
    pub fn point_passes(&self, point_id: u32, label: L) -> bool {
        self.point_has_label(point_id, label)
            || self
                .universal_label
                .is_some_and(|u| self.point_has_label(point_id, u))
    }

    /// Entry-point medoids registered for `label`.
    pub fn medoids_for(&self, label: L) -> Option<&[u32]> {
        self.filter_to_medoids.get(&label).map(|v| v.as_slice())
    }

    /// Medoid lists of every registered label.
    pub fn all_medoid_lists(&self) -> impl Iterator<Item = &[u32]> {
        self.filter_to_medoids.values().map(|v| v.as_slice())
    }

    /// Map a label name to its id, falling back to the universal label.
    pub fn convert_label(&self, name: &str) -> Result<L> {
        if let Some(&l) = self.label_map.get(name) {
            return Ok(l);
        }
        self.universal_label.ok_or(AnnError::FilterNotFound)
    }

    pub fn universal_label(&self) -> Option<L> {
        self.universal_label
    }

    /// Draw one label from the base label distribution (used to give sample
    /// warmup queries realistic filters).
    pub fn sample_label<R: Rng>(&self, rng: &mut R) -> L {
        self.labels[rng.gen_range(0..self.labels.len())]
    }
}

/// `_labels.txt`: one line per point, comma-separated numeric label ids.
fn parse_label_file<L: LabelId>(path: &Path) -> Result<(Vec<u32>, Vec<u32>, Vec<L>)> {
    let text = fs::read_to_string(path)?;
    let mut offsets = Vec::new();
    let mut counts = Vec::new();
    let mut labels = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        offsets.push(labels.len() as u32);
        let mut n = 0u32;
        for token in line.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let label = L::parse(token).ok_or_else(|| {
                AnnError::Format(format!("bad label {token:?} on line {}", line_no + 1))
            })?;
            labels.push(label);
            n += 1;
        }
        if n == 0 {
            return Err(AnnError::Format(format!(
                "no labels for point on line {}",
                line_no + 1
            )));
        }
        counts.push(n);
    }
    Ok((offsets, counts, labels))
}

/// `_labels_map.txt`: `name\tid` per line. Missing file yields an empty map.
fn parse_label_map<L: LabelId>(path: &Path) -> Result<HashMap<String, L>> {
    let mut map = HashMap::new();
    if !path.is_file() {
        return Ok(map);
    }
    for line in fs::read_to_string(path)?.lines() {
        let mut it = line.split('\t');
        let (Some(name), Some(id)) = (it.next(), it.next()) else {
            return Err(AnnError::Format(format!("bad label map line {line:?}")));
        };
        let label = L::parse(id)
            .ok_or_else(|| AnnError::Format(format!("bad label id {id:?} in label map")))?;
        map.insert(name.to_string(), label);
    }
    Ok(map)
}

/// `_labels_to_medoids.txt`: `label,medoid[,medoid...]` per line.
fn parse_labels_to_medoids<L: LabelId>(path: &Path) -> Result<HashMap<L, Vec<u32>>> {
    let mut map = HashMap::new();
    if !path.is_file() {
        return Ok(map);
    }
    for line in fs::read_to_string(path)?.lines() {
        let mut it = line.split(',');
        let label_tok = it.next().unwrap_or_default();
        let label = L::parse(label_tok)
            .ok_or_else(|| AnnError::Format(format!("bad label {label_tok:?} in medoid map")))?;
        let mut medoids = Vec::new();
        for tok in it {
            medoids.push(tok.trim().parse::<u32>().map_err(|_| {
                AnnError::Format(format!("bad medoid id {tok:?} in medoid map"))
            })?);
        }
        if medoids.is_empty() {
            return Err(AnnError::Format(format!(
                "label {label_tok:?} has no medoids"
            )));
        }
        map.insert(label, medoids);
    }
    Ok(map)
}

/// `_dummy_map.txt`: `dummy_id,real_id` per line.
fn parse_dummy_map(path: &Path) -> Result<DummyForwarding> {
    let mut fwd = DummyForwarding::default();
    if !path.is_file() {
        return Ok(fwd);
    }
    for line in fs::read_to_string(path)?.lines() {
        let mut it = line.split(',');
        let (Some(dummy), Some(real)) = (it.next(), it.next()) else {
            return Err(AnnError::Format(format!("bad dummy map line {line:?}")));
        };
        let dummy: u32 = dummy
            .trim()
            .parse()
            .map_err(|_| AnnError::Format(format!("bad dummy id {dummy:?}")))?;
        let real: u32 = real
            .trim()
            .parse()
            .map_err(|_| AnnError::Format(format!("bad real id {real:?}")))?;
        fwd.dummy_points.insert(dummy);
        fwd.dummy_to_real.insert(dummy, real);
    }
    Ok(fwd)
}
