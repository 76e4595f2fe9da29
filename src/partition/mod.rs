//! Train/validation split and worker sharding over exam keys.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;

use crate::metadata::{ExamKey, ImageIndex};

/// How exam keys are ordered before splitting and sharding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyOrder {
    /// First appearance in the crosswalk
    #[default]
    Insertion,
    /// By (subjectId, examIndex)
    Sorted,
    /// Seeded shuffle
    Shuffled,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PartitionPolicy {
    #[serde(default)]
    pub order: KeyOrder,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_train_ratio")]
    pub train_ratio: f64,
}

fn default_train_ratio() -> f64 {
    0.8
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        Self {
            order: KeyOrder::default(),
            seed: 0,
            train_ratio: default_train_ratio(),
        }
    }
}

impl PartitionPolicy {
    pub fn ordered_keys(&self, index: &ImageIndex) -> Vec<ExamKey> {
        let mut keys = index.keys().to_vec();
        match self.order {
            KeyOrder::Insertion => {}
            KeyOrder::Sorted => keys.sort(),
            KeyOrder::Shuffled => {
                let mut rng = StdRng::seed_from_u64(self.seed);
                keys.shuffle(&mut rng);
            }
        }
        keys
    }

    pub fn train_size(&self, total: usize) -> usize {
        ((total as f64) * self.train_ratio).floor() as usize
    }

    /// Split into (train, valid) by exam: the first `train_size` keys go to
    /// train, the rest to valid.
    pub fn split(&self, index: &ImageIndex) -> (ImageIndex, ImageIndex) {
        let keys = self.ordered_keys(index);
        let train_size = self.train_size(keys.len()).min(keys.len());
        let (train, valid) = keys.split_at(train_size);
        (index.subset(train), index.subset(valid))
    }
}

/// Keys assigned to one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkShard {
    pub worker: usize,
    pub keys: Vec<ExamKey>,
}

/// Slice `keys` into exactly `workers` consecutive shards of at most
/// `len / workers + 1` keys. Trailing shards may be empty.
pub fn shard(keys: Vec<ExamKey>, workers: usize) -> Vec<WorkShard> {
    let workers = workers.max(1);
    if workers == 1 {
        return vec![WorkShard { worker: 0, keys }];
    }

    let size = keys.len() / workers + 1;
    let mut chunks = keys.chunks(size);
    (0..workers)
        .map(|worker| WorkShard {
            worker,
            keys: chunks.next().map(<[ExamKey]>::to_vec).unwrap_or_default(),
        })
        .collect()
}
