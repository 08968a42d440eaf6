use std::marker::PhantomData;
use std::sync::{Mutex, PoisonError};

use burn::data::dataset::Dataset;
use rand::distributions::{Distribution, WeightedError, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Draws items with replacement, each index weighted independently of the
/// requested position. Every epoch therefore sees a fresh weighted sample.
pub struct WeightedSamplerDataset<D, I> {
    dataset: D,
    distribution: WeightedIndex<f64>,
    rng: Mutex<StdRng>,
    input: PhantomData<I>,
}

impl<D: Dataset<I>, I> WeightedSamplerDataset<D, I> {
    pub fn new(dataset: D, weights: Vec<f64>, seed: u64) -> Result<Self, WeightedError> {
        Ok(Self {
            dataset,
            distribution: WeightedIndex::new(weights)?,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            input: PhantomData,
        })
    }

    /// Weights each example by the reciprocal of its class ratio.
    pub fn inverse_class_ratio(
        dataset: D,
        labels: &[usize],
        class_ratio: &[f64],
        seed: u64,
    ) -> Result<Self, WeightedError> {
        let weights = labels.iter().map(|label| 1.0 / class_ratio[*label]).collect();
        Self::new(dataset, weights, seed)
    }
}

impl<D, I> Dataset<I> for WeightedSamplerDataset<D, I>
where
    D: Dataset<I>,
    I: Clone + Send + Sync,
{
    fn get(&self, _index: usize) -> Option<I> {
        let index = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            self.distribution.sample(&mut *rng)
        };
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

struct EpochOrder {
    permutation: Vec<usize>,
    served: usize,
}

/// Serves `len` items of a fresh permutation of the inner dataset every epoch.
/// With `len` below the inner length a different tail is dropped each epoch.
///
/// An epoch ends after `len` items have been served, so the loader must request
/// every index exactly once per pass and must not shuffle on its own.
pub struct EpochShuffledDataset<D, I> {
    dataset: D,
    len: usize,
    order: Mutex<EpochOrder>,
    rng: Mutex<StdRng>,
    input: PhantomData<I>,
}

impl<D: Dataset<I>, I> EpochShuffledDataset<D, I> {
    pub fn new(dataset: D, len: usize, seed: u64) -> Self {
        let len = len.min(dataset.len());
        let mut rng = StdRng::seed_from_u64(seed);
        let permutation = shuffled(dataset.len(), &mut rng);

        Self {
            dataset,
            len,
            order: Mutex::new(EpochOrder {
                permutation,
                served: 0,
            }),
            rng: Mutex::new(rng),
            input: PhantomData,
        }
    }
}

fn shuffled(len: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut permutation = (0..len).collect::<Vec<_>>();
    permutation.shuffle(rng);
    permutation
}

impl<D, I> Dataset<I> for EpochShuffledDataset<D, I>
where
    D: Dataset<I>,
    I: Clone + Send + Sync,
{
    fn get(&self, index: usize) -> Option<I> {
        if index >= self.len {
            return None;
        }

        let inner = {
            let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
            let inner = order.permutation[index];

            order.served += 1;
            if order.served == self.len {
                let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                order.permutation = shuffled(self.dataset.len(), &mut rng);
                order.served = 0;
            }
            inner
        };
        self.dataset.get(inner)
    }

    fn len(&self) -> usize {
        self.len
    }
}
