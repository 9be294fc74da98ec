//! Manifest view for concurrent workers.
//!
//! Each feature sits behind its own read/write lock, so updating one feature
//! never serializes against readers or writers of another. Claiming is the one
//! cross-feature operation: it reads dependency states and flips one feature to
//! running, so claims are serialized by a dedicated mutex.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::error::SchedulerError;
use crate::core::feature::{Feature, Manifest, index_features};
use crate::core::selector::{Summary, is_runnable};
use crate::core::types::FeatureStatus;

#[derive(Debug)]
pub struct SharedManifest {
    /// Manifest metadata; `features` is kept empty.
    header: Manifest,
    features: Vec<Arc<RwLock<Feature>>>,
    claim: Mutex<()>,
}

impl SharedManifest {
    pub fn new(mut manifest: Manifest) -> Self {
        let features = std::mem::take(&mut manifest.features)
            .into_iter()
            .map(|feature| Arc::new(RwLock::new(feature)))
            .collect();
        Self {
            header: manifest,
            features,
            claim: Mutex::new(()),
        }
    }

    /// Point-in-time copy of the whole manifest.
    pub fn snapshot(&self) -> Manifest {
        let mut manifest = self.header.clone();
        manifest.features = self
            .features
            .iter()
            .map(|feature| feature.read().clone())
            .collect();
        manifest
    }

    pub fn summary(&self) -> Summary {
        Summary::of(&self.snapshot().features)
    }

    fn handle(&self, id: &str) -> Option<&Arc<RwLock<Feature>>> {
        self.features.iter().find(|feature| feature.read().id == id)
    }

    pub fn get(&self, id: &str) -> Option<Feature> {
        self.handle(id).map(|feature| feature.read().clone())
    }

    /// Mutate one feature under its write lock.
    pub fn update<R>(
        &self,
        id: &str,
        apply: impl FnOnce(&mut Feature) -> R,
    ) -> Result<R, SchedulerError> {
        let handle = self.handle(id).ok_or_else(|| SchedulerError::not_found(id))?;
        let mut feature = handle.write();
        Ok(apply(&mut feature))
    }

    /// Atomically pick the first runnable feature and start an attempt on it.
    ///
    /// Returns a copy taken after the status flip.
    pub fn claim_next_runnable(&self) -> Option<Feature> {
        let _claim = self.claim.lock();
        let current: Vec<Feature> = self
            .features
            .iter()
            .map(|feature| feature.read().clone())
            .collect();
        let index = index_features(&current);
        let position = current
            .iter()
            .position(|feature| is_runnable(feature, &index))?;

        let mut feature = self.features[position].write();
        if feature.status != FeatureStatus::Pending {
            return None;
        }
        feature.begin_attempt();
        Some(feature.clone())
    }

    pub fn running_count(&self) -> usize {
        self.features
            .iter()
            .filter(|feature| feature.read().status == FeatureStatus::Running)
            .count()
    }
}
