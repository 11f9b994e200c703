//! The manager: a read-only view over the cached flag definitions.
use std::sync::Arc;

use splitio_core::storage::SplitView;

use crate::factory::FactoryInner;

/// Manager handle for inspecting the flags currently cached by the factory.
///
/// Obtained from [`crate::SplitFactory::manager`]. All methods read one
/// storage snapshot and never touch the network.
#[derive(Clone)]
pub struct SplitManager {
    inner: Arc<FactoryInner>,
}

impl SplitManager {
    pub(crate) fn new(inner: Arc<FactoryInner>) -> SplitManager {
        SplitManager { inner }
    }

    /// Names of all cached feature flags.
    pub fn split_names(&self) -> Vec<String> {
        if !self.check_usable("split_names") {
            return Vec::new();
        }
        let mut names = self.inner.splits.snapshot().split_names();
        names.sort();
        names
    }

    /// Views of all cached feature flags.
    pub fn splits(&self) -> Vec<SplitView> {
        if !self.check_usable("splits") {
            return Vec::new();
        }
        self.inner
            .splits
            .snapshot()
            .splits()
            .map(|split| SplitView::from(split.as_ref()))
            .collect()
    }

    /// View of one cached feature flag, if present.
    pub fn split(&self, name: &str) -> Option<SplitView> {
        if !self.check_usable("split") {
            return None;
        }
        self.inner
            .splits
            .snapshot()
            .get(name.trim())
            .map(|split| SplitView::from(split.as_ref()))
    }

    fn check_usable(&self, method: &str) -> bool {
        if self.inner.is_destroyed() {
            log::error!(target: "splitio", "{method}: the factory has been destroyed");
            return false;
        }
        if !self.inner.readiness.is_ready() {
            log::warn!(
                target: "splitio",
                "{method}: the SDK is not ready, results may be incorrect; make sure to wait for SDK readiness before using this method",
            );
        }
        true
    }
}
