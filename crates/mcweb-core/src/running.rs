use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::{Mutex, MutexGuard};

use crate::record::ServerRecord;

pub type RunningMap = BTreeMap<String, Arc<ServerRecord>>;

/// Records that currently own a live process, keyed by display name.
///
/// Lags behind the records themselves until the next reconciliation pass.
#[derive(Debug, Default)]
pub struct RunningSet {
    inner: Mutex<RunningMap>,
}

impl RunningSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, RunningMap> {
        self.inner.lock().await
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.lock().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
