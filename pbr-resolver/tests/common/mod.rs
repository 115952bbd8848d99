#![allow(dead_code)] // Shared between test crates that each use a subset.

use async_trait::async_trait;
use parking_lot::Mutex;
use pbr_resolver::{IpSetEntry, IpSetManager};

/// Records every batch submission instead of touching the kernel.
#[derive(Default)]
pub struct RecordingIpSets {
    calls: Mutex<Vec<Vec<IpSetEntry>>>,
}

#[async_trait]
impl IpSetManager for RecordingIpSets {
    async fn batch_add(&self, entries: &[IpSetEntry]) -> anyhow::Result<()> {
        self.calls.lock().push(entries.to_vec());

        Ok(())
    }
}

impl RecordingIpSets {
    pub fn calls(&self) -> Vec<Vec<IpSetEntry>> {
        self.calls.lock().clone()
    }

    pub fn entries(&self) -> Vec<IpSetEntry> {
        self.calls.lock().iter().flatten().cloned().collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}
