//! How often each street is travelled, from the names the snapper reports.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::snapper::SnappedPoint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreetCount {
    pub street_name: String,
    pub count: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreetCounts {
    counts: BTreeMap<String, usize>,
}

impl StreetCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_all<'a>(&mut self, points: impl IntoIterator<Item = &'a SnappedPoint>) {
        for name in points.into_iter().filter_map(|p| p.street_name.as_deref()) {
            *self.counts.entry(name.to_string()).or_default() += 1;
        }
    }

    pub fn merge(&mut self, other: StreetCounts) {
        for (name, count) in other.counts {
            *self.counts.entry(name).or_default() += count;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Most travelled first; equal counts in name order.
    pub fn sorted(&self) -> Vec<StreetCount> {
        let mut rows: Vec<StreetCount> = self
            .counts
            .iter()
            .map(|(name, count)| StreetCount {
                street_name: name.clone(),
                count: *count,
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.street_name.cmp(&b.street_name)));
        rows
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in self.sorted() {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}
