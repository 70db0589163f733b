use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Where an outcome row came from. Organic rows were observed live by the
/// bot; backfilled rows were reconstructed later from archives and carry
/// less trust in calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Organic,
    Backfilled,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::Organic => write!(f, "organic"),
            Provenance::Backfilled => write!(f, "backfilled"),
        }
    }
}

/// One forecast-vs-actual outcome row, keyed by (location, date)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub location: String,
    pub date: NaiveDate,
    /// Observed daily high from the resolution source
    pub actual_high: Option<f64>,
    /// Pooled ensemble mean recorded at prediction time
    pub ensemble_mean: Option<f64>,
    /// Point anchor value recorded at prediction time
    pub anchor_point: Option<f64>,
    pub provenance: Provenance,
}

/// Upsert-only log of outcome rows feeding the calibration learner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationLog {
    pub records: Vec<ValidationRecord>,
}

impl ValidationLog {
    /// Upsert one row. Each populated incoming field overwrites the stored
    /// field; incoming nulls never erase existing data. Provenance can only
    /// move backfilled → organic, never the other way.
    pub fn upsert(&mut self, incoming: ValidationRecord) {
        match self
            .records
            .iter_mut()
            .find(|r| r.location == incoming.location && r.date == incoming.date)
        {
            Some(existing) => {
                if incoming.actual_high.is_some() {
                    existing.actual_high = incoming.actual_high;
                }
                if incoming.ensemble_mean.is_some() {
                    existing.ensemble_mean = incoming.ensemble_mean;
                }
                if incoming.anchor_point.is_some() {
                    existing.anchor_point = incoming.anchor_point;
                }
                if existing.provenance == Provenance::Backfilled {
                    existing.provenance = incoming.provenance;
                }
            }
            None => self.records.push(incoming),
        }
    }

    pub fn get(&self, location: &str, date: NaiveDate) -> Option<&ValidationRecord> {
        self.records
            .iter()
            .find(|r| r.location == location && r.date == date)
    }

    pub fn for_location<'a>(
        &'a self,
        location: &'a str,
    ) -> impl Iterator<Item = &'a ValidationRecord> {
        self.records.iter().filter(move |r| r.location == location)
    }

    pub fn locations(&self) -> Vec<String> {
        let mut locations: Vec<String> =
            self.records.iter().map(|r| r.location.clone()).collect();
        locations.sort();
        locations.dedup();
        locations
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Load from file; a missing or corrupt file degrades to an empty log
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<Self>(&data) {
                Ok(log) => {
                    info!("Loaded {} validation rows from {}", log.len(), path.display());
                    log
                }
                Err(e) => {
                    warn!("Failed to parse validation log {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read validation log {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .context("Failed to serialize validation log")?;
        std::fs::write(path, data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}
