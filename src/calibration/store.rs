use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use super::CalibrationParams;

type ParamsMap = HashMap<String, CalibrationParams>;

/// Owned, injectable calibration store.
///
/// Writers swap the whole map in one step; readers hold an `Arc` snapshot
/// and never observe a half-updated set of params.
#[derive(Debug, Default)]
pub struct CalibrationStore {
    params: RwLock<Arc<ParamsMap>>,
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file. A missing or corrupt file degrades to an
    /// empty store, never a startup failure.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            warn!("Calibration file not found: {}", path.display());
            return Self::new();
        }
        match std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|data| serde_json::from_str::<ParamsMap>(&data).map_err(Into::into))
        {
            Ok(map) => {
                info!("Loaded calibration for {} locations from {}", map.len(), path.display());
                Self { params: RwLock::new(Arc::new(map)) }
            }
            Err(e) => {
                warn!("Failed to load calibration file {}: {}", path.display(), e);
                Self::new()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let data = serde_json::to_string_pretty(snapshot.as_ref())
            .context("Failed to serialize calibration params")?;
        std::fs::write(path, data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Saved calibration for {} locations to {}", snapshot.len(), path.display());
        Ok(())
    }

    pub fn get(&self, location: &str) -> Option<CalibrationParams> {
        self.snapshot().get(location).cloned()
    }

    /// Consistent read-only view of the whole map
    pub fn snapshot(&self) -> Arc<ParamsMap> {
        self.params.read().expect("calibration store lock poisoned").clone()
    }

    /// Atomically replace the entire map with a freshly computed one
    pub fn replace(&self, map: ParamsMap) {
        let mut guard = self.params.write().expect("calibration store lock poisoned");
        *guard = Arc::new(map);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(location: &str, bias: f64) -> CalibrationParams {
        CalibrationParams {
            location: location.to_string(),
            bias_offset: bias,
            spread_factor: 1.2,
            sample_size: 12,
            effective_sample_size: 10.8,
            blend_weight: 0.85,
        }
    }

    #[test]
    fn test_replace_swaps_whole_map() {
        let store = CalibrationStore::new();
        let mut map = HashMap::new();
        map.insert("nyc".to_string(), params("nyc", 1.5));
        store.replace(map);

        assert_eq!(store.get("nyc").unwrap().bias_offset, 1.5);

        // old snapshots stay consistent across a replace
        let old = store.snapshot();
        let mut map = HashMap::new();
        map.insert("chi".to_string(), params("chi", -0.8));
        store.replace(map);

        assert!(old.contains_key("nyc"));
        assert!(store.get("nyc").is_none());
        assert_eq!(store.get("chi").unwrap().bias_offset, -0.8);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let store = CalibrationStore::load(Path::new("/nonexistent/calibration.json"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_corrupt_file_is_empty() {
        let path = std::env::temp_dir().join("weather_fusion_corrupt_calibration.json");
        std::fs::write(&path, "[1, 2").unwrap();
        let store = CalibrationStore::load(&path);
        assert!(store.is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let path = std::env::temp_dir().join("weather_fusion_calibration_roundtrip.json");
        let store = CalibrationStore::new();
        let mut map = HashMap::new();
        map.insert("nyc".to_string(), params("nyc", 1.5));
        map.insert("chi".to_string(), params("chi", -0.8));
        store.replace(map);
        store.save(&path).unwrap();

        let loaded = CalibrationStore::load(&path);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("nyc").unwrap().bias_offset, 1.5);
        assert_eq!(loaded.get("chi").unwrap().spread_factor, 1.2);
        std::fs::remove_file(&path).ok();
    }
}
