//! Configuration for builders, searchers, and container opening.
//!
//! Options come from three places that all funnel into the same typed
//! structs: hard defaults, a dotted-key parameter map supplied per index,
//! and an optional TOML/environment config file loaded through figment.

use std::collections::HashMap;
use std::path::Path;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Dotted-key parameter map accepted by index constructors.
pub type ParamMap = HashMap<String, String>;

fn parse_key<T: std::str::FromStr>(params: &ParamMap, key: &str, default: T) -> Result<T> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| Error::InvalidArgument(format!("bad value '{raw}' for key '{key}'"))),
    }
}

/// Build-time options for the HNSW family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HnswBuilderOptions {
    /// Max neighbors per node on upper levels (`M`).
    pub m: usize,
    /// Max neighbors per node at level 0 (`M0`, default `2 * M`).
    pub m0: usize,
    /// Candidate pool size during construction.
    pub ef_construction: usize,
    /// Hard cap on assigned levels.
    pub max_level: usize,
    /// Seed for the level draw and any internal randomness.
    pub seed: u64,
    /// Worker threads for batch building.
    pub thread_count: usize,
    /// Builder memory quota in bytes; `0` disables the check.
    pub memory_limit_bytes: usize,
    /// When false, re-adding a live key fails with `AlreadyExists`.
    pub allow_duplicate_keys: bool,
}

impl Default for HnswBuilderOptions {
    fn default() -> Self {
        Self {
            m: 16,
            m0: 32,
            ef_construction: 200,
            max_level: 16,
            seed: 0x5DEE_CE66_D1A4_B5B5,
            thread_count: std::thread::available_parallelism().map_or(1, std::num::NonZero::get),
            memory_limit_bytes: 0,
            allow_duplicate_keys: false,
        }
    }
}

impl HnswBuilderOptions {
    /// Parses builder options from a parameter map, falling back to
    /// defaults for missing keys.
    pub fn from_params(params: &ParamMap) -> Result<Self> {
        let defaults = Self::default();
        let m = parse_key(params, "hnsw.builder.M", defaults.m)?;
        let options = Self {
            m,
            m0: parse_key(params, "hnsw.builder.M0", m * 2)?,
            ef_construction: parse_key(
                params,
                "hnsw.builder.ef_construction",
                defaults.ef_construction,
            )?,
            max_level: parse_key(params, "hnsw.builder.max_level", defaults.max_level)?,
            seed: parse_key(params, "hnsw.builder.seed", defaults.seed)?,
            thread_count: parse_key(params, "hnsw.builder.thread_count", defaults.thread_count)?,
            memory_limit_bytes: parse_key(
                params,
                "hnsw.builder.memory_limit_bytes",
                defaults.memory_limit_bytes,
            )?,
            allow_duplicate_keys: parse_key(
                params,
                "hnsw.builder.allow_duplicate_keys",
                defaults.allow_duplicate_keys,
            )?,
        };
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        if self.m < 2 {
            return Err(Error::InvalidArgument(format!(
                "hnsw.builder.M must be >= 2, got {}",
                self.m
            )));
        }
        if self.m0 < self.m {
            return Err(Error::InvalidArgument(format!(
                "hnsw.builder.M0 ({}) must be >= M ({})",
                self.m0, self.m
            )));
        }
        if self.ef_construction == 0 {
            return Err(Error::InvalidArgument(
                "hnsw.builder.ef_construction must be >= 1".into(),
            ));
        }
        if self.max_level == 0 || self.max_level > 63 {
            return Err(Error::InvalidArgument(format!(
                "hnsw.builder.max_level out of range: {}",
                self.max_level
            )));
        }
        Ok(())
    }

    /// Level multiplier `mL = 1 / ln(M)` used by the level draw.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn level_mult(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }

    /// Max neighbors allowed at `level`.
    #[must_use]
    pub fn max_degree(&self, level: u8) -> usize {
        if level == 0 {
            self.m0
        } else {
            self.m
        }
    }
}

/// Search-time options for the HNSW family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HnswSearcherOptions {
    /// Default frontier size; each query may override upward.
    pub ef_search: usize,
    /// At or below this many live docs the searcher scans linearly.
    pub brute_force_threshold: usize,
    /// Fraction of docs above which graph search falls back to a forward
    /// scan (0 disables).
    pub invert_to_forward_scan_ratio: f32,
    /// Fraction of requested keys above which `search_by_keys` scans the
    /// whole key column instead of probing the map.
    pub brute_force_by_keys_ratio: f32,
}

impl Default for HnswSearcherOptions {
    fn default() -> Self {
        Self {
            ef_search: 32,
            brute_force_threshold: 1000,
            invert_to_forward_scan_ratio: 0.0,
            brute_force_by_keys_ratio: 0.25,
        }
    }
}

impl HnswSearcherOptions {
    /// Parses searcher options from a parameter map.
    pub fn from_params(params: &ParamMap) -> Result<Self> {
        let defaults = Self::default();
        let options = Self {
            ef_search: parse_key(params, "hnsw.searcher.ef_search", defaults.ef_search)?,
            brute_force_threshold: parse_key(
                params,
                "hnsw.searcher.brute_force_threshold",
                defaults.brute_force_threshold,
            )?,
            invert_to_forward_scan_ratio: parse_key(
                params,
                "invert_to_forward_scan_ratio",
                defaults.invert_to_forward_scan_ratio,
            )?,
            brute_force_by_keys_ratio: parse_key(
                params,
                "brute_force_by_keys_ratio",
                defaults.brute_force_by_keys_ratio,
            )?,
        };
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        for (key, value) in [
            (
                "invert_to_forward_scan_ratio",
                self.invert_to_forward_scan_ratio,
            ),
            ("brute_force_by_keys_ratio", self.brute_force_by_keys_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidArgument(format!(
                    "{key} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Page-cache advice for mapped containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessAdvice {
    /// No special advice.
    #[default]
    Normal,
    /// Random access expected.
    Random,
    /// Sequential access expected.
    Sequential,
}

/// Backing storage for an index container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Memory-mapped file.
    #[default]
    Mmap,
    /// Anonymous RAM, discarded on close.
    Memory,
}

/// Options for opening an index container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Backing storage kind.
    pub storage: StorageKind,
    /// Refuse writes; required for shared readers.
    pub read_only: bool,
    /// Pre-fault mapped pages at open.
    pub populate: bool,
    /// Page-cache advice for the mapping.
    pub advise: AccessAdvice,
    /// Validate per-segment checksums while opening.
    pub verify_checksums: bool,
}

impl OpenOptions {
    /// Read-only mmap with checksum verification — the loader default.
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            storage: StorageKind::Mmap,
            read_only: true,
            populate: false,
            advise: AccessAdvice::Normal,
            verify_checksums: true,
        }
    }

    /// Anonymous in-memory container for build mode.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            storage: StorageKind::Memory,
            ..Self::default()
        }
    }
}

/// Whole-engine configuration loadable from TOML and environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZvecConfig {
    /// Builder defaults applied when the parameter map omits a key.
    #[serde(default)]
    pub builder: HnswBuilderOptions,
    /// Searcher defaults.
    #[serde(default)]
    pub searcher: HnswSearcherOptions,
}

impl ZvecConfig {
    /// Loads configuration by layering `zvec.toml` under `ZVEC_*`
    /// environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ZVEC_").split("__"))
            .extract()
            .map_err(|e| Error::InvalidArgument(format!("config load failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> ParamMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_builder_defaults() {
        let options = HnswBuilderOptions::from_params(&ParamMap::new()).unwrap();
        assert_eq!(options.m, 16);
        assert_eq!(options.m0, 32);
        assert_eq!(options.ef_construction, 200);
        assert_eq!(options.max_level, 16);
    }

    #[test]
    fn test_builder_m0_follows_m() {
        let options =
            HnswBuilderOptions::from_params(&params(&[("hnsw.builder.M", "24")])).unwrap();
        assert_eq!(options.m, 24);
        assert_eq!(options.m0, 48);
    }

    #[test]
    fn test_builder_rejects_bad_value() {
        let err = HnswBuilderOptions::from_params(&params(&[("hnsw.builder.M", "lots")]))
            .unwrap_err();
        assert_eq!(err.code(), -1001);
    }

    #[test]
    fn test_builder_rejects_m0_below_m() {
        let err = HnswBuilderOptions::from_params(&params(&[
            ("hnsw.builder.M", "16"),
            ("hnsw.builder.M0", "8"),
        ]))
        .unwrap_err();
        assert_eq!(err.code(), -1001);
    }

    #[test]
    fn test_searcher_ratio_bounds() {
        let err =
            HnswSearcherOptions::from_params(&params(&[("invert_to_forward_scan_ratio", "1.5")]))
                .unwrap_err();
        assert_eq!(err.code(), -1001);
    }

    #[test]
    fn test_level_mult() {
        let options = HnswBuilderOptions::default();
        let expected = 1.0 / 16.0_f64.ln();
        assert!((options.level_mult() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_open_options_presets() {
        let ro = OpenOptions::read_only();
        assert!(ro.read_only);
        assert!(ro.verify_checksums);
        assert_eq!(OpenOptions::memory().storage, StorageKind::Memory);
    }
}
