//! Collector configuration
//!
//! Tuning comes from two comma separated lists, normally read from the
//! `OTTER_GC_PARAMS` and `OTTER_GC_DEBUG` environment variables. Anything
//! unrecognised is an error; nothing is silently defaulted.

use crate::error::ConfigError;
use crate::remset::DEFAULT_REMSET_SIZE;
use crate::section::SCAN_START_SIZE;

/// Environment variable holding tuning parameters
pub const PARAMS_ENV: &str = "OTTER_GC_PARAMS";

/// Environment variable holding debug options
pub const DEBUG_ENV: &str = "OTTER_GC_DEBUG";

/// Default nursery size
pub const DEFAULT_NURSERY_SIZE: usize = 1024 * 512 * 2;

/// Smallest nursery accepted
pub const MIN_NURSERY_SIZE: usize = 64 * 1024;

/// Default TLAB size
pub const DEFAULT_TLAB_SIZE: usize = 4096;

/// Default major section size
pub const DEFAULT_SECTION_SIZE: usize = 1024 * 1024;

/// Usage text printed with configuration errors
pub const USAGE: &str = "\
usage: OTTER_GC_PARAMS=key=value[,key=value...]
  nursery-size=N      nursery size, power of two, at least 64k (default 1m)
  major=KIND          copying | marksweep | marksweep-par (default copying)
  wbarrier=KIND       remset | cardtable (default remset)
  workers=N           collector threads, 1..=64 (default 1)
  tlab-size=N         thread-local allocation buffer size (default 4k)
  section-size=N      major heap section size (default 1m)
  max-heap-size=N     limit for major sections and large objects (default unlimited)
  remset-size=N       store buffer entries per thread (default 1024)
usage: OTTER_GC_DEBUG=option[,option...]
  check-at-minor-collections   verify remembered sets before every minor collection
  collect-before-allocs        run a minor collection before every allocation
  clear-at-gc                  zero the nursery at collection time instead of per TLAB
sizes accept k, m and g suffixes";

/// Major heap strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MajorKind {
    /// Evacuate survivors into fresh sections
    Copying,
    /// Non-moving mark and sweep
    MarkSweep,
    /// Mark and sweep with the machine's parallelism as default worker count
    MarkSweepParallel,
}

/// Write barrier implementation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierKind {
    /// Exact slot addresses in store buffers
    Remset,
    /// Dirty cards
    CardTable,
}

/// When nursery memory is zeroed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearPolicy {
    /// Zero each TLAB when it is handed out
    AtTlabCreation,
    /// Zero all free fragments when the nursery is rebuilt
    AtGc,
}

/// Debug switches
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugOptions {
    /// Verify remembered sets before every minor collection
    pub check_at_minor_collections: bool,
    /// Collect before every allocation
    pub collect_before_allocs: bool,
}

/// Collector configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcConfig {
    /// Nursery size in bytes
    pub nursery_size: usize,
    /// Major heap strategy
    pub major: MajorKind,
    /// Barrier implementation
    pub barrier: BarrierKind,
    /// Collector threads, including the one running the pause
    pub workers: usize,
    /// TLAB size in bytes
    pub tlab_size: usize,
    /// Major section size in bytes
    pub section_size: usize,
    /// Optional limit on major sections plus large objects
    pub max_heap_size: Option<usize>,
    /// Store buffer capacity per thread
    pub remset_size: usize,
    /// Nursery zeroing policy
    pub clear_policy: ClearPolicy,
    /// Debug switches
    pub debug: DebugOptions,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            nursery_size: DEFAULT_NURSERY_SIZE,
            major: MajorKind::Copying,
            barrier: BarrierKind::Remset,
            workers: 1,
            tlab_size: DEFAULT_TLAB_SIZE,
            section_size: DEFAULT_SECTION_SIZE,
            max_heap_size: None,
            remset_size: DEFAULT_REMSET_SIZE,
            clear_policy: ClearPolicy::AtTlabCreation,
            debug: DebugOptions::default(),
        }
    }
}

impl GcConfig {
    /// Parse the parameter and debug lists
    pub fn parse(params: &str, debug: &str) -> Result<Self, ConfigError> {
        let mut config = GcConfig::default();
        let mut workers_set = false;

        for item in split_list(params) {
            let (key, value) = match item.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => {
                    return Err(if is_param_key(item) {
                        ConfigError::MissingValue { key: item.into() }
                    } else {
                        ConfigError::UnknownKey { key: item.into() }
                    });
                }
            };
            match key {
                "nursery-size" => {
                    let size = parse_size(key, value)?;
                    if !size.is_power_of_two() || size < MIN_NURSERY_SIZE {
                        return Err(invalid(key, value, "must be a power of two of at least 64k"));
                    }
                    config.nursery_size = size;
                }
                "major" => {
                    config.major = match value {
                        "copying" => MajorKind::Copying,
                        "marksweep" => MajorKind::MarkSweep,
                        "marksweep-par" => MajorKind::MarkSweepParallel,
                        _ => {
                            return Err(invalid(
                                key,
                                value,
                                "expected copying, marksweep or marksweep-par",
                            ));
                        }
                    };
                }
                "wbarrier" => {
                    config.barrier = match value {
                        "remset" => BarrierKind::Remset,
                        "cardtable" => BarrierKind::CardTable,
                        _ => return Err(invalid(key, value, "expected remset or cardtable")),
                    };
                }
                "workers" => {
                    let workers: usize = value
                        .parse()
                        .map_err(|_| invalid(key, value, "expected a number"))?;
                    if !(1..=64).contains(&workers) {
                        return Err(invalid(key, value, "must be between 1 and 64"));
                    }
                    config.workers = workers;
                    workers_set = true;
                }
                "tlab-size" => {
                    let size = parse_size(key, value)?;
                    if size < 256 || size % 8 != 0 {
                        return Err(invalid(key, value, "must be a multiple of 8 of at least 256"));
                    }
                    config.tlab_size = size;
                }
                "section-size" => {
                    let size = parse_size(key, value)?;
                    if size < 2 * SCAN_START_SIZE {
                        return Err(invalid(key, value, "must be at least 16k"));
                    }
                    config.section_size = size;
                }
                "max-heap-size" => config.max_heap_size = Some(parse_size(key, value)?),
                "remset-size" => {
                    let size: usize = value
                        .parse()
                        .map_err(|_| invalid(key, value, "expected a number"))?;
                    if size == 0 {
                        return Err(invalid(key, value, "must be positive"));
                    }
                    config.remset_size = size;
                }
                _ => return Err(ConfigError::UnknownKey { key: key.into() }),
            }
        }

        for item in split_list(debug) {
            match item {
                "check-at-minor-collections" => config.debug.check_at_minor_collections = true,
                "collect-before-allocs" => config.debug.collect_before_allocs = true,
                "clear-at-gc" => config.clear_policy = ClearPolicy::AtGc,
                _ => return Err(ConfigError::UnknownKey { key: item.into() }),
            }
        }

        config.validate()?;
        if config.major == MajorKind::MarkSweepParallel && !workers_set {
            config.workers = std::thread::available_parallelism()
                .map(|n| n.get().min(64))
                .unwrap_or(1);
        }
        Ok(config)
    }

    /// Check the constraints between fields. Called by [`GcConfig::parse`];
    /// configurations built in code are checked when the heap is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let check = |ok: bool, key: &str, value: usize, reason: &'static str| {
            if ok {
                Ok(())
            } else {
                Err(invalid(key, &value.to_string(), reason))
            }
        };
        check(
            self.nursery_size.is_power_of_two() && self.nursery_size >= MIN_NURSERY_SIZE,
            "nursery-size",
            self.nursery_size,
            "must be a power of two of at least 64k",
        )?;
        check(
            self.tlab_size >= 256 && self.tlab_size % 8 == 0,
            "tlab-size",
            self.tlab_size,
            "must be a multiple of 8 of at least 256",
        )?;
        check(
            self.tlab_size <= self.nursery_size / 4,
            "tlab-size",
            self.tlab_size,
            "must not exceed a quarter of the nursery",
        )?;
        check(
            self.section_size >= 2 * SCAN_START_SIZE,
            "section-size",
            self.section_size,
            "must be at least 16k",
        )?;
        check(
            (1..=64).contains(&self.workers),
            "workers",
            self.workers,
            "must be between 1 and 64",
        )?;
        check(self.remset_size > 0, "remset-size", self.remset_size, "must be positive")
    }

    /// Read the configuration from the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let params = std::env::var(PARAMS_ENV).unwrap_or_default();
        let debug = std::env::var(DEBUG_ENV).unwrap_or_default();
        Self::parse(&params, &debug)
    }

    /// Read the configuration from the environment, exiting with the usage
    /// message on error
    pub fn from_env_or_exit() -> Self {
        match Self::from_env() {
            Ok(config) => config,
            Err(err) => {
                crate::log::gc_warn!(error = %err, "invalid collector configuration");
                eprintln!("otter-vm-gc: {err}");
                std::process::exit(1);
            }
        }
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn is_param_key(key: &str) -> bool {
    matches!(
        key,
        "nursery-size"
            | "major"
            | "wbarrier"
            | "workers"
            | "tlab-size"
            | "section-size"
            | "max-heap-size"
            | "remset-size"
    )
}

fn invalid(key: &str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        value: value.into(),
        reason,
    }
}

/// Parse a byte size with an optional k/m/g suffix
pub fn parse_size(key: &str, value: &str) -> Result<usize, ConfigError> {
    let lower = value.to_ascii_lowercase();
    let (digits, shift) = match lower.as_bytes().last() {
        Some(b'k') => (&lower[..lower.len() - 1], 10),
        Some(b'm') => (&lower[..lower.len() - 1], 20),
        Some(b'g') => (&lower[..lower.len() - 1], 30),
        _ => (lower.as_str(), 0),
    };
    let number: usize = digits
        .parse()
        .map_err(|_| invalid(key, value, "expected a size such as 512k or 4m"))?;
    number
        .checked_shl(shift)
        .filter(|n| n >> shift == number && *n > 0)
        .ok_or_else(|| invalid(key, value, "size out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GcConfig::parse("", "").unwrap();
        assert_eq!(config, GcConfig::default());
        assert_eq!(config.nursery_size, 1024 * 1024);
        assert_eq!(config.clear_policy, ClearPolicy::AtTlabCreation);
    }

    #[test]
    fn test_full_parameter_list() {
        let config = GcConfig::parse(
            "nursery-size=4m, major=marksweep,wbarrier=cardtable,\
             workers=4,tlab-size=8k,max-heap-size=1g",
            "check-at-minor-collections,clear-at-gc",
        )
        .unwrap();
        assert_eq!(config.nursery_size, 4 << 20);
        assert_eq!(config.major, MajorKind::MarkSweep);
        assert_eq!(config.barrier, BarrierKind::CardTable);
        assert_eq!(config.workers, 4);
        assert_eq!(config.tlab_size, 8192);
        assert_eq!(config.max_heap_size, Some(1 << 30));
        assert!(config.debug.check_at_minor_collections);
        assert!(!config.debug.collect_before_allocs);
        assert_eq!(config.clear_policy, ClearPolicy::AtGc);
    }

    #[test]
    fn test_unknown_key_is_error() {
        let err = GcConfig::parse("nursery=1m", "").unwrap_err();
        assert_eq!(err, ConfigError::UnknownKey { key: "nursery".into() });
        assert!(err.to_string().contains("usage"));
        let err = GcConfig::parse("", "verify-everything").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey { .. }));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            GcConfig::parse("nursery-size=3m", ""),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            GcConfig::parse("major=generational", ""),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            GcConfig::parse("workers=0", ""),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            GcConfig::parse("workers", ""),
            Err(ConfigError::MissingValue { .. })
        ));
        assert!(matches!(
            GcConfig::parse("nursery-size=64k,tlab-size=32k", ""),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_programmatic_config() {
        let config = GcConfig {
            nursery_size: 100_000,
            ..GcConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "nursery-size"
        ));
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("k", "512"), Ok(512));
        assert_eq!(parse_size("k", "512k"), Ok(512 * 1024));
        assert_eq!(parse_size("k", "2M"), Ok(2 << 20));
        assert!(parse_size("k", "lots").is_err());
        assert!(parse_size("k", "0").is_err());
    }

    #[test]
    fn test_parallel_marksweep_defaults_workers() {
        let config = GcConfig::parse("major=marksweep-par", "").unwrap();
        assert!(config.workers >= 1);
        let config = GcConfig::parse("major=marksweep-par,workers=2", "").unwrap();
        assert_eq!(config.workers, 2);
    }
}
