//! Configuration value types shared by the transformer and batch processors.
//!
//! Both types reject unrecognized options: serde input uses
//! `deny_unknown_fields`, key/value input fails on the first unknown key.

use serde::{Deserialize, Serialize};

use crate::error::{QuiverError, Result};

/// Vector widths (in bits) accepted by [`CodegenOptions::vector_width_bits`].
pub const SUPPORTED_VECTOR_WIDTHS: [usize; 4] = [64, 128, 256, 512];

/// Non-functional knobs for translator construction.
///
/// Options only change which kernel paths run; query results are identical
/// for every valid combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodegenOptions {
    /// Use wide (AVX-class) lanes in bulk bitmap kernels.
    pub enable_avx: bool,
    /// Use word-wide bitmap kernels instead of byte loops.
    pub enable_vectorize: bool,
    /// Lane width in bits for wide bitmap kernels.
    pub vector_width_bits: usize,
    /// Log the constructed translator chain at info level.
    pub dump_chain: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        let enable_avx = detect_avx();
        Self {
            enable_avx,
            enable_vectorize: true,
            vector_width_bits: if enable_avx { 256 } else { 128 },
            dump_chain: false,
        }
    }
}

impl CodegenOptions {
    /// Parse options from a JSON object and validate them.
    pub fn from_json(raw: &str) -> Result<Self> {
        let opts: Self = serde_json::from_str(raw)
            .map_err(|e| QuiverError::InvalidConfig(format!("codegen options: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Build options from `key=value` style pairs on top of the defaults.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut opts = Self::default();
        for (key, value) in pairs {
            match key.trim() {
                "enable_avx" => opts.enable_avx = parse_bool(key, value)?,
                "enable_vectorize" => opts.enable_vectorize = parse_bool(key, value)?,
                "vector_width_bits" => opts.vector_width_bits = parse_usize(key, value)?,
                "dump_chain" => opts.dump_chain = parse_bool(key, value)?,
                other => {
                    return Err(QuiverError::InvalidConfig(format!(
                        "unknown codegen option '{other}'"
                    )));
                }
            }
        }
        opts.validate()?;
        Ok(opts)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VECTOR_WIDTHS.contains(&self.vector_width_bits) {
            return Err(QuiverError::InvalidConfig(format!(
                "vector_width_bits must be one of {SUPPORTED_VECTOR_WIDTHS:?}, got {}",
                self.vector_width_bits
            )));
        }
        Ok(())
    }

    /// Bytes processed per iteration by wide bitmap kernels.
    ///
    /// Without AVX the kernels fall back to one 64-bit word per lane.
    #[must_use]
    pub fn lane_bytes(&self) -> usize {
        if self.enable_avx {
            self.vector_width_bits / 8
        } else {
            8
        }
    }
}

/// Behavior of a stateful processor asked for a result before any input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyInputPolicy {
    /// Finalize the empty accumulator: grouped aggregates yield zero rows,
    /// scalar aggregates yield one row of empty aggregate values.
    #[default]
    Finalize,
    /// Treat the call as a precondition violation.
    Reject,
}

/// Per-deployment batch processor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorConfig {
    /// What a stateful `get_result` does when no batch was processed.
    pub empty_input_policy: EmptyInputPolicy,
    /// Expected rows per input batch; used to presize accumulators.
    pub batch_size_rows: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            empty_input_policy: EmptyInputPolicy::Finalize,
            batch_size_rows: 8192,
        }
    }
}

impl ProcessorConfig {
    /// Build a config from `key=value` style pairs on top of the defaults.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut cfg = Self::default();
        for (key, value) in pairs {
            match key.trim() {
                "empty_input_policy" => {
                    cfg.empty_input_policy = match value.trim().to_ascii_lowercase().as_str() {
                        "finalize" => EmptyInputPolicy::Finalize,
                        "reject" => EmptyInputPolicy::Reject,
                        other => {
                            return Err(QuiverError::InvalidConfig(format!(
                                "invalid empty_input_policy '{other}'"
                            )));
                        }
                    }
                }
                "batch_size_rows" => cfg.batch_size_rows = parse_usize(key, value)?.max(1),
                other => {
                    return Err(QuiverError::InvalidConfig(format!(
                        "unknown processor option '{other}'"
                    )));
                }
            }
        }
        Ok(cfg)
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(QuiverError::InvalidConfig(format!(
            "invalid bool value '{other}' for '{key}'"
        ))),
    }
}

fn parse_usize(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| QuiverError::InvalidConfig(format!("invalid value for '{key}': {e}")))
}

fn detect_avx() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("avx2")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}
