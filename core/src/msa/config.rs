use crate::tensor::{Result, TensorError};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_transition_factor() -> usize {
    4
}

fn default_p_drop() -> f64 {
    0.15
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_inf() -> f64 {
    1e9
}

/// Hyper-parameters of an MSA stack.
///
/// ```rust
/// use evoformer_rs::msa::MsaStackConfig;
///
/// let config = MsaStackConfig::from_json_str(r#"{
///     "d_node": 64, "d_pair": 32,
///     "row_c": 8, "row_heads": 4,
///     "col_c": 8, "col_heads": 4
/// }"#).unwrap();
/// assert_eq!(config.transition_factor, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsaStackConfig {
    /// Channels of the MSA representation.
    pub d_node: usize,
    /// Channels of the pair representation.
    pub d_pair: usize,
    /// Per-head width of row attention.
    pub row_c: usize,
    pub row_heads: usize,
    /// Per-head width of column attention.
    pub col_c: usize,
    pub col_heads: usize,
    #[serde(default = "default_transition_factor")]
    pub transition_factor: usize,
    /// Dropout rate after row attention.
    #[serde(default = "default_p_drop")]
    pub p_drop: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    /// Magnitude of the additive bias on masked logits.
    #[serde(default = "default_inf")]
    pub inf: f64,
}

impl MsaStackConfig {
    /// The main MSA stack: 8 heads of width 32 for both attentions.
    pub fn msa(d_node: usize, d_pair: usize) -> Self {
        Self::with_heads(d_node, d_pair, 32, 8)
    }

    /// The extra MSA stack: 8 heads of width 8 for both attentions.
    pub fn extra_msa(d_node: usize, d_pair: usize) -> Self {
        Self::with_heads(d_node, d_pair, 8, 8)
    }

    fn with_heads(d_node: usize, d_pair: usize, c: usize, heads: usize) -> Self {
        Self {
            d_node,
            d_pair,
            row_c: c,
            row_heads: heads,
            col_c: c,
            col_heads: heads,
            transition_factor: default_transition_factor(),
            p_drop: default_p_drop(),
            layer_norm_eps: default_layer_norm_eps(),
            inf: default_inf(),
        }
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TensorError::Config(format!("invalid MSA stack config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            TensorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TensorError::Config(format!("cannot serialize config: {e}")))
    }

    /// Rejects zero-sized dimensions and out-of-range rates.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("d_node", self.d_node),
            ("d_pair", self.d_pair),
            ("row_c", self.row_c),
            ("row_heads", self.row_heads),
            ("col_c", self.col_c),
            ("col_heads", self.col_heads),
            ("transition_factor", self.transition_factor),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(TensorError::Config(format!("{name} must be positive")));
        }
        if !(0.0..1.0).contains(&self.p_drop) {
            return Err(TensorError::Config(format!(
                "p_drop must be in [0, 1), got {}",
                self.p_drop
            )));
        }
        if self.layer_norm_eps.is_nan() || self.layer_norm_eps <= 0.0 {
            return Err(TensorError::Config("layer_norm_eps must be positive".into()));
        }
        if self.inf.is_nan() || self.inf <= 0.0 {
            return Err(TensorError::Config("inf must be positive".into()));
        }
        Ok(())
    }
}
