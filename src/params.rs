//! Model selectors and per-model coefficient sets.
//!
//! Each parameter set is a plain serde struct whose `Default` carries the
//! published thesis defaults. Coefficient maps coming from a caller are
//! parsed with [`ModelParams::from_value`]: unknown fields are ignored,
//! missing required fields fail with `InvalidParameter`, and every set is
//! checked by `validate()` before a run starts.
//!
//! ## Invariants
//!
//! - Coefficients (λ, α, σ², γ², s, step sizes) are finite and strictly positive
//! - Learning rates are finite and non-negative
//! - Iteration caps and sample counts are at least 1

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DenoiseError, DenoiseResult};

// ============================================================================
// Model selector
// ============================================================================

/// Which energy model a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "GMRF")]
    Gmrf,
    #[serde(rename = "HGMRF")]
    Hgmrf,
    #[serde(rename = "rTV-MRF")]
    Tv,
    #[serde(rename = "LC-MRF")]
    LogCosh,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Gmrf,
        ModelKind::Hgmrf,
        ModelKind::Tv,
        ModelKind::LogCosh,
    ];

    /// Wire name of the model.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Gmrf => "GMRF",
            ModelKind::Hgmrf => "HGMRF",
            ModelKind::Tv => "rTV-MRF",
            ModelKind::LogCosh => "LC-MRF",
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> DenoiseResult<Self> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| DenoiseError::invalid_parameter("model", format!("unknown model `{name}`")))
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Validation helpers
// ============================================================================

fn check_positive(field: &str, value: f64) -> DenoiseResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(DenoiseError::invalid_parameter(
            field,
            format!("must be finite and > 0, got {value}"),
        ))
    }
}

fn check_rate(field: &str, value: f64) -> DenoiseResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(DenoiseError::invalid_parameter(
            field,
            format!("must be finite and >= 0, got {value}"),
        ))
    }
}

fn check_count(field: &str, value: usize) -> DenoiseResult<()> {
    if value >= 1 {
        Ok(())
    } else {
        Err(DenoiseError::invalid_parameter(field, "must be >= 1"))
    }
}

fn check_tolerance(value: Option<f64>) -> DenoiseResult<()> {
    match value {
        Some(tol) => check_positive("tolerance", tol),
        None => Ok(()),
    }
}

fn default_rho() -> f64 {
    1.0
}

// ============================================================================
// GMRF
// ============================================================================

/// Gaussian MRF coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GmrfParams {
    /// Site precision λ.
    pub lambda: f64,
    /// Edge smoothing strength α.
    pub alpha: f64,
    /// Observation noise variance σ².
    pub sigma_sq: f64,
    pub max_iter: usize,
    pub eta_lambda: f64,
    pub eta_alpha: f64,
    #[serde(default)]
    pub is_learning: bool,
    /// Stop early once the mean absolute per-site change drops below this.
    #[serde(default)]
    pub tolerance: Option<f64>,
}

impl Default for GmrfParams {
    fn default() -> Self {
        Self {
            lambda: 1e-7,
            alpha: 1e-4,
            sigma_sq: 1000.0,
            max_iter: 50,
            eta_lambda: 1e-12,
            eta_alpha: 5e-7,
            is_learning: true,
            tolerance: None,
        }
    }
}

impl GmrfParams {
    pub fn validate(&self) -> DenoiseResult<()> {
        check_positive("lambda", self.lambda)?;
        check_positive("alpha", self.alpha)?;
        check_positive("sigma_sq", self.sigma_sq)?;
        check_count("max_iter", self.max_iter)?;
        check_rate("eta_lambda", self.eta_lambda)?;
        check_rate("eta_alpha", self.eta_alpha)?;
        check_tolerance(self.tolerance)
    }
}

// ============================================================================
// HGMRF
// ============================================================================

/// Hierarchical Gaussian MRF coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HgmrfParams {
    pub lambda: f64,
    pub alpha: f64,
    pub sigma_sq: f64,
    /// Variance of the latent bias field.
    pub gamma_sq: f64,
    pub max_iter: usize,
    pub eta_lambda: f64,
    pub eta_alpha: f64,
    pub eta_gamma2: f64,
    #[serde(default)]
    pub is_learning: bool,
    /// Keep the full likelihood trace and log every coefficient update.
    #[serde(default)]
    pub verify_likelihood: bool,
    #[serde(default)]
    pub tolerance: Option<f64>,
}

impl Default for HgmrfParams {
    fn default() -> Self {
        Self {
            lambda: 1e-7,
            alpha: 1e-4,
            sigma_sq: 1000.0,
            gamma_sq: 1e-3,
            max_iter: 100,
            eta_lambda: 1e-12,
            eta_alpha: 5e-8,
            eta_gamma2: 5e-8,
            is_learning: true,
            verify_likelihood: false,
            tolerance: None,
        }
    }
}

impl HgmrfParams {
    pub fn validate(&self) -> DenoiseResult<()> {
        check_positive("lambda", self.lambda)?;
        check_positive("alpha", self.alpha)?;
        check_positive("sigma_sq", self.sigma_sq)?;
        check_positive("gamma_sq", self.gamma_sq)?;
        check_count("max_iter", self.max_iter)?;
        check_rate("eta_lambda", self.eta_lambda)?;
        check_rate("eta_alpha", self.eta_alpha)?;
        check_rate("eta_gamma2", self.eta_gamma2)?;
        check_tolerance(self.tolerance)
    }
}

// ============================================================================
// rTV-MRF
// ============================================================================

/// Relaxed total-variation MRF coefficients. No online learning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TvParams {
    pub lambda: f64,
    pub alpha: f64,
    pub sigma_sq: f64,
    pub max_iter: usize,
    /// Augmented-Lagrangian penalty ρ.
    #[serde(default = "default_rho")]
    pub rho: f64,
    #[serde(default)]
    pub tolerance: Option<f64>,
}

impl Default for TvParams {
    fn default() -> Self {
        Self {
            lambda: 1e-7,
            alpha: 0.05,
            sigma_sq: 100.0,
            max_iter: 50,
            rho: default_rho(),
            tolerance: None,
        }
    }
}

impl TvParams {
    pub fn validate(&self) -> DenoiseResult<()> {
        check_positive("lambda", self.lambda)?;
        check_positive("alpha", self.alpha)?;
        check_positive("sigma_sq", self.sigma_sq)?;
        check_count("max_iter", self.max_iter)?;
        check_positive("rho", self.rho)?;
        check_tolerance(self.tolerance)
    }
}

// ============================================================================
// LC-MRF
// ============================================================================

/// Log-cosh MRF coefficients, including the scale sampler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LcParams {
    pub lambda: f64,
    pub alpha: f64,
    pub sigma_sq: f64,
    /// Sharpness s of ln cosh(s·d)/s.
    pub s: f64,
    pub epsilon_map: f64,
    pub epsilon_pri: f64,
    pub epsilon_post: f64,
    pub n_pri: usize,
    pub n_post: usize,
    pub t_hat_max: usize,
    pub t_dot_max: usize,
    pub eta_lambda: f64,
    pub eta_alpha: f64,
    pub eta_sigma2: f64,
    pub max_iter: usize,
    #[serde(default)]
    pub is_learning: bool,
    /// Sampler seed; entropy-seeded when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub tolerance: Option<f64>,
}

impl Default for LcParams {
    fn default() -> Self {
        Self {
            lambda: 1e-7,
            alpha: 0.15,
            sigma_sq: 10.0,
            s: 30.0,
            epsilon_map: 1.0,
            epsilon_pri: 1e-4,
            epsilon_post: 1e-4,
            n_pri: 5,
            n_post: 5,
            t_hat_max: 10,
            t_dot_max: 10,
            eta_lambda: 1e-14,
            eta_alpha: 5e-8,
            eta_sigma2: 1.0,
            max_iter: 10,
            is_learning: true,
            seed: None,
            tolerance: None,
        }
    }
}

impl LcParams {
    pub fn validate(&self) -> DenoiseResult<()> {
        check_positive("lambda", self.lambda)?;
        check_positive("alpha", self.alpha)?;
        check_positive("sigma_sq", self.sigma_sq)?;
        check_positive("s", self.s)?;
        check_positive("epsilon_map", self.epsilon_map)?;
        check_positive("epsilon_pri", self.epsilon_pri)?;
        check_positive("epsilon_post", self.epsilon_post)?;
        check_count("n_pri", self.n_pri)?;
        check_count("n_post", self.n_post)?;
        check_count("t_hat_max", self.t_hat_max)?;
        check_count("t_dot_max", self.t_dot_max)?;
        check_rate("eta_lambda", self.eta_lambda)?;
        check_rate("eta_alpha", self.eta_alpha)?;
        check_rate("eta_sigma2", self.eta_sigma2)?;
        check_count("max_iter", self.max_iter)?;
        check_tolerance(self.tolerance)
    }
}

// ============================================================================
// Tagged union
// ============================================================================

/// Coefficients for one run, tagged by model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelParams {
    Gmrf(GmrfParams),
    Hgmrf(HgmrfParams),
    Tv(TvParams),
    LogCosh(LcParams),
}

impl ModelParams {
    /// Thesis defaults for `kind`.
    pub fn defaults(kind: ModelKind) -> Self {
        match kind {
            ModelKind::Gmrf => ModelParams::Gmrf(GmrfParams::default()),
            ModelKind::Hgmrf => ModelParams::Hgmrf(HgmrfParams::default()),
            ModelKind::Tv => ModelParams::Tv(TvParams::default()),
            ModelKind::LogCosh => ModelParams::LogCosh(LcParams::default()),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            ModelParams::Gmrf(_) => ModelKind::Gmrf,
            ModelParams::Hgmrf(_) => ModelKind::Hgmrf,
            ModelParams::Tv(_) => ModelKind::Tv,
            ModelParams::LogCosh(_) => ModelKind::LogCosh,
        }
    }

    /// Parse and validate a coefficient map for `kind`.
    pub fn from_value(kind: ModelKind, value: Value) -> DenoiseResult<Self> {
        let params = match kind {
            ModelKind::Gmrf => ModelParams::Gmrf(parse_map(value)?),
            ModelKind::Hgmrf => ModelParams::Hgmrf(parse_map(value)?),
            ModelKind::Tv => ModelParams::Tv(parse_map(value)?),
            ModelKind::LogCosh => ModelParams::LogCosh(parse_map(value)?),
        };
        params.validate()?;
        Ok(params)
    }

    /// Parse and validate a JSON coefficient map for `kind`.
    pub fn from_json(kind: ModelKind, json: &str) -> DenoiseResult<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| DenoiseError::invalid_parameter("params", format!("JSON parse error: {e}")))?;
        Self::from_value(kind, value)
    }

    pub fn validate(&self) -> DenoiseResult<()> {
        match self {
            ModelParams::Gmrf(p) => p.validate(),
            ModelParams::Hgmrf(p) => p.validate(),
            ModelParams::Tv(p) => p.validate(),
            ModelParams::LogCosh(p) => p.validate(),
        }
    }

    pub fn max_iter(&self) -> usize {
        match self {
            ModelParams::Gmrf(p) => p.max_iter,
            ModelParams::Hgmrf(p) => p.max_iter,
            ModelParams::Tv(p) => p.max_iter,
            ModelParams::LogCosh(p) => p.max_iter,
        }
    }

    pub fn tolerance(&self) -> Option<f64> {
        match self {
            ModelParams::Gmrf(p) => p.tolerance,
            ModelParams::Hgmrf(p) => p.tolerance,
            ModelParams::Tv(p) => p.tolerance,
            ModelParams::LogCosh(p) => p.tolerance,
        }
    }

    /// Serialize back into a coefficient map.
    pub fn to_value(&self) -> Value {
        let value = match self {
            ModelParams::Gmrf(p) => serde_json::to_value(p),
            ModelParams::Hgmrf(p) => serde_json::to_value(p),
            ModelParams::Tv(p) => serde_json::to_value(p),
            ModelParams::LogCosh(p) => serde_json::to_value(p),
        };
        value.unwrap_or(Value::Null)
    }
}

fn parse_map<T: serde::de::DeserializeOwned>(value: Value) -> DenoiseResult<T> {
    if !value.is_object() {
        return Err(DenoiseError::invalid_parameter(
            "params",
            "expected a coefficient map",
        ));
    }
    serde_json::from_value(value).map_err(|e| {
        let message = e.to_string();
        // serde reports missing fields as: missing field `name`
        let field = message
            .split('`')
            .nth(1)
            .filter(|_| message.starts_with("missing field"))
            .unwrap_or("params")
            .to_string();
        DenoiseError::InvalidParameter {
            field,
            reason: message,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_kind_names() {
        assert_eq!(ModelKind::Tv.to_string(), "rTV-MRF");
        assert_eq!(ModelKind::parse("LC-MRF").unwrap(), ModelKind::LogCosh);
        assert!(ModelKind::parse("TV").is_err());
        let kind: ModelKind = serde_json::from_value(json!("HGMRF")).unwrap();
        assert_eq!(kind, ModelKind::Hgmrf);
    }

    #[test]
    fn test_defaults_validate() {
        for kind in ModelKind::ALL {
            let params = ModelParams::defaults(kind);
            assert_eq!(params.kind(), kind);
            params.validate().unwrap();
        }
    }

    #[test]
    fn test_from_value_ignores_unknown_fields() {
        let params = ModelParams::from_value(
            ModelKind::Tv,
            json!({
                "lambda": 1e-7, "alpha": 0.05, "sigma_sq": 100.0,
                "max_iter": 5, "is_learning": false, "colour": "blue"
            }),
        )
        .unwrap();
        match params {
            ModelParams::Tv(p) => {
                assert_eq!(p.max_iter, 5);
                assert_eq!(p.rho, 1.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_from_value_missing_field() {
        let err = ModelParams::from_value(
            ModelKind::Gmrf,
            json!({ "lambda": 1e-7, "sigma_sq": 1000.0, "max_iter": 5,
                    "eta_lambda": 0.0, "eta_alpha": 0.0 }),
        )
        .unwrap_err();
        match err {
            DenoiseError::InvalidParameter { field, .. } => assert_eq!(field, "alpha"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_non_positive_coefficient_rejected() {
        let mut value = ModelParams::defaults(ModelKind::LogCosh).to_value();
        value["s"] = json!(0.0);
        let err = ModelParams::from_value(ModelKind::LogCosh, value).unwrap_err();
        assert!(matches!(err, DenoiseError::InvalidParameter { ref field, .. } if field == "s"));

        let params = GmrfParams {
            lambda: -1.0,
            ..GmrfParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_learning_rate_may_be_zero_but_not_negative() {
        let mut params = HgmrfParams {
            eta_gamma2: 0.0,
            ..HgmrfParams::default()
        };
        params.validate().unwrap();
        params.eta_gamma2 = -1e-9;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_zero_iteration_cap_rejected() {
        let params = TvParams {
            max_iter: 0,
            ..TvParams::default()
        };
        assert!(matches!(
            params.validate(),
            Err(DenoiseError::InvalidParameter { ref field, .. }) if field == "max_iter"
        ));
    }

    #[test]
    fn test_optional_flags_default_off() {
        let params: HgmrfParams = serde_json::from_value(json!({
            "lambda": 1e-7, "alpha": 1e-4, "sigma_sq": 1000.0, "gamma_sq": 1e-3,
            "max_iter": 3, "eta_lambda": 0.0, "eta_alpha": 0.0, "eta_gamma2": 0.0
        }))
        .unwrap();
        assert!(!params.is_learning);
        assert!(!params.verify_likelihood);
        assert_eq!(params.tolerance, None);
    }

    #[test]
    fn test_from_json_rejects_non_map() {
        assert!(ModelParams::from_json(ModelKind::Gmrf, "[1, 2]").is_err());
        assert!(ModelParams::from_json(ModelKind::Gmrf, "{not json").is_err());
    }
}
