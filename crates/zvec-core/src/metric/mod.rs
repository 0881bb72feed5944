//! Named metrics and their registry.
//!
//! A [`Metric`] couples a kernel set with the preprocessing that makes the
//! kernel's assumptions true: cosine normalizes both sides, the MIPS lift
//! injects extra dimensions, the quantized-integer wrapper restates an
//! origin metric over INT8 codes. Metrics are created by name through a
//! table built once at startup; nothing registers itself from static
//! constructors.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::config::ParamMap;
use crate::element::ElementType;
use crate::error::{Error, Result};
use crate::kernels::{self, scalar, KernelMetric, KernelSet};

/// Built-in metric names.
pub const INNER_PRODUCT: &str = "inner_product";
/// Squared Euclidean distance.
pub const SQUARED_EUCLIDEAN: &str = "squared_euclidean";
/// Cosine distance over unit-normalized vectors.
pub const COSINE: &str = "cosine";
/// Asymmetric MIPS-to-Euclidean lift.
pub const MIPS_SQUARED_EUCLIDEAN: &str = "mips_squared_euclidean";
/// Origin metric restated over integer codes.
pub const QUANTIZED_INTEGER: &str = "quantized_integer";

/// Parameters of the MIPS lift.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MipsParams {
    /// Number of injected dimensions.
    pub m: u32,
    /// Norm bound after scaling.
    pub u: f32,
    /// Largest L2 norm over the corpus; scales vectors into the bound.
    pub max_l2_norm: f32,
    /// 0 = append injected lanes, 1 = prepend.
    pub injection_type: u8,
}

impl Default for MipsParams {
    fn default() -> Self {
        Self {
            m: 1,
            u: 1.0,
            max_l2_norm: 1.0,
            injection_type: 0,
        }
    }
}

impl MipsParams {
    fn from_params(params: &ParamMap) -> Result<Self> {
        let defaults = Self::default();
        let get_f32 = |key: &str, default: f32| -> Result<f32> {
            match params.get(key) {
                None => Ok(default),
                Some(raw) => raw.parse().map_err(|_| {
                    Error::InvalidArgument(format!("bad value '{raw}' for key '{key}'"))
                }),
            }
        };
        let m = match params.get("mips_euclidean.metric.m_value") {
            None => defaults.m,
            Some(raw) => raw.parse().map_err(|_| {
                Error::InvalidArgument(format!("bad value '{raw}' for m_value"))
            })?,
        };
        let injection_type = match params.get("mips_euclidean.metric.injection_type") {
            None => defaults.injection_type,
            Some(raw) => raw.parse().map_err(|_| {
                Error::InvalidArgument(format!("bad value '{raw}' for injection_type"))
            })?,
        };
        let out = Self {
            m,
            u: get_f32("mips_euclidean.metric.u_value", defaults.u)?,
            max_l2_norm: get_f32("mips_euclidean.metric.max_l2_norm", defaults.max_l2_norm)?,
            injection_type,
        };
        if out.m == 0 {
            return Err(Error::InvalidArgument(
                "mips_euclidean.metric.m_value must be >= 1".into(),
            ));
        }
        if out.max_l2_norm <= 0.0 || out.u <= 0.0 {
            return Err(Error::InvalidArgument(
                "mips_euclidean norms must be positive".into(),
            ));
        }
        if out.injection_type > 1 {
            return Err(Error::InvalidArgument(format!(
                "unknown injection_type {}",
                out.injection_type
            )));
        }
        Ok(out)
    }
}

/// Serializable identity of a metric, stored in the `metric.params` blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricMeta {
    /// Registered name.
    pub name: String,
    /// MIPS parameters when the name requires them.
    pub mips: Option<MipsParams>,
    /// Origin metric name for the quantized-integer wrapper.
    pub origin: Option<String>,
}

/// A named metric bound to kernels for one element type.
#[derive(Debug, Clone)]
pub struct Metric {
    meta: MetricMeta,
    element: ElementType,
    kernels: &'static KernelSet,
}

impl Metric {
    /// Creates a metric by registered name.
    pub fn create(name: &str, element: ElementType, params: &ParamMap) -> Result<Self> {
        let table = registry();
        let ctor = table.get(name).ok_or_else(|| {
            Error::Unsupported(format!("unknown metric '{name}'"))
        })?;
        ctor(element, params)
    }

    /// Recreates a metric from its stored blob.
    pub fn from_meta(meta: &MetricMeta, element: ElementType) -> Result<Self> {
        let mut params = ParamMap::new();
        if let Some(mips) = &meta.mips {
            params.insert("mips_euclidean.metric.m_value".into(), mips.m.to_string());
            params.insert("mips_euclidean.metric.u_value".into(), mips.u.to_string());
            params.insert(
                "mips_euclidean.metric.max_l2_norm".into(),
                mips.max_l2_norm.to_string(),
            );
            params.insert(
                "mips_euclidean.metric.injection_type".into(),
                mips.injection_type.to_string(),
            );
        }
        if let Some(origin) = &meta.origin {
            params.insert(
                "quantized_integer.metric.origin_metric_name".into(),
                origin.clone(),
            );
        }
        Self::create(&meta.name, element, &params)
    }

    /// Registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Serializable identity.
    #[must_use]
    pub fn meta(&self) -> &MetricMeta {
        &self.meta
    }

    /// Element type the kernels decode.
    #[must_use]
    pub fn element(&self) -> ElementType {
        self.element
    }

    /// Bound kernel set.
    #[must_use]
    pub fn kernels(&self) -> &'static KernelSet {
        self.kernels
    }

    /// Dimensions actually stored for a user-facing dimension.
    ///
    /// Only the MIPS lift differs: it stores `dim + m` elements.
    #[must_use]
    pub fn storage_dimension(&self, dimension: usize) -> usize {
        match &self.meta.mips {
            Some(mips) => dimension + mips.m as usize,
            None => dimension,
        }
    }

    /// Rewrites a vector before it is stored.
    ///
    /// Cosine normalizes; the MIPS lift scales into the norm bound and
    /// fills the injected lanes with the norm complement.
    pub fn store_preprocess(&self, vector: &mut Vec<f32>) -> Result<()> {
        match self.meta.name.as_str() {
            COSINE => {
                scalar::normalize_f32(vector);
                Ok(())
            }
            MIPS_SQUARED_EUCLIDEAN => {
                let mips = self.meta.mips.as_ref().expect("mips metric has params");
                let scale = mips.u / mips.max_l2_norm;
                for value in vector.iter_mut() {
                    *value *= scale;
                }
                let norm_sq = scalar::dot_f32(vector, vector);
                let complement = (mips.u * mips.u - norm_sq).max(0.0).sqrt();
                let mut injected = vec![0.0f32; mips.m as usize];
                injected[0] = complement;
                if mips.injection_type == 0 {
                    vector.extend_from_slice(&injected);
                } else {
                    injected.extend_from_slice(vector);
                    *vector = injected;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Rewrites a query in place before searching.
    ///
    /// The rewrite may change the query's length (MIPS lift).
    pub fn query_preprocess(&self, query: &mut Vec<f32>) -> Result<()> {
        match self.meta.name.as_str() {
            COSINE => {
                scalar::normalize_f32(query);
                Ok(())
            }
            MIPS_SQUARED_EUCLIDEAN => {
                let mips = self.meta.mips.as_ref().expect("mips metric has params");
                let scale = mips.u / mips.max_l2_norm;
                for value in query.iter_mut() {
                    *value *= scale;
                }
                // Injected lanes carry no query mass.
                let injected = vec![0.0f32; mips.m as usize];
                if mips.injection_type == 0 {
                    query.extend_from_slice(&injected);
                } else {
                    let mut out = injected;
                    out.extend_from_slice(query);
                    *query = out;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

type MetricCtor = fn(ElementType, &ParamMap) -> Result<Metric>;

fn make_simple(
    name: &'static str,
    kind: KernelMetric,
) -> impl Fn(ElementType, &ParamMap) -> Result<Metric> {
    move |element, _params| {
        Ok(Metric {
            meta: MetricMeta {
                name: name.to_string(),
                mips: None,
                origin: None,
            },
            element,
            kernels: kernels::kernel_set(element, kind)?,
        })
    }
}

fn ctor_inner_product(element: ElementType, params: &ParamMap) -> Result<Metric> {
    make_simple(INNER_PRODUCT, KernelMetric::InnerProduct)(element, params)
}

fn ctor_squared_euclidean(element: ElementType, params: &ParamMap) -> Result<Metric> {
    make_simple(SQUARED_EUCLIDEAN, KernelMetric::SquaredEuclidean)(element, params)
}

fn ctor_cosine(element: ElementType, params: &ParamMap) -> Result<Metric> {
    make_simple(COSINE, KernelMetric::Cosine)(element, params)
}

fn ctor_mips(element: ElementType, params: &ParamMap) -> Result<Metric> {
    let mips = MipsParams::from_params(params)?;
    Ok(Metric {
        meta: MetricMeta {
            name: MIPS_SQUARED_EUCLIDEAN.to_string(),
            mips: Some(mips),
            origin: None,
        },
        element,
        kernels: kernels::kernel_set(element, KernelMetric::SquaredEuclidean)?,
    })
}

fn ctor_quantized_integer(element: ElementType, params: &ParamMap) -> Result<Metric> {
    if element != ElementType::Int8 {
        return Err(Error::Unsupported(format!(
            "quantized_integer requires int8 storage, got '{}'",
            element.name()
        )));
    }
    let origin = params
        .get("quantized_integer.metric.origin_metric_name")
        .cloned()
        .unwrap_or_else(|| INNER_PRODUCT.to_string());
    let kind = match origin.as_str() {
        INNER_PRODUCT => KernelMetric::InnerProduct,
        SQUARED_EUCLIDEAN => KernelMetric::SquaredEuclidean,
        other => {
            return Err(Error::Unsupported(format!(
                "quantized_integer cannot wrap origin metric '{other}'"
            )))
        }
    };
    Ok(Metric {
        meta: MetricMeta {
            name: QUANTIZED_INTEGER.to_string(),
            mips: None,
            origin: Some(origin),
        },
        element,
        kernels: kernels::kernel_set(element, kind)?,
    })
}

fn registry() -> &'static HashMap<&'static str, MetricCtor> {
    static TABLE: OnceLock<HashMap<&'static str, MetricCtor>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: HashMap<&'static str, MetricCtor> = HashMap::new();
        table.insert(INNER_PRODUCT, ctor_inner_product);
        table.insert(SQUARED_EUCLIDEAN, ctor_squared_euclidean);
        table.insert(COSINE, ctor_cosine);
        table.insert(MIPS_SQUARED_EUCLIDEAN, ctor_mips);
        table.insert(QUANTIZED_INTEGER, ctor_quantized_integer);
        table
    })
}

/// Names of all registered metrics.
#[must_use]
pub fn registered_metrics() -> Vec<&'static str> {
    let mut names: Vec<_> = registry().keys().copied().collect();
    names.sort_unstable();
    names
}
