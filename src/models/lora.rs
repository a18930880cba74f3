//! Low-rank adapters over frozen linear and convolutional layers
//!
//! Injection is a construction step: it consumes a [`LayerGraph`] and returns
//! a new one in which every matched layer became `base(x) + scale * up(down(x))`.

use candle_core::{DType, Device, Tensor};
use log::{debug, info};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{FinetuneError, Result};
use crate::models::layers::{conv2d, linear, BaseLayer, Layer, LayerGraph, LayerOp, NamedLayer, Param};
use crate::models::weights::{read_safetensors, write_safetensors};

/// Base layer plus a trainable low-rank pair.
#[derive(Clone, Debug)]
pub struct AdaptedLayer {
    pub base: BaseLayer,
    pub down: Param,
    pub up: Param,
    pub rank: usize,
    pub scale: f64,
}

impl AdaptedLayer {
    /// `down ~ N(0, 1/rank)` and `up = 0`, so a fresh adapter leaves the base
    /// output untouched.
    pub fn new(base: BaseLayer, rank: usize, scale: f64, rng: &mut impl Rng) -> Result<Self> {
        validate_rank(&base.op, rank)?;
        let device = base.weight.tensor().device().clone();
        let (down_shape, up_shape) = adapter_shapes(&base.op, rank)?;

        let normal = Normal::new(0.0f32, 1.0 / rank as f32)
            .map_err(|e| FinetuneError::config(format!("invalid adapter init: {}", e)))?;
        let down_len: usize = down_shape.iter().product();
        let down_data: Vec<f32> = (0..down_len).map(|_| normal.sample(rng)).collect();
        let down = Tensor::from_vec(down_data, down_shape, &device)?;
        let up = Tensor::zeros(up_shape, DType::F32, &device)?;

        Ok(Self {
            base: base.into_frozen(),
            down: Param::Frozen(down).into_trainable()?,
            up: Param::Frozen(up).into_trainable()?,
            rank,
            scale,
        })
    }

    fn from_weights(base: BaseLayer, down: Tensor, up: Tensor, scale: f64) -> Result<Self> {
        let rank = down.dim(0)?;
        validate_rank(&base.op, rank)?;
        let (down_shape, up_shape) = adapter_shapes(&base.op, rank)?;
        if down.dims() != down_shape.as_slice() || up.dims() != up_shape.as_slice() {
            return Err(FinetuneError::Model(format!(
                "adapter shapes {:?}/{:?} do not fit {:?}",
                down.dims(),
                up.dims(),
                base.op
            )));
        }
        Ok(Self {
            base,
            down: Param::Frozen(down),
            up: Param::Frozen(up),
            rank,
            scale,
        })
    }

    pub fn forward(&self, x: &Tensor, compute_dtype: DType) -> Result<Tensor> {
        let base_out = self.base.forward(x, compute_dtype)?;
        let down = self.down.tensor().to_dtype(x.dtype())?;
        let up = self.up.tensor().to_dtype(x.dtype())?;
        let lora_out = match self.base.op {
            LayerOp::Linear { .. } => linear(&linear(x, &down, None)?, &up, None)?,
            LayerOp::Conv2d {
                stride, padding, ..
            } => conv2d(&conv2d(x, &down, None, stride, padding)?, &up, None, 1, 0)?,
            LayerOp::Embedding { .. } => {
                return Err(FinetuneError::Model(
                    "embedding layers cannot carry adapters".to_string(),
                ))
            }
        };
        Ok((base_out + (lora_out * self.scale)?)?)
    }

    pub(crate) fn named_params<'a>(&'a self, path: &str) -> Vec<(String, &'a Param)> {
        let mut params = self.base.named_params(path);
        params.push((format!("{}.lora_down.weight", path), &self.down));
        params.push((format!("{}.lora_up.weight", path), &self.up));
        params
    }

    pub(crate) fn into_frozen(self) -> Self {
        Self {
            base: self.base.into_frozen(),
            down: self.down.into_frozen(),
            up: self.up.into_frozen(),
            rank: self.rank,
            scale: self.scale,
        }
    }

    fn into_adapter_trainable(self) -> Result<Self> {
        Ok(Self {
            down: self.down.into_trainable()?,
            up: self.up.into_trainable()?,
            ..self
        })
    }
}

fn validate_rank(op: &LayerOp, rank: usize) -> Result<()> {
    let limit = op.in_features().min(op.out_features());
    if rank == 0 || rank > limit {
        return Err(FinetuneError::config(format!(
            "adapter rank {} outside 1..={} for {} ({} -> {})",
            rank,
            limit,
            op.class_name(),
            op.in_features(),
            op.out_features()
        )));
    }
    Ok(())
}

fn adapter_shapes(op: &LayerOp, rank: usize) -> Result<(Vec<usize>, Vec<usize>)> {
    match *op {
        LayerOp::Linear {
            in_features,
            out_features,
        } => Ok((vec![rank, in_features], vec![out_features, rank])),
        LayerOp::Conv2d {
            in_channels,
            out_channels,
            kernel,
            ..
        } => Ok((
            vec![rank, in_channels, kernel, kernel],
            vec![out_channels, rank, 1, 1],
        )),
        LayerOp::Embedding { .. } => Err(FinetuneError::config(
            "adapters can only wrap Linear or Conv2d layers",
        )),
    }
}

/// Which layers receive adapters.
#[derive(Debug, Clone, Default)]
pub struct LoraTarget {
    /// Owning block class or path segment; empty matches every block.
    pub modules: Vec<String>,
    /// Leaf names such as `to_q`; empty matches every leaf.
    pub submodules: Vec<String>,
    /// Layer classes to wrap (`Linear`, `Conv2d`).
    pub layer_classes: Vec<String>,
}

impl LoraTarget {
    pub fn matches(&self, named: &NamedLayer) -> bool {
        (self.modules.is_empty() || self.modules.iter().any(|m| named.in_module(m)))
            && (self.submodules.is_empty()
                || self.submodules.iter().any(|s| s == named.leaf_name()))
            && self
                .layer_classes
                .iter()
                .any(|c| c == named.layer.class_name())
    }

    fn validate(&self) -> Result<()> {
        if self.layer_classes.is_empty() {
            return Err(FinetuneError::config("adapter target names no layer class"));
        }
        for class in &self.layer_classes {
            if class != "Linear" && class != "Conv2d" {
                return Err(FinetuneError::config(format!(
                    "adapters cannot wrap layer class {}",
                    class
                )));
            }
        }
        Ok(())
    }
}

/// Adapted layer paths in injection order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterSet {
    pub paths: Vec<String>,
    pub rank: usize,
    /// The adapted layers' own weight and bias are part of the delta.
    pub includes_base: bool,
}

impl AdapterSet {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}

/// Wraps every matched layer with an adapter. Layers that already carry an
/// adapter of the same rank are kept as they are, so reinjection is a no-op.
/// `train_off_target` also unfreezes the wrapped layer's own weight and bias.
pub fn inject(
    graph: LayerGraph,
    target: &LoraTarget,
    rank: usize,
    scale: f64,
    train_off_target: bool,
    rng: &mut impl Rng,
) -> Result<(LayerGraph, AdapterSet)> {
    target.validate()?;
    let (layers, compute_dtype) = graph.into_layers();
    let mut adapters = AdapterSet {
        paths: Vec::new(),
        rank,
        includes_base: train_off_target,
    };

    let mut out = Vec::with_capacity(layers.len());
    for named in layers {
        if !target.matches(&named) {
            out.push(named);
            continue;
        }
        let mut adapted = match named.layer {
            Layer::Adapted(existing) => {
                if existing.rank != rank {
                    return Err(FinetuneError::config(format!(
                        "{} already carries a rank {} adapter",
                        named.path, existing.rank
                    )));
                }
                existing.into_adapter_trainable()?
            }
            Layer::Base(base) => AdaptedLayer::new(base, rank, scale, rng)?,
        };
        if train_off_target {
            adapted.base = adapted.base.into_trainable()?;
        }
        debug!("Injected rank {} adapter into {}", rank, named.path);
        adapters.paths.push(named.path.clone());
        out.push(NamedLayer {
            layer: Layer::Adapted(adapted),
            ..named
        });
    }

    Ok((LayerGraph::rebuild(out, compute_dtype), adapters))
}

/// Adapter weights of one layer.
#[derive(Debug, Clone)]
pub struct AdapterWeights {
    pub path: String,
    pub rank: usize,
    pub scale: f64,
    pub down: Tensor,
    pub up: Tensor,
}

/// Adapters in graph (injection) order.
pub fn extract(graph: &LayerGraph) -> Vec<AdapterWeights> {
    graph
        .iter()
        .filter_map(|named| match &named.layer {
            Layer::Adapted(a) => Some(AdapterWeights {
                path: named.path.clone(),
                rank: a.rank,
                scale: a.scale,
                down: a.down.tensor().clone(),
                up: a.up.tensor().clone(),
            }),
            Layer::Base(_) => None,
        })
        .collect()
}

/// Rescales every adapter's contribution without touching stored weights.
/// Returns the number of adapters touched.
pub fn set_scale(graph: &mut LayerGraph, value: f64) -> usize {
    let mut touched = 0;
    for named in graph.iter_mut() {
        if let Layer::Adapted(a) = &mut named.layer {
            a.scale = value;
            touched += 1;
        }
    }
    touched
}

/// Writes every adapter of `graph`. With `include_base` the adapted layers'
/// own weight and bias go into the same file.
pub fn save_adapters(graph: &LayerGraph, path: &Path, include_base: bool) -> Result<usize> {
    let adapters = extract(graph);
    let mut tensors = Vec::with_capacity(adapters.len() * 4);
    for a in &adapters {
        tensors.push((format!("{}.lora_down.weight", a.path), a.down.clone()));
        tensors.push((format!("{}.lora_up.weight", a.path), a.up.clone()));
    }
    if include_base {
        for named in graph.iter().filter(|n| n.layer.is_adapted()) {
            let base = named.layer.base();
            tensors.push((format!("{}.weight", named.path), base.weight.tensor().clone()));
            if let Some(bias) = &base.bias {
                tensors.push((format!("{}.bias", named.path), bias.tensor().clone()));
            }
        }
    }

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "eri-lora".to_string());
    metadata.insert(
        "order".to_string(),
        adapters
            .iter()
            .map(|a| a.path.as_str())
            .collect::<Vec<_>>()
            .join(","),
    );
    if include_base {
        metadata.insert("base".to_string(), "included".to_string());
    }
    if let Some(first) = adapters.first() {
        metadata.insert("rank".to_string(), first.rank.to_string());
        metadata.insert("scale".to_string(), first.scale.to_string());
    }

    write_safetensors(path, &tensors, metadata)?;
    info!("Saved {} adapters to {}", adapters.len(), path.display());
    Ok(adapters.len())
}

/// Applies saved adapters onto a graph; base layers named in the file are
/// wrapped, existing adapters are overwritten. Saved base weights replace the
/// wrapped layers' own. Loaded adapters are frozen.
pub fn load_adapters(graph: LayerGraph, path: &Path, device: &Device) -> Result<(LayerGraph, AdapterSet)> {
    let (tensors, metadata) = read_safetensors(path, device)?;
    let order: Vec<String> = metadata
        .get("order")
        .map(|o| o.split(',').filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default();
    let scale: f64 = metadata
        .get("scale")
        .and_then(|s| s.parse().ok())
        .unwrap_or(1.0);

    let (layers, compute_dtype) = graph.into_layers();
    let mut by_path: HashMap<String, NamedLayer> = HashMap::new();
    let mut ordering = Vec::with_capacity(layers.len());
    for named in layers {
        ordering.push(named.path.clone());
        by_path.insert(named.path.clone(), named);
    }

    let mut adapters = AdapterSet {
        includes_base: metadata.get("base").map_or(false, |b| b == "included"),
        ..AdapterSet::default()
    };
    for adapter_path in &order {
        let named = by_path.remove(adapter_path).ok_or_else(|| {
            FinetuneError::Model(format!("adapter targets missing layer {}", adapter_path))
        })?;
        let fetch = |suffix: &str| {
            tensors
                .get(&format!("{}.{}", adapter_path, suffix))
                .cloned()
                .ok_or_else(|| FinetuneError::Model(format!("{} lacks {}", adapter_path, suffix)))
        };
        let down = fetch("lora_down.weight")?;
        let up = fetch("lora_up.weight")?;
        let mut base = match named.layer {
            Layer::Base(base) => base,
            Layer::Adapted(a) => a.base,
        };
        if adapters.includes_base {
            let weight = fetch("weight")?;
            let bias = match &base.bias {
                Some(_) => Some(fetch("bias")?),
                None => None,
            };
            base = BaseLayer::new(base.op, weight, bias)?;
        }
        let adapted = AdaptedLayer::from_weights(base, down, up, scale)?;
        adapters.rank = adapted.rank;
        adapters.paths.push(adapter_path.clone());
        by_path.insert(
            adapter_path.clone(),
            NamedLayer {
                layer: Layer::Adapted(adapted),
                ..named
            },
        );
    }

    let layers = ordering
        .into_iter()
        .filter_map(|p| by_path.remove(&p))
        .collect();
    Ok((LayerGraph::rebuild(layers, compute_dtype), adapters))
}
