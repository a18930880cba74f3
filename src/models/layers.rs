//! Explicit layer graph shared by every trainable network
//!
//! Networks keep their weights in a [`LayerGraph`] of named layers. A layer is
//! either a plain [`BaseLayer`] or an [`AdaptedLayer`] wrapping a frozen base
//! with a low-rank pair. Trainability is a property of each [`Param`]: trainable
//! parameters are `Var`s kept in F32, frozen ones are detached tensors that may
//! live in a reduced-precision storage dtype.

use candle_core::{DType, Tensor, Var};
use std::collections::HashMap;

use crate::error::{FinetuneError, Result};
use crate::models::lora::AdaptedLayer;

/// A single weight tensor and its trainability.
#[derive(Clone, Debug)]
pub enum Param {
    Frozen(Tensor),
    Trainable(Var),
}

impl Param {
    pub fn tensor(&self) -> &Tensor {
        match self {
            Param::Frozen(t) => t,
            Param::Trainable(v) => v.as_tensor(),
        }
    }

    pub fn var(&self) -> Option<&Var> {
        match self {
            Param::Frozen(_) => None,
            Param::Trainable(v) => Some(v),
        }
    }

    pub fn is_trainable(&self) -> bool {
        matches!(self, Param::Trainable(_))
    }

    pub fn into_frozen(self) -> Param {
        match self {
            Param::Frozen(t) => Param::Frozen(t),
            Param::Trainable(v) => Param::Frozen(v.as_detached_tensor()),
        }
    }

    /// Master weights of trainable parameters are always F32.
    pub fn into_trainable(self) -> Result<Param> {
        match self {
            Param::Trainable(v) => Ok(Param::Trainable(v)),
            Param::Frozen(t) => {
                let t = t.to_dtype(DType::F32)?;
                Ok(Param::Trainable(Var::from_tensor(&t)?))
            }
        }
    }

    fn cast_frozen(self, dtype: DType) -> Result<Param> {
        match self {
            Param::Frozen(t) => Ok(Param::Frozen(t.to_dtype(dtype)?)),
            trainable => Ok(trainable),
        }
    }

    pub fn elem_count(&self) -> usize {
        self.tensor().elem_count()
    }
}

/// Computation performed by a base layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerOp {
    Linear {
        in_features: usize,
        out_features: usize,
    },
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    },
    Embedding {
        num_embeddings: usize,
        dim: usize,
    },
}

impl LayerOp {
    pub fn class_name(&self) -> &'static str {
        match self {
            LayerOp::Linear { .. } => "Linear",
            LayerOp::Conv2d { .. } => "Conv2d",
            LayerOp::Embedding { .. } => "Embedding",
        }
    }

    pub fn in_features(&self) -> usize {
        match *self {
            LayerOp::Linear { in_features, .. } => in_features,
            LayerOp::Conv2d { in_channels, .. } => in_channels,
            LayerOp::Embedding { num_embeddings, .. } => num_embeddings,
        }
    }

    pub fn out_features(&self) -> usize {
        match *self {
            LayerOp::Linear { out_features, .. } => out_features,
            LayerOp::Conv2d { out_channels, .. } => out_channels,
            LayerOp::Embedding { dim, .. } => dim,
        }
    }

    fn weight_shape(&self) -> Vec<usize> {
        match *self {
            LayerOp::Linear {
                in_features,
                out_features,
            } => vec![out_features, in_features],
            LayerOp::Conv2d {
                in_channels,
                out_channels,
                kernel,
                ..
            } => vec![out_channels, in_channels, kernel, kernel],
            LayerOp::Embedding {
                num_embeddings,
                dim,
            } => vec![num_embeddings, dim],
        }
    }
}

/// Linear: out = input @ weight.T + bias
pub(crate) fn linear(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let w = match *x.dims() {
        [b1, b2, _, _] => weight.broadcast_left((b1, b2))?.t()?,
        [bsize, _, _] => weight.broadcast_left(bsize)?.t()?,
        _ => weight.t()?,
    };
    let out = x.matmul(&w)?;
    match bias {
        Some(b) => Ok(out.broadcast_add(b)?),
        None => Ok(out),
    }
}

pub(crate) fn conv2d(
    x: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    stride: usize,
    padding: usize,
) -> Result<Tensor> {
    let out = x.conv2d(kernel, padding, stride, 1, 1)?;
    match bias {
        Some(b) => {
            let b = b.reshape((1, b.elem_count(), 1, 1))?;
            Ok(out.broadcast_add(&b)?)
        }
        None => Ok(out),
    }
}

/// A frozen-or-trainable layer without adapters.
#[derive(Clone, Debug)]
pub struct BaseLayer {
    pub op: LayerOp,
    pub weight: Param,
    pub bias: Option<Param>,
}

impl BaseLayer {
    pub fn new(op: LayerOp, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let expected = op.weight_shape();
        if weight.dims() != expected.as_slice() {
            return Err(FinetuneError::Model(format!(
                "{} weight has shape {:?}, expected {:?}",
                op.class_name(),
                weight.dims(),
                expected
            )));
        }
        Ok(Self {
            op,
            weight: Param::Frozen(weight),
            bias: bias.map(Param::Frozen),
        })
    }

    pub fn forward(&self, x: &Tensor, compute_dtype: DType) -> Result<Tensor> {
        match self.op {
            LayerOp::Linear { .. } => {
                let w = self.weight.tensor().to_dtype(x.dtype())?;
                let b = match &self.bias {
                    Some(b) => Some(b.tensor().to_dtype(x.dtype())?),
                    None => None,
                };
                linear(x, &w, b.as_ref())
            }
            LayerOp::Conv2d {
                stride, padding, ..
            } => {
                let w = self.weight.tensor().to_dtype(x.dtype())?;
                let b = match &self.bias {
                    Some(b) => Some(b.tensor().to_dtype(x.dtype())?),
                    None => None,
                };
                conv2d(x, &w, b.as_ref(), stride, padding)
            }
            LayerOp::Embedding { dim, .. } => {
                let mut out_dims = x.dims().to_vec();
                out_dims.push(dim);
                let ids = x.flatten_all()?;
                let w = self.weight.tensor().to_dtype(compute_dtype)?;
                Ok(w.index_select(&ids, 0)?.reshape(out_dims)?)
            }
        }
    }

    pub(crate) fn named_params<'a>(&'a self, path: &str) -> Vec<(String, &'a Param)> {
        let mut params = vec![(format!("{}.weight", path), &self.weight)];
        if let Some(bias) = &self.bias {
            params.push((format!("{}.bias", path), bias));
        }
        params
    }

    pub(crate) fn into_frozen(self) -> Self {
        Self {
            op: self.op,
            weight: self.weight.into_frozen(),
            bias: self.bias.map(Param::into_frozen),
        }
    }

    pub(crate) fn into_trainable(self) -> Result<Self> {
        Ok(Self {
            op: self.op,
            weight: self.weight.into_trainable()?,
            bias: self.bias.map(Param::into_trainable).transpose()?,
        })
    }

    fn cast_frozen(self, dtype: DType) -> Result<Self> {
        Ok(Self {
            op: self.op,
            weight: self.weight.cast_frozen(dtype)?,
            bias: self.bias.map(|b| b.cast_frozen(dtype)).transpose()?,
        })
    }

    fn substitute(&self, path: &str, weights: &HashMap<String, Tensor>) -> Self {
        let pick = |name: String, p: &Param| match weights.get(&name) {
            Some(t) => Param::Frozen(t.clone()),
            None => p.clone().into_frozen(),
        };
        Self {
            op: self.op,
            weight: pick(format!("{}.weight", path), &self.weight),
            bias: self.bias.as_ref().map(|b| pick(format!("{}.bias", path), b)),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Layer {
    Base(BaseLayer),
    Adapted(AdaptedLayer),
}

impl Layer {
    pub fn forward(&self, x: &Tensor, compute_dtype: DType) -> Result<Tensor> {
        match self {
            Layer::Base(base) => base.forward(x, compute_dtype),
            Layer::Adapted(adapted) => adapted.forward(x, compute_dtype),
        }
    }

    pub fn base(&self) -> &BaseLayer {
        match self {
            Layer::Base(base) => base,
            Layer::Adapted(adapted) => &adapted.base,
        }
    }

    pub fn class_name(&self) -> &'static str {
        self.base().op.class_name()
    }

    pub fn is_adapted(&self) -> bool {
        matches!(self, Layer::Adapted(_))
    }

    pub(crate) fn named_params<'a>(&'a self, path: &str) -> Vec<(String, &'a Param)> {
        match self {
            Layer::Base(base) => base.named_params(path),
            Layer::Adapted(adapted) => adapted.named_params(path),
        }
    }

    pub(crate) fn into_frozen(self) -> Self {
        match self {
            Layer::Base(base) => Layer::Base(base.into_frozen()),
            Layer::Adapted(adapted) => Layer::Adapted(adapted.into_frozen()),
        }
    }

    fn cast_frozen(self, dtype: DType) -> Result<Self> {
        Ok(match self {
            Layer::Base(base) => Layer::Base(base.cast_frozen(dtype)?),
            Layer::Adapted(mut adapted) => {
                adapted.base = adapted.base.cast_frozen(dtype)?;
                Layer::Adapted(adapted)
            }
        })
    }

    fn substitute(&self, path: &str, weights: &HashMap<String, Tensor>) -> Self {
        match self {
            Layer::Base(base) => Layer::Base(base.substitute(path, weights)),
            Layer::Adapted(adapted) => {
                let mut out = adapted.clone().into_frozen();
                out.base = adapted.base.substitute(path, weights);
                if let Some(t) = weights.get(&format!("{}.lora_down.weight", path)) {
                    out.down = Param::Frozen(t.clone());
                }
                if let Some(t) = weights.get(&format!("{}.lora_up.weight", path)) {
                    out.up = Param::Frozen(t.clone());
                }
                Layer::Adapted(out)
            }
        }
    }
}

/// A layer with its dotted path and the class of the block that owns it.
#[derive(Clone, Debug)]
pub struct NamedLayer {
    pub path: String,
    pub module_class: String,
    pub layer: Layer,
}

impl NamedLayer {
    /// True when `target` names this layer's owning block (by class) or any
    /// dotted prefix/segment run of its path.
    pub fn in_module(&self, target: &str) -> bool {
        self.module_class == target
            || self.path == target
            || self.path.starts_with(&format!("{}.", target))
            || self.path.contains(&format!(".{}.", target))
            || self.path.ends_with(&format!(".{}", target))
    }

    pub fn leaf_name(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }
}

/// Ordered collection of named layers.
#[derive(Clone, Debug)]
pub struct LayerGraph {
    layers: Vec<NamedLayer>,
    index: HashMap<String, usize>,
    compute_dtype: DType,
}

impl Default for LayerGraph {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            index: HashMap::new(),
            compute_dtype: DType::F32,
        }
    }
}

impl LayerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_layers(layers: Vec<NamedLayer>, compute_dtype: DType) -> Result<Self> {
        let mut graph = Self {
            compute_dtype,
            ..Self::default()
        };
        for named in layers {
            graph.insert(named)?;
        }
        Ok(graph)
    }

    fn insert(&mut self, named: NamedLayer) -> Result<()> {
        if self.index.contains_key(&named.path) {
            return Err(FinetuneError::Model(format!(
                "duplicate layer path {}",
                named.path
            )));
        }
        self.index.insert(named.path.clone(), self.layers.len());
        self.layers.push(named);
        Ok(())
    }

    pub fn push(&mut self, path: &str, module_class: &str, layer: BaseLayer) -> Result<()> {
        self.insert(NamedLayer {
            path: path.to_string(),
            module_class: module_class.to_string(),
            layer: Layer::Base(layer),
        })
    }

    pub fn into_layers(self) -> (Vec<NamedLayer>, DType) {
        (self.layers, self.compute_dtype)
    }

    pub fn get(&self, path: &str) -> Option<&NamedLayer> {
        self.index.get(path).map(|&i| &self.layers[i])
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut NamedLayer> {
        match self.index.get(path) {
            Some(&i) => Some(&mut self.layers[i]),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedLayer> {
        self.layers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NamedLayer> {
        self.layers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    pub fn forward(&self, path: &str, x: &Tensor) -> Result<Tensor> {
        let named = self
            .get(path)
            .ok_or_else(|| FinetuneError::Model(format!("no layer at {}", path)))?;
        named.layer.forward(x, self.compute_dtype)
    }

    /// Every parameter in graph order, named `<path>.weight`, `<path>.bias`,
    /// `<path>.lora_down.weight`, `<path>.lora_up.weight`.
    pub fn named_params(&self) -> Vec<(String, &Param)> {
        self.layers
            .iter()
            .flat_map(|named| named.layer.named_params(&named.path))
            .collect()
    }

    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        self.named_params()
            .into_iter()
            .filter_map(|(name, p)| p.var().map(|v| (name, v.clone())))
            .collect()
    }

    pub fn named_tensors(&self) -> Vec<(String, Tensor)> {
        self.named_params()
            .into_iter()
            .map(|(name, p)| (name, p.tensor().clone()))
            .collect()
    }

    pub fn num_parameters(&self) -> (usize, usize) {
        self.named_params()
            .iter()
            .fold((0, 0), |(total, trainable), (_, p)| {
                let n = p.elem_count();
                (total + n, trainable + if p.is_trainable() { n } else { 0 })
            })
    }

    pub fn freeze_all(self) -> Self {
        let (layers, compute_dtype) = self.into_layers();
        let layers = layers
            .into_iter()
            .map(|named| NamedLayer {
                layer: named.layer.into_frozen(),
                ..named
            })
            .collect();
        Self::rebuild(layers, compute_dtype)
    }

    /// Casts frozen weights to a storage dtype; trainable weights stay F32.
    pub fn cast_frozen(self, dtype: DType) -> Result<Self> {
        let (layers, compute_dtype) = self.into_layers();
        let layers = layers
            .into_iter()
            .map(|named| {
                Ok(NamedLayer {
                    layer: named.layer.cast_frozen(dtype)?,
                    ..named
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::rebuild(layers, compute_dtype))
    }

    /// Frozen copy of this graph with the named weights replaced.
    pub fn with_weights(&self, weights: &HashMap<String, Tensor>) -> Self {
        let layers = self
            .layers
            .iter()
            .map(|named| NamedLayer {
                path: named.path.clone(),
                module_class: named.module_class.clone(),
                layer: named.layer.substitute(&named.path, weights),
            })
            .collect();
        Self::rebuild(layers, self.compute_dtype)
    }

    // Paths were unique in the graph the layers came from.
    pub(crate) fn rebuild(layers: Vec<NamedLayer>, compute_dtype: DType) -> Self {
        let index = layers
            .iter()
            .enumerate()
            .map(|(i, named)| (named.path.clone(), i))
            .collect();
        Self {
            layers,
            index,
            compute_dtype,
        }
    }
}
