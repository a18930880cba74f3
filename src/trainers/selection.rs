//! Trainable parameter carving
//!
//! Every parameter of a model is frozen first; then either whole matching
//! layers are unfrozen or low-rank adapters are injected into them. The result
//! is a [`TrainableParameterSet`] that the step loop treats as immutable.

use candle_core::Var;
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{FinetuneError, Result};
use crate::models::layers::{Layer, LayerGraph, NamedLayer};
use crate::models::lora::{self, AdapterSet, LoraTarget};

/// Which parameters of one model train.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionSpec {
    /// Owning block classes or path segments to train. Empty trains nothing.
    pub module_or_class: Vec<String>,
    /// Restricts training to these leaf layers inside the matched blocks.
    pub submodule: Vec<String>,
    /// Layer classes that receive adapters. Empty means full-weight training.
    pub lora_layer: Vec<String>,
    pub lora_rank: usize,
    pub lora_scale: f64,
    /// Also train the adapted layers' own weight and bias.
    pub lora_train_off_target: bool,
}

impl Default for SelectionSpec {
    fn default() -> Self {
        Self {
            module_or_class: Vec::new(),
            submodule: Vec::new(),
            lora_layer: Vec::new(),
            lora_rank: 4,
            lora_scale: 1.0,
            lora_train_off_target: false,
        }
    }
}

impl SelectionSpec {
    pub fn uses_adapters(&self) -> bool {
        !self.module_or_class.is_empty() && !self.lora_layer.is_empty()
    }

    fn matches(&self, named: &NamedLayer) -> bool {
        self.module_or_class.iter().any(|m| named.in_module(m))
            && (self.submodule.is_empty() || self.submodule.iter().any(|s| s == named.leaf_name()))
    }
}

/// Per-model trainability, produced once at setup.
#[derive(Debug, Clone)]
pub struct TrainableParameterSet {
    model: String,
    flags: BTreeMap<String, bool>,
    vars: Vec<(String, Var)>,
    learning_rate: f64,
    adapters: Option<AdapterSet>,
}

impl TrainableParameterSet {
    fn from_graph(model: &str, graph: &LayerGraph, learning_rate: f64, adapters: Option<AdapterSet>) -> Self {
        let flags = graph
            .named_params()
            .into_iter()
            .map(|(name, p)| (name, p.is_trainable()))
            .collect();
        Self {
            model: model.to_string(),
            flags,
            vars: graph.trainable_vars(),
            learning_rate,
            adapters,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn has_any_trainable(&self) -> bool {
        !self.vars.is_empty()
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn is_trainable(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn flags(&self) -> &BTreeMap<String, bool> {
        &self.flags
    }

    pub fn vars(&self) -> &[(String, Var)] {
        &self.vars
    }

    pub fn adapters(&self) -> Option<&AdapterSet> {
        self.adapters.as_ref()
    }

    pub fn num_trainable_elements(&self) -> usize {
        self.vars.iter().map(|(_, v)| v.elem_count()).sum()
    }

    pub fn require_non_empty(&self) -> Result<()> {
        if self.has_any_trainable() {
            Ok(())
        } else {
            Err(FinetuneError::config(format!(
                "no trainable parameters selected in {}",
                self.model
            )))
        }
    }
}

/// Freezes `graph`, then unfreezes or adapts what `spec` selects.
/// Applying the same spec twice yields the same trainable set.
pub fn select_trainable(
    model: &str,
    graph: LayerGraph,
    spec: &SelectionSpec,
    learning_rate: f64,
    rng: &mut impl Rng,
) -> Result<(LayerGraph, TrainableParameterSet)> {
    let graph = graph.freeze_all();

    if spec.module_or_class.is_empty() {
        let set = TrainableParameterSet::from_graph(model, &graph, learning_rate, None);
        return Ok((graph, set));
    }

    let (graph, adapters) = if spec.uses_adapters() {
        let target = LoraTarget {
            modules: spec.module_or_class.clone(),
            submodules: spec.submodule.clone(),
            layer_classes: spec.lora_layer.clone(),
        };
        let (graph, adapters) = lora::inject(
            graph,
            &target,
            spec.lora_rank,
            spec.lora_scale,
            spec.lora_train_off_target,
            rng,
        )?;
        (graph, Some(adapters))
    } else {
        let (layers, compute_dtype) = graph.into_layers();
        let layers = layers
            .into_iter()
            .map(|named| {
                if !spec.matches(&named) {
                    return Ok(named);
                }
                let layer = match named.layer {
                    Layer::Base(base) => Layer::Base(base.into_trainable()?),
                    Layer::Adapted(mut adapted) => {
                        adapted.base = adapted.base.into_trainable()?;
                        Layer::Adapted(adapted)
                    }
                };
                Ok(NamedLayer { layer, ..named })
            })
            .collect::<Result<Vec<_>>>()?;
        (LayerGraph::rebuild(layers, compute_dtype), None)
    };

    let set = TrainableParameterSet::from_graph(model, &graph, learning_rate, adapters);
    let (total, trainable) = graph.num_parameters();
    info!(
        "{}: {} of {} parameters trainable ({:.2}%)",
        model,
        trainable,
        total,
        100.0 * trainable as f64 / total.max(1) as f64
    );
    Ok((graph, set))
}
