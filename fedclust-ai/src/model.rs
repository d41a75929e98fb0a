//! Model abstraction and parameter containers
//!
//! A local model exposes a forward pass and an ordered, named view of its
//! learnable weights ([`StateDict`]). Parameters travel to and from the
//! orchestrator positionally as a [`ParameterVector`]; the receiving model
//! re-attaches its own layer names in order. [`ParameterSplit`] carves a
//! vector into shared base layers and per-cluster personalization blocks.

use ndarray::{Array1, Array2};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::tensor::Tensor;

/// Ordered `(layer name, tensor)` pairs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    entries: Vec<(String, Tensor)>,
}

impl StateDict {
    /// Creates an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer
    pub fn push(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.entries.push((name.into(), tensor));
    }

    /// Builder-style append
    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.push(name, tensor);
        self
    }

    /// Returns the number of layers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the state has no layers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Layer names in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Looks a layer up by name
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, t)| t)
    }

    /// Iterates over `(name, tensor)` pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(k, t)| (k.as_str(), t))
    }

    /// Drops the names, keeping positional order
    pub fn into_parameters(self) -> ParameterVector {
        ParameterVector::new(self.entries.into_iter().map(|(_, t)| t).collect())
    }

    /// Zips this state's layer names with incoming tensors.
    ///
    /// The count and every shape must agree pairwise; this is the strict
    /// check behind `set_parameters`.
    pub fn with_parameters(&self, params: ParameterVector) -> Result<StateDict, ModelError> {
        if params.len() != self.entries.len() {
            return Err(ModelError::ParameterCount {
                expected: self.entries.len(),
                actual: params.len(),
            });
        }
        let entries = self
            .entries
            .iter()
            .zip(params.into_tensors())
            .map(|((name, current), incoming)| {
                if current.shape() != incoming.shape() {
                    return Err(ModelError::ShapeMismatch {
                        layer: name.clone(),
                        expected: current.shape().dims().to_vec(),
                        actual: incoming.shape().dims().to_vec(),
                    });
                }
                Ok((name.clone(), incoming))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StateDict { entries })
    }

    /// Verifies that `other` has exactly this state's names, order and shapes
    pub fn check_compatible(&self, other: &StateDict) -> Result<(), ModelError> {
        if other.len() != self.len() {
            return Err(ModelError::ParameterCount {
                expected: self.len(),
                actual: other.len(),
            });
        }
        for (position, ((name, tensor), (other_name, other_tensor))) in
            self.entries.iter().zip(other.entries.iter()).enumerate()
        {
            if name != other_name {
                return Err(ModelError::LayerOrder {
                    position,
                    expected: name.clone(),
                    actual: other_name.clone(),
                });
            }
            if tensor.shape() != other_tensor.shape() {
                return Err(ModelError::ShapeMismatch {
                    layer: name.clone(),
                    expected: tensor.shape().dims().to_vec(),
                    actual: other_tensor.shape().dims().to_vec(),
                });
            }
        }
        Ok(())
    }
}

/// Positionally ordered model weights as exchanged with the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    tensors: Vec<Tensor>,
}

impl ParameterVector {
    /// Wraps a list of tensors
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    /// Returns the number of tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Returns true if there are no tensors
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Returns the tensors as a slice
    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    /// Consumes the vector and returns the tensors
    pub fn into_tensors(self) -> Vec<Tensor> {
        self.tensors
    }

    /// Returns the tensor at `index`
    pub fn get(&self, index: usize) -> Option<&Tensor> {
        self.tensors.get(index)
    }

    /// Total number of scalar values across all tensors
    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(Tensor::len).sum()
    }
}

impl From<Vec<Tensor>> for ParameterVector {
    fn from(tensors: Vec<Tensor>) -> Self {
        Self::new(tensors)
    }
}

impl IntoIterator for ParameterVector {
    type Item = Tensor;
    type IntoIter = std::vec::IntoIter<Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

/// Base prefix plus `n_clusters` personalization blocks of `n_pers_layers`
#[derive(Debug, Clone, Copy)]
pub struct ParameterSplit<'a> {
    params: &'a ParameterVector,
    n_base_layers: usize,
    n_pers_layers: usize,
    n_clusters: usize,
}

impl<'a> ParameterSplit<'a> {
    /// Validates that the suffix holds exactly `n_clusters * n_pers_layers`
    /// tensors.
    pub fn new(
        params: &'a ParameterVector,
        n_base_layers: usize,
        n_pers_layers: usize,
        n_clusters: usize,
    ) -> Result<Self, ModelError> {
        if n_clusters == 0 {
            return Err(ModelError::InvalidSplit {
                reason: "n_clusters must be at least 1".to_string(),
            });
        }
        if n_base_layers > params.len() {
            return Err(ModelError::InvalidSplit {
                reason: format!(
                    "{n_base_layers} base layers requested from {} tensors",
                    params.len()
                ),
            });
        }
        let suffix = params.len() - n_base_layers;
        if suffix != n_clusters * n_pers_layers {
            return Err(ModelError::InvalidSplit {
                reason: format!(
                    "personalization suffix has {suffix} tensors, expected {n_clusters} x {n_pers_layers}"
                ),
            });
        }
        Ok(Self {
            params,
            n_base_layers,
            n_pers_layers,
            n_clusters,
        })
    }

    /// Number of candidate clusters
    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    /// Shared base layers
    pub fn base(&self) -> &'a [Tensor] {
        &self.params.tensors()[..self.n_base_layers]
    }

    /// Personalization block of cluster `k`
    pub fn block(&self, k: usize) -> Result<&'a [Tensor], ModelError> {
        if k >= self.n_clusters {
            return Err(ModelError::InvalidSplit {
                reason: format!("cluster {k} out of range for {} clusters", self.n_clusters),
            });
        }
        let start = self.n_base_layers + k * self.n_pers_layers;
        Ok(&self.params.tensors()[start..start + self.n_pers_layers])
    }

    /// Base layers followed by the block of cluster `k`
    pub fn hybrid(&self, k: usize) -> Result<ParameterVector, ModelError> {
        let block = self.block(k)?;
        let mut tensors = Vec::with_capacity(self.n_base_layers + self.n_pers_layers);
        tensors.extend_from_slice(self.base());
        tensors.extend_from_slice(block);
        Ok(ParameterVector::new(tensors))
    }
}

/// A local model: forward pass plus ordered parameter access.
///
/// `set_parameters(get_parameters())` must leave the model bit-identical.
pub trait Model: Send {
    /// Human-readable model name for logs
    fn name(&self) -> &str;

    /// Runs a batch `[n, ...]` through the model, returning `[n, out]`
    fn forward(&mut self, batch: &Tensor) -> Result<Tensor, ModelError>;

    /// Snapshot of the weights with layer names, in a stable order
    fn state_dict(&self) -> StateDict;

    /// Strictly loads a full state (names, order and shapes must match)
    fn load_state_dict(&mut self, state: StateDict) -> Result<(), ModelError>;

    /// Weights without names, in `state_dict` order
    fn get_parameters(&self) -> ParameterVector {
        self.state_dict().into_parameters()
    }

    /// Loads positional weights under the model's own layer names
    fn set_parameters(&mut self, params: ParameterVector) -> Result<(), ModelError> {
        let state = self.state_dict().with_parameters(params)?;
        self.load_state_dict(state)
    }
}

/// Fully connected layer `y = x W^T + b` over flattened samples.
///
/// Serves as the reference encoder (random projection) and as a minimal
/// classifier head.
#[derive(Debug, Clone)]
pub struct LinearModel {
    name: String,
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearModel {
    /// Creates a zero-initialized layer
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            name: "linear".to_string(),
            weight: Array2::zeros((out_features, in_features)),
            bias: Array1::zeros(out_features),
        }
    }

    /// Creates a layer with weights uniform in `±1/sqrt(in_features)`
    pub fn random<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let weight = Array2::from_shape_simple_fn((out_features, in_features), || {
            rng.gen_range(-bound..bound)
        });
        let bias = Array1::from_shape_simple_fn(out_features, || rng.gen_range(-bound..bound));
        Self {
            name: "linear".to_string(),
            weight,
            bias,
        }
    }

    /// Sets the model name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Input width
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    /// Output width
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }
}

impl Model for LinearModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, batch: &Tensor) -> Result<Tensor, ModelError> {
        let dims = batch.shape().dims();
        let n = dims.first().copied().unwrap_or(0);
        let row = if n == 0 { 0 } else { batch.len() / n };
        if n == 0 || row != self.in_features() {
            return Err(ModelError::ShapeMismatch {
                layer: format!("{}.input", self.name),
                expected: vec![n, self.in_features()],
                actual: dims.to_vec(),
            });
        }
        let x = Array2::from_shape_vec((n, row), batch.data().to_vec()).map_err(|e| {
            ModelError::InvalidTensor {
                reason: e.to_string(),
            }
        })?;
        let y = x.dot(&self.weight.t()) + &self.bias;
        Ok(y.into_dyn().into())
    }

    fn state_dict(&self) -> StateDict {
        StateDict::new()
            .with("weight", Tensor::from(self.weight.clone().into_dyn()))
            .with("bias", Tensor::from_vec(self.bias.to_vec()))
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<(), ModelError> {
        self.state_dict().check_compatible(&state)?;
        let mut entries = state.entries.into_iter();
        if let Some((_, weight)) = entries.next() {
            self.weight = Array2::from_shape_vec(
                (self.out_features(), self.in_features()),
                weight.into_data(),
            )
            .map_err(|e| ModelError::InvalidTensor {
                reason: e.to_string(),
            })?;
        }
        if let Some((_, bias)) = entries.next() {
            self.bias = Array1::from_vec(bias.into_data());
        }
        Ok(())
    }
}
