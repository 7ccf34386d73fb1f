//! Graph convolution network.
//!
//! ```text
//! Z1  = P (X W1) + S (Ef We) + b1        P: normalized adjacency with self-loops
//! H1  = dropout(relu(Z1))                S: scatter of edge rows onto their target
//! Z2  = P (H1 W2) + b2
//! out = log_softmax(Z2)
//! ```
//!
//! `P[t, s] = deg(s)^-1/2 * deg(t)^-1/2` for every edge `s -> t` and for one
//! self-loop per node, where `deg` counts incoming edges plus the self-loop.
//! Explicit self-loops in the input are folded into that single self-loop and
//! carry no edge features. An edge's feature projection is scaled by the same
//! coefficient as its node message.

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::ModelError;
use crate::graph::{EdgeIndex, GraphSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub node_dim: usize,
    /// 0 for graphs without edge features.
    pub edge_dim: usize,
    pub hidden_dim: usize,
    pub num_classes: usize,
    /// Probability of zeroing a hidden unit during training.
    pub dropout: f32,
    pub seed: u64,
}

/// Learnable tensors. Also used to carry gradients of the same shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub w1: Array2<f32>,
    pub we: Array2<f32>,
    pub b1: Array1<f32>,
    pub w2: Array2<f32>,
    pub b2: Array1<f32>,
}

impl Parameters {
    fn glorot(config: &NetworkConfig, rng: &mut StdRng) -> Self {
        Self {
            w1: glorot(config.node_dim, config.hidden_dim, rng),
            we: glorot(config.edge_dim, config.hidden_dim, rng),
            b1: Array1::zeros(config.hidden_dim),
            w2: glorot(config.hidden_dim, config.num_classes, rng),
            b2: Array1::zeros(config.num_classes),
        }
    }

    pub fn zeros_like(other: &Parameters) -> Self {
        Self {
            w1: Array2::zeros(other.w1.raw_dim()),
            we: Array2::zeros(other.we.raw_dim()),
            b1: Array1::zeros(other.b1.raw_dim()),
            w2: Array2::zeros(other.w2.raw_dim()),
            b2: Array1::zeros(other.b2.raw_dim()),
        }
    }

    pub fn count(&self) -> usize {
        self.w1.len() + self.we.len() + self.b1.len() + self.w2.len() + self.b2.len()
    }

    pub fn is_finite(&self) -> bool {
        self.w1.iter().all(|v| v.is_finite())
            && self.we.iter().all(|v| v.is_finite())
            && self.b1.iter().all(|v| v.is_finite())
            && self.w2.iter().all(|v| v.is_finite())
            && self.b2.iter().all(|v| v.is_finite())
    }
}

fn glorot(fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Array2<f32> {
    if fan_in + fan_out == 0 {
        return Array2::zeros((fan_in, fan_out));
    }
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-limit..=limit))
}

/// Sparse normalized adjacency for one graph.
#[derive(Debug, Clone)]
pub struct Propagation {
    num_nodes: usize,
    /// (target, source, weight), self-loops included.
    entries: Vec<(usize, usize, f32)>,
    /// Per input edge: its coefficient, or `None` for an explicit self-loop.
    edge_weights: Vec<Option<f32>>,
}

impl Propagation {
    pub fn new(edges: &EdgeIndex, num_nodes: usize) -> Result<Self, ModelError> {
        let mut degree = vec![1.0f32; num_nodes];
        for (edge, (s, t)) in edges.iter().enumerate() {
            for node in [s, t] {
                if node >= num_nodes {
                    return Err(ModelError::EdgeOutOfRange {
                        edge,
                        node,
                        num_nodes,
                    });
                }
            }
            if s != t {
                degree[t] += 1.0;
            }
        }
        let inv_sqrt: Vec<f32> = degree.iter().map(|d| d.powf(-0.5)).collect();

        let mut entries: Vec<(usize, usize, f32)> =
            (0..num_nodes).map(|i| (i, i, inv_sqrt[i] * inv_sqrt[i])).collect();
        let mut edge_weights = Vec::with_capacity(edges.len());
        for (s, t) in edges.iter() {
            if s == t {
                edge_weights.push(None);
                continue;
            }
            let w = inv_sqrt[s] * inv_sqrt[t];
            entries.push((t, s, w));
            edge_weights.push(Some(w));
        }

        Ok(Self {
            num_nodes,
            entries,
            edge_weights,
        })
    }

    /// `P h`: every node gathers weighted rows from its in-neighbours.
    pub fn propagate(&self, h: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut out = Array2::zeros((self.num_nodes, h.ncols()));
        for &(t, s, w) in &self.entries {
            out.row_mut(t).scaled_add(w, &h.row(s));
        }
        out
    }

    /// `P^T g`: the adjoint of [`Propagation::propagate`].
    pub fn propagate_transpose(&self, g: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut out = Array2::zeros((self.num_nodes, g.ncols()));
        for &(t, s, w) in &self.entries {
            out.row_mut(s).scaled_add(w, &g.row(t));
        }
        out
    }

    /// Add each edge's projected features into its target row.
    fn scatter_edges(&self, edges: &EdgeIndex, projected: ArrayView2<'_, f32>, out: &mut Array2<f32>) {
        for (e, (_, t)) in edges.iter().enumerate() {
            if let Some(w) = self.edge_weights[e] {
                out.row_mut(t).scaled_add(w, &projected.row(e));
            }
        }
    }

    /// Adjoint of `scatter_edges`: per-edge gradient of the projection.
    fn gather_edges(&self, edges: &EdgeIndex, grad: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut out = Array2::zeros((edges.len(), grad.ncols()));
        for (e, (_, t)) in edges.iter().enumerate() {
            if let Some(w) = self.edge_weights[e] {
                out.row_mut(e).scaled_add(w, &grad.row(t));
            }
        }
        out
    }
}

/// Intermediate values from a training pass, consumed by `backward`.
#[derive(Debug, Clone)]
pub struct ForwardCache {
    snapshot: GraphSnapshot,
    propagation: Propagation,
    z1: Array2<f32>,
    mask: Array2<f32>,
    h1: Array2<f32>,
    log_probs: Array2<f32>,
}

impl ForwardCache {
    pub fn log_probs(&self) -> &Array2<f32> {
        &self.log_probs
    }
}

#[derive(Debug, Clone)]
pub struct GraphNetwork {
    config: NetworkConfig,
    params: Parameters,
    rng: StdRng,
}

impl GraphNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let params = Parameters::glorot(&config, &mut rng);
        Self { config, params, rng }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    pub fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    pub fn parameter_count(&self) -> usize {
        self.params.count()
    }

    /// Evaluation pass (no dropout). Returns per-node log-probabilities.
    pub fn forward(&self, snapshot: &GraphSnapshot) -> Result<Array2<f32>, ModelError> {
        self.check(snapshot)?;
        let propagation = Propagation::new(&snapshot.edge_index, snapshot.num_nodes())?;
        let z1 = self.first_layer(snapshot, &propagation);
        let h1 = z1.mapv(relu);
        Ok(self.second_layer(&h1, &propagation))
    }

    /// Training pass with dropout. Keep the cache for [`GraphNetwork::backward`].
    pub fn forward_train(&mut self, snapshot: &GraphSnapshot) -> Result<ForwardCache, ModelError> {
        self.check(snapshot)?;
        let propagation = Propagation::new(&snapshot.edge_index, snapshot.num_nodes())?;
        let z1 = self.first_layer(snapshot, &propagation);

        let keep = 1.0 - self.config.dropout;
        let mask = if self.config.dropout <= 0.0 {
            Array2::ones(z1.raw_dim())
        } else {
            let rng = &mut self.rng;
            Array2::from_shape_fn(z1.raw_dim(), |_| {
                if keep > 0.0 && rng.gen::<f32>() < keep {
                    1.0 / keep
                } else {
                    0.0
                }
            })
        };
        let h1 = z1.mapv(relu) * &mask;
        let log_probs = self.second_layer(&h1, &propagation);

        Ok(ForwardCache {
            snapshot: snapshot.clone(),
            propagation,
            z1,
            mask,
            h1,
            log_probs,
        })
    }

    /// Mean NLL over all nodes and its gradient with respect to every
    /// parameter.
    pub fn backward(
        &self,
        cache: &ForwardCache,
        targets: &[usize],
    ) -> Result<(f32, Parameters), ModelError> {
        let loss = nll_loss(&cache.log_probs, targets)?;
        let n = cache.log_probs.nrows() as f32;
        let p = &self.params;
        let prop = &cache.propagation;
        let snap = &cache.snapshot;

        // d loss / d Z2 = (softmax - onehot) / N
        let mut dz2 = cache.log_probs.mapv(f32::exp);
        for (i, &t) in targets.iter().enumerate() {
            dz2[[i, t]] -= 1.0;
        }
        dz2 /= n;

        let g2 = prop.propagate_transpose(dz2.view());
        let dw2 = cache.h1.t().dot(&g2);
        let db2 = dz2.sum_axis(Axis(0));

        let mut dz1 = g2.dot(&p.w2.t()) * &cache.mask;
        Zip::from(&mut dz1).and(&cache.z1).for_each(|d, &z| {
            if z <= 0.0 {
                *d = 0.0;
            }
        });

        let g1 = prop.propagate_transpose(dz1.view());
        let dw1 = snap.node_features.t().dot(&g1);
        let db1 = dz1.sum_axis(Axis(0));
        let dwe = if snap.edge_index.is_empty() || self.config.edge_dim == 0 {
            Array2::zeros(p.we.raw_dim())
        } else {
            let d_edge = prop.gather_edges(&snap.edge_index, dz1.view());
            snap.edge_features.t().dot(&d_edge)
        };

        Ok((
            loss,
            Parameters {
                w1: dw1,
                we: dwe,
                b1: db1,
                w2: dw2,
                b2: db2,
            },
        ))
    }

    fn check(&self, snapshot: &GraphSnapshot) -> Result<(), ModelError> {
        let found = snapshot.node_features.ncols();
        if found != self.config.node_dim {
            return Err(ModelError::ShapeMismatch {
                what: "node features",
                expected: self.config.node_dim,
                found,
            });
        }
        let found = snapshot.edge_features.ncols();
        if found != self.config.edge_dim {
            return Err(ModelError::ShapeMismatch {
                what: "edge features",
                expected: self.config.edge_dim,
                found,
            });
        }
        if snapshot.edge_features.nrows() != snapshot.num_edges() {
            return Err(ModelError::EdgeCountMismatch {
                expected: snapshot.num_edges(),
                found: snapshot.edge_features.nrows(),
            });
        }
        Ok(())
    }

    fn first_layer(&self, snapshot: &GraphSnapshot, prop: &Propagation) -> Array2<f32> {
        let xw = snapshot.node_features.dot(&self.params.w1);
        let mut z1 = prop.propagate(xw.view());
        if !snapshot.edge_index.is_empty() && self.config.edge_dim > 0 {
            let ew = snapshot.edge_features.dot(&self.params.we);
            prop.scatter_edges(&snapshot.edge_index, ew.view(), &mut z1);
        }
        z1 + &self.params.b1
    }

    fn second_layer(&self, h1: &Array2<f32>, prop: &Propagation) -> Array2<f32> {
        let hw = h1.dot(&self.params.w2);
        let z2 = prop.propagate(hw.view()) + &self.params.b2;
        log_softmax(z2)
    }
}

fn relu(v: f32) -> f32 {
    v.max(0.0)
}

fn log_softmax(mut z: Array2<f32>) -> Array2<f32> {
    for mut row in z.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let log_sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
        row.mapv_inplace(|v| v - log_sum);
    }
    z
}

/// Mean negative log-likelihood of `targets` under per-row log-probabilities.
pub fn nll_loss(log_probs: &Array2<f32>, targets: &[usize]) -> Result<f32, ModelError> {
    let (rows, classes) = log_probs.dim();
    if targets.len() != rows {
        return Err(ModelError::TargetLength {
            expected: rows,
            found: targets.len(),
        });
    }
    if let Some(&target) = targets.iter().find(|&&t| t >= classes) {
        return Err(ModelError::TargetOutOfRange { target, classes });
    }
    if rows == 0 {
        return Ok(0.0);
    }
    let total: f32 = targets
        .iter()
        .enumerate()
        .map(|(i, &t)| -log_probs[[i, t]])
        .sum();
    Ok(total / rows as f32)
}

pub fn class_probabilities(log_probs: &Array2<f32>) -> Array2<f32> {
    log_probs.mapv(f32::exp)
}
