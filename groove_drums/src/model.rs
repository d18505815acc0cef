// The drum model: a small dense autoencoder over the flattened rhythm grid.
//
//   input (192 = 32 steps x 6 lanes)
//     -> encoder: Linear(192, 64), tanh
//     -> decoder: Linear(64, 192), sigmoid
//
// Training is self-supervised reconstruction: the target is the clean grid and
// the input may be a masked copy of it. The loss is mean binary cross-entropy
// over all cells, which pairs with the sigmoid output so the output-layer
// gradient is simply `(prediction - target) / n`.
//
// Parameters are addressed by name (`encoder.weight`, ...) through
// `state_dict`/`load_state_dict`; that is the checkpoint format's only view of
// the model. Weights are row-major `[out][in]`.
//
// Gradients are computed per sample and summed in sample order, so a batch
// gives the same update whether the per-sample work ran in parallel or not.

use crate::error::{DrumError, Result};
use crate::grid::{CELL_COUNT, RhythmGrid};
use groove_prng::GrooveRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Width of the hidden code.
pub const HIDDEN_SIZE: usize = 64;

/// Clamp for predictions inside the log terms of the loss.
const PROB_EPSILON: f32 = 1e-7;

/// A named 2-D parameter as stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl ParamTensor {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        ParamTensor {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }
}

/// Fully connected layer `y = W x + b`.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    pub weight: ParamTensor,
    pub bias: ParamTensor,
}

impl Linear {
    fn zeros(inputs: usize, outputs: usize) -> Self {
        Linear {
            weight: ParamTensor::zeros(outputs, inputs),
            bias: ParamTensor::zeros(1, outputs),
        }
    }

    pub fn inputs(&self) -> usize {
        self.weight.cols
    }

    pub fn outputs(&self) -> usize {
        self.weight.rows
    }

    /// Xavier/Glorot uniform weights in `±sqrt(6 / (fan_in + fan_out))`,
    /// zero bias.
    fn xavier_uniform(&mut self, rng: &mut GrooveRng) {
        let bound = (6.0 / (self.inputs() + self.outputs()) as f32).sqrt();
        for w in &mut self.weight.data {
            *w = rng.range_f32(-bound, bound);
        }
        self.bias.data.fill(0.0);
    }

    fn forward(&self, x: &[f32], out: &mut [f32]) {
        let n_in = self.inputs();
        for (o, y) in out.iter_mut().enumerate() {
            let row = &self.weight.data[o * n_in..(o + 1) * n_in];
            let dot: f32 = row.iter().zip(x).map(|(w, v)| w * v).sum();
            *y = dot + self.bias.data[o];
        }
    }
}

/// Gradient buffers with the same layout as the model's parameters.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub encoder: Linear,
    pub decoder: Linear,
}

impl Gradients {
    fn zeros() -> Self {
        Gradients {
            encoder: Linear::zeros(CELL_COUNT, HIDDEN_SIZE),
            decoder: Linear::zeros(HIDDEN_SIZE, CELL_COUNT),
        }
    }

    fn accumulate(&mut self, other: &Gradients) {
        for (dst, src) in self.tensors_mut().into_iter().zip(other.tensors()) {
            for (d, s) in dst.data.iter_mut().zip(&src.data) {
                *d += s;
            }
        }
    }

    fn tensors(&self) -> [&ParamTensor; 4] {
        [
            &self.encoder.weight,
            &self.encoder.bias,
            &self.decoder.weight,
            &self.decoder.bias,
        ]
    }

    fn tensors_mut(&mut self) -> [&mut ParamTensor; 4] {
        [
            &mut self.encoder.weight,
            &mut self.encoder.bias,
            &mut self.decoder.weight,
            &mut self.decoder.bias,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrumModel {
    pub encoder: Linear,
    pub decoder: Linear,
}

impl Default for DrumModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameter names in checkpoint order.
pub const PARAMETER_NAMES: [&str; 4] = [
    "decoder.bias",
    "decoder.weight",
    "encoder.bias",
    "encoder.weight",
];

impl DrumModel {
    /// All-zero parameters. Use [`DrumModel::warm_start`] for a trainable
    /// starting point.
    pub fn new() -> Self {
        DrumModel {
            encoder: Linear::zeros(CELL_COUNT, HIDDEN_SIZE),
            decoder: Linear::zeros(HIDDEN_SIZE, CELL_COUNT),
        }
    }

    /// Deterministic initialization: Xavier-uniform weights, zero biases.
    pub fn warm_start(seed: u64) -> Self {
        let mut rng = GrooveRng::new(seed);
        let mut model = Self::new();
        model.encoder.xavier_uniform(&mut rng);
        model.decoder.xavier_uniform(&mut rng);
        model
    }

    fn param(&self, name: &str) -> Option<&ParamTensor> {
        match name {
            "encoder.weight" => Some(&self.encoder.weight),
            "encoder.bias" => Some(&self.encoder.bias),
            "decoder.weight" => Some(&self.decoder.weight),
            "decoder.bias" => Some(&self.decoder.bias),
            _ => None,
        }
    }

    fn param_mut(&mut self, name: &str) -> Option<&mut ParamTensor> {
        match name {
            "encoder.weight" => Some(&mut self.encoder.weight),
            "encoder.bias" => Some(&mut self.encoder.bias),
            "decoder.weight" => Some(&mut self.decoder.weight),
            "decoder.bias" => Some(&mut self.decoder.bias),
            _ => None,
        }
    }

    /// Snapshot of every parameter by name.
    pub fn state_dict(&self) -> BTreeMap<String, ParamTensor> {
        PARAMETER_NAMES
            .iter()
            .filter_map(|&name| self.param(name).map(|p| (name.to_string(), p.clone())))
            .collect()
    }

    /// Replace every parameter from a snapshot. All names must be present
    /// with matching shapes; on error `self` is unchanged.
    pub fn load_state_dict(&mut self, state: &BTreeMap<String, ParamTensor>) -> Result<()> {
        for name in PARAMETER_NAMES {
            let stored = state
                .get(name)
                .ok_or_else(|| DrumError::MissingParameter(name.to_string()))?;
            let current = self
                .param(name)
                .ok_or_else(|| DrumError::MissingParameter(name.to_string()))?;
            if stored.shape() != current.shape() || stored.data.len() != stored.rows * stored.cols {
                return Err(DrumError::ParameterShape {
                    name: name.to_string(),
                    expected: current.shape(),
                    found: stored.shape(),
                });
            }
        }
        for name in PARAMETER_NAMES {
            if let (Some(dst), Some(src)) = (self.param_mut(name), state.get(name)) {
                dst.data.copy_from_slice(&src.data);
            }
        }
        Ok(())
    }

    /// Inference: sigmoid activations for one grid, step-major.
    pub fn forward(&self, input: &RhythmGrid) -> Vec<f32> {
        self.forward_with_hidden(&input.to_vec()).1
    }

    fn forward_with_hidden(&self, x: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let mut hidden = vec![0.0; HIDDEN_SIZE];
        self.encoder.forward(x, &mut hidden);
        for h in &mut hidden {
            *h = h.tanh();
        }
        let mut output = vec![0.0; CELL_COUNT];
        self.decoder.forward(&hidden, &mut output);
        for y in &mut output {
            *y = sigmoid(*y);
        }
        (hidden, output)
    }

    /// Loss and parameter gradients for one (input, target) pair, with the
    /// loss normalized by `denominator` cells.
    fn sample_gradients(
        &self,
        input: &[f32],
        target: &[f32],
        denominator: f32,
    ) -> (f32, Gradients) {
        let (hidden, output) = self.forward_with_hidden(input);
        let mut grads = Gradients::zeros();
        let mut loss = 0.0;

        // d(loss)/d(decoder pre-activation).
        let mut d_out = vec![0.0; CELL_COUNT];
        for i in 0..CELL_COUNT {
            let p = output[i].clamp(PROB_EPSILON, 1.0 - PROB_EPSILON);
            let t = target[i];
            loss -= t * p.ln() + (1.0 - t) * (1.0 - p).ln();
            d_out[i] = (output[i] - t) / denominator;
        }

        let mut d_hidden = vec![0.0; HIDDEN_SIZE];
        for (o, &g) in d_out.iter().enumerate() {
            grads.decoder.bias.data[o] += g;
            let row = o * HIDDEN_SIZE;
            for h in 0..HIDDEN_SIZE {
                grads.decoder.weight.data[row + h] += g * hidden[h];
                d_hidden[h] += g * self.decoder.weight.data[row + h];
            }
        }

        for h in 0..HIDDEN_SIZE {
            let g = d_hidden[h] * (1.0 - hidden[h] * hidden[h]);
            grads.encoder.bias.data[h] += g;
            let row = h * CELL_COUNT;
            for i in 0..CELL_COUNT {
                grads.encoder.weight.data[row + i] += g * input[i];
            }
        }

        (loss / denominator, grads)
    }

    /// Mean binary cross-entropy over a batch and its summed gradients.
    /// `inputs[i]` is reconstructed towards `targets[i]`.
    ///
    /// Panics if the slices differ in length.
    pub fn loss_and_gradients(
        &self,
        inputs: &[RhythmGrid],
        targets: &[RhythmGrid],
    ) -> (f32, Gradients) {
        assert_eq!(inputs.len(), targets.len(), "batch inputs and targets differ in length");
        let denominator = (inputs.len().max(1) * CELL_COUNT) as f32;

        let per_sample: Vec<(f32, Gradients)> = inputs
            .par_iter()
            .zip(targets.par_iter())
            .map(|(x, t)| self.sample_gradients(&x.to_vec(), &t.to_vec(), denominator))
            .collect();

        let mut total = Gradients::zeros();
        let mut loss = 0.0;
        for (l, g) in &per_sample {
            loss += l;
            total.accumulate(g);
        }
        (loss, total)
    }

    /// Mean squared reconstruction error of the model's output against
    /// each grid, fed the grid itself.
    pub fn reconstruction_mse(&self, grids: &[RhythmGrid]) -> f32 {
        if grids.is_empty() {
            return 0.0;
        }
        let total: f32 = grids
            .iter()
            .map(|g| {
                let target = g.to_vec();
                self.forward(g)
                    .iter()
                    .zip(&target)
                    .map(|(p, t)| (p - t) * (p - t))
                    .sum::<f32>()
            })
            .sum();
        total / (grids.len() * CELL_COUNT) as f32
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Adam optimizer state, keyed to the model layout.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
    m: Gradients,
    v: Gradients,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step: 0,
            m: Gradients::zeros(),
            v: Gradients::zeros(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Apply one bias-corrected Adam update.
    pub fn step(&mut self, model: &mut DrumModel, grads: &Gradients) {
        self.step += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step);
        let bias2 = 1.0 - self.beta2.powi(self.step);
        let params = [
            &mut model.encoder.weight,
            &mut model.encoder.bias,
            &mut model.decoder.weight,
            &mut model.decoder.bias,
        ];
        let moments = self.m.tensors_mut().into_iter().zip(self.v.tensors_mut());
        for ((param, grad), (m, v)) in params.into_iter().zip(grads.tensors()).zip(moments) {
            for i in 0..param.data.len() {
                let g = grad.data[i];
                m.data[i] = self.beta1 * m.data[i] + (1.0 - self.beta1) * g;
                v.data[i] = self.beta2 * v.data[i] + (1.0 - self.beta2) * g * g;
                let m_hat = m.data[i] / bias1;
                let v_hat = v.data[i] / bias2;
                param.data[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::Lane;

    fn backbeat() -> RhythmGrid {
        let mut grid = RhythmGrid::empty();
        grid.set(0, Lane::Kick);
        grid.set(16, Lane::Snare);
        grid
    }

    #[test]
    fn warm_start_is_deterministic_and_bounded() {
        let a = DrumModel::warm_start(5);
        let b = DrumModel::warm_start(5);
        assert_eq!(a, b);
        assert_ne!(a, DrumModel::warm_start(6));

        let bound = (6.0 / (CELL_COUNT + HIDDEN_SIZE) as f32).sqrt();
        assert!(a.encoder.weight.data.iter().all(|w| w.abs() <= bound));
        assert!(a.encoder.bias.data.iter().all(|&b| b == 0.0));
        assert!(a.decoder.bias.data.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn forward_output_is_a_probability_per_cell() {
        let model = DrumModel::warm_start(1);
        let out = model.forward(&backbeat());
        assert_eq!(out.len(), CELL_COUNT);
        assert!(out.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn state_dict_round_trip_is_exact() {
        let model = DrumModel::warm_start(3);
        let mut restored = DrumModel::new();
        restored.load_state_dict(&model.state_dict()).unwrap();
        assert_eq!(restored, model);
    }

    #[test]
    fn load_state_dict_rejects_bad_shapes_without_mutating() {
        let mut model = DrumModel::warm_start(3);
        let before = model.clone();
        let mut state = DrumModel::warm_start(4).state_dict();
        state.insert("decoder.bias".into(), ParamTensor::zeros(1, 7));
        assert!(matches!(
            model.load_state_dict(&state),
            Err(DrumError::ParameterShape { .. })
        ));
        state.insert("decoder.bias".into(), ParamTensor::zeros(1, CELL_COUNT));
        state.remove("encoder.weight");
        assert!(matches!(
            model.load_state_dict(&state),
            Err(DrumError::MissingParameter(_))
        ));
        assert_eq!(model, before);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let model = DrumModel::warm_start(11);
        let batch = [backbeat()];
        let (_, grads) = model.loss_and_gradients(&batch, &batch);

        let eps = 1e-2;
        let checked = [
            (0usize, grads.decoder.bias.data[0]),
            (3, grads.decoder.bias.data[3]),
        ];
        for (index, analytic) in checked {
            let mut plus = model.clone();
            plus.decoder.bias.data[index] += eps;
            let mut minus = model.clone();
            minus.decoder.bias.data[index] -= eps;
            let numeric = (plus.loss_and_gradients(&batch, &batch).0
                - minus.loss_and_gradients(&batch, &batch).0)
                / (2.0 * eps);
            assert!(
                (numeric - analytic).abs() < 2e-4,
                "bias {index}: numeric {numeric} vs analytic {analytic}"
            );
        }
    }

    #[test]
    fn adam_reduces_reconstruction_loss() {
        let mut model = DrumModel::warm_start(2);
        let mut adam = Adam::new(1e-2);
        let batch = [backbeat(), backbeat()];
        let (initial, _) = model.loss_and_gradients(&batch, &batch);
        for _ in 0..50 {
            let (_, grads) = model.loss_and_gradients(&batch, &batch);
            adam.step(&mut model, &grads);
        }
        let (trained, _) = model.loss_and_gradients(&batch, &batch);
        assert!(trained < initial * 0.5, "loss went {initial} -> {trained}");
    }
}
