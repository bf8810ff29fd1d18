use super::{FitBudget, FitSettings, FittedModel, Forecaster, Interval};
use crate::config::{LSTM_BATCH_SIZE, SHUFFLE_SEED, WEIGHT_DECAY, get_device};
use crate::error::{PipelineError, Result};
use crate::stats;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{LSTM, LSTMConfig, Linear, Optimizer, RNN, VarBuilder, VarMap};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info};

/// Stacked LSTM over a univariate window with a linear head on the last hidden state.
pub struct SequenceModel {
    lstm_layers: Vec<LSTM>,
    head: Linear,
}

impl SequenceModel {
    pub fn new(hidden_dim: usize, num_layers: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut lstm_layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers.max(1) {
            let in_dim = if i == 0 { 1 } else { hidden_dim };
            let cfg = LSTMConfig {
                layer_idx: i,
                ..Default::default()
            };
            lstm_layers.push(candle_nn::lstm(in_dim, hidden_dim, cfg, vb.pp(format!("lstm_{}", i)))?);
        }
        let head = candle_nn::linear(hidden_dim, 1, vb.pp("head"))?;
        Ok(Self { lstm_layers, head })
    }

    /// x: [batch, seq_len, 1] -> [batch, 1]
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut current_input = x.clone();
        let num_layers = self.lstm_layers.len();
        let mut last_h = None;

        for (i, lstm) in self.lstm_layers.iter().enumerate() {
            let states = lstm.seq(&current_input)?;
            last_h = Some(
                states
                    .last()
                    .ok_or_else(|| candle_core::Error::Msg("Empty LSTM sequence".into()))?
                    .h
                    .clone(),
            );
            if i < num_layers - 1 {
                let hidden_seq: Vec<Tensor> = states.iter().map(|s| s.h.clone()).collect();
                current_input = Tensor::stack(&hidden_seq, 1)?;
            }
        }

        let h_t = last_h.ok_or_else(|| candle_core::Error::Msg("No LSTM layers".into()))?;
        self.head.forward(&h_t)
    }
}

/// Z-score of a window; the same scale maps the next value.
#[derive(Clone, Copy, Debug)]
struct WindowScale {
    mean: f64,
    std: f64,
}

impl WindowScale {
    fn of(window: &[f64]) -> Self {
        let mean = stats::mean(window).unwrap_or(0.0);
        let std = stats::sample_std(window).unwrap_or(0.0) + 1e-6;
        Self { mean, std }
    }

    fn normalize(&self, v: f64) -> f32 {
        ((v - self.mean) / self.std) as f32
    }

    fn denormalize(&self, v: f32) -> f64 {
        v as f64 * self.std + self.mean
    }
}

pub struct LstmForecaster {
    pub lookback: usize,
    pub hidden: usize,
    pub layers: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub settings: FitSettings,
}

impl LstmForecaster {
    fn windows(&self, history: &[f64]) -> (Vec<f32>, Vec<f32>, Vec<WindowScale>) {
        let count = history.len() - self.lookback;
        let mut inputs = Vec::with_capacity(count * self.lookback);
        let mut targets = Vec::with_capacity(count);
        let mut scales = Vec::with_capacity(count);
        for i in 0..count {
            let window = &history[i..i + self.lookback];
            let scale = WindowScale::of(window);
            inputs.extend(window.iter().map(|v| scale.normalize(*v)));
            targets.push(scale.normalize(history[i + self.lookback]));
            scales.push(scale);
        }
        (inputs, targets, scales)
    }
}

impl Forecaster for LstmForecaster {
    fn fit(&self, history: &[f64], budget: &FitBudget) -> Result<Box<dyn FittedModel>> {
        if self.lookback < 2 || self.hidden == 0 || self.epochs == 0 {
            return Err(PipelineError::Convergence("LSTM lookback, hidden size and epochs must be positive".into()));
        }
        if history.len() < self.lookback + 10 {
            return Err(PipelineError::Convergence(format!(
                "LSTM needs at least {} observations, got {}",
                self.lookback + 10,
                history.len()
            )));
        }
        if history.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::DataQuality("history contains non-finite values".into()));
        }

        let device = get_device(self.settings.use_cuda);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = SequenceModel::new(self.hidden, self.layers, vb.pp("sequence"))?;

        let params = candle_nn::ParamsAdamW {
            lr: self.learning_rate,
            weight_decay: WEIGHT_DECAY,
            ..Default::default()
        };
        let mut opt = candle_nn::AdamW::new(varmap.all_vars(), params)?;

        let (inputs, targets, scales) = self.windows(history);
        let num_samples = targets.len();
        let mut rng = StdRng::seed_from_u64(SHUFFLE_SEED);
        let mut indices: Vec<usize> = (0..num_samples).collect();

        info!(
            "Training LSTM on {} windows (lookback={}, hidden={}, layers={}, epochs={})",
            num_samples, self.lookback, self.hidden, self.layers, self.epochs
        );

        for epoch in 0..self.epochs {
            budget.check("LSTM training")?;
            indices.shuffle(&mut rng);
            let mut total_loss = 0.0;
            let mut batches = 0usize;

            for batch_indices in indices.chunks(LSTM_BATCH_SIZE) {
                let mut batch_x = Vec::with_capacity(batch_indices.len() * self.lookback);
                let mut batch_y = Vec::with_capacity(batch_indices.len());
                for &idx in batch_indices {
                    batch_x.extend_from_slice(&inputs[idx * self.lookback..(idx + 1) * self.lookback]);
                    batch_y.push(targets[idx]);
                }
                let x = Tensor::from_vec(batch_x, (batch_indices.len(), self.lookback, 1), &device)?;
                let y = Tensor::from_vec(batch_y, (batch_indices.len(), 1), &device)?;

                let pred = model.forward(&x)?;
                let loss = candle_nn::loss::mse(&pred, &y)?;
                opt.backward_step(&loss)?;

                let value = loss.to_scalar::<f32>()? as f64;
                if !value.is_finite() {
                    return Err(PipelineError::Convergence(format!("LSTM loss became non-finite at epoch {}", epoch + 1)));
                }
                total_loss += value;
                batches += 1;
            }
            debug!("LSTM epoch {}/{}: loss={:.6}", epoch + 1, self.epochs, total_loss / batches.max(1) as f64);
        }

        // Residual spread in original units over the training windows.
        let x = Tensor::from_vec(inputs, (num_samples, self.lookback, 1), &device)?;
        let pred = model.forward(&x)?.flatten_all()?.to_vec1::<f32>()?;
        let squared: Vec<f64> = pred
            .iter()
            .zip(&targets)
            .zip(&scales)
            .map(|((p, t), s)| (s.denormalize(*p) - s.denormalize(*t)).powi(2))
            .collect();
        let sigma = stats::mean(&squared).unwrap_or(f64::NAN).sqrt();
        if !sigma.is_finite() {
            return Err(PipelineError::Convergence("LSTM residuals are non-finite".into()));
        }

        Ok(Box::new(LstmModel {
            model,
            device,
            lookback: self.lookback,
            context: history[history.len() - self.lookback..].to_vec(),
            sigma,
            label: format!("LSTM(lookback={}, hidden={}, layers={})", self.lookback, self.hidden, self.layers),
        }))
    }
}

pub struct LstmModel {
    model: SequenceModel,
    device: Device,
    lookback: usize,
    context: Vec<f64>,
    sigma: f64,
    label: String,
}

impl FittedModel for LstmModel {
    fn describe(&self) -> String {
        format!("{} sigma={:.6}", self.label, self.sigma)
    }

    fn aic(&self) -> Option<f64> {
        None
    }

    fn forecast(&self, horizon: usize, confidence: f64) -> Result<Vec<Interval>> {
        let z = stats::z_for_confidence(confidence);
        if !z.is_finite() {
            return Err(PipelineError::DataQuality(format!("confidence level {} is not in (0, 1)", confidence)));
        }

        let mut window = self.context.clone();
        let mut out = Vec::with_capacity(horizon);
        for step in 1..=horizon {
            let recent = &window[window.len() - self.lookback..];
            let scale = WindowScale::of(recent);
            let normalized: Vec<f32> = recent.iter().map(|v| scale.normalize(*v)).collect();
            let x = Tensor::from_vec(normalized, (1, self.lookback, 1), &self.device)?;
            let pred = self.model.forward(&x)?.flatten_all()?.to_vec1::<f32>()?;
            let point = pred
                .first()
                .map(|p| scale.denormalize(*p))
                .ok_or_else(|| PipelineError::Convergence("LSTM produced no output".into()))?;

            let half = z * self.sigma * (step as f64).sqrt();
            if !point.is_finite() || !half.is_finite() {
                return Err(PipelineError::Convergence("LSTM forecast diverged".into()));
            }
            out.push(Interval { point, lower: point - half, upper: point + half });
            window.push(point);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forecaster(lookback: usize, epochs: usize) -> LstmForecaster {
        LstmForecaster {
            lookback,
            hidden: 8,
            layers: 2,
            epochs,
            learning_rate: 1e-2,
            settings: FitSettings { max_iterations: 10, tolerance: 1e-6, budget: None, use_cuda: false },
        }
    }

    #[test]
    fn test_lstm_forecast_intervals_are_ordered() {
        let history: Vec<f64> = (0..160).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.05).collect();
        let fitted = forecaster(12, 3).fit(&history, &FitBudget::unlimited()).unwrap();
        let out = fitted.forecast(7, 0.9).unwrap();

        assert_eq!(out.len(), 7);
        for i in &out {
            assert!(i.point.is_finite());
            assert!(i.lower <= i.point && i.point <= i.upper);
        }
        assert!(out[6].upper - out[6].lower >= out[0].upper - out[0].lower);
        assert!(fitted.aic().is_none());
    }

    #[test]
    fn test_lstm_rejects_short_history() {
        let err = forecaster(30, 1).fit(&[1.0; 20], &FitBudget::unlimited()).err().unwrap();
        assert!(err.is_convergence());
    }

    #[test]
    fn test_window_scale_round_trips() {
        let scale = WindowScale::of(&[1.0, 2.0, 3.0]);
        let v = scale.normalize(2.5);
        assert!((scale.denormalize(v) - 2.5).abs() < 1e-5);
    }
}
