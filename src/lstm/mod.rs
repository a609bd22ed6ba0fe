/*!
The stacked LSTM forecaster
*/

use crate::error::Result;
use crate::predict::Forecaster;
use crate::util::{push_rows, to_cpu};
use crate::{CpuFloat, GpuFloat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tch::nn::{self, BatchNorm, Linear, Module, ModuleT, RNNConfig, VarStore, LSTM, RNN};
use tch::{Device, Kind, Reduction, Tensor};

/// Dropout after each recurrent layer
pub const RECURRENT_DROPOUT: f64 = 0.2;
/// Dropout after the hidden dense layer
pub const DENSE_DROPOUT: f64 = 0.1;
/// Rows per forward pass at inference time
const INFERENCE_BATCH: usize = 256;

/// A descriptor for an instance of the StockLstm model
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct StockLstmDesc {
    /// The number of input features per time step
    pub features: usize,
    /// The number of time steps per input window
    pub sequence_length: usize,
    /// The number of future close values predicted
    pub prediction_horizon: usize,
    /// Widths of the three stacked LSTM layers
    pub hidden: [usize; 3],
    /// Width of the hidden dense layer
    pub dense: usize,
}

impl StockLstmDesc {
    /// The standard 128/64/32 architecture for a given input shape and horizon
    pub fn new(
        features: usize,
        sequence_length: usize,
        prediction_horizon: usize,
    ) -> StockLstmDesc {
        StockLstmDesc {
            features,
            sequence_length,
            prediction_horizon,
            hidden: [128, 64, 32],
            dense: 25,
        }
    }

    /// Build a `StockLstm` under a given variable path
    pub fn build(&self, vs: &nn::Path) -> StockLstm {
        let config = || RNNConfig {
            batch_first: true,
            ..Default::default()
        };
        let [h1, h2, h3] = self.hidden;
        StockLstm {
            desc: self.clone(),
            lstm_1: nn::lstm(vs / "lstm_1", self.features as i64, h1 as i64, config()),
            norm_1: nn::batch_norm1d(vs / "norm_1", h1 as i64, Default::default()),
            lstm_2: nn::lstm(vs / "lstm_2", h1 as i64, h2 as i64, config()),
            norm_2: nn::batch_norm1d(vs / "norm_2", h2 as i64, Default::default()),
            lstm_3: nn::lstm(vs / "lstm_3", h2 as i64, h3 as i64, config()),
            dense: nn::linear(vs / "dense", h3 as i64, self.dense as i64, Default::default()),
            head: nn::linear(
                vs / "head",
                self.dense as i64,
                self.prediction_horizon as i64,
                Default::default(),
            ),
        }
    }
}

/// Three stacked LSTMs with dropout and batch normalization, followed by a dense head
#[derive(Debug)]
pub struct StockLstm {
    /// The descriptor this model was built from
    pub desc: StockLstmDesc,
    lstm_1: LSTM,
    norm_1: BatchNorm,
    lstm_2: LSTM,
    norm_2: BatchNorm,
    lstm_3: LSTM,
    dense: Linear,
    head: Linear,
}

/// Batch-normalize the feature axis of a `[batch, time, features]` tensor
fn normalize_features(norm: &BatchNorm, xs: &Tensor, train: bool) -> Tensor {
    norm.forward_t(&xs.transpose(1, 2), train)
        .transpose(1, 2)
        .contiguous()
}

impl ModuleT for StockLstm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let (hidden, _) = self.lstm_1.seq(xs);
        let hidden = hidden.dropout(RECURRENT_DROPOUT, train);
        let hidden = normalize_features(&self.norm_1, &hidden, train);
        let (hidden, _) = self.lstm_2.seq(&hidden);
        let hidden = hidden.dropout(RECURRENT_DROPOUT, train);
        let hidden = normalize_features(&self.norm_2, &hidden, train);
        let (hidden, _) = self.lstm_3.seq(&hidden);
        // Only the last time step feeds the dense head
        let last = hidden.select(1, -1).dropout(RECURRENT_DROPOUT, train);
        let dense = self.dense.forward(&last).relu().dropout(DENSE_DROPOUT, train);
        self.head.forward(&dense)
    }
}

impl StockLstm {
    /// Compute the mean squared error and mean absolute error of a batch
    pub fn loss(&self, xs: &Tensor, ys: &Tensor, train: bool) -> (Tensor, Tensor) {
        let yhat = self.forward_t(xs, train);
        let mse = yhat.mse_loss(ys, Reduction::Mean);
        let mae = (&yhat - ys).abs().mean(Kind::Float);
        (mse, mae)
    }

    /// Package windows of scaled feature rows into a `[batch, time, features]` tensor
    pub fn make_inputs(windows: &[&[Vec<CpuFloat>]], device: Device) -> Tensor {
        let batch = windows.len();
        let time = windows.first().map(|w| w.len()).unwrap_or(0);
        let features = windows
            .first()
            .and_then(|w| w.first())
            .map(|row| row.len())
            .unwrap_or(0);
        let mut input = Vec::<GpuFloat>::with_capacity(batch * time * features);
        for window in windows {
            push_rows(window, &mut input);
        }
        Tensor::from_slice(&input)
            .view([batch as i64, time as i64, features as i64])
            .to_device(device)
    }

    /// Package target vectors into a `[batch, horizon]` tensor
    pub fn make_targets(targets: &[&[CpuFloat]], device: Device) -> Tensor {
        let batch = targets.len();
        let horizon = targets.first().map(|t| t.len()).unwrap_or(0);
        let mut output = Vec::<GpuFloat>::with_capacity(batch * horizon);
        for target in targets {
            output.extend(target.iter().map(|&x| x as GpuFloat));
        }
        Tensor::from_slice(&output)
            .view([batch as i64, horizon as i64])
            .to_device(device)
    }
}

/// A model together with the variables backing it
#[derive(Debug)]
pub struct LstmModel {
    /// The variables of the network
    pub vs: VarStore,
    /// The network
    pub net: StockLstm,
}

impl LstmModel {
    /// Build a freshly initialized model on a device
    pub fn new(desc: &StockLstmDesc, device: Device) -> LstmModel {
        let vs = VarStore::new(device);
        let net = desc.build(&vs.root());
        LstmModel { vs, net }
    }

    /// Rebuild a model from its descriptor and load saved weights
    pub fn load(desc: &StockLstmDesc, path: &Path, device: Device) -> Result<LstmModel> {
        let mut model = LstmModel::new(desc, device);
        model.vs.load(path)?;
        Ok(model)
    }

    /// Save the weights
    pub fn save(&self, path: &Path) -> Result<()> {
        self.vs.save(path)?;
        Ok(())
    }

    /// The device the model lives on
    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// The descriptor the model was built from
    pub fn desc(&self) -> &StockLstmDesc {
        &self.net.desc
    }

    /// A human readable layer table with parameter counts
    pub fn summary(&self) -> String {
        ModelSummary(self).to_string()
    }
}

/// Displays a model as a layer table with parameter counts
#[derive(Debug, Copy, Clone)]
pub struct ModelSummary<'a>(pub &'a LstmModel);

impl fmt::Display for ModelSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let model = self.0;
        let desc = model.desc();
        let mut total: BTreeMap<String, i64> = BTreeMap::new();
        let mut trainable: BTreeMap<String, i64> = BTreeMap::new();
        for (name, tensor) in model.vs.variables() {
            let layer = name.split('.').next().unwrap_or(&name).to_string();
            *total.entry(layer.clone()).or_default() += tensor.numel() as i64;
            if tensor.requires_grad() {
                *trainable.entry(layer).or_default() += tensor.numel() as i64;
            }
        }
        let [h1, h2, h3] = desc.hidden;
        let t = desc.sequence_length;
        let seq = |width: usize| format!("(None, {}, {})", t, width);
        let flat = |width: usize| format!("(None, {})", width);
        let dropout = |p: f64| format!("Dropout({})", p);
        let layers = vec![
            ("lstm_1", "LSTM".to_string(), seq(h1)),
            ("dropout_1", dropout(RECURRENT_DROPOUT), seq(h1)),
            ("norm_1", "BatchNorm".to_string(), seq(h1)),
            ("lstm_2", "LSTM".to_string(), seq(h2)),
            ("dropout_2", dropout(RECURRENT_DROPOUT), seq(h2)),
            ("norm_2", "BatchNorm".to_string(), seq(h2)),
            ("lstm_3", "LSTM".to_string(), flat(h3)),
            ("dropout_3", dropout(RECURRENT_DROPOUT), flat(h3)),
            ("dense", "Dense(relu)".to_string(), flat(desc.dense)),
            ("dropout_4", dropout(DENSE_DROPOUT), flat(desc.dense)),
            ("head", "Dense".to_string(), flat(desc.prediction_horizon)),
        ];
        writeln!(f, "Model: StockLstm")?;
        writeln!(f, "Input: (None, {}, {})", t, desc.features)?;
        writeln!(
            f,
            "{:<12} {:<14} {:<18} {:>10}",
            "Layer", "Type", "Output Shape", "Params"
        )?;
        for (name, kind, shape) in &layers {
            let params = total.get(*name).copied().unwrap_or(0);
            writeln!(f, "{:<12} {:<14} {:<18} {:>10}", name, kind, shape, params)?;
        }
        let all: i64 = total.values().sum();
        let train: i64 = trainable.values().sum();
        writeln!(f, "Total params: {}", all)?;
        writeln!(f, "Trainable params: {}", train)?;
        writeln!(f, "Non-trainable params: {}", all - train)
    }
}

impl Forecaster for LstmModel {
    fn horizon(&self) -> usize {
        self.desc().prediction_horizon
    }

    fn forecast_batch(&self, windows: &[&[Vec<CpuFloat>]]) -> Result<Vec<Vec<CpuFloat>>> {
        let horizon = self.horizon();
        let mut forecasts = Vec::with_capacity(windows.len());
        for chunk in windows.chunks(INFERENCE_BATCH) {
            let xs = StockLstm::make_inputs(chunk, self.device());
            let ys = tch::no_grad(|| self.net.forward_t(&xs, false));
            let flat = ys
                .to_device(Device::Cpu)
                .to_kind(Kind::Float)
                .contiguous()
                .view([-1]);
            let values = Vec::<GpuFloat>::try_from(&flat)?;
            forecasts.extend(values.chunks(horizon).map(to_cpu));
        }
        Ok(forecasts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(time: usize, features: usize, base: CpuFloat) -> Vec<Vec<CpuFloat>> {
        (0..time)
            .map(|t| {
                (0..features)
                    .map(|f| base + (t * features + f) as CpuFloat * 0.001)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn forward_shapes() {
        tch::manual_seed(0);
        let desc = StockLstmDesc::new(16, 12, 3);
        let model = LstmModel::new(&desc, Device::Cpu);
        let a = window(12, 16, 0.1);
        let b = window(12, 16, 0.5);
        let xs = StockLstm::make_inputs(&[a.as_slice(), b.as_slice()], Device::Cpu);
        assert_eq!(xs.size(), vec![2, 12, 16]);
        let ys = model.net.forward_t(&xs, false);
        assert_eq!(ys.size(), vec![2, 3]);
        let forecasts = model.forecast_batch(&[a.as_slice(), b.as_slice()]).unwrap();
        assert_eq!(forecasts.len(), 2);
        assert!(forecasts.iter().all(|f| f.len() == 3 && f.iter().all(|x| x.is_finite())));
    }

    #[test]
    fn save_and_load_round_trip() {
        tch::manual_seed(1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lstm_model.ot");
        let desc = StockLstmDesc::new(4, 6, 1);
        let model = LstmModel::new(&desc, Device::Cpu);
        model.save(&path).unwrap();
        let loaded = LstmModel::load(&desc, &path, Device::Cpu).unwrap();
        let w = window(6, 4, 0.2);
        assert_eq!(
            model.forecast(&w).unwrap(),
            loaded.forecast(&w).unwrap()
        );
        let summary = loaded.summary();
        assert!(summary.contains("lstm_1"));
        assert!(summary.contains("Total params"));
    }

    #[test]
    fn summary_totals_add_up() {
        let desc = StockLstmDesc::new(5, 4, 2);
        let model = LstmModel::new(&desc, Device::Cpu);
        let summary = model.summary();
        assert_eq!(summary, ModelSummary(&model).to_string());
        let lines: Vec<&str> = summary.lines().collect();
        // Two header lines, the column titles, eleven layers and three totals
        assert_eq!(lines.len(), 17);
        let count = |prefix: &str| -> i64 {
            lines
                .iter()
                .find_map(|l| l.strip_prefix(prefix))
                .unwrap()
                .trim()
                .parse()
                .unwrap()
        };
        let layers: i64 = lines[3..14]
            .iter()
            .map(|l| l.split_whitespace().last().unwrap().parse::<i64>().unwrap())
            .sum();
        let total = count("Total params:");
        assert_eq!(total, layers);
        assert_eq!(
            total,
            count("Trainable params:") + count("Non-trainable params:")
        );
        assert!(count("Non-trainable params:") > 0);
    }
}
