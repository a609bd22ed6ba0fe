/*!
Held-out evaluation in price units
*/
use crate::data::scale::MinMaxScaler;
use crate::error::{Error, Result};
use crate::features::{column_index, CLOSE};
use crate::predict::Forecaster;
use crate::sequence::Sequence;
use crate::CpuFloat;
use itertools::izip;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Regression metrics of inverse-scaled forecasts against actual prices
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Mean squared error
    pub mse: CpuFloat,
    /// Mean absolute error
    pub mae: CpuFloat,
    /// Root mean squared error
    pub rmse: CpuFloat,
    /// Coefficient of determination
    pub r2: CpuFloat,
    /// Mean absolute percentage error, over nonzero actual prices only
    pub mape: Option<CpuFloat>,
}

impl Metrics {
    /// Compute metrics from paired predicted and actual values
    pub fn compute(predicted: &[CpuFloat], actual: &[CpuFloat]) -> Result<Metrics> {
        if predicted.len() != actual.len() {
            return Err(Error::FeatureMismatch(format!(
                "{} predictions for {} targets",
                predicted.len(),
                actual.len()
            )));
        }
        if actual.is_empty() {
            return Err(Error::InsufficientData {
                needed: 1,
                available: 0,
            });
        }
        let n = actual.len() as CpuFloat;
        let mut sse = 0.0;
        let mut sae = 0.0;
        let mut ape = 0.0;
        let mut ape_count = 0usize;
        for (&p, &a) in izip!(predicted, actual) {
            let err = p - a;
            sse += err * err;
            sae += err.abs();
            if a != 0.0 {
                ape += (err / a).abs();
                ape_count += 1;
            }
        }
        let mean = actual.iter().sum::<CpuFloat>() / n;
        let sst: CpuFloat = actual.iter().map(|a| (a - mean) * (a - mean)).sum();
        let r2 = if sst == 0.0 {
            if sse == 0.0 {
                1.0
            } else {
                0.0
            }
        } else {
            1.0 - sse / sst
        };
        let mse = sse / n;
        Ok(Metrics {
            mse,
            mae: sae / n,
            rmse: mse.sqrt(),
            r2,
            mape: if ape_count == 0 {
                None
            } else {
                Some(ape / ape_count as CpuFloat * 100.0)
            },
        })
    }

    /// Fail unless every metric is a finite number
    pub fn ensure_finite(&self) -> Result<()> {
        let named = [
            ("mse", Some(self.mse)),
            ("mae", Some(self.mae)),
            ("rmse", Some(self.rmse)),
            ("r2", Some(self.r2)),
            ("mape", self.mape),
        ];
        let bad: Vec<String> = named
            .iter()
            .filter_map(|(name, value)| match value {
                Some(v) if !v.is_finite() => Some(format!("{}={}", name, v)),
                _ => None,
            })
            .collect();
        if bad.is_empty() {
            Ok(())
        } else {
            Err(Error::NonFiniteMetrics(bad.join(", ")))
        }
    }
}

/// Forecast every test sequence and score the inverse-scaled results against the inverse-scaled
/// targets, over every horizon step
pub fn evaluate<F: Forecaster + ?Sized>(
    model: &F,
    test: &[Sequence],
    scaler: &MinMaxScaler,
    columns: &[String],
) -> Result<Metrics> {
    scaler.check_columns(columns)?;
    let close = column_index(columns, CLOSE)?;
    let windows: Vec<&[Vec<CpuFloat>]> = test.iter().map(|s| s.inputs.as_slice()).collect();
    let forecasts = model.forecast_batch(&windows)?;

    let mut predicted = Vec::with_capacity(test.len() * model.horizon());
    let mut actual = Vec::with_capacity(predicted.capacity());
    for (forecast, sequence) in izip!(&forecasts, test) {
        for (&p, &a) in izip!(forecast, &sequence.target) {
            predicted.push(scaler.inverse_column(close, p)?);
            actual.push(scaler.inverse_column(close, a)?);
        }
    }
    let metrics = Metrics::compute(&predicted, &actual)?;
    metrics.ensure_finite()?;
    debug!(
        samples = actual.len(),
        mse = metrics.mse,
        mae = metrics.mae,
        r2 = metrics.r2,
        "evaluated model"
    );
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::default_columns;
    use chrono::NaiveDateTime;

    #[test]
    fn perfect_predictions() {
        let m = Metrics::compute(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(m.mse, 0.0);
        assert_eq!(m.rmse, 0.0);
        assert_eq!(m.r2, 1.0);
        assert_eq!(m.mape, Some(0.0));
    }

    #[test]
    fn known_errors() {
        let m = Metrics::compute(&[2.0, 2.0, 4.0, 4.0], &[1.0, 3.0, 3.0, 5.0]).unwrap();
        assert_eq!(m.mse, 1.0);
        assert_eq!(m.mae, 1.0);
        assert_eq!(m.rmse, 1.0);
        // Mean 3, total sum of squares 8
        assert_eq!(m.r2, 0.5);
        let mape = m.mape.unwrap();
        let expected = (1.0 + 1.0 / 3.0 + 1.0 / 3.0 + 0.2) / 4.0 * 100.0;
        assert!((mape - expected).abs() < 1e-9);
    }

    #[test]
    fn zero_division_policies() {
        // Constant targets, imperfect fit
        let m = Metrics::compute(&[1.0, 3.0], &[2.0, 2.0]).unwrap();
        assert_eq!(m.r2, 0.0);
        // All actual prices zero
        let m = Metrics::compute(&[1.0, 0.0], &[0.0, 0.0]).unwrap();
        assert_eq!(m.mape, None);
        assert!(Metrics::compute(&[], &[]).is_err());
        assert!(Metrics::compute(&[1.0], &[]).is_err());
    }

    struct Echo;

    impl Forecaster for Echo {
        fn horizon(&self) -> usize {
            1
        }

        fn forecast_batch(&self, windows: &[&[Vec<CpuFloat>]]) -> Result<Vec<Vec<CpuFloat>>> {
            // Repeat the last close
            Ok(windows
                .iter()
                .map(|w| vec![w[w.len() - 1][3]])
                .collect())
        }
    }

    #[test]
    fn evaluates_in_price_units() {
        let columns = default_columns();
        let lo = vec![100.0; columns.len()];
        let hi = vec![200.0; columns.len()];
        let scaler = MinMaxScaler::fit(&columns, &[lo, hi]).unwrap();
        let t = NaiveDateTime::parse_from_str("2024-01-02 10:00:00", crate::data::PROVIDER_DATETIME)
            .unwrap();
        let test = vec![
            Sequence {
                end: t,
                inputs: vec![vec![0.5; 16]; 3],
                target: vec![0.6],
            },
            Sequence {
                end: t,
                inputs: vec![vec![0.2; 16]; 3],
                target: vec![0.2],
            },
        ];
        let m = evaluate(&Echo, &test, &scaler, &columns).unwrap();
        // Errors of 10 and 0 price units
        assert!((m.mse - 50.0).abs() < 1e-9);
        assert!((m.mae - 5.0).abs() < 1e-9);
    }

    struct Diverged;

    impl Forecaster for Diverged {
        fn horizon(&self) -> usize {
            1
        }

        fn forecast_batch(&self, windows: &[&[Vec<CpuFloat>]]) -> Result<Vec<Vec<CpuFloat>>> {
            Ok(windows.iter().map(|_| vec![CpuFloat::NAN]).collect())
        }
    }

    #[test]
    fn non_finite_forecasts_are_rejected() {
        let columns = default_columns();
        let scaler = MinMaxScaler::fit(
            &columns,
            &[vec![100.0; columns.len()], vec![200.0; columns.len()]],
        )
        .unwrap();
        let t = NaiveDateTime::parse_from_str("2024-01-02 10:00:00", crate::data::PROVIDER_DATETIME)
            .unwrap();
        let test = vec![Sequence {
            end: t,
            inputs: vec![vec![0.5; 16]; 3],
            target: vec![0.6],
        }];
        match evaluate(&Diverged, &test, &scaler, &columns) {
            Err(Error::NonFiniteMetrics(which)) => assert!(which.contains("mse")),
            other => panic!("expected non-finite metrics, got {:?}", other),
        }

        let overflow = Metrics::compute(&[f64::MAX, -f64::MAX], &[0.0, 1.0]).unwrap();
        assert!(overflow.ensure_finite().is_err());
        assert!(Metrics::compute(&[1.0], &[2.0])
            .unwrap()
            .ensure_finite()
            .is_ok());
    }
}
