/*!
Miscellaneous utilities for `stockcast`
*/

use crate::CpuFloat;
use num::{Float, NumCast};

/// Append rows of CPU floats to a flat buffer of `F`, row-major. Unrepresentable values become NaN
pub fn push_rows<F: Float>(rows: &[Vec<CpuFloat>], out: &mut Vec<F>) {
    for row in rows {
        out.extend(row.iter().map(|&x| NumCast::from(x).unwrap_or_else(F::nan)));
    }
}

/// Convert a slice of floats back to CPU floats
pub fn to_cpu<F: Float>(values: &[F]) -> Vec<CpuFloat> {
    values
        .iter()
        .map(|&x| NumCast::from(x).unwrap_or(CpuFloat::NAN))
        .collect()
}

/// Round a value to a given number of decimal places
pub fn round_to(value: CpuFloat, places: i32) -> CpuFloat {
    let factor = 10.0_f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_rows() {
        let mut out: Vec<f32> = Vec::new();
        push_rows(&[vec![1.0, 2.0], vec![3.0, 4.5]], &mut out);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.5]);
        assert_eq!(to_cpu(&out), vec![1.0, 2.0, 3.0, 4.5]);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(181.23456, 2), 181.23);
        assert_eq!(round_to(-0.005, 1), -0.0);
    }
}
