//! Update policies for a layer's trainable lateral matrix.
//!
//! The exact learning law is a parameter of the experiment, so layers take
//! the rule as a [`TrainingRule`] value. Every rule declares the range its
//! weights live in; a layer refuses an update that leaves it.

use std::io::{self, Read, Write};

use crate::config::HebbianParams;
use crate::error::{KsetError, Result};
use crate::storage;

/// Dense square matrix with a zero diagonal; `get(i, j)` is the weight of
/// the connection from set `j` into set `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightMatrix {
    n: usize,
    data: Vec<f64>,
}

impl WeightMatrix {
    /// `n x n` matrix with every off-diagonal entry set to `value`.
    pub fn uniform(n: usize, value: f64) -> Self {
        let mut data = vec![value; n * n];
        for i in 0..n {
            data[i * n + i] = 0.0;
        }
        Self { n, data }
    }

    pub fn size(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    /// Diagonal writes are ignored.
    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        if i != j {
            self.data[i * self.n + j] = value;
        }
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n..(i + 1) * self.n]
    }

    /// Off-diagonal `(min, max)`, or `None` for matrices smaller than 2x2.
    pub fn range(&self) -> Option<(f64, f64)> {
        self.off_diagonal().fold(None, |acc, w| match acc {
            None => Some((w, w)),
            Some((lo, hi)) => Some((lo.min(w), hi.max(w))),
        })
    }

    fn off_diagonal(&self) -> impl Iterator<Item = f64> + '_ {
        let n = self.n;
        self.data
            .iter()
            .enumerate()
            .filter(move |(k, _)| k / n != k % n)
            .map(|(_, &w)| w)
    }

    /// Fails unless every off-diagonal weight is finite and inside `[lo, hi]`.
    pub fn check_bounds(&self, lo: f64, hi: f64) -> Result<()> {
        for w in self.off_diagonal() {
            if !w.is_finite() || w < lo || w > hi {
                return Err(KsetError::Training(format!(
                    "weight {w} outside [{lo}, {hi}]"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn write_image_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_u32_le(w, self.n as u32)?;
        for &v in &self.data {
            storage::write_f64_le(w, v)?;
        }
        Ok(())
    }

    /// Read an `n`×`n` matrix. A different stored size, a non-finite weight
    /// or a non-zero diagonal entry is rejected.
    pub(crate) fn read_image_payload<R: Read>(r: &mut R, n: usize) -> io::Result<Self> {
        let stored = storage::read_u32_le(r)? as usize;
        if stored != n {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("lateral matrix is {stored}x{stored}, expected {n}x{n}"),
            ));
        }
        let mut data = Vec::new();
        for i in 0..n {
            for j in 0..n {
                let v = storage::read_f64_le(r)?;
                if !v.is_finite() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "non-finite lateral weight",
                    ));
                }
                if i == j && v != 0.0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("self-coupling {v} on lateral diagonal {i}"),
                    ));
                }
                data.push(v);
            }
        }
        Ok(Self { n, data })
    }
}

/// One unsupervised update of a layer's lateral matrix.
pub trait TrainingRule: Send + Sync {
    /// Inclusive range every off-diagonal weight must stay in.
    fn bounds(&self) -> (f64, f64);

    /// Update `weights` from the layer's per-set activation deviation.
    fn update(&self, weights: &mut WeightMatrix, deviation: &[f64]);
}

/// Bounded Hebbian reinforcement with habituation.
///
/// A set is active when its deviation exceeds `threshold` times the layer
/// mean. Couplings between two active sets grow by `rate`; all others decay
/// toward `w_min` by the `habituation` fraction. Results are clamped to
/// `[w_min, w_max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hebbian {
    params: HebbianParams,
}

impl Hebbian {
    pub fn new(params: HebbianParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &HebbianParams {
        &self.params
    }
}

impl TrainingRule for Hebbian {
    fn bounds(&self) -> (f64, f64) {
        (self.params.w_min, self.params.w_max)
    }

    fn update(&self, weights: &mut WeightMatrix, deviation: &[f64]) {
        let n = weights.size().min(deviation.len());
        if n == 0 {
            return;
        }
        let p = &self.params;
        let mean = deviation[..n].iter().sum::<f64>() / n as f64;
        let active: Vec<bool> = deviation[..n]
            .iter()
            .map(|&s| s > 0.0 && s > p.threshold * mean)
            .collect();

        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let w = weights.get(i, j);
                let next = if active[i] && active[j] {
                    w + p.rate
                } else {
                    w - p.habituation * (w - p.w_min)
                };
                weights.set(i, j, next.clamp(p.w_min, p.w_max));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_matrix_has_zero_diagonal() {
        let m = WeightMatrix::uniform(3, 0.2);
        for i in 0..3 {
            assert_eq!(m.get(i, i), 0.0);
            assert_eq!(m.row(i).iter().sum::<f64>(), 0.4);
        }
        assert_eq!(m.range(), Some((0.2, 0.2)));
        assert_eq!(WeightMatrix::uniform(1, 0.2).range(), None);
    }

    #[test]
    fn coactive_sets_strengthen_others_habituate() {
        let rule = Hebbian::new(HebbianParams {
            rate: 0.1,
            habituation: 0.5,
            threshold: 1.0,
            w_min: 0.0,
            w_max: 1.0,
        });
        let mut m = WeightMatrix::uniform(3, 0.4);
        rule.update(&mut m, &[2.0, 2.0, 0.1]);
        assert!((m.get(0, 1) - 0.5).abs() < 1e-12);
        assert!((m.get(1, 0) - 0.5).abs() < 1e-12);
        assert!((m.get(0, 2) - 0.2).abs() < 1e-12);
        assert!((m.get(2, 1) - 0.2).abs() < 1e-12);
        assert_eq!(m.get(2, 2), 0.0);
    }

    #[test]
    fn repeated_updates_stay_bounded() {
        let rule = Hebbian::new(HebbianParams::default());
        let mut m = WeightMatrix::uniform(4, 0.15);
        for _ in 0..1000 {
            rule.update(&mut m, &[3.0, 3.0, 3.0, 0.0]);
        }
        let (lo, hi) = rule.bounds();
        m.check_bounds(lo, hi).unwrap();
        assert_eq!(m.get(0, 1), hi);
    }

    #[test]
    fn check_bounds_rejects_nan() {
        let mut m = WeightMatrix::uniform(2, 0.5);
        m.set(0, 1, f64::NAN);
        assert!(matches!(m.check_bounds(0.0, 1.0), Err(KsetError::Training(_))));
    }

    #[test]
    fn loaded_matrix_keeps_zero_diagonal_and_size() {
        let m = WeightMatrix::uniform(2, 0.3);
        let mut bytes = Vec::new();
        m.write_image_payload(&mut bytes).unwrap();
        let back = WeightMatrix::read_image_payload(&mut io::Cursor::new(&bytes), 2).unwrap();
        assert_eq!(back, m);

        let err = WeightMatrix::read_image_payload(&mut io::Cursor::new(&bytes), 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let self_coupled = WeightMatrix {
            n: 2,
            data: vec![0.0, 0.3, 0.3, 0.7],
        };
        let mut bytes = Vec::new();
        self_coupled.write_image_payload(&mut bytes).unwrap();
        let err = WeightMatrix::read_image_payload(&mut io::Cursor::new(&bytes), 2).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
