use std::io::{self, Read, Write};

use crate::config::{LayerPreset, OdeParams};
use crate::connection::{OutputSource, SourceRef, Tap};
use crate::error::{KsetError, Result};
use crate::pair::{PairSet, Role};
use crate::storage;
use crate::training::{TrainingRule, WeightMatrix};
use crate::view::{InhibitoryView, LayerOutput};
use crate::Tick;

/// A row of KII sets sharing one set of pair weights, coupled laterally
/// through a trainable weight matrix on their primary units.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    index: usize,
    sets: Vec<PairSet>,
    lateral: WeightMatrix,
}

impl Layer {
    pub fn new(
        index: usize,
        size: usize,
        preset: &LayerPreset,
        history_len: usize,
    ) -> Result<Self> {
        if size == 0 {
            return Err(KsetError::Config(format!("layer {index} must have at least one set")));
        }
        let sets = (0..size)
            .map(|_| PairSet::new(preset.weights, history_len))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            index,
            sets,
            lateral: WeightMatrix::uniform(size, preset.lateral),
        })
    }

    /// Position of this layer in its network.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn size(&self) -> usize {
        self.sets.len()
    }

    pub fn sets(&self) -> &[PairSet] {
        &self.sets
    }

    pub fn set(&self, i: usize) -> Option<&PairSet> {
        self.sets.get(i)
    }

    pub fn set_checked(&self, i: usize) -> Result<&PairSet> {
        self.sets.get(i).ok_or_else(|| {
            KsetError::Config(format!(
                "set {i} out of range for layer {} of size {}",
                self.index,
                self.sets.len()
            ))
        })
    }

    pub fn lateral(&self) -> &WeightMatrix {
        &self.lateral
    }

    pub fn set_lateral(&mut self, lateral: WeightMatrix) -> Result<()> {
        if lateral.size() != self.size() {
            return Err(KsetError::Config(format!(
                "lateral matrix is {0}x{0}, layer {1} has {2} sets",
                lateral.size(),
                self.index,
                self.size()
            )));
        }
        lateral.check_bounds(f64::MIN, f64::MAX)?;
        self.lateral = lateral;
        Ok(())
    }

    /// Drive every set's primary unit with one element of `stimulus`.
    ///
    /// The stimulus persists until overwritten. On error nothing changes.
    pub fn set_external_stimulus(&mut self, stimulus: &[f64]) -> Result<()> {
        if stimulus.len() != self.sets.len() {
            return Err(KsetError::StimulusLength {
                expected: self.sets.len(),
                got: stimulus.len(),
            });
        }
        if let Some(i) = stimulus.iter().position(|s| !s.is_finite()) {
            return Err(KsetError::NonFinite {
                what: format!("stimulus element {i} for layer {}", self.index),
            });
        }
        for (set, &s) in self.sets.iter_mut().zip(stimulus) {
            set.set_external_stimulus(s)?;
        }
        Ok(())
    }

    pub fn external_stimulus(&self) -> Vec<f64> {
        self.sets
            .iter()
            .map(|s| s.unit(Role::PRIMARY).external_stimulus())
            .collect()
    }

    /// Connect set `i` of layer `from` into the primary unit of set `i` here.
    pub fn connect_layer(&mut self, from: usize, tap: Tap, weight: f64, delay: u32) -> Result<()> {
        for (i, set) in self.sets.iter_mut().enumerate() {
            set.connect(SourceRef::Layer { layer: from, index: i, tap }, weight, delay)?;
        }
        Ok(())
    }

    /// Like [`Layer::connect_layer`], landing on each set's inhibitory port.
    pub fn connect_layer_inhibitory(
        &mut self,
        from: usize,
        tap: Tap,
        weight: f64,
        delay: u32,
    ) -> Result<()> {
        for (i, set) in self.sets.iter_mut().enumerate() {
            set.connect_inhibitory(SourceRef::Layer { layer: from, index: i, tap }, weight, delay)?;
        }
        Ok(())
    }

    /// Connection and lateral input of every unit for tick `now`.
    ///
    /// Reads committed history only, so all layers of a network may gather
    /// concurrently before any of them advances.
    pub fn gather(&self, now: Tick, layers: &[Layer]) -> Result<Vec<[f64; 4]>> {
        let mut drives = self
            .sets
            .iter()
            .map(|set| set.gather(now, layers))
            .collect::<Result<Vec<_>>>()?;

        if let Some(prev) = now.checked_sub(1) {
            let outputs = self
                .sets
                .iter()
                .map(|set| set.output_at(prev))
                .collect::<Result<Vec<_>>>()?;
            for (i, drive) in drives.iter_mut().enumerate() {
                let lateral: f64 = self
                    .lateral
                    .row(i)
                    .iter()
                    .zip(&outputs)
                    .map(|(w, y)| w * y)
                    .sum();
                drive[Role::PRIMARY.index()] += lateral;
            }
        }
        Ok(drives)
    }

    /// Commit tick `now` for every set using drives from [`Layer::gather`].
    pub fn advance(&mut self, now: Tick, drives: &[[f64; 4]], ode: &OdeParams) -> Result<()> {
        if drives.len() != self.sets.len() {
            return Err(KsetError::Runtime(format!(
                "layer {} got {} drive rows for {} sets",
                self.index,
                drives.len(),
                self.sets.len()
            )));
        }
        let layer = self.index;
        for (i, (set, d)) in self.sets.iter_mut().zip(drives).enumerate() {
            set.commit(now, d, ode).map_err(|e| match e {
                KsetError::NumericInstability { tick, .. } => KsetError::NumericInstability {
                    layer,
                    index: i,
                    tick,
                },
                other => other,
            })?;
        }
        Ok(())
    }

    /// Secondary outputs of all sets committed at `tick`.
    pub fn layer_inhibitory_output_at(&self, tick: Tick) -> Result<Vec<f64>> {
        InhibitoryView::new(self).layer_output_at(tick)
    }

    /// Trailing inhibitory outputs of every set, oldest first.
    pub fn inhibitory_history(&self, window: usize) -> Vec<Vec<f64>> {
        self.sets
            .iter()
            .map(|s| s.unit(Role::SECONDARY).history().trailing(window))
            .collect()
    }

    /// Population standard deviation of each set's primary output over the
    /// trailing `window` ticks. Sets with fewer than two samples report 0.0.
    pub fn activation_deviation(&self, window: usize) -> Vec<f64> {
        self.history(window).iter().map(|h| std_dev(h)).collect()
    }

    /// Apply one update of `rule` to the lateral matrix, driven by the
    /// activation deviation over `window`.
    ///
    /// The matrix is only replaced when the updated weights are finite and
    /// within the rule's bounds.
    pub fn train(&mut self, rule: &dyn TrainingRule, window: usize) -> Result<()> {
        let deviation = self.activation_deviation(window);
        let mut next = self.lateral.clone();
        rule.update(&mut next, &deviation);
        let (lo, hi) = rule.bounds();
        next.check_bounds(lo, hi).map_err(|e| match e {
            KsetError::Training(msg) => KsetError::Training(format!("layer {}: {msg}", self.index)),
            other => other,
        })?;
        self.lateral = next;
        Ok(())
    }

    pub(crate) fn write_image_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_u32_le(w, self.index as u32)?;
        storage::write_u32_le(w, self.sets.len() as u32)?;
        for set in &self.sets {
            set.write_image_payload(w)?;
        }
        self.lateral.write_image_payload(w)
    }

    /// Read a layer of exactly `size` sets whose units keep `history_len`
    /// ticks. Stored counts are checked before anything is read for them.
    pub(crate) fn read_image_payload<R: Read>(
        r: &mut R,
        size: usize,
        history_len: usize,
    ) -> io::Result<Self> {
        let index = storage::read_u32_le(r)? as usize;
        let n = storage::read_u32_le(r)? as usize;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("layer holds {n} sets, expected {size}"),
            ));
        }
        let mut sets = Vec::new();
        for _ in 0..n {
            sets.push(PairSet::read_image_payload(r, history_len)?);
        }
        let lateral = WeightMatrix::read_image_payload(r, n)?;
        Ok(Self {
            index,
            sets,
            lateral,
        })
    }
}

impl LayerOutput for Layer {
    fn size(&self) -> usize {
        self.sets.len()
    }

    fn unit_output_at(&self, index: usize, tick: Tick) -> Result<f64> {
        self.set_checked(index)?.output_at(tick)
    }

    fn history(&self, window: usize) -> Vec<Vec<f64>> {
        self.sets
            .iter()
            .map(|s| s.unit(Role::PRIMARY).history().trailing(window))
            .collect()
    }
}

fn std_dev(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let var = samples.iter().map(|y| (y - mean) * (y - mean)).sum::<f64>() / n;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HebbianParams, PairWeights};
    use crate::training::Hebbian;

    fn preset() -> LayerPreset {
        LayerPreset {
            weights: PairWeights::new(1.6, -1.6, 1.6, -1.5),
            lateral: 0.2,
        }
    }

    fn run(layer: &mut Layer, from: Tick, to: Tick) {
        let ode = OdeParams::default();
        for t in from..to {
            let drives = layer.gather(t, &[]).unwrap();
            layer.advance(t, &drives, &ode).unwrap();
        }
    }

    #[test]
    fn stimulus_length_and_values_are_checked() {
        let mut layer = Layer::new(0, 3, &preset(), 8).unwrap();
        assert!(matches!(
            layer.set_external_stimulus(&[1.0, 2.0]),
            Err(KsetError::StimulusLength { expected: 3, got: 2 })
        ));
        assert!(matches!(
            layer.set_external_stimulus(&[1.0, f64::NAN, 0.0]),
            Err(KsetError::NonFinite { .. })
        ));
        assert_eq!(layer.external_stimulus(), vec![0.0; 3]);
        layer.set_external_stimulus(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(layer.external_stimulus(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn lateral_coupling_spreads_activity() {
        let mut coupled = Layer::new(0, 2, &preset(), 8).unwrap();
        let mut isolated = Layer::new(0, 2, &preset(), 8).unwrap();
        isolated.set_lateral(WeightMatrix::uniform(2, 0.0)).unwrap();
        for layer in [&mut coupled, &mut isolated] {
            layer.set_external_stimulus(&[1.0, 0.0]).unwrap();
            run(layer, 0, 40);
        }
        assert_eq!(isolated.sets()[1].output(), 0.0);
        assert_ne!(coupled.sets()[1].output(), 0.0);
    }

    #[test]
    fn deviation_is_zero_for_silent_sets() {
        let mut layer = Layer::new(0, 3, &preset(), 64).unwrap();
        assert_eq!(layer.activation_deviation(10), vec![0.0; 3]);
        run(&mut layer, 0, 64);
        assert_eq!(layer.activation_deviation(32), vec![0.0; 3]);
        layer.set_external_stimulus(&[2.0, 2.0, 2.0]).unwrap();
        run(&mut layer, 64, 128);
        assert!(layer.activation_deviation(32).iter().all(|&s| s > 0.0));
    }

    #[test]
    fn output_vectors_follow_roles() {
        let mut layer = Layer::new(0, 2, &preset(), 8).unwrap();
        layer.set_external_stimulus(&[1.0, 0.5]).unwrap();
        run(&mut layer, 0, 12);
        let primary = layer.layer_output_at(11).unwrap();
        let secondary = layer.layer_inhibitory_output_at(11).unwrap();
        assert_eq!(primary, vec![layer.sets()[0].output(), layer.sets()[1].output()]);
        assert_eq!(
            secondary,
            vec![layer.sets()[0].inhibitory_output(), layer.sets()[1].inhibitory_output()]
        );
        assert_eq!(layer.history(3)[0].len(), 3);
        assert!(matches!(layer.unit_output_at(2, 11), Err(KsetError::Config(_))));
    }

    #[test]
    fn std_dev_matches_population_formula() {
        assert_eq!(std_dev(&[1.0]), 0.0);
        assert_eq!(std_dev(&[1.0, 3.0]), 1.0);
        assert_eq!(std_dev(&[2.0, 2.0, 2.0]), 0.0);
    }

    #[test]
    fn training_keeps_weights_in_bounds() {
        let mut layer = Layer::new(2, 4, &preset(), 64).unwrap();
        layer.set_external_stimulus(&[3.0, 3.0, 0.0, 0.0]).unwrap();
        run(&mut layer, 0, 64);
        let before = layer.lateral().clone();
        let rule = Hebbian::new(HebbianParams::default());
        layer.train(&rule, 32).unwrap();
        assert_ne!(layer.lateral(), &before);
        layer.lateral().check_bounds(0.0, 1.0).unwrap();
        for i in 0..4 {
            assert_eq!(layer.lateral().get(i, i), 0.0);
        }
    }

    #[test]
    fn out_of_bounds_update_is_refused() {
        struct Runaway;
        impl TrainingRule for Runaway {
            fn bounds(&self) -> (f64, f64) {
                (0.0, 1.0)
            }
            fn update(&self, weights: &mut WeightMatrix, _deviation: &[f64]) {
                weights.set(0, 1, 5.0);
            }
        }
        let mut layer = Layer::new(1, 2, &preset(), 8).unwrap();
        let before = layer.lateral().clone();
        let err = layer.train(&Runaway, 4).unwrap_err();
        assert!(matches!(err, KsetError::Training(ref msg) if msg.starts_with("layer 1: weight 5")));
        assert_eq!(err.to_string().matches("training").count(), 1);
        assert_eq!(layer.lateral(), &before);
    }

    #[test]
    fn instability_is_labelled_with_location() {
        let mut layer = Layer::new(1, 2, &preset(), 8).unwrap();
        let drives = vec![[0.0; 4], [0.0, 0.0, f64::INFINITY, 0.0]];
        let err = layer.advance(0, &drives, &OdeParams::default()).unwrap_err();
        assert!(matches!(
            err,
            KsetError::NumericInstability { layer: 1, index: 1, tick: 0 }
        ));
    }
}
