//! Read-only output views.
//!
//! Some KIII projections read the inhibitory branch of a layer instead of
//! its excitatory one. [`InhibitoryView`] borrows a pair set or a layer and
//! answers every output query from the inhibitory unit; it never owns or
//! mutates the units behind it.

use crate::connection::OutputSource;
use crate::error::Result;
use crate::layer::Layer;
use crate::pair::PairSet;
use crate::Tick;

/// Per-set outputs of a layer-shaped source.
pub trait LayerOutput {
    fn size(&self) -> usize;

    /// Output of set `index` committed at `tick`.
    fn unit_output_at(&self, index: usize, tick: Tick) -> Result<f64>;

    /// Outputs of all sets committed at `tick`.
    fn layer_output_at(&self, tick: Tick) -> Result<Vec<f64>> {
        (0..self.size())
            .map(|i| self.unit_output_at(i, tick))
            .collect()
    }

    /// Trailing `window` outputs of every set, oldest first.
    fn history(&self, window: usize) -> Vec<Vec<f64>>;
}

/// Redirects output reads to the inhibitory branch of `T`.
#[derive(Debug, Clone, Copy)]
pub struct InhibitoryView<'a, T: ?Sized> {
    origin: &'a T,
}

impl<'a, T: ?Sized> InhibitoryView<'a, T> {
    pub fn new(origin: &'a T) -> Self {
        Self { origin }
    }

    pub fn origin(&self) -> &'a T {
        self.origin
    }
}

impl OutputSource for InhibitoryView<'_, PairSet> {
    fn output_at(&self, tick: Tick) -> Result<f64> {
        self.origin.inhibitory_output_at(tick)
    }

    fn output(&self) -> f64 {
        self.origin.inhibitory_output()
    }
}

impl LayerOutput for InhibitoryView<'_, Layer> {
    fn size(&self) -> usize {
        self.origin.size()
    }

    fn unit_output_at(&self, index: usize, tick: Tick) -> Result<f64> {
        self.origin.set_checked(index)?.inhibitory_output_at(tick)
    }

    fn history(&self, window: usize) -> Vec<Vec<f64>> {
        self.origin.inhibitory_history(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OdeParams, PairWeights};

    #[test]
    fn pair_view_reports_inhibitory_unit() {
        let ode = OdeParams::default();
        let mut set = PairSet::new(PairWeights::new(1.0, -1.5, 1.2, -0.4), 8).unwrap();
        set.set_external_stimulus(1.0).unwrap();
        for t in 0..30 {
            set.advance(t, &ode).unwrap();
        }
        let view = InhibitoryView::new(&set);
        assert_eq!(view.output(), set.inhibitory_output());
        assert_eq!(view.output_at(12).unwrap(), set.inhibitory_output_at(12).unwrap());
        assert_ne!(view.output(), set.output());
        assert_eq!(view.delayed_output(30, 5).unwrap(), set.inhibitory_output_at(25).unwrap());
    }
}
