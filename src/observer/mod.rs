#[cfg(feature = "serde")]
use serde::Serialize;

use crate::network::Network;
use crate::view::LayerOutput;
use crate::Tick;

/// A read-only snapshot of what the network is doing.
///
/// Observers cannot mutate or steer the network. Snapshots are taken on
/// demand and may allocate; stepping is unaffected.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct NetworkSnapshot {
    pub tick: Tick,
    pub layers: Vec<LayerSnapshot>,
    /// Activation deviation of the readout layer over the feature window.
    pub readout_deviation: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct LayerSnapshot {
    pub index: usize,
    pub size: usize,
    pub mean_output: f64,
    pub mean_inhibitory_output: f64,
    /// Off-diagonal `(min, max)` of the lateral matrix.
    pub lateral_range: Option<(f64, f64)>,
}

pub struct NetworkAdapter<'a> {
    net: &'a Network,
}

impl<'a> NetworkAdapter<'a> {
    pub fn new(net: &'a Network) -> Self {
        Self { net }
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        let latest = self.net.tick().checked_sub(1);
        let layers = self
            .net
            .layers()
            .iter()
            .map(|layer| {
                let (primary, inhibitory) = match latest {
                    Some(t) => (
                        layer.layer_output_at(t).unwrap_or_default(),
                        layer.layer_inhibitory_output_at(t).unwrap_or_default(),
                    ),
                    None => (Vec::new(), Vec::new()),
                };
                LayerSnapshot {
                    index: layer.index(),
                    size: layer.size(),
                    mean_output: mean(&primary),
                    mean_inhibitory_output: mean(&inhibitory),
                    lateral_range: layer.lateral().range(),
                }
            })
            .collect();

        NetworkSnapshot {
            tick: self.net.tick(),
            layers,
            readout_deviation: self.net.readout_features(),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
