#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use std::io::{self, Read, Write};

use crate::error::{KsetError, Result};
use crate::storage;

/// Number of layers in a KIII network.
pub const LAYER_COUNT: usize = 3;

/// Constants of the KO second-order ODE and its output sigmoid.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OdeParams {
    /// Rise rate (1/ms).
    pub a: f64,
    /// Decay rate (1/ms).
    pub b: f64,
    /// Asymptote of the asymmetric sigmoid.
    pub q_m: f64,
    /// Integration step (ms per tick).
    pub h: f64,
}

impl Default for OdeParams {
    fn default() -> Self {
        Self {
            a: 0.22,
            b: 0.72,
            q_m: 5.0,
            h: 0.5,
        }
    }
}

/// Coupling weights inside a KII set.
///
/// - `w_ee`: excitatory <-> excitatory
/// - `w_ei`: inhibitory -> excitatory
/// - `w_ie`: excitatory -> inhibitory
/// - `w_ii`: inhibitory <-> inhibitory
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PairWeights {
    pub w_ee: f64,
    pub w_ei: f64,
    pub w_ie: f64,
    pub w_ii: f64,
}

impl PairWeights {
    pub const fn new(w_ee: f64, w_ei: f64, w_ie: f64, w_ii: f64) -> Self {
        Self {
            w_ee,
            w_ei,
            w_ie,
            w_ii,
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.w_ee, self.w_ei, self.w_ie, self.w_ii]
    }

    pub fn validate(&self) -> Result<()> {
        if self.as_array().iter().all(|w| w.is_finite()) {
            Ok(())
        } else {
            Err(KsetError::NonFinite {
                what: format!("pair weights {self:?}"),
            })
        }
    }
}

/// Default weights for one layer of the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerPreset {
    pub weights: PairWeights,
    /// Initial value of every off-diagonal entry of the lateral matrix.
    pub lateral: f64,
}

/// Parameters of the default bounded Hebbian rule.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HebbianParams {
    /// Increment applied to a co-active pair.
    pub rate: f64,
    /// Fractional decay applied toward `w_min` for every other pair.
    pub habituation: f64,
    /// A set is active when its deviation exceeds `threshold * mean deviation`.
    pub threshold: f64,
    pub w_min: f64,
    pub w_max: f64,
}

impl Default for HebbianParams {
    fn default() -> Self {
        Self {
            rate: 0.05,
            habituation: 0.01,
            threshold: 1.0,
            w_min: 0.0,
            w_max: 1.0,
        }
    }
}

/// How the three layers are advanced within a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionMode {
    /// Layers advanced in order 0, 1, 2 on the calling thread.
    #[default]
    Sequential,
    /// One task per layer on the worker pool, joined every tick
    /// (requires the `parallel` feature, falls back to sequential otherwise).
    Parallel,
}

impl ExecutionMode {
    /// The mode that will actually run, given the compiled features.
    pub fn effective(self) -> ExecutionMode {
        match self {
            ExecutionMode::Sequential => ExecutionMode::Sequential,
            ExecutionMode::Parallel => {
                #[cfg(feature = "parallel")]
                {
                    ExecutionMode::Parallel
                }
                #[cfg(not(feature = "parallel"))]
                {
                    ExecutionMode::Sequential
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct KsetConfig {
    /// Pair sets per layer (= input vector length).
    pub input_size: usize,
    pub ode: OdeParams,
    pub layers: [LayerPreset; LAYER_COUNT],

    /// Ticks of stimulus per presented pattern.
    pub active: u32,
    /// Ticks of zero input after each pattern.
    pub rest: u32,
    /// Zero-input ticks after the warm-up perturbation.
    pub warmup_rest: u32,
    /// Trailing ticks used for the activation deviation feature.
    pub feature_window: u32,

    /// Layer whose activation deviation is reported as the feature vector.
    pub readout_layer: usize,
    /// Layer whose lateral matrix is updated by `train`.
    pub trained_layer: usize,
    pub hebbian: HebbianParams,

    // If set, makes the warm-up perturbation reproducible.
    pub seed: Option<u64>,

    /// Size of the bounded worker pool used in parallel mode.
    pub worker_threads: usize,
}

impl Default for KsetConfig {
    /// Published KIII presets, 8 inputs.
    fn default() -> Self {
        Self {
            input_size: 8,
            ode: OdeParams::default(),
            layers: [
                LayerPreset {
                    weights: PairWeights::new(1.8, -2.0, 1.5, -0.8),
                    lateral: 0.15,
                },
                LayerPreset {
                    weights: PairWeights::new(1.6, -1.6, 1.6, -1.5),
                    lateral: 0.2,
                },
                LayerPreset {
                    weights: PairWeights::new(1.6, -2.0, 1.5, -1.8),
                    lateral: 0.15,
                },
            ],
            active: 200,
            rest: 200,
            warmup_rest: 299,
            feature_window: 200,
            readout_layer: 2,
            trained_layer: 2,
            hebbian: HebbianParams::default(),
            seed: None,
            worker_threads: LAYER_COUNT,
        }
    }
}

impl KsetConfig {
    pub const MAX_INPUT_SIZE: usize = 4096;

    pub fn with_input_size(input_size: usize) -> Self {
        Self {
            input_size,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the sniff cycle; the feature window follows the active phase.
    pub fn with_timing(mut self, active: u32, rest: u32) -> Self {
        self.active = active;
        self.rest = rest;
        self.feature_window = active;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.input_size > Self::MAX_INPUT_SIZE {
            return Err(KsetError::Config(format!(
                "input_size must be in [1, {}]",
                Self::MAX_INPUT_SIZE
            )));
        }
        let ode = &self.ode;
        if ![ode.a, ode.b, ode.q_m, ode.h].iter().all(|v| v.is_finite() && *v > 0.0) {
            return Err(KsetError::Config(
                "ODE constants a, b, q_m, h must be finite and > 0".to_string(),
            ));
        }
        for (i, preset) in self.layers.iter().enumerate() {
            preset.weights.validate()?;
            if !preset.lateral.is_finite() {
                return Err(KsetError::NonFinite {
                    what: format!("lateral weight of layer {i}"),
                });
            }
        }
        if self.active == 0 {
            return Err(KsetError::Config("active must be > 0".to_string()));
        }
        if self.feature_window < 2 || self.feature_window > self.active {
            return Err(KsetError::Config(
                "feature_window must be in [2, active]".to_string(),
            ));
        }
        if self.readout_layer >= LAYER_COUNT || self.trained_layer >= LAYER_COUNT {
            return Err(KsetError::Config(format!(
                "readout_layer and trained_layer must be < {LAYER_COUNT}"
            )));
        }
        let hb = &self.hebbian;
        if ![hb.rate, hb.habituation, hb.threshold, hb.w_min, hb.w_max]
            .iter()
            .all(|v| v.is_finite())
            || hb.w_min > hb.w_max
            || !(0.0..=1.0).contains(&hb.habituation)
        {
            return Err(KsetError::Config(
                "hebbian parameters must be finite, habituation in [0, 1], w_min <= w_max"
                    .to_string(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(KsetError::Config("worker_threads must be > 0".to_string()));
        }
        Ok(())
    }

    pub(crate) fn write_image_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_u32_le(w, self.input_size as u32)?;
        for v in [self.ode.a, self.ode.b, self.ode.q_m, self.ode.h] {
            storage::write_f64_le(w, v)?;
        }
        for preset in &self.layers {
            for v in preset.weights.as_array() {
                storage::write_f64_le(w, v)?;
            }
            storage::write_f64_le(w, preset.lateral)?;
        }
        storage::write_u32_le(w, self.active)?;
        storage::write_u32_le(w, self.rest)?;
        storage::write_u32_le(w, self.warmup_rest)?;
        storage::write_u32_le(w, self.feature_window)?;
        storage::write_u32_le(w, self.readout_layer as u32)?;
        storage::write_u32_le(w, self.trained_layer as u32)?;
        let hb = &self.hebbian;
        for v in [hb.rate, hb.habituation, hb.threshold, hb.w_min, hb.w_max] {
            storage::write_f64_le(w, v)?;
        }
        match self.seed {
            Some(seed) => {
                storage::write_u8(w, 1)?;
                storage::write_u64_le(w, seed)?;
            }
            None => storage::write_u8(w, 0)?,
        }
        storage::write_u32_le(w, self.worker_threads as u32)
    }

    pub(crate) fn read_image_payload<R: Read>(r: &mut R) -> io::Result<Self> {
        let input_size = storage::read_u32_le(r)? as usize;
        let ode = OdeParams {
            a: storage::read_f64_le(r)?,
            b: storage::read_f64_le(r)?,
            q_m: storage::read_f64_le(r)?,
            h: storage::read_f64_le(r)?,
        };
        let mut layers = Self::default().layers;
        for preset in &mut layers {
            preset.weights = PairWeights::new(
                storage::read_f64_le(r)?,
                storage::read_f64_le(r)?,
                storage::read_f64_le(r)?,
                storage::read_f64_le(r)?,
            );
            preset.lateral = storage::read_f64_le(r)?;
        }
        let active = storage::read_u32_le(r)?;
        let rest = storage::read_u32_le(r)?;
        let warmup_rest = storage::read_u32_le(r)?;
        let feature_window = storage::read_u32_le(r)?;
        let readout_layer = storage::read_u32_le(r)? as usize;
        let trained_layer = storage::read_u32_le(r)? as usize;
        let hebbian = HebbianParams {
            rate: storage::read_f64_le(r)?,
            habituation: storage::read_f64_le(r)?,
            threshold: storage::read_f64_le(r)?,
            w_min: storage::read_f64_le(r)?,
            w_max: storage::read_f64_le(r)?,
        };
        let seed = match storage::read_u8(r)? {
            0 => None,
            1 => Some(storage::read_u64_le(r)?),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "bad seed flag in CFG0",
                ))
            }
        };
        let worker_threads = storage::read_u32_le(r)? as usize;
        Ok(Self {
            input_size,
            ode,
            layers,
            active,
            rest,
            warmup_rest,
            feature_window,
            readout_layer,
            trained_layer,
            hebbian,
            seed,
            worker_threads,
        })
    }

    /// Parse a (possibly partial) JSON config; missing fields take defaults.
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: KsetConfig = serde_json::from_str(json)
            .map_err(|e| KsetError::Config(format!("invalid config JSON: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[cfg(feature = "serde")]
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
