//! # ksets
//!
//! Freeman K-set chaotic oscillator networks.
//!
//! A KO unit is a damped second-order oscillator with an asymmetric sigmoid
//! output. Four KO units wired as two excitatory and two inhibitory nodes form
//! a KII set; rows of KII sets form layers, and three layers joined by delayed
//! excitatory and inhibitory projections form the KIII network. Presenting a
//! pattern to layer 0 and measuring how strongly each readout set oscillates
//! yields a feature vector for that pattern.
//!
//! ## Quick Start
//!
//! ```
//! use ksets::prelude::*;
//!
//! let cfg = KsetConfig::with_input_size(4).with_seed(42).with_timing(40, 20);
//! let mut net = Network::new(cfg).unwrap();
//!
//! // Move the network off its zero fixed point.
//! net.initialize().unwrap();
//!
//! let patterns = vec![vec![1.0, 0.0, 0.0, 1.0], vec![0.0, 1.0, 1.0, 0.0]];
//! net.train(&patterns).unwrap();
//! let features = net.run(&patterns).unwrap();
//! assert_eq!(features.len(), 2);
//! ```
//!
//! ## Feature Flags
//!
//! - `parallel` (default): advance the three layers on a rayon pool
//! - `serde` (default): JSON configs and serializable snapshots
//!
//! ## Modules
//!
//! - [`oscillator`]: KO unit and its history ring
//! - [`pair`]: KII excitatory/inhibitory set
//! - [`layer`]: rows of KII sets with lateral coupling
//! - [`network`]: the KIII network, stepping, training and images
//! - [`observer`]: Read-only observation adapters

/// Global simulation time, in integrator steps.
pub type Tick = u64;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/connection.rs"]
pub mod connection;

#[path = "core/oscillator.rs"]
pub mod oscillator;

#[path = "core/pair.rs"]
pub mod pair;

#[path = "core/view.rs"]
pub mod view;

#[path = "core/training.rs"]
pub mod training;

#[path = "core/layer.rs"]
pub mod layer;

#[path = "core/runtime.rs"]
pub mod runtime;

#[path = "core/network.rs"]
pub mod network;

pub mod observer;

/// Prelude module for convenient imports.
///
/// ```
/// use ksets::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{
        ExecutionMode, HebbianParams, KsetConfig, LayerPreset, OdeParams, PairWeights,
    };
    pub use crate::connection::{Connection, OutputSource, SourceRef, Tap};
    pub use crate::error::{KsetError, Result};
    pub use crate::layer::Layer;
    pub use crate::network::{Network, Port, Projection, KIII_PROJECTIONS};
    pub use crate::oscillator::Oscillator;
    pub use crate::pair::{PairSet, Role};
    pub use crate::training::{Hebbian, TrainingRule, WeightMatrix};
    pub use crate::view::{InhibitoryView, LayerOutput};
    pub use crate::Tick;
}
