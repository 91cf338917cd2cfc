//! The KIII network: three layers of KII sets joined by a fixed set of
//! delayed inter-layer projections.
//!
//! A tick runs in two phases. Every layer first gathers its connection and
//! lateral input from committed history (shared borrows only), then each
//! layer commits the tick for its own sets. Because no read ever targets the
//! tick being computed, sequential and parallel stepping produce identical
//! results.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::{ExecutionMode, KsetConfig, LAYER_COUNT};
use crate::connection::{OutputSource, SourceRef, Tap};
use crate::error::{KsetError, Result};
use crate::layer::Layer;
use crate::pair::Role;
use crate::prng::Prng;
use crate::runtime::Runtime;
use crate::storage;
use crate::training::{Hebbian, TrainingRule};
use crate::Tick;

/// Which unit of the target set a projection lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Primary,
    Inhibitory,
}

/// An index-aligned projection: set `i` of `source` drives set `i` of
/// `target`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub target: usize,
    pub source: usize,
    pub tap: Tap,
    pub port: Port,
    pub weight: f64,
    pub delay: u32,
}

impl Projection {
    const fn new(
        target: usize,
        source: usize,
        tap: Tap,
        port: Port,
        weight: f64,
        delay: u32,
    ) -> Self {
        Self {
            target,
            source,
            tap,
            port,
            weight,
            delay,
        }
    }
}

/// Inter-layer projections of the KIII model.
pub const KIII_PROJECTIONS: [Projection; 7] = [
    Projection::new(1, 0, Tap::Excitatory, Port::Primary, 0.3, 1),
    Projection::new(2, 0, Tap::Excitatory, Port::Primary, 0.5, 1),
    Projection::new(0, 1, Tap::Excitatory, Port::Primary, 0.5, 17),
    Projection::new(0, 1, Tap::Excitatory, Port::Inhibitory, 0.6, 25),
    Projection::new(2, 1, Tap::Excitatory, Port::Primary, 1.0, 1),
    Projection::new(0, 2, Tap::Inhibitory, Port::Inhibitory, -0.5, 25),
    Projection::new(1, 2, Tap::Excitatory, Port::Inhibitory, 0.5, 25),
];

/// Longest lag any projection reads at.
pub fn max_projection_lag() -> u32 {
    KIII_PROJECTIONS
        .iter()
        .map(|p| p.delay.max(1))
        .max()
        .unwrap_or(1)
}

/// Ticks of output every unit retains: enough for the longest projection
/// and for the feature window.
pub fn history_len(cfg: &KsetConfig) -> usize {
    (max_projection_lag() as usize + 1).max(cfg.feature_window as usize)
}

#[doc(alias = "KIII")]
#[derive(Debug)]
pub struct Network {
    cfg: KsetConfig,
    layers: Vec<Layer>,
    tick: Tick,
    rng: Prng,
    runtime: Runtime,
}

impl Network {
    pub fn new(cfg: KsetConfig) -> Result<Self> {
        cfg.validate()?;
        let history_len = history_len(&cfg);

        let mut layers = cfg
            .layers
            .iter()
            .enumerate()
            .map(|(i, preset)| Layer::new(i, cfg.input_size, preset, history_len))
            .collect::<Result<Vec<_>>>()?;

        for p in &KIII_PROJECTIONS {
            let target = &mut layers[p.target];
            match p.port {
                Port::Primary => target.connect_layer(p.source, p.tap, p.weight, p.delay)?,
                Port::Inhibitory => {
                    target.connect_layer_inhibitory(p.source, p.tap, p.weight, p.delay)?
                }
            }
        }

        let rng = Prng::new(cfg.seed.unwrap_or(1));
        let runtime = Runtime::build(cfg.worker_threads)?;

        info!(
            input_size = cfg.input_size,
            history_len,
            workers = runtime.threads(),
            "built KIII network"
        );

        Ok(Self {
            cfg,
            layers,
            tick: 0,
            rng,
            runtime,
        })
    }

    pub fn config(&self) -> &KsetConfig {
        &self.cfg
    }

    /// Number of ticks committed so far (= the next tick to compute).
    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, i: usize) -> Option<&Layer> {
        self.layers.get(i)
    }

    pub fn input_size(&self) -> usize {
        self.cfg.input_size
    }

    /// Write the stimulus of layer 0. Other layers are never stimulated
    /// directly.
    pub fn set_external_stimulus(&mut self, stimulus: &[f64]) -> Result<()> {
        self.layers[0].set_external_stimulus(stimulus)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stepping
    // ─────────────────────────────────────────────────────────────────────

    /// Set the layer-0 stimulus once, then advance `n` ticks sequentially.
    pub fn step(&mut self, stimulus: &[f64], n: u32) -> Result<()> {
        self.step_in(ExecutionMode::Sequential, stimulus, n)
    }

    /// Like [`Network::step`], with the three layers advanced on the worker
    /// pool.
    pub fn step_parallel(&mut self, stimulus: &[f64], n: u32) -> Result<()> {
        self.step_in(ExecutionMode::Parallel, stimulus, n)
    }

    pub fn step_in(&mut self, mode: ExecutionMode, stimulus: &[f64], n: u32) -> Result<()> {
        let mode = resolve_mode(mode);
        self.set_external_stimulus(stimulus)?;
        self.advance_n(mode, n)
    }

    fn advance_n(&mut self, mode: ExecutionMode, n: u32) -> Result<()> {
        for _ in 0..n {
            self.advance_tick(mode)?;
        }
        Ok(())
    }

    fn advance_tick(&mut self, mode: ExecutionMode) -> Result<()> {
        let now = self.tick;
        let result = match mode {
            ExecutionMode::Sequential => self.advance_sequential(now),
            #[cfg(feature = "parallel")]
            ExecutionMode::Parallel => self.advance_parallel(now),
            #[cfg(not(feature = "parallel"))]
            ExecutionMode::Parallel => self.advance_sequential(now),
        };
        if let Err(e @ KsetError::NumericInstability { .. }) = &result {
            error!(tick = now, "{e}");
        }
        result?;
        self.tick += 1;
        Ok(())
    }

    fn advance_sequential(&mut self, now: Tick) -> Result<()> {
        let ode = self.cfg.ode;
        for i in 0..self.layers.len() {
            let drives = self.layers[i].gather(now, &self.layers)?;
            self.layers[i].advance(now, &drives, &ode)?;
        }
        Ok(())
    }

    #[cfg(feature = "parallel")]
    fn advance_parallel(&mut self, now: Tick) -> Result<()> {
        let ode = self.cfg.ode;
        let layers = &mut self.layers;
        self.runtime.install(|| {
            let drives = {
                let snapshot: &[Layer] = layers;
                snapshot
                    .par_iter()
                    .map(|layer| layer.gather(now, snapshot))
                    .collect::<Result<Vec<_>>>()?
            };
            layers
                .par_iter_mut()
                .zip(drives.par_iter())
                .try_for_each(|(layer, d)| layer.advance(now, d, &ode))
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pattern presentation
    // ─────────────────────────────────────────────────────────────────────

    /// One tick of random perturbation in [-0.5, 0.5), then `warmup_rest`
    /// ticks of zero input. Returns the readout features afterwards.
    pub fn initialize(&mut self) -> Result<Vec<Vec<f64>>> {
        self.initialize_in(ExecutionMode::Sequential)
    }

    pub fn initialize_in(&mut self, mode: ExecutionMode) -> Result<Vec<Vec<f64>>> {
        let mode = resolve_mode(mode);
        let perturbation: Vec<f64> = (0..self.cfg.input_size)
            .map(|_| self.rng.gen_range_f64(-0.5, 0.5))
            .collect();
        self.set_external_stimulus(&perturbation)?;
        self.advance_n(mode, 1)?;
        self.rest(mode, self.cfg.warmup_rest)?;
        info!(tick = self.tick, "warm-up complete");
        Ok(vec![self.readout_features()])
    }

    /// Present each pattern for `active` ticks, read the readout features,
    /// then rest for `rest` ticks. One feature vector per pattern, in order.
    pub fn run<P: AsRef<[f64]>>(&mut self, patterns: &[P]) -> Result<Vec<Vec<f64>>> {
        self.run_in(ExecutionMode::Sequential, patterns)
    }

    pub fn run_parallel<P: AsRef<[f64]>>(&mut self, patterns: &[P]) -> Result<Vec<Vec<f64>>> {
        self.run_in(ExecutionMode::Parallel, patterns)
    }

    pub fn run_in<P: AsRef<[f64]>>(
        &mut self,
        mode: ExecutionMode,
        patterns: &[P],
    ) -> Result<Vec<Vec<f64>>> {
        let mode = resolve_mode(mode);
        self.check_patterns(patterns)?;
        let mut features = Vec::with_capacity(patterns.len());
        for (k, pattern) in patterns.iter().enumerate() {
            self.present(mode, pattern.as_ref())?;
            let f = self.readout_features();
            debug!(pattern = k, tick = self.tick, "collected features");
            features.push(f);
            self.rest(mode, self.cfg.rest)?;
        }
        Ok(features)
    }

    /// Same cycle as [`Network::run`], training the configured layer with
    /// the default Hebbian rule after every stimulus phase.
    pub fn train<P: AsRef<[f64]>>(&mut self, patterns: &[P]) -> Result<()> {
        let rule = Hebbian::new(self.cfg.hebbian);
        self.train_in(ExecutionMode::Sequential, patterns, &rule)
    }

    pub fn train_parallel<P: AsRef<[f64]>>(&mut self, patterns: &[P]) -> Result<()> {
        let rule = Hebbian::new(self.cfg.hebbian);
        self.train_in(ExecutionMode::Parallel, patterns, &rule)
    }

    /// [`Network::train`] with a caller-supplied update rule.
    pub fn train_with<P: AsRef<[f64]>>(
        &mut self,
        patterns: &[P],
        rule: &dyn TrainingRule,
    ) -> Result<()> {
        self.train_in(ExecutionMode::Sequential, patterns, rule)
    }

    pub fn train_in<P: AsRef<[f64]>>(
        &mut self,
        mode: ExecutionMode,
        patterns: &[P],
        rule: &dyn TrainingRule,
    ) -> Result<()> {
        let mode = resolve_mode(mode);
        self.check_patterns(patterns)?;
        let window = self.cfg.feature_window as usize;
        let trained = self.cfg.trained_layer;
        for (k, pattern) in patterns.iter().enumerate() {
            self.present(mode, pattern.as_ref())?;
            self.layers[trained].train(rule, window)?;
            if let Some((lo, hi)) = self.layers[trained].lateral().range() {
                debug!(pattern = k, layer = trained, lo, hi, "trained lateral weights");
            }
            self.rest(mode, self.cfg.rest)?;
        }
        Ok(())
    }

    /// Primary outputs of the readout layer at the latest committed tick.
    pub fn full_output(&self) -> Vec<f64> {
        self.layers[self.cfg.readout_layer]
            .sets()
            .iter()
            .map(|s| s.output())
            .collect()
    }

    /// Activation deviation of the readout layer over the feature window.
    pub fn readout_features(&self) -> Vec<f64> {
        self.layers[self.cfg.readout_layer].activation_deviation(self.cfg.feature_window as usize)
    }

    fn present(&mut self, mode: ExecutionMode, pattern: &[f64]) -> Result<()> {
        self.set_external_stimulus(pattern)?;
        self.advance_n(mode, self.cfg.active)
    }

    fn rest(&mut self, mode: ExecutionMode, ticks: u32) -> Result<()> {
        let zeros = vec![0.0; self.cfg.input_size];
        self.set_external_stimulus(&zeros)?;
        self.advance_n(mode, ticks)
    }

    // Reject a bad pattern before any tick of the batch runs.
    fn check_patterns<P: AsRef<[f64]>>(&self, patterns: &[P]) -> Result<()> {
        for (k, p) in patterns.iter().enumerate() {
            let p = p.as_ref();
            if p.len() != self.cfg.input_size {
                return Err(KsetError::StimulusLength {
                    expected: self.cfg.input_size,
                    got: p.len(),
                });
            }
            if let Some(i) = p.iter().position(|v| !v.is_finite()) {
                return Err(KsetError::NonFinite {
                    what: format!("pattern {k}, element {i}"),
                });
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut w = BufWriter::new(File::create(path)?);
        self.save_image_to(&mut w)?;
        w.flush()?;
        info!(path = %path.display(), tick = self.tick, "saved network image");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut r = BufReader::new(File::open(path)?);
        let net = Self::load_image_from(&mut r)?;
        info!(path = %path.display(), tick = net.tick, "loaded network image");
        Ok(net)
    }

    /// Serialize a versioned, chunked network image.
    ///
    /// The worker pool is not part of the image.
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(storage::MAGIC)?;
        storage::write_u32_le(w, storage::VERSION_CURRENT)?;

        let mut cfg = Vec::new();
        self.cfg.write_image_payload(&mut cfg)?;
        storage::write_chunk_lz4(w, *b"CFG0", &cfg)?;
        storage::write_chunk_lz4(w, *b"PRNG", &self.rng.state().to_le_bytes())?;
        storage::write_chunk_lz4(w, *b"STAT", &self.tick.to_le_bytes())?;
        for layer in &self.layers {
            let mut payload = Vec::new();
            layer.write_image_payload(&mut payload)?;
            storage::write_chunk_lz4(w, *b"LAYR", &payload)?;
        }
        Ok(())
    }

    /// Load a network image and rebuild the worker pool.
    ///
    /// Unknown chunks are skipped. Missing or inconsistent chunks, and a
    /// pool that cannot be built, fail the whole load.
    pub fn load_image_from<R: Read>(r: &mut R) -> Result<Self> {
        let magic = storage::read_exact::<8, _>(r)?;
        if &magic != storage::MAGIC {
            return Err(KsetError::Image("bad magic".to_string()));
        }
        let version = storage::read_u32_le(r)?;
        if version != storage::VERSION_CURRENT {
            return Err(KsetError::Image(format!("unsupported version {version}")));
        }

        let mut cfg: Option<KsetConfig> = None;
        let mut rng_state: Option<u64> = None;
        let mut tick: Option<Tick> = None;
        // LAYR payloads are parsed once CFG0 has fixed the expected sizes.
        let mut layer_payloads: Vec<Vec<u8>> = Vec::new();

        loop {
            let (tag, len) = match storage::read_chunk_header(r) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let payload = storage::read_chunk_lz4_payload(r, len)?;
            if &tag == b"LAYR" {
                layer_payloads.push(payload);
                continue;
            }
            let mut cursor = io::Cursor::new(payload);
            match &tag {
                b"CFG0" => cfg = Some(KsetConfig::read_image_payload(&mut cursor)?),
                b"PRNG" => rng_state = Some(storage::read_u64_le(&mut cursor)?),
                b"STAT" => tick = Some(storage::read_u64_le(&mut cursor)?),
                _ => {
                    // Unknown chunk: skipped.
                }
            }
        }

        let cfg = cfg.ok_or_else(|| KsetError::Image("missing CFG0".to_string()))?;
        cfg.validate()
            .map_err(|e| KsetError::Image(format!("CFG0: {e}")))?;
        let rng_state = rng_state.ok_or_else(|| KsetError::Image("missing PRNG".to_string()))?;
        let tick = tick.ok_or_else(|| KsetError::Image("missing STAT".to_string()))?;
        if layer_payloads.len() != LAYER_COUNT {
            return Err(KsetError::Image(format!(
                "expected {LAYER_COUNT} LAYR chunks, found {}",
                layer_payloads.len()
            )));
        }
        let history_len = history_len(&cfg);
        let layers = layer_payloads
            .iter()
            .map(|payload| {
                let mut cursor = io::Cursor::new(payload);
                Layer::read_image_payload(&mut cursor, cfg.input_size, history_len)
                    .map_err(|e| KsetError::Image(format!("LAYR: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        validate_layers(&cfg, &layers, tick)?;

        let runtime = Runtime::build(cfg.worker_threads)?;
        Ok(Self {
            cfg,
            layers,
            tick,
            rng: Prng::from_state(rng_state),
            runtime,
        })
    }

    /// Exact serialized size in bytes of the current image.
    pub fn image_size_bytes(&self) -> io::Result<usize> {
        let mut cw = storage::CountingWriter::new();
        self.save_image_to(&mut cw)?;
        Ok(cw.written())
    }

    pub fn save_image_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.save_image_to(&mut buf)?;
        Ok(buf)
    }

    pub fn load_image_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = io::Cursor::new(bytes);
        Self::load_image_from(&mut cursor)
    }
}

fn resolve_mode(mode: ExecutionMode) -> ExecutionMode {
    let effective = mode.effective();
    if effective != mode {
        warn!(requested = ?mode, "parallel stepping not compiled in, running sequentially");
    }
    effective
}

fn validate_layers(cfg: &KsetConfig, layers: &[Layer], tick: Tick) -> Result<()> {
    if layers.len() != LAYER_COUNT {
        return Err(KsetError::Image(format!(
            "expected {LAYER_COUNT} LAYR chunks, found {}",
            layers.len()
        )));
    }
    let history_len = history_len(cfg);
    for (i, layer) in layers.iter().enumerate() {
        if layer.index() != i || layer.size() != cfg.input_size {
            return Err(KsetError::Image(format!(
                "layer {i} does not match CFG0 (index {}, size {})",
                layer.index(),
                layer.size()
            )));
        }
        for set in layer.sets() {
            for role in Role::ALL {
                let unit = set.unit(role);
                let history = unit.history();
                if history.next_tick() != tick || history.capacity() != history_len {
                    return Err(KsetError::Image(format!(
                        "unit history in layer {i} is inconsistent with tick {tick}"
                    )));
                }
                for c in unit.inputs() {
                    if let SourceRef::Layer { layer, index, .. } = c.source {
                        if layer >= LAYER_COUNT || index >= cfg.input_size {
                            return Err(KsetError::Image(format!(
                                "connection in layer {i} reads missing set {layer}:{index}"
                            )));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
