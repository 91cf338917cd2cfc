//! The KO unit: a damped second-order oscillator with Freeman's asymmetric
//! sigmoid output.
//!
//! ```text
//! x'' + (a + b) x' + a b x = a b u(t)
//! output = Q(x)
//! ```
//!
//! `u` is the external stimulus plus the weighted, delayed outputs of the
//! unit's incoming connections. It is sampled once per tick and held constant
//! across the RK4 step.

use std::io::{self, Read, Write};

use crate::config::OdeParams;
use crate::connection::{Connection, OutputSource};
use crate::error::{ensure_finite, KsetError, Result};
use crate::storage;
use crate::Tick;

/// Freeman's asymmetric sigmoid.
///
/// Saturates at `q_m` for large `x` and clamps to -1 below the threshold
/// `x0 = ln(1 - q_m ln(1 + 1/q_m))`, where the curve reaches -1.
#[inline]
pub fn sigmoid(x: f64, q_m: f64) -> f64 {
    if x > sigmoid_threshold(q_m) {
        q_m * (1.0 - (-(x.exp() - 1.0) / q_m).exp())
    } else {
        -1.0
    }
}

#[inline]
fn sigmoid_threshold(q_m: f64) -> f64 {
    (1.0 - q_m * (1.0 + 1.0 / q_m).ln()).ln()
}

/// Fixed-size ring of committed outputs, indexed by absolute tick.
#[derive(Debug, Clone, PartialEq)]
pub struct History {
    values: Vec<f64>,
    // Next tick to be committed (= number of committed ticks).
    next: Tick,
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: vec![0.0; capacity.max(1)],
            next: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Next tick this ring expects to commit.
    pub fn next_tick(&self) -> Tick {
        self.next
    }

    pub fn latest_tick(&self) -> Option<Tick> {
        self.next.checked_sub(1)
    }

    /// Oldest tick still retained.
    pub fn oldest_tick(&self) -> Tick {
        self.next.saturating_sub(self.capacity() as Tick)
    }

    #[inline]
    fn slot(&self, tick: Tick) -> usize {
        (tick % self.capacity() as Tick) as usize
    }

    fn push(&mut self, tick: Tick, value: f64) -> Result<()> {
        if tick != self.next {
            return Err(KsetError::TickOutOfOrder {
                expected: self.next,
                got: tick,
            });
        }
        let slot = self.slot(tick);
        self.values[slot] = value;
        self.next += 1;
        Ok(())
    }

    pub fn get(&self, tick: Tick) -> Result<f64> {
        if tick >= self.next {
            return Err(KsetError::NotYetComputed {
                tick,
                latest: self.latest_tick(),
            });
        }
        if tick < self.oldest_tick() {
            return Err(KsetError::HistoryExhausted {
                tick,
                oldest: self.oldest_tick(),
            });
        }
        Ok(self.values[self.slot(tick)])
    }

    /// The last `window` committed values, oldest first.
    ///
    /// Shorter when fewer ticks have been committed or retained.
    pub fn trailing(&self, window: usize) -> Vec<f64> {
        let retained = (self.next - self.oldest_tick()) as usize;
        let n = window.min(retained);
        (self.next - n as Tick..self.next)
            .map(|t| self.values[self.slot(t)])
            .collect()
    }

    fn write_image_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_u64_le(w, self.next)?;
        storage::write_u32_le(w, self.values.len() as u32)?;
        for &v in &self.values {
            storage::write_f64_le(w, v)?;
        }
        Ok(())
    }

    /// Read a ring that must hold exactly `capacity` ticks.
    fn read_image_payload<R: Read>(r: &mut R, capacity: usize) -> io::Result<Self> {
        let next = storage::read_u64_le(r)?;
        let stored = storage::read_u32_le(r)? as usize;
        if stored == 0 || stored != capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("history ring holds {stored} ticks, expected {capacity}"),
            ));
        }
        let mut values = Vec::new();
        for _ in 0..stored {
            values.push(storage::read_f64_le(r)?);
        }
        Ok(Self { values, next })
    }
}

/// A single KO oscillator.
#[derive(Debug, Clone, PartialEq)]
pub struct Oscillator {
    // ODE state: position and velocity.
    x: f64,
    v: f64,

    stimulus: f64,
    inputs: Vec<Connection>,
    history: History,
}

impl Oscillator {
    /// A unit at rest, retaining `history_len` ticks of output.
    pub fn new(history_len: usize) -> Self {
        Self {
            x: 0.0,
            v: 0.0,
            stimulus: 0.0,
            inputs: Vec::new(),
            history: History::with_capacity(history_len),
        }
    }

    pub fn connect(&mut self, connection: Connection) {
        self.inputs.push(connection);
    }

    pub fn inputs(&self) -> &[Connection] {
        &self.inputs
    }

    pub fn set_external_stimulus(&mut self, stimulus: f64) -> Result<()> {
        ensure_finite(stimulus, || "external stimulus".to_string())?;
        self.stimulus = stimulus;
        Ok(())
    }

    pub fn external_stimulus(&self) -> f64 {
        self.stimulus
    }

    /// `(x, x')`.
    pub fn state(&self) -> (f64, f64) {
        (self.x, self.v)
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Integrate one tick with `drive` (the summed connection input, without
    /// the external stimulus) and commit `Q(x)` as the output of tick `now`.
    ///
    /// A non-finite state is reported as `NumericInstability` at layer 0,
    /// set 0; owners relabel the location. The state is left untouched on
    /// error.
    pub fn advance(&mut self, now: Tick, drive: f64, ode: &OdeParams) -> Result<f64> {
        if now != self.history.next_tick() {
            return Err(KsetError::TickOutOfOrder {
                expected: self.history.next_tick(),
                got: now,
            });
        }

        let u = self.stimulus + drive;
        let (x, v) = rk4_step(self.x, self.v, u, ode);
        if !x.is_finite() || !v.is_finite() {
            return Err(KsetError::NumericInstability {
                layer: 0,
                index: 0,
                tick: now,
            });
        }

        self.x = x;
        self.v = v;
        let out = sigmoid(x, ode.q_m);
        self.history.push(now, out)?;
        Ok(out)
    }

    pub(crate) fn write_image_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_f64_le(w, self.x)?;
        storage::write_f64_le(w, self.v)?;
        storage::write_f64_le(w, self.stimulus)?;
        self.history.write_image_payload(w)?;
        storage::write_u32_le(w, self.inputs.len() as u32)?;
        for c in &self.inputs {
            c.write_image_payload(w)?;
        }
        Ok(())
    }

    /// Read a unit whose history ring holds `history_len` ticks.
    ///
    /// The input count is not trusted: connections are pushed one at a time
    /// and a short payload fails with `UnexpectedEof`.
    pub(crate) fn read_image_payload<R: Read>(r: &mut R, history_len: usize) -> io::Result<Self> {
        let x = storage::read_f64_le(r)?;
        let v = storage::read_f64_le(r)?;
        let stimulus = storage::read_f64_le(r)?;
        if !(x.is_finite() && v.is_finite() && stimulus.is_finite()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "non-finite unit state",
            ));
        }
        let history = History::read_image_payload(r, history_len)?;
        let n = storage::read_u32_le(r)? as usize;
        let mut inputs = Vec::new();
        for _ in 0..n {
            inputs.push(Connection::read_image_payload(r)?);
        }
        Ok(Self {
            x,
            v,
            stimulus,
            inputs,
            history,
        })
    }
}

impl OutputSource for Oscillator {
    fn output_at(&self, tick: Tick) -> Result<f64> {
        self.history.get(tick)
    }

    fn output(&self) -> f64 {
        self.history
            .latest_tick()
            .and_then(|t| self.history.get(t).ok())
            .unwrap_or(0.0)
    }
}

#[inline]
fn derivative(x: f64, v: f64, u: f64, ode: &OdeParams) -> (f64, f64) {
    (v, ode.a * ode.b * (u - x) - (ode.a + ode.b) * v)
}

// Classic fourth-order Runge-Kutta with the drive held constant.
#[inline]
fn rk4_step(x: f64, v: f64, u: f64, ode: &OdeParams) -> (f64, f64) {
    let h = ode.h;
    let (k1x, k1v) = derivative(x, v, u, ode);
    let (k2x, k2v) = derivative(x + 0.5 * h * k1x, v + 0.5 * h * k1v, u, ode);
    let (k3x, k3v) = derivative(x + 0.5 * h * k2x, v + 0.5 * h * k2v, u, ode);
    let (k4x, k4v) = derivative(x + h * k3x, v + h * k3v, u, ode);
    (
        x + h / 6.0 * (k1x + 2.0 * k2x + 2.0 * k3x + k4x),
        v + h / 6.0 * (k1v + 2.0 * k2v + 2.0 * k3v + k4v),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_is_zero_at_rest_and_bounded() {
        let q_m = 5.0;
        assert_eq!(sigmoid(0.0, q_m), 0.0);
        assert_eq!(sigmoid(-10.0, q_m), -1.0);
        assert!((sigmoid(50.0, q_m) - q_m).abs() < 1e-9);
        // Continuous at the threshold.
        let x0 = sigmoid_threshold(q_m);
        assert!((sigmoid(x0 + 1e-9, q_m) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn unit_at_rest_stays_at_rest() {
        let ode = OdeParams::default();
        let mut unit = Oscillator::new(8);
        for t in 0..100 {
            assert_eq!(unit.advance(t, 0.0, &ode).unwrap(), 0.0);
        }
        assert_eq!(unit.state(), (0.0, 0.0));
    }

    #[test]
    fn constant_drive_settles_at_drive() {
        let ode = OdeParams::default();
        let mut unit = Oscillator::new(8);
        for t in 0..400 {
            unit.advance(t, 1.0, &ode).unwrap();
        }
        let (x, v) = unit.state();
        assert!((x - 1.0).abs() < 1e-6, "x = {x}");
        assert!(v.abs() < 1e-6);
        assert!((unit.output() - sigmoid(1.0, ode.q_m)).abs() < 1e-6);
    }

    #[test]
    fn stimulus_adds_to_drive() {
        let ode = OdeParams::default();
        let mut a = Oscillator::new(4);
        let mut b = Oscillator::new(4);
        a.set_external_stimulus(0.25).unwrap();
        for t in 0..20 {
            let ya = a.advance(t, 0.25, &ode).unwrap();
            let yb = b.advance(t, 0.5, &ode).unwrap();
            assert_eq!(ya.to_bits(), yb.to_bits());
        }
    }

    #[test]
    fn history_reads_are_stable_until_evicted() {
        let ode = OdeParams::default();
        let mut unit = Oscillator::new(5);
        let mut seen = Vec::new();
        for t in 0..5 {
            seen.push(unit.advance(t, 2.0, &ode).unwrap());
        }
        for (t, &v) in seen.iter().enumerate() {
            assert_eq!(unit.output_at(t as Tick).unwrap(), v);
        }
        unit.advance(5, 2.0, &ode).unwrap();
        assert_eq!(unit.output_at(4).unwrap(), seen[4]);
        assert!(matches!(
            unit.output_at(0),
            Err(KsetError::HistoryExhausted { tick: 0, oldest: 1 })
        ));
    }

    #[test]
    fn future_tick_is_not_readable() {
        let ode = OdeParams::default();
        let mut unit = Oscillator::new(4);
        assert!(matches!(
            unit.output_at(0),
            Err(KsetError::NotYetComputed { tick: 0, latest: None })
        ));
        unit.advance(0, 1.0, &ode).unwrap();
        assert!(unit.output_at(0).is_ok());
        assert!(matches!(
            unit.output_at(1),
            Err(KsetError::NotYetComputed { latest: Some(0), .. })
        ));
    }

    #[test]
    fn delayed_output_before_start_is_rest() {
        let ode = OdeParams::default();
        let mut unit = Oscillator::new(4);
        unit.advance(0, 3.0, &ode).unwrap();
        assert_eq!(unit.delayed_output(0, 3).unwrap(), 0.0);
        assert_eq!(unit.delayed_output(1, 1).unwrap(), unit.output());
    }

    #[test]
    fn skipping_a_tick_is_rejected() {
        let ode = OdeParams::default();
        let mut unit = Oscillator::new(4);
        unit.advance(0, 0.0, &ode).unwrap();
        assert!(matches!(
            unit.advance(2, 0.0, &ode),
            Err(KsetError::TickOutOfOrder { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn infinite_drive_is_reported_as_instability() {
        let ode = OdeParams::default();
        let mut unit = Oscillator::new(4);
        assert!(matches!(
            unit.advance(0, f64::INFINITY, &ode),
            Err(KsetError::NumericInstability { tick: 0, .. })
        ));
        assert_eq!(unit.history().next_tick(), 0);
    }

    #[test]
    fn trailing_window_is_oldest_first() {
        let ode = OdeParams::default();
        let mut unit = Oscillator::new(3);
        let mut seen = Vec::new();
        for t in 0..6 {
            seen.push(unit.advance(t, 1.5, &ode).unwrap());
        }
        assert_eq!(unit.history().trailing(10), seen[3..].to_vec());
        assert_eq!(unit.history().trailing(2), seen[4..].to_vec());
    }

    #[test]
    fn loaded_unit_must_match_ring_length() {
        let ode = OdeParams::default();
        let mut unit = Oscillator::new(8);
        for t in 0..5 {
            unit.advance(t, 0.5, &ode).unwrap();
        }
        let mut bytes = Vec::new();
        unit.write_image_payload(&mut bytes).unwrap();

        let back = Oscillator::read_image_payload(&mut io::Cursor::new(&bytes), 8).unwrap();
        assert_eq!(back, unit);
        let err = Oscillator::read_image_payload(&mut io::Cursor::new(&bytes), 30).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
