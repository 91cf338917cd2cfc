use std::io::{self, Read, Write};

use crate::config::{OdeParams, PairWeights};
use crate::connection::{Connection, OutputSource, SourceRef};
use crate::error::Result;
use crate::layer::Layer;
use crate::oscillator::Oscillator;
use crate::prng::Prng;
use crate::storage;
use crate::Tick;

/// Position of a unit inside a KII set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ExcitatoryA,
    ExcitatoryB,
    InhibitoryA,
    InhibitoryB,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::ExcitatoryA,
        Role::ExcitatoryB,
        Role::InhibitoryA,
        Role::InhibitoryB,
    ];

    /// The unit reported by `output`.
    pub const PRIMARY: Role = Role::ExcitatoryA;
    /// The unit reported by `inhibitory_output`.
    pub const SECONDARY: Role = Role::InhibitoryB;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<Role> {
        Role::ALL.get(i).copied()
    }

    pub fn is_excitatory(self) -> bool {
        matches!(self, Role::ExcitatoryA | Role::ExcitatoryB)
    }
}

/// A KII set: two excitatory and two inhibitory KO units.
///
/// Wiring (all lag 1):
/// - `ExcitatoryA <-> ExcitatoryB` with `w_ee`
/// - each excitatory unit -> each inhibitory unit with `w_ie`
/// - each inhibitory unit -> each excitatory unit with `w_ei`
/// - `InhibitoryA <-> InhibitoryB` with `w_ii`
#[derive(Debug, Clone, PartialEq)]
pub struct PairSet {
    weights: PairWeights,
    units: [Oscillator; 4],
}

impl PairSet {
    pub fn new(weights: PairWeights, history_len: usize) -> Result<Self> {
        weights.validate()?;

        let mut units = [
            Oscillator::new(history_len),
            Oscillator::new(history_len),
            Oscillator::new(history_len),
            Oscillator::new(history_len),
        ];

        for target in Role::ALL {
            for source in Role::ALL {
                if source == target {
                    continue;
                }
                let weight = match (source.is_excitatory(), target.is_excitatory()) {
                    (true, true) => weights.w_ee,
                    (true, false) => weights.w_ie,
                    (false, true) => weights.w_ei,
                    (false, false) => weights.w_ii,
                };
                units[target.index()]
                    .connect(Connection::new(SourceRef::Local(source), weight, 1)?);
            }
        }

        Ok(Self { weights, units })
    }

    /// A set with weights drawn from `rng`: excitatory couplings in [0, 1),
    /// inhibitory couplings in (-1, 0].
    pub fn random(rng: &mut Prng, history_len: usize) -> Result<Self> {
        let weights = PairWeights::new(
            rng.next_f64_01(),
            -rng.next_f64_01(),
            rng.next_f64_01(),
            -rng.next_f64_01(),
        );
        Self::new(weights, history_len)
    }

    pub fn weights(&self) -> PairWeights {
        self.weights
    }

    pub fn unit(&self, role: Role) -> &Oscillator {
        &self.units[role.index()]
    }

    pub fn inhibitory_output(&self) -> f64 {
        self.unit(Role::SECONDARY).output()
    }

    pub fn inhibitory_output_at(&self, tick: Tick) -> Result<f64> {
        self.unit(Role::SECONDARY).output_at(tick)
    }

    /// Excitatory stimulus, applied to the primary unit.
    pub fn set_external_stimulus(&mut self, stimulus: f64) -> Result<()> {
        self.units[Role::PRIMARY.index()].set_external_stimulus(stimulus)
    }

    /// Inhibitory stimulus, applied to the secondary unit.
    pub fn set_inhibitory_stimulus(&mut self, stimulus: f64) -> Result<()> {
        self.units[Role::SECONDARY.index()].set_external_stimulus(stimulus)
    }

    /// Attach an incoming connection to the primary unit.
    pub fn connect(&mut self, source: SourceRef, weight: f64, delay: u32) -> Result<()> {
        let c = Connection::new(source, weight, delay)?;
        self.units[Role::PRIMARY.index()].connect(c);
        Ok(())
    }

    /// Attach an incoming connection to the secondary (inhibitory) unit.
    pub fn connect_inhibitory(&mut self, source: SourceRef, weight: f64, delay: u32) -> Result<()> {
        let c = Connection::new(source, weight, delay)?;
        self.units[Role::SECONDARY.index()].connect(c);
        Ok(())
    }

    /// Connection input of every unit for tick `now`, read from history only.
    pub fn gather(&self, now: Tick, layers: &[Layer]) -> Result<[f64; 4]> {
        let mut drives = [0.0; 4];
        for (drive, unit) in drives.iter_mut().zip(&self.units) {
            for c in unit.inputs() {
                *drive += c.read(now, self, layers)?;
            }
        }
        Ok(drives)
    }

    /// Advance all four units for tick `now` with precomputed drives.
    pub fn commit(&mut self, now: Tick, drives: &[f64; 4], ode: &OdeParams) -> Result<()> {
        for (unit, &drive) in self.units.iter_mut().zip(drives) {
            unit.advance(now, drive, ode)?;
        }
        Ok(())
    }

    /// Advance a free-standing set (no inter-layer connections) by one tick.
    pub fn advance(&mut self, now: Tick, ode: &OdeParams) -> Result<()> {
        let drives = self.gather(now, &[])?;
        self.commit(now, &drives, ode)
    }

    pub(crate) fn write_image_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for wt in self.weights.as_array() {
            storage::write_f64_le(w, wt)?;
        }
        for unit in &self.units {
            unit.write_image_payload(w)?;
        }
        Ok(())
    }

    pub(crate) fn read_image_payload<R: Read>(r: &mut R, history_len: usize) -> io::Result<Self> {
        let weights = PairWeights::new(
            storage::read_f64_le(r)?,
            storage::read_f64_le(r)?,
            storage::read_f64_le(r)?,
            storage::read_f64_le(r)?,
        );
        weights
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let units = [
            Oscillator::read_image_payload(r, history_len)?,
            Oscillator::read_image_payload(r, history_len)?,
            Oscillator::read_image_payload(r, history_len)?,
            Oscillator::read_image_payload(r, history_len)?,
        ];
        Ok(Self { weights, units })
    }
}

impl OutputSource for PairSet {
    fn output_at(&self, tick: Tick) -> Result<f64> {
        self.unit(Role::PRIMARY).output_at(tick)
    }

    fn output(&self) -> f64 {
        self.unit(Role::PRIMARY).output()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KsetError;

    fn ode() -> OdeParams {
        OdeParams::default()
    }

    #[test]
    fn wiring_matches_roles() {
        let set = PairSet::new(PairWeights::new(1.0, -2.0, 3.0, -4.0), 4).unwrap();
        for target in Role::ALL {
            let inputs = set.unit(target).inputs();
            assert_eq!(inputs.len(), 3);
            for c in inputs {
                let SourceRef::Local(source) = c.source else {
                    panic!("intra-set connection must be local");
                };
                assert_ne!(source, target);
                assert_eq!(c.lag(), 1);
                let expected = match (source.is_excitatory(), target.is_excitatory()) {
                    (true, true) => 1.0,
                    (false, true) => -2.0,
                    (true, false) => 3.0,
                    (false, false) => -4.0,
                };
                assert_eq!(c.weight, expected);
            }
        }
    }

    #[test]
    fn unperturbed_set_stays_at_zero() {
        let mut set = PairSet::new(PairWeights::new(0.5, 0.5, 0.5, 0.5), 8).unwrap();
        for t in 0..50 {
            set.advance(t, &ode()).unwrap();
            for role in Role::ALL {
                assert_eq!(set.unit(role).output(), 0.0);
            }
        }
    }

    #[test]
    fn kicked_set_stays_finite_and_bounded() {
        let mut set = PairSet::new(PairWeights::new(0.5, 0.5, 0.5, 0.5), 8).unwrap();
        set.set_external_stimulus(1.0).unwrap();
        set.advance(0, &ode()).unwrap();
        set.set_external_stimulus(0.0).unwrap();
        for t in 1..2000 {
            set.advance(t, &ode()).unwrap();
            for role in Role::ALL {
                let y = set.unit(role).output();
                assert!(y.is_finite());
                assert!((-1.0..=5.0).contains(&y));
            }
        }
    }

    #[test]
    fn primary_and_secondary_outputs() {
        let mut set = PairSet::new(PairWeights::new(1.0, -1.0, 1.0, -1.0), 8).unwrap();
        set.set_external_stimulus(2.0).unwrap();
        set.set_inhibitory_stimulus(-0.5).unwrap();
        for t in 0..10 {
            set.advance(t, &ode()).unwrap();
        }
        assert_eq!(set.output(), set.unit(Role::ExcitatoryA).output());
        assert_eq!(set.inhibitory_output(), set.unit(Role::InhibitoryB).output());
        assert_eq!(set.output_at(9).unwrap(), set.output());
        assert_eq!(set.inhibitory_output_at(9).unwrap(), set.inhibitory_output());
        assert!(set.output() > 0.0);
    }

    #[test]
    fn external_connections_attach_to_ports() {
        let mut set = PairSet::new(PairWeights::new(0.1, -0.1, 0.1, -0.1), 8).unwrap();
        let src = SourceRef::Layer {
            layer: 1,
            index: 0,
            tap: crate::connection::Tap::Excitatory,
        };
        set.connect(src, 0.5, 17).unwrap();
        set.connect_inhibitory(src, 0.6, 25).unwrap();
        assert_eq!(set.unit(Role::ExcitatoryA).inputs().len(), 4);
        assert_eq!(set.unit(Role::InhibitoryB).inputs().len(), 4);
        assert_eq!(set.unit(Role::ExcitatoryB).inputs().len(), 3);
        // No layers to resolve against once the delay has elapsed.
        for t in 0..17 {
            set.advance(t, &ode()).unwrap();
        }
        assert!(matches!(set.advance(17, &ode()), Err(KsetError::Config(_))));
    }

    #[test]
    fn non_finite_weights_fail_construction() {
        let err = PairSet::new(PairWeights::new(f64::NAN, 0.0, 0.0, 0.0), 4);
        assert!(matches!(err, Err(KsetError::NonFinite { .. })));
    }

    #[test]
    fn random_sets_are_reproducible() {
        let a = PairSet::random(&mut Prng::new(11), 4).unwrap();
        let b = PairSet::random(&mut Prng::new(11), 4).unwrap();
        assert_eq!(a.weights(), b.weights());
        let w = a.weights();
        assert!(w.w_ee >= 0.0 && w.w_ie >= 0.0);
        assert!(w.w_ei <= 0.0 && w.w_ii <= 0.0);
    }
}
