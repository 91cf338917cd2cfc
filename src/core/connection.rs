use std::io::{self, Read, Write};

use crate::error::{ensure_finite, KsetError, Result};
use crate::layer::Layer;
use crate::pair::{PairSet, Role};
use crate::storage;
use crate::view::{InhibitoryView, LayerOutput};
use crate::Tick;

/// Anything whose committed output can be read back by absolute tick.
pub trait OutputSource {
    /// Output committed for `tick`.
    fn output_at(&self, tick: Tick) -> Result<f64>;

    /// Most recently committed output (0.0 before the first tick).
    fn output(&self) -> f64;

    /// Output `delay` ticks before `now`; ticks before the start of the
    /// simulation read as the resting output.
    fn delayed_output(&self, now: Tick, delay: u32) -> Result<f64> {
        match now.checked_sub(Tick::from(delay)) {
            Some(tick) => self.output_at(tick),
            None => Ok(0.0),
        }
    }
}

/// Which branch of a pair set (or layer of pair sets) a connection reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tap {
    Excitatory,
    Inhibitory,
}

/// Where a connection reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRef {
    /// Another unit of the same pair set.
    Local(Role),
    /// Set `index` of network layer `layer`.
    Layer { layer: usize, index: usize, tap: Tap },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub source: SourceRef,
    pub weight: f64,
    pub delay: u32,
}

impl Connection {
    pub fn new(source: SourceRef, weight: f64, delay: u32) -> Result<Self> {
        ensure_finite(weight, || format!("weight of connection from {source:?}"))?;
        Ok(Self {
            source,
            weight,
            delay,
        })
    }

    /// Ticks between the value read and the tick being computed.
    ///
    /// Never 0: the source's value for the current tick may not exist yet.
    #[inline]
    pub fn lag(&self) -> u32 {
        self.delay.max(1)
    }

    /// `weight * source(now - lag)`.
    pub(crate) fn read(&self, now: Tick, local: &PairSet, layers: &[Layer]) -> Result<f64> {
        let Some(at) = now.checked_sub(Tick::from(self.lag())) else {
            return Ok(0.0);
        };
        let value = match self.source {
            SourceRef::Local(role) => local.unit(role).output_at(at)?,
            SourceRef::Layer { layer, index, tap } => {
                let source = layers.get(layer).ok_or_else(|| {
                    KsetError::Config(format!("connection reads unknown layer {layer}"))
                })?;
                match tap {
                    Tap::Excitatory => source.unit_output_at(index, at)?,
                    Tap::Inhibitory => InhibitoryView::new(source).unit_output_at(index, at)?,
                }
            }
        };
        Ok(self.weight * value)
    }

    pub(crate) fn write_image_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self.source {
            SourceRef::Local(role) => {
                storage::write_u8(w, 0)?;
                storage::write_u8(w, role.index() as u8)?;
            }
            SourceRef::Layer { layer, index, tap } => {
                storage::write_u8(w, 1)?;
                storage::write_u32_le(w, layer as u32)?;
                storage::write_u32_le(w, index as u32)?;
                storage::write_u8(w, if tap == Tap::Inhibitory { 1 } else { 0 })?;
            }
        }
        storage::write_f64_le(w, self.weight)?;
        storage::write_u32_le(w, self.delay)
    }

    pub(crate) fn read_image_payload<R: Read>(r: &mut R) -> io::Result<Self> {
        let source = match storage::read_u8(r)? {
            0 => {
                let role = Role::from_index(storage::read_u8(r)? as usize).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "bad connection role")
                })?;
                SourceRef::Local(role)
            }
            1 => {
                let layer = storage::read_u32_le(r)? as usize;
                let index = storage::read_u32_le(r)? as usize;
                let tap = match storage::read_u8(r)? {
                    0 => Tap::Excitatory,
                    1 => Tap::Inhibitory,
                    _ => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "bad connection tap",
                        ))
                    }
                };
                SourceRef::Layer { layer, index, tap }
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "bad connection source kind",
                ))
            }
        };
        let weight = storage::read_f64_le(r)?;
        let delay = storage::read_u32_le(r)?;
        if !weight.is_finite() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "non-finite connection weight",
            ));
        }
        Ok(Self {
            source,
            weight,
            delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_delay_reads_previous_tick() {
        let c = Connection::new(SourceRef::Local(Role::ExcitatoryB), 1.0, 0).unwrap();
        assert_eq!(c.lag(), 1);
        let c = Connection::new(SourceRef::Local(Role::ExcitatoryB), 1.0, 17).unwrap();
        assert_eq!(c.lag(), 17);
    }

    #[test]
    fn non_finite_weight_is_rejected() {
        let err = Connection::new(SourceRef::Local(Role::InhibitoryA), f64::INFINITY, 1);
        assert!(matches!(err, Err(KsetError::NonFinite { .. })));
    }

    #[test]
    fn image_payload_roundtrip() {
        let c = Connection::new(
            SourceRef::Layer {
                layer: 2,
                index: 5,
                tap: Tap::Inhibitory,
            },
            -0.5,
            25,
        )
        .unwrap();
        let mut bytes = Vec::new();
        c.write_image_payload(&mut bytes).unwrap();
        let back = Connection::read_image_payload(&mut io::Cursor::new(bytes)).unwrap();
        assert_eq!(back, c);
    }
}
