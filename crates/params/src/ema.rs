//! Shadow parameter tracking

use tracing::debug;

use runtime_core::{EmaConfig, Error, Result, Step};

use crate::set::ParameterSet;

/// Maintains the shadow set as a decayed running average of live
///
/// Pure elementwise transform on this rank's own slices; shadow and live
/// share one layout so no communication is needed.
#[derive(Debug, Clone)]
pub struct EmaTracker {
    decay: f32,
    warmup_steps: Step,
}

impl EmaTracker {
    pub fn new(config: &EmaConfig) -> Result<Self> {
        check_decay(config.decay)?;
        Ok(Self {
            decay: config.decay,
            warmup_steps: config.warmup_steps,
        })
    }

    pub fn decay(&self) -> f32 {
        self.decay
    }

    /// Decay to use after `global_step` steps have completed
    ///
    /// During warm-up the shadow follows live exactly.
    pub fn decay_for_step(&self, global_step: Step) -> f32 {
        if global_step < self.warmup_steps {
            0.0
        } else {
            self.decay
        }
    }

    /// Warm start: a deep copy of live
    pub fn init_shadow(&self, live: &ParameterSet) -> ParameterSet {
        live.clone()
    }

    /// `shadow = decay * shadow + (1 - decay) * live` on every owned element
    ///
    /// Shadow is left untouched if any parameter disagrees. With
    /// `decay == 0` shadow becomes bit-identical to live.
    pub fn update(&self, shadow: &mut ParameterSet, live: &ParameterSet, decay: f32) -> Result<()> {
        check_decay(decay)?;
        check_same_layout(shadow, live)?;

        for (name, shard) in shadow.iter_mut() {
            let source = match live.get(name) {
                Some(source) => source.tensor.data(),
                None => continue,
            };
            let target = shard.tensor.data_mut();

            if decay == 0.0 {
                target.copy_from_slice(source);
                continue;
            }

            let keep = 1.0 - decay;
            for (s, &l) in target.iter_mut().zip(source) {
                *s = decay * *s + keep * l;
            }
        }

        debug!(decay = decay, params = shadow.len(), "Shadow updated");
        Ok(())
    }
}

fn check_decay(decay: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&decay) {
        return Err(Error::InvalidConfig {
            message: format!("EMA decay {} is outside [0, 1]", decay),
        });
    }
    Ok(())
}

fn check_same_layout(shadow: &ParameterSet, live: &ParameterSet) -> Result<()> {
    if shadow.rank() != live.rank() {
        return Err(Error::shard_mismatch(
            "<set>",
            format!(
                "shadow belongs to rank {}, live to rank {}",
                shadow.rank(),
                live.rank()
            ),
        ));
    }
    for (name, shard) in shadow.iter() {
        let source = live
            .get(name)
            .ok_or_else(|| Error::shard_mismatch(name, "present in shadow but not live"))?;
        if source.descriptor != shard.descriptor {
            return Err(Error::shard_mismatch(
                name,
                format!(
                    "shadow offset {} shape {:?}, live offset {} shape {:?}",
                    shard.descriptor.offset,
                    shard.descriptor.local_shape,
                    source.descriptor.offset,
                    source.descriptor.local_shape
                ),
            ));
        }
    }
    if let Some((name, _)) = live.iter().find(|(name, _)| shadow.get(name).is_none()) {
        return Err(Error::shard_mismatch(name, "present in live but not shadow"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ShardLayout, Tensor};
    use std::collections::BTreeMap;

    fn set_of(values: &[f32]) -> ParameterSet {
        let layout = ShardLayout::even(1, [("w", vec![values.len()])]).unwrap();
        let mut full = BTreeMap::new();
        full.insert("w".to_string(), Tensor::from_vec(values.to_vec()));
        ParameterSet::from_full(&layout, 0, &full).unwrap()
    }

    fn tracker(decay: f32, warmup_steps: u64) -> EmaTracker {
        EmaTracker::new(&EmaConfig {
            decay,
            warmup_steps,
        })
        .unwrap()
    }

    #[test]
    fn test_zero_decay_copies_live_exactly() {
        let ema = tracker(0.9, 0);
        let mut shadow = set_of(&[f32::NAN, 5.0, f32::INFINITY]);
        let live = set_of(&[0.1, -0.0, 1e-30]);

        ema.update(&mut shadow, &live, 0.0).unwrap();
        assert!(shadow.bit_eq(&live));
    }

    #[test]
    fn test_closed_form_after_k_steps() {
        let d = 0.9f32;
        let ema = tracker(d, 0);
        let shadow0 = [1.0f32, -2.0];
        let mut shadow = set_of(&shadow0);

        let lives: Vec<[f32; 2]> = (0..6)
            .map(|i| [i as f32 * 0.5, 3.0 - i as f32])
            .collect();
        for live in &lives {
            ema.update(&mut shadow, &set_of(live), d).unwrap();
        }

        // shadow_k = d^k * shadow_0 + (1-d) * sum_{i<k} d^i * live_{k-1-i}
        let k = lives.len();
        let got = shadow.get("w").unwrap().tensor.data();
        for j in 0..2 {
            let dd = d as f64;
            let mut expected = dd.powi(k as i32) * shadow0[j] as f64;
            for i in 0..k {
                expected += (1.0 - dd) * dd.powi(i as i32) * lives[k - 1 - i][j] as f64;
            }
            assert!(
                (got[j] as f64 - expected).abs() < 1e-5,
                "element {}: {} vs {}",
                j,
                got[j],
                expected
            );
        }
    }

    #[test]
    fn test_decay_one_freezes_shadow() {
        let ema = tracker(1.0, 0);
        let mut shadow = set_of(&[4.0, 2.0]);
        ema.update(&mut shadow, &set_of(&[0.0, 0.0]), 1.0).unwrap();
        assert_eq!(shadow.get("w").unwrap().tensor.data(), &[4.0, 2.0]);
    }

    #[test]
    fn test_invalid_decay_rejected() {
        let ema = tracker(0.5, 0);
        let mut shadow = set_of(&[1.0]);
        let live = set_of(&[2.0]);
        assert!(matches!(
            ema.update(&mut shadow, &live, 1.5),
            Err(Error::InvalidConfig { .. })
        ));
        assert!(matches!(
            ema.update(&mut shadow, &live, f32::NAN),
            Err(Error::InvalidConfig { .. })
        ));
        assert_eq!(shadow.get("w").unwrap().tensor.data(), &[1.0]);
    }

    #[test]
    fn test_layout_mismatch_leaves_shadow_untouched() {
        let ema = tracker(0.5, 0);
        let mut shadow = set_of(&[1.0, 1.0]);
        let live = set_of(&[2.0, 2.0, 2.0]);

        let result = ema.update(&mut shadow, &live, 0.5);
        assert!(matches!(result, Err(Error::ShardMismatch { .. })));
        assert_eq!(shadow.get("w").unwrap().tensor.data(), &[1.0, 1.0]);
    }

    #[test]
    fn test_warmup_schedule() {
        let ema = tracker(0.99, 3);
        assert_eq!(ema.decay_for_step(0), 0.0);
        assert_eq!(ema.decay_for_step(2), 0.0);
        assert_eq!(ema.decay_for_step(3), 0.99);
    }

    #[test]
    fn test_init_shadow_is_independent_copy() {
        let ema = tracker(0.5, 0);
        let live = set_of(&[1.0, 2.0]);
        let mut shadow = ema.init_shadow(&live);
        assert!(shadow.bit_eq(&live));

        ema.update(&mut shadow, &set_of(&[3.0, 4.0]), 0.5).unwrap();
        assert_eq!(live.get("w").unwrap().tensor.data(), &[1.0, 2.0]);
        assert_eq!(shadow.get("w").unwrap().tensor.data(), &[2.0, 3.0]);
    }
}
