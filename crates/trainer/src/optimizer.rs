//! Reference optimizer: SGD with momentum

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use params::ParameterSet;
use runtime_core::{Error, Result};

use crate::collaborators::Optimizer;

const STATE_VERSION: u32 = 1;

/// `v = momentum * v + g; p -= lr * v`, per owned element
#[derive(Debug, Clone)]
pub struct SgdMomentum {
    lr: f32,
    momentum: f32,
    velocity: Option<ParameterSet>,
    steps: u64,
}

#[derive(Serialize, Deserialize)]
struct SgdState {
    version: u32,
    steps: u64,
    velocity: Option<ParameterSet>,
}

impl SgdMomentum {
    pub fn new(lr: f32, momentum: f32) -> Result<Self> {
        if !(lr > 0.0 && lr.is_finite()) {
            return Err(Error::InvalidConfig {
                message: format!("learning rate must be positive, got {}", lr),
            });
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(Error::InvalidConfig {
                message: format!("momentum must be in [0, 1), got {}", momentum),
            });
        }
        Ok(Self {
            lr,
            momentum,
            velocity: None,
            steps: 0,
        })
    }

    /// Updates applied so far
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl Optimizer for SgdMomentum {
    fn attach(&mut self, params: &ParameterSet) -> Result<()> {
        match &self.velocity {
            Some(velocity) => {
                if velocity.rank() != params.rank() || velocity.descriptors() != params.descriptors()
                {
                    return Err(Error::shard_mismatch(
                        "<optimizer>",
                        "restored momentum does not match the live parameter shards",
                    ));
                }
            }
            None => {
                let mut velocity = params.clone();
                self.zero_grad(&mut velocity);
                self.velocity = Some(velocity);
            }
        }
        Ok(())
    }

    fn step(&mut self, params: &mut ParameterSet, grads: &ParameterSet) -> Result<()> {
        let velocity = self.velocity.as_mut().ok_or_else(|| Error::Internal {
            message: "optimizer stepped before attach".to_string(),
        })?;

        for (name, shard) in params.iter_mut() {
            let grad = grads
                .get(name)
                .ok_or_else(|| Error::shard_mismatch(name, "no gradient"))?;
            let v = velocity
                .get_mut(name)
                .ok_or_else(|| Error::shard_mismatch(name, "no momentum buffer"))?;
            if grad.tensor.numel() != shard.tensor.numel() {
                return Err(Error::shard_mismatch(
                    name,
                    format!(
                        "gradient holds {} elements, parameter {}",
                        grad.tensor.numel(),
                        shard.tensor.numel()
                    ),
                ));
            }

            let v = v.tensor.data_mut();
            for ((p, v), &g) in shard
                .tensor
                .data_mut()
                .iter_mut()
                .zip(v.iter_mut())
                .zip(grad.tensor.data())
            {
                *v = self.momentum * *v + g;
                *p -= self.lr * *v;
            }
        }

        self.steps += 1;
        Ok(())
    }

    fn state(&self) -> Result<Bytes> {
        let state = SgdState {
            version: STATE_VERSION,
            steps: self.steps,
            velocity: self.velocity.clone(),
        };
        Ok(Bytes::from(bincode::serialize(&state)?))
    }

    fn load_state(&mut self, state: &[u8]) -> Result<()> {
        let state: SgdState = bincode::deserialize(state)?;
        if state.version != STATE_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported optimizer state version {}",
                state.version
            )));
        }
        debug!(steps = state.steps, "Optimizer state restored");
        self.steps = state.steps;
        self.velocity = state.velocity;
        Ok(())
    }
}
