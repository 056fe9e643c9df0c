use crate::network::Dropout;
use derest_core::Result;
use derest_tensor::Interval;

/// Evaluation-mode dropout: a constant scale, identical forward and backward.
#[derive(Debug, Clone)]
pub struct DropoutTransform {
    keep: f32,
}

impl DropoutTransform {
    pub fn new(layer: &Dropout) -> Result<Self> {
        // re-validate: the fields are public
        let layer = Dropout::new(layer.p_dropout)?;
        Ok(Self { keep: layer.keep() })
    }

    pub fn apply(&self, interval: &Interval) -> Interval {
        interval.scale(self.keep)
    }
}
