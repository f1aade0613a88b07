use marten_core::{Handler, HostArray, Result, TensorView};
use serde::{Deserialize, Serialize};

// Value modifiers — in-place constraints on weights or gradients
//
// Installed on the network per (layer, buffer) through the same rule
// matching as initializers, and applied in order: weight modifiers after
// each update (or on demand), gradient modifiers automatically after every
// backward pass.

/// An in-place transformation of one parameter or gradient buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ValueModifier {
    /// Clamp every element into `[low, high]`.
    ClipValues { low: f64, high: f64 },
    /// Zero out (or scale) elements through a fixed mask of the buffer's
    /// shape. Applied through the host interop boundary.
    MaskValues { mask: HostArray },
}

impl ValueModifier {
    pub fn clip(low: f64, high: f64) -> Self {
        ValueModifier::ClipValues { low, high }
    }

    pub fn mask(mask: HostArray) -> Self {
        ValueModifier::MaskValues { mask }
    }

    pub fn apply<H: Handler>(&self, h: &H, mem: &mut H::Mem, view: &TensorView) -> Result<()> {
        match self {
            ValueModifier::ClipValues { low, high } => h.clip_t(mem, view, *low, *high, view),
            ValueModifier::MaskValues { mask } => {
                let mut arr = h.get_host_copy(mem, view)?;
                for (x, m) in arr.data_mut().iter_mut().zip(mask.data()) {
                    *x *= m;
                }
                h.set_from_host(mem, view, &arr)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::HostHandler;

    #[test]
    fn test_clip_applies_in_place() {
        let h = HostHandler::seeded(0);
        let mut mem = vec![-3.0, 0.5, 4.0];
        let v = TensorView::new(0, 3);
        ValueModifier::clip(-1.0, 1.0).apply(&h, &mut mem, &v).unwrap();
        assert_eq!(mem, vec![-1.0, 0.5, 1.0]);
    }

    #[test]
    fn test_mask_zeroes_elements() {
        let h = HostHandler::seeded(0);
        let mut mem = vec![2.0, 3.0, 4.0, 5.0];
        let v = TensorView::new(0, 4);
        let mask = HostArray::new(4, vec![1.0, 0.0, 1.0, 0.0]).unwrap();
        ValueModifier::mask(mask).apply(&h, &mut mem, &v).unwrap();
        assert_eq!(mem, vec![2.0, 0.0, 4.0, 0.0]);
    }

    #[test]
    fn test_serde_roundtrip() {
        let m = ValueModifier::clip(-0.1, 0.1);
        let json = serde_json::to_string(&m).unwrap();
        let back: ValueModifier = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }
}
