use crate::error::{Error, Result};
use crate::shape::Shape;

// TensorView — a typed window into shapeless arena storage
//
// Handler storage carries no shape of its own; a TensorView pairs an element
// offset with a concrete Shape to describe one contiguous row-major region.
// Views are plain data: cheap to clone, valid only for the duration of one
// pass, and never own the memory they describe.
//
// Time-recurrent buffers reserve one extra trailing time row (the context
// slot). `step(-1)` wraps onto that row, so "state at t-1" is addressable at
// t=0 without special-casing, and `step(T)` reaches the same row from the
// other direction during backward passes.

/// An offset + shape window describing a contiguous region of handler storage.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorView {
    offset: usize,
    shape: Shape,
}

impl TensorView {
    pub fn new(offset: usize, shape: impl Into<Shape>) -> Self {
        TensorView {
            offset,
            shape: shape.into(),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Number of elements covered by this view.
    pub fn len(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One-past-the-end element offset.
    pub fn end(&self) -> usize {
        self.offset + self.len()
    }

    /// The element range covered by this view.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.end()
    }

    /// Select a single step along axis 0, dropping that axis.
    ///
    /// Negative indices wrap from the end: `step(-1)` addresses the last
    /// row, which for context-carrying buffers is the reserved context slot.
    pub fn step(&self, t: isize) -> Result<TensorView> {
        let rows = self.shape.dim(0)? as isize;
        let idx = if t < 0 { rows + t } else { t };
        if idx < 0 || idx >= rows {
            return Err(Error::msg(format!(
                "step {} out of range for view with {} rows",
                t, rows
            )));
        }
        let rest: Vec<usize> = self.dims()[1..].to_vec();
        let row_len = rest.iter().product::<usize>();
        Ok(TensorView::new(
            self.offset + idx as usize * row_len,
            Shape::new(rest),
        ))
    }

    /// Select the half-open step range `lo..hi` along axis 0.
    pub fn steps(&self, lo: usize, hi: usize) -> Result<TensorView> {
        let rows = self.shape.dim(0)?;
        if lo > hi || hi > rows {
            return Err(Error::msg(format!(
                "step range {}..{} out of range for view with {} rows",
                lo, hi, rows
            )));
        }
        let rest: Vec<usize> = self.dims()[1..].to_vec();
        let row_len = rest.iter().product::<usize>();
        let mut dims = vec![hi - lo];
        dims.extend_from_slice(&rest);
        Ok(TensorView::new(
            self.offset + lo * row_len,
            Shape::new(dims),
        ))
    }

    /// Merge the leading time and batch axes: `[T, B, F...]` → `[T*B, F...]`.
    ///
    /// Contiguity makes this a pure reinterpretation; no data moves.
    pub fn flatten_time(&self) -> Result<TensorView> {
        if self.rank() < 2 {
            return Err(Error::msg(format!(
                "flatten_time requires rank >= 2, got {}",
                self.shape
            )));
        }
        let dims = self.dims();
        let mut merged = vec![dims[0] * dims[1]];
        merged.extend_from_slice(&dims[2..]);
        Ok(TensorView::new(self.offset, Shape::new(merged)))
    }

    /// Reinterpret this view with a different shape of equal element count.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<TensorView> {
        let shape = shape.into();
        if shape.elem_count() != self.len() {
            return Err(Error::msg(format!(
                "cannot reshape view of {} elements to {}",
                self.len(),
                shape
            )));
        }
        Ok(TensorView::new(self.offset, shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_offsets() {
        // (4, 2, 3) starting at offset 10: each step is 6 elements.
        let v = TensorView::new(10, (4, 2, 3));
        let s0 = v.step(0).unwrap();
        assert_eq!(s0.offset(), 10);
        assert_eq!(s0.dims(), &[2, 3]);
        let s2 = v.step(2).unwrap();
        assert_eq!(s2.offset(), 10 + 12);
    }

    #[test]
    fn test_step_negative_wraps_to_context_row() {
        let v = TensorView::new(0, (4, 2, 3));
        let last = v.step(-1).unwrap();
        assert_eq!(last.offset(), 3 * 6);
        assert_eq!(last, v.step(3).unwrap());
    }

    #[test]
    fn test_step_out_of_range() {
        let v = TensorView::new(0, (4, 2, 3));
        assert!(v.step(4).is_err());
        assert!(v.step(-5).is_err());
    }

    #[test]
    fn test_steps_and_flatten() {
        let v = TensorView::new(5, (5, 2, 3));
        let head = v.steps(0, 4).unwrap();
        assert_eq!(head.dims(), &[4, 2, 3]);
        let flat = head.flatten_time().unwrap();
        assert_eq!(flat.dims(), &[8, 3]);
        assert_eq!(flat.offset(), 5);

        let tail = v.steps(1, 5).unwrap();
        assert_eq!(tail.offset(), 5 + 6);
    }

    #[test]
    fn test_reshape_checks_len() {
        let v = TensorView::new(0, (2, 3));
        assert!(v.reshape((3, 2)).is_ok());
        assert!(v.reshape((4, 2)).is_err());
    }
}
