use crate::error::{Error, Result};
use crate::shape::Shape;
use serde::{Deserialize, Serialize};

// HostArray — host-resident dense array
//
// The only boundary between a handler's internal storage and conventional
// host memory: row-major, arbitrary rank, f64 elements. Handlers convert
// to/from this format without reordering axes; everything outside the core
// (initializers, persistence, test fixtures) speaks HostArray.

/// A dense row-major f64 array resident in host memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl HostArray {
    /// Create an array from a shape and flat row-major data.
    pub fn new(shape: impl Into<Shape>, data: Vec<f64>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != data.len() {
            return Err(Error::msg(format!(
                "host array data length {} does not match shape {}",
                data.len(),
                shape
            )));
        }
        Ok(HostArray {
            shape: shape.dims().to_vec(),
            data,
        })
    }

    /// Create a zero-filled array.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        HostArray {
            data: vec![0.0; shape.elem_count()],
            shape: shape.dims().to_vec(),
        }
    }

    /// Create a constant-filled array.
    pub fn full(shape: impl Into<Shape>, val: f64) -> Self {
        let shape = shape.into();
        HostArray {
            data: vec![val; shape.elem_count()],
            shape: shape.dims().to_vec(),
        }
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.shape.clone())
    }

    pub fn dims(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    /// Flat row-major index of a multi-dimensional position.
    pub fn flat_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.shape.len() {
            return Err(Error::msg(format!(
                "index rank {} does not match array rank {}",
                index.len(),
                self.shape.len()
            )));
        }
        let mut flat = 0;
        for (i, (&ix, &dim)) in index.iter().zip(self.shape.iter()).enumerate() {
            if ix >= dim {
                return Err(Error::msg(format!(
                    "index {} out of range for dimension {} of size {}",
                    ix, i, dim
                )));
            }
            flat = flat * dim + ix;
        }
        Ok(flat)
    }

    /// Element at a multi-dimensional position.
    pub fn at(&self, index: &[usize]) -> Result<f64> {
        Ok(self.data[self.flat_index(index)?])
    }

    pub fn set(&mut self, index: &[usize], val: f64) -> Result<()> {
        let flat = self.flat_index(index)?;
        self.data[flat] = val;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_length() {
        assert!(HostArray::new((2, 2), vec![1.0, 2.0, 3.0]).is_err());
        assert!(HostArray::new((2, 2), vec![1.0, 2.0, 3.0, 4.0]).is_ok());
    }

    #[test]
    fn test_flat_index_row_major() {
        let a = HostArray::new((2, 3), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(a.at(&[0, 0]).unwrap(), 0.0);
        assert_eq!(a.at(&[0, 2]).unwrap(), 2.0);
        assert_eq!(a.at(&[1, 0]).unwrap(), 3.0);
        assert_eq!(a.at(&[1, 2]).unwrap(), 5.0);
    }

    #[test]
    fn test_index_out_of_range() {
        let a = HostArray::zeros((2, 3));
        assert!(a.at(&[2, 0]).is_err());
        assert!(a.at(&[0]).is_err());
    }
}
