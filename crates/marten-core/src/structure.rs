use crate::error::{Error, Result};
use crate::shape::Shape;
use std::fmt;

// BufferStructure & StructureTemplate — symbolic buffer shapes
//
// Layers declare buffers symbolically: feature dimensions are concrete
// integers, while the leading time/batch dimensions stay symbolic until the
// first data arrives and the buffer manager resolves them. A
// StructureTemplate is the matching side of the same idea: it describes what
// a layer is willing to accept on an input.

/// One axis of a structure template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateAxis {
    /// The symbolic time dimension.
    Time,
    /// The symbolic batch dimension.
    Batch,
    /// Any concrete feature size.
    Wildcard,
    /// Exactly this feature size.
    Fixed(usize),
}

/// A shape pattern an input must match: ordered axis tags, each symbolic,
/// wildcard, or fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureTemplate {
    axes: Vec<TemplateAxis>,
}

impl StructureTemplate {
    pub fn new(axes: Vec<TemplateAxis>) -> Self {
        StructureTemplate { axes }
    }

    /// The common `[Time, Batch, Feature]` template.
    pub fn time_batch_feature() -> Self {
        StructureTemplate {
            axes: vec![TemplateAxis::Time, TemplateAxis::Batch, TemplateAxis::Wildcard],
        }
    }

    pub fn axes(&self) -> &[TemplateAxis] {
        &self.axes
    }

    /// A template matches a structure iff ranks agree, symbolic axes line up
    /// with the structure's scaling, and every fixed tag equals the
    /// corresponding feature dimension.
    pub fn matches(&self, structure: &BufferStructure) -> bool {
        let mut feature_dims = structure.feature_dims().iter();
        let mut symbolic = self.axes.iter().peekable();

        // Leading symbolic axes must agree with the structure's scaling.
        let expects_time = matches!(symbolic.peek(), Some(TemplateAxis::Time));
        if expects_time {
            symbolic.next();
        }
        let expects_batch = matches!(symbolic.peek(), Some(TemplateAxis::Batch));
        if expects_batch {
            symbolic.next();
        }
        let scaling_ok = match structure.scaling() {
            Scaling::TimeBatch => expects_time && expects_batch,
            Scaling::Batch => !expects_time && expects_batch,
            Scaling::Fixed => !expects_time && !expects_batch,
        };
        if !scaling_ok {
            return false;
        }

        for axis in symbolic {
            let dim = match feature_dims.next() {
                Some(&d) => d,
                None => return false,
            };
            match axis {
                TemplateAxis::Wildcard => {}
                TemplateAxis::Fixed(f) => {
                    if *f != dim {
                        return false;
                    }
                }
                // Symbolic tags after feature axes are malformed templates.
                TemplateAxis::Time | TemplateAxis::Batch => return false,
            }
        }
        feature_dims.next().is_none()
    }
}

impl fmt::Display for StructureTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<")?;
        for (i, a) in self.axes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match a {
                TemplateAxis::Time => write!(f, "T")?,
                TemplateAxis::Batch => write!(f, "B")?,
                TemplateAxis::Wildcard => write!(f, "F")?,
                TemplateAxis::Fixed(n) => write!(f, "{}", n)?,
            }
        }
        write!(f, ">")
    }
}

/// How a buffer's leading dimensions scale with the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scaling {
    /// Leading `[Time, Batch]` dimensions, resolved per forward pass.
    TimeBatch,
    /// A single leading `[Batch]` dimension.
    Batch,
    /// No symbolic dimensions; the shape is fully concrete (parameters).
    Fixed,
}

/// The symbolic shape of one named buffer: scaling mode, concrete feature
/// dimensions, an optional reserved context step, and a flag marking buffers
/// that only exist during gradient computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferStructure {
    scaling: Scaling,
    feature_dims: Vec<usize>,
    context_size: usize,
    backward_only: bool,
}

impl BufferStructure {
    /// A `[Time, Batch, features...]` buffer.
    pub fn time_batch(feature_dims: impl Into<Vec<usize>>) -> Self {
        BufferStructure {
            scaling: Scaling::TimeBatch,
            feature_dims: feature_dims.into(),
            context_size: 0,
            backward_only: false,
        }
    }

    /// A fully concrete buffer (parameters and fixed scratch).
    pub fn fixed(feature_dims: impl Into<Vec<usize>>) -> Self {
        BufferStructure {
            scaling: Scaling::Fixed,
            feature_dims: feature_dims.into(),
            context_size: 0,
            backward_only: false,
        }
    }

    /// A `[Batch, features...]` buffer.
    pub fn batch(feature_dims: impl Into<Vec<usize>>) -> Self {
        BufferStructure {
            scaling: Scaling::Batch,
            feature_dims: feature_dims.into(),
            context_size: 0,
            backward_only: false,
        }
    }

    /// Reserve one extra trailing time step for recurrent carry-over.
    pub fn with_context(mut self) -> Self {
        self.context_size = 1;
        self
    }

    /// The same structure without the reserved context step: the shape a
    /// consumer of a wired buffer sees (the context row is trailing, so the
    /// consumer view is the step prefix of the producer's region).
    pub fn without_context(&self) -> Self {
        let mut s = self.clone();
        s.context_size = 0;
        s
    }

    /// Mark this buffer as needed only during gradient computation.
    pub fn backward_only(mut self) -> Self {
        self.backward_only = true;
        self
    }

    pub fn scaling(&self) -> Scaling {
        self.scaling
    }

    pub fn feature_dims(&self) -> &[usize] {
        &self.feature_dims
    }

    /// Product of the concrete feature dimensions.
    pub fn feature_size(&self) -> usize {
        self.feature_dims.iter().product()
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn is_backward_only(&self) -> bool {
        self.backward_only
    }

    /// Every feature dimension must be a concrete positive integer before
    /// buffer creation.
    pub fn validate(&self) -> Result<()> {
        if self.feature_dims.iter().any(|&d| d == 0) {
            return Err(Error::msg(format!(
                "buffer structure {:?} has a zero feature dimension",
                self.feature_dims
            )));
        }
        if self.context_size > 1 {
            return Err(Error::msg(format!(
                "context size must be 0 or 1, got {}",
                self.context_size
            )));
        }
        if self.context_size == 1 && self.scaling != Scaling::TimeBatch {
            return Err(Error::msg(
                "context slots require a time-scaled buffer".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve into a concrete shape for the given time/batch sizes.
    /// Context buffers get their extra trailing time row here.
    pub fn resolve(&self, time: usize, batch: usize) -> Shape {
        let mut dims = Vec::with_capacity(self.feature_dims.len() + 2);
        match self.scaling {
            Scaling::TimeBatch => {
                dims.push(time + self.context_size);
                dims.push(batch);
            }
            Scaling::Batch => dims.push(batch),
            Scaling::Fixed => {}
        }
        dims.extend_from_slice(&self.feature_dims);
        Shape::new(dims)
    }

    /// Element count of the resolved shape.
    pub fn resolved_len(&self, time: usize, batch: usize) -> usize {
        self.resolve(time, batch).elem_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_matches_time_batch_feature() {
        let t = StructureTemplate::time_batch_feature();
        assert!(t.matches(&BufferStructure::time_batch(vec![7])));
        assert!(t.matches(&BufferStructure::time_batch(vec![1])));
        assert!(!t.matches(&BufferStructure::fixed(vec![7])));
        assert!(!t.matches(&BufferStructure::batch(vec![7])));
        // Rank mismatch: two feature dims against one wildcard.
        assert!(!t.matches(&BufferStructure::time_batch(vec![3, 4])));
    }

    #[test]
    fn test_template_fixed_axis() {
        let t = StructureTemplate::new(vec![
            TemplateAxis::Time,
            TemplateAxis::Batch,
            TemplateAxis::Fixed(4),
        ]);
        assert!(t.matches(&BufferStructure::time_batch(vec![4])));
        assert!(!t.matches(&BufferStructure::time_batch(vec![5])));
    }

    #[test]
    fn test_resolve_with_context() {
        let s = BufferStructure::time_batch(vec![5]).with_context();
        assert_eq!(s.resolve(3, 2).dims(), &[4, 2, 5]);
        assert_eq!(s.resolved_len(3, 2), 40);
    }

    #[test]
    fn test_resolve_fixed_ignores_time_batch() {
        let s = BufferStructure::fixed(vec![5, 7]);
        assert_eq!(s.resolve(3, 2).dims(), &[5, 7]);
    }

    #[test]
    fn test_validate_rejects_zero_dims() {
        assert!(BufferStructure::fixed(vec![0]).validate().is_err());
        assert!(BufferStructure::time_batch(vec![3]).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_context_on_fixed() {
        let s = BufferStructure {
            scaling: Scaling::Fixed,
            feature_dims: vec![3],
            context_size: 1,
            backward_only: false,
        };
        assert!(s.validate().is_err());
    }
}
