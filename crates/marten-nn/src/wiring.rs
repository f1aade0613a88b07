use marten_core::{Error, Result};
use std::fmt;

// Wiring — typed connection edges between layers
//
// A Connection joins one layer's output (or, for monitoring taps, an
// internal buffer) to another layer's named input. Connections are resolved
// structurally once, at construction; the layout turns each wired
// output/input pair into a single shared memory region.

/// Which buffer category a connection source refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Outputs,
    Parameters,
    Internals,
}

/// A reference to a source buffer on the producing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub category: Category,
    pub name: String,
}

impl SourceRef {
    pub fn output(name: impl Into<String>) -> Self {
        SourceRef {
            category: Category::Outputs,
            name: name.into(),
        }
    }

    /// Parse a source spec: a plain name refers to an output, while
    /// `..internals.Name` / `..parameters.Name` address the other
    /// categories explicitly.
    pub fn parse(spec: &str) -> Result<Self> {
        match spec.strip_prefix("..") {
            None => Ok(SourceRef::output(spec)),
            Some(rest) => {
                let (category, name) = rest.split_once('.').ok_or_else(|| {
                    Error::network(format!("malformed connection source '{}'", spec))
                })?;
                let category = match category {
                    "internals" => Category::Internals,
                    "parameters" => Category::Parameters,
                    other => {
                        return Err(Error::network(format!(
                            "unknown connection source category '{}' in '{}'",
                            other, spec
                        )))
                    }
                };
                Ok(SourceRef {
                    category,
                    name: name.to_string(),
                })
            }
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category {
            Category::Outputs => write!(f, "{}", self.name),
            Category::Parameters => write!(f, "..parameters.{}", self.name),
            Category::Internals => write!(f, "..internals.{}", self.name),
        }
    }
}

/// A directed wiring edge: `src_layer.src -> sink_layer.sink_input`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub src_layer: String,
    pub src: SourceRef,
    pub sink_layer: String,
    pub sink_input: String,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.src_layer, self.src, self.sink_layer, self.sink_input
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_output() {
        let s = SourceRef::parse("default").unwrap();
        assert_eq!(s.category, Category::Outputs);
        assert_eq!(s.name, "default");
    }

    #[test]
    fn test_parse_internal_tap() {
        let s = SourceRef::parse("..internals.Ha").unwrap();
        assert_eq!(s.category, Category::Internals);
        assert_eq!(s.name, "Ha");
    }

    #[test]
    fn test_parse_rejects_unknown_category() {
        assert!(SourceRef::parse("..gradients.W").is_err());
        assert!(SourceRef::parse("..internals").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for spec in ["default", "..internals.Ha", "..parameters.W"] {
            let s = SourceRef::parse(spec).unwrap();
            assert_eq!(format!("{}", s), spec);
        }
    }
}
