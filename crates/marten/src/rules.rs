use marten_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Rule matching — initializer/modifier reference resolution
//
// A ReferenceMap is an ordered list of (pattern, value) rules resolved over
// explicit (layer-name, view-name) pairs:
//
//   - a plain pattern matches layer names; `*` matches any substring and may
//     appear multiple times
//   - a rule value is either one value (applies to every view of matched
//     layers) or a nested (view-pattern, value) list matched against view
//     names the same way
//   - the special pattern `default` supplies a value for every pair no
//     other rule matched (outer level: no layer rule matched; nested level:
//     no view pattern within that rule matched)
//   - the special pattern `fallback` supplies a backup value consulted only
//     when applying the resolved value fails
//
// Resolution is an explicit contract, not dict-merge behavior: every target
// pair must end up with exactly one value and at most one fallback, anything
// else is a NetworkValidation error. `resolve_optional` relaxes "exactly
// one" to "at most one" (for modifiers) and forbids fallbacks entirely.

/// A rule's right-hand side: one value, or per-view patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleValue<T> {
    Value(T),
    Nested(Vec<(String, T)>),
}

/// An ordered pattern → value mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMap<T> {
    rules: Vec<(String, RuleValue<T>)>,
}

impl<T> Default for ReferenceMap<T> {
    fn default() -> Self {
        ReferenceMap { rules: Vec::new() }
    }
}

impl<T> ReferenceMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Add a layer-pattern rule applying to every view of matched layers.
    pub fn rule(mut self, pattern: &str, value: T) -> Self {
        self.rules.push((pattern.to_string(), RuleValue::Value(value)));
        self
    }

    /// Add a layer-pattern rule with per-view patterns.
    pub fn nested_rule(mut self, pattern: &str, views: Vec<(&str, T)>) -> Self {
        self.rules.push((
            pattern.to_string(),
            RuleValue::Nested(views.into_iter().map(|(p, v)| (p.to_string(), v)).collect()),
        ));
        self
    }

    /// Value for every pair no other rule matches.
    pub fn default_rule(self, value: T) -> Self {
        self.rule("default", value)
    }

    /// Backup value consulted when the resolved value fails to apply.
    pub fn fallback(self, value: T) -> Self {
        self.rule("fallback", value)
    }
}

/// The outcome of resolution for one (layer, view) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub fallback: Option<T>,
}

/// `*`-wildcard match; `*` matches any (possibly empty) substring.
fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while ni < n.len() {
        if pi < p.len() && (p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ni;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ni = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

struct Candidates<T> {
    direct: Vec<T>,
    defaults: Vec<T>,
    fallbacks: Vec<T>,
}

fn candidates_for<T: Clone>(
    refs: &ReferenceMap<T>,
    layer: &str,
    view: &str,
) -> Result<Candidates<T>> {
    let mut c = Candidates {
        direct: Vec::new(),
        defaults: Vec::new(),
        fallbacks: Vec::new(),
    };
    let gather = |value: &RuleValue<T>, direct: &mut Vec<T>, fallbacks: &mut Vec<T>| {
        match value {
            RuleValue::Value(t) => direct.push(t.clone()),
            RuleValue::Nested(views) => {
                let mut inner_direct = Vec::new();
                let mut inner_default = Vec::new();
                for (p, t) in views {
                    match p.as_str() {
                        "fallback" => fallbacks.push(t.clone()),
                        "default" => inner_default.push(t.clone()),
                        _ if glob_match(p, view) => inner_direct.push(t.clone()),
                        _ => {}
                    }
                }
                if inner_direct.is_empty() {
                    direct.extend(inner_default);
                } else {
                    direct.extend(inner_direct);
                }
            }
        }
    };

    for (pattern, value) in &refs.rules {
        match pattern.as_str() {
            "fallback" => match value {
                RuleValue::Value(t) => c.fallbacks.push(t.clone()),
                RuleValue::Nested(_) => {
                    return Err(Error::network(
                        "'fallback' must map directly to a value".to_string(),
                    ))
                }
            },
            "default" => gather(value, &mut c.defaults, &mut c.fallbacks),
            _ if glob_match(pattern, layer) => gather(value, &mut c.direct, &mut c.fallbacks),
            _ => {}
        }
    }
    Ok(c)
}

fn pick<T>(
    layer: &str,
    view: &str,
    c: Candidates<T>,
    required: bool,
) -> Result<(Option<T>, Option<T>)> {
    let mut direct = c.direct;
    if direct.len() > 1 {
        return Err(Error::network(format!(
            "multiple values resolve for {}.{}",
            layer, view
        )));
    }
    if direct.is_empty() {
        let mut defaults = c.defaults;
        if defaults.len() > 1 {
            return Err(Error::network(format!(
                "multiple defaults resolve for {}.{}",
                layer, view
            )));
        }
        direct = defaults.drain(..).collect();
    }
    if required && direct.is_empty() {
        return Err(Error::network(format!(
            "no value resolves for {}.{}",
            layer, view
        )));
    }
    let mut fallbacks = c.fallbacks;
    if fallbacks.len() > 1 {
        return Err(Error::network(format!(
            "multiple fallbacks resolve for {}.{}",
            layer, view
        )));
    }
    Ok((direct.pop(), fallbacks.pop()))
}

/// Resolve every target pair to exactly one value and at most one fallback.
pub fn resolve_references<T: Clone>(
    targets: &[(String, Vec<String>)],
    refs: &ReferenceMap<T>,
) -> Result<BTreeMap<(String, String), Resolved<T>>> {
    let mut out = BTreeMap::new();
    for (layer, views) in targets {
        for view in views {
            let c = candidates_for(refs, layer, view)?;
            let (value, fallback) = pick(layer, view, c, true)?;
            let value = value.ok_or_else(|| {
                Error::network(format!("no value resolves for {}.{}", layer, view))
            })?;
            out.insert((layer.clone(), view.clone()), Resolved { value, fallback });
        }
    }
    Ok(out)
}

/// Resolve with "at most one" semantics and no fallback support; unmatched
/// pairs are simply absent from the result.
pub fn resolve_optional<T: Clone>(
    targets: &[(String, Vec<String>)],
    refs: &ReferenceMap<T>,
) -> Result<BTreeMap<(String, String), T>> {
    let mut out = BTreeMap::new();
    for (layer, views) in targets {
        for view in views {
            let c = candidates_for(refs, layer, view)?;
            if !c.fallbacks.is_empty() {
                return Err(Error::network(
                    "fallback is not supported here".to_string(),
                ));
            }
            let (value, _) = pick(layer, view, c, false)?;
            if let Some(value) = value {
                out.insert((layer.clone(), view.clone()), value);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> Vec<(String, Vec<String>)> {
        vec![
            (
                "rnn".to_string(),
                vec!["W".to_string(), "R".to_string(), "bias".to_string()],
            ),
            ("fc".to_string(), vec!["W".to_string(), "bias".to_string()]),
        ]
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("rnn", "rnn"));
        assert!(glob_match("r*", "rnn"));
        assert!(glob_match("*n*", "rnn"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("fc", "rnn"));
        assert!(!glob_match("r*x", "rnn"));
    }

    #[test]
    fn test_default_covers_unmatched() {
        let refs = ReferenceMap::new()
            .nested_rule("rnn", vec![("bias", 7)])
            .default_rule(1);
        let resolved = resolve_references(&targets(), &refs).unwrap();
        assert_eq!(resolved[&("rnn".into(), "bias".into())].value, 7);
        assert_eq!(resolved[&("rnn".into(), "W".into())].value, 1);
        assert_eq!(resolved[&("fc".into(), "W".into())].value, 1);
    }

    #[test]
    fn test_missing_value_is_an_error() {
        let refs = ReferenceMap::new().rule("rnn", 1);
        let err = resolve_references(&targets(), &refs).unwrap_err();
        assert!(matches!(err, Error::NetworkValidation(_)));
    }

    #[test]
    fn test_ambiguous_match_is_an_error() {
        let refs = ReferenceMap::new().rule("r*", 1).rule("*n", 2).default_rule(0);
        let err = resolve_references(&targets(), &refs).unwrap_err();
        assert!(matches!(err, Error::NetworkValidation(_)));
    }

    #[test]
    fn test_fallback_resolution() {
        let refs = ReferenceMap::new().default_rule(1).fallback(9);
        let resolved = resolve_references(&targets(), &refs).unwrap();
        assert_eq!(resolved[&("rnn".into(), "W".into())].fallback, Some(9));
    }

    #[test]
    fn test_nested_view_patterns() {
        let refs = ReferenceMap::new()
            .nested_rule("*", vec![("b*", 2), ("default", 1)]);
        let resolved = resolve_references(&targets(), &refs).unwrap();
        assert_eq!(resolved[&("rnn".into(), "bias".into())].value, 2);
        assert_eq!(resolved[&("rnn".into(), "R".into())].value, 1);
    }

    #[test]
    fn test_optional_skips_unmatched_and_rejects_fallback() {
        let refs = ReferenceMap::new().nested_rule("rnn", vec![("W", 5)]);
        let resolved = resolve_optional(&targets(), &refs).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[&("rnn".into(), "W".into())], 5);

        let refs = ReferenceMap::new().rule("rnn", 5).fallback(1);
        assert!(resolve_optional(&targets(), &refs).is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let refs: ReferenceMap<i32> = ReferenceMap::new()
            .rule("rnn", 1)
            .nested_rule("fc", vec![("bias", 2)]);
        let json = serde_json::to_string(&refs).unwrap();
        let back: ReferenceMap<i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(refs, back);
    }
}
