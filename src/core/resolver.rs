//! DC-003: Tag resolution of selector expressions into datasource sets.
//!
//! Selector grammar:
//! - `tag`      simple: every datasource carrying `tag`
//! - `a.b.c`    composite: carries `a` AND `b` AND `c` (left-to-right intersection)
//! - `!expr`    negation: matches of `expr` are subtracted from the final union
//!
//! The result is `⋃ positives − ⋃ negatives`, restricted by the optional
//! kind/engine filters. Everything here is a pure function over a `TagIndex`;
//! results are positions in registry load order.

use super::types::{DatasourceKind, Engine};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

type Positions = BTreeSet<usize>;

/// `tag → positions` plus per-position kind/engine, built once per registry.
#[derive(Debug, Default, Clone)]
pub struct TagIndex {
    entries: Vec<(DatasourceKind, Engine)>,
    by_tag: FxHashMap<String, Positions>,
}

impl TagIndex {
    /// Index datasources given in load order. Every datasource is also
    /// indexed under the empty tag.
    pub fn build<'a, I>(datasources: I) -> Self
    where
        I: IntoIterator<Item = (DatasourceKind, Engine, &'a [String])>,
    {
        let mut index = Self::default();
        for (pos, (kind, engine, tags)) in datasources.into_iter().enumerate() {
            index.entries.push((kind, engine));
            index.by_tag.entry(String::new()).or_default().insert(pos);
            for tag in tags {
                index.by_tag.entry(tag.clone()).or_default().insert(pos);
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn positions(&self, tag: &str) -> Option<&Positions> {
        self.by_tag.get(tag)
    }

    fn passes(&self, pos: usize, kind: Option<DatasourceKind>, engine: Option<Engine>) -> bool {
        let (k, e) = self.entries[pos];
        kind.is_none_or(|want| want == k) && engine.is_none_or(|want| want == e)
    }
}

/// Kind/engine restriction applied to every component lookup.
#[derive(Debug, Clone, Copy, Default)]
struct Filter {
    kind: Option<DatasourceKind>,
    engine: Option<Engine>,
}

/// True when the selector subtracts rather than adds.
pub fn is_negation(selector: &str) -> bool {
    selector.starts_with('!')
}

/// Resolve `selectors` (optionally restricted by `limited`) to positions.
pub fn lookup<S: AsRef<str>>(
    index: &TagIndex,
    selectors: &[S],
    limited: Option<&[S]>,
    kind: Option<DatasourceKind>,
    engine: Option<Engine>,
) -> Vec<usize> {
    let filter = Filter { kind, engine };
    let main = resolve_all(index, selectors.iter().map(AsRef::as_ref), filter);

    let limited = match limited {
        Some(l) if !l.is_empty() => l,
        _ => return main.into_iter().collect(),
    };

    let restriction = resolve_all(index, limited.iter().map(AsRef::as_ref), filter);
    let narrowed: Positions = main.intersection(&restriction).copied().collect();

    // "all but X" restrictions have no positives of their own; compose them
    // with the main selection instead.
    if narrowed.is_empty() && limited.iter().all(|s| is_negation(s.as_ref())) {
        let combined = selectors
            .iter()
            .map(AsRef::as_ref)
            .chain(limited.iter().map(AsRef::as_ref));
        return resolve_all(index, combined, filter).into_iter().collect();
    }

    narrowed.into_iter().collect()
}

/// Union of positives minus union of negatives. No selectors at all selects
/// everything that passes the filter.
fn resolve_all<'a, I>(index: &TagIndex, selectors: I, filter: Filter) -> Positions
where
    I: IntoIterator<Item = &'a str>,
{
    let mut selectors = selectors.into_iter().peekable();
    if selectors.peek().is_none() {
        return (0..index.len())
            .filter(|&p| index.passes(p, filter.kind, filter.engine))
            .collect();
    }

    let mut positive = Positions::new();
    let mut negative = Positions::new();
    for selector in selectors {
        match selector.strip_prefix('!') {
            Some(body) => negative.extend(resolve_expr(index, body, filter)),
            None => positive.extend(resolve_expr(index, selector, filter)),
        }
    }
    positive.difference(&negative).copied().collect()
}

/// A single (non-negated) expression: simple tag or dot-joined composite.
fn resolve_expr(index: &TagIndex, expr: &str, filter: Filter) -> Positions {
    if !expr.contains('.') {
        return resolve_simple(index, expr, filter);
    }

    let mut components = expr.split('.');
    let first = components.next().unwrap_or_default();
    let mut survivors = resolve_simple(index, first, filter);
    for component in components {
        if survivors.is_empty() {
            break;
        }
        let matched = resolve_simple(index, component, filter);
        survivors.retain(|p| matched.contains(p));
    }
    survivors
}

fn resolve_simple(index: &TagIndex, tag: &str, filter: Filter) -> Positions {
    index
        .positions(tag)
        .map(|set| {
            set.iter()
                .copied()
                .filter(|&p| index.passes(p, filter.kind, filter.engine))
                .collect()
        })
        .unwrap_or_default()
}
