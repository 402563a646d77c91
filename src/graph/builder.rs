//! Declarative registration of quantities, resolved once against the state.

use std::collections::{HashMap, VecDeque};

use crate::error::ConfigError;
use crate::state::StateStore;

use super::{CalcGraph, Calculation, Cell, LogDensitySum, NodeRef, QuantityId};

struct Declaration {
    name: String,
    inputs: Vec<String>,
    calc: Box<dyn Calculation>,
    is_sum: bool,
}

/// Builder for a [`CalcGraph`].
///
/// Quantities and their inputs are referenced by name. Names are resolved
/// against earlier-or-later quantities first, then against state slots.
///
/// # Example
///
/// ```
/// use mhchain::graph::{FnCalculation, GraphBuilder, InputView};
/// use mhchain::{StateStore, VersionedSlot};
///
/// let mut state = StateStore::new();
/// state.add(VersionedSlot::real("mu", vec![0.0]).unwrap()).unwrap();
///
/// let graph = GraphBuilder::new()
///     .quantity("prior", &["mu"], FnCalculation::new(|v: &InputView<'_>| -0.5 * v.scalar(0).powi(2)))
///     .log_density_sum("posterior", &["prior"])
///     .build(&state)
///     .unwrap();
/// assert_eq!(graph.len(), 2);
/// ```
#[derive(Default)]
pub struct GraphBuilder {
    declarations: Vec<Declaration>,
    exclusions: Vec<(String, String)>,
}

impl GraphBuilder {
    /// Empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a quantity computed by `calc` from the named inputs.
    #[must_use]
    pub fn quantity(mut self, name: impl Into<String>, inputs: &[&str], calc: impl Calculation + 'static) -> Self {
        self.declarations.push(Declaration {
            name: name.into(),
            inputs: inputs.iter().map(|s| (*s).to_string()).collect(),
            calc: Box::new(calc),
            is_sum: false,
        });
        self
    }

    /// Registers a [`LogDensitySum`] over the named inputs.
    #[must_use]
    pub fn log_density_sum(mut self, name: impl Into<String>, inputs: &[&str]) -> Self {
        self.declarations.push(Declaration {
            name: name.into(),
            inputs: inputs.iter().map(|s| (*s).to_string()).collect(),
            calc: Box::new(LogDensitySum),
            is_sum: true,
        });
        self
    }

    /// Drops `input` from the sum `quantity` (sample from prior).
    #[must_use]
    pub fn exclude_input(mut self, quantity: impl Into<String>, input: impl Into<String>) -> Self {
        self.exclusions.push((quantity.into(), input.into()));
        self
    }

    /// Resolves names, rejects duplicates and cycles, and lays out the arena.
    pub fn build(mut self, state: &StateStore) -> Result<CalcGraph, ConfigError> {
        let mut by_name = HashMap::new();
        for (i, d) in self.declarations.iter().enumerate() {
            if d.name.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    field: "quantity name".to_string(),
                });
            }
            if state.lookup(&d.name).is_some() || by_name.insert(d.name.clone(), QuantityId(i)).is_some() {
                return Err(ConfigError::DuplicateId { id: d.name.clone() });
            }
        }

        for (quantity, input) in std::mem::take(&mut self.exclusions) {
            let decl = self
                .declarations
                .iter_mut()
                .find(|d| d.name == quantity)
                .ok_or_else(|| ConfigError::SampleFromPrior {
                    reason: format!("there is no quantity named '{quantity}'"),
                })?;
            if !decl.is_sum {
                return Err(ConfigError::SampleFromPrior {
                    reason: format!("'{quantity}' is not a sum of log-densities"),
                });
            }
            let before = decl.inputs.len();
            decl.inputs.retain(|i| *i != input);
            if decl.inputs.len() == before {
                return Err(ConfigError::SampleFromPrior {
                    reason: format!("'{quantity}' has no input named '{input}'"),
                });
            }
        }

        let n = self.declarations.len();
        let mut inputs = Vec::with_capacity(n);
        let mut readers = vec![Vec::new(); n];
        let mut slot_readers = vec![Vec::new(); state.len()];
        for (i, d) in self.declarations.iter().enumerate() {
            let mut resolved = Vec::with_capacity(d.inputs.len());
            for input in &d.inputs {
                let node = if let Some(q) = by_name.get(input) {
                    NodeRef::Quantity(*q)
                } else if let Some(s) = state.lookup(input) {
                    NodeRef::Slot(s)
                } else {
                    return Err(ConfigError::UnknownInput {
                        quantity: d.name.clone(),
                        input: input.clone(),
                    });
                };
                match node {
                    NodeRef::Quantity(q) => push_unique(&mut readers[q.0], QuantityId(i)),
                    NodeRef::Slot(s) => push_unique(&mut slot_readers[s.index()], QuantityId(i)),
                }
                resolved.push(node);
            }
            inputs.push(resolved);
        }

        let topo = topological_order(&inputs, &readers).map_err(|q| ConfigError::CyclicGraph {
            quantity: self.declarations[q.0].name.clone(),
        })?;
        let upstream = upstream_sets(&inputs, &topo);

        let (names, calcs): (Vec<_>, Vec<_>) = self.declarations.into_iter().map(|d| (d.name, d.calc)).unzip();
        Ok(CalcGraph {
            names,
            by_name,
            calcs,
            inputs,
            cells: vec![Cell::default(); n],
            slot_readers,
            readers,
            topo,
            upstream,
            affected_cache: HashMap::new(),
            affected: Vec::new(),
            evaluated: Vec::new(),
            checked_generation: None,
            scratch: Vec::new(),
        })
    }
}

fn push_unique(list: &mut Vec<QuantityId>, q: QuantityId) {
    if !list.contains(&q) {
        list.push(q);
    }
}

/// Kahn's algorithm. On a cycle, returns some quantity on or behind it.
fn topological_order(inputs: &[Vec<NodeRef>], readers: &[Vec<QuantityId>]) -> Result<Vec<QuantityId>, QuantityId> {
    let mut pending: Vec<usize> = inputs
        .iter()
        .map(|ins| {
            let mut qs: Vec<_> = ins
                .iter()
                .filter_map(|n| match n {
                    NodeRef::Quantity(q) => Some(*q),
                    NodeRef::Slot(_) => None,
                })
                .collect();
            qs.sort_unstable();
            qs.dedup();
            qs.len()
        })
        .collect();
    let mut ready: VecDeque<QuantityId> = (0..inputs.len())
        .filter(|i| pending[*i] == 0)
        .map(QuantityId)
        .collect();
    let mut order = Vec::with_capacity(inputs.len());
    while let Some(q) = ready.pop_front() {
        order.push(q);
        for r in &readers[q.0] {
            pending[r.0] -= 1;
            if pending[r.0] == 0 {
                ready.push_back(*r);
            }
        }
    }
    if order.len() == inputs.len() {
        Ok(order)
    } else {
        let stuck = pending.iter().position(|p| *p > 0).unwrap_or(0);
        Err(QuantityId(stuck))
    }
}

fn upstream_sets(inputs: &[Vec<NodeRef>], topo: &[QuantityId]) -> Vec<Vec<QuantityId>> {
    let n = inputs.len();
    let mut rank = vec![0; n];
    for (r, q) in topo.iter().enumerate() {
        rank[q.0] = r;
    }
    (0..n)
        .map(|start| {
            let mut marked = vec![false; n];
            let mut stack = vec![start];
            while let Some(i) = stack.pop() {
                if std::mem::replace(&mut marked[i], true) {
                    continue;
                }
                for node in &inputs[i] {
                    if let NodeRef::Quantity(q) = node {
                        stack.push(q.0);
                    }
                }
            }
            let mut ups: Vec<QuantityId> = (0..n).filter(|i| marked[*i]).map(QuantityId).collect();
            ups.sort_by_key(|q| rank[q.0]);
            ups
        })
        .collect()
}
