use std::collections::{BTreeMap, HashMap};
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use polars::prelude::*;

use crate::builder::Builder;
use crate::error::WashoutError;
use crate::schema::{keys, lookup};

// ── Measure names ───────────────────────────────────────────────────────────

pub mod measure {
    pub const INCIDENCE: &str = "incidence";
    pub const PREVALENCE: &str = "prevalence";
    pub const EXCESS_MORTALITY: &str = "excess_mortality";
    pub const DISABILITY_WEIGHT: &str = "disability_weight";
    pub const CAUSE_SPECIFIC_MORTALITY: &str = "cause_specific_mortality";
    pub const REMISSION: &str = "remission";
}

// ── States and transitions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Susceptible,
    /// Infected state carrying excess mortality on top of background mortality.
    ExcessMortality,
}

#[derive(Debug, Clone)]
pub struct DiseaseState {
    pub state_id: String,
    pub cause: String,
    pub kind: StateKind,
    data: BTreeMap<String, DataFrame>,
}

impl DiseaseState {
    pub fn susceptible(cause: &str) -> Self {
        Self {
            state_id: format!("susceptible_to_{cause}"),
            cause: cause.to_string(),
            kind: StateKind::Susceptible,
            data: BTreeMap::new(),
        }
    }

    pub fn excess_mortality(cause: &str) -> Self {
        Self {
            state_id: cause.to_string(),
            cause: cause.to_string(),
            kind: StateKind::ExcessMortality,
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, measure: &str, df: DataFrame) -> Self {
        self.data.insert(measure.to_string(), df);
        self
    }

    pub fn data(&self, measure: &str) -> Option<&DataFrame> {
        self.data.get(measure)
    }

    pub fn measures(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(|k| k.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum Transition {
    /// Staying put for a step.
    SelfTransition,
    /// Leaving at a per-person-year rate looked up from `data`.
    Rate { measure: String, data: DataFrame },
}

// ── Model ───────────────────────────────────────────────────────────────────

/// A compartmental disease model: states as nodes, transitions as edges.
///
/// The engine owns simulant state and performs the draws; the model only
/// declares which states exist, how they connect, and the data behind each
/// rate.
pub struct DiseaseModel {
    cause: String,
    graph: DiGraph<DiseaseState, Transition>,
    /// Map from state id → NodeIndex for fast lookup.
    node_map: HashMap<String, NodeIndex>,
    cause_specific_mortality: Option<DataFrame>,
}

impl DiseaseModel {
    pub fn new(cause: &str) -> Self {
        Self {
            cause: cause.to_string(),
            graph: DiGraph::new(),
            node_map: HashMap::new(),
            cause_specific_mortality: None,
        }
    }

    pub fn cause(&self) -> &str {
        &self.cause
    }

    /// Deaths while in this model's infected state are attributed here.
    pub fn cause_of_death(&self) -> &str {
        &self.cause
    }

    pub fn add_state(&mut self, state: DiseaseState) -> Result<NodeIndex, WashoutError> {
        if self.node_map.contains_key(&state.state_id) {
            return Err(WashoutError::Configuration(format!(
                "State {} already exists in disease model {}",
                state.state_id, self.cause
            )));
        }
        let id = state.state_id.clone();
        let idx = self.graph.add_node(state);
        self.node_map.insert(id, idx);
        Ok(idx)
    }

    pub fn allow_self_transitions(&mut self, state_id: &str) -> Result<(), WashoutError> {
        let idx = self.index_of(state_id)?;
        if self.graph.find_edge(idx, idx).is_none() {
            self.graph.add_edge(idx, idx, Transition::SelfTransition);
        }
        Ok(())
    }

    pub fn add_rate_transition(
        &mut self,
        from: &str,
        to: &str,
        measure: &str,
        data: DataFrame,
    ) -> Result<(), WashoutError> {
        let src = self.index_of(from)?;
        let dst = self.index_of(to)?;
        if src == dst {
            return Err(WashoutError::Configuration(format!(
                "Rate transition from {from} to itself; use allow_self_transitions"
            )));
        }
        self.graph.add_edge(
            src,
            dst,
            Transition::Rate {
                measure: measure.to_string(),
                data,
            },
        );
        Ok(())
    }

    pub fn set_cause_specific_mortality(&mut self, df: DataFrame) {
        self.cause_specific_mortality = Some(df);
    }

    pub fn cause_specific_mortality(&self) -> Option<&DataFrame> {
        self.cause_specific_mortality.as_ref()
    }

    pub fn state(&self, state_id: &str) -> Option<&DiseaseState> {
        self.node_map.get(state_id).map(|&idx| &self.graph[idx])
    }

    /// States in insertion order.
    pub fn states(&self) -> Vec<&DiseaseState> {
        self.graph.node_indices().map(|idx| &self.graph[idx]).collect()
    }

    /// `(target state id, transition)` for every edge leaving `state_id`.
    pub fn transitions_from(&self, state_id: &str) -> Vec<(&str, &Transition)> {
        let Some(&idx) = self.node_map.get(state_id) else {
            return Vec::new();
        };
        let mut out: Vec<(&str, &Transition)> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| (self.graph[e.target()].state_id.as_str(), e.weight()))
            .collect();
        out.sort_by_key(|(target, _)| *target);
        out
    }

    /// True when some infected state can transition back to a susceptible
    /// state.
    pub fn is_sis(&self) -> bool {
        self.graph.edge_references().any(|e| {
            matches!(e.weight(), Transition::Rate { .. })
                && self.graph[e.source()].kind == StateKind::ExcessMortality
                && self.graph[e.target()].kind == StateKind::Susceptible
        })
    }

    fn index_of(&self, state_id: &str) -> Result<NodeIndex, WashoutError> {
        self.node_map.get(state_id).copied().ok_or_else(|| {
            WashoutError::Configuration(format!(
                "No state {state_id} in disease model {}",
                self.cause
            ))
        })
    }
}

impl fmt::Debug for DiseaseModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states: Vec<&str> = self
            .graph
            .node_indices()
            .map(|idx| self.graph[idx].state_id.as_str())
            .collect();
        f.debug_struct("DiseaseModel")
            .field("cause", &self.cause)
            .field("states", &states)
            .field("transitions", &self.graph.edge_count())
            .finish()
    }
}

// ── Data loading ────────────────────────────────────────────────────────────

/// How a measure is combined across subcauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubcauseAggregation {
    /// Additive measures: incidence, prevalence, cause-specific mortality.
    Sum,
    /// Per-case measures: excess mortality, disability weight.
    PrevalenceWeighted,
}

impl SubcauseAggregation {
    pub fn for_measure(measure_name: &str) -> Self {
        match measure_name {
            measure::EXCESS_MORTALITY | measure::DISABILITY_WEIGHT => {
                SubcauseAggregation::PrevalenceWeighted
            }
            _ => SubcauseAggregation::Sum,
        }
    }
}

pub fn load_measure(
    builder: &dyn Builder,
    cause: &str,
    measure_name: &str,
) -> Result<DataFrame, WashoutError> {
    builder.load(&keys::cause(cause, measure_name))
}

/// Load `measure_name` for every subcause and combine into one table.
pub fn load_aggregated_measure(
    builder: &dyn Builder,
    subcauses: &[&str],
    measure_name: &str,
) -> Result<DataFrame, WashoutError> {
    let frames = subcauses
        .iter()
        .map(|c| load_measure(builder, c, measure_name))
        .collect::<Result<Vec<_>, _>>()?;

    match SubcauseAggregation::for_measure(measure_name) {
        SubcauseAggregation::Sum => sum_values(frames),
        SubcauseAggregation::PrevalenceWeighted => {
            let prevalence = subcauses
                .iter()
                .map(|c| load_measure(builder, c, measure::PREVALENCE))
                .collect::<Result<Vec<_>, _>>()?;
            prevalence_weighted_values(frames, prevalence)
        }
    }
}

/// Every column except `value` identifies a row.
fn key_columns(df: &DataFrame) -> Result<Vec<String>, WashoutError> {
    if df.column(lookup::VALUE).is_err() {
        return Err(WashoutError::MissingColumn(lookup::VALUE.to_string()));
    }
    Ok(df
        .get_column_names_str()
        .iter()
        .filter(|c| **c != lookup::VALUE)
        .map(|c| c.to_string())
        .collect())
}

/// Row-wise sum of `value` across tables sharing the same key columns.
pub fn sum_values(frames: Vec<DataFrame>) -> Result<DataFrame, WashoutError> {
    let first = frames
        .first()
        .ok_or_else(|| WashoutError::InvalidData("No tables to aggregate".into()))?;
    let keys = key_columns(first)?;
    let key_exprs: Vec<Expr> = keys.iter().map(|c| col(c.as_str())).collect();

    let lazies: Vec<LazyFrame> = frames
        .into_iter()
        .map(|df| df.lazy().with_column(col(lookup::VALUE).cast(DataType::Float64)))
        .collect();

    let df = concat(lazies, UnionArgs::default())?
        .group_by_stable(key_exprs)
        .agg([col(lookup::VALUE).sum()])
        .collect()?;
    Ok(df)
}

/// Σ(value_i · prevalence_i) / Σ prevalence_i per key row; zero where the
/// total prevalence is zero.
pub fn prevalence_weighted_values(
    frames: Vec<DataFrame>,
    prevalence: Vec<DataFrame>,
) -> Result<DataFrame, WashoutError> {
    if frames.is_empty() || frames.len() != prevalence.len() {
        return Err(WashoutError::InvalidData(format!(
            "Expected one prevalence table per measure table, got {} and {}",
            prevalence.len(),
            frames.len()
        )));
    }
    let keys = key_columns(&frames[0])?;
    let key_exprs: Vec<Expr> = keys.iter().map(|c| col(c.as_str())).collect();

    let mut weighted = Vec::with_capacity(frames.len());
    for (df, prev) in frames.into_iter().zip(prevalence) {
        let mut prev_cols = key_exprs.clone();
        prev_cols.push(col(lookup::VALUE).cast(DataType::Float64).alias("_weight"));
        let lf = df
            .lazy()
            .join(
                prev.lazy().select(prev_cols),
                key_exprs.clone(),
                key_exprs.clone(),
                JoinArgs::new(JoinType::Inner),
            )
            .with_column(
                (col(lookup::VALUE).cast(DataType::Float64) * col("_weight")).alias("_weighted"),
            );
        weighted.push(lf);
    }

    let df = concat(weighted, UnionArgs::default())?
        .group_by_stable(key_exprs)
        .agg([col("_weighted").sum(), col("_weight").sum()])
        .with_column(
            when(col("_weight").gt(lit(0.0)))
                .then(col("_weighted") / col("_weight"))
                .otherwise(lit(0.0))
                .alias(lookup::VALUE),
        )
        .select(key_exprs_with_value(&keys))
        .collect()?;
    Ok(df)
}

fn key_exprs_with_value(keys: &[String]) -> Vec<Expr> {
    keys.iter()
        .map(|c| col(c.as_str()))
        .chain(std::iter::once(col(lookup::VALUE)))
        .collect()
}
