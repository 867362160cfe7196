//! In-process backing for the `Builder` seam.
//!
//! Holds data, the population table, named values and the clock, sets up
//! components, and dispatches the two notifications the study components
//! use: the `collect_metrics` event and the `metrics` value pull. It does not
//! schedule anything or move simulants between states; a host engine (or a
//! test) updates the population table and calls `step`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{NaiveDateTime, TimeDelta};
use log::{debug, info};
use polars::prelude::*;

use crate::artifact::Artifact;
use crate::builder::{Builder, Clock, Component, Event, MetricsMap, PopulationView, ValueSource};
use crate::config::SimulationConfig;
use crate::disease::DiseaseModel;
use crate::error::WashoutError;
use crate::schema::{events, keys, population};

// ── Clock ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SharedClock {
    now: RwLock<NaiveDateTime>,
}

impl SharedClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, t: NaiveDateTime) {
        match self.now.write() {
            Ok(mut guard) => *guard = t,
            Err(poisoned) => *poisoned.into_inner() = t,
        }
    }
}

impl Clock for SharedClock {
    fn now(&self) -> NaiveDateTime {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

// ── Tables ──────────────────────────────────────────────────────────────────

/// Rows of `table` for `index`, in index order. Unknown ids are skipped.
fn rows_for(table: &DataFrame, index: &[u32], columns: &[Expr]) -> Result<DataFrame, WashoutError> {
    let wanted = DataFrame::new(vec![Column::new(population::SIMULANT_ID.into(), index)])?;
    let df = wanted
        .lazy()
        .join(
            table
                .clone()
                .lazy()
                .with_column(col(population::SIMULANT_ID).cast(DataType::UInt32))
                .select(columns.to_vec()),
            [col(population::SIMULANT_ID)],
            [col(population::SIMULANT_ID)],
            JoinArgs::new(JoinType::Inner),
        )
        .collect()?;
    Ok(df)
}

fn require_columns(df: &DataFrame, required: &[&str]) -> Result<(), WashoutError> {
    for &col_name in required {
        if df.column(col_name).is_err() {
            return Err(WashoutError::MissingColumn(col_name.to_string()));
        }
    }
    Ok(())
}

struct TablePopulationView {
    table: Arc<RwLock<DataFrame>>,
    columns: Vec<String>,
}

impl PopulationView for TablePopulationView {
    fn get(&self, index: &[u32]) -> Result<DataFrame, WashoutError> {
        let table = self
            .table
            .read()
            .map_err(|_| WashoutError::General("Population table lock poisoned".into()))?;
        let names: Vec<&str> = self.columns.iter().map(|c| c.as_str()).collect();
        require_columns(&table, &names)?;

        let mut exprs = vec![col(population::SIMULANT_ID)];
        exprs.extend(
            self.columns
                .iter()
                .filter(|c| c.as_str() != population::SIMULANT_ID)
                .map(|c| col(c.as_str())),
        );
        rows_for(&table, index, &exprs)
    }
}

/// A value source backed by a fixed `simulant_id`/`value` table.
#[derive(Debug, Clone)]
pub struct TableValueSource {
    table: DataFrame,
}

impl TableValueSource {
    pub fn new(table: DataFrame) -> Result<Self, WashoutError> {
        require_columns(&table, &[population::SIMULANT_ID, crate::schema::exposure::VALUE])?;
        Ok(Self { table })
    }

    pub fn from_values(ids: &[u32], values: &[f64]) -> Result<Self, WashoutError> {
        Self::new(DataFrame::new(vec![
            Column::new(population::SIMULANT_ID.into(), ids),
            Column::new(crate::schema::exposure::VALUE.into(), values),
        ])?)
    }
}

impl ValueSource for TableValueSource {
    fn get(&self, index: &[u32]) -> Result<DataFrame, WashoutError> {
        rows_for(
            &self.table,
            index,
            &[col(population::SIMULANT_ID), col(crate::schema::exposure::VALUE)],
        )
    }
}

// ── Context ─────────────────────────────────────────────────────────────────

pub struct SimulationContext {
    config: SimulationConfig,
    start_time: NaiveDateTime,
    step_size: TimeDelta,
    clock: Arc<SharedClock>,
    data: HashMap<String, DataFrame>,
    artifact: Option<Artifact>,
    population: Arc<RwLock<DataFrame>>,
    values: HashMap<String, Arc<dyn ValueSource>>,
    disease_models: Vec<DiseaseModel>,
    components: Vec<Box<dyn Component>>,
    /// (event name, component position)
    listeners: Vec<(String, usize)>,
    /// (value name, component position)
    modifiers: Vec<(String, usize)>,
}

impl SimulationContext {
    pub fn new(config: SimulationConfig) -> Result<Self, WashoutError> {
        config.validate()?;
        let start_time = config.start_time()?;
        let step_size = config.step_size();
        Ok(Self {
            config,
            start_time,
            step_size,
            clock: Arc::new(SharedClock::new(start_time)),
            data: HashMap::new(),
            artifact: None,
            population: Arc::new(RwLock::new(DataFrame::empty())),
            values: HashMap::new(),
            disease_models: Vec::new(),
            components: Vec::new(),
            listeners: Vec::new(),
            modifiers: Vec::new(),
        })
    }

    /// Fall back to `artifact` for keys not added in memory.
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn add_data(&mut self, key: &str, df: DataFrame) {
        self.data.insert(key.to_string(), df);
    }

    pub fn register_value_source(&mut self, name: &str, source: Arc<dyn ValueSource>) {
        self.values.insert(name.to_string(), source);
    }

    /// Replace the population table. Views handed out earlier see the new
    /// table.
    pub fn set_population(&mut self, df: DataFrame) -> Result<(), WashoutError> {
        require_columns(&df, &[population::SIMULANT_ID])?;
        let mut table = self
            .population
            .write()
            .map_err(|_| WashoutError::General("Population table lock poisoned".into()))?;
        *table = df;
        Ok(())
    }

    /// Every simulant id in the population table.
    pub fn index(&self) -> Result<Vec<u32>, WashoutError> {
        let table = self
            .population
            .read()
            .map_err(|_| WashoutError::General("Population table lock poisoned".into()))?;
        if table.height() == 0 {
            return Ok(Vec::new());
        }
        let ids = table
            .column(population::SIMULANT_ID)?
            .cast(&DataType::UInt32)?;
        Ok(ids.u32()?.into_iter().flatten().collect())
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn set_time(&self, t: NaiveDateTime) {
        self.clock.set(t);
    }

    pub fn disease_models(&self) -> &[DiseaseModel] {
        &self.disease_models
    }

    pub fn disease_model(&self, cause: &str) -> Option<&DiseaseModel> {
        self.disease_models.iter().find(|m| m.cause() == cause)
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components.iter().map(|c| c.name()).collect()
    }

    /// Set up `component` and keep it for notifications. A failed setup
    /// leaves no registrations behind.
    pub fn add_component(&mut self, mut component: Box<dyn Component>) -> Result<(), WashoutError> {
        let name = component.name();
        if self.components.iter().any(|c| c.name() == name) {
            return Err(WashoutError::Configuration(format!(
                "Component {name} is already registered"
            )));
        }
        let position = self.components.len();
        let marks = (
            self.listeners.len(),
            self.modifiers.len(),
            self.disease_models.len(),
        );
        let result = {
            let mut scope = SetupScope {
                context: self,
                position,
            };
            component.setup(&mut scope)
        };
        if let Err(e) = result {
            self.listeners.truncate(marks.0);
            self.modifiers.truncate(marks.1);
            self.disease_models.truncate(marks.2);
            return Err(e);
        }
        debug!("Set up component {name}");
        self.components.push(component);
        Ok(())
    }

    /// Advance one step: fire `collect_metrics` for the step's end time, then
    /// move the clock there.
    pub fn step(&mut self) -> Result<(), WashoutError> {
        let event = Event {
            name: events::COLLECT_METRICS.to_string(),
            index: self.index()?,
            time: self.now() + self.step_size,
            step_size: self.step_size,
        };
        self.emit(&event)?;
        self.clock.set(event.time);
        Ok(())
    }

    /// Run `steps` steps.
    pub fn run_for(&mut self, steps: usize) -> Result<(), WashoutError> {
        for _ in 0..steps {
            self.step()?;
        }
        info!("Simulation clock at {}", self.now());
        Ok(())
    }

    pub fn emit(&mut self, event: &Event) -> Result<(), WashoutError> {
        let targets: Vec<usize> = self
            .listeners
            .iter()
            .filter(|(name, _)| *name == event.name)
            .map(|(_, position)| *position)
            .collect();
        for position in targets {
            self.components[position].on_event(event)?;
        }
        Ok(())
    }

    /// Assemble the `metrics` value over the whole population, applying
    /// modifiers in registration order.
    pub fn collect_metrics(&self) -> Result<MetricsMap, WashoutError> {
        let index = self.index()?;
        let mut metrics = MetricsMap::new();
        for (value, position) in &self.modifiers {
            if value == keys::METRICS {
                metrics = self.components[*position].modify_metrics(&index, metrics)?;
            }
        }
        Ok(metrics)
    }

    fn load_data(&self, key: &str) -> Result<DataFrame, WashoutError> {
        if let Some(df) = self.data.get(key) {
            return Ok(df.clone());
        }
        match &self.artifact {
            Some(artifact) if artifact.contains(key) => artifact.load(key),
            _ => Err(WashoutError::DataNotFound(key.to_string())),
        }
    }
}

/// The builder handed to one component during its setup.
struct SetupScope<'a> {
    context: &'a mut SimulationContext,
    position: usize,
}

impl Builder for SetupScope<'_> {
    fn configuration(&self) -> &SimulationConfig {
        &self.context.config
    }

    fn start_time(&self) -> NaiveDateTime {
        self.context.start_time
    }

    fn step_size(&self) -> TimeDelta {
        self.context.step_size
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.context.clock.clone()
    }

    fn load(&self, key: &str) -> Result<DataFrame, WashoutError> {
        self.context.load_data(key)
    }

    fn get_value(&self, name: &str) -> Result<Arc<dyn ValueSource>, WashoutError> {
        self.context
            .values
            .get(name)
            .cloned()
            .ok_or_else(|| WashoutError::ValueNotFound(name.to_string()))
    }

    fn register_value_modifier(&mut self, value_name: &str) {
        self.context
            .modifiers
            .push((value_name.to_string(), self.position));
    }

    fn population_view(&self, columns: &[&str]) -> Result<Arc<dyn PopulationView>, WashoutError> {
        Ok(Arc::new(TablePopulationView {
            table: self.context.population.clone(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }))
    }

    fn register_listener(&mut self, event_name: &str) {
        self.context
            .listeners
            .push((event_name.to_string(), self.position));
    }

    fn add_disease_model(&mut self, model: DiseaseModel) {
        self.context.disease_models.push(model);
    }

    fn causes_of_death(&self) -> Vec<String> {
        self.context
            .disease_models
            .iter()
            .map(|m| m.cause_of_death().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Registers everything it can, then fails.
    struct FailingSetup;

    impl Component for FailingSetup {
        fn name(&self) -> String {
            "failing_setup".to_string()
        }

        fn setup(&mut self, builder: &mut dyn Builder) -> Result<(), WashoutError> {
            builder.register_listener(events::COLLECT_METRICS);
            builder.register_value_modifier(keys::METRICS);
            builder.add_disease_model(DiseaseModel::new("asthma"));
            builder.load("cause.asthma.remission")?;
            Ok(())
        }

        fn on_event(&mut self, _event: &Event) -> Result<(), WashoutError> {
            Err(WashoutError::General("notified after failed setup".into()))
        }

        fn modify_metrics(&self, _index: &[u32], _metrics: MetricsMap) -> Result<MetricsMap, WashoutError> {
            Err(WashoutError::General("pulled after failed setup".into()))
        }
    }

    struct Counter;

    impl Component for Counter {
        fn name(&self) -> String {
            "counter".to_string()
        }

        fn setup(&mut self, builder: &mut dyn Builder) -> Result<(), WashoutError> {
            builder.register_value_modifier(keys::METRICS);
            Ok(())
        }

        fn modify_metrics(&self, index: &[u32], mut metrics: MetricsMap) -> Result<MetricsMap, WashoutError> {
            metrics.insert("simulants".to_string(), index.len() as f64);
            Ok(metrics)
        }
    }

    fn population(n: u32) -> DataFrame {
        let ids: Vec<u32> = (0..n).collect();
        DataFrame::new(vec![Column::new(population::SIMULANT_ID.into(), ids)]).unwrap()
    }

    #[test]
    fn test_failed_setup_leaves_no_registrations() {
        let mut ctx = SimulationContext::new(SimulationConfig::default()).unwrap();
        ctx.set_population(population(2)).unwrap();

        let err = ctx.add_component(Box::new(FailingSetup)).unwrap_err();
        assert!(matches!(err, WashoutError::DataNotFound(_)));
        assert!(ctx.component_names().is_empty());
        assert!(ctx.disease_models().is_empty());
        assert!(ctx.collect_metrics().unwrap().is_empty());
        ctx.step().unwrap();

        // A later component only gets what it asked for.
        ctx.add_component(Box::new(Counter)).unwrap();
        let metrics = ctx.collect_metrics().unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics["simulants"], 2.0);
        ctx.step().unwrap();
    }

    #[test]
    fn test_step_advances_clock() {
        let mut ctx = SimulationContext::new(SimulationConfig::default()).unwrap();
        let start = ctx.now();
        ctx.run_for(2).unwrap();
        assert_eq!(ctx.now(), start + TimeDelta::days(56));
    }

    #[test]
    fn test_value_source_skips_unknown_ids() {
        let source = TableValueSource::from_values(&[1, 2], &[20.0, 30.0]).unwrap();
        let df = source.get(&[2, 7]).unwrap();
        assert_eq!(df.height(), 1);
        assert_eq!(df.column("value").unwrap().f64().unwrap().get(0), Some(30.0));
    }
}
