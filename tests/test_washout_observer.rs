//! Washout observer driven through the in-process context.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use polars::prelude::*;

use obesity_washout::builder::{Builder, Component};
use obesity_washout::config::{to_micros, CalendarDate, SimulationConfig, MICROS_PER_YEAR};
use obesity_washout::context::{SimulationContext, TableValueSource};
use obesity_washout::disease::DiseaseModel;
use obesity_washout::mortality::{LifeExpectancy, MortalityMetrics, Stratification};
use obesity_washout::schema::{keys, lookup, population};
use obesity_washout::{MetricsMap, WashoutError, WashoutObserver, WashoutReport};

fn t(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn years_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    (to_micros(to) - to_micros(from)) as f64 / MICROS_PER_YEAR
}

struct Person {
    bmi: f64,
    entrance: NaiveDateTime,
    /// `None` while alive.
    exit: Option<NaiveDateTime>,
    cause: Option<&'static str>,
    age: f64,
    sex: &'static str,
}

impl Person {
    fn alive(bmi: f64) -> Self {
        Self {
            bmi,
            entrance: t(2000, 1, 1),
            exit: None,
            cause: None,
            age: 40.0,
            sex: "Female",
        }
    }

    fn dead(bmi: f64, exit: NaiveDateTime, cause: &'static str) -> Self {
        Self {
            bmi,
            entrance: t(2000, 1, 1),
            exit: Some(exit),
            cause: Some(cause),
            age: 60.0,
            sex: "Male",
        }
    }
}

fn datetime_column(name: &str, values: Vec<Option<NaiveDateTime>>) -> Column {
    let micros: Vec<Option<i64>> = values.into_iter().map(|v| v.map(to_micros)).collect();
    Column::new(name.into(), micros)
        .cast(&DataType::Datetime(TimeUnit::Microseconds, None))
        .unwrap()
}

fn ids(people: &[Person]) -> Vec<u32> {
    (0..people.len() as u32).collect()
}

fn population_frame(people: &[Person]) -> DataFrame {
    let alive: Vec<&str> = people
        .iter()
        .map(|p| if p.exit.is_some() { "dead" } else { "alive" })
        .collect();
    let tracked: Vec<bool> = people.iter().map(|_| true).collect();
    let causes: Vec<Option<&str>> = people.iter().map(|p| p.cause).collect();
    let ylls: Vec<f64> = people
        .iter()
        .map(|p| if p.exit.is_some() { 20.0 } else { 0.0 })
        .collect();
    let ages: Vec<f64> = people.iter().map(|p| p.age).collect();
    let sexes: Vec<&str> = people.iter().map(|p| p.sex).collect();

    DataFrame::new(vec![
        Column::new(population::SIMULANT_ID.into(), ids(people)),
        Column::new(population::ALIVE.into(), alive),
        Column::new(population::TRACKED.into(), tracked),
        datetime_column(
            population::ENTRANCE_TIME,
            people.iter().map(|p| Some(p.entrance)).collect(),
        ),
        datetime_column(population::EXIT_TIME, people.iter().map(|p| p.exit).collect()),
        Column::new(population::CAUSE_OF_DEATH.into(), causes),
        Column::new(population::YEARS_OF_LIFE_LOST.into(), ylls),
        Column::new(population::AGE.into(), ages),
        Column::new(population::SEX.into(), sexes),
    ])
    .unwrap()
}

fn life_expectancy_frame() -> DataFrame {
    DataFrame::new(vec![
        Column::new(lookup::AGE_START.into(), [0.0, 50.0]),
        Column::new(lookup::AGE_END.into(), [50.0, 125.0]),
        Column::new(lookup::VALUE.into(), [60.0, 20.0]),
    ])
    .unwrap()
}

/// Registers an empty disease model so deaths from `cause` are tracked.
struct TrackedCause(&'static str);

impl Component for TrackedCause {
    fn name(&self) -> String {
        format!("tracked.{}", self.0)
    }

    fn setup(&mut self, builder: &mut dyn Builder) -> Result<(), WashoutError> {
        builder.add_disease_model(DiseaseModel::new(self.0));
        Ok(())
    }
}

/// Data, population and BMI exposure, but no components yet.
fn base_context(config: SimulationConfig, people: &[Person]) -> Result<SimulationContext, WashoutError> {
    let mut ctx = SimulationContext::new(config)?;
    ctx.add_data(keys::LIFE_EXPECTANCY, life_expectancy_frame());
    ctx.set_population(population_frame(people))?;
    let bmis: Vec<f64> = people.iter().map(|p| p.bmi).collect();
    ctx.register_value_source(
        keys::BMI_EXPOSURE,
        Arc::new(TableValueSource::from_values(&ids(people), &bmis)?),
    );
    Ok(ctx)
}

fn context_with(
    config: SimulationConfig,
    people: &[Person],
    tracked: &[&'static str],
) -> Result<SimulationContext, WashoutError> {
    let mut ctx = base_context(config, people)?;
    for cause in tracked {
        ctx.add_component(Box::new(TrackedCause(cause)))?;
    }
    ctx.add_component(Box::new(WashoutObserver::new()))?;
    Ok(ctx)
}

fn metrics_at(people: &[Person], clock: NaiveDateTime) -> MetricsMap {
    let ctx = context_with(SimulationConfig::default(), people, &[]).unwrap();
    ctx.set_time(clock);
    ctx.collect_metrics().unwrap()
}

fn sum_over_categories(metrics: &MetricsMap, prefix: &str) -> f64 {
    metrics
        .iter()
        .filter(|(k, _)| k.starts_with(&format!("{prefix}_among_")))
        .map(|(_, v)| v)
        .sum()
}

#[test]
fn test_setup_fails_when_program_starts_before_simulation() {
    let mut config = SimulationConfig::default();
    config.time.start = CalendarDate::new(2001, 1, 1);
    config.time.end = CalendarDate::new(2010, 12, 31);

    let err = context_with(config, &[Person::alive(22.0)], &[]).err().unwrap();
    match err {
        WashoutError::Configuration(msg) => {
            assert!(msg.contains("2001-01-01"), "{msg}");
            assert!(msg.contains("2000-07-09"), "{msg}");
        }
        other => panic!("expected configuration error, got {other:?}"),
    }
}

#[test]
fn test_washout_period_end_uses_average_year() {
    let config = SimulationConfig::default();
    let le = LifeExpectancy::from_frame(&life_expectancy_frame()).unwrap();
    let mortality = MortalityMetrics::new(&[], le, Stratification::default());
    let report = WashoutReport::new(&config.metrics.bmi, t(2000, 1, 1), mortality).unwrap();

    assert_eq!(report.program_start(), t(2000, 7, 9));
    assert_eq!(
        report.washout_period_end(),
        t(2000, 7, 9) + TimeDelta::seconds(5 * 31_557_600)
    );
    assert_eq!(report.washout_period_end(), t(2005, 7, 9) + TimeDelta::hours(6));
}

#[test]
fn test_exit_dates_around_cutoff() {
    let people = [
        Person::dead(27.0, t(2005, 7, 1), "road_injuries"),
        Person::dead(27.0, t(2005, 7, 10), "road_injuries"),
    ];
    let metrics = metrics_at(&people, t(2006, 1, 1));

    assert_eq!(metrics["death_due_to_other_causes_among_overweight"], 1.0);
    assert_eq!(metrics["ylls_due_to_other_causes_among_overweight"], 20.0);
    let expected = years_between(t(2000, 1, 1), t(2005, 7, 1));
    assert!((metrics["person_time_among_overweight"] - expected).abs() < 1e-9);

    // The late exit is missing from the totals too.
    assert_eq!(metrics["total_population_dead"], 1.0);
    assert_eq!(metrics["years_of_life_lost"], 20.0);
}

#[test]
fn test_three_people_fill_three_categories() {
    let people = [Person::alive(20.0), Person::alive(27.0), Person::alive(45.0)];
    let clock = t(2002, 1, 1);
    let metrics = metrics_at(&people, clock);

    let expected = years_between(t(2000, 1, 1), clock);
    for category in ["normal", "overweight", "obesity_grade_3"] {
        let pt = metrics[&format!("person_time_among_{category}")];
        assert!((pt - expected).abs() < 1e-9, "{category}: {pt}");
        assert_eq!(metrics[&format!("death_due_to_other_causes_among_{category}")], 0.0);
    }
    for category in ["underweight", "obesity_grade_1", "obesity_grade_2"] {
        assert!(
            metrics.keys().all(|k| !k.ends_with(&format!("_among_{category}"))),
            "{category} should be empty"
        );
    }
    assert_eq!(metrics["total_population_living"], 3.0);
    assert_eq!(metrics["total_population_dead"], 0.0);
    assert_eq!(metrics.len(), 12);
}

#[test]
fn test_washout_exclusion_is_absolute() {
    let people = [
        Person::dead(16.0, t(2006, 2, 1), "chronic_kidney_disease"),
        Person::alive(32.0),
        Person::dead(22.0, t(2003, 3, 1), "chronic_kidney_disease"),
    ];
    // Past the cutoff the living exit too late as well.
    let metrics = metrics_at(&people, t(2007, 1, 1));

    assert!(metrics.keys().all(|k| !k.ends_with("_among_underweight")));
    assert!(metrics.keys().all(|k| !k.ends_with("_among_obesity_grade_1")));
    assert_eq!(metrics["death_due_to_other_causes_among_normal"], 1.0);
    assert_eq!(metrics["total_population_living"], 0.0);
    assert_eq!(metrics["total_population_dead"], 1.0);
    assert_eq!(metrics["years_of_life_lost"], 20.0);

    // Before the cutoff the living person counts.
    let metrics = metrics_at(&people, t(2004, 1, 1));
    let expected = years_between(t(2000, 1, 1), t(2004, 1, 1));
    assert!((metrics["person_time_among_obesity_grade_1"] - expected).abs() < 1e-9);
    assert_eq!(metrics["total_population_living"], 1.0);
}

#[test]
fn test_totals_ignore_exits_after_cutoff() {
    let people = [Person::dead(27.0, t(2005, 7, 10), "road_injuries")];
    let metrics = metrics_at(&people, t(2006, 1, 1));

    assert_eq!(metrics["total_population_dead"], 0.0);
    assert_eq!(metrics["total_population_living"], 0.0);
    assert_eq!(metrics["years_of_life_lost"], 0.0);
    assert_eq!(metrics.len(), 3);
}

#[test]
fn test_categories_partition_the_cohort() {
    let people = [
        Person::dead(15.0, t(2001, 4, 1), "chronic_kidney_disease"),
        Person::dead(18.5, t(2002, 5, 1), "road_injuries"),
        Person::dead(24.9, t(2003, 6, 1), "chronic_kidney_disease"),
        Person::dead(25.0, t(2003, 7, 1), "diabetes_mellitus_type_2"),
        Person::dead(33.3, t(2004, 8, 1), "chronic_kidney_disease"),
        Person::dead(38.0, t(2004, 9, 1), "road_injuries"),
        Person::dead(59.9, t(2005, 1, 1), "chronic_kidney_disease"),
    ];
    let tracked = ["chronic_kidney_disease"];
    let ctx = context_with(SimulationConfig::default(), &people, &tracked).unwrap();
    ctx.set_time(t(2005, 6, 1));
    let stratified = ctx.collect_metrics().unwrap();

    let le = LifeExpectancy::from_frame(&life_expectancy_frame()).unwrap();
    let flat = MortalityMetrics::new(
        &tracked.map(String::from),
        le,
        Stratification::default(),
    )
    .compute(&population_frame(&people))
    .unwrap();

    for (key, total) in &flat {
        let summed = sum_over_categories(&stratified, key);
        assert!((summed - total).abs() < 1e-9, "{key}: {summed} vs {total}");
    }
    assert_eq!(flat["death_due_to_chronic_kidney_disease"], 4.0);
    assert_eq!(flat["death_due_to_other_causes"], 3.0);
}

#[test]
fn test_unclassified_bmi_is_dropped() {
    let people = [
        Person::dead(14.9, t(2001, 1, 1), "road_injuries"),
        Person::dead(60.0, t(2001, 1, 1), "road_injuries"),
        Person::dead(24.9, t(2001, 1, 1), "road_injuries"),
    ];
    let metrics = metrics_at(&people, t(2002, 1, 1));
    assert_eq!(sum_over_categories(&metrics, "death_due_to_other_causes"), 1.0);
    assert_eq!(metrics["death_due_to_other_causes_among_normal"], 1.0);
}

#[test]
fn test_repeated_pulls_are_identical() {
    let people = [
        Person::alive(20.0),
        Person::dead(31.0, t(2003, 1, 1), "road_injuries"),
    ];
    let mut ctx = context_with(SimulationConfig::default(), &people, &[]).unwrap();
    ctx.run_for(3).unwrap();
    let first = ctx.collect_metrics().unwrap();
    let second = ctx.collect_metrics().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_missing_bmi_exposure_propagates() {
    let people = [Person::alive(20.0), Person::alive(27.0)];
    let mut ctx = SimulationContext::new(SimulationConfig::default()).unwrap();
    ctx.add_data(keys::LIFE_EXPECTANCY, life_expectancy_frame());
    ctx.set_population(population_frame(&people)).unwrap();

    let err = ctx.add_component(Box::new(WashoutObserver::new())).unwrap_err();
    assert!(matches!(err, WashoutError::ValueNotFound(_)));

    ctx.register_value_source(
        keys::BMI_EXPOSURE,
        Arc::new(TableValueSource::from_values(&[0], &[20.0]).unwrap()),
    );
    ctx.add_component(Box::new(WashoutObserver::new())).unwrap();
    assert!(matches!(
        ctx.collect_metrics(),
        Err(WashoutError::InvalidData(_))
    ));
}

#[test]
fn test_sex_stratification_keys() {
    let mut config = SimulationConfig::default();
    config.metrics.bmi.by_sex = true;
    let people = [
        Person::alive(22.0),
        Person::dead(22.0, t(2002, 1, 1), "road_injuries"),
    ];
    let ctx = context_with(config, &people, &[]).unwrap();
    ctx.set_time(t(2003, 1, 1));
    let metrics = ctx.collect_metrics().unwrap();

    assert_eq!(metrics["death_due_to_other_causes_among_male_among_normal"], 1.0);
    assert_eq!(metrics["death_due_to_other_causes_among_female_among_normal"], 0.0);
    let expected = years_between(t(2000, 1, 1), t(2003, 1, 1));
    assert!((metrics["person_time_among_female_among_normal"] - expected).abs() < 1e-9);
}

fn age_bins_frame() -> DataFrame {
    DataFrame::new(vec![
        Column::new(lookup::AGE_START.into(), [0.0, 50.0]),
        Column::new(lookup::AGE_END.into(), [50.0, 125.0]),
        Column::new(lookup::AGE_GROUP_NAME.into(), ["Early Adult", "Late Adult"]),
    ])
    .unwrap()
}

#[test]
fn test_age_stratification_needs_age_bins() {
    let mut config = SimulationConfig::default();
    config.metrics.bmi.by_age = true;

    let err = context_with(config, &[Person::alive(22.0)], &[]).err().unwrap();
    match err {
        WashoutError::DataNotFound(key) => assert!(key.contains(keys::AGE_BINS), "{key}"),
        other => panic!("expected missing age bins, got {other:?}"),
    }
}

#[test]
fn test_age_group_keys() {
    let mut config = SimulationConfig::default();
    config.metrics.bmi.by_age = true;
    // Person::alive is 40, Person::dead is 60 at exit.
    let people = [
        Person::alive(22.0),
        Person::dead(22.0, t(2001, 1, 1), "road_injuries"),
    ];
    let mut ctx = base_context(config, &people).unwrap();
    ctx.add_data(keys::AGE_BINS, age_bins_frame());
    ctx.add_component(Box::new(WashoutObserver::new())).unwrap();
    ctx.set_time(t(2002, 1, 1));
    let metrics = ctx.collect_metrics().unwrap();

    assert_eq!(
        metrics["death_due_to_other_causes_in_age_group_late_adult_among_normal"],
        1.0
    );
    assert_eq!(
        metrics["death_due_to_other_causes_in_age_group_early_adult_among_normal"],
        0.0
    );
    assert_eq!(
        metrics["ylls_due_to_other_causes_in_age_group_late_adult_among_normal"],
        20.0
    );
    let early = metrics["person_time_in_age_group_early_adult_among_normal"];
    let late = metrics["person_time_in_age_group_late_adult_among_normal"];
    assert!((early - years_between(t(2000, 1, 1), t(2002, 1, 1))).abs() < 1e-9);
    assert!((late - years_between(t(2000, 1, 1), t(2001, 1, 1))).abs() < 1e-9);
    assert!(metrics.keys().all(|k| k.contains("_in_age_group_") || !k.contains("_among_")));
}
