//! Person-time, death and years-of-life-lost metrics over a cohort frame.
//!
//! Everything here is a pure function of its inputs. The observer decides
//! which rows form the cohort; these helpers only count.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate};
use polars::prelude::*;

use crate::builder::MetricsMap;
use crate::config::{to_micros, BmiMetricsConfig, MICROS_PER_YEAR};
use crate::error::WashoutError;
use crate::schema::{alive, lookup, metrics, population};

// ── Lookup tables ───────────────────────────────────────────────────────────

/// Reference life expectancy by age, as `[age_start, age_end)` bins.
#[derive(Debug, Clone, PartialEq)]
pub struct LifeExpectancy {
    bins: Vec<(f64, f64, f64)>,
}

impl LifeExpectancy {
    pub fn from_frame(df: &DataFrame) -> Result<Self, WashoutError> {
        let starts = f64_values(df, lookup::AGE_START)?;
        let ends = f64_values(df, lookup::AGE_END)?;
        let values = f64_values(df, lookup::VALUE)?;

        let mut bins = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            match (starts[i], ends[i], values[i]) {
                (Some(s), Some(e), Some(v)) if s < e => bins.push((s, e, v)),
                _ => {
                    return Err(WashoutError::InvalidData(format!(
                        "Malformed life expectancy row {i}"
                    )))
                }
            }
        }
        if bins.is_empty() {
            return Err(WashoutError::InvalidData("Empty life expectancy table".into()));
        }
        bins.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Self { bins })
    }

    /// Remaining life expectancy at `age`. Ages outside the table take the
    /// nearest bin.
    pub fn at(&self, age: f64) -> f64 {
        let (first, last) = (self.bins[0], self.bins[self.bins.len() - 1]);
        if age < first.0 {
            return first.2;
        }
        if age >= last.1 {
            return last.2;
        }
        self.bins
            .iter()
            .find(|(start, end, _)| *start <= age && age < *end)
            .map(|(_, _, v)| *v)
            // Gap between bins: fall back to the last bin starting below age.
            .unwrap_or_else(|| {
                self.bins
                    .iter()
                    .rev()
                    .find(|(start, _, _)| *start <= age)
                    .map(|(_, _, v)| *v)
                    .unwrap_or(first.2)
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgeGroup {
    pub name: String,
    pub start: f64,
    pub end: f64,
}

impl AgeGroup {
    pub fn contains(&self, age: f64) -> bool {
        self.start <= age && age < self.end
    }
}

pub fn age_groups_from_frame(df: &DataFrame) -> Result<Vec<AgeGroup>, WashoutError> {
    let starts = f64_values(df, lookup::AGE_START)?;
    let ends = f64_values(df, lookup::AGE_END)?;
    let names = df
        .column(lookup::AGE_GROUP_NAME)
        .map_err(|_| WashoutError::MissingColumn(lookup::AGE_GROUP_NAME.to_string()))?
        .str()?;

    let mut groups = Vec::with_capacity(df.height());
    for (i, name) in names.into_iter().enumerate() {
        match (starts[i], ends[i], name) {
            (Some(start), Some(end), Some(name)) => groups.push(AgeGroup {
                name: name.to_lowercase().replace(' ', "_"),
                start,
                end,
            }),
            _ => {
                return Err(WashoutError::InvalidData(format!(
                    "Malformed age bin row {i}"
                )))
            }
        }
    }
    groups.sort_by(|a, b| a.start.total_cmp(&b.start));
    Ok(groups)
}

// ── Stratification ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Stratification {
    pub by_year: bool,
    pub by_sex: bool,
    /// `Some` when stratifying by age.
    pub age_groups: Option<Vec<AgeGroup>>,
}

impl Stratification {
    pub fn from_config(config: &BmiMetricsConfig, age_groups: Option<Vec<AgeGroup>>) -> Self {
        Self {
            by_year: config.by_year,
            by_sex: config.by_sex,
            age_groups: if config.by_age { age_groups } else { None },
        }
    }
}

#[derive(Debug, Clone)]
struct Stratum<'a> {
    year: Option<(i32, i64, i64)>,
    sex: Option<&'a str>,
    age_group: Option<&'a AgeGroup>,
}

impl Stratum<'_> {
    fn suffix(&self) -> String {
        let mut s = String::new();
        if let Some((year, _, _)) = self.year {
            s.push_str(&format!("_in_{year}"));
        }
        if let Some(sex) = self.sex {
            s.push_str(&format!("_among_{}", sex.to_lowercase()));
        }
        if let Some(group) = self.age_group {
            s.push_str(&format!("_in_age_group_{}", group.name));
        }
        s
    }

    fn matches_sex(&self, record: &Record) -> bool {
        match self.sex {
            Some(sex) => record.sex.as_deref() == Some(sex),
            None => true,
        }
    }

    /// Person-years `record` contributes inside this stratum.
    fn person_time(&self, record: &Record) -> f64 {
        if !self.matches_sex(record) {
            return 0.0;
        }
        let (mut lo, mut hi) = (record.entrance, record.exit);
        if let Some((_, start, end)) = self.year {
            lo = lo.max(start);
            hi = hi.min(end);
        }
        if let Some(group) = self.age_group {
            let birth = record.exit - (record.age * MICROS_PER_YEAR) as i64;
            lo = lo.max(birth + (group.start * MICROS_PER_YEAR) as i64);
            hi = hi.min(birth + (group.end * MICROS_PER_YEAR) as i64);
        }
        (hi - lo).max(0) as f64 / MICROS_PER_YEAR
    }

    /// Whether a death recorded on `record` falls in this stratum.
    fn holds_death(&self, record: &Record) -> bool {
        if record.alive || !self.matches_sex(record) {
            return false;
        }
        if let Some((year, _, _)) = self.year {
            if year_of(record.exit) != Some(year) {
                return false;
            }
        }
        match self.age_group {
            Some(group) => group.contains(record.age),
            None => true,
        }
    }
}

// ── Cohort ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Record {
    alive: bool,
    entrance: i64,
    exit: i64,
    cause: Option<String>,
    age: f64,
    sex: Option<String>,
}

fn cohort_records(df: &DataFrame, with_sex: bool) -> Result<Vec<Record>, WashoutError> {
    let alive_col = df
        .column(population::ALIVE)
        .map_err(|_| WashoutError::MissingColumn(population::ALIVE.to_string()))?
        .str()?;
    let entrance = datetime_micros(df, population::ENTRANCE_TIME)?;
    let exit = datetime_micros(df, population::EXIT_TIME)?;
    let causes = df
        .column(population::CAUSE_OF_DEATH)
        .map_err(|_| WashoutError::MissingColumn(population::CAUSE_OF_DEATH.to_string()))?
        .cast(&DataType::String)?;
    let causes = causes.str()?;
    let ages = f64_values(df, population::AGE)?;
    let sexes: Option<Vec<Option<String>>> = if with_sex {
        let s = df
            .column(population::SEX)
            .map_err(|_| WashoutError::MissingColumn(population::SEX.to_string()))?
            .cast(&DataType::String)?;
        Some(s.str()?.into_iter().map(|v| v.map(|x| x.to_string())).collect())
    } else {
        None
    };

    let mut records = Vec::with_capacity(df.height());
    for (i, status) in alive_col.into_iter().enumerate() {
        let (Some(entrance), Some(exit)) = (entrance[i], exit[i]) else {
            return Err(WashoutError::InvalidData(format!(
                "Row {i} has no entrance or exit time"
            )));
        };
        let Some(age) = ages[i] else {
            return Err(WashoutError::InvalidData(format!("Row {i} has no age")));
        };
        records.push(Record {
            alive: status != Some(alive::DEAD),
            entrance,
            exit,
            cause: causes.get(i).map(|c| c.to_string()),
            age,
            sex: sexes.as_ref().and_then(|s| s[i].clone()),
        });
    }
    Ok(records)
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Mortality metrics for a fixed set of tracked causes.
#[derive(Debug, Clone)]
pub struct MortalityMetrics {
    /// Tracked causes followed by `other_causes`.
    causes: Vec<String>,
    life_expectancy: LifeExpectancy,
    stratification: Stratification,
}

impl MortalityMetrics {
    pub fn new(
        tracked_causes: &[String],
        life_expectancy: LifeExpectancy,
        stratification: Stratification,
    ) -> Self {
        let mut causes: Vec<String> = Vec::with_capacity(tracked_causes.len() + 1);
        for cause in tracked_causes {
            if cause != metrics::OTHER_CAUSES && !causes.contains(cause) {
                causes.push(cause.clone());
            }
        }
        causes.push(metrics::OTHER_CAUSES.to_string());
        Self {
            causes,
            life_expectancy,
            stratification,
        }
    }

    pub fn causes(&self) -> &[String] {
        &self.causes
    }

    pub fn life_expectancy(&self) -> &LifeExpectancy {
        &self.life_expectancy
    }

    /// The bucket a recorded cause of death is counted under.
    fn bucket<'a>(&'a self, cause: Option<&str>) -> &'a str {
        cause
            .and_then(|c| self.causes.iter().find(|t| t.as_str() == c))
            .map(|c| c.as_str())
            .unwrap_or(metrics::OTHER_CAUSES)
    }

    /// Person-time, deaths and YLLs for every stratum of `cohort`.
    ///
    /// `cohort` must already have non-null exit times.
    pub fn compute(&self, cohort: &DataFrame) -> Result<MetricsMap, WashoutError> {
        let records = cohort_records(cohort, self.stratification.by_sex)?;
        let strata = self.strata(&records)?;

        let mut out = MetricsMap::new();
        for stratum in &strata {
            let suffix = stratum.suffix();

            let person_time: f64 = records.iter().map(|r| stratum.person_time(r)).sum();
            out.insert(format!("{}{suffix}", metrics::PERSON_TIME), person_time);

            for cause in &self.causes {
                let mut deaths = 0.0;
                let mut ylls = 0.0;
                for r in records.iter().filter(|r| stratum.holds_death(r)) {
                    if self.bucket(r.cause.as_deref()) == cause.as_str() {
                        deaths += 1.0;
                        ylls += self.life_expectancy.at(r.age);
                    }
                }
                out.insert(format!("{}{suffix}", metrics::death_due_to(cause)), deaths);
                out.insert(format!("{}{suffix}", metrics::ylls_due_to(cause)), ylls);
            }
        }
        Ok(out)
    }

    fn strata<'a>(&'a self, records: &[Record]) -> Result<Vec<Stratum<'a>>, WashoutError> {
        let years: Vec<Option<(i32, i64, i64)>> = if self.stratification.by_year {
            let mut set = BTreeSet::new();
            for r in records {
                let (Some(first), Some(last)) = (year_of(r.entrance), year_of(r.exit)) else {
                    continue;
                };
                set.extend(first..=last);
            }
            set.into_iter()
                .map(|y| Ok(Some((y, year_start(y)?, year_start(y + 1)?))))
                .collect::<Result<_, WashoutError>>()?
        } else {
            vec![None]
        };
        let sexes: Vec<Option<&str>> = if self.stratification.by_sex {
            crate::schema::sex::ALL.iter().map(|s| Some(*s)).collect()
        } else {
            vec![None]
        };
        let ages: Vec<Option<&AgeGroup>> = match &self.stratification.age_groups {
            Some(groups) => groups.iter().map(Some).collect(),
            None => vec![None],
        };

        let mut strata = Vec::with_capacity(years.len() * sexes.len() * ages.len());
        for year in &years {
            for sex in &sexes {
                for age_group in &ages {
                    strata.push(Stratum {
                        year: *year,
                        sex: *sex,
                        age_group: *age_group,
                    });
                }
            }
        }
        Ok(strata)
    }
}

/// Unstratified totals over a whole population frame: YLLs already recorded
/// on the dead, living-and-tracked count, dead count.
pub fn population_totals(pop: &DataFrame) -> Result<MetricsMap, WashoutError> {
    for required in [population::ALIVE, population::TRACKED, population::YEARS_OF_LIFE_LOST] {
        if pop.column(required).is_err() {
            return Err(WashoutError::MissingColumn(required.to_string()));
        }
    }
    let dead = pop
        .clone()
        .lazy()
        .filter(col(population::ALIVE).eq(lit(alive::DEAD)))
        .collect()?;
    let living = pop
        .clone()
        .lazy()
        .filter(
            col(population::ALIVE)
                .eq(lit(alive::ALIVE))
                .and(col(population::TRACKED)),
        )
        .collect()?;

    let ylls = dead
        .column(population::YEARS_OF_LIFE_LOST)?
        .cast(&DataType::Float64)?
        .f64()?
        .sum()
        .unwrap_or(0.0);

    let mut out = MetricsMap::new();
    out.insert(metrics::YEARS_OF_LIFE_LOST.to_string(), ylls);
    out.insert(
        metrics::TOTAL_POPULATION_LIVING.to_string(),
        living.height() as f64,
    );
    out.insert(metrics::TOTAL_POPULATION_DEAD.to_string(), dead.height() as f64);
    Ok(out)
}

// ── Column helpers ──────────────────────────────────────────────────────────

fn f64_values(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, WashoutError> {
    let values = df
        .column(name)
        .map_err(|_| WashoutError::MissingColumn(name.to_string()))?
        .cast(&DataType::Float64)?;
    Ok(values.f64()?.into_iter().collect())
}

/// Datetime column as microseconds since the epoch.
pub(crate) fn datetime_micros(df: &DataFrame, name: &str) -> Result<Vec<Option<i64>>, WashoutError> {
    let values = df
        .column(name)
        .map_err(|_| WashoutError::MissingColumn(name.to_string()))?
        .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?
        .cast(&DataType::Int64)?;
    Ok(values.i64()?.into_iter().collect())
}

fn year_of(micros: i64) -> Option<i32> {
    DateTime::from_timestamp_micros(micros).map(|d| d.naive_utc().year())
}

fn year_start(year: i32) -> Result<i64, WashoutError> {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(to_micros)
        .ok_or_else(|| WashoutError::InvalidData(format!("Year {year} out of range")))
}
