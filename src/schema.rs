/// Column-name and data-key constants for the washout study.
/// Single source of truth - shared by the observer, the engine backing
/// and the artifact builder.

// ── Population columns ──────────────────────────────────────────────────────
pub mod population {
    pub const SIMULANT_ID: &str = "simulant_id";
    pub const ALIVE: &str = "alive";
    pub const TRACKED: &str = "tracked";
    pub const ENTRANCE_TIME: &str = "entrance_time";
    pub const EXIT_TIME: &str = "exit_time";
    pub const CAUSE_OF_DEATH: &str = "cause_of_death";
    pub const YEARS_OF_LIFE_LOST: &str = "years_of_life_lost";
    pub const AGE: &str = "age";
    pub const SEX: &str = "sex";

    pub const MORTALITY_COLUMNS: [&str; 8] = [
        SIMULANT_ID,
        ALIVE,
        TRACKED,
        ENTRANCE_TIME,
        EXIT_TIME,
        CAUSE_OF_DEATH,
        YEARS_OF_LIFE_LOST,
        AGE,
    ];
}

// ── Alive status values ─────────────────────────────────────────────────────
pub mod alive {
    pub const ALIVE: &str = "alive";
    pub const DEAD: &str = "dead";
}

// ── Sex values ──────────────────────────────────────────────────────────────
pub mod sex {
    pub const MALE: &str = "Male";
    pub const FEMALE: &str = "Female";

    pub const ALL: [&str; 2] = [MALE, FEMALE];
}

// ── Value-source columns (exposures) ────────────────────────────────────────
pub mod exposure {
    pub const VALUE: &str = "value";
    pub const BMI_CATEGORY: &str = "bmi_category";
}

// ── Lookup-table columns ────────────────────────────────────────────────────
pub mod lookup {
    pub const AGE_START: &str = "age_start";
    pub const AGE_END: &str = "age_end";
    pub const AGE_GROUP_NAME: &str = "age_group_name";
    pub const VALUE: &str = "value";
    pub const LOCATION: &str = "location";
}

// ── Named data series and values ────────────────────────────────────────────
pub mod keys {
    pub const LIFE_EXPECTANCY: &str = "population.theoretical_minimum_risk_life_expectancy";
    pub const AGE_BINS: &str = "population.age_bins";
    pub const BMI_EXPOSURE: &str = "high_body_mass_index_in_adults.exposure";
    pub const METRICS: &str = "metrics";

    /// `cause.<name>.<measure>`
    pub fn cause(name: &str, measure: &str) -> String {
        format!("cause.{name}.{measure}")
    }
}

// ── Event names ─────────────────────────────────────────────────────────────
pub mod events {
    pub const COLLECT_METRICS: &str = "collect_metrics";
}

// ── Metric names ────────────────────────────────────────────────────────────
pub mod metrics {
    pub const PERSON_TIME: &str = "person_time";
    pub const YEARS_OF_LIFE_LOST: &str = "years_of_life_lost";
    pub const TOTAL_POPULATION_LIVING: &str = "total_population_living";
    pub const TOTAL_POPULATION_DEAD: &str = "total_population_dead";
    pub const OTHER_CAUSES: &str = "other_causes";

    pub fn death_due_to(cause: &str) -> String {
        format!("death_due_to_{cause}")
    }

    pub fn ylls_due_to(cause: &str) -> String {
        format!("ylls_due_to_{cause}")
    }
}
