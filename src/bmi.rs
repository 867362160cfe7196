use std::fmt;

use polars::prelude::*;

use crate::error::WashoutError;
use crate::schema::exposure;

/// Category boundaries in kg/m². Each category is `[lower, upper)`.
pub const CUT_POINTS: [f64; 7] = [15.0, 18.5, 25.0, 30.0, 35.0, 40.0, 60.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BmiCategory {
    Underweight,
    Normal,
    Overweight,
    ObesityGrade1,
    ObesityGrade2,
    ObesityGrade3,
}

impl BmiCategory {
    /// Iteration order for reporting.
    pub const ALL: [BmiCategory; 6] = [
        BmiCategory::Underweight,
        BmiCategory::Normal,
        BmiCategory::Overweight,
        BmiCategory::ObesityGrade1,
        BmiCategory::ObesityGrade2,
        BmiCategory::ObesityGrade3,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BmiCategory::Underweight => "underweight",
            BmiCategory::Normal => "normal",
            BmiCategory::Overweight => "overweight",
            BmiCategory::ObesityGrade1 => "obesity_grade_1",
            BmiCategory::ObesityGrade2 => "obesity_grade_2",
            BmiCategory::ObesityGrade3 => "obesity_grade_3",
        }
    }

    /// `(lower, upper)` bounds of this category.
    pub fn bounds(&self) -> (f64, f64) {
        let i = *self as usize;
        (CUT_POINTS[i], CUT_POINTS[i + 1])
    }

    /// The category containing `bmi`, or `None` when it falls outside
    /// `[15, 60)` or is not a number.
    pub fn categorize(bmi: f64) -> Option<BmiCategory> {
        if !bmi.is_finite() {
            return None;
        }
        Self::ALL.into_iter().find(|c| {
            let (lower, upper) = c.bounds();
            lower <= bmi && bmi < upper
        })
    }

    pub fn from_name(name: &str) -> Option<BmiCategory> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for BmiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Add a `bmi_category` string column computed from `value_column`.
/// Unclassified or null exposures get a null category.
pub fn with_category_column(df: DataFrame, value_column: &str) -> Result<DataFrame, WashoutError> {
    let values = df
        .column(value_column)
        .map_err(|_| WashoutError::MissingColumn(value_column.to_string()))?
        .cast(&DataType::Float64)?;
    let categories: Vec<Option<&'static str>> = values
        .f64()?
        .into_iter()
        .map(|v| v.and_then(BmiCategory::categorize).map(|c| c.name()))
        .collect();

    let mut df = df;
    df.with_column(Column::new(exposure::BMI_CATEGORY.into(), categories))?;
    Ok(df)
}
