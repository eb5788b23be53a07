//! Statistical reduction of capture sequences.
//!
//! Each pattern yields an ordered sequence of captured strings per file.
//! Reduction exposes the suffixed variants consumed by result tables:
//! `_first` (the default when the bare name is used), `_last`, `_cnt`, and
//! for numeric patterns `_min`, `_max`, `_avg`, `_std`, `_sum`.
//! The standard deviation is the sample standard deviation (division by
//! n−1), zero for one or fewer values.

/// Statistic selector corresponding to a pattern name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    /// First captured value (bare-name default).
    First,
    /// Last captured value.
    Last,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Arithmetic mean.
    Avg,
    /// Sample standard deviation.
    Std,
    /// Sum.
    Sum,
    /// Number of captures.
    Cnt,
}

impl Statistic {
    /// All statistics in canonical suffix order.
    pub const ALL: [Statistic; 8] = [
        Statistic::First,
        Statistic::Last,
        Statistic::Min,
        Statistic::Max,
        Statistic::Avg,
        Statistic::Std,
        Statistic::Sum,
        Statistic::Cnt,
    ];

    /// Suffix appended to the pattern name, without the underscore.
    pub fn suffix(&self) -> &'static str {
        match self {
            Statistic::First => "first",
            Statistic::Last => "last",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::Avg => "avg",
            Statistic::Std => "std",
            Statistic::Sum => "sum",
            Statistic::Cnt => "cnt",
        }
    }

    /// Parse a suffix (without underscore).
    pub fn from_suffix(suffix: &str) -> Option<Statistic> {
        Statistic::ALL.iter().copied().find(|s| s.suffix() == suffix)
    }

    /// Whether this statistic requires a numeric pattern type.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Statistic::Min | Statistic::Max | Statistic::Avg | Statistic::Std | Statistic::Sum
        )
    }
}

/// Numeric reduction over parsed values.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericReduction {
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Arithmetic mean.
    pub avg: f64,
    /// Sample standard deviation (n−1), 0 for n ≤ 1.
    pub std: f64,
    /// Sum.
    pub sum: f64,
}

/// Reduce a non-empty slice of numeric values.
pub fn reduce_numeric(values: &[f64]) -> Option<NumericReduction> {
    if values.is_empty() {
        return None;
    }
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    for &v in values {
        min = min.min(v);
        max = max.max(v);
        sum += v;
    }
    let avg = sum / values.len() as f64;
    let std = if values.len() < 2 {
        0.0
    } else {
        let variance =
            values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
        variance.sqrt()
    };
    Some(NumericReduction {
        min,
        max,
        avg,
        std,
        sum,
    })
}

/// Full reduction of a capture sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    /// Captures in match order.
    pub captures: Vec<String>,
    /// Numeric reduction, present when every capture parsed as a number.
    pub numeric: Option<NumericReduction>,
}

/// Reduce an ordered capture sequence. `numeric` asks for the numeric
/// statistics; they are omitted when any capture fails to parse.
pub fn reduce_captures(captures: &[String], numeric: bool) -> Reduction {
    let numeric = if numeric && !captures.is_empty() {
        captures
            .iter()
            .map(|c| c.trim().parse::<f64>().ok())
            .collect::<Option<Vec<f64>>>()
            .and_then(|values| reduce_numeric(&values))
    } else {
        None
    };
    Reduction {
        captures: captures.to_vec(),
        numeric,
    }
}

impl Reduction {
    /// Number of captures.
    pub fn count(&self) -> usize {
        self.captures.len()
    }

    /// Value of one statistic, rendered as display text.
    ///
    /// `integral` renders min/max/sum without a fractional part (for
    /// integer-typed patterns); avg and std always render as floats.
    pub fn value(&self, statistic: Statistic, integral: bool) -> Option<String> {
        match statistic {
            Statistic::First => self.captures.first().cloned(),
            Statistic::Last => self.captures.last().cloned(),
            Statistic::Cnt => Some(self.count().to_string()),
            _ => {
                let numeric = self.numeric.as_ref()?;
                let raw = match statistic {
                    Statistic::Min => numeric.min,
                    Statistic::Max => numeric.max,
                    Statistic::Avg => numeric.avg,
                    Statistic::Std => numeric.std,
                    Statistic::Sum => numeric.sum,
                    _ => unreachable!("non-numeric handled above"),
                };
                if integral && matches!(statistic, Statistic::Min | Statistic::Max | Statistic::Sum)
                {
                    Some(format!("{}", raw as i64))
                } else {
                    Some(format_float(raw))
                }
            }
        }
    }
}

/// Render a float without trailing noise (`3` instead of `3.0` only when
/// the value is integral would be lossy for averages, so keep one canonical
/// float form).
fn format_float(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}
