#![warn(missing_docs)]
//! benchflow stats - reduction of captured values
//!
//! Turns the ordered capture sequences produced by the analyzer into the
//! suffixed statistics (`_first`, `_last`, `_min`, `_max`, `_avg`, `_std`,
//! `_sum`, `_cnt`) exposed to result tables.

mod reduce;

pub use reduce::{reduce_captures, reduce_numeric, NumericReduction, Reduction, Statistic};
