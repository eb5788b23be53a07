#![warn(missing_docs)]
//! benchflow report - result rendering back-ends
//!
//! Consumes the analyzer's row sets and renders them as tables
//! (csv/pretty/aligned), syslog datagrams, or SQLite rows, with a shared
//! typed sort/filter/format layer.

mod database;
mod row;
mod syslog;
mod table;

pub use database::write_database;
pub use row::{filter_rows, format_value, sort_rows, Row};
pub use syslog::emit_syslog;
pub use table::render_table;
