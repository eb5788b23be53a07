//! End-to-end scenarios for benchflow.
//!
//! Each test loads a YAML configuration, runs the benchmark inside a
//! temporary directory, and checks the analyzer/result output.

use benchflow::{analyse, build_rows, AnalysisData, Benchmark, RunContext, WpState};
use benchflow_cli::load_config;
use benchflow_core::{DatabaseSpec, ResultKind};
use benchflow_report::{render_table, write_database};
use std::path::{Path, PathBuf};

/// Write a config file into a sandbox and run the benchmark to completion
/// (or as far as sentinels allow).
fn run_benchmark(dir: &Path, yaml: &str) -> (Benchmark, RunContext) {
    let config_path = dir.join("bench.yaml");
    std::fs::write(&config_path, yaml).unwrap();
    let ctx = RunContext::default();
    let loaded = load_config(&config_path, &ctx).unwrap();
    let outpath = dir.join(&loaded.config.outpath);
    let mut benchmark =
        Benchmark::create(loaded.config, &outpath, None, &loaded.file_dir, &ctx).unwrap();
    benchmark.build_workpackages(&ctx).unwrap();
    benchflow_engine::run(&mut benchmark, &ctx).unwrap();
    (benchmark, ctx)
}

fn continue_benchmark(outpath: &Path, id: u32, ctx: &RunContext) -> Benchmark {
    let mut benchmark = Benchmark::load(outpath, id, ctx).unwrap();
    benchflow_engine::run(&mut benchmark, ctx).unwrap();
    benchmark
}

fn analyzer_rows(benchmark: &Benchmark, ctx: &RunContext, analyzer: &str) -> benchflow::RowSet {
    let data = analyse(benchmark, ctx, None).unwrap();
    build_rows(
        benchmark,
        &data,
        &benchmark.config.analyzers[analyzer],
    )
}

const SIMPLE_EXPANSION: &str = r#"
benchmark:
  name: simple
  outpath: runs
  parameterset:
    - name: numbers
      parameter:
        - { name: number, type: int, value: "1,2,4" }
  step:
    - name: echo
      use: [numbers]
      do: [ 'echo "Number: $number"' ]
  patternset:
    - name: pats
      pattern:
        - { name: number_pat, type: int, value: "Number: $jube_pat_int" }
  analyser:
    - name: scan
      use: [pats]
      analyse:
        - step: echo
          file: [stdout]
  result:
    - name: numbers_table
      use: [scan]
      table:
        style: csv
        sort: number
        column: [number, number_pat]
"#;

/// Scenario 1: three parameter alternatives produce three result rows.
#[test]
fn simple_expansion_produces_three_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (benchmark, ctx) = run_benchmark(dir.path(), SIMPLE_EXPANSION);
    assert_eq!(benchmark.workpackages["echo"].len(), 3);

    let rows = analyzer_rows(&benchmark, &ctx, "scan");
    assert_eq!(rows.rows.len(), 3);

    let table = match &benchmark.config.results[0].kind {
        ResultKind::Table(spec) => render_table(&rows, spec).unwrap(),
        other => panic!("expected table, got {other:?}"),
    };
    assert_eq!(table, "number,number_pat\n1,1\n2,2\n4,4\n");

    // Rendering from persisted state is reproducible byte for byte.
    let again = analyzer_rows(&benchmark, &ctx, "scan");
    let table2 = match &benchmark.config.results[0].kind {
        ResultKind::Table(spec) => render_table(&again, spec).unwrap(),
        other => panic!("expected table, got {other:?}"),
    };
    assert_eq!(table, table2);
}

/// Scenario 2: the database back-end creates the SQLite file on first run
/// and upserts on the second, keeping three rows.
#[test]
fn result_database_upserts() {
    let dir = tempfile::tempdir().unwrap();
    let (benchmark, ctx) = run_benchmark(dir.path(), SIMPLE_EXPANSION);
    let rows = analyzer_rows(&benchmark, &ctx, "scan");

    let file = dir.path().join("result_database.dat");
    let spec = DatabaseSpec {
        file: file.display().to_string(),
        table: "results".to_string(),
        keys: vec!["number".to_string(), "number_pat".to_string()],
        primekeys: vec!["number".to_string(), "number_pat".to_string()],
        filter: None,
    };
    assert_eq!(write_database(&rows, &spec).unwrap(), 3);
    assert!(file.exists());
    assert_eq!(write_database(&rows, &spec).unwrap(), 3);

    let connection = rusqlite_open(&file);
    let count: i64 = connection
        .query_row("SELECT COUNT(*) FROM results", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 3);
}

fn rusqlite_open(path: &Path) -> rusqlite::Connection {
    rusqlite::Connection::open(path).unwrap()
}

/// Scenario 3: a dependent step sees its exporting parent's environment;
/// every second-step workpackage prints its own parent's number.
#[test]
fn dependency_with_export() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
benchmark:
  name: dep
  outpath: runs
  parameterset:
    - name: numbers
      parameter:
        - { name: number, type: int, value: "1,2,4" }
  step:
    - name: first
      use: [numbers]
      export: true
      do: [ "export X=$number" ]
    - name: second
      depend: first
      do: [ 'echo "X=$X"' ]
"#;
    let (benchmark, _ctx) = run_benchmark(dir.path(), yaml);
    let seconds = &benchmark.workpackages["second"];
    assert_eq!(seconds.len(), 3);
    for wp in seconds {
        assert_eq!(wp.state, WpState::Done);
        let parent = benchmark.workpackage(wp.parents[0]).unwrap();
        let stdout = wp.work_dir(&benchmark.bench_dir).join("stdout");
        let content = std::fs::read_to_string(stdout).unwrap();
        assert_eq!(
            content.trim(),
            format!("X={}", parent.point["number"].value)
        );
    }
}

/// Scenario 4: an async operation leaves the workpackage awaiting its
/// sentinel; touching the done file completes it on continue, an error
/// file fails it.
#[test]
fn async_job_sentinels() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
benchmark:
  name: async
  outpath: runs
  step:
    - name: submit
      do:
        - { cmd: "echo submitted", done_file: READY, error_file: FAIL }
"#;
    let (benchmark, ctx) = run_benchmark(dir.path(), yaml);
    let outpath = benchmark.outpath.clone();
    let wp = &benchmark.workpackages["submit"][0];
    assert_eq!(wp.state, WpState::AwaitingSentinel);

    // Success path.
    std::fs::write(wp.work_dir(&benchmark.bench_dir).join("READY"), b"").unwrap();
    let resumed = continue_benchmark(&outpath, benchmark.id, &ctx);
    assert_eq!(resumed.workpackages["submit"][0].state, WpState::Done);

    // Failure path in a fresh benchmark.
    let dir2 = tempfile::tempdir().unwrap();
    let (benchmark2, ctx2) = run_benchmark(dir2.path(), yaml);
    let wp2 = &benchmark2.workpackages["submit"][0];
    std::fs::write(wp2.work_dir(&benchmark2.bench_dir).join("FAIL"), b"").unwrap();
    let resumed2 = continue_benchmark(&benchmark2.outpath.clone(), benchmark2.id, &ctx2);
    assert_eq!(resumed2.workpackages["submit"][0].state, WpState::Error);
}

const ITERATIONS_YAML: &str = r#"
benchmark:
  name: iters
  outpath: runs
  step:
    - name: sample
      iterations: 3
      do: [ 'echo "value=$jube_wp_iteration"' ]
  patternset:
    - name: pats
      pattern:
        - { name: value, type: int, value: "value=$jube_pat_int" }
  analyser:
    - name: reduced
      use: [pats]
      reduce: true
      analyse:
        - step: sample
          file: [stdout]
    - name: unreduced
      use: [pats]
      reduce: false
      analyse:
        - step: sample
          file: [stdout]
"#;

/// Scenario 5: reduce=true collapses the three iterations into one row
/// with cross-iteration statistics; reduce=false keeps one row each.
#[test]
fn iterations_reduce_and_preserve() {
    let dir = tempfile::tempdir().unwrap();
    let (benchmark, ctx) = run_benchmark(dir.path(), ITERATIONS_YAML);
    assert_eq!(benchmark.workpackages["sample"].len(), 3);

    let reduced = analyzer_rows(&benchmark, &ctx, "reduced");
    assert_eq!(reduced.rows.len(), 1);
    let row = &reduced.rows[0];
    assert_eq!(row["value_cnt"], "3");
    assert_eq!(row["value_min"], "0");
    assert_eq!(row["value_max"], "2");
    assert_eq!(row["value_avg"], "1.0");

    let unreduced = analyzer_rows(&benchmark, &ctx, "unreduced");
    assert_eq!(unreduced.rows.len(), 3);
    let values: Vec<&str> = unreduced
        .rows
        .iter()
        .map(|row| row["value"].as_str())
        .collect();
    assert_eq!(values, vec!["0", "1", "2"]);
}

/// Scenario 6: statistics over a file with three samples.
#[test]
fn statistical_pattern_suffixes() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
benchmark:
  name: stats
  outpath: runs
  step:
    - name: produce
      do: [ 'printf "time=1\ntime=3\ntime=5\n" > measurements.txt' ]
  patternset:
    - name: pats
      pattern:
        - { name: time, type: int, value: "time=$jube_pat_int" }
  analyser:
    - name: scan
      use: [pats]
      analyse:
        - step: produce
          file: [measurements.txt]
"#;
    let (benchmark, ctx) = run_benchmark(dir.path(), yaml);
    let rows = analyzer_rows(&benchmark, &ctx, "scan");
    assert_eq!(rows.rows.len(), 1);
    let row = &rows.rows[0];
    assert_eq!(row["time"], "1");
    assert_eq!(row["time_first"], "1");
    assert_eq!(row["time_last"], "5");
    assert_eq!(row["time_min"], "1");
    assert_eq!(row["time_max"], "5");
    assert_eq!(row["time_avg"], "3.0");
    assert_eq!(row["time_cnt"], "3");
    assert_eq!(row["time_sum"], "9");
    let std: f64 = row["time_std"].parse().unwrap();
    assert!((std - 2.0).abs() < 1e-9);
}

/// Analysis is persisted: result rows come from the stored state without
/// re-scanning, and reloading yields identical rows.
#[test]
fn analysis_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let (benchmark, ctx) = run_benchmark(dir.path(), SIMPLE_EXPANSION);
    let first = analyzer_rows(&benchmark, &ctx, "scan");

    let reloaded = Benchmark::load(&benchmark.outpath, benchmark.id, &ctx).unwrap();
    let data = AnalysisData::load(&reloaded);
    let second = build_rows(&reloaded, &data, &reloaded.config.analyzers["scan"]);
    assert_eq!(first.rows, second.rows);
}

/// Restarting a finished benchmark neither re-runs commands nor creates
/// new directories.
#[test]
fn continue_is_a_noop_on_complete_benchmark() {
    let dir = tempfile::tempdir().unwrap();
    let (benchmark, ctx) = run_benchmark(dir.path(), SIMPLE_EXPANSION);

    let entries_before = list_tree(&benchmark.bench_dir);
    let resumed = continue_benchmark(&benchmark.outpath.clone(), benchmark.id, &ctx);
    let entries_after = list_tree(&resumed.bench_dir);
    assert_eq!(entries_before, entries_after);
}

fn list_tree(root: &Path) -> Vec<PathBuf> {
    let mut entries = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(read) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in read.flatten() {
            let path = entry.path();
            // Graph and timestamp files are rewritten on every pass.
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name == "workpackages.json" || name == "timestamps" || name == "run.log" {
                continue;
            }
            if path.is_dir() {
                stack.push(path.clone());
            }
            entries.push(path);
        }
    }
    entries.sort();
    entries
}

/// Parameters that reference other parameters resolve through chained
/// substitution before execution.
#[test]
fn chained_parameter_references() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
benchmark:
  name: chained
  outpath: runs
  parameterset:
    - name: params
      parameter:
        - { name: base, value: "42" }
        - { name: derived, value: "$base" }
        - { name: doubled, mode: shell, value: "echo $(( $derived * 2 ))" }
  step:
    - name: emit
      use: [params]
      do: [ 'echo "doubled=$doubled"' ]
"#;
    let (benchmark, _ctx) = run_benchmark(dir.path(), yaml);
    let wp = &benchmark.workpackages["emit"][0];
    assert_eq!(wp.state, WpState::Done);
    let stdout = wp.work_dir(&benchmark.bench_dir).join("stdout");
    assert_eq!(
        std::fs::read_to_string(stdout).unwrap().trim(),
        "doubled=84"
    );
}

/// A full run records a done marker for every materialized workpackage.
#[test]
fn run_marks_every_workpackage_done() {
    let dir = tempfile::tempdir().unwrap();
    let (benchmark, _ctx) = run_benchmark(dir.path(), SIMPLE_EXPANSION);
    for wp in benchmark.workpackages.values().flatten() {
        assert!(wp.is_done_on_disk(&benchmark.bench_dir), "wp {}", wp.id);
    }
}
