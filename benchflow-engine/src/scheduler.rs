//! Cooperative workpackage scheduler.
//!
//! A run is a sequence of passes. Each pass visits every workpackage in
//! step dependency order: ready work is started, suspended work re-probes
//! its sentinel files, and completed work unlocks its dependents. The loop
//! ends when a pass makes no progress; workpackages still awaiting
//! sentinels are left suspended for a later `continue`.
//!
//! Workers execute one operation to completion (or suspension) before
//! yielding; all cross-workpackage coordination goes through marker files
//! on disk, so parallel siblings and restarted processes observe the same
//! state.

use crate::benchmark::Benchmark;
use crate::fileset;
use crate::shell;
use crate::workpackage::{WpState, Workpackage};
use benchflow_core::{export_values, BenchError, Operation, Result, RunContext, Step};
use benchflow_logic::{eval_condition, refresh_for_cycle, substitute_fixpoint};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Summary of a scheduler run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Workpackages in the Done state.
    pub done: usize,
    /// Workpackages in the Error state.
    pub error: usize,
    /// Workpackages suspended on sentinel files.
    pub pending: usize,
    /// Workpackages never started (unreachable parents or quota).
    pub open: usize,
}

impl RunReport {
    /// Whether every workpackage reached Done.
    pub fn is_complete(&self) -> bool {
        self.error == 0 && self.pending == 0 && self.open == 0
    }
}

/// Drive the benchmark until no pass makes progress.
pub fn run(benchmark: &mut Benchmark, ctx: &RunContext) -> Result<RunReport> {
    let order = benchmark.step_order()?;
    loop {
        let mut progressed = false;
        for step_name in &order {
            let step = benchmark.config.steps[step_name].clone();
            if run_step_pass(benchmark, &step, ctx)? {
                progressed = true;
            }
            benchmark.persist_workpackages()?;
            if ctx.exit_on_error && has_errors(benchmark) {
                let report = report(benchmark);
                return Ok(report);
            }
        }
        if !progressed {
            break;
        }
    }
    let report = report(benchmark);
    info!(
        done = report.done,
        error = report.error,
        pending = report.pending,
        "scheduler pass complete"
    );
    Ok(report)
}

fn has_errors(benchmark: &Benchmark) -> bool {
    benchmark
        .workpackages
        .values()
        .flatten()
        .any(|wp| wp.state == WpState::Error)
}

fn report(benchmark: &Benchmark) -> RunReport {
    let mut report = RunReport::default();
    for wp in benchmark.workpackages.values().flatten() {
        match wp.state {
            WpState::Done => report.done += 1,
            WpState::Error => report.error += 1,
            WpState::AwaitingSentinel => report.pending += 1,
            _ => report.open += 1,
        }
    }
    report
}

/// One pass over a single step's workpackages. Returns whether any
/// workpackage changed state or advanced its cursor.
fn run_step_pass(benchmark: &mut Benchmark, step: &Step, ctx: &RunContext) -> Result<bool> {
    let mut wps = match benchmark.workpackages.remove(&step.name) {
        Some(wps) => wps,
        None => return Ok(false),
    };

    let pending_async = AtomicUsize::new(
        wps.iter()
            .filter(|wp| wp.state == WpState::AwaitingSentinel)
            .count(),
    );
    let progressed = AtomicBool::new(false);
    let sibling_dirs: Vec<PathBuf> = wps
        .iter()
        .map(|wp| wp.wp_dir(&benchmark.bench_dir))
        .collect();

    let shared_benchmark: &Benchmark = benchmark;
    let execute = |wp: &mut Workpackage| {
        let before = (wp.state, wp.cursor);
        if let Err(e) = execute_workpackage(
            shared_benchmark,
            step,
            wp,
            &sibling_dirs,
            &pending_async,
            ctx,
        ) {
            wp.fail(e.to_string());
            warn!(wp = wp.id, step = %step.name, "workpackage failed: {}", e);
        }
        if (wp.state, wp.cursor) != before {
            progressed.store(true, Ordering::Relaxed);
        }
    };

    if step.procs > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(step.procs as usize)
            .build()
            .map_err(|e| BenchError::Config(format!("worker pool: {e}")))?;
        pool.install(|| wps.par_iter_mut().for_each(execute));
    } else {
        wps.iter_mut().for_each(execute);
    }

    benchmark.workpackages.insert(step.name.clone(), wps);
    Ok(progressed.load(Ordering::Relaxed))
}

/// Advance one workpackage as far as possible in this pass.
fn execute_workpackage(
    benchmark: &Benchmark,
    step: &Step,
    wp: &mut Workpackage,
    sibling_dirs: &[PathBuf],
    pending_async: &AtomicUsize,
    ctx: &RunContext,
) -> Result<()> {
    if wp.state.is_terminal() {
        return Ok(());
    }
    if !parents_done(benchmark, wp) {
        return Ok(());
    }

    let bench_dir = benchmark.bench_dir.clone();
    let ops_per_cycle = step.operations.len();

    // Re-probe a pending sentinel before anything else.
    if wp.state == WpState::AwaitingSentinel {
        let op = &step.operations[wp.cursor.op];
        let values = benchmark.substitution_values(wp, step, wp.cursor.cycle);
        let work_dir = operation_work_dir(benchmark, step, wp, op, &values)?;
        match probe_sentinels(op, &work_dir, &values)? {
            SentinelState::Failed(message) => {
                pending_async.fetch_sub(1, Ordering::Relaxed);
                wp.fail(message);
                return Ok(());
            }
            SentinelState::Pending => return Ok(()),
            SentinelState::Complete => {
                pending_async.fetch_sub(1, Ordering::Relaxed);
                wp.cursor.advance(ops_per_cycle);
                wp.state = WpState::Running;
            }
        }
    }

    if wp.state == WpState::Created {
        prepare_sandbox(benchmark, step, wp, ctx)?;
        wp.state = WpState::Ready;
    }

    if ops_per_cycle == 0 {
        finish(wp, &bench_dir)?;
        return Ok(());
    }

    wp.state = WpState::Running;
    let total_slots = step.total_operation_slots();
    let mut entered_cycle = wp.cursor.cycle;

    while wp.cursor.slot(ops_per_cycle) < total_slots {
        let slot = wp.cursor.slot(ops_per_cycle);
        let op = &step.operations[wp.cursor.op];

        // Refresh cycle-updated parameters when a new cycle begins.
        if wp.cursor.op == 0 && wp.cursor.cycle > 0 && wp.cursor.cycle != entered_cycle {
            let ambient = benchmark.ambient_for(wp, step, wp.cursor.cycle);
            refresh_for_cycle(&mut wp.point, &ambient, ctx)?;
            entered_cycle = wp.cursor.cycle;
        }

        if wp.op_marked(&bench_dir, slot) {
            wp.cursor.advance(ops_per_cycle);
            continue;
        }

        let values = benchmark.substitution_values(wp, step, wp.cursor.cycle);

        let active = substitute_fixpoint(&op.active, &values)?;
        if !eval_condition(&active)? {
            wp.write_marker(&wp.op_marker(&bench_dir, slot))?;
            wp.cursor.advance(ops_per_cycle);
            continue;
        }

        if op.shared {
            match run_shared_operation(
                benchmark,
                step,
                wp,
                op,
                slot,
                sibling_dirs,
                &values,
                ctx,
            )? {
                SharedOutcome::Executed | SharedOutcome::AlreadyDone => {
                    wp.write_marker(&wp.op_marker(&bench_dir, slot))?;
                    wp.cursor.advance(ops_per_cycle);
                    continue;
                }
                SharedOutcome::Blocked => {
                    wp.state = WpState::Ready;
                    return Ok(());
                }
            }
        }

        let work_dir = operation_work_dir(benchmark, step, wp, op, &values)?;

        // Async quota: starting another pending operation would exceed the
        // step's cap, so stay ready for a later pass.
        if op.is_async() && step.max_async > 0 {
            let pending = pending_async.load(Ordering::Relaxed);
            if pending >= step.max_async as usize {
                wp.state = WpState::Ready;
                return Ok(());
            }
        }

        run_operation(benchmark, step, wp, op, slot, &work_dir, &values, ctx)?;
        match wp.state {
            WpState::Running => {}
            WpState::AwaitingSentinel => {
                pending_async.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            _ => return Ok(()),
        }
    }

    finish(wp, &bench_dir)?;
    wp.persist_snapshots(&bench_dir)?;
    Ok(())
}

fn finish(wp: &mut Workpackage, bench_dir: &Path) -> Result<()> {
    wp.write_marker(&wp.done_marker(bench_dir))?;
    wp.state = WpState::Done;
    debug!(wp = wp.id, "workpackage done");
    Ok(())
}

fn parents_done(benchmark: &Benchmark, wp: &Workpackage) -> bool {
    wp.parents.iter().all(|parent_id| {
        benchmark
            .workpackage(*parent_id)
            .map(|parent| parent.state == WpState::Done)
            // The parent's step is currently being scheduled only when a
            // step depends on itself, which validation rejects.
            .unwrap_or(false)
    })
}

/// Execute one synchronous or asynchronous operation.
#[allow(clippy::too_many_arguments)]
fn run_operation(
    benchmark: &Benchmark,
    step: &Step,
    wp: &mut Workpackage,
    op: &Operation,
    slot: usize,
    work_dir: &Path,
    values: &BTreeMap<String, String>,
    ctx: &RunContext,
) -> Result<()> {
    let bench_dir = &benchmark.bench_dir;
    let command = substitute_fixpoint(&op.command, values)?;

    let stdout_name = match &op.stdout {
        Some(name) => substitute_fixpoint(name, values)?,
        None => "stdout".to_string(),
    };
    let stderr_name = match &op.stderr {
        Some(name) => substitute_fixpoint(name, values)?,
        None => "stderr".to_string(),
    };
    let stdout_path = work_dir.join(stdout_name);
    let stderr_path = work_dir.join(stderr_name);

    let mut env = wp.env.clone();
    env.extend(export_values(&wp.point));

    write_do_log(benchmark, step, wp, &command, work_dir, values, ctx)?;

    let outcome = shell::run_command(ctx, &command, work_dir, &env, &stdout_path, &stderr_path)?;
    if outcome.exit_code != 0 {
        wp.fail(shell::failure_message(
            &command,
            work_dir,
            &stderr_path,
            outcome.exit_code,
        ));
        return Ok(());
    }
    if let Some(new_env) = outcome.env {
        wp.env = new_env;
    }

    wp.write_marker(&wp.op_marker(bench_dir, slot))?;

    // break_file finishes the workpackage early, skipping remaining cycles.
    if let Some(break_file) = &op.break_file {
        let name = substitute_fixpoint(break_file, values)?;
        if work_dir.join(name).exists() {
            finish(wp, bench_dir)?;
            wp.persist_snapshots(bench_dir)?;
            return Ok(());
        }
    }

    match probe_sentinels(op, work_dir, values)? {
        SentinelState::Failed(message) => {
            wp.fail(message);
        }
        SentinelState::Pending => {
            wp.state = WpState::AwaitingSentinel;
        }
        SentinelState::Complete => {
            wp.cursor
                .advance(step.operations.len().max(1));
        }
    }
    Ok(())
}

/// Sentinel probe result for an operation that already launched.
enum SentinelState {
    /// No sentinel declared, or the done file appeared.
    Complete,
    /// A done file is declared and absent.
    Pending,
    /// The error file appeared.
    Failed(String),
}

fn probe_sentinels(
    op: &Operation,
    work_dir: &Path,
    values: &BTreeMap<String, String>,
) -> Result<SentinelState> {
    if let Some(error_file) = &op.error_file {
        let name = substitute_fixpoint(error_file, values)?;
        if work_dir.join(&name).exists() {
            return Ok(SentinelState::Failed(format!(
                "error file '{name}' appeared after running '{}'",
                op.command
            )));
        }
    }
    if let Some(done_file) = &op.done_file {
        let name = substitute_fixpoint(done_file, values)?;
        if !work_dir.join(&name).exists() {
            debug!(sentinel = %name, "waiting for done file");
            return Ok(SentinelState::Pending);
        }
    }
    Ok(SentinelState::Complete)
}

/// Outcome of attempting a shared operation.
enum SharedOutcome {
    /// This workpackage executed the shared command.
    Executed,
    /// A sibling already executed it.
    AlreadyDone,
    /// Siblings have not reached the barrier yet, or another sibling holds
    /// the lock.
    Blocked,
}

/// Shared operations run exactly once per (cycle, op) slot across all
/// sibling workpackages, inside the step's shared folder, after every
/// sibling finished the preceding slot. Coordination is on disk: an
/// advisory lock file and a completion marker in the shared folder.
#[allow(clippy::too_many_arguments)]
fn run_shared_operation(
    benchmark: &Benchmark,
    step: &Step,
    wp: &mut Workpackage,
    op: &Operation,
    slot: usize,
    sibling_dirs: &[PathBuf],
    values: &BTreeMap<String, String>,
    ctx: &RunContext,
) -> Result<SharedOutcome> {
    let shared_dir = shared_folder(benchmark, step, values)?.ok_or_else(|| {
        BenchError::Config(format!(
            "step '{}' has a shared operation but no shared folder name",
            step.name
        ))
    })?;

    let done_marker = shared_dir.join(format!(".shared_done_{slot:02}"));
    if done_marker.exists() {
        return Ok(SharedOutcome::AlreadyDone);
    }

    // Barrier: every sibling must have finished the preceding slot.
    if slot > 0 {
        let all_ready = sibling_dirs.iter().all(|dir| {
            dir.join(format!("wp_done_{:02}", slot - 1)).exists()
                || dir.join(crate::workpackage::DONE_MARKER).exists()
        });
        if !all_ready {
            return Ok(SharedOutcome::Blocked);
        }
    }

    let lock = shared_dir.join(format!(".shared_lock_{slot:02}"));
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock)
    {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Ok(SharedOutcome::Blocked);
        }
        Err(e) => return Err(BenchError::io(format!("locking {}", lock.display()), e)),
    }

    // Workpackage-specific variables are meaningless for a once-per-step
    // command.
    let mut shared_values = values.clone();
    shared_values.retain(|name, _| !name.starts_with("jube_wp_"));

    let command = substitute_fixpoint(&op.command, &shared_values)?;
    let stdout = shared_dir.join("stdout");
    let stderr = shared_dir.join("stderr");
    let mut env = wp.env.clone();
    env.extend(export_values(&wp.point));

    write_do_log(benchmark, step, wp, &command, &shared_dir, values, ctx)?;
    debug!(step = %step.name, slot, "executing shared operation");
    let outcome = shell::run_command(ctx, &command, &shared_dir, &env, &stdout, &stderr)?;
    let _ = std::fs::remove_file(&lock);
    if outcome.exit_code != 0 {
        return Err(BenchError::Execution(shell::failure_message(
            &command,
            &shared_dir,
            &stderr,
            outcome.exit_code,
        )));
    }
    wp.write_marker(&done_marker)?;
    Ok(SharedOutcome::Executed)
}

/// The step's shared folder, created on first use.
fn shared_folder(
    benchmark: &Benchmark,
    step: &Step,
    values: &BTreeMap<String, String>,
) -> Result<Option<PathBuf>> {
    let Some(shared) = &step.shared else {
        return Ok(None);
    };
    let name = substitute_fixpoint(shared, values)?;
    let dir = benchmark.bench_dir.join(format!("{}_{}", step.name, name));
    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .map_err(|e| BenchError::io(format!("creating {}", dir.display()), e))?;
    }
    Ok(Some(dir))
}

/// Resolve the directory an operation executes in: the sandbox, the step's
/// `work_dir` override, or the operation's own `work_dir`, all substituted.
fn operation_work_dir(
    benchmark: &Benchmark,
    step: &Step,
    wp: &Workpackage,
    op: &Operation,
    values: &BTreeMap<String, String>,
) -> Result<PathBuf> {
    let mut dir = match &step.work_dir {
        Some(alt) => {
            let resolved = substitute_fixpoint(alt, values)?;
            let path = PathBuf::from(&resolved);
            if path.is_absolute() {
                path
            } else {
                benchmark.file_path_ref.join(path)
            }
        }
        None => wp.work_dir(&benchmark.bench_dir),
    };
    if let Some(op_dir) = &op.work_dir {
        let resolved = substitute_fixpoint(op_dir, values)?;
        if resolved.contains('$') {
            return Err(BenchError::Resolution(format!(
                "operation work directory '{resolved}' contains unresolved references"
            )));
        }
        dir = dir.join(resolved);
    }
    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .map_err(|e| BenchError::io(format!("creating {}", dir.display()), e))?;
    }
    Ok(dir)
}

/// Create the workpackage directory tree, parent and shared links, import
/// exporting parents' environments, and apply filesets and substitutesets.
fn prepare_sandbox(
    benchmark: &Benchmark,
    step: &Step,
    wp: &mut Workpackage,
    ctx: &RunContext,
) -> Result<()> {
    let bench_dir = &benchmark.bench_dir;
    let work_dir = wp.work_dir(bench_dir);
    std::fs::create_dir_all(&work_dir)
        .map_err(|e| BenchError::io(format!("creating {}", work_dir.display()), e))?;

    for parent_id in &wp.parents {
        let parent = benchmark.workpackage(*parent_id).ok_or_else(|| {
            BenchError::Config(format!("unknown parent workpackage {parent_id}"))
        })?;
        let link = work_dir.join(&parent.step);
        if !link.exists() {
            let target = relative_link(&work_dir, &parent.work_dir(bench_dir));
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &link)
                .map_err(|e| BenchError::io(format!("linking {}", link.display()), e))?;
        }
        let parent_step = benchmark.config.steps.get(&parent.step);
        if parent_step.map(|s| s.export).unwrap_or(false) {
            wp.env.extend(parent.env.clone());
        }
    }

    let values = benchmark.substitution_values(wp, step, 0);

    if let Some(shared_dir) = shared_folder(benchmark, step, &values)? {
        let name = substitute_fixpoint(step.shared.as_deref().unwrap_or_default(), &values)?;
        let link = work_dir.join(&name);
        if !link.exists() {
            let target = relative_link(&work_dir, &shared_dir);
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &link)
                .map_err(|e| BenchError::io(format!("linking {}", link.display()), e))?;
        }
    }

    let mut env = wp.env.clone();
    env.extend(export_values(&wp.point));

    for used in &step.uses {
        let name = substitute_fixpoint(used, &values)?;
        if let Some(set) = benchmark.config.filesets.get(&name) {
            fileset::apply_fileset(
                set,
                &work_dir,
                &benchmark.file_path_ref,
                &values,
                &env,
                ctx,
            )?;
        }
    }
    for used in &step.uses {
        let name = substitute_fixpoint(used, &values)?;
        if let Some(set) = benchmark.config.substitutesets.get(&name) {
            fileset::apply_substituteset(set, &work_dir, &values)?;
        }
    }

    wp.persist_snapshots(bench_dir)?;
    Ok(())
}

/// Append the executed command to the step's replayable do log.
fn write_do_log(
    benchmark: &Benchmark,
    step: &Step,
    wp: &Workpackage,
    command: &str,
    work_dir: &Path,
    values: &BTreeMap<String, String>,
    ctx: &RunContext,
) -> Result<()> {
    let Some(log_file) = &step.do_log_file else {
        return Ok(());
    };
    let name = substitute_fixpoint(log_file, values)?;
    let path = if Path::new(&name).is_absolute() {
        PathBuf::from(&name)
    } else {
        wp.wp_dir(&benchmark.bench_dir).join(&name)
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| BenchError::io(format!("creating {}", parent.display()), e))?;
    }
    let fresh = !path.exists();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| BenchError::io(format!("opening {}", path.display()), e))?;
    if fresh {
        writeln!(file, "#!{}", ctx.shell).map_err(|e| BenchError::io("writing do log", e))?;
    }
    writeln!(file, "cd {}", work_dir.display())
        .and_then(|_| writeln!(file, "{command}"))
        .map_err(|e| BenchError::io("writing do log", e))
}

/// Relative path from `from_dir` to `target`, for stable symlinks inside
/// the benchmark tree.
fn relative_link(from_dir: &Path, target: &Path) -> PathBuf {
    let from: Vec<Component> = from_dir.components().collect();
    let to: Vec<Component> = target.components().collect();
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut relative = PathBuf::new();
    for _ in common..from.len() {
        relative.push("..");
    }
    for component in &to[common..] {
        relative.push(component.as_os_str());
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}
