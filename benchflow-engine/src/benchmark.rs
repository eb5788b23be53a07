//! Benchmark container and workpackage graph construction.
//!
//! A benchmark materializes every workpackage up front: steps are visited
//! in dependency order, each step's parametersets are expanded into points,
//! and dependent steps multiply their points by every compatible parent
//! combination. The resulting graph is persisted and drives the scheduler.

use crate::store::{self, ConfigSnapshot};
use crate::workpackage::{pad_id, Cursor, WpState, Workpackage};
use benchflow_core::{
    export_values, point_values, BenchError, BenchmarkConfig, ParameterSet, Result, RunContext,
    SpacePoint, Step,
};
use benchflow_logic::{
    build_points, eval_condition, finalize_point, merge_parametersets, substitute_fixpoint,
    DependencyGraph,
};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Per-step workpackage state counts, for status displays.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepStatus {
    /// Total workpackages.
    pub all: usize,
    /// Not yet started.
    pub open: usize,
    /// Started but not finished (running or awaiting a sentinel).
    pub wait: usize,
    /// Failed.
    pub error: usize,
    /// Completed.
    pub done: usize,
}

/// A benchmark: configuration plus materialized workpackages.
#[derive(Debug)]
pub struct Benchmark {
    /// Benchmark id (monotonic under its outpath).
    pub id: u32,
    /// Parent directory holding all benchmark runs.
    pub outpath: PathBuf,
    /// This benchmark's directory.
    pub bench_dir: PathBuf,
    /// Directory of the configuration file, anchoring external filesets.
    pub file_path_ref: PathBuf,
    /// Tags active for this benchmark.
    pub tags: BTreeSet<String>,
    /// Comment text.
    pub comment: String,
    /// Canonical configuration.
    pub config: BenchmarkConfig,
    /// Workpackages by step name, in creation order.
    pub workpackages: BTreeMap<String, Vec<Workpackage>>,
}

impl Benchmark {
    /// Create a new benchmark: allocate an id, create the directory, and
    /// persist the configuration snapshot.
    pub fn create(
        config: BenchmarkConfig,
        outpath: &Path,
        requested_id: Option<u32>,
        file_path_ref: &Path,
        ctx: &RunContext,
    ) -> Result<Self> {
        config.validate()?;
        let id = requested_id.unwrap_or_else(|| store::next_benchmark_id(outpath));
        let bench_dir = store::create_bench_dir(outpath, id, ctx)?;
        let benchmark = Benchmark {
            id,
            outpath: outpath.to_path_buf(),
            bench_dir: bench_dir.clone(),
            file_path_ref: file_path_ref.to_path_buf(),
            tags: ctx.tags.clone(),
            comment: config.comment.clone(),
            config,
            workpackages: BTreeMap::new(),
        };
        store::write_snapshot(&bench_dir, &benchmark.snapshot())?;
        store::update_timestamps(&bench_dir)?;
        info!(id, dir = %bench_dir.display(), "created benchmark");
        Ok(benchmark)
    }

    /// Load a persisted benchmark and reconstitute workpackage states from
    /// the on-disk markers.
    pub fn load(outpath: &Path, id: u32, ctx: &RunContext) -> Result<Self> {
        let bench_dir = store::bench_dir(outpath, id);
        if !bench_dir.is_dir() {
            return Err(BenchError::Config(format!(
                "benchmark directory '{}' does not exist",
                bench_dir.display()
            )));
        }
        let snapshot = store::load_snapshot(&bench_dir, ctx)?;
        let flat = store::load_workpackages(&bench_dir)?;
        let mut benchmark = Benchmark {
            id,
            outpath: outpath.to_path_buf(),
            bench_dir: bench_dir.clone(),
            file_path_ref: snapshot.file_path_ref.clone(),
            tags: snapshot.tags.clone(),
            comment: snapshot.comment.clone(),
            config: snapshot.config,
            workpackages: BTreeMap::new(),
        };
        for mut wp in flat {
            let step = benchmark.config.steps.get(&wp.step).ok_or_else(|| {
                BenchError::Config(format!(
                    "workpackage {} references unknown step '{}'",
                    wp.id, wp.step
                ))
            })?;
            wp.reconstitute(&bench_dir, step)?;
            benchmark
                .workpackages
                .entry(wp.step.clone())
                .or_default()
                .push(wp);
        }
        benchmark.verify_parent_links()?;
        Ok(benchmark)
    }

    /// Persisted snapshot of this benchmark's configuration.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            version: benchflow_core::ENGINE_VERSION.to_string(),
            tags: self.tags.clone(),
            comment: self.comment.clone(),
            file_path_ref: self.file_path_ref.clone(),
            config: self.config.clone(),
        }
    }

    /// Zero-padded id.
    pub fn padid(&self) -> String {
        pad_id(self.id)
    }

    /// Flat view of all workpackages, by ascending id.
    pub fn all_workpackages(&self) -> Vec<&Workpackage> {
        let mut all: Vec<&Workpackage> = self.workpackages.values().flatten().collect();
        all.sort_by_key(|wp| wp.id);
        all
    }

    /// Look up a workpackage by id.
    pub fn workpackage(&self, id: u32) -> Option<&Workpackage> {
        self.workpackages.values().flatten().find(|wp| wp.id == id)
    }

    /// Persist the current workpackage graph.
    pub fn persist_workpackages(&self) -> Result<()> {
        let mut flat: Vec<Workpackage> = self
            .workpackages
            .values()
            .flatten()
            .cloned()
            .collect();
        flat.sort_by_key(|wp| wp.id);
        store::write_workpackages(&self.bench_dir, &flat)?;
        store::update_timestamps(&self.bench_dir)
    }

    /// Step names in dependency order.
    pub fn step_order(&self) -> Result<Vec<String>> {
        let mut graph = DependencyGraph::new();
        for step in self.config.steps.values() {
            graph.add_node(step.name.clone());
            for dep in &step.depend {
                graph.add_dependency(step.name.clone(), dep.clone());
            }
        }
        graph
            .topological_order()
            .map_err(|e| BenchError::Config(e.to_string()))
    }

    /// Per-step state counts.
    pub fn status(&self) -> BTreeMap<String, StepStatus> {
        let mut status = BTreeMap::new();
        for (step, wps) in &self.workpackages {
            let entry: &mut StepStatus = status.entry(step.clone()).or_default();
            for wp in wps {
                entry.all += 1;
                match wp.state {
                    WpState::Done => entry.done += 1,
                    WpState::Error => entry.error += 1,
                    WpState::Created => entry.open += 1,
                    _ => entry.wait += 1,
                }
            }
        }
        status
    }

    /// Materialize the complete workpackage graph.
    pub fn build_workpackages(&mut self, ctx: &RunContext) -> Result<()> {
        let order = self.step_order()?;
        let mut next_id: u32 = 0;
        for step_name in &order {
            let step = self.config.steps[step_name].clone();
            let combos = self.parent_combinations(&step);
            let mut created: Vec<Workpackage> = Vec::new();

            for combo in combos {
                let Some(inherited) = self.merge_parent_points(&combo) else {
                    debug!(step = %step.name, "skipping incompatible parent combination");
                    continue;
                };
                let iteration_base = self.iteration_base(&combo);
                let sets = self.referenced_parametersets(&step, &inherited)?;
                let set_refs: Vec<&ParameterSet> = sets.iter().collect();
                let merged = merge_parametersets(&set_refs)?;
                let points = build_points(&merged, &inherited)?;

                for point in points {
                    for iteration in 0..step.iterations {
                        let wp = Workpackage {
                            id: next_id,
                            step: step.name.clone(),
                            iteration: iteration_base * step.iterations + iteration,
                            parents: combo.iter().map(|p| p.0).collect(),
                            point: point.clone(),
                            state: WpState::Created,
                            cursor: Cursor::default(),
                            env: base_environment(),
                            suffix: String::new(),
                            last_error: None,
                        };
                        next_id += 1;
                        created.push(wp);
                    }
                }
            }

            // Resolve every new workpackage's point, in parallel when the
            // step asks for expansion workers.
            let finalize = |wp: &mut Workpackage| {
                let ambient = self.ambient_for(wp, &step, 0);
                if let Err(e) = finalize_point(&mut wp.point, &ambient, ctx) {
                    wp.fail(e.to_string());
                    return;
                }
                let values = self.substitution_values(wp, &step, 0);
                match substitute_fixpoint(&step.suffix, &values) {
                    Ok(suffix) => wp.suffix = suffix,
                    Err(e) => wp.fail(e.to_string()),
                }
            };
            if step.procs > 1 {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(step.procs as usize)
                    .build()
                    .map_err(|e| BenchError::Config(format!("worker pool: {e}")))?;
                pool.install(|| created.par_iter_mut().for_each(finalize));
            } else {
                created.iter_mut().for_each(finalize);
            }

            // Drop workpackages whose step-level active expression is false;
            // ids are reassigned to stay dense.
            let mut kept: Vec<Workpackage> = Vec::new();
            for wp in created {
                if wp.state == WpState::Error {
                    kept.push(wp);
                    continue;
                }
                let values = self.substitution_values(&wp, &step, 0);
                let active_text = substitute_fixpoint(&step.active, &values)?;
                if eval_condition(&active_text)? {
                    kept.push(wp);
                } else {
                    debug!(step = %step.name, "dropping inactive workpackage");
                }
            }
            let dropped = self
                .workpackages
                .insert(step.name.clone(), kept)
                .map(|old| old.len())
                .unwrap_or(0);
            debug_assert_eq!(dropped, 0, "step expanded twice");
        }

        // Reassign ids densely after inactive drops, in step order.
        let mut id: u32 = 0;
        let mut remap: BTreeMap<u32, u32> = BTreeMap::new();
        for step_name in &order {
            if let Some(wps) = self.workpackages.get_mut(step_name) {
                for wp in wps {
                    remap.insert(wp.id, id);
                    wp.id = id;
                    id += 1;
                }
            }
        }
        for wps in self.workpackages.values_mut() {
            for wp in wps {
                wp.parents = wp
                    .parents
                    .iter()
                    .filter_map(|old| remap.get(old).copied())
                    .collect();
            }
        }
        info!(count = id, "materialized workpackages");
        self.persist_workpackages()
    }

    /// All parent workpackage combinations for a step: the Cartesian
    /// product over its dependencies' workpackage lists.
    fn parent_combinations(&self, step: &Step) -> Vec<Vec<(u32, String)>> {
        if step.depend.is_empty() {
            return vec![Vec::new()];
        }
        let mut combos: Vec<Vec<(u32, String)>> = vec![Vec::new()];
        for dep in &step.depend {
            let parents = match self.workpackages.get(dep) {
                Some(wps) if !wps.is_empty() => wps,
                _ => return Vec::new(),
            };
            let mut next = Vec::with_capacity(combos.len() * parents.len());
            for combo in &combos {
                for parent in parents {
                    let mut grown = combo.clone();
                    grown.push((parent.id, dep.clone()));
                    next.push(grown);
                }
            }
            combos = next;
        }
        combos
    }

    /// Merge parent points into the inherited point for a child; `None`
    /// when two parents disagree on a shared parameter.
    fn merge_parent_points(&self, combo: &[(u32, String)]) -> Option<SpacePoint> {
        let mut merged = SpacePoint::new();
        for (parent_id, _) in combo {
            let parent = self.workpackage(*parent_id)?;
            for (name, param) in &parent.point {
                if name.starts_with("jube_") {
                    continue;
                }
                match merged.get(name) {
                    Some(existing) if existing.value != param.value => return None,
                    Some(_) => {}
                    None => {
                        merged.insert(name.clone(), param.clone());
                    }
                }
            }
        }
        Some(merged)
    }

    /// Fold parent iteration indices into an iteration base, parents
    /// ordered by (iterations, step name) for stability.
    fn iteration_base(&self, combo: &[(u32, String)]) -> u32 {
        let mut parents: Vec<&Workpackage> = combo
            .iter()
            .filter_map(|(id, _)| self.workpackage(*id))
            .collect();
        parents.sort_by_key(|wp| wp.step.clone());
        parents.sort_by_key(|wp| {
            self.config
                .steps
                .get(&wp.step)
                .map(|s| s.iterations)
                .unwrap_or(1)
        });
        let mut base = 0;
        for (index, parent) in parents.iter().enumerate() {
            if index == 0 {
                base = parent.iteration;
            } else {
                let parent_iterations = self
                    .config
                    .steps
                    .get(&parent.step)
                    .map(|s| s.iterations)
                    .unwrap_or(1);
                base = parent_iterations * base + parent.iteration;
            }
        }
        base
    }

    /// Parametersets referenced by a step's `use` list, with `$name`
    /// references in set names resolved against the inherited point.
    fn referenced_parametersets(
        &self,
        step: &Step,
        inherited: &SpacePoint,
    ) -> Result<Vec<ParameterSet>> {
        let values = point_values(inherited);
        let mut sets = Vec::new();
        for used in &step.uses {
            let name = substitute_fixpoint(used, &values)?;
            if let Some(set) = self.config.parametersets.get(&name) {
                sets.push(set.clone());
            }
        }
        Ok(sets)
    }

    /// Ambient variables for a workpackage at a given cycle: the exported
    /// `jube_benchmark_*`, `jube_step_*`, and `jube_wp_*` names.
    pub fn ambient_for(
        &self,
        wp: &Workpackage,
        step: &Step,
        cycle: u32,
    ) -> BTreeMap<String, String> {
        let mut ambient = BTreeMap::new();
        let stamps = store::read_timestamps(&self.bench_dir);

        ambient.insert("jube_benchmark_id".to_string(), self.id.to_string());
        ambient.insert("jube_benchmark_padid".to_string(), self.padid());
        ambient.insert(
            "jube_benchmark_name".to_string(),
            self.config.name.clone(),
        );
        ambient.insert(
            "jube_benchmark_home".to_string(),
            absolute(&self.file_path_ref),
        );
        ambient.insert(
            "jube_benchmark_rundir".to_string(),
            absolute(&self.bench_dir),
        );
        ambient.insert(
            "jube_benchmark_start".to_string(),
            stamps.get("start").cloned().unwrap_or_default(),
        );

        ambient.insert("jube_step_name".to_string(), step.name.clone());
        ambient.insert(
            "jube_step_iterations".to_string(),
            step.iterations.to_string(),
        );
        ambient.insert("jube_step_cycles".to_string(), step.cycles.to_string());

        ambient.insert("jube_wp_id".to_string(), wp.id.to_string());
        ambient.insert("jube_wp_padid".to_string(), pad_id(wp.id));
        ambient.insert("jube_wp_iteration".to_string(), wp.iteration.to_string());
        ambient.insert("jube_wp_cycle".to_string(), cycle.to_string());
        let work_dir = wp.work_dir(&self.bench_dir);
        ambient.insert("jube_wp_relpath".to_string(), relative_to_cwd(&work_dir));
        ambient.insert("jube_wp_abspath".to_string(), absolute(&work_dir));

        for parent_id in &wp.parents {
            if let Some(parent) = self.workpackage(*parent_id) {
                ambient.insert(
                    format!("jube_wp_parent_{}_id", parent.step),
                    parent.id.to_string(),
                );
            }
        }

        let exported = export_values(&wp.point);
        let envstr: String = exported
            .iter()
            .map(|(name, value)| format!("export {name}={value}\n"))
            .collect();
        let envlist = exported.keys().cloned().collect::<Vec<_>>().join(" ");
        ambient.insert("jube_wp_envstr".to_string(), envstr);
        ambient.insert("jube_wp_envlist".to_string(), envlist);

        ambient
    }

    /// Substitution lookup for a workpackage: resolved parameters plus
    /// ambient variables.
    pub fn substitution_values(
        &self,
        wp: &Workpackage,
        step: &Step,
        cycle: u32,
    ) -> BTreeMap<String, String> {
        let mut values = point_values(&wp.point);
        for (name, value) in self.ambient_for(wp, step, cycle) {
            values.entry(name).or_insert(value);
        }
        values
    }

    /// Check parent symlinks of started workpackages. Missing or dangling
    /// links indicate a corrupt benchmark and are reported, not recreated.
    fn verify_parent_links(&self) -> Result<()> {
        for wp in self.workpackages.values().flatten() {
            let work_dir = wp.work_dir(&self.bench_dir);
            if !work_dir.exists() {
                continue;
            }
            for parent_id in &wp.parents {
                let Some(parent) = self.workpackage(*parent_id) else {
                    continue;
                };
                let link = work_dir.join(&parent.step);
                if !link.exists() {
                    return Err(BenchError::Filesystem(format!(
                        "workpackage {} is missing its parent link '{}'; \
                         the benchmark directory is corrupt",
                        wp.id,
                        link.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Initial workpackage environment: the engine process environment.
fn base_environment() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

fn absolute(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

fn relative_to_cwd(path: &Path) -> String {
    let cwd = std::env::current_dir().unwrap_or_default();
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    canonical
        .strip_prefix(&cwd)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| canonical.display().to_string())
}
