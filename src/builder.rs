//! The build driver: pulls ready edges from the plan, hands them to the
//! command runner, reaps results, extracts discovered dependencies, and
//! finalizes the build logs.

use crate::build_log::BuildLog;
use crate::canon::{canon_path, canon_path_all_slashes};
use crate::clparser;
use crate::depfile::{self, DepfileParserOptions};
use crate::deps_log::DepsLog;
use crate::disk::{DiskInterface, FileRead, MTime};
use crate::graph::{EdgeId, Graph, NodeId};
use crate::plan::{EdgeResult, Plan};
use crate::runner::{
    CommandResult, CommandRunner, CommandSpec, DryRunRunner, RealRunner, RunnerOptions,
    Termination,
};
use crate::scan::DependencyScan;
use crate::scanner::Scanner;
use crate::status::{format_target_name, Status, Verbosity};
use crate::trace;
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

pub struct BuildConfig {
    /// Maximum concurrent running subprocesses.
    pub parallelism: usize,
    /// <= 0 disables load shedding; > 0 caps starts when the 1-minute load
    /// average exceeds it.
    pub max_load_average: f64,
    /// Stop scheduling new work after this many failures; always >= 1.
    pub failures_allowed: usize,
    pub dry_run: bool,
    pub verbosity: Verbosity,
    pub depfile_parser_options: DepfileParserOptions,
    pub skip_check_timestamp: bool,
    /// Write per-edge logs into logs_dir, and failed_parts on fatal failure.
    pub logfiles_enabled: bool,
    pub logs_dir: String,
    /// Capture subprocess output rather than streaming it; also enables the
    /// progress watcher.
    pub enable_bufferization: bool,
    /// Debug knobs: preserve rsp files / depfiles after use.
    pub keep_rsp: bool,
    pub keep_depfile: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            parallelism: 1,
            max_load_average: 0.0,
            failures_allowed: 1,
            dry_run: false,
            verbosity: Verbosity::Normal,
            depfile_parser_options: DepfileParserOptions::default(),
            skip_check_timestamp: false,
            logfiles_enabled: false,
            logs_dir: "logs".to_string(),
            enable_bufferization: false,
            keep_rsp: false,
            keep_depfile: false,
        }
    }
}

const LOCK_FILE_NAME: &str = ".ninja_lock";

pub struct Builder<'a> {
    config: &'a BuildConfig,
    graph: &'a mut Graph,
    disk: &'a dyn DiskInterface,
    status: &'a mut dyn Status,
    build_log: Option<BuildLog>,
    deps_log: Option<DepsLog>,
    plan: Plan,
    /// Constructed lazily on the first build, dry-run or real per config.
    runner: Option<CommandRunner>,
    /// Start time of each in-flight edge, ms since builder construction.
    running_edges: HashMap<EdgeId, i64>,
    /// Formatted names of failed edges, for the post-mortem summary.
    failed_edges: Vec<String>,
    lock_file_path: String,
    start_time: Instant,
}

impl<'a> Builder<'a> {
    pub fn new(
        graph: &'a mut Graph,
        config: &'a BuildConfig,
        build_log: Option<BuildLog>,
        deps_log: Option<DepsLog>,
        disk: &'a dyn DiskInterface,
        status: &'a mut dyn Status,
    ) -> anyhow::Result<Self> {
        if config.logfiles_enabled {
            disk.make_dirs(&format!("{}/failed_parts", config.logs_dir))?;
        }
        let lock_file_path = match &graph.build_dir {
            Some(dir) if !dir.is_empty() => format!("{}/{}", dir, LOCK_FILE_NAME),
            _ => LOCK_FILE_NAME.to_string(),
        };
        Ok(Builder {
            config,
            graph,
            disk,
            status,
            build_log,
            deps_log,
            plan: Plan::new(),
            runner: None,
            running_edges: HashMap::new(),
            failed_edges: Vec::new(),
            lock_file_path,
            start_time: Instant::now(),
        })
    }

    pub fn add_target_by_name(&mut self, name: &str) -> anyhow::Result<NodeId> {
        let node = self
            .graph
            .lookup_path(name)
            .ok_or_else(|| anyhow!("unknown target: '{}'", name))?;
        self.add_target(node)?;
        Ok(node)
    }

    /// Rescan the target's closure for dirtiness and pull it into the plan,
    /// along with any validation nodes it declares.
    pub fn add_target(&mut self, target: NodeId) -> anyhow::Result<()> {
        let scan = DependencyScan {
            disk: self.disk,
            build_log: self.build_log.as_ref(),
            deps_log: self.deps_log.as_ref(),
            depfile_options: &self.config.depfile_parser_options,
            skip_check_timestamp: self.config.skip_check_timestamp,
        };
        let validation_nodes = scan.recompute_dirty(self.graph, target)?;

        let wanted = match self.graph.node(target).in_edge {
            None => true,
            Some(in_edge) => !self.graph.edge(in_edge).outputs_ready,
        };
        if wanted {
            self.plan.add_target(self.graph, target)?;
        }

        // Validation nodes found during the rescan become top level targets
        // of their own.
        for v in validation_nodes {
            if let Some(in_edge) = self.graph.node(v).in_edge {
                if !self.graph.edge(in_edge).outputs_ready {
                    self.plan.add_target(self.graph, v)?;
                }
            }
        }
        Ok(())
    }

    pub fn already_up_to_date(&self) -> bool {
        !self.plan.more_to_do()
    }

    /// Run the build until it completes or can't proceed.  Returns the
    /// number of commands that ran.
    pub fn build(&mut self) -> anyhow::Result<usize> {
        if self.already_up_to_date() {
            return Ok(0);
        }
        self.plan.prepare_queue(self.graph);

        self.status.plan_has_total_edges(self.plan.command_edge_count());
        let mut pending_commands: usize = 0;
        let mut finished_commands: usize = 0;
        let mut failures_allowed = self.config.failures_allowed;

        // Set up the command runner if we haven't done so already.
        if self.runner.is_none() {
            self.runner = Some(if self.config.dry_run {
                CommandRunner::DryRun(DryRunRunner::new())
            } else {
                CommandRunner::Real(RealRunner::new(RunnerOptions {
                    parallelism: self.config.parallelism,
                    max_load_average: self.config.max_load_average,
                    enable_bufferization: self.config.enable_bufferization,
                    logs_dir: if self.config.logfiles_enabled {
                        Some(self.config.logs_dir.clone())
                    } else {
                        None
                    },
                    verbose: self.config.verbosity == Verbosity::Verbose,
                }))
            });
        }

        self.status.build_started();
        self.runner.as_mut().unwrap().run_logger_process();

        // First start as many commands as the runner allows, then wait for
        // and reap the next finished command, repeating until the plan
        // drains.
        while self.plan.more_to_do() {
            // See if we can start any more commands.
            if failures_allowed > 0 {
                let mut capacity = self.runner.as_ref().unwrap().can_run_more();
                while capacity > 0 {
                    let edge = match self.plan.find_work() {
                        None => break,
                        Some(e) => e,
                    };

                    if self.graph.edge(edge).generator {
                        // The generator may rewrite the build log out from
                        // under us.
                        if let Some(log) = &mut self.build_log {
                            log.close();
                        }
                    }

                    if let Err(err) = self.start_edge(edge) {
                        self.cleanup();
                        self.status.build_finished();
                        return Err(err);
                    }

                    if self.graph.edge(edge).is_phony() {
                        self.plan.edge_finished(self.graph, edge, EdgeResult::Succeeded);
                        if let Err(err) = self.drain_dyndeps() {
                            self.cleanup();
                            self.status.build_finished();
                            return Err(err);
                        }
                    } else {
                        pending_commands += 1;
                        capacity -= 1;

                        // Re-evaluate capacity.
                        let current = self.runner.as_ref().unwrap().can_run_more();
                        if current < capacity {
                            capacity = current;
                        }
                    }
                }

                // We are finished with all work items and have no pending
                // commands, so break out of the main loop.
                if pending_commands == 0 && !self.plan.more_to_do() {
                    break;
                }
            }

            // See if we can reap any finished commands.
            if pending_commands > 0 {
                let result = self.runner.as_mut().unwrap().wait_for_command();
                let result = match result {
                    Some(r) if r.status != Termination::Interrupted => r,
                    _ => {
                        self.cleanup();
                        self.status.build_finished();
                        bail!("interrupted by user");
                    }
                };

                pending_commands -= 1;
                finished_commands += 1;
                match self.finish_command(result) {
                    Err(err) => {
                        self.cleanup();
                        self.status.build_finished();
                        return Err(err);
                    }
                    Ok(success) => {
                        if !success && failures_allowed > 0 {
                            failures_allowed -= 1;
                        }
                    }
                }

                // We made some progress; start the main loop over.
                continue;
            }

            // If we get here, we cannot make any more progress.
            self.status.build_finished();
            if failures_allowed == 0 && !self.failed_edges.is_empty() {
                if self.config.logfiles_enabled {
                    self.write_failed_parts();
                }
                bail!(self.failure_summary());
            } else if failures_allowed < self.config.failures_allowed {
                bail!("cannot make progress due to previous errors");
            } else {
                bail!("stuck [this is a bug]");
            }
        }

        self.status.build_finished();
        self.runner.as_mut().unwrap().stop_watcher_process();
        Ok(finished_commands)
    }

    fn elapsed_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }

    fn start_edge(&mut self, edge: EdgeId) -> anyhow::Result<()> {
        if self.graph.edge(edge).is_phony() {
            return Ok(());
        }
        trace::scope("start_edge", || self.start_edge_impl(edge))
    }

    fn start_edge_impl(&mut self, edge: EdgeId) -> anyhow::Result<()> {
        let start_ms = self.elapsed_ms();
        self.running_edges.insert(edge, start_ms);
        self.status.build_edge_started(self.graph, edge, start_ms);

        // Create directories necessary for outputs, and remember the
        // current filesystem mtime to record later: the lock file's stamp is
        // the canonical command start time.
        let mut build_start = MTime::Unknown;
        for i in 0..self.graph.edge(edge).outs.len() {
            let out = self.graph.edge(edge).outs[i];
            let path = self.graph.node(out).path.clone();
            self.disk.make_dirs(&path)?;
            if !self.config.dry_run && build_start == MTime::Unknown {
                self.disk.write_file(&self.lock_file_path, "")?;
                build_start = match self.disk.stat(&self.lock_file_path) {
                    Ok(m @ MTime::Stamp(_)) => m,
                    _ => MTime::Missing,
                };
            }
        }
        self.graph.edge_mut(edge).command_start_time = build_start;

        // Create the response file, if needed.
        if !self.config.dry_run {
            if let Some(rsp) = self.graph.edge(edge).rspfile.clone() {
                self.disk.make_dirs(&rsp.path)?;
                self.disk.write_file(&rsp.path, &rsp.content)?;
            }
        }

        let cmdline = self
            .graph
            .edge(edge)
            .cmdline
            .clone()
            .expect("non-phony edge must have a command");
        let spec = CommandSpec {
            edge,
            cmdline: cmdline.clone(),
            rule: self.graph.edge(edge).rule.clone(),
        };
        if self.runner.as_mut().unwrap().start_command(spec).is_err() {
            bail!("command '{}' failed.", cmdline);
        }
        Ok(())
    }

    fn finish_command(&mut self, result: CommandResult) -> anyhow::Result<bool> {
        trace::scope("finish_command", || self.finish_command_impl(result))
    }

    fn finish_command_impl(&mut self, mut result: CommandResult) -> anyhow::Result<bool> {
        let edge = result.edge;

        // First extract dependencies from the result, if any.  This must
        // happen before deciding the outcome: it filters the command output
        // (/showIncludes lines go away even on compile failure), and
        // extraction failure turns a successful command into a failed one.
        let deps_type = self.graph.edge(edge).deps_type.clone();
        if let Some(t) = &deps_type {
            if t != "gcc" && t != "msvc" {
                bail!("unknown deps type '{}'", t);
            }
        }
        let mut deps_nodes: Vec<NodeId> = Vec::new();
        if deps_type.is_some() {
            match self.extract_deps(&mut result) {
                Ok(nodes) => deps_nodes = nodes,
                Err(err) => {
                    if result.status == Termination::Success {
                        if !result.output.is_empty() {
                            result.output.push(b'\n');
                        }
                        result.output.extend(err.to_string().into_bytes());
                        result.status = Termination::Failure;
                    }
                }
            }
        }

        let start_ms = self.running_edges.remove(&edge).unwrap_or(0);
        let end_ms = self.elapsed_ms();
        let success = result.status == Termination::Success;
        self.status
            .build_edge_finished(self.graph, edge, end_ms, success, &result.output);

        // The rest only applies to successful commands.
        if !success {
            self.failed_edges
                .push(format_target_name(&self.graph.edge(edge).rule));
            self.plan.edge_finished(self.graph, edge, EdgeResult::Failed);
            self.drain_dyndeps()?;
            return Ok(false);
        }

        // Restat the edge outputs.
        let mut record_mtime = MTime::Unknown;
        if !self.config.dry_run {
            let restat = self.graph.edge(edge).restat;
            let generator = self.graph.edge(edge).generator;
            let mut node_cleaned = false;
            record_mtime = self.graph.edge(edge).command_start_time;

            // Restat and generator rules stat the outputs after the build.
            // An unset record_mtime means the lock file stat failed when the
            // edge started; fall back to recording the outputs' own mtimes.
            if !record_mtime.exists() || restat || generator {
                for i in 0..self.graph.edge(edge).outs.len() {
                    let out = self.graph.edge(edge).outs[i];
                    let path = self.graph.node(out).path.clone();
                    let new_mtime = self.disk.stat(&path)?;
                    if new_mtime > record_mtime {
                        record_mtime = new_mtime;
                    }
                    if self.graph.node(out).mtime == new_mtime && restat {
                        // The command did not change the output.  Propagate
                        // the clean state through the build graph.  Note
                        // this also applies to nonexistent outputs.
                        let scan = DependencyScan {
                            disk: self.disk,
                            build_log: self.build_log.as_ref(),
                            deps_log: self.deps_log.as_ref(),
                            depfile_options: &self.config.depfile_parser_options,
                            skip_check_timestamp: self.config.skip_check_timestamp,
                        };
                        self.plan.clean_node(&scan, self.graph, out)?;
                        node_cleaned = true;
                    }
                }
            }
            if node_cleaned {
                // Cleaning cascaded: the build log should reflect the
                // logical start time, not the post-clean output times, so
                // downstream builds treat these outputs as sourced from the
                // original build.
                record_mtime = self.graph.edge(edge).command_start_time;

                // The total number of edges in the plan may have shrunk as a
                // result of the restat.
                self.status.plan_has_total_edges(self.plan.command_edge_count());
            }
        }

        self.plan.edge_finished(self.graph, edge, EdgeResult::Succeeded);
        self.drain_dyndeps()?;

        // Delete any leftover response file.
        if !self.config.dry_run && !self.config.keep_rsp {
            if let Some(rsp) = self.graph.edge(edge).rspfile.clone() {
                let _ = self.disk.remove_file(&rsp.path);
            }
        }

        if let Some(log) = &mut self.build_log {
            log.record_command(self.graph, edge, start_ms, end_ms, record_mtime)
                .map_err(|err| anyhow!("Error writing to build log: {}", err))?;
        }

        if deps_type.is_some() && !self.config.dry_run {
            let dep_paths: Vec<String> = deps_nodes
                .iter()
                .map(|&n| self.graph.node(n).path.clone())
                .collect();
            for i in 0..self.graph.edge(edge).outs.len() {
                let out = self.graph.edge(edge).outs[i];
                let path = self.graph.node(out).path.clone();
                let deps_mtime = self.disk.stat(&path)?;
                if let Some(log) = &mut self.deps_log {
                    log.record_deps(&path, deps_mtime, &dep_paths)
                        .map_err(|err| anyhow!("Error writing to deps log: {}", err))?;
                }
            }
        }

        Ok(true)
    }

    fn extract_deps(&mut self, result: &mut CommandResult) -> anyhow::Result<Vec<NodeId>> {
        let edge = result.edge;
        match self.graph.edge(edge).deps_type.as_deref() {
            Some("msvc") => {
                let prefix = self
                    .graph
                    .edge(edge)
                    .msvc_deps_prefix
                    .clone()
                    .unwrap_or_else(|| clparser::DEFAULT_DEPS_PREFIX.to_string());
                let parsed = clparser::parse(&result.output, &prefix);
                result.output = parsed.output;
                Ok(parsed
                    .includes
                    .into_iter()
                    // With msvc-parsed headers it's fine to fold every
                    // separator to a forward slash; some of them certainly
                    // are backslashes anyway.
                    .map(|p| self.graph.dep_file_id(canon_path_all_slashes(p)))
                    .collect())
            }
            Some("gcc") => {
                let depfile = match self.graph.edge(edge).depfile.clone() {
                    Some(d) => d,
                    None => bail!("edge with deps=gcc but no depfile makes no sense"),
                };

                // A missing depfile is empty, not an error.
                let mut bytes = match self.disk.read_file(&depfile)? {
                    FileRead::Okay(b) => b,
                    FileRead::NotFound => return Ok(Vec::new()),
                };
                if bytes.is_empty() {
                    return Ok(Vec::new());
                }

                bytes.push(0);
                let mut scanner = Scanner::new(&bytes);
                let parsed = depfile::parse(&mut scanner, &self.config.depfile_parser_options)
                    .map_err(|err| {
                        anyhow!(scanner.format_parse_error(Path::new(&depfile), err))
                    })?;
                let mut nodes = Vec::new();
                for (_target, deps) in parsed.iter() {
                    for dep in deps {
                        nodes.push(self.graph.dep_file_id(canon_path(*dep)));
                    }
                }

                if !self.config.keep_depfile {
                    self.disk
                        .remove_file(&depfile)
                        .map_err(|err| anyhow!("deleting depfile: {}", err))?;
                }
                Ok(nodes)
            }
            other => unreachable!("deps type {:?} validated by finish_command", other),
        }
    }

    fn drain_dyndeps(&mut self) -> anyhow::Result<()> {
        while let Some(node) = self.plan.take_pending_dyndep() {
            self.load_dyndeps(node)?;
        }
        Ok(())
    }

    /// Load the now-clean dyndep file and fold the discovered dependencies
    /// into the plan.
    fn load_dyndeps(&mut self, node: NodeId) -> anyhow::Result<()> {
        self.status.build_load_dyndeps();

        let scan = DependencyScan {
            disk: self.disk,
            build_log: self.build_log.as_ref(),
            deps_log: self.deps_log.as_ref(),
            depfile_options: &self.config.depfile_parser_options,
            skip_check_timestamp: self.config.skip_check_timestamp,
        };
        let ddf = scan.load_dyndeps(self.graph, node)?;
        self.plan.dyndeps_loaded(&scan, self.graph, node, &ddf)?;

        // New command edges may have been added to the plan.
        self.status.plan_has_total_edges(self.plan.command_edge_count());
        Ok(())
    }

    fn failure_summary(&self) -> String {
        let quoted: Vec<String> = self
            .failed_edges
            .iter()
            .map(|name| format!("\"{}\"", name))
            .collect();
        if self.config.failures_allowed > 1 {
            format!(
                "subcommands failed\n ----- These parts have an errors: {}  -----",
                quoted.join(" ")
            )
        } else {
            format!(
                "subcommand failed\n ----- This part has an error: {} -----",
                quoted.join(" ")
            )
        }
    }

    fn write_failed_parts(&self) {
        let mut content = String::new();
        for name in &self.failed_edges {
            content.push_str(name);
            content.push(' ');
        }
        let path = format!("{}/failed_parts", self.config.logs_dir);
        let _ = self.disk.write_file(&path, &content);
    }

    /// Abort in-flight work and remove outputs that can no longer be
    /// trusted: an output is deleted iff its mtime changed since build start
    /// or the edge uses a depfile (a depfile-using command can touch headers
    /// and depfiles before its outputs).
    pub fn cleanup(&mut self) {
        if let Some(runner) = &mut self.runner {
            let active_edges = runner.get_active_edges();
            runner.abort();

            for edge in active_edges {
                let depfile = self.graph.edge(edge).depfile.clone();
                for i in 0..self.graph.edge(edge).outs.len() {
                    let out = self.graph.edge(edge).outs[i];
                    let path = self.graph.node(out).path.clone();
                    match self.disk.stat(&path) {
                        Err(err) => {
                            // Log and ignore stat errors.
                            self.status.error(&err.to_string());
                        }
                        Ok(new_mtime) => {
                            if depfile.is_some() || self.graph.node(out).mtime != new_mtime {
                                let _ = self.disk.remove_file(&path);
                            }
                        }
                    }
                }
                if let Some(depfile) = &depfile {
                    let _ = self.disk.remove_file(depfile);
                }
            }
        }

        if let Ok(MTime::Stamp(_)) = self.disk.stat(&self.lock_file_path) {
            let _ = self.disk.remove_file(&self.lock_file_path);
        }
    }
}

impl Drop for Builder<'_> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::VirtualDisk;
    use crate::graph::Edge;

    /// Status implementation that records events for assertions.
    #[derive(Default)]
    struct FakeStatus {
        started: Vec<EdgeId>,
        finished: Vec<(EdgeId, bool)>,
        totals: Vec<usize>,
    }

    impl Status for FakeStatus {
        fn build_started(&mut self) {}
        fn plan_has_total_edges(&mut self, total: usize) {
            self.totals.push(total);
        }
        fn build_edge_started(&mut self, _graph: &Graph, edge: EdgeId, _start_ms: i64) {
            self.started.push(edge);
        }
        fn build_edge_finished(
            &mut self,
            _graph: &Graph,
            edge: EdgeId,
            _end_ms: i64,
            success: bool,
            _output: &[u8],
        ) {
            self.finished.push((edge, success));
        }
        fn build_load_dyndeps(&mut self) {}
        fn build_finished(&mut self) {}
        fn error(&mut self, _msg: &str) {}
    }

    fn add_edge(g: &mut Graph, rule: &str, ins: &[NodeId], outs: &[NodeId]) -> EdgeId {
        let mut e = Edge::new(rule);
        e.cmdline = Some(rule.to_string());
        e.ins = ins.to_vec();
        e.outs = outs.to_vec();
        g.add_edge(e)
    }

    fn dry_run_config() -> BuildConfig {
        BuildConfig {
            dry_run: true,
            parallelism: 4,
            ..BuildConfig::default()
        }
    }

    #[test]
    fn up_to_date_build_runs_nothing() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        disk.add_file("src", "");
        disk.add_file("out", "");
        let config = dry_run_config();
        let mut status = FakeStatus::default();

        let mut g = Graph::new();
        let src = g.file_id("src");
        let out = g.file_id("out");
        add_edge(&mut g, "cc", &[src], &[out]);

        let mut builder = Builder::new(&mut g, &config, None, None, &disk, &mut status)?;
        builder.add_target_by_name("out")?;
        assert!(builder.already_up_to_date());
        assert_eq!(builder.build()?, 0);
        drop(builder);
        assert!(status.started.is_empty());
        Ok(())
    }

    #[test]
    fn dry_run_chain_runs_in_order_without_touching_disk() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        disk.add_file("b", "");
        disk.add_file("sub/c", "");
        disk.add_file("a", ""); // newest: dirties the chain
        let config = dry_run_config();
        let mut status = FakeStatus::default();

        let mut g = Graph::new();
        let a = g.file_id("a");
        let b = g.file_id("b");
        let c = g.file_id("sub/c");
        let cc = add_edge(&mut g, "cc", &[a], &[b]);
        let ld = add_edge(&mut g, "ld", &[b], &[c]);

        let files_before = disk.mtime("b");

        let mut builder = Builder::new(&mut g, &config, None, None, &disk, &mut status)?;
        builder.add_target_by_name("sub/c")?;
        assert!(!builder.already_up_to_date());
        assert_eq!(builder.build()?, 2);
        drop(builder);

        assert_eq!(status.started, vec![cc, ld]);
        assert_eq!(status.finished, vec![(cc, true), (ld, true)]);
        assert_eq!(status.totals.first(), Some(&2));

        // A dry run only creates output directories.
        assert_eq!(disk.mtime("b"), files_before);
        assert!(!disk.exists(".ninja_lock"));
        assert_eq!(disk.made_dirs(), vec!["sub".to_string()]);
        Ok(())
    }

    #[test]
    fn missing_source_fails_target_admission() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        let config = dry_run_config();
        let mut status = FakeStatus::default();

        let mut g = Graph::new();
        let src = g.file_id("missing.c");
        let out = g.file_id("out");
        add_edge(&mut g, "cc", &[src], &[out]);

        let mut builder = Builder::new(&mut g, &config, None, None, &disk, &mut status)?;
        let err = builder.add_target_by_name("out").unwrap_err().to_string();
        assert_eq!(
            err,
            "'missing.c', needed by 'out', missing and no known rule to make it"
        );
        Ok(())
    }

    #[test]
    fn unknown_target_name() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        let config = dry_run_config();
        let mut status = FakeStatus::default();
        let mut g = Graph::new();
        let mut builder = Builder::new(&mut g, &config, None, None, &disk, &mut status)?;
        let err = builder.add_target_by_name("nope").unwrap_err().to_string();
        assert_eq!(err, "unknown target: 'nope'");
        Ok(())
    }

    #[test]
    fn unknown_deps_type_is_fatal() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        disk.add_file("src", "");
        let config = dry_run_config();
        let mut status = FakeStatus::default();

        let mut g = Graph::new();
        let src = g.file_id("src");
        let out = g.file_id("out");
        let mut e = Edge::new("cc");
        e.cmdline = Some("cc".to_string());
        e.deps_type = Some("weird".to_string());
        e.ins = vec![src];
        e.outs = vec![out];
        g.add_edge(e);

        let mut builder = Builder::new(&mut g, &config, None, None, &disk, &mut status)?;
        builder.add_target_by_name("out")?;
        let err = builder.build().unwrap_err().to_string();
        assert_eq!(err, "unknown deps type 'weird'");
        Ok(())
    }

    #[test]
    fn phony_edges_complete_inline() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        disk.add_file("src", "");
        let config = dry_run_config();
        let mut status = FakeStatus::default();

        let mut g = Graph::new();
        let src = g.file_id("src");
        let out = g.file_id("out");
        let all = g.file_id("all");
        add_edge(&mut g, "cc", &[src], &[out]);
        let mut phony = Edge::new("phony");
        phony.ins = vec![out];
        phony.outs = vec![all];
        g.add_edge(phony);

        let mut builder = Builder::new(&mut g, &config, None, None, &disk, &mut status)?;
        builder.add_target_by_name("all")?;
        // Only the cc command counts; the phony completes inline.
        assert_eq!(builder.build()?, 1);
        Ok(())
    }

    #[test]
    fn validation_nodes_build_as_side_targets() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        disk.add_file("src", "");
        let config = dry_run_config();
        let mut status = FakeStatus::default();

        let mut g = Graph::new();
        let src = g.file_id("src");
        let out = g.file_id("out");
        let check = g.file_id("check");
        let mut e = Edge::new("cc");
        e.cmdline = Some("cc".to_string());
        e.ins = vec![src];
        e.outs = vec![out];
        e.validations = vec![check];
        g.add_edge(e);
        add_edge(&mut g, "lint", &[src], &[check]);

        let mut builder = Builder::new(&mut g, &config, None, None, &disk, &mut status)?;
        builder.add_target_by_name("out")?;
        // The validation edge was pulled in alongside the requested target.
        assert_eq!(builder.build()?, 2);
        Ok(())
    }

    #[test]
    fn failure_summaries_match_expected_format() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        let mut status = FakeStatus::default();
        let mut g = Graph::new();

        let mut config = dry_run_config();
        config.failures_allowed = 2;
        let mut builder = Builder::new(&mut g, &config, None, None, &disk, &mut status)?;
        builder.failed_edges = vec!["e1".to_string(), "e2".to_string()];
        assert_eq!(
            builder.failure_summary(),
            "subcommands failed\n ----- These parts have an errors: \"e1\" \"e2\"  -----"
        );
        drop(builder);

        let mut config = dry_run_config();
        config.failures_allowed = 1;
        let mut builder = Builder::new(&mut g, &config, None, None, &disk, &mut status)?;
        builder.failed_edges = vec!["e1".to_string()];
        assert_eq!(
            builder.failure_summary(),
            "subcommand failed\n ----- This part has an error: \"e1\" -----"
        );
        Ok(())
    }

    #[test]
    fn logs_dir_created_on_construction() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        let mut status = FakeStatus::default();
        let mut g = Graph::new();
        let mut config = dry_run_config();
        config.logfiles_enabled = true;
        config.logs_dir = "build/logs".to_string();
        let _builder = Builder::new(&mut g, &config, None, None, &disk, &mut status)?;
        assert!(disk
            .made_dirs()
            .contains(&"build/logs".to_string()));
        Ok(())
    }

    #[test]
    fn cleanup_removes_lock_file() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        disk.add_file(".ninja_lock", "");
        let mut status = FakeStatus::default();
        let config = dry_run_config();
        let mut g = Graph::new();
        let mut builder = Builder::new(&mut g, &config, None, None, &disk, &mut status)?;
        builder.cleanup();
        assert!(!disk.exists(".ninja_lock"));
        Ok(())
    }

    #[test]
    fn lock_file_respects_build_dir() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        let mut status = FakeStatus::default();
        let config = dry_run_config();
        let mut g = Graph::new();
        g.build_dir = Some("out".to_string());
        let builder = Builder::new(&mut g, &config, None, None, &disk, &mut status)?;
        assert_eq!(builder.lock_file_path, "out/.ninja_lock");
        Ok(())
    }
}
