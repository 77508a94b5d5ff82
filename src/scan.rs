//! Dirty-state recomputation: walks the transitive input graph of a target,
//! stats files, consults the build and deps logs, and decides which edges
//! must run.  The scanner is the only component that reads file mtimes or
//! the build log.

use crate::build_log::{self, BuildLog};
use crate::depfile::{self, DepfileParserOptions};
use crate::deps_log::DepsLog;
use crate::disk::{DiskInterface, FileRead, MTime};
use crate::dyndep::{self, DyndepFile};
use crate::graph::{EdgeId, Graph, NodeId, VisitMark};
use crate::scanner::Scanner;
use anyhow::{anyhow, bail};
use std::collections::VecDeque;
use std::path::Path;

pub struct DependencyScan<'a> {
    pub disk: &'a dyn DiskInterface,
    pub build_log: Option<&'a BuildLog>,
    pub deps_log: Option<&'a DepsLog>,
    pub depfile_options: &'a DepfileParserOptions,
    /// Suppress mtime comparisons; missing outputs and changed commands
    /// still dirty an edge.
    pub skip_check_timestamp: bool,
}

impl<'a> DependencyScan<'a> {
    /// Update the dirty state of the given node by transitively inspecting
    /// its input graph.  Examine all outputs of an edge before deciding the
    /// edge itself.  Returns validation nodes declared by visited edges,
    /// which the caller must add as side-targets.
    pub fn recompute_dirty(&self, graph: &mut Graph, node: NodeId) -> anyhow::Result<Vec<NodeId>> {
        let mut validations = Vec::new();
        let mut stack = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(node);
        // Visiting an edge may surface validation nodes that need their own
        // dirty check; keep a queue of roots to visit.
        while let Some(node) = queue.pop_front() {
            stack.clear();
            let mut new_validations = Vec::new();
            self.recompute_node_dirty(graph, node, &mut stack, &mut new_validations)?;
            queue.extend(new_validations.iter().copied());
            validations.extend(new_validations);
        }
        Ok(validations)
    }

    fn stat_if_necessary(&self, graph: &mut Graph, node: NodeId) -> anyhow::Result<()> {
        if !graph.node(node).status_known() {
            let mtime = self.disk.stat(&graph.node(node).path)?;
            graph.node_mut(node).mtime = mtime;
        }
        Ok(())
    }

    fn recompute_node_dirty(
        &self,
        graph: &mut Graph,
        node: NodeId,
        stack: &mut Vec<NodeId>,
        validations: &mut Vec<NodeId>,
    ) -> anyhow::Result<()> {
        let edge = match graph.node(node).in_edge {
            None => {
                // Source file (or dep-loader-discovered input).  Dirty when
                // missing; what that means is up to the consumer.
                if graph.node(node).status_known() {
                    return Ok(());
                }
                self.stat_if_necessary(graph, node)?;
                graph.node_mut(node).dirty = !graph.node(node).exists();
                return Ok(());
            }
            Some(e) => e,
        };

        match graph.mark(edge) {
            VisitMark::Done => return Ok(()),
            VisitMark::InStack => return Err(anyhow!(self.cycle_error(graph, node, stack))),
            VisitMark::None => {}
        }
        graph.set_mark(edge, VisitMark::InStack);
        stack.push(node);

        let first_visit = !graph.edge(edge).deps_loaded;
        let mut dirty = false;
        graph.edge_mut(edge).outputs_ready = true;
        graph.edge_mut(edge).deps_missing = false;

        if first_visit {
            // If there is a pending dyndep file, visit it now.  When it is
            // already clean on disk, load it immediately so this edge's
            // discovered inputs take part in the walk below; otherwise it is
            // an input of this edge, so the edge stays unready until the
            // build produces and loads it.
            if let Some(dd) = graph.edge(edge).dyndep {
                if graph.node(dd).dyndep_pending {
                    self.recompute_node_dirty(graph, dd, stack, validations)?;
                    let ready = match graph.node(dd).in_edge {
                        None => true,
                        Some(e) => graph.edge(e).outputs_ready,
                    };
                    if ready {
                        self.load_dyndeps(graph, dd)?;
                    }
                }
            }
        }

        // Load output mtimes so we can compare them to the most recent
        // input below.
        for i in 0..graph.edge(edge).outs.len() {
            let out = graph.edge(edge).outs[i];
            self.stat_if_necessary(graph, out)?;
        }

        if first_visit {
            graph.edge_mut(edge).deps_loaded = true;
            if !self.load_deps(graph, edge)? {
                // Failed to find recorded dependency info: rebuild the edge
                // to regenerate it.
                dirty = true;
                graph.edge_mut(edge).deps_missing = true;
            }
            // Store any validation nodes from the edge for the caller to add
            // as initial nodes.  Don't recurse into them here; that would
            // trip the cycle detector when a validation depends on this node.
            validations.extend(graph.edge(edge).validations.iter().copied());
        }

        // Visit all inputs; we're dirty if any of them are.
        let mut most_recent_input: Option<NodeId> = None;
        let mut i = 0;
        while i < graph.edge(edge).ins.len() {
            let input = graph.edge(edge).ins[i];
            self.recompute_node_dirty(graph, input, stack, validations)?;

            // If an input is not ready, neither are our outputs.
            if let Some(in_edge) = graph.node(input).in_edge {
                if !graph.edge(in_edge).outputs_ready {
                    graph.edge_mut(edge).outputs_ready = false;
                }
            }

            if !graph.edge(edge).is_order_only(i) {
                if graph.node(input).dirty {
                    dirty = true;
                } else {
                    let newer = match most_recent_input {
                        None => true,
                        Some(m) => graph.node(input).mtime > graph.node(m).mtime,
                    };
                    if newer {
                        most_recent_input = Some(input);
                    }
                }
            }
            i += 1;
        }

        // We may also be dirty due to output state: missing outputs, out of
        // date outputs, etc.
        if !dirty {
            dirty = self.recompute_outputs_dirty(graph, edge, most_recent_input)?;
        }

        if dirty {
            for i in 0..graph.edge(edge).outs.len() {
                let out = graph.edge(edge).outs[i];
                graph.node_mut(out).dirty = true;
            }
        }

        // A dirty edge's outputs are not ready.  Phony edges with no inputs
        // have nothing to do, so they stay ready.
        if dirty && !(graph.edge(edge).is_phony() && graph.edge(edge).ins.is_empty()) {
            graph.edge_mut(edge).outputs_ready = false;
        }

        graph.set_mark(edge, VisitMark::Done);
        debug_assert_eq!(stack.last(), Some(&node));
        stack.pop();
        Ok(())
    }

    fn cycle_error(&self, graph: &Graph, node: NodeId, stack: &[NodeId]) -> String {
        let edge = graph.node(node).in_edge;
        // Report the cycle from the node at its end, not some other output
        // of the starting edge.
        let start = stack
            .iter()
            .position(|&n| graph.node(n).in_edge == edge)
            .unwrap_or(0);
        let mut err = "dependency cycle: ".to_string();
        err.push_str(&graph.node(node).path);
        for &n in &stack[start + 1..] {
            err.push_str(" -> ");
            err.push_str(&graph.node(n).path);
        }
        err.push_str(" -> ");
        err.push_str(&graph.node(node).path);
        err
    }

    /// Load discovered-dependency info for an edge: from the deps log when
    /// the edge records deps there, else from its depfile.  Returns false
    /// when the info is missing or stale, which dirties the edge.
    fn load_deps(&self, graph: &mut Graph, edge: EdgeId) -> anyhow::Result<bool> {
        if graph.edge(edge).deps_type.is_some() {
            return self.load_deps_from_log(graph, edge);
        }
        if graph.edge(edge).depfile.is_some() {
            return self.load_depfile(graph, edge);
        }
        Ok(true)
    }

    fn insert_discovered_deps(&self, graph: &mut Graph, edge: EdgeId, deps: &[String]) {
        for path in deps {
            let id = graph.dep_file_id(crate::canon::canon_path(path.as_str()));
            let implicit_end = {
                let e = graph.edge(edge);
                e.ins.len() - e.order_only
            };
            graph.edge_mut(edge).ins.insert(implicit_end, id);
            graph.node_mut(id).out_edges.push(edge);
        }
    }

    fn load_deps_from_log(&self, graph: &mut Graph, edge: EdgeId) -> anyhow::Result<bool> {
        let out = graph.edge(edge).outs[0];
        let entry = match self.deps_log.and_then(|log| log.get_deps(&graph.node(out).path)) {
            None => return Ok(false),
            Some(e) => e.clone(),
        };
        // Deps recorded before the output was last written may be stale.
        if graph.node(out).mtime > MTime::Stamp(entry.mtime) {
            return Ok(false);
        }
        self.insert_discovered_deps(graph, edge, &entry.deps);
        Ok(true)
    }

    fn load_depfile(&self, graph: &mut Graph, edge: EdgeId) -> anyhow::Result<bool> {
        let depfile = graph.edge(edge).depfile.clone().unwrap();
        let mut bytes = match self.disk.read_file(&depfile)? {
            FileRead::Okay(b) => b,
            FileRead::NotFound => return Ok(false),
        };
        bytes.push(0);
        let mut scanner = Scanner::new(&bytes);
        let parsed = depfile::parse(&mut scanner, self.depfile_options)
            .map_err(|err| anyhow!(scanner.format_parse_error(Path::new(&depfile), err)))?;
        let out_path = graph.node(graph.edge(edge).outs[0]).path.clone();
        let deps: Vec<String> = match parsed.get(out_path.as_str()) {
            Some(deps) => deps.iter().map(|d| d.to_string()).collect(),
            None => bail!("expected depfile {:?} to mention {:?}", depfile, out_path),
        };
        self.insert_discovered_deps(graph, edge, &deps);
        Ok(true)
    }

    /// Load a now-clean dyndep file, folding its contributions into the
    /// graph, and return them for plan integration.
    pub fn load_dyndeps(&self, graph: &mut Graph, node: NodeId) -> anyhow::Result<DyndepFile> {
        let path = graph.node(node).path.clone();
        let mut bytes = match self.disk.read_file(&path)? {
            FileRead::Okay(b) => b,
            FileRead::NotFound => bail!("loading {:?}: file missing", path),
        };
        bytes.push(0);
        let mut scanner = Scanner::new(&bytes);
        let ddf = dyndep::parse(graph, &mut scanner)
            .map_err(|err| anyhow!(scanner.format_parse_error(Path::new(&path), err)))?;
        for (edge, _) in ddf.iter() {
            if graph.edge(*edge).dyndep != Some(node) {
                bail!(
                    "dyndep file {:?} mentions output {:?} whose build statement does not have a dyndep binding for the file",
                    path,
                    graph.node(graph.edge(*edge).outs[0]).path
                );
            }
        }
        for (edge, dyndeps) in ddf.iter() {
            dyndep::update_edge(graph, *edge, dyndeps);
        }
        graph.node_mut(node).dyndep_pending = false;
        Ok(ddf)
    }

    /// Recompute whether any output of the edge is dirty given the most
    /// recent input mtime.  Used by restat cleaning to re-decide an edge
    /// after its inputs came clean.
    pub fn recompute_outputs_dirty(
        &self,
        graph: &Graph,
        edge: EdgeId,
        most_recent_input: Option<NodeId>,
    ) -> anyhow::Result<bool> {
        for &out in &graph.edge(edge).outs {
            if self.recompute_output_dirty(graph, edge, most_recent_input, out) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn recompute_output_dirty(
        &self,
        graph: &Graph,
        edge: EdgeId,
        most_recent_input: Option<NodeId>,
        output: NodeId,
    ) -> bool {
        let e = graph.edge(edge);
        if e.is_phony() {
            // Phony edges don't write any output.  Outputs are only dirty if
            // there are no inputs and we're missing the output.
            return e.ins.is_empty() && !graph.node(output).exists();
        }

        let out_node = graph.node(output);
        if !out_node.exists() {
            return true;
        }

        let input_mtime = most_recent_input.map(|i| graph.node(i).mtime);

        // If this is a restat rule, we may have cleaned the output in a
        // previous run and stored the most recent input mtime in the build
        // log.  Use that mtime instead, so the output is only considered
        // dirty if an input changed since the previous run.
        let mut log_entry: Option<&build_log::LogEntry> = None;
        let mut output_mtime = out_node.mtime;
        if e.restat {
            if let Some(entry) = self
                .build_log
                .and_then(|log| log.lookup_by_output(&out_node.path))
            {
                output_mtime = MTime::Stamp(entry.mtime);
                log_entry = Some(entry);
            }
        }

        if !self.skip_check_timestamp {
            if let Some(input_mtime) = input_mtime {
                if output_mtime < input_mtime {
                    return true;
                }
            }
        }

        if let Some(log) = self.build_log {
            let entry = log_entry.or_else(|| log.lookup_by_output(&out_node.path));
            match entry {
                Some(entry) => {
                    // Dirty when the command changed since the last run,
                    // unless this is a generator rule.
                    if !e.generator {
                        let hash = build_log::hash_command(e.cmdline.as_deref().unwrap_or(""));
                        if hash != entry.command_hash {
                            return true;
                        }
                    }
                    // The mtime in the log can be older than the mtime on
                    // disk when a previous run wrote the output but did not
                    // log it; treat that as dirty too.
                    if !self.skip_check_timestamp {
                        if let Some(input_mtime) = input_mtime {
                            if MTime::Stamp(entry.mtime) < input_mtime {
                                return true;
                            }
                        }
                    }
                }
                None => {
                    if !e.generator {
                        // Command line never logged: never built before.
                        return true;
                    }
                }
            }
        }

        false
    }
}
