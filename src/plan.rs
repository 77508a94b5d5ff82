//! The build plan: tracks which edges we want to build, which are ready to
//! run, and in what order, while the graph grows underneath it as dynamic
//! dependency information is discovered.

use crate::graph::{EdgeId, Graph, NodeId, PoolId, QueuedEdge, VisitMark};
use crate::scan::DependencyScan;
use crate::trace;
use anyhow::bail;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

/// How much of an edge the plan wants done.  An edge moves monotonically
/// from Nothing through ToStart to ToFinish, except that restat cleaning may
/// back a ToStart edge out to Nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Want {
    /// We do not want to build the edge, but we want to build one of its
    /// dependents, so we walked through it.
    Nothing,
    /// We want to build the edge, but it has not been scheduled yet.
    ToStart,
    /// We want to build the edge and have scheduled it.
    ToFinish,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeResult {
    Failed,
    Succeeded,
}

pub struct Plan {
    /// Top-level user targets, in request order.
    targets: Vec<NodeId>,
    /// Every edge the plan has touched, and how much of it we want.
    want: HashMap<EdgeId, Want>,
    /// Edges with want = ToStart whose inputs are all ready, highest
    /// critical-path weight first.
    ready: BinaryHeap<QueuedEdge>,
    /// Insertion stamp for deterministic heap tie-breaking.
    next_seq: u64,
    /// Count of edges with want != Nothing.
    wanted_edges: usize,
    /// Non-phony subset of wanted edges, as reported to status.
    command_edges: usize,
    /// Dyndep nodes whose producers finished; the builder loads these and
    /// feeds the result back through dyndeps_loaded before dispatching more
    /// work.
    pending_dyndeps: VecDeque<NodeId>,
}

impl Plan {
    pub fn new() -> Self {
        Plan {
            targets: Vec::new(),
            want: HashMap::new(),
            ready: BinaryHeap::new(),
            next_seq: 0,
            wanted_edges: 0,
            command_edges: 0,
            pending_dyndeps: VecDeque::new(),
        }
    }

    /// True if there's more work to be done.
    pub fn more_to_do(&self) -> bool {
        self.wanted_edges > 0
    }

    /// Number of edges with commands to run, as announced to status.
    pub fn command_edge_count(&self) -> usize {
        self.command_edges
    }

    pub fn wanted_edge_count(&self) -> usize {
        self.wanted_edges
    }

    pub fn want_state(&self, edge: EdgeId) -> Option<Want> {
        self.want.get(&edge).copied()
    }

    /// Add a target to the plan, pulling in its transitive not-yet-ready
    /// input closure.
    pub fn add_target(&mut self, graph: &mut Graph, node: NodeId) -> anyhow::Result<()> {
        self.targets.push(node);
        self.add_sub_target(graph, node, None, None)?;
        Ok(())
    }

    fn add_sub_target(
        &mut self,
        graph: &Graph,
        node: NodeId,
        dependent: Option<NodeId>,
        mut dyndep_walk: Option<&mut HashSet<EdgeId>>,
    ) -> anyhow::Result<bool> {
        let edge = match graph.node(node).in_edge {
            None => {
                // Leaf node: either a regular source from the manifest, or an
                // implicit input discovered by a depfile or dyndep file.  In
                // the first case a dirty flag means the file is missing and
                // the build must stop; in the second there is no producing
                // edge to add.
                let n = graph.node(node);
                if n.dirty && !n.generated_by_dep_loader {
                    let referenced = match dependent {
                        Some(d) => format!(", needed by '{}',", graph.node(d).path),
                        None => String::new(),
                    };
                    bail!("'{}'{} missing and no known rule to make it", n.path, referenced);
                }
                return Ok(false);
            }
            Some(e) => e,
        };

        if graph.edge(edge).outputs_ready {
            return Ok(false); // Don't need to do anything.
        }

        // If the edge has no want entry yet, create one mapping to Nothing,
        // meaning we do not yet want to build the edge itself.
        let newly_inserted = match self.want.get(&edge) {
            None => {
                self.want.insert(edge, Want::Nothing);
                true
            }
            Some(_) => false,
        };

        if dyndep_walk.is_some() && self.want[&edge] == Want::ToFinish {
            return Ok(false); // Already-scheduled edge, nothing to do.
        }

        // If we do need to build the edge and haven't marked it wanted yet,
        // mark it now.
        if graph.node(node).dirty && self.want[&edge] == Want::Nothing {
            self.want.insert(edge, Want::ToStart);
            self.edge_wanted(graph, edge);
        }

        if let Some(walk) = dyndep_walk.as_deref_mut() {
            walk.insert(edge);
        }

        if !newly_inserted {
            return Ok(true); // We've already processed the inputs.
        }

        for i in 0..graph.edge(edge).ins.len() {
            let input = graph.edge(edge).ins[i];
            self.add_sub_target(graph, input, Some(node), dyndep_walk.as_deref_mut())?;
        }

        Ok(true)
    }

    fn edge_wanted(&mut self, graph: &Graph, edge: EdgeId) {
        self.wanted_edges += 1;
        if !graph.edge(edge).is_phony() {
            self.command_edges += 1;
        }
    }

    /// Pop the most important ready edge, if any.
    pub fn find_work(&mut self) -> Option<EdgeId> {
        self.ready.pop().map(|qe| qe.id)
    }

    fn queued(&mut self, graph: &Graph, edge: EdgeId) -> QueuedEdge {
        let seq = self.next_seq;
        self.next_seq += 1;
        QueuedEdge {
            id: edge,
            weight: graph.edge(edge).critical_path_weight,
            seq,
        }
    }

    /// Submit a ToStart edge for execution, routing it through its pool.
    fn schedule_work(&mut self, graph: &mut Graph, edge: EdgeId) {
        match self.want[&edge] {
            Want::ToFinish => {
                // This edge has already been scheduled.  We can get here
                // again if an edge and one of its dependencies share an
                // order-only input, or if a node duplicates an out edge.
                return;
            }
            Want::ToStart => {}
            Want::Nothing => panic!("scheduling edge the plan does not want"),
        }
        self.want.insert(edge, Want::ToFinish);

        let qe = self.queued(graph, edge);
        let weight = graph.edge(edge).weight();
        let pool_id = graph.edge(edge).pool;
        let pool = graph.pool_mut(pool_id);
        if pool.should_delay_edge() {
            pool.delay_edge(qe);
            pool.retrieve_ready_edges(&mut self.ready);
        } else {
            pool.edge_scheduled(weight);
            self.ready.push(qe);
        }
    }

    /// Mark an edge as done, whether it succeeded or failed, and on success
    /// propagate readiness to its dependents.
    pub fn edge_finished(&mut self, graph: &mut Graph, edge: EdgeId, result: EdgeResult) {
        let directly_wanted = self
            .want
            .get(&edge)
            .map(|&w| w != Want::Nothing)
            .expect("finished edge must be in the plan");

        // See if this job frees up any delayed jobs.
        let weight = graph.edge(edge).weight();
        let pool_id = graph.edge(edge).pool;
        if directly_wanted {
            graph.pool_mut(pool_id).edge_finished(weight);
        }
        graph
            .pool_mut(pool_id)
            .retrieve_ready_edges(&mut self.ready);

        // The rest only applies to successful commands; a failed edge stays
        // in the want map for bookkeeping.
        if result != EdgeResult::Succeeded {
            return;
        }

        if directly_wanted {
            self.wanted_edges -= 1;
        }
        self.want.remove(&edge);
        graph.edge_mut(edge).outputs_ready = true;

        // Check off any nodes we were waiting for with this edge.
        for i in 0..graph.edge(edge).outs.len() {
            let out = graph.edge(edge).outs[i];
            self.node_finished(graph, out);
        }
    }

    fn node_finished(&mut self, graph: &mut Graph, node: NodeId) {
        // If this node provides dyndep info, it must be loaded before its
        // consumers learn about it; queue it for the builder, which loads
        // the file and calls dyndeps_loaded before dispatching more work.
        if graph.node(node).dyndep_pending {
            self.pending_dyndeps.push_back(node);
            return;
        }

        // See if we want any edges from this node.
        for oe in graph.node(node).out_edges.clone() {
            if self.want.contains_key(&oe) {
                self.edge_maybe_ready(graph, oe);
            }
        }
    }

    /// The next dyndep node awaiting a load, if any.
    pub fn take_pending_dyndep(&mut self) -> Option<NodeId> {
        self.pending_dyndeps.pop_front()
    }

    fn edge_maybe_ready(&mut self, graph: &mut Graph, edge: EdgeId) {
        if !graph.all_inputs_ready(edge) {
            return;
        }
        if self.want[&edge] != Want::Nothing {
            self.schedule_work(graph, edge);
        } else {
            // We do not need to build this edge, but we might need to build
            // one of its dependents.
            self.edge_finished(graph, edge, EdgeResult::Succeeded);
        }
    }

    /// Restat cleaning: node turned out unchanged, so re-decide its
    /// consumers; any whose outputs prove clean drop out of the plan.
    pub fn clean_node(
        &mut self,
        scan: &DependencyScan,
        graph: &mut Graph,
        node: NodeId,
    ) -> anyhow::Result<()> {
        graph.node_mut(node).dirty = false;

        for oe in graph.node(node).out_edges.clone() {
            // Don't process edges we don't actually want.
            match self.want.get(&oe) {
                None | Some(Want::Nothing) => continue,
                Some(_) => {}
            }

            // Don't attempt to clean an edge if it failed to load deps.
            if graph.edge(oe).deps_missing {
                continue;
            }

            // If all non-order-only inputs for this edge are now clean, we
            // might have changed the dirty state of the outputs.
            let build_ins = graph.edge(oe).build_ins().to_vec();
            if build_ins.iter().any(|&i| graph.node(i).dirty) {
                continue;
            }

            let mut most_recent_input: Option<NodeId> = None;
            for &input in &build_ins {
                let newer = match most_recent_input {
                    None => true,
                    Some(m) => graph.node(input).mtime > graph.node(m).mtime,
                };
                if newer {
                    most_recent_input = Some(input);
                }
            }

            // The edge is dirty only if any output is; when none are, clean
            // the outputs and drop the edge from the plan.
            if !scan.recompute_outputs_dirty(graph, oe, most_recent_input)? {
                for out in graph.edge(oe).outs.clone() {
                    self.clean_node(scan, graph, out)?;
                }

                self.want.insert(oe, Want::Nothing);
                self.wanted_edges -= 1;
                if !graph.edge(oe).is_phony() {
                    self.command_edges -= 1;
                }
            }
        }
        Ok(())
    }

    /// Integrate a freshly loaded dyndep file: rescan dependents, then walk
    /// the newly-reachable portion of the graph into the plan.
    pub fn dyndeps_loaded(
        &mut self,
        scan: &DependencyScan,
        graph: &mut Graph,
        node: NodeId,
        ddf: &crate::dyndep::DyndepFile,
    ) -> anyhow::Result<()> {
        // Our dependents' dirty state may have changed now that the dyndep
        // information is in the graph.
        self.refresh_dyndep_dependents(scan, graph, node)?;

        // Select roots: edges with new dyndep info that are already in the
        // plan with outputs not ready.  Edges never encountered have no
        // dependents in the plan, so they can wait.
        let mut dyndep_roots: Vec<EdgeId> = Vec::new();
        for (edge, _) in ddf.iter() {
            if graph.edge(*edge).outputs_ready {
                continue;
            }
            if !self.want.contains_key(edge) {
                continue;
            }
            dyndep_roots.push(*edge);
        }

        // Walk the dyndep-discovered portion of the graph into the plan.
        let mut dyndep_walk: HashSet<EdgeId> = HashSet::new();
        for root in dyndep_roots {
            let dependent = graph.edge(root).outs[0];
            let inputs = ddf.get(&root).unwrap().implicit_inputs.clone();
            for input in inputs {
                self.add_sub_target(graph, input, Some(dependent), Some(&mut dyndep_walk))?;
            }
        }

        // Add out edges from this node that are in the plan, just as
        // node_finished would have without the dyndep detour.
        for oe in graph.node(node).out_edges.clone() {
            if self.want.contains_key(&oe) {
                dyndep_walk.insert(oe);
            }
        }

        // See if any encountered edges are now ready.
        let mut walk: Vec<EdgeId> = dyndep_walk.into_iter().collect();
        walk.sort();
        for edge in walk {
            if self.want.contains_key(&edge) {
                self.edge_maybe_ready(graph, edge);
            }
        }
        Ok(())
    }

    fn refresh_dyndep_dependents(
        &mut self,
        scan: &DependencyScan,
        graph: &mut Graph,
        node: NodeId,
    ) -> anyhow::Result<()> {
        // Collect the transitive closure of dependents and mark their edges
        // as not yet visited so the scanner re-examines them.
        let mut dependents: HashSet<NodeId> = HashSet::new();
        self.unmark_dependents(graph, node, &mut dependents);

        let mut sorted: Vec<NodeId> = dependents.into_iter().collect();
        sorted.sort();

        // Update the dirty state of all dependents and check whether their
        // edges became wanted.
        for n in sorted {
            // Also detects new cycles.
            let validation_nodes = scan.recompute_dirty(graph, n)?;

            // Validation nodes found during the rescan become fresh top
            // level targets.
            for v in validation_nodes {
                if let Some(in_edge) = graph.node(v).in_edge {
                    if !graph.edge(in_edge).outputs_ready {
                        self.add_target(graph, v)?;
                    }
                }
            }

            if !graph.node(n).dirty {
                continue;
            }

            // This edge was encountered before, but we may not have wanted
            // it when its outputs weren't known to be dirty.  They are now.
            let edge = graph
                .node(n)
                .in_edge
                .expect("dirty dyndep dependent must have a producer");
            let want = self
                .want
                .get(&edge)
                .copied()
                .expect("dyndep dependent edge must be in the plan");
            if want == Want::Nothing {
                self.want.insert(edge, Want::ToStart);
                self.edge_wanted(graph, edge);
            }
        }
        Ok(())
    }

    fn unmark_dependents(
        &self,
        graph: &mut Graph,
        node: NodeId,
        dependents: &mut HashSet<NodeId>,
    ) {
        for oe in graph.node(node).out_edges.clone() {
            if !self.want.contains_key(&oe) {
                continue;
            }
            if graph.mark(oe) != VisitMark::None {
                graph.set_mark(oe, VisitMark::None);
                for out in graph.edge(oe).outs.clone() {
                    if dependents.insert(out) {
                        self.unmark_dependents(graph, out, dependents);
                    }
                }
            }
        }
    }

    fn edge_weight(graph: &Graph, edge: EdgeId) -> i64 {
        // Heuristic: phony edges are free, everything else costs the same.
        if graph.edge(edge).is_phony() {
            0
        } else {
            1
        }
    }

    /// Compute the critical-path weight of every edge reachable from the
    /// targets by backward breadth-first traversal.
    fn compute_critical_path(&mut self, graph: &mut Graph) {
        // Remove duplicate targets.
        {
            let mut seen = HashSet::new();
            self.targets.retain(|&t| seen.insert(t));
        }

        // Backflow from the destination nodes.  XXX: ignores pools.
        let mut work_queue: VecDeque<EdgeId> = VecDeque::new();
        // Edges currently in work_queue, to avoid duplicates.
        let mut active_edges: HashSet<EdgeId> = HashSet::new();

        for &target in &self.targets {
            if let Some(in_edge) = graph.node(target).in_edge {
                let weight = Self::edge_weight(graph, in_edge);
                let e = graph.edge_mut(in_edge);
                e.critical_path_weight = e.critical_path_weight.max(weight);
                if active_edges.insert(in_edge) {
                    work_queue.push_back(in_edge);
                }
            }
        }

        while let Some(e) = work_queue.pop_front() {
            // If the critical path of any dependent edge is updated, this
            // edge may need to be processed again, so re-allow insertion.
            active_edges.remove(&e);

            for i in 0..graph.edge(e).ins.len() {
                let input = graph.edge(e).ins[i];
                let in_edge = match graph.node(input).in_edge {
                    None => continue,
                    Some(ie) => ie,
                };
                // Only process the edge if this node offers a higher
                // weighted path.
                let proposed =
                    graph.edge(e).critical_path_weight + Self::edge_weight(graph, in_edge);
                if proposed > graph.edge(in_edge).critical_path_weight {
                    graph.edge_mut(in_edge).critical_path_weight = proposed;
                    if active_edges.insert(in_edge) {
                        work_queue.push_back(in_edge);
                    }
                }
            }
        }
    }

    fn schedule_initial_edges(&mut self, graph: &mut Graph) {
        debug_assert!(self.ready.is_empty());
        // Visit in edge order so heap insertion stamps, and therefore tie
        // breaks, don't depend on map iteration order.
        let mut ids: Vec<EdgeId> = self.want.keys().copied().collect();
        ids.sort();
        let mut pools: HashSet<PoolId> = HashSet::new();

        for id in ids {
            if !(self.want[&id] == Want::ToStart && graph.all_inputs_ready(id)) {
                continue;
            }
            let pool_id = graph.edge(id).pool;
            if graph.pool(pool_id).should_delay_edge() {
                let qe = self.queued(graph, id);
                graph.pool_mut(pool_id).delay_edge(qe);
                pools.insert(pool_id);
            } else {
                self.schedule_work(graph, id);
            }
        }

        // Drain each pool only once at the end, so the highest priority
        // edges are retrieved first, not the ones that happen to come first
        // in the want map.
        let mut pools: Vec<PoolId> = pools.into_iter().collect();
        pools.sort();
        for pool in pools {
            graph.pool_mut(pool).retrieve_ready_edges(&mut self.ready);
        }
    }

    /// Compute priorities and seed the ready queue; call once before the
    /// first find_work.
    pub fn prepare_queue(&mut self, graph: &mut Graph) {
        trace::scope("compute_critical_path", || {
            self.compute_critical_path(graph)
        });
        self.schedule_initial_edges(graph);
    }
}

impl Default for Plan {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depfile::DepfileParserOptions;
    use crate::disk::{MTime, VirtualDisk};
    use crate::graph::Edge;

    fn add_edge(g: &mut Graph, rule: &str, ins: &[NodeId], outs: &[NodeId]) -> EdgeId {
        let mut e = Edge::new(rule);
        e.cmdline = Some(rule.to_string());
        e.ins = ins.to_vec();
        e.outs = outs.to_vec();
        g.add_edge(e)
    }

    fn mark_dirty(g: &mut Graph, nodes: &[NodeId]) {
        for &n in nodes {
            g.node_mut(n).dirty = true;
        }
    }

    fn want_count(plan: &Plan) -> usize {
        plan.want.values().filter(|&&w| w != Want::Nothing).count()
    }

    /// Linear chain: the upstream edge runs first, and no edge is yielded
    /// twice.
    #[test]
    fn linear_chain_order() -> anyhow::Result<()> {
        let mut g = Graph::new();
        let a = g.file_id("a");
        let b = g.file_id("b");
        let c = g.file_id("c");
        let cc = add_edge(&mut g, "cc", &[a], &[b]);
        let ld = add_edge(&mut g, "ld", &[b], &[c]);
        mark_dirty(&mut g, &[b, c]);

        let mut plan = Plan::new();
        plan.add_target(&mut g, c)?;
        assert_eq!(plan.wanted_edge_count(), 2);
        assert_eq!(plan.command_edge_count(), 2);
        assert_eq!(want_count(&plan), plan.wanted_edge_count());

        plan.prepare_queue(&mut g);
        assert_eq!(g.edge(ld).critical_path_weight, 1);
        assert_eq!(g.edge(cc).critical_path_weight, 2);

        assert_eq!(plan.find_work(), Some(cc));
        assert_eq!(plan.find_work(), None); // ld is not ready yet

        plan.edge_finished(&mut g, cc, EdgeResult::Succeeded);
        assert_eq!(plan.find_work(), Some(ld));
        plan.edge_finished(&mut g, ld, EdgeResult::Succeeded);
        assert!(!plan.more_to_do());
        Ok(())
    }

    /// Adding a target twice leaves the want map unchanged.
    #[test]
    fn add_target_idempotent() -> anyhow::Result<()> {
        let mut g = Graph::new();
        let a = g.file_id("a");
        let b = g.file_id("b");
        let c = g.file_id("c");
        add_edge(&mut g, "cc", &[a], &[b]);
        add_edge(&mut g, "ld", &[b], &[c]);
        mark_dirty(&mut g, &[b, c]);

        let mut plan = Plan::new();
        plan.add_target(&mut g, c)?;
        let first: Vec<(EdgeId, Want)> = {
            let mut v: Vec<_> = plan.want.iter().map(|(&e, &w)| (e, w)).collect();
            v.sort_by_key(|&(e, _)| e);
            v
        };
        let wanted = plan.wanted_edge_count();

        plan.add_target(&mut g, c)?;
        let second: Vec<(EdgeId, Want)> = {
            let mut v: Vec<_> = plan.want.iter().map(|(&e, &w)| (e, w)).collect();
            v.sort_by_key(|&(e, _)| e);
            v
        };
        assert_eq!(first, second);
        assert_eq!(plan.wanted_edge_count(), wanted);
        Ok(())
    }

    #[test]
    fn missing_leaf_reports_dependent() {
        let mut g = Graph::new();
        let src = g.file_id("missing.c");
        let out = g.file_id("out");
        add_edge(&mut g, "cc", &[src], &[out]);
        mark_dirty(&mut g, &[src, out]);

        let mut plan = Plan::new();
        let err = plan.add_target(&mut g, out).unwrap_err().to_string();
        assert_eq!(
            err,
            "'missing.c', needed by 'out', missing and no known rule to make it"
        );
    }

    #[test]
    fn missing_top_level_target() {
        let mut g = Graph::new();
        let out = g.file_id("out");
        g.node_mut(out).dirty = true;

        let mut plan = Plan::new();
        let err = plan.add_target(&mut g, out).unwrap_err().to_string();
        assert_eq!(err, "'out' missing and no known rule to make it");
    }

    /// Deeper chains get higher weight and dispatch first.
    #[test]
    fn critical_path_orders_ready_edges() -> anyhow::Result<()> {
        let mut g = Graph::new();
        // Chain of two: s1 -> m -> long.
        let s1 = g.file_id("s1");
        let m = g.file_id("m");
        let long = g.file_id("long");
        let deep = add_edge(&mut g, "deep", &[s1], &[m]);
        add_edge(&mut g, "deep2", &[m], &[long]);
        // Single edge: s2 -> short.
        let s2 = g.file_id("s2");
        let short = g.file_id("short");
        let shallow = add_edge(&mut g, "shallow", &[s2], &[short]);
        mark_dirty(&mut g, &[m, long, short]);

        let mut plan = Plan::new();
        plan.add_target(&mut g, long)?;
        plan.add_target(&mut g, short)?;
        plan.prepare_queue(&mut g);

        // Both deep and shallow are ready; deep carries the longer path.
        assert_eq!(plan.find_work(), Some(deep));
        assert_eq!(plan.find_work(), Some(shallow));
        Ok(())
    }

    /// A finite pool never admits more than its depth concurrently.
    #[test]
    fn pool_depth_respected() -> anyhow::Result<()> {
        let mut g = Graph::new();
        let pool = g.add_pool("link", 1);
        let mut edges = Vec::new();
        for i in 0..3 {
            let src = g.file_id(format!("src{}", i));
            let out = g.file_id(format!("out{}", i));
            let mut e = Edge::new("ld");
            e.cmdline = Some("ld".to_string());
            e.ins = vec![src];
            e.outs = vec![out];
            e.pool = pool;
            let e = g.add_edge(e);
            edges.push(e);
            g.node_mut(out).dirty = true;
        }

        let mut plan = Plan::new();
        for i in 0..3 {
            let out = g.lookup_path(&format!("out{}", i)).unwrap();
            plan.add_target(&mut g, out)?;
        }
        plan.prepare_queue(&mut g);

        let first = plan.find_work().expect("one edge admitted");
        assert_eq!(plan.find_work(), None); // rest delayed by the pool

        plan.edge_finished(&mut g, first, EdgeResult::Succeeded);
        let second = plan.find_work().expect("pool freed one more");
        assert_eq!(plan.find_work(), None);
        assert_ne!(first, second);
        Ok(())
    }

    /// A node that appears twice in an edge's inputs doesn't get the edge
    /// scheduled twice.
    #[test]
    fn duplicate_input_schedules_once() -> anyhow::Result<()> {
        let mut g = Graph::new();
        let src = g.file_id("src");
        let mid = g.file_id("mid");
        let out = g.file_id("out");
        let gen = add_edge(&mut g, "gen", &[src], &[mid]);
        let use_twice = add_edge(&mut g, "use", &[mid, mid], &[out]);
        mark_dirty(&mut g, &[mid, out]);

        let mut plan = Plan::new();
        plan.add_target(&mut g, out)?;
        plan.prepare_queue(&mut g);

        assert_eq!(plan.find_work(), Some(gen));
        plan.edge_finished(&mut g, gen, EdgeResult::Succeeded);
        assert_eq!(plan.find_work(), Some(use_twice));
        assert_eq!(plan.find_work(), None);
        Ok(())
    }

    /// Failed edges stay in the want map and don't ready their dependents.
    #[test]
    fn failed_edge_blocks_dependents() -> anyhow::Result<()> {
        let mut g = Graph::new();
        let a = g.file_id("a");
        let b = g.file_id("b");
        let c = g.file_id("c");
        let cc = add_edge(&mut g, "cc", &[a], &[b]);
        add_edge(&mut g, "ld", &[b], &[c]);
        mark_dirty(&mut g, &[b, c]);

        let mut plan = Plan::new();
        plan.add_target(&mut g, c)?;
        plan.prepare_queue(&mut g);

        assert_eq!(plan.find_work(), Some(cc));
        plan.edge_finished(&mut g, cc, EdgeResult::Failed);
        assert_eq!(plan.find_work(), None);
        assert!(plan.more_to_do());
        Ok(())
    }

    /// Restat cleaning: when a restat edge leaves its output unchanged, the
    /// downstream edge drops out of the plan and the counters follow.
    #[test]
    fn clean_node_prunes_downstream() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        let options = DepfileParserOptions::default();
        let scan = DependencyScan {
            disk: &disk,
            build_log: None,
            deps_log: None,
            depfile_options: &options,
            skip_check_timestamp: false,
        };

        let mut g = Graph::new();
        let src = g.file_id("src");
        let gen_h = g.file_id("gen.h");
        let obj = g.file_id("obj");
        let mut gen = Edge::new("gen");
        gen.cmdline = Some("gen".to_string());
        gen.restat = true;
        gen.ins = vec![src];
        gen.outs = vec![gen_h];
        let gen = g.add_edge(gen);
        let cc = add_edge(&mut g, "cc", &[gen_h], &[obj]);

        // On-disk state: gen.h unchanged by the rerun, obj newer than gen.h.
        g.node_mut(src).mtime = MTime::Stamp(10);
        g.node_mut(gen_h).mtime = MTime::Stamp(5);
        g.node_mut(obj).mtime = MTime::Stamp(6);
        mark_dirty(&mut g, &[gen_h, obj]);

        let mut plan = Plan::new();
        plan.add_target(&mut g, obj)?;
        plan.prepare_queue(&mut g);
        assert_eq!(plan.command_edge_count(), 2);

        assert_eq!(plan.find_work(), Some(gen));
        // The command ran but did not touch gen.h: the builder calls
        // clean_node, which prunes cc.
        plan.clean_node(&scan, &mut g, gen_h)?;
        assert_eq!(plan.command_edge_count(), 1);
        assert_eq!(plan.wanted_edge_count(), 1);
        assert_eq!(plan.want_state(cc), Some(Want::Nothing));

        plan.edge_finished(&mut g, gen, EdgeResult::Succeeded);
        // cc was synthesized to completion; nothing left.
        assert_eq!(plan.find_work(), None);
        assert!(!plan.more_to_do());
        assert!(g.edge(cc).outputs_ready);
        Ok(())
    }

    /// Dyndep discovery: a not-wanted edge becomes wanted when a loaded
    /// dyndep file reveals a dirty new input.
    #[test]
    fn dyndep_promotes_edge() -> anyhow::Result<()> {
        let disk = VirtualDisk::new();
        disk.add_file("src", "");
        disk.add_file("a", "");
        disk.add_file("x", ""); // newer than a: will dirty e_a once discovered
        let options = DepfileParserOptions::default();
        let scan = DependencyScan {
            disk: &disk,
            build_log: None,
            deps_log: None,
            depfile_options: &options,
            skip_check_timestamp: false,
        };

        let mut g = Graph::new();
        let src = g.file_id("src");
        let d = g.file_id("dd");
        let a = g.file_id("a");
        let out = g.file_id("out");

        // e_d produces the dyndep file; its output is missing, so it's dirty.
        let e_d = add_edge(&mut g, "gen-dd", &[], &[d]);
        // e_a consumes the dyndep file as an order-only input.
        let mut e = Edge::new("cc");
        e.cmdline = Some("cc".to_string());
        e.ins = vec![src, d];
        e.order_only = 1;
        e.outs = vec![a];
        e.dyndep = Some(d);
        let e_a = g.add_edge(e);
        let e_out = add_edge(&mut g, "ld", &[a], &[out]);

        scan.recompute_dirty(&mut g, out)?;
        assert!(!g.node(a).dirty);
        assert!(g.node(d).dirty);
        assert!(g.node(out).dirty);

        let mut plan = Plan::new();
        plan.add_target(&mut g, out)?;
        // e_a was walked through but not wanted.
        assert_eq!(plan.want_state(e_a), Some(Want::Nothing));
        assert_eq!(plan.want_state(e_d), Some(Want::ToStart));
        plan.prepare_queue(&mut g);

        assert_eq!(plan.find_work(), Some(e_d));
        // "Run" e_d: it writes the dyndep file declaring a's new input x.
        disk.add_file("dd", "ninja_dyndep_version = 1\nbuild a : dyndep | x\n");
        plan.edge_finished(&mut g, e_d, EdgeResult::Succeeded);

        // The builder drains the pending queue.
        let pending = plan.take_pending_dyndep().expect("dyndep node queued");
        assert_eq!(pending, d);
        let ddf = scan.load_dyndeps(&mut g, pending)?;
        plan.dyndeps_loaded(&scan, &mut g, pending, &ddf)?;

        // x was newer than a, so e_a is now wanted and scheduled.
        assert!(g.node(a).dirty);
        assert_eq!(plan.want_state(e_a), Some(Want::ToFinish));
        assert_eq!(plan.find_work(), Some(e_a));

        plan.edge_finished(&mut g, e_a, EdgeResult::Succeeded);
        assert_eq!(plan.find_work(), Some(e_out));
        plan.edge_finished(&mut g, e_out, EdgeResult::Succeeded);
        assert!(!plan.more_to_do());
        Ok(())
    }

    /// Phony edges cost nothing in the priority heuristic.
    #[test]
    fn phony_edges_are_weightless() -> anyhow::Result<()> {
        let mut g = Graph::new();
        let a = g.file_id("a");
        let b = g.file_id("b");
        let all = g.file_id("all");
        let cc = add_edge(&mut g, "cc", &[a], &[b]);
        let mut phony = Edge::new("phony");
        phony.ins = vec![b];
        phony.outs = vec![all];
        let phony = g.add_edge(phony);
        mark_dirty(&mut g, &[b, all]);

        let mut plan = Plan::new();
        plan.add_target(&mut g, all)?;
        plan.prepare_queue(&mut g);
        assert_eq!(g.edge(phony).critical_path_weight, 0);
        assert_eq!(g.edge(cc).critical_path_weight, 1);
        assert_eq!(plan.command_edge_count(), 1);
        assert_eq!(plan.wanted_edge_count(), 2);
        Ok(())
    }
}
