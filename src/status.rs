//! Build status reporting: the interface the driver loop feeds as edges
//! start and finish, plus a plain console implementation.

use crate::graph::{EdgeId, Graph};
use std::io::Write;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

/// Notifications emitted by the builder as the plan and edges progress.
pub trait Status {
    fn build_started(&mut self);
    /// The plan's total command count changed: announced at queue
    /// preparation, after restat cleaning, and after dyndep loads.
    fn plan_has_total_edges(&mut self, total: usize);
    fn build_edge_started(&mut self, graph: &Graph, edge: EdgeId, start_ms: i64);
    fn build_edge_finished(
        &mut self,
        graph: &Graph,
        edge: EdgeId,
        end_ms: i64,
        success: bool,
        output: &[u8],
    );
    fn build_load_dyndeps(&mut self);
    fn build_finished(&mut self);
    fn error(&mut self, msg: &str);
}

/// Compute the message to display on the console for an edge.
pub fn build_message(graph: &Graph, edge: EdgeId) -> &str {
    let e = graph.edge(edge);
    e.desc
        .as_ref()
        .filter(|desc| !desc.is_empty())
        .or(e.cmdline.as_ref())
        .unwrap_or(&e.rule)
}

/// Munge a rule name into the short target name used for log file names,
/// the watcher banner, and failure summaries: strip a trailing
/// "___"-suffixed segment, then keep the part after the last '_'.
pub fn format_target_name(name: &str) -> String {
    let mut name = name;
    if let Some(pos) = name.rfind("___") {
        name = &name[..pos];
        if let Some(pos) = name.rfind('_') {
            name = &name[pos + 1..];
        }
    }
    name.to_string()
}

/// Console status without any overprinting: one line per event.
pub struct ConsoleStatus {
    verbosity: Verbosity,
    total_edges: usize,
    finished_edges: usize,
    /// The id of the last command printed, to avoid printing it twice when
    /// we have two updates from the same command in a row.
    last_started: Option<EdgeId>,
}

impl ConsoleStatus {
    pub fn new(verbosity: Verbosity) -> Self {
        ConsoleStatus {
            verbosity,
            total_edges: 0,
            finished_edges: 0,
            last_started: None,
        }
    }

    fn log(&self, msg: &str) {
        println!("{}", msg);
    }
}

impl Status for ConsoleStatus {
    fn build_started(&mut self) {
        self.finished_edges = 0;
    }

    fn plan_has_total_edges(&mut self, total: usize) {
        self.total_edges = total;
    }

    fn build_edge_started(&mut self, graph: &Graph, edge: EdgeId, _start_ms: i64) {
        if self.verbosity == Verbosity::Quiet {
            return;
        }
        let message = if self.verbosity == Verbosity::Verbose {
            graph.edge(edge).cmdline.as_deref().unwrap_or("phony")
        } else {
            build_message(graph, edge)
        };
        self.log(&format!(
            "[{}/{}] {}",
            self.finished_edges + 1,
            self.total_edges,
            message
        ));
        self.last_started = Some(edge);
    }

    fn build_edge_finished(
        &mut self,
        graph: &Graph,
        edge: EdgeId,
        _end_ms: i64,
        success: bool,
        output: &[u8],
    ) {
        self.finished_edges += 1;
        if !success {
            self.log(&format!("failed: {}", build_message(graph, edge)));
        } else if !output.is_empty() && self.last_started != Some(edge) {
            // Output is nonempty and we didn't just print the command.
            self.log(build_message(graph, edge));
        }
        if !output.is_empty() {
            let _ = std::io::stdout().write_all(output);
        }
    }

    fn build_load_dyndeps(&mut self) {
        if self.verbosity == Verbosity::Verbose {
            self.log("loading dyndep file");
        }
    }

    fn build_finished(&mut self) {}

    fn error(&mut self, msg: &str) {
        eprintln!("n3: error: {}", msg);
    }
}
