//! Dynamic dependency files: manifests emitted during the build that add
//! implicit inputs (and a restat flag) to already-declared edges.
//!
//! Format, one stanza per edge:
//!
//! ```text
//! ninja_dyndep_version = 1
//! build out : dyndep | discovered/input.h other.h
//!   restat = 1
//! ```

use crate::canon::canon_path;
use crate::graph::{EdgeId, Graph, NodeId};
use crate::scanner::{ParseResult, Scanner};
use crate::smallmap::SmallMap;

/// What a dyndep file contributes to one edge.
#[derive(Debug)]
pub struct Dyndeps {
    pub implicit_inputs: Vec<NodeId>,
    pub restat: bool,
}

/// Contents of a loaded dyndep file, keyed by the edges it augments.
pub type DyndepFile = SmallMap<EdgeId, Dyndeps>;

fn skip_comments_and_blanks(scanner: &mut Scanner) {
    loop {
        match scanner.peek() {
            '\n' => scanner.next(),
            '#' => scanner.skip_line(),
            _ => return,
        }
    }
}

/// Read one space-delimited path token, stopping at structure characters.
fn read_path<'a>(scanner: &mut Scanner<'a>) -> Option<&'a str> {
    scanner.skip_spaces();
    let start = scanner.ofs;
    loop {
        match scanner.read() {
            '\0' | ' ' | '\n' | ':' | '|' => {
                scanner.back();
                break;
            }
            _ => {}
        }
    }
    if scanner.ofs == start {
        return None;
    }
    Some(scanner.slice(start, scanner.ofs))
}

fn read_ident<'a>(scanner: &mut Scanner<'a>) -> Option<&'a str> {
    let start = scanner.ofs;
    while matches!(scanner.peek(), 'a'..='z' | 'A'..='Z' | '0'..='9' | '_') {
        scanner.next();
    }
    if scanner.ofs == start {
        return None;
    }
    Some(scanner.slice(start, scanner.ofs))
}

fn parse_version(scanner: &mut Scanner) -> ParseResult<()> {
    skip_comments_and_blanks(scanner);
    let key = read_ident(scanner);
    if key != Some("ninja_dyndep_version") {
        return scanner.parse_error("expected 'ninja_dyndep_version = ...'");
    }
    scanner.skip_spaces();
    scanner.expect('=')?;
    scanner.skip_spaces();
    let version = read_path(scanner).unwrap_or("");
    if version != "1" && version != "1.0" {
        return scanner.parse_error(format!("unsupported dyndep version {:?}", version));
    }
    scanner.skip_spaces();
    scanner.expect('\n')?;
    Ok(())
}

/// Parse one `restat = ...`-style binding line; only restat is allowed.
fn parse_binding(scanner: &mut Scanner, dyndeps: &mut Dyndeps) -> ParseResult<()> {
    scanner.skip_spaces();
    let key = match read_ident(scanner) {
        None => return scanner.parse_error("expected binding name"),
        Some(k) => k,
    };
    scanner.skip_spaces();
    scanner.expect('=')?;
    scanner.skip_spaces();
    let value = read_path(scanner).unwrap_or("");
    if key != "restat" {
        return scanner.parse_error(format!("unexpected binding {:?}", key));
    }
    dyndeps.restat = !value.is_empty() && value != "0";
    scanner.skip_spaces();
    if scanner.peek() != '\0' {
        scanner.expect('\n')?;
    }
    Ok(())
}

/// Parse a dyndep file into its per-edge contributions.  Implicit input
/// paths are interned as dep-loader nodes.
pub fn parse(graph: &mut Graph, scanner: &mut Scanner) -> ParseResult<DyndepFile> {
    parse_version(scanner)?;
    let mut ddf = DyndepFile::default();
    loop {
        skip_comments_and_blanks(scanner);
        if scanner.peek() == '\0' {
            break;
        }
        match read_ident(scanner) {
            Some("build") => {}
            _ => return scanner.parse_error("expected 'build' statement"),
        }

        // Output list; extra outputs after '|' name the same edge.
        let mut edge: Option<EdgeId> = None;
        loop {
            match read_path(scanner) {
                Some(path) => {
                    let path = canon_path(path);
                    let node = match graph.lookup_path(&path) {
                        Some(n) => n,
                        None => {
                            return scanner
                                .parse_error(format!("no build statement exists for {:?}", path))
                        }
                    };
                    let in_edge = match graph.node(node).in_edge {
                        Some(e) => e,
                        None => {
                            return scanner
                                .parse_error(format!("no build statement exists for {:?}", path))
                        }
                    };
                    if edge.is_some() && edge != Some(in_edge) {
                        return scanner.parse_error(format!(
                            "output {:?} belongs to a different build statement",
                            path
                        ));
                    }
                    edge = Some(in_edge);
                }
                None => {
                    scanner.skip_spaces();
                    if !scanner.skip('|') {
                        break;
                    }
                }
            }
        }
        let edge = match edge {
            Some(e) => e,
            None => return scanner.parse_error("expected output path"),
        };
        if ddf.get(&edge).is_some() {
            return scanner.parse_error("multiple dyndep statements for one build statement");
        }

        scanner.skip_spaces();
        scanner.expect(':')?;
        scanner.skip_spaces();
        match read_ident(scanner) {
            Some("dyndep") => {}
            _ => return scanner.parse_error("expected 'dyndep' rule"),
        }

        let mut dyndeps = Dyndeps {
            implicit_inputs: Vec::new(),
            restat: false,
        };
        scanner.skip_spaces();
        if scanner.skip('|') {
            while let Some(path) = read_path(scanner) {
                let id = graph.dep_file_id(canon_path(path));
                dyndeps.implicit_inputs.push(id);
            }
        }
        scanner.skip_spaces();
        if scanner.peek() != '\0' {
            scanner.expect('\n')?;
        }

        // Indented binding lines attach to this stanza.
        while scanner.peek() == ' ' {
            parse_binding(scanner, &mut dyndeps)?;
        }

        ddf.insert(edge, dyndeps);
    }
    Ok(ddf)
}

/// Fold a dyndep entry into its edge: append the discovered inputs as
/// implicit (non-order-only) deps, wire back-references, apply restat.
pub fn update_edge(graph: &mut Graph, id: EdgeId, dyndeps: &Dyndeps) {
    if dyndeps.restat {
        graph.edge_mut(id).restat = true;
    }
    for &input in &dyndeps.implicit_inputs {
        let implicit_end = {
            let edge = graph.edge(id);
            edge.ins.len() - edge.order_only
        };
        graph.edge_mut(id).ins.insert(implicit_end, input);
        graph.node_mut(input).out_edges.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Edge;
    use std::path::Path;

    fn test_graph() -> (Graph, EdgeId) {
        let mut g = Graph::new();
        let src = g.file_id("src");
        let oo = g.file_id("orderonly");
        let out = g.file_id("out");
        let mut e = Edge::new("cc");
        e.cmdline = Some("cc".into());
        e.ins = vec![src, oo];
        e.order_only = 1;
        e.outs = vec![out];
        let e = g.add_edge(e);
        (g, e)
    }

    fn parse_text(graph: &mut Graph, text: &str) -> Result<DyndepFile, String> {
        let mut buf = text.as_bytes().to_vec();
        buf.push(0);
        let mut scanner = Scanner::new(&buf);
        parse(graph, &mut scanner)
            .map_err(|err| scanner.format_parse_error(Path::new("dd"), err))
    }

    #[test]
    fn basic() {
        let (mut g, e) = test_graph();
        let ddf = parse_text(
            &mut g,
            "ninja_dyndep_version = 1\nbuild out : dyndep | foo.h bar.h\n",
        )
        .unwrap();
        let dyndeps = ddf.get(&e).unwrap();
        assert_eq!(dyndeps.implicit_inputs.len(), 2);
        assert!(!dyndeps.restat);
        assert_eq!(g.node(dyndeps.implicit_inputs[0]).path, "foo.h");
        assert!(g.node(dyndeps.implicit_inputs[0]).generated_by_dep_loader);
    }

    #[test]
    fn restat_binding() {
        let (mut g, e) = test_graph();
        let ddf = parse_text(
            &mut g,
            "ninja_dyndep_version = 1\nbuild out : dyndep\n  restat = 1\n",
        )
        .unwrap();
        assert!(ddf.get(&e).unwrap().restat);
    }

    #[test]
    fn version_required() {
        let (mut g, _) = test_graph();
        let err = parse_text(&mut g, "build out : dyndep\n").unwrap_err();
        assert!(err.contains("ninja_dyndep_version"));
    }

    #[test]
    fn unknown_output() {
        let (mut g, _) = test_graph();
        let err =
            parse_text(&mut g, "ninja_dyndep_version = 1\nbuild nope : dyndep\n").unwrap_err();
        assert!(err.contains("no build statement"));
    }

    #[test]
    fn unknown_binding_rejected() {
        let (mut g, _) = test_graph();
        let err = parse_text(
            &mut g,
            "ninja_dyndep_version = 1\nbuild out : dyndep\n  pool = link\n",
        )
        .unwrap_err();
        assert!(err.contains("unexpected binding"));
    }

    #[test]
    fn update_edge_inserts_before_order_only() {
        let (mut g, e) = test_graph();
        let ddf = parse_text(
            &mut g,
            "ninja_dyndep_version = 1\nbuild out : dyndep | foo.h\n",
        )
        .unwrap();
        let dyndeps = ddf.get(&e).unwrap();
        update_edge(&mut g, e, dyndeps);
        let edge = g.edge(e);
        // foo.h landed in the implicit section, before the order-only tail.
        assert_eq!(edge.ins.len(), 3);
        assert_eq!(g.node(edge.ins[1]).path, "foo.h");
        assert_eq!(g.node(edge.ins[2]).path, "orderonly");
        assert!(g.node(edge.ins[1]).out_edges.contains(&e));
    }
}
