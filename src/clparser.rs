//! Parsing of cl.exe output to pick dependencies out of /showIncludes lines.
//!
//! The include lines are elided from the output as they are captured, so the
//! user never sees the header spam; everything else passes through verbatim.
//! Filtering runs even for failed compiles, before the outcome is decided.

pub const DEFAULT_DEPS_PREFIX: &str = "Note: including file: ";

pub struct CLParse {
    /// The command output with include lines (and the echoed input filename)
    /// removed.
    pub output: Vec<u8>,
    /// Captured include paths, first-seen order, deduplicated.
    pub includes: Vec<String>,
}

/// A line that is just the input filename: cl.exe echoes the name of the
/// file it compiles as the first line of output.
fn is_input_filename(line: &str) -> bool {
    if line.contains(' ') {
        return false;
    }
    let line = line.to_ascii_lowercase();
    [".c", ".cc", ".cxx", ".cpp", ".c++"]
        .iter()
        .any(|ext| line.ends_with(ext))
}

pub fn parse(output: &[u8], deps_prefix: &str) -> CLParse {
    let mut filtered = Vec::with_capacity(output.len());
    let mut includes: Vec<String> = Vec::new();

    for line in output.split(|&c| c == b'\n') {
        let mut line = line;
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        let text = String::from_utf8_lossy(line);
        if let Some(include) = text.strip_prefix(deps_prefix) {
            let include = include.trim_start().to_string();
            if !include.is_empty() && !includes.contains(&include) {
                includes.push(include);
            }
        } else if is_input_filename(&text) {
            // Drop it.
        } else if !line.is_empty() {
            filtered.extend_from_slice(line);
            filtered.push(b'\n');
        }
    }

    CLParse {
        output: filtered,
        includes,
    }
}
