//! Parsing of Makefile syntax as found in `.d` files emitted by C compilers.
//!
//! The build core only consumes the resulting list of input paths; everything
//! else about the format is tolerated and discarded.

use crate::{
    scanner::{ParseResult, Scanner},
    smallmap::SmallMap,
};

/// Knobs passed through from the build configuration.
#[derive(Clone, Default)]
pub struct DepfileParserOptions {
    /// Reject depfiles that name more than one target, instead of merging
    /// the dep lists.
    pub reject_multiple_targets: bool,
}

/// Skip spaces and backslashed newlines.
fn skip_spaces(scanner: &mut Scanner) -> ParseResult<()> {
    loop {
        match scanner.read() {
            ' ' => {}
            '\\' => match scanner.read() {
                '\n' => {}
                _ => return scanner.parse_error("invalid backslash escape"),
            },
            _ => {
                scanner.back();
                break;
            }
        }
    }
    Ok(())
}

/// Read one path from the input scanner.
/// Note: treats colon as a valid character in a path because of Windows-style
/// paths, but this means that the initial `output: ...` path will include the
/// trailing colon.
fn read_path<'a>(scanner: &mut Scanner<'a>) -> ParseResult<Option<&'a str>> {
    skip_spaces(scanner)?;
    let start = scanner.ofs;
    loop {
        match scanner.read() {
            '\0' | ' ' | '\n' => {
                scanner.back();
                break;
            }
            '\\' => {
                if scanner.peek() == '\n' {
                    scanner.back();
                    break;
                }
            }
            _ => {}
        }
    }
    let end = scanner.ofs;
    if end == start {
        return Ok(None);
    }
    Ok(Some(scanner.slice(start, end)))
}

/// Parse a `.d` file into a map of target to input paths.
pub fn parse<'a>(
    scanner: &mut Scanner<'a>,
    options: &DepfileParserOptions,
) -> ParseResult<SmallMap<&'a str, Vec<&'a str>>> {
    let mut result = SmallMap::default();
    loop {
        while matches!(scanner.peek(), ' ' | '\n') {
            scanner.next();
        }
        let target = match read_path(scanner)? {
            None => break,
            Some(o) => o,
        };
        scanner.skip_spaces();
        let target = match target.strip_suffix(':') {
            None => {
                scanner.expect(':')?;
                target
            }
            Some(target) => target,
        };
        if options.reject_multiple_targets && !result.is_empty() && result.get(target).is_none() {
            return scanner.parse_error("depfile names multiple targets");
        }
        let mut deps = Vec::new();
        while let Some(p) = read_path(scanner)? {
            deps.push(p);
        }
        result.insert(target, deps);
    }
    scanner.expect('\0')?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn parse_with<'a>(
        buf: &'a mut Vec<u8>,
        options: &DepfileParserOptions,
    ) -> Result<SmallMap<&'a str, Vec<&'a str>>, String> {
        buf.push(0);
        let mut scanner = Scanner::new(buf);
        parse(&mut scanner, options)
            .map_err(|err| scanner.format_parse_error(Path::new("test"), err))
    }

    fn try_parse(buf: &mut Vec<u8>) -> Result<SmallMap<&str, Vec<&str>>, String> {
        parse_with(buf, &DepfileParserOptions::default())
    }

    fn must_parse(buf: &mut Vec<u8>) -> SmallMap<&str, Vec<&str>> {
        match try_parse(buf) {
            Err(err) => {
                println!("{}", err);
                panic!("failed parse");
            }
            Ok(d) => d,
        }
    }

    #[test]
    fn parse_simple() {
        let mut file = b"build/browse.o: src/browse.cc src/browse.h build/browse_py.h\n".to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(
            deps,
            SmallMap::from([(
                "build/browse.o",
                vec!["src/browse.cc", "src/browse.h", "build/browse_py.h"]
            )])
        );
    }

    #[test]
    fn parse_space_suffix() {
        let mut file = b"build/browse.o: src/browse.cc   \n".to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(
            deps,
            SmallMap::from([("build/browse.o", vec!["src/browse.cc"])])
        );
    }

    #[test]
    fn parse_multiline() {
        let mut file = b"build/browse.o: src/browse.cc\\\n  build/browse_py.h".to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(
            deps,
            SmallMap::from([("build/browse.o", vec!["src/browse.cc", "build/browse_py.h"])])
        );
    }

    #[test]
    fn parse_without_final_newline() {
        let mut file = b"build/browse.o: src/browse.cc".to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(
            deps,
            SmallMap::from([("build/browse.o", vec!["src/browse.cc"])])
        );
    }

    #[test]
    fn parse_spaces_before_colon() {
        let mut file = b"build/browse.o   : src/browse.cc".to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(
            deps,
            SmallMap::from([("build/browse.o", vec!["src/browse.cc"])])
        );
    }

    #[test]
    fn parse_windows_dep_path() {
        let mut file = b"odd/path.o: C:/odd\\path.c".to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(
            deps,
            SmallMap::from([("odd/path.o", vec!["C:/odd\\path.c"])])
        );
    }

    #[test]
    fn parse_multiple_targets() {
        let mut file = b"
out/a.o: src/a.c \\
  src/b.c

out/b.o :
"
        .to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(
            deps,
            SmallMap::from([
                ("out/a.o", vec!["src/a.c", "src/b.c"]),
                ("out/b.o", vec![])
            ])
        );
    }

    #[test]
    fn parse_multiple_targets_rejected() {
        let mut file = b"out/a.o: src/a.c\nout/b.o: src/b.c\n".to_vec();
        let options = DepfileParserOptions {
            reject_multiple_targets: true,
        };
        let err = parse_with(&mut file, &options).unwrap_err();
        assert!(
            err.contains("multiple targets"),
            "expected multiple-target error, got {:?}",
            err
        );
    }

    #[test]
    fn parse_missing_colon() {
        let mut file = b"foo bar".to_vec();
        let err = try_parse(&mut file).unwrap_err();
        assert!(
            err.starts_with("parse error: expected ':'"),
            "expected parse error, got {:?}",
            err
        );
    }
}
