//! Path canonicalization.
//!
//! Lexically simplifies paths like "foo/./bar" => "foo/bar" without touching
//! the disk.  Dep-loader paths (depfiles, /showIncludes output) arrive in
//! whatever shape the compiler printed them, so they are canonicalized before
//! node interning to avoid duplicate nodes for one file.

/// Lexically canonicalize a path, removing redundant components.
#[must_use]
pub fn canon_path(path: impl Into<String>) -> String {
    let path = path.into();
    assert!(!path.is_empty());
    let bytes = path.as_bytes();
    let end = bytes.len();
    let mut out: Vec<u8> = Vec::with_capacity(end);
    // Start offsets of components already in `out`, for ".." to pop to.
    let mut components: Vec<usize> = Vec::new();
    let mut src = 0;

    if let b'/' | b'\\' = bytes[0] {
        out.push(bytes[0]);
        src = 1;
    }

    // One iteration per path component.
    while src < end {
        match bytes[src] {
            b'/' | b'\\' => {
                src += 1;
                continue;
            }
            b'.' => {
                if src + 1 == end {
                    break; // Trailing '.', trim.
                }
                match bytes[src + 1] {
                    b'/' | b'\\' => {
                        // "./", skip.
                        src += 2;
                        continue;
                    }
                    b'.' if src + 2 == end || matches!(bytes[src + 2], b'/' | b'\\') => {
                        // ".." component, try to back up.
                        if let Some(ofs) = components.pop() {
                            out.truncate(ofs);
                        } else {
                            out.extend_from_slice(b"..");
                            if src + 2 != end {
                                out.push(bytes[src + 2]);
                            }
                        }
                        src += 3;
                        continue;
                    }
                    // A component that merely starts with '.' or "..":
                    // handled as an ordinary component below.
                    _ => {}
                }
            }
            _ => {}
        }

        // Mark this point as a possible target to pop to, then copy one
        // component including its trailing separator.
        components.push(out.len());
        while src < end {
            let c = bytes[src];
            out.push(c);
            src += 1;
            if let b'/' | b'\\' = c {
                break;
            }
        }
    }

    if out.is_empty() {
        return ".".to_string();
    }
    // Safety: out holds bytes copied from the input string plus ASCII
    // separators and dots, so it remains valid UTF-8.
    unsafe { String::from_utf8_unchecked(out) }
}

/// Canonicalize with every backslash folded to a forward slash first.  Used
/// for msvc-discovered headers, where mixed separators are routine and all
/// spellings should intern to one node.
#[must_use]
pub fn canon_path_all_slashes(path: impl Into<String>) -> String {
    let path: String = path.into();
    canon_path(path.replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Assert that canon path equals expected path with different path separators
    #[track_caller]
    fn assert_canon_path_eq(left: &str, right: &str) {
        assert_eq!(canon_path(left), right);
        assert_eq!(
            canon_path(left.replace('/', "\\")),
            right.replace('/', "\\")
        );
    }

    #[test]
    fn noop() {
        assert_canon_path_eq("foo", "foo");
        assert_canon_path_eq("foo/bar", "foo/bar");
    }

    #[test]
    fn dot() {
        assert_canon_path_eq("./foo", "foo");
        assert_canon_path_eq("foo/.", "foo/");
        assert_canon_path_eq("foo/./bar", "foo/bar");
        assert_canon_path_eq("./", ".");
        assert_canon_path_eq("./.", ".");
        assert_canon_path_eq("././", ".");
        assert_canon_path_eq("././.", ".");
        assert_canon_path_eq(".", ".");
    }

    #[test]
    fn not_dot() {
        assert_canon_path_eq("t/.hidden", "t/.hidden");
        assert_canon_path_eq("t/.._lib.c.o", "t/.._lib.c.o");
    }

    #[test]
    fn slash() {
        assert_canon_path_eq("/foo", "/foo");
        assert_canon_path_eq("foo//bar", "foo/bar");
    }

    #[test]
    fn parent() {
        assert_canon_path_eq("foo/../bar", "bar");

        assert_canon_path_eq("/foo/../bar", "/bar");
        assert_canon_path_eq("../foo", "../foo");
        assert_canon_path_eq("../foo/../bar", "../bar");
        assert_canon_path_eq("../../bar", "../../bar");
        assert_canon_path_eq("./../foo", "../foo");
        assert_canon_path_eq("foo/..", ".");
        assert_canon_path_eq("foo/../", ".");
        assert_canon_path_eq("foo/../../", "../");
        assert_canon_path_eq("foo/../../bar", "../bar");
    }

    #[test]
    fn all_slashes() {
        assert_eq!(canon_path_all_slashes("a\\b\\c"), "a/b/c");
        assert_eq!(canon_path_all_slashes("a\\.\\b"), "a/b");
        assert_eq!(canon_path_all_slashes("C:\\inc\\..\\foo.h"), "C:/foo.h");
    }
}
