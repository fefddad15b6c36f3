//! Tree-sitter front end for learner source.
//!
//! Produces a concrete syntax tree and reports the first `ERROR` or `MISSING`
//! node as a [`SyntaxError`]. Lowering into the owned model happens in
//! [`super::lower`].

use tree_sitter::{Node, Parser, Tree};

use crate::errors::{QlcError, QlcResult, SyntaxError};

/// Parsed source unit holding the raw text and its syntax tree.
pub struct ParsedSource<'s> {
    pub source: &'s str,
    pub tree: Tree,
}

impl ParsedSource<'_> {
    pub fn root(&self) -> Node<'_> {
        self.tree.root_node()
    }

    pub fn text(&self, node: Node<'_>) -> &str {
        node.utf8_text(self.source.as_bytes()).unwrap_or("")
    }
}

fn new_parser() -> QlcResult<Parser> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| QlcError::Parser(format!("Failed to set language: {e}")))?;
    Ok(parser)
}

/// Parse `source` and fail on the first syntax error.
pub fn parse_source(source: &str) -> QlcResult<ParsedSource<'_>> {
    let mut parser = new_parser()?;
    let tree = parser
        .parse(source.as_bytes(), None)
        .ok_or_else(|| QlcError::Parser("tree-sitter returned no tree".to_string()))?;

    let root = tree.root_node();
    if root.has_error() {
        if let Some(err) = first_error(root, source) {
            return Err(err.into());
        }
    }
    Ok(ParsedSource { source, tree })
}

/// Locate the first erroneous node in document order. Iterative so that
/// pathological nesting cannot exhaust the caller's stack.
fn first_error(root: Node<'_>, source: &str) -> Option<SyntaxError> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_missing() {
            return Some(syntax_error_at(
                node,
                format!("expected '{}'", node.kind()),
            ));
        }
        if node.is_error() {
            return Some(syntax_error_at(node, describe_error(node, source)));
        }
        if !node.has_error() {
            continue;
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    None
}

fn describe_error(node: Node<'_>, source: &str) -> String {
    let snippet = node
        .utf8_text(source.as_bytes())
        .unwrap_or("")
        .lines()
        .next()
        .unwrap_or("")
        .trim();
    let unbalanced = snippet.chars().fold(0i64, |depth, c| match c {
        '(' | '[' | '{' => depth + 1,
        ')' | ']' | '}' => depth - 1,
        _ => depth,
    });
    if unbalanced != 0 {
        "unbalanced parenthesis".to_string()
    } else if snippet.is_empty() {
        "invalid syntax".to_string()
    } else {
        let short: String = snippet.chars().take(40).collect();
        format!("invalid syntax near '{short}'")
    }
}

pub fn syntax_error_at(node: Node<'_>, message: impl Into<String>) -> SyntaxError {
    let pos = node.start_position();
    SyntaxError::new(pos.row + 1, pos.column + 1, message)
}

/// Number of lines in `source`, counting a final line without a newline.
pub fn count_lines(source: &str) -> usize {
    if source.is_empty() {
        return 0;
    }
    let newlines = source.bytes().filter(|b| *b == b'\n').count();
    if source.ends_with('\n') {
        newlines
    } else {
        newlines + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_source() {
        let parsed = parse_source("def f(n):\n    return n + 1\n").unwrap();
        assert_eq!(parsed.root().kind(), "module");
        assert!(!parsed.root().has_error());
    }

    #[test]
    fn test_parse_unbalanced_parenthesis_reports_line() {
        let err = parse_source("x = 1\nprint((x)\n").err().unwrap();
        match err {
            QlcError::Syntax(e) => assert!(e.line >= 2, "line was {}", e.line),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_count_lines() {
        assert_eq!(count_lines(""), 0);
        assert_eq!(count_lines("a"), 1);
        assert_eq!(count_lines("a\n"), 1);
        assert_eq!(count_lines("a\nb"), 2);
    }
}
