//! Python analysis with tree-sitter
//!
//! All tree walks are iterative so deeply nested input cannot exhaust the
//! stack.

use crate::error::ParseError;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use tree_sitter::{Node, Parser, Tree};

/// Node kinds that add one decision point to the complexity estimate
const BRANCH_KINDS: &[&str] = &[
    "if_statement",
    "elif_clause",
    "for_statement",
    "while_statement",
    "with_statement",
    "try_statement",
    "except_clause",
    "except_group_clause",
    "boolean_operator",
    "conditional_expression",
    "for_in_clause",
    "if_clause",
    "case_clause",
];

/// First argument of a call, as far as static analysis can tell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArgument {
    /// Plain string literal (no interpolation, no escapes)
    Literal(String),
    /// Any other expression
    Dynamic,
    /// No positional argument
    Missing,
}

/// One call expression with a resolvable name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Dotted name with import aliases expanded (`o.system` → `os.system`)
    pub name: String,
    /// First positional argument, or a `file=` keyword
    pub first_arg: CallArgument,
    /// 1-based line
    pub line: usize,
}

/// Facts extracted from a successfully parsed file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceAnalysis {
    /// Imported module names
    pub imports: BTreeSet<String>,
    /// Calls in source order
    pub calls: Vec<CallSite>,
    /// `1 + number of branch nodes`
    pub complexity: u32,
}

impl SourceAnalysis {
    /// Distinct call names, sorted
    #[must_use]
    pub fn call_names(&self) -> Vec<String> {
        self.calls
            .iter()
            .map(|c| c.name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Candidate text as it is reviewed and written: a leading BOM removed and
/// the indentation common to every non-blank line stripped.
///
/// Lines holding only spaces and tabs are emptied when a margin is removed,
/// keeping their line terminator. Text with no common margin is returned
/// unchanged.
#[must_use]
pub fn normalize_source(code: &str) -> Cow<'_, str> {
    let code = code.strip_prefix('\u{feff}').unwrap_or(code);
    let margin = code
        .split_inclusive('\n')
        .filter(|line| !is_blank(line))
        .map(indent_of)
        .reduce(common_prefix)
        .unwrap_or("");
    if margin.is_empty() {
        return Cow::Borrowed(code);
    }

    let mut out = String::with_capacity(code.len());
    for line in code.split_inclusive('\n') {
        if is_blank(line) {
            out.push_str(&line[line.trim_end_matches(['\r', '\n']).len()..]);
        } else {
            out.push_str(&line[margin.len()..]);
        }
    }
    Cow::Owned(out)
}

fn is_indent_char(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn is_blank(line: &str) -> bool {
    line.trim_end_matches(['\r', '\n']).chars().all(is_indent_char)
}

fn indent_of(line: &str) -> &str {
    &line[..line.len() - line.trim_start_matches(is_indent_char).len()]
}

fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let len = a
        .bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count();
    &a[..len]
}

fn parse(source: &str) -> Result<Tree, ParseError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| ParseError::Language(e.to_string()))?;
    let tree = parser.parse(source, None).ok_or(ParseError::NoTree)?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(first_error(root, source.as_bytes()));
    }
    Ok(tree)
}

/// Parse `source` and report the first syntax error, if any.
///
/// # Errors
/// [`ParseError::Syntax`] with the position of the first error or missing
/// node; other variants if the parser itself is unusable.
pub fn check_syntax(source: &str) -> Result<(), ParseError> {
    parse(source).map(|_| ())
}

/// Parse and analyze `source`.
///
/// # Errors
/// Same as [`check_syntax`].
pub fn analyze(source: &str) -> Result<SourceAnalysis, ParseError> {
    let tree = parse(source)?;
    let src = source.as_bytes();
    let mut aliases = BTreeMap::new();
    let mut imports = BTreeSet::new();
    let mut raw_calls = Vec::new();
    let mut complexity = 1u32;

    walk(tree.root_node(), |node| {
        match node.kind() {
            "import_statement" => collect_import(node, src, &mut imports, &mut aliases),
            "import_from_statement" => collect_from_import(node, src, &mut imports, &mut aliases),
            "future_import_statement" => {
                imports.insert("__future__".to_string());
            }
            "call" => raw_calls.push(node),
            kind if BRANCH_KINDS.contains(&kind) => complexity = complexity.saturating_add(1),
            _ => {}
        }
        true
    });

    // Aliases are applied after the walk so a call before its import still
    // resolves; Python would fail at runtime, but the intent is what matters.
    let calls = raw_calls
        .into_iter()
        .filter_map(|node| call_site(node, src, &aliases))
        .collect();

    Ok(SourceAnalysis {
        imports,
        calls,
        complexity,
    })
}

/// Pre-order traversal; `visit` returns `false` to stop.
fn walk<'t>(root: Node<'t>, mut visit: impl FnMut(Node<'t>) -> bool) {
    let mut cursor = root.walk();
    loop {
        if !visit(cursor.node()) {
            return;
        }
        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return;
            }
        }
    }
}

fn first_error(root: Node<'_>, src: &[u8]) -> ParseError {
    let mut found = None;
    walk(root, |node| {
        if node.is_error() || node.is_missing() {
            found = Some(node);
            return false;
        }
        true
    });
    let Some(node) = found else {
        return ParseError::syntax_error(1, 1, "invalid syntax");
    };
    let pos = node.start_position();
    let message = if node.is_missing() {
        format!("missing `{}`", node.kind())
    } else {
        let text = node.utf8_text(src).unwrap_or_default();
        let snippet: String = text.chars().take(24).collect();
        format!("unexpected `{}`", snippet.trim())
    };
    ParseError::syntax_error(pos.row + 1, pos.column + 1, message)
}

fn text<'s>(node: Node<'_>, src: &'s [u8]) -> Option<&'s str> {
    node.utf8_text(src).ok()
}

fn collect_import(
    node: Node<'_>,
    src: &[u8],
    imports: &mut BTreeSet<String>,
    aliases: &mut BTreeMap<String, String>,
) {
    let mut cursor = node.walk();
    for name in node.children_by_field_name("name", &mut cursor) {
        match name.kind() {
            "dotted_name" => {
                if let Some(module) = text(name, src) {
                    imports.insert(module.to_string());
                }
            }
            "aliased_import" => {
                let module = name.child_by_field_name("name").and_then(|n| text(n, src));
                let alias = name.child_by_field_name("alias").and_then(|n| text(n, src));
                if let Some(module) = module {
                    imports.insert(module.to_string());
                    if let Some(alias) = alias {
                        aliases.insert(alias.to_string(), module.to_string());
                    }
                }
            }
            _ => {}
        }
    }
}

fn collect_from_import(
    node: Node<'_>,
    src: &[u8],
    imports: &mut BTreeSet<String>,
    aliases: &mut BTreeMap<String, String>,
) {
    let Some(module_node) = node.child_by_field_name("module_name") else {
        return;
    };
    let Some(module) = text(module_node, src) else {
        return;
    };
    imports.insert(module.to_string());
    // Relative imports name local modules; their members keep local names.
    if module_node.kind() == "relative_import" {
        return;
    }
    let mut cursor = node.walk();
    for name in node.children_by_field_name("name", &mut cursor) {
        let (member, bound) = match name.kind() {
            "dotted_name" => match text(name, src) {
                Some(member) => (member, member),
                None => continue,
            },
            "aliased_import" => {
                let member = name.child_by_field_name("name").and_then(|n| text(n, src));
                let alias = name.child_by_field_name("alias").and_then(|n| text(n, src));
                match (member, alias) {
                    (Some(member), Some(alias)) => (member, alias),
                    _ => continue,
                }
            }
            _ => continue,
        };
        aliases.insert(bound.to_string(), format!("{module}.{member}"));
    }
}

/// Dotted name of an identifier/attribute chain; `None` if the chain's base
/// is anything else (a call, a subscript, a literal).
fn dotted_name(node: Node<'_>, src: &[u8]) -> Option<String> {
    let mut parts = Vec::new();
    let mut current = node;
    loop {
        match current.kind() {
            "identifier" => {
                parts.push(text(current, src)?);
                break;
            }
            "attribute" => {
                parts.push(text(current.child_by_field_name("attribute")?, src)?);
                current = current.child_by_field_name("object")?;
            }
            _ => return None,
        }
    }
    parts.reverse();
    Some(parts.join("."))
}

fn expand_alias(name: &str, aliases: &BTreeMap<String, String>) -> String {
    let (head, rest) = match name.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (name, None),
    };
    match (aliases.get(head), rest) {
        (Some(full), Some(rest)) => format!("{full}.{rest}"),
        (Some(full), None) => full.clone(),
        (None, _) => name.to_string(),
    }
}

fn call_site(node: Node<'_>, src: &[u8], aliases: &BTreeMap<String, String>) -> Option<CallSite> {
    let function = node.child_by_field_name("function")?;
    let name = expand_alias(&dotted_name(function, src)?, aliases);
    let first_arg = node
        .child_by_field_name("arguments")
        .map_or(CallArgument::Missing, |args| first_argument(args, src));
    Some(CallSite {
        name,
        first_arg,
        line: node.start_position().row + 1,
    })
}

fn first_argument(args: Node<'_>, src: &[u8]) -> CallArgument {
    if args.kind() != "argument_list" {
        return CallArgument::Dynamic;
    }
    let mut keyword_file = None;
    let mut cursor = args.walk();
    for child in args.named_children(&mut cursor) {
        match child.kind() {
            "comment" => {}
            "keyword_argument" => {
                let is_file = child
                    .child_by_field_name("name")
                    .and_then(|n| text(n, src))
                    .is_some_and(|n| n == "file" || n == "path");
                if is_file && keyword_file.is_none() {
                    keyword_file = child.child_by_field_name("value");
                }
            }
            _ => return classify(child, src),
        }
    }
    keyword_file.map_or(CallArgument::Missing, |value| classify(value, src))
}

fn classify(node: Node<'_>, src: &[u8]) -> CallArgument {
    string_literal(node, src).map_or(CallArgument::Dynamic, CallArgument::Literal)
}

fn string_literal(node: Node<'_>, src: &[u8]) -> Option<String> {
    if node.kind() != "string" {
        return None;
    }
    let mut start = None;
    let mut end = None;
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "string_start" => start = Some(child),
            "string_end" => end = Some(child),
            "interpolation" => return None,
            _ => {}
        }
    }
    let (start, end) = (start?, end?);
    if text(start, src)?.contains(['f', 'F']) {
        return None;
    }
    let body = std::str::from_utf8(src.get(start.end_byte()..end.start_byte())?).ok()?;
    if body.contains('\\') {
        return None;
    }
    Some(body.to_string())
}
