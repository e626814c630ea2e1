//! Syntax-tree traversal over the tree-sitter Python grammar.

use std::collections::HashMap;

use tree_sitter::Node;

use crate::policy::SecurityPolicy;

use super::rules::{
    canonical_call, classify_call, classify_import, is_write_mode, DYNAMIC_ATTRIBUTE_CALLS,
    OPEN_CALLS,
};
use super::{Rule, Violation};

/// A violation plus the position used for ordering.
#[derive(Debug)]
pub(super) struct Finding {
    row: usize,
    column: usize,
    rule: Rule,
    detail: String,
}

impl Finding {
    fn at(node: Node<'_>, rule: Rule, detail: String) -> Self {
        let pos = node.start_position();
        Self {
            row: pos.row,
            column: pos.column,
            rule,
            detail,
        }
    }

    pub(super) fn position(&self) -> (usize, usize) {
        (self.row, self.column)
    }

    pub(super) fn into_violation(self) -> Violation {
        Violation::new(self.rule, self.detail, u32::try_from(self.row + 1).ok())
    }
}

/// Locate the first `ERROR` or `MISSING` node in source order.
pub(super) fn first_syntax_error(root: Node<'_>, source: &[u8]) -> Finding {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_missing() {
            return Finding::at(
                node,
                Rule::SyntaxError,
                format!("invalid syntax: missing `{}`", node.kind()),
            );
        }
        if node.is_error() {
            let snippet = node
                .utf8_text(source)
                .unwrap_or("")
                .lines()
                .next()
                .unwrap_or("")
                .trim();
            let snippet: String = snippet.chars().take(40).collect();
            return Finding::at(
                node,
                Rule::SyntaxError,
                format!("invalid syntax near `{snippet}`"),
            );
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node
            .children(&mut cursor)
            .filter(|c| c.has_error() || c.is_missing())
            .collect();
        stack.extend(children.into_iter().rev());
    }
    Finding::at(root, Rule::SyntaxError, "invalid syntax".to_string())
}

/// Python 2 statement forms the grammar still accepts. Python 3 rejects
/// them at compile time, so they are reported as syntax errors.
const LEGACY_STATEMENTS: &[(&str, &str)] = &[
    ("print_statement", "print"),
    ("exec_statement", "exec"),
];

/// The first Python 2 statement in source order, if any.
pub(super) fn first_legacy_statement(root: Node<'_>) -> Option<Finding> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if let Some((_, keyword)) = LEGACY_STATEMENTS.iter().find(|(kind, _)| *kind == node.kind()) {
            return Some(Finding::at(
                node,
                Rule::SyntaxError,
                format!("invalid syntax: Python 2 `{keyword}` statement"),
            ));
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    None
}

/// Argument lookup result for a call site.
enum Arg {
    Absent,
    Literal(String),
    Dynamic,
}

/// Preorder walk that records policy findings and tracks import aliases.
pub(super) struct PolicyWalker<'a> {
    source: &'a [u8],
    policy: &'a SecurityPolicy,
    /// Local binding -> fully qualified dotted name.
    aliases: HashMap<String, String>,
    findings: Vec<Finding>,
}

impl<'a> PolicyWalker<'a> {
    pub(super) fn new(source: &'a [u8], policy: &'a SecurityPolicy) -> Self {
        Self {
            source,
            policy,
            aliases: HashMap::new(),
            findings: Vec::new(),
        }
    }

    pub(super) fn walk(mut self, root: Node<'_>) -> Vec<Finding> {
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            match node.kind() {
                "import_statement" => self.visit_import(node),
                "import_from_statement" => self.visit_import_from(node),
                "call" => self.visit_call(node),
                _ => {}
            }
            let mut cursor = node.walk();
            let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }
        self.findings
    }

    fn text(&self, node: Node<'_>) -> &'a str {
        node.utf8_text(self.source).unwrap_or("")
    }

    fn dotted_text(&self, node: Node<'_>) -> String {
        self.text(node)
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '\\')
            .collect()
    }

    fn push(&mut self, node: Node<'_>, rule: Rule, detail: String) {
        self.findings.push(Finding::at(node, rule, detail));
    }

    fn check_import(&mut self, node: Node<'_>, module: &str) {
        if let Some((rule, detail)) = classify_import(module, self.policy) {
            self.push(node, rule, detail);
        }
    }

    /// `import a.b`, `import a.b as c`
    fn visit_import(&mut self, node: Node<'_>) {
        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        for name in names {
            let (target, alias) = split_alias(name);
            let Some(target) = target else { continue };
            let module = self.dotted_text(target);
            match alias {
                Some(alias) => {
                    let binding = self.text(alias).to_string();
                    self.aliases.insert(binding, module.clone());
                }
                None => {
                    let head = module.split('.').next().unwrap_or("").to_string();
                    self.aliases.insert(head.clone(), head);
                }
            }
            self.check_import(name, &module);
        }
    }

    /// `from a import b`, `from a import b as c`, `from a import *`
    fn visit_import_from(&mut self, node: Node<'_>) {
        let Some(module_node) = node.child_by_field_name("module_name") else {
            return;
        };
        // Relative imports only reach the candidate's own package.
        if module_node.kind() == "relative_import" {
            return;
        }
        let module = self.dotted_text(module_node);

        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        if names.is_empty() {
            self.check_import(node, &module);
            return;
        }
        for name in names {
            let (target, alias) = split_alias(name);
            let Some(target) = target else { continue };
            let imported = self.dotted_text(target);
            let full = format!("{module}.{imported}");
            let binding = match alias {
                Some(alias) => self.text(alias).to_string(),
                None => imported,
            };
            self.aliases.insert(binding, full.clone());
            self.check_import(name, &full);
        }
    }

    fn visit_call(&mut self, node: Node<'_>) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let Some(raw) = self.dotted(function) else {
            return;
        };
        let name = self.resolve(&raw);
        let args = node
            .child_by_field_name("arguments")
            .filter(|a| a.kind() == "argument_list");

        if DYNAMIC_ATTRIBUTE_CALLS.contains(&name.as_str()) {
            if self.policy.allowed_calls().contains(&name) {
                return;
            }
            if !matches!(self.argument(args, 1, None), Arg::Literal(_)) {
                self.push(
                    node,
                    Rule::DynamicEval,
                    format!("call to `{name}` with a non-literal attribute name"),
                );
            }
            return;
        }

        if OPEN_CALLS.contains(&name.as_str()) {
            if self.policy.allow_filesystem_write() {
                return;
            }
            match self.argument(args, 1, Some("mode")) {
                Arg::Absent => {}
                Arg::Literal(mode) if !is_write_mode(&mode) => {}
                Arg::Literal(mode) => self.push(
                    node,
                    Rule::FilesystemWrite,
                    format!(
                        "call to `{name}` with write mode `{mode}` while filesystem writes are denied"
                    ),
                ),
                Arg::Dynamic => self.push(
                    node,
                    Rule::FilesystemWrite,
                    format!(
                        "call to `{name}` with a non-literal mode while filesystem writes are denied"
                    ),
                ),
            }
            return;
        }

        if let Some((rule, detail)) = classify_call(&name, self.policy) {
            self.push(node, rule, detail);
        }
    }

    /// Dotted name of a callee built only from identifiers and attributes.
    fn dotted(&self, node: Node<'_>) -> Option<String> {
        match node.kind() {
            "identifier" => Some(self.text(node).to_string()),
            "attribute" => {
                let object = node.child_by_field_name("object")?;
                let attribute = node.child_by_field_name("attribute")?;
                Some(format!("{}.{}", self.dotted(object)?, self.text(attribute)))
            }
            _ => None,
        }
    }

    /// Rewrite the head segment through the alias table.
    fn resolve(&self, raw: &str) -> String {
        let (head, rest) = match raw.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (raw, None),
        };
        let resolved = match (self.aliases.get(head), rest) {
            (Some(full), Some(rest)) => format!("{full}.{rest}"),
            (Some(full), None) => full.clone(),
            (None, _) => raw.to_string(),
        };
        canonical_call(&resolved)
    }

    /// Find the argument at `position` (0-based) or passed as `keyword`.
    fn argument(&self, args: Option<Node<'_>>, position: usize, keyword: Option<&str>) -> Arg {
        let Some(args) = args else {
            return Arg::Absent;
        };
        let mut cursor = args.walk();
        let mut index = 0;
        let mut saw_splat = false;
        for child in args.named_children(&mut cursor) {
            match child.kind() {
                "comment" => {}
                "list_splat" | "dictionary_splat" => saw_splat = true,
                "keyword_argument" => {
                    let name = child.child_by_field_name("name").map(|n| self.text(n));
                    if keyword.is_some() && name == keyword {
                        return match child.child_by_field_name("value") {
                            Some(value) => self.literal(value),
                            None => Arg::Dynamic,
                        };
                    }
                }
                _ => {
                    if index == position {
                        return self.literal(child);
                    }
                    index += 1;
                }
            }
        }
        if saw_splat {
            Arg::Dynamic
        } else {
            Arg::Absent
        }
    }

    fn literal(&self, node: Node<'_>) -> Arg {
        if node.kind() != "string" {
            return Arg::Dynamic;
        }
        let mut cursor = node.walk();
        let interpolated = node
            .named_children(&mut cursor)
            .any(|c| c.kind() == "interpolation");
        if interpolated {
            return Arg::Dynamic;
        }
        Arg::Literal(string_body(self.text(node)).to_string())
    }
}

fn split_alias(name: Node<'_>) -> (Option<Node<'_>>, Option<Node<'_>>) {
    if name.kind() == "aliased_import" {
        (
            name.child_by_field_name("name"),
            name.child_by_field_name("alias"),
        )
    } else {
        (Some(name), None)
    }
}

/// Strip prefix letters and quotes from a Python string literal.
fn string_body(literal: &str) -> &str {
    let body = literal.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    let quote = if body.starts_with("\"\"\"") || body.starts_with("'''") {
        3
    } else {
        1
    };
    if body.len() >= 2 * quote {
        &body[quote..body.len() - quote]
    } else {
        ""
    }
}
