//! Static analysis of candidate code against a [`SecurityPolicy`].
//!
//! [`analyze`] parses the candidate into a syntax tree and reports every
//! construct the policy forbids, before anything is executed. It is a pure
//! function: the same `(code, policy)` always yields the same ordered list.
//!
//! # Modules
//!
//! - [`rules`]: import/call classification tables
//! - `walk`: tree traversal and alias resolution

pub mod rules;
mod walk;

use serde::{Deserialize, Serialize};
use tree_sitter::Parser;

use crate::policy::SecurityPolicy;

/// Which rule a [`Violation`] breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    SyntaxError,
    DeniedModule,
    NetworkModule,
    FilesystemModule,
    DynamicEval,
    ProcessSpawn,
    RawSocket,
    FilesystemWrite,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::SyntaxError => "syntax_error",
            Rule::DeniedModule => "denied_module",
            Rule::NetworkModule => "network_module",
            Rule::FilesystemModule => "filesystem_module",
            Rule::DynamicEval => "dynamic_eval",
            Rule::ProcessSpawn => "process_spawn",
            Rule::RawSocket => "raw_socket",
            Rule::FilesystemWrite => "filesystem_write",
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single static-analysis finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: Rule,
    pub detail: String,
    /// 1-based source line, when known.
    pub line: Option<u32>,
}

impl Violation {
    pub fn new(rule: Rule, detail: impl Into<String>, line: Option<u32>) -> Self {
        Self {
            rule,
            detail: detail.into(),
            line,
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: {}: {}", self.rule, self.detail),
            None => write!(f, "{}: {}", self.rule, self.detail),
        }
    }
}

/// Analyze `code` and return the policy violations in source order.
///
/// A parse failure yields exactly one [`Rule::SyntaxError`] violation and no
/// further analysis. Python 2 `print`/`exec` statements count as parse
/// failures.
pub fn analyze(code: &str, policy: &SecurityPolicy) -> Vec<Violation> {
    let mut parser = Parser::new();
    if let Err(err) = parser.set_language(tree_sitter_python::language()) {
        return vec![Violation::new(
            Rule::SyntaxError,
            format!("python grammar unavailable: {err:?}"),
            None,
        )];
    }
    let Some(tree) = parser.parse(code, None) else {
        return vec![Violation::new(
            Rule::SyntaxError,
            "parser produced no syntax tree",
            None,
        )];
    };

    let root = tree.root_node();
    if root.has_error() {
        return vec![walk::first_syntax_error(root, code.as_bytes()).into_violation()];
    }
    if let Some(legacy) = walk::first_legacy_statement(root) {
        return vec![legacy.into_violation()];
    }

    let mut findings = walk::PolicyWalker::new(code.as_bytes(), policy).walk(root);
    findings.sort_by_key(|f| f.position());
    findings.into_iter().map(|f| f.into_violation()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules_of(code: &str, policy: &SecurityPolicy) -> Vec<(Rule, Option<u32>)> {
        analyze(code, policy)
            .into_iter()
            .map(|v| (v.rule, v.line))
            .collect()
    }

    #[test]
    fn test_clean_code_has_no_violations() {
        let code = "import json\n\ndef run(x):\n    return json.dumps({'x': x})\n\nprint(run(1))\n";
        assert!(analyze(code, &SecurityPolicy::default()).is_empty());
    }

    #[test]
    fn test_socket_import_is_single_violation() {
        let v = analyze("import socket\n", &SecurityPolicy::default());
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].rule, Rule::DeniedModule);
        assert_eq!(v[0].line, Some(1));
        assert!(v[0].detail.contains("socket"));
    }

    #[test]
    fn test_syntax_error_stops_analysis() {
        let v = analyze("import subprocess\ndef broken(:\n    pass\n", &SecurityPolicy::default());
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].rule, Rule::SyntaxError);
    }

    #[test]
    fn test_network_import_flagged_even_unused() {
        let policy = SecurityPolicy::default();
        let code = "def run():\n    return 1\n\nimport requests\n";
        assert_eq!(rules_of(code, &policy), vec![(Rule::NetworkModule, Some(4))]);
    }

    #[test]
    fn test_alias_resolution_for_calls() {
        let policy = SecurityPolicy::builder()
            .permit_module("subprocess")
            .build()
            .unwrap();
        let code = "import subprocess as sp\nsp.run(['ls'])\n";
        assert_eq!(rules_of(code, &policy), vec![(Rule::ProcessSpawn, Some(2))]);
    }

    #[test]
    fn test_from_import_binding_resolves() {
        let code = "from os import system\nsystem('id')\n";
        assert_eq!(
            rules_of(code, &SecurityPolicy::default()),
            vec![(Rule::ProcessSpawn, Some(2))]
        );
    }

    #[test]
    fn test_relative_import_ignored() {
        assert!(analyze("from . import socket\n", &SecurityPolicy::default()).is_empty());
    }

    #[test]
    fn test_getattr_literal_vs_dynamic() {
        let policy = SecurityPolicy::default();
        assert!(analyze("getattr(obj, 'name')\n", &policy).is_empty());
        assert_eq!(
            rules_of("getattr(obj, attr)\n", &policy),
            vec![(Rule::DynamicEval, Some(1))]
        );
    }

    #[test]
    fn test_open_write_mode() {
        let policy = SecurityPolicy::default();
        assert!(analyze("open('data.txt')\n", &policy).is_empty());
        assert!(analyze("open('data.txt', 'rb')\n", &policy).is_empty());
        assert_eq!(
            rules_of("open('out.txt', mode='w')\n", &policy),
            vec![(Rule::FilesystemWrite, Some(1))]
        );
        assert_eq!(
            rules_of("open('out.txt', m)\n", &policy),
            vec![(Rule::FilesystemWrite, Some(1))]
        );
    }

    #[test]
    fn test_violations_ordered_by_position() {
        let code = "x = eval('1')\nimport socket\ny = compile('1', 'f', 'eval')\n";
        let lines: Vec<_> = analyze(code, &SecurityPolicy::default())
            .into_iter()
            .map(|v| v.line)
            .collect();
        assert_eq!(lines, vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_python2_print_is_syntax_error() {
        let violations = analyze("x = 1\nprint 'hi'\n", &SecurityPolicy::default());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, Rule::SyntaxError);
        assert_eq!(violations[0].line, Some(2));
        assert!(violations[0].detail.contains("print"));
    }

    #[test]
    fn test_python2_exec_is_syntax_error() {
        let policy = SecurityPolicy::builder().allow_call("exec").build().unwrap();
        assert_eq!(
            rules_of("exec 'x = 1'\n", &policy),
            vec![(Rule::SyntaxError, Some(1))]
        );
    }

    #[test]
    fn test_print_function_is_clean() {
        assert!(analyze("print('hi')\nprint('a', 'b', sep=',')\n", &SecurityPolicy::default()).is_empty());
    }

    #[test]
    fn test_builtins_namespace_does_not_hide_eval() {
        let policy = SecurityPolicy::default();
        assert_eq!(
            rules_of("__builtins__.eval('1+1')\n", &policy),
            vec![(Rule::DynamicEval, Some(1))]
        );
        assert_eq!(
            rules_of("import builtins\nbuiltins.exec('pass')\n", &policy),
            vec![(Rule::DynamicEval, Some(2))]
        );
    }

    #[test]
    fn test_posix_module_denied_by_default() {
        assert_eq!(
            rules_of("import posix\n", &SecurityPolicy::default()),
            vec![(Rule::DeniedModule, Some(1))]
        );
        assert_eq!(
            rules_of("import _posixsubprocess\n", &SecurityPolicy::default()),
            vec![(Rule::DeniedModule, Some(1))]
        );
    }

    #[test]
    fn test_posix_calls_resolve_to_os() {
        let policy = SecurityPolicy::builder()
            .permit_module("posix")
            .build()
            .unwrap();
        assert_eq!(
            rules_of("import posix\nposix.system('id')\n", &policy),
            vec![(Rule::ProcessSpawn, Some(2))]
        );
        assert_eq!(
            rules_of("import posix as p\np.fork()\n", &policy),
            vec![(Rule::ProcessSpawn, Some(2))]
        );
        assert_eq!(
            rules_of("from posix import execv\nexecv('/bin/sh', [])\n", &policy),
            vec![(Rule::ProcessSpawn, Some(2))]
        );
    }

    #[test]
    fn test_display_format() {
        let v = Violation::new(Rule::RawSocket, "call to raw socket", Some(3));
        assert_eq!(v.to_string(), "line 3: raw_socket: call to raw socket");
        let v = Violation::new(Rule::SyntaxError, "bad", None);
        assert_eq!(v.to_string(), "syntax_error: bad");
    }
}
