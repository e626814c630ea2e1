//! Classification tables for imports and calls.
//!
//! Names are matched on dotted-segment boundaries: the entry `urllib` covers
//! `urllib` and `urllib.request`, but not `urllib3`.

use crate::policy::SecurityPolicy;

use super::Rule;

/// Modules that can open network connections.
pub const NETWORK_MODULES: &[&str] = &[
    "socket",
    "socketserver",
    "ssl",
    "http",
    "urllib",
    "urllib3",
    "requests",
    "httpx",
    "aiohttp",
    "ftplib",
    "smtplib",
    "poplib",
    "imaplib",
    "nntplib",
    "telnetlib",
    "xmlrpc",
    "asyncore",
    "websocket",
    "websockets",
    "paramiko",
    "grpc",
];

/// Modules whose main purpose is creating, moving or deleting files.
pub const FILESYSTEM_WRITE_MODULES: &[&str] = &[
    "shutil",
    "tempfile",
    "pathlib",
    "fileinput",
    "sqlite3",
    "dbm",
    "shelve",
    "zipfile",
    "tarfile",
];

/// Builtins and library calls that compile or resolve code at runtime.
const DYNAMIC_EVAL_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "globals",
    "locals",
    "vars",
    "importlib.import_module",
    "importlib.__import__",
];

/// Attribute accessors that are only dynamic when the name is not a literal.
pub const DYNAMIC_ATTRIBUTE_CALLS: &[&str] = &["getattr", "setattr", "delattr"];

const PROCESS_SPAWN_CALLS: &[&str] = &[
    "os.system",
    "os.popen",
    "os.fork",
    "os.forkpty",
    "os.startfile",
    "pty.spawn",
    "pty.fork",
    "multiprocessing.Process",
    "multiprocessing.Pool",
    "asyncio.create_subprocess_exec",
    "asyncio.create_subprocess_shell",
];

/// Call families matched by name prefix (`os.execv`, `os.spawnlp`, ...).
const PROCESS_SPAWN_PREFIXES: &[&str] = &["os.exec", "os.spawn", "os.posix_spawn", "subprocess."];

/// Modules that expose another module's functions under their own name.
const MODULE_SYNONYMS: &[(&str, &str)] = &[
    ("posix", "os"),
    ("nt", "os"),
    ("__builtins__", "builtins"),
];

const RAW_SOCKET_CALLS: &[&str] = &[
    "socket.socket",
    "socket.create_connection",
    "socket.create_server",
    "socket.socketpair",
    "socket.fromfd",
];

/// Calls that open a file and take a mode string.
pub const OPEN_CALLS: &[&str] = &["open", "io.open", "codecs.open"];

/// Rewrite a leading synonym (`posix.system` → `os.system`) and drop the
/// `builtins.` qualifier (`builtins.eval` → `eval`).
pub fn canonical_call(name: &str) -> String {
    let (head, rest) = match name.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (name, None),
    };
    let renamed = match MODULE_SYNONYMS.iter().find(|(from, _)| *from == head) {
        Some((_, to)) => match rest {
            Some(rest) => format!("{to}.{rest}"),
            None => (*to).to_string(),
        },
        None => name.to_string(),
    };
    match renamed.strip_prefix("builtins.") {
        Some(stripped) => stripped.to_string(),
        None => renamed,
    }
}

/// Does `name` equal `entry` or live underneath it?
pub fn matches_module(name: &str, entry: &str) -> bool {
    name == entry
        || name
            .strip_prefix(entry)
            .is_some_and(|rest| rest.starts_with('.'))
}

fn matches_any(name: &str, table: &[&str]) -> bool {
    table.iter().any(|entry| matches_module(name, entry))
}

/// Classify an imported dotted name. Precedence: denied list, then network,
/// then filesystem writes.
pub fn classify_import(module: &str, policy: &SecurityPolicy) -> Option<(Rule, String)> {
    if let Some(entry) = policy
        .denied_modules()
        .iter()
        .find(|entry| matches_module(module, entry))
    {
        return Some((
            Rule::DeniedModule,
            format!("import of denied module `{module}` (policy entry `{entry}`)"),
        ));
    }
    if !policy.allow_network() && matches_any(module, NETWORK_MODULES) {
        return Some((
            Rule::NetworkModule,
            format!("import of network-capable module `{module}` while network access is denied"),
        ));
    }
    if !policy.allow_filesystem_write() && matches_any(module, FILESYSTEM_WRITE_MODULES) {
        return Some((
            Rule::FilesystemModule,
            format!(
                "import of filesystem-write-capable module `{module}` while filesystem writes are denied"
            ),
        ));
    }
    None
}

/// Classify a resolved call name against the always-on call rules.
///
/// Returns `None` for calls the policy explicitly allows.
pub fn classify_call(name: &str, policy: &SecurityPolicy) -> Option<(Rule, String)> {
    if policy.allowed_calls().contains(name) {
        return None;
    }
    if DYNAMIC_EVAL_CALLS.contains(&name) {
        return Some((
            Rule::DynamicEval,
            format!("call to dynamic evaluation primitive `{name}`"),
        ));
    }
    if PROCESS_SPAWN_CALLS.contains(&name)
        || PROCESS_SPAWN_PREFIXES.iter().any(|p| name.starts_with(p))
    {
        return Some((
            Rule::ProcessSpawn,
            format!("call to process-spawning function `{name}`"),
        ));
    }
    if RAW_SOCKET_CALLS.contains(&name) {
        return Some((
            Rule::RawSocket,
            format!("call to raw socket function `{name}`"),
        ));
    }
    None
}

/// Does an `open()` mode string request write access?
pub fn is_write_mode(mode: &str) -> bool {
    mode.chars().any(|c| matches!(c, 'w' | 'a' | 'x' | '+'))
}
