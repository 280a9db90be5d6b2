//! Best-effort detection of environment changes made by a payload.
//!
//! Nothing here is authoritative: the results only feed the notice shown
//! when a sandbox is recreated.

use crate::sandbox::Payload;

/// What a payload appeared to change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentChanges {
    /// Package names, without version specifiers.
    pub packages: Vec<String>,
    /// Paths written to.
    pub files: Vec<String>,
    /// Exported variables.
    pub variables: Vec<(String, String)>,
}

impl EnvironmentChanges {
    /// True when nothing was detected.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.files.is_empty() && self.variables.is_empty()
    }
}

/// Inspects a payload for package installs, file writes and exports.
pub fn observe(payload: &Payload) -> EnvironmentChanges {
    let mut changes = EnvironmentChanges::default();
    match payload {
        Payload::Command(command) => {
            for segment in split_segments(command) {
                observe_segment(&segment, &mut changes);
            }
        }
        Payload::Code(code) => observe_python(code, &mut changes),
    }
    changes
}

/// Splits on `&&`, `||`, `;`, `|` and newlines. Quoting is not respected;
/// a separator inside quotes just yields a segment that fails to tokenize.
fn split_segments(command: &str) -> Vec<String> {
    command
        .replace("&&", "\n")
        .replace("||", "\n")
        .split(['\n', ';', '|'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn observe_segment(segment: &str, changes: &mut EnvironmentChanges) {
    let Ok(tokens) = shell_words::split(segment) else {
        return;
    };

    let mut args: Vec<String> = Vec::new();
    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        // Redirections: `> f`, `>> f`, `>f`, `>>f`; stderr redirects are ignored.
        if token == ">" || token == ">>" {
            if let Some(target) = iter.next() {
                push_file(changes, &target);
            }
            continue;
        }
        if let Some(target) = token
            .strip_prefix(">>")
            .or_else(|| token.strip_prefix('>'))
        {
            push_file(changes, target);
            continue;
        }
        if token.starts_with("2>") || token.starts_with("&>") {
            if token == "2>" || token == "&>" {
                iter.next();
            }
            continue;
        }
        args.push(token);
    }

    let args = strip_prefixes(&args);
    let Some((program, rest)) = args.split_first() else {
        return;
    };

    match program.as_str() {
        "export" => {
            for assignment in rest {
                if let Some((key, value)) = assignment.split_once('=') {
                    changes.variables.push((key.to_string(), value.to_string()));
                }
            }
        }
        "pip" | "pip3" => pip_install(rest, changes),
        "python" | "python3" if rest.len() >= 2 && rest[0] == "-m" && rest[1] == "pip" => {
            pip_install(&rest[2..], changes);
        }
        "npm" | "pnpm" | "yarn" => {
            if matches!(
                rest.first().map(String::as_str),
                Some("install" | "i" | "add")
            ) {
                changes.packages.extend(positional(&rest[1..], &[]));
            }
        }
        "apt-get" | "apt" => {
            if let Some(pos) = rest.iter().position(|a| a == "install") {
                changes.packages.extend(positional(&rest[pos + 1..], &[]));
            }
        }
        "apk" => {
            if rest.first().map(String::as_str) == Some("add") {
                changes.packages.extend(positional(&rest[1..], &[]));
            }
        }
        "touch" | "tee" | "mkdir" => {
            for file in positional(rest, &[]) {
                push_file(changes, &file);
            }
        }
        "cp" | "mv" => {
            let paths = positional(rest, &[]);
            if paths.len() >= 2 {
                if let Some(dest) = paths.last() {
                    push_file(changes, dest);
                }
            }
        }
        _ => {}
    }
}

/// Drops `sudo` and leading `VAR=value` assignments.
fn strip_prefixes(args: &[String]) -> &[String] {
    let mut start = 0;
    while let Some(arg) = args.get(start) {
        let is_assignment = arg
            .split_once('=')
            .is_some_and(|(k, _)| !k.is_empty() && !k.starts_with('-'));
        if arg == "sudo" || (is_assignment && start + 1 < args.len()) {
            start += 1;
        } else {
            break;
        }
    }
    &args[start..]
}

fn pip_install(rest: &[String], changes: &mut EnvironmentChanges) {
    if rest.first().map(String::as_str) != Some("install") {
        return;
    }
    let valued = ["-r", "--requirement", "-c", "--constraint", "-i", "--index-url", "-t", "--target", "-e", "--editable"];
    changes.packages.extend(
        positional(&rest[1..], &valued)
            .into_iter()
            .map(|spec| package_name(&spec)),
    );
}

/// Non-flag arguments, skipping the values of options listed in `valued`.
fn positional(args: &[String], valued: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg.starts_with('-') {
            skip_next = valued.contains(&arg.as_str());
            continue;
        }
        out.push(arg.clone());
    }
    out
}

/// `numpy==1.26` → `numpy`, `requests[socks]>=2` → `requests`.
fn package_name(spec: &str) -> String {
    let end = spec
        .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | '[' | ';' | ' '))
        .unwrap_or(spec.len());
    spec[..end].to_string()
}

fn push_file(changes: &mut EnvironmentChanges, path: &str) {
    if path.is_empty() || path.starts_with("/dev/") || path.starts_with('&') {
        return;
    }
    changes.files.push(path.to_string());
}

/// Looks for `open("path", "w")` style writes.
fn observe_python(code: &str, changes: &mut EnvironmentChanges) {
    let mut rest = code;
    while let Some(pos) = rest.find("open(") {
        let after = &rest[pos + "open(".len()..];
        let call = after.split(')').next().unwrap_or("");
        let literals = string_literals(call);
        if let (Some(path), Some(mode)) = (literals.first(), literals.get(1)) {
            if mode.contains(['w', 'a', 'x']) {
                push_file(changes, path);
            }
        }
        rest = after;
    }

    for line in code.lines() {
        let line = line.trim();
        if let Some(command) = line.strip_prefix('!') {
            observe_segment(command, changes);
        }
    }
}

fn string_literals(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '"' || c == '\'' {
            let literal: String = chars.by_ref().take_while(|&ch| ch != c).collect();
            out.push(literal);
        }
    }
    out
}
