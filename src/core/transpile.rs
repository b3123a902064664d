//! Module syntax normalization
//!
//! Task bodies may use `import`/`export` statements. The sandbox loader only
//! understands CommonJS (`require`, `exports`), so every task and utility
//! file is rewritten before it is staged for a run. The rewrite is
//! statement-level and line-preserving: each rewritten statement keeps the
//! same number of lines so stack traces still point at the author's code.
//!
//! Only statements that start in code are touched. Text inside string
//! literals, template literals and comments is left as written.
//!
//! Two helpers are injected by the sandbox module wrapper and referenced by
//! the output: `__esDefault(m)` (default-import interop) and
//! `__dynamicImport(specifier)`.

use regex::{Captures, Regex};
use std::sync::LazyLock;
use thiserror::Error;

/// Normalization failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranspileError {
    #[error("line {line}: unsupported module syntax: {text}")]
    Unsupported { line: usize, text: String },
}

const PRELUDE: &str = "\"use strict\"; Object.defineProperty(exports, \"__esModule\", { value: true }); ";

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

static SIDE_EFFECT_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| re(r#"(?m)^([ \t]*)import\s*['"]([^'"\n]+)['"][ \t]*;?"#));

static IMPORT_FROM: LazyLock<Regex> = LazyLock::new(|| {
    re(r#"(?m)^([ \t]*)import\s+(?:([\w$]+)\s*,\s*)?(?:\*\s*as\s+([\w$]+)\s+|\{([^}]*)\}\s*|([\w$]+)\s+)from\s*['"]([^'"\n]+)['"][ \t]*;?"#)
});

static EXPORT_STAR_FROM: LazyLock<Regex> = LazyLock::new(|| {
    re(r#"(?m)^([ \t]*)export\s*\*\s*(?:as\s+([\w$]+)\s+)?from\s*['"]([^'"\n]+)['"][ \t]*;?"#)
});

static EXPORT_NAMED_FROM: LazyLock<Regex> = LazyLock::new(|| {
    re(r#"(?m)^([ \t]*)export\s*\{([^}]*)\}\s*from\s*['"]([^'"\n]+)['"][ \t]*;?"#)
});

static EXPORT_LIST: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^([ \t]*)export\s*\{([^}]*)\}[ \t]*;?"));

static EXPORT_DEFAULT_DECL: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?m)^([ \t]*)export\s+default\s+((?:async\s+)?function\s*\*?\s*([\w$]+)|class\s+([\w$]+))")
});

static EXPORT_DEFAULT_EXPR: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^([ \t]*)export\s+default\s+"));

static EXPORT_DECL: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?m)^([ \t]*)export\s+((?:async\s+)?function\s*\*?\s*([\w$]+)|class\s+([\w$]+)|(?:const|let|var)\s+([\w$]+))")
});

static DYNAMIC_IMPORT: LazyLock<Regex> = LazyLock::new(|| re(r"\bimport\s*\("));

static LEFTOVER: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^[ \t]*(?:import|export)\s.*$"));

/// `a, b as c` -> [(a, a), (b, c)]
fn bindings(list: &str) -> Vec<(String, String)> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| match item.split_once(" as ") {
            Some((imported, local)) => (imported.trim().to_string(), local.trim().to_string()),
            None => (item.to_string(), item.to_string()),
        })
        .collect()
}

fn quote(specifier: &str) -> String {
    serde_json::to_string(specifier).unwrap_or_else(|_| format!("\"{}\"", specifier))
}

/// Keep the statement's line count so later lines do not shift
fn pad_lines(matched: &str, mut replacement: String) -> String {
    for _ in 0..matched.matches('\n').count() {
        replacement.push('\n');
    }
    replacement
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    LineComment,
    BlockComment,
    Quoted(u8),
    Template,
}

/// Per-byte flag, `true` where the byte is code rather than literal text or
/// a comment. `${...}` inside a template literal counts as code.
///
/// Regex literals are not recognized; a quote inside one reads as the start
/// of a string.
fn code_mask(source: &str) -> Vec<bool> {
    let bytes = source.as_bytes();
    let mut mask = vec![false; bytes.len()];
    let mut state = Scan::Code;
    // brace depth at which each open `${` returns to its template
    let mut holes: Vec<usize> = Vec::new();
    let mut depth = 0usize;

    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();
        mask[i] = state == Scan::Code;
        match state {
            Scan::Code => match c {
                b'/' if next == Some(b'/') => state = Scan::LineComment,
                b'/' if next == Some(b'*') => state = Scan::BlockComment,
                b'\'' | b'"' => state = Scan::Quoted(c),
                b'`' => state = Scan::Template,
                b'{' => depth += 1,
                b'}' if holes.last() == Some(&depth) => {
                    holes.pop();
                    state = Scan::Template;
                }
                b'}' => depth = depth.saturating_sub(1),
                _ => {}
            },
            Scan::LineComment => {
                if c == b'\n' {
                    state = Scan::Code;
                }
            }
            Scan::BlockComment => {
                if c == b'*' && next == Some(b'/') {
                    i += 1;
                    state = Scan::Code;
                }
            }
            Scan::Quoted(delim) => {
                if c == b'\\' {
                    i += 1;
                } else if c == delim || c == b'\n' {
                    state = Scan::Code;
                }
            }
            Scan::Template => {
                if c == b'\\' {
                    i += 1;
                } else if c == b'`' {
                    state = Scan::Code;
                } else if c == b'$' && next == Some(b'{') {
                    i += 1;
                    holes.push(depth);
                    state = Scan::Code;
                }
            }
        }
        i += 1;
    }
    mask
}

#[derive(Default)]
struct Rewriter {
    counter: usize,
    trailer: Vec<String>,
    rewritten: bool,
}

impl Rewriter {
    fn temp(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("__{}_{}", prefix, self.counter)
    }

    fn apply<F>(&mut self, source: String, pattern: &Regex, mut f: F) -> String
    where
        F: FnMut(&mut Self, &Captures) -> String,
    {
        if !pattern.is_match(&source) {
            return source;
        }
        let code = code_mask(&source);
        pattern
            .replace_all(&source, |caps: &Captures| {
                let matched = &caps[0];
                let start = caps.get(0).map_or(0, |m| m.start());
                if !code[start] {
                    return matched.to_string();
                }
                self.rewritten = true;
                let out = f(self, caps);
                pad_lines(matched, out)
            })
            .into_owned()
    }
}

fn named_import(target: &str, list: &str) -> String {
    let fields: Vec<String> = bindings(list)
        .into_iter()
        .map(|(imported, local)| {
            if imported == local {
                imported
            } else {
                format!("{}: {}", imported, local)
            }
        })
        .collect();
    format!("const {{ {} }} = {};", fields.join(", "), target)
}

/// Rewrite module syntax to CommonJS
pub fn transpile(source: &str) -> Result<String, TranspileError> {
    let mut rw = Rewriter::default();
    let mut code = source.to_string();

    code = rw.apply(code, &SIDE_EFFECT_IMPORT, |_, caps| {
        format!("{}require({});", &caps[1], quote(&caps[2]))
    });

    code = rw.apply(code, &IMPORT_FROM, |rw, caps| {
        let indent = &caps[1];
        let module = format!("require({})", quote(&caps[6]));

        let default = caps.get(2).or_else(|| caps.get(5)).map(|m| m.as_str());
        let namespace = caps.get(3).map(|m| m.as_str());
        let named = caps.get(4).map(|m| m.as_str());

        match (default, namespace, named) {
            (None, Some(ns), None) => format!("{}const {} = {};", indent, ns, module),
            (None, None, Some(list)) => format!("{}{}", indent, named_import(&module, list)),
            (Some(name), None, None) => {
                format!("{}const {} = __esDefault({});", indent, name, module)
            }
            (Some(name), ns, list) => {
                let tmp = rw.temp("import");
                let mut out = format!(
                    "{}const {} = {}; const {} = __esDefault({});",
                    indent, tmp, module, name, tmp
                );
                if let Some(ns) = ns {
                    out.push_str(&format!(" const {} = {};", ns, tmp));
                }
                if let Some(list) = list {
                    out.push(' ');
                    out.push_str(&named_import(&tmp, list));
                }
                out
            }
            _ => caps[0].to_string(),
        }
    });

    code = rw.apply(code, &EXPORT_STAR_FROM, |_, caps| {
        let module = format!("require({})", quote(&caps[3]));
        match caps.get(2) {
            Some(ns) => format!("{}exports.{} = {};", &caps[1], ns.as_str(), module),
            None => format!("{}Object.assign(exports, {});", &caps[1], module),
        }
    });

    code = rw.apply(code, &EXPORT_NAMED_FROM, |rw, caps| {
        let tmp = rw.temp("reexport");
        let assigns: Vec<String> = bindings(&caps[2])
            .into_iter()
            .map(|(imported, exported)| format!("exports.{} = {}.{};", exported, tmp, imported))
            .collect();
        format!(
            "{}{{ const {} = require({}); {} }}",
            &caps[1],
            tmp,
            quote(&caps[3]),
            assigns.join(" ")
        )
    });

    code = rw.apply(code, &EXPORT_LIST, |_, caps| {
        let assigns: Vec<String> = bindings(&caps[2])
            .into_iter()
            .map(|(local, exported)| format!("exports.{} = {};", exported, local))
            .collect();
        format!("{}{}", &caps[1], assigns.join(" "))
    });

    code = rw.apply(code, &EXPORT_DEFAULT_DECL, |rw, caps| {
        let name = caps.get(3).or_else(|| caps.get(4)).map(|m| m.as_str()).unwrap_or_default();
        // `export default class extends Base` is anonymous
        if name == "extends" {
            return format!("{}exports.default = {}", &caps[1], &caps[2]);
        }
        rw.trailer.push(format!("exports.default = {};", name));
        format!("{}{}", &caps[1], &caps[2])
    });

    code = rw.apply(code, &EXPORT_DEFAULT_EXPR, |_, caps| {
        format!("{}exports.default = ", &caps[1])
    });

    code = rw.apply(code, &EXPORT_DECL, |rw, caps| {
        let name = caps
            .get(3)
            .or_else(|| caps.get(4))
            .or_else(|| caps.get(5))
            .map(|m| m.as_str())
            .unwrap_or_default();
        rw.trailer.push(format!("exports.{} = {};", name, name));
        format!("{}{}", &caps[1], &caps[2])
    });

    code = rw.apply(code, &DYNAMIC_IMPORT, |_, _| "__dynamicImport(".to_string());

    let mask = code_mask(&code);
    if let Some(m) = LEFTOVER.find_iter(&code).find(|m| mask[m.start()]) {
        let line = code[..m.start()].matches('\n').count() + 1;
        return Err(TranspileError::Unsupported {
            line,
            text: m.as_str().trim().to_string(),
        });
    }

    if !rw.rewritten {
        return Ok(code);
    }

    let mut out = String::with_capacity(PRELUDE.len() + code.len() + 64);
    out.push_str(PRELUDE);
    out.push_str(&code);
    if !rw.trailer.is_empty() {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&rw.trailer.join("\n"));
        out.push('\n');
    }
    Ok(out)
}
