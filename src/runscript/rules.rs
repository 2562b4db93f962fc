//! Line rules turning a captured sample runscript into a template.
//!
//! Rules are tried in order on every logical line. A rule either drops the
//! line, emits its final replacement, or rewrites it and hands it to the
//! following rules. The last rule always matches.

use lazy_static::lazy_static;
use regex::Regex;

use super::var;
use crate::config::PexTool;

/// Substrings marking one-off sample run steps that never belong in a template.
pub const DENYLIST: &[&str] = &["tar -c", "gzip", "rm -rf", "mkdir"];

const GENERATOR_ARGS: &[(&str, &str)] = &[
    ("-foundry-rule", var::PEX_DECK),
    ("-options-file", var::PEX_OPTION_FILE),
    ("-stream-map", var::LAYER_MAP_FILE),
    ("-stream-file", var::STREAM_FILE),
];

const STARRC_ARGS: &[(&str, &str)] = &[
    ("-cf", var::STARRC_STARCMD),
    ("-tcad", var::STARRC_DECK),
];

const STARRC_MARKER: &str = "gen_starcmd";
const METAL_STACK_MARKER: &str = "export METAL_STACK";

lazy_static! {
    static ref MODULE_LOAD: Regex = Regex::new(r"^(\s*)module\s+load\s+(.+)$").unwrap();
}

/// Fixed facts about the sample run a capture was produced by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureContext {
    pub tool: PexTool,
    /// Directory the sample run executed in.
    pub run_dir: String,
    /// Name of the sample cell extracted by the sample run.
    pub sample_cell: String,
}

/// Values recognized so far while converting one capture.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CaptureState {
    pub gds_file: Option<String>,
    pub lvs_file: Option<String>,
    pub layer_map_file: Option<String>,
    pub source_me_file: Option<String>,
    pub option_file: Option<String>,
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// Remove the line from the template.
    Drop,
    /// Final replacement of the line.
    Emit(Vec<String>),
    /// Lines to emit before the line, and the line as seen by the next rules.
    Continue { prelude: Vec<String>, line: String },
}

pub struct Rule {
    pub name: &'static str,
    pub matches: fn(&str, &CaptureContext) -> bool,
    pub rewrite: fn(&str, &CaptureContext, &mut CaptureState) -> Rewrite,
}

/// The rules in priority order.
pub fn rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "denylist",
            matches: |line, _| DENYLIST.iter().any(|d| line.contains(d)),
            rewrite: |_, _, _| Rewrite::Drop,
        },
        Rule {
            name: "module load",
            matches: |line, _| MODULE_LOAD.is_match(line),
            rewrite: rewrite_module_load,
        },
        Rule {
            name: "stream out",
            matches: |line, ctx| line.contains(&ctx.tool.stream_out_marker()),
            rewrite: rewrite_stream_out,
        },
        Rule {
            name: "nettran",
            matches: |line, ctx| line.contains(&ctx.tool.nettran_marker()),
            rewrite: rewrite_nettran,
        },
        Rule {
            name: "source",
            matches: |line, _| {
                let line = line.trim_start();
                line.starts_with("source ") && !line.starts_with("source global")
            },
            rewrite: rewrite_source,
        },
        Rule {
            name: "generator",
            matches: |line, ctx| line.contains(&ctx.tool.generator_marker()),
            rewrite: rewrite_generator,
        },
        Rule {
            name: "starrc",
            matches: |line, _| line.contains(STARRC_MARKER),
            rewrite: rewrite_starrc,
        },
        Rule {
            name: "metal stack",
            matches: |line, _| line.trim_start().starts_with(METAL_STACK_MARKER),
            rewrite: rewrite_metal_stack,
        },
        Rule {
            name: "substitute",
            matches: |_, _| true,
            rewrite: |line, ctx, state| Rewrite::Emit(vec![substitute_paths(line, ctx, state)]),
        },
    ]
}

/// Name of the variable holding the version of a loaded module.
pub fn module_version_var(module: &str) -> String {
    let name: String = module
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("MODULE_{name}_VERSION")
}

pub fn export_line(indent: &str, name: &str, value: &str) -> String {
    format!("{indent}export {name}=\"{value}\"")
}

fn indent_of(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Value following `flag` in a (possibly continued) command line.
pub fn flag_value(line: &str, flag: &str) -> Option<String> {
    let mut tokens = line.split_whitespace().filter(|t| *t != "\\");
    tokens.find(|t| *t == flag)?;
    tokens
        .next()
        .map(|v| v.trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|v| !v.is_empty() && !v.starts_with('-'))
}

fn is_token_boundary(c: Option<char>) -> bool {
    match c {
        None => true,
        Some(c) => c.is_whitespace() || matches!(c, '"' | '\'' | '=' | ';' | '\\'),
    }
}

/// Replaces whole-token occurrences of `old` with `new`.
pub fn replace_token(line: &str, old: &str, new: &str) -> String {
    if old.is_empty() {
        return line.to_string();
    }
    let mut out = String::with_capacity(line.len());
    let mut last = 0;
    for (start, _) in line.match_indices(old) {
        if start < last {
            continue;
        }
        let end = start + old.len();
        let before = line[..start].chars().next_back();
        let after = line[end..].chars().next();
        if is_token_boundary(before) && is_token_boundary(after) {
            out.push_str(&line[last..start]);
            out.push_str(new);
            last = end;
        }
    }
    out.push_str(&line[last..]);
    out
}

/// Replaces every literal in `substitutions` in a single left-to-right pass,
/// preferring the longest literal at each position.
pub fn substitute_all(line: &str, substitutions: &[(String, String)]) -> String {
    let mut subs: Vec<&(String, String)> =
        substitutions.iter().filter(|(lit, _)| !lit.is_empty()).collect();
    subs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    'outer: while !rest.is_empty() {
        for (lit, token) in subs.iter() {
            if let Some(tail) = rest.strip_prefix(lit.as_str()) {
                out.push_str(token);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

fn token(name: &str) -> String {
    format!("${{{name}}}")
}

fn rewrite_module_load(line: &str, _: &CaptureContext, _: &mut CaptureState) -> Rewrite {
    let Some(caps) = MODULE_LOAD.captures(line) else {
        return Rewrite::Continue {
            prelude: Vec::new(),
            line: line.to_string(),
        };
    };
    let indent = &caps[1];
    let mut exports = Vec::new();
    let mut modules = Vec::new();
    for module in caps[2].split_whitespace() {
        match module.split_once('/') {
            Some((name, version)) if !version.is_empty() => {
                let var = module_version_var(name);
                exports.push(export_line(indent, &var, version));
                modules.push(format!("{name}/{}", token(&var)));
            }
            _ => modules.push(module.to_string()),
        }
    }
    if exports.is_empty() {
        return Rewrite::Continue {
            prelude: Vec::new(),
            line: line.to_string(),
        };
    }
    exports.push(format!("{indent}module load {}", modules.join(" ")));
    Rewrite::Emit(exports)
}

fn rewrite_stream_out(line: &str, _: &CaptureContext, state: &mut CaptureState) -> Rewrite {
    if let Some(gds) = flag_value(line, "-gds") {
        state.gds_file = Some(gds);
    }
    Rewrite::Emit(vec![String::new()])
}

fn rewrite_nettran(line: &str, _: &CaptureContext, state: &mut CaptureState) -> Rewrite {
    if let Some(netlist) = flag_value(line, "-sp") {
        state.lvs_file = Some(netlist);
    }
    Rewrite::Continue {
        prelude: Vec::new(),
        line: line.to_string(),
    }
}

fn rewrite_source(line: &str, ctx: &CaptureContext, state: &mut CaptureState) -> Rewrite {
    let indent = indent_of(line);
    let mut words = line.trim_start().splitn(3, char::is_whitespace);
    words.next();
    let Some(file) = words.next().filter(|f| !f.is_empty()) else {
        return Rewrite::Continue {
            prelude: Vec::new(),
            line: line.to_string(),
        };
    };
    let rest = words.next().map(|r| format!(" {r}")).unwrap_or_default();
    let value = export_value(file, var::PEX_SOURCE_ME, ctx, state);
    state.source_me_file = Some(file.to_string());
    Rewrite::Emit(vec![
        export_line(indent, var::PEX_SOURCE_ME, &value),
        format!("{indent}source {}{rest}", token(var::PEX_SOURCE_ME)),
    ])
}

/// Value written into the export of variable `name`, with the sample run's
/// literals replaced. The variable never refers to itself.
fn export_value(value: &str, name: &str, ctx: &CaptureContext, state: &CaptureState) -> String {
    let mut state = state.clone();
    match name {
        var::PEX_OPTION_FILE => state.option_file = None,
        var::LAYER_MAP_FILE => state.layer_map_file = None,
        var::PEX_SOURCE_ME => state.source_me_file = None,
        _ => {}
    }
    substitute_paths(value, ctx, &state)
}

fn capture_args(
    line: &str,
    args: &[(&str, &'static str)],
    indent: &str,
    ctx: &CaptureContext,
    state: &CaptureState,
    prelude: &mut Vec<String>,
) -> (String, Vec<(&'static str, String)>) {
    let mut line = line.to_string();
    let mut captured = Vec::new();
    for &(flag, name) in args {
        if let Some(value) = flag_value(&line, flag) {
            prelude.push(export_line(
                indent,
                name,
                &export_value(&value, name, ctx, state),
            ));
            line = replace_token(&line, &value, &token(name));
            captured.push((name, value));
        }
    }
    (line, captured)
}

fn rewrite_generator(line: &str, ctx: &CaptureContext, state: &mut CaptureState) -> Rewrite {
    let indent = indent_of(line);
    let mut prelude = Vec::new();
    let (line, captured) = capture_args(line, GENERATOR_ARGS, indent, ctx, state, &mut prelude);
    for (name, value) in captured {
        match name {
            var::PEX_OPTION_FILE => state.option_file = Some(value),
            var::LAYER_MAP_FILE => state.layer_map_file = Some(value),
            _ => {}
        }
    }
    Rewrite::Continue { prelude, line }
}

fn rewrite_starrc(line: &str, ctx: &CaptureContext, state: &mut CaptureState) -> Rewrite {
    let indent = indent_of(line);
    let mut prelude = Vec::new();
    let (mut line, _) = capture_args(line, STARRC_ARGS, indent, ctx, state, &mut prelude);
    if let Some(output) = flag_value(&line, "-output") {
        if state.output_dir.is_none() {
            prelude.push(export_line(indent, var::OUTPUT_DIR, ""));
        }
        line = replace_token(&line, &output, &token(var::OUTPUT_DIR));
        state.output_dir = Some(output);
    }
    Rewrite::Continue { prelude, line }
}

fn rewrite_metal_stack(line: &str, _: &CaptureContext, _: &mut CaptureState) -> Rewrite {
    let indent = indent_of(line);
    let mut lines = vec![line.to_string()];
    lines.extend(
        var::INSTANCE_PLACEHOLDERS
            .iter()
            .map(|name| export_line(indent, name, "")),
    );
    Rewrite::Emit(lines)
}

/// Replaces the sample run's concrete paths and names with placeholder tokens.
pub fn substitute_paths(line: &str, ctx: &CaptureContext, state: &CaptureState) -> String {
    let mut subs = Vec::new();
    let mut push = |value: Option<&String>, name: &str| {
        if let Some(value) = value {
            subs.push((value.clone(), token(name)));
        }
    };
    push(state.gds_file.as_ref(), var::GDS_FILE);
    push(state.lvs_file.as_ref(), var::LVS_NETLIST);
    push(state.layer_map_file.as_ref(), var::LAYER_MAP_FILE);
    push(state.source_me_file.as_ref(), var::PEX_SOURCE_ME);
    push(state.option_file.as_ref(), var::PEX_OPTION_FILE);
    push(Some(&ctx.run_dir), var::RUN_DIR);
    push(Some(&ctx.sample_cell), var::TOP_CELL_NAME);
    substitute_all(line, &subs)
}
