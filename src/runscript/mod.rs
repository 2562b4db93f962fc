//! Reusable PEX runscript templates.
//!
//! A sample extraction run leaves behind the shell script it executed. The
//! script names the sample cell, its GDS and netlist files and the sample run
//! directory literally. [`RunscriptTemplate::from_capture`] replaces those with
//! shell variables declared right after the `export METAL_STACK` line, so a
//! template is instantiated for a real cell by assigning variable values only.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::Path;

use crate::error::{EseError, IoResultExt, Result};
use crate::utils::write_file;

pub mod rules;

pub use rules::{module_version_var, CaptureContext, CaptureState};

use rules::{export_line, rules, Rewrite};

/// Template variable names.
pub mod var {
    pub const RUN_DIR: &str = "RUN_DIR";
    pub const TOP_CELL_NAME: &str = "TOP_CELL_NAME";
    pub const GDS_FILE: &str = "GDS_FILE";
    pub const LVS_NETLIST: &str = "LVS_NETLIST";
    pub const OUTPUT_DIR: &str = "OUTPUT_DIR";
    pub const LAYER_MAP_FILE: &str = "LAYER_MAP_FILE";
    pub const PEX_SOURCE_ME: &str = "PEX_SOURCE_ME";
    pub const PEX_DECK: &str = "PEX_DECK";
    pub const PEX_OPTION_FILE: &str = "PEX_OPTION_FILE";
    pub const STREAM_FILE: &str = "STREAM_FILE";
    pub const STARRC_STARCMD: &str = "STARRC_STARCMD";
    pub const STARRC_DECK: &str = "STARRC_DECK";

    /// Placeholders declared right after the metal stack export.
    pub const INSTANCE_PLACEHOLDERS: [&str; 4] = [RUN_DIR, TOP_CELL_NAME, GDS_FILE, LVS_NETLIST];
}

/// A PEX runscript with placeholders in place of cell specific values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunscriptTemplate {
    /// Logical lines; a line continued with a trailing backslash keeps its
    /// continuation lines.
    lines: Vec<String>,
}

/// Variable values assigned when instantiating a [`RunscriptTemplate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateValues {
    values: BTreeMap<String, String>,
}

impl TemplateValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Splits a shell script into logical lines, joining backslash continuations.
pub fn logical_lines(script: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current: Option<String> = None;
    for line in script.lines() {
        let joined = match current.take() {
            Some(mut block) => {
                block.push('\n');
                block.push_str(line);
                block
            }
            None => line.to_string(),
        };
        if line.trim_end().ends_with('\\') {
            current = Some(joined);
        } else {
            lines.push(joined);
        }
    }
    lines.extend(current);
    lines
}

/// Splits `export NAME=value` into its name and unquoted value.
pub fn parse_export(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim_start().strip_prefix("export ")?;
    let (name, value) = rest.split_once('=')?;
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name, value.trim().trim_matches('"')))
}

impl RunscriptTemplate {
    /// Converts a captured sample runscript into a template.
    pub fn from_capture(capture: &str, ctx: &CaptureContext) -> Self {
        let rules = rules();
        let mut state = CaptureState::default();
        let mut out = Vec::new();

        for line in logical_lines(capture) {
            let mut line = line;
            for rule in rules.iter() {
                if !(rule.matches)(&line, ctx) {
                    continue;
                }
                match (rule.rewrite)(&line, ctx, &mut state) {
                    Rewrite::Drop => {
                        log::debug!("dropping line `{line}` ({})", rule.name);
                        break;
                    }
                    Rewrite::Emit(lines) => {
                        out.extend(lines);
                        break;
                    }
                    Rewrite::Continue { prelude, line: next } => {
                        out.extend(prelude);
                        line = next;
                    }
                }
            }
        }

        Self { lines: out }
    }

    pub fn parse(text: &str) -> Self {
        Self {
            lines: logical_lines(text),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self::parse(&fs::read_to_string(path).at(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_file(path, self.to_string())
    }

    #[cfg(test)]
    pub(crate) fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Names of the variables exported by the template, in order of first declaration.
    pub fn declared(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (name, _) in self.lines.iter().filter_map(|l| parse_export(l)) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Assigns `values` to the matching `export` declarations.
    ///
    /// Only declaration values change; every other line is kept verbatim.
    pub fn instantiate(&self, values: &TemplateValues) -> String {
        let lines: Vec<String> = self
            .lines
            .iter()
            .map(|line| match parse_export(line) {
                Some((name, _)) => match values.get(name) {
                    Some(value) => {
                        let indent = &line[..line.len() - line.trim_start().len()];
                        export_line(indent, name, value)
                    }
                    None => line.clone(),
                },
                None => line.clone(),
            })
            .collect();
        let mut script = lines.join("\n");
        script.push('\n');
        script
    }
}

impl Display for RunscriptTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in self.lines.iter() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// Reads a capture, converts it and saves the template at `template_path`.
pub fn convert_capture_file(
    capture_path: impl AsRef<Path>,
    template_path: impl AsRef<Path>,
    ctx: &CaptureContext,
) -> Result<RunscriptTemplate> {
    let capture_path = capture_path.as_ref();
    let capture = fs::read_to_string(capture_path).at(capture_path)?;
    let template = RunscriptTemplate::from_capture(&capture, ctx);
    let declared = template.declared();
    let missing: Vec<String> = var::INSTANCE_PLACEHOLDERS
        .iter()
        .filter(|name| !declared.contains(*name))
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(EseError::IncompleteCapture {
            path: capture_path.to_owned(),
            missing,
        });
    }
    template.save(template_path.as_ref())?;
    log::info!(
        "Converted sample runscript {capture_path:?} into template {:?}",
        template_path.as_ref()
    );
    Ok(template)
}
