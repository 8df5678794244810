//! Rockerfile source loading (spec §4.A, §6 grammar): resolves `INCLUDE`
//! and `VAR` ahead of template expansion, since both affect what later text
//! in the same file sees, then runs the template preprocessor and the
//! directive parser in sequence.

use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, Result};
use crate::parser::{self, Directive};
use crate::template::{self, TemplateContext};

const MAX_INCLUDE_DEPTH: usize = 16;

/// Reads `path`, inlines `INCLUDE`s, resolves `VAR`s against `cli_vars` (CLI
/// `--var` bindings take precedence, mirroring `ARG`'s CLI-override rule),
/// expands the template language, and parses the result.
pub fn load_directives(path: &Path, cli_vars: &[(String, String)]) -> Result<Vec<Directive>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ErrorKind::io(format!("reading {}: {e}", path.display())))?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

    let inlined = inline_includes(&raw, &base_dir, 0)?;
    let (stripped, ctx) = strip_and_collect_vars(&inlined, cli_vars)?;
    let expanded = template::expand(&stripped, &ctx)?;
    parser::parse(&expanded)
}

fn inline_includes(text: &str, base_dir: &Path, depth: usize) -> Result<String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(ErrorKind::user_input("INCLUDE nesting too deep (possible cycle)".to_string()));
    }
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("INCLUDE ") {
            let included_path = base_dir.join(rest.trim());
            let included_raw = std::fs::read_to_string(&included_path)
                .map_err(|e| ErrorKind::io(format!("INCLUDE {}: {e}", included_path.display())))?;
            let included_base = included_path.parent().map(Path::to_path_buf).unwrap_or_else(|| base_dir.to_path_buf());
            out.push_str(&inline_includes(&included_raw, &included_base, depth + 1)?);
            out.push('\n');
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    Ok(out)
}

/// Consumes top-level `VAR k=v` lines in file order, template-expanding each
/// value against the context accumulated so far, and returns the
/// `VAR`-stripped text alongside the resulting [`TemplateContext`]. CLI
/// `--var` bindings are seeded first and are never overridden by an
/// in-file `VAR` of the same name.
fn strip_and_collect_vars(text: &str, cli_vars: &[(String, String)]) -> Result<(String, TemplateContext)> {
    let mut ctx = TemplateContext::new();
    for (k, v) in cli_vars {
        ctx.vars.insert(k.clone(), v.clone());
    }

    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("VAR ") {
            let (name, raw_value) = rest
                .split_once('=')
                .ok_or_else(|| ErrorKind::user_input(format!("VAR requires key=value, got {rest:?}")))?;
            let name = name.trim().to_string();
            if !ctx.vars.contains_key(&name) {
                let value = template::expand(raw_value.trim(), &ctx)?;
                ctx.vars.insert(name, value);
            }
            out.push('\n');
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    Ok((out, ctx))
}
