//! Template preprocessor (spec §4.A).
//!
//! Runs over raw Rockerfile text before the directive parser ever sees it:
//! resolves `${VAR}`/`$VAR` interpolation, `@file` content reads, and helper
//! calls (`seq`, `replace`, `dump`, `assert`, `json`, `yaml`, `shell`,
//! `image`, plus the string primitives) of the form `$helper(arg, arg, ...)`.

pub mod helpers;

use std::collections::BTreeMap;

use crate::error::{ErrorKind, Result};

/// A previously produced build artifact, consulted by the `image` helper.
#[derive(Debug, Clone)]
pub struct ProducedArtifact {
    pub name: String,
    pub tag: String,
}

/// Preprocessor context: variable bindings, produced artifacts for the
/// `image` helper, and whether unresolved `image` references should fail
/// ("demand artifacts" mode, spec §4.A).
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub vars: BTreeMap<String, String>,
    pub artifacts: Vec<ProducedArtifact>,
    pub demand_artifacts: bool,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

/// Runs the full preprocessing pass over `text`, returning the expanded
/// Rockerfile text ready for [`crate::parser::parse`].
pub fn expand(text: &str, ctx: &TemplateContext) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' if i + 1 < chars.len() && (chars[i + 1] == '$' || chars[i + 1] == '@') => {
                out.push(chars[i + 1]);
                i += 2;
            }
            '$' => {
                let (expanded, consumed) = expand_dollar(&chars, i, ctx)?;
                out.push_str(&expanded);
                i += consumed;
            }
            '@' => {
                let (expanded, consumed) = expand_at(&chars, i)?;
                out.push_str(&expanded);
                i += consumed;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Expands `@file` to the contents of `file`; `i` points at `@`.
fn expand_at(chars: &[char], i: usize) -> Result<(String, usize)> {
    let mut j = i + 1;
    while j < chars.len() && is_path_char(chars[j]) {
        j += 1;
    }
    if j == i + 1 {
        return Ok(("@".to_string(), 1));
    }
    let path: String = chars[i + 1..j].iter().collect();
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| ErrorKind::io(format!("reading @{path}: {e}")))?;
    Ok((contents, j - i))
}

fn is_path_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')
}

/// Expands `$VAR`, `${VAR}`, or `$helper(args)`; `i` points at `$`.
fn expand_dollar(chars: &[char], i: usize, ctx: &TemplateContext) -> Result<(String, usize)> {
    if i + 1 >= chars.len() {
        return Ok(("$".to_string(), 1));
    }
    if chars[i + 1] == '{' {
        let end = chars[i + 2..]
            .iter()
            .position(|&c| c == '}')
            .map(|p| i + 2 + p)
            .ok_or_else(|| ErrorKind::user_input(format!("unterminated \"${{\" at offset {i}")))?;
        let name: String = chars[i + 2..end].iter().collect();
        let value = lookup_var(&name, ctx)?;
        return Ok((value, end + 1 - i));
    }

    let mut j = i + 1;
    while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
        j += 1;
    }
    if j == i + 1 {
        return Ok(("$".to_string(), 1));
    }
    let name: String = chars[i + 1..j].iter().collect();

    // `$helper(args...)` form: identifier immediately followed by `(`.
    if j < chars.len() && chars[j] == '(' {
        let close = find_matching_paren(chars, j)
            .ok_or_else(|| ErrorKind::user_input(format!("unterminated helper call ${name}(...)")))?;
        let raw_args: String = chars[j + 1..close].iter().collect();
        let args = split_args(&raw_args);
        let mut resolved_args = Vec::with_capacity(args.len());
        for a in args {
            resolved_args.push(expand(a.trim(), ctx)?);
        }
        let value = helpers::call(&name, &resolved_args, ctx)?;
        return Ok((value, close + 1 - i));
    }

    let value = lookup_var(&name, ctx)?;
    Ok((value, j - i))
}

fn lookup_var(name: &str, ctx: &TemplateContext) -> Result<String> {
    ctx.vars
        .get(name)
        .cloned()
        .ok_or_else(|| ErrorKind::user_input(format!("undefined variable {name:?}")))
}

fn find_matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_quotes = false;
    for (k, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => {
                depth -= 1;
                if depth == 0 {
                    return Some(k);
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits `a, "b, c", d` into top-level comma-separated args, respecting
/// quoted strings and nested parens.
fn split_args(raw: &str) -> Vec<&str> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut start = 0usize;
    let bytes: Vec<char> = raw.chars().collect();
    let mut char_idx_to_byte = Vec::with_capacity(bytes.len() + 1);
    {
        let mut bi = 0;
        for c in raw.chars() {
            char_idx_to_byte.push(bi);
            bi += c.len_utf8();
        }
        char_idx_to_byte.push(bi);
    }
    for (idx, &c) in bytes.iter().enumerate() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => depth -= 1,
            ',' if !in_quotes && depth == 0 => {
                args.push(&raw[char_idx_to_byte[start]..char_idx_to_byte[idx]]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    args.push(&raw[char_idx_to_byte[start]..char_idx_to_byte[bytes.len()]]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_var_interpolation() {
        let ctx = TemplateContext::new().with_var("TAG", "v1.2.3");
        let out = expand("FROM alpine:${TAG}", &ctx).unwrap();
        assert_eq!(out, "FROM alpine:v1.2.3");
    }

    #[test]
    fn bare_dollar_var() {
        let ctx = TemplateContext::new().with_var("X", "hi");
        let out = expand("echo $X there", &ctx).unwrap();
        assert_eq!(out, "echo hi there");
    }

    #[test]
    fn escaped_dollar_and_at() {
        let ctx = TemplateContext::new();
        let out = expand(r"price: \$5 handle: \@name", &ctx).unwrap();
        assert_eq!(out, "price: $5 handle: @name");
    }

    #[test]
    fn undefined_var_errors() {
        let ctx = TemplateContext::new();
        assert!(expand("${NOPE}", &ctx).is_err());
    }

    #[test]
    fn seq_helper() {
        let ctx = TemplateContext::new();
        let out = expand("$seq(1, 3)", &ctx).unwrap();
        assert_eq!(out, "1 2 3");
    }

    #[test]
    fn nested_helper_args() {
        let ctx = TemplateContext::new().with_var("N", "2");
        let out = expand("$seq(1, ${N})", &ctx).unwrap();
        assert_eq!(out, "1 2");
    }

    #[test]
    fn to_upper_helper() {
        let ctx = TemplateContext::new();
        let out = expand(r#"$toUpper("abc")"#, &ctx).unwrap();
        assert_eq!(out, "ABC");
    }
}
