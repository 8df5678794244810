//! Directive parser (spec §4.B).
//!
//! Reads preprocessed Rockerfile text line by line, honoring backslash
//! continuation and `#` comments, and dispatches each line to one of a small
//! family of argument parsers based on the directive name.

mod directive;

pub use directive::Directive;

use crate::error::{ErrorKind, Result};

/// Directives whose argument grammar is a single opaque string (the rest of
/// the line, trimmed).
const STRING_FORM: &[&str] = &[
    "FROM", "WORKDIR", "USER", "MAINTAINER", "TAG", "PUSH", "REQUIRE", "INCLUDE",
];

/// Directives whose argument grammar is name/value pairs (`ENV`, `LABEL`,
/// `ARG`, `VAR`).
const NAME_VALUE_FORM: &[&str] = &["ENV", "LABEL", "ARG", "VAR"];

/// Directives that accept either exec-JSON form or shell form.
const MAYBE_JSON_FORM: &[&str] = &["RUN", "CMD", "ENTRYPOINT"];

/// Directives that accept either exec-JSON-to-list form or whitespace args.
const MAYBE_JSON_LIST_FORM: &[&str] = &["EXPOSE", "VOLUME"];

/// Directives whose argument grammar is whitespace-delimited strings.
const WHITESPACE_FORM: &[&str] = &["COPY", "ADD", "MOUNT", "EXPORT", "IMPORT", "ATTACH"];

const KNOWN_DIRECTIVES: &[&str] = &[
    "FROM",
    "RUN",
    "CMD",
    "ENTRYPOINT",
    "ENV",
    "LABEL",
    "WORKDIR",
    "USER",
    "EXPOSE",
    "VOLUME",
    "MAINTAINER",
    "HEALTHCHECK",
    "ARG",
    "COPY",
    "ADD",
    "TAG",
    "PUSH",
    "MOUNT",
    "ATTACH",
    "EXPORT",
    "IMPORT",
    "REQUIRE",
    "INCLUDE",
    "VAR",
    "ONBUILD",
];

/// Parses preprocessed Rockerfile text into a sequence of [`Directive`]s.
pub fn parse(text: &str) -> Result<Vec<Directive>> {
    let mut directives = Vec::new();
    for logical_line in join_continuations(text) {
        let trimmed = logical_line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        directives.push(parse_line(trimmed)?);
    }
    Ok(directives)
}

/// Joins backslash-continued physical lines into logical lines, stripping
/// full-line comments before continuation joining so that a comment cannot
/// swallow a continuation marker on the line above it.
fn join_continuations(text: &str) -> Vec<String> {
    let mut logical = Vec::new();
    let mut current = String::new();
    for raw_line in text.lines() {
        let line = raw_line.trim_end();
        if line.trim_start().starts_with('#') {
            if !current.is_empty() {
                logical.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped);
            current.push(' ');
        } else {
            current.push_str(line);
            logical.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        logical.push(current);
    }
    logical
}

fn parse_line(line: &str) -> Result<Directive> {
    let original = line.to_string();

    let (is_onbuild, rest) = if let Some(rest) = line.strip_prefix("ONBUILD") {
        (true, rest.trim_start())
    } else {
        (false, line)
    };

    let mut tokens = tokenize(rest);
    if tokens.is_empty() {
        return Err(ErrorKind::user_input(format!(
            "empty directive line: {original:?}"
        )));
    }
    let name = tokens.remove(0).to_uppercase();

    if !KNOWN_DIRECTIVES.contains(&name.as_str()) {
        return Err(ErrorKind::user_input(format!(
            "unknown directive {name:?} in line: {original:?}"
        )));
    }

    if is_onbuild && matches!(name.as_str(), "FROM" | "MAINTAINER" | "ONBUILD") {
        return Err(ErrorKind::user_input(format!(
            "ONBUILD may not be used with {name} (line: {original:?})"
        )));
    }

    let mut flags = std::collections::BTreeMap::new();
    let mut remaining = Vec::new();
    for tok in tokens {
        if let Some(flag) = tok.strip_prefix("--") {
            match flag.split_once('=') {
                Some((k, v)) => {
                    flags.insert(k.to_string(), v.to_string());
                }
                None => {
                    flags.insert(flag.to_string(), String::new());
                }
            }
        } else {
            remaining.push(tok);
        }
    }

    let mut directive = Directive::new(name.clone(), Vec::new(), original.clone());
    directive.flags = flags;
    directive.is_onbuild = is_onbuild;

    if name == "ONBUILD" {
        // sub-command form: the remainder is itself a directive
        return Err(ErrorKind::user_input(
            "ONBUILD must prefix another directive, not appear bare".to_string(),
        ));
    }

    let joined = remaining.join(" ");

    if STRING_FORM.contains(&name.as_str()) {
        if joined.trim().is_empty() {
            return Err(ErrorKind::user_input(format!(
                "{name} requires a single argument (line: {original:?})"
            )));
        }
        directive.args = vec![joined.trim().to_string()];
    } else if NAME_VALUE_FORM.contains(&name.as_str()) {
        directive.args = parse_name_value_args(&remaining, &name, &original)?;
    } else if MAYBE_JSON_FORM.contains(&name.as_str()) {
        let (args, is_json) = parse_maybe_json(&joined)?;
        directive.args = args;
        directive.attributes.insert("json".to_string(), is_json);
    } else if MAYBE_JSON_LIST_FORM.contains(&name.as_str()) {
        let (args, is_json) = parse_maybe_json(&joined)?;
        directive.args = args;
        directive.attributes.insert("json".to_string(), is_json);
    } else if WHITESPACE_FORM.contains(&name.as_str()) {
        if remaining.is_empty() {
            return Err(ErrorKind::user_input(format!(
                "{name} requires at least one argument (line: {original:?})"
            )));
        }
        directive.args = remaining;
    } else if name == "HEALTHCHECK" {
        directive.args = parse_healthcheck(&remaining, &mut directive.flags, &original)?;
    } else {
        return Err(ErrorKind::user_input(format!(
            "no argument grammar registered for directive {name}"
        )));
    }

    Ok(directive)
}

/// Splits a line into whitespace-delimited tokens, respecting double-quoted
/// substrings (used for JSON-ish exec-form arrays and quoted strings).
fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = s.chars().peekable();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut bracket_depth: i32 = 0;

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '\\' if in_quotes => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '[' if !in_quotes => {
                bracket_depth += 1;
                current.push(c);
            }
            ']' if !in_quotes => {
                bracket_depth -= 1;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes && bracket_depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn parse_name_value_args(tokens: &[String], name: &str, original: &str) -> Result<Vec<String>> {
    // ENV/LABEL/ARG/VAR accept either "KEY=VALUE ..." pairs (one token each)
    // or the legacy "KEY VALUE" two-token form for a single pair.
    if tokens.iter().all(|t| t.contains('=')) && !tokens.is_empty() {
        let mut out = Vec::new();
        for t in tokens {
            let (k, v) = t.split_once('=').unwrap();
            out.push(k.to_string());
            out.push(unquote(v));
        }
        Ok(out)
    } else if tokens.len() == 2 {
        Ok(vec![tokens[0].clone(), unquote(&tokens[1])])
    } else if tokens.len() == 1 && name == "ARG" {
        Ok(vec![tokens[0].clone(), String::new()])
    } else {
        Err(ErrorKind::user_input(format!(
            "{name} requires an even number of key/value tokens (line: {original:?})"
        )))
    }
}

fn unquote(s: &str) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\\\"", "\"")
    } else {
        s.to_string()
    }
}

/// Parses either JSON exec form (`["a", "b"]`) or plain shell-form tokens,
/// returning the args and whether JSON form was used.
fn parse_maybe_json(joined: &str) -> Result<(Vec<String>, bool)> {
    let trimmed = joined.trim();
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        let inner = &trimmed[1..trimmed.len() - 1];
        let args: std::result::Result<Vec<String>, _> = serde_json::from_str(&format!("[{inner}]"));
        match args {
            Ok(args) => Ok((args, true)),
            Err(e) => Err(ErrorKind::user_input(format!(
                "invalid JSON exec form {trimmed:?}: {e}"
            ))),
        }
    } else if trimmed.is_empty() {
        Ok((Vec::new(), false))
    } else {
        Ok((
            trimmed.split_whitespace().map(str::to_string).collect(),
            false,
        ))
    }
}

/// HEALTHCHECK's grammar: flags (`--interval`, `--timeout`, `--retries`)
/// precede either the sentinel `NONE` or a `CMD ...`/shell-form sub-command.
fn parse_healthcheck(
    tokens: &[String],
    flags: &mut std::collections::BTreeMap<String, String>,
    original: &str,
) -> Result<Vec<String>> {
    if tokens.is_empty() {
        return Err(ErrorKind::user_input(format!(
            "HEALTHCHECK requires NONE or CMD ... (line: {original:?})"
        )));
    }
    if tokens[0] == "NONE" {
        flags.insert("none".to_string(), "true".to_string());
        return Ok(vec!["NONE".to_string()]);
    }
    if tokens[0] == "CMD" {
        let rest = tokens[1..].join(" ");
        let (args, is_json) = parse_maybe_json(&rest)?;
        flags.insert(
            "json".to_string(),
            if is_json { "true".to_string() } else { String::new() },
        );
        return Ok(args);
    }
    Err(ErrorKind::user_input(format!(
        "HEALTHCHECK sub-command must be NONE or CMD (line: {original:?})"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_from() {
        let d = parse("FROM alpine:3.19").unwrap();
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].name, "FROM");
        assert_eq!(d[0].args, vec!["alpine:3.19".to_string()]);
    }

    #[test]
    fn parses_continuation_and_comments() {
        let text = "FROM alpine\n# a comment\nRUN echo a \\\n    && echo b\n";
        let d = parse(text).unwrap();
        assert_eq!(d.len(), 2);
        assert_eq!(d[1].name, "RUN");
        assert!(d[1].original.contains("echo a"));
        assert!(d[1].original.contains("echo b"));
    }

    #[test]
    fn run_shell_vs_exec() {
        let d = parse("RUN echo hi").unwrap();
        assert!(!d[0].is_json());
        assert_eq!(d[0].args, vec!["echo", "hi"]);

        let d = parse(r#"RUN ["echo", "hi"]"#).unwrap();
        assert!(d[0].is_json());
        assert_eq!(d[0].args, vec!["echo", "hi"]);
    }

    #[test]
    fn env_multi_pair() {
        let d = parse("ENV a=1 b=2").unwrap();
        assert_eq!(d[0].args, vec!["a", "1", "b", "2"]);
    }

    #[test]
    fn env_odd_count_legacy_pair_ok() {
        let d = parse("ENV a 1").unwrap();
        assert_eq!(d[0].args, vec!["a", "1"]);
    }

    #[test]
    fn unknown_directive_errors() {
        assert!(parse("BOGUS xyz").is_err());
    }

    #[test]
    fn onbuild_of_from_rejected() {
        assert!(parse("ONBUILD FROM alpine").is_err());
    }

    #[test]
    fn onbuild_wraps_run() {
        let d = parse("ONBUILD RUN echo hi").unwrap();
        assert!(d[0].is_onbuild);
        assert_eq!(d[0].name, "RUN");
    }

    #[test]
    fn healthcheck_none() {
        let d = parse("HEALTHCHECK NONE").unwrap();
        assert_eq!(d[0].args, vec!["NONE".to_string()]);
        assert_eq!(d[0].flag("none"), Some("true"));
    }

    #[test]
    fn healthcheck_cmd_with_flags() {
        let d = parse("HEALTHCHECK --interval=5s --retries=3 CMD curl -f http://localhost/").unwrap();
        assert_eq!(d[0].flag("interval"), Some("5s"));
        assert_eq!(d[0].flag("retries"), Some("3"));
        assert_eq!(d[0].args, vec!["curl", "-f", "http://localhost/"]);
    }

    #[test]
    fn roundtrip_shell_form() {
        let parsed = parse("ENV a=1 b=2\nRUN echo hi\nTAG mytag").unwrap();
        for d in parsed {
            let rendered = d.render();
            let reparsed = parse(&rendered).unwrap();
            assert_eq!(reparsed.len(), 1);
            assert_eq!(reparsed[0].name, d.name);
            assert_eq!(reparsed[0].args, d.args);
        }
    }
}
