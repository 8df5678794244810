//! Built-in template helpers (spec §4.A).
//!
//! Each helper receives its arguments already variable-expanded but still in
//! raw textual form (quotes included where the caller wrote them); helpers
//! that treat an argument as a literal string unquote it first.

use crate::error::{ErrorKind, Result};

use super::TemplateContext;

pub fn call(name: &str, args: &[String], ctx: &TemplateContext) -> Result<String> {
    match name {
        "seq" => seq(args),
        "replace" => replace(args),
        "dump" => dump(args),
        "assert" => assert_helper(args),
        "json" => json(args),
        "yaml" => yaml(args),
        "shell" => shell(args),
        "image" => image(args, ctx),
        "split" => split(args),
        "join" => join(args),
        "toLower" => Ok(unquote(single(args, name)?).to_lowercase()),
        "toUpper" => Ok(unquote(single(args, name)?).to_uppercase()),
        "trim" => Ok(unquote(single(args, name)?).trim().to_string()),
        "trimLeft" => Ok(unquote(single(args, name)?).trim_start().to_string()),
        "trimRight" => Ok(unquote(single(args, name)?).trim_end().to_string()),
        "trimPrefix" => trim_prefix(args),
        "trimSuffix" => trim_suffix(args),
        "hasPrefix" => has_prefix(args),
        "hasSuffix" => has_suffix(args),
        "contains" => contains(args),
        "indexOf" => index_of(args),
        "repeat" => repeat(args),
        "title" => Ok(title_case(&unquote(single(args, name)?))),
        other => Err(ErrorKind::user_input(format!("unknown template helper {other:?}"))),
    }
}

fn single<'a>(args: &'a [String], name: &str) -> Result<&'a str> {
    args.first()
        .map(String::as_str)
        .ok_or_else(|| ErrorKind::user_input(format!("{name} requires one argument")))
}

fn unquote(s: &str) -> String {
    let t = s.trim();
    if t.len() >= 2 && t.starts_with('"') && t.ends_with('"') {
        t[1..t.len() - 1].replace("\\\"", "\"")
    } else {
        t.to_string()
    }
}

fn parse_int(s: &str, what: &str) -> Result<i64> {
    unquote(s)
        .trim()
        .parse::<i64>()
        .map_err(|e| ErrorKind::user_input(format!("{what} is not an integer: {e}")))
}

/// `seq n` → 1..n (1..-n reversed if n<0); `seq from to`; `seq from to step`.
fn seq(args: &[String]) -> Result<String> {
    match args.len() {
        1 => {
            let n = parse_int(&args[0], "seq n")?;
            let nums: Vec<i64> = if n >= 0 {
                (1..=n).collect()
            } else {
                (n..=-1).rev().collect()
            };
            Ok(nums.iter().map(i64::to_string).collect::<Vec<_>>().join(" "))
        }
        2 => {
            let from = parse_int(&args[0], "seq from")?;
            let to = parse_int(&args[1], "seq to")?;
            let nums: Vec<i64> = if from <= to {
                (from..=to).collect()
            } else {
                (to..=from).rev().collect()
            };
            Ok(nums.iter().map(i64::to_string).collect::<Vec<_>>().join(" "))
        }
        3 => {
            let from = parse_int(&args[0], "seq from")?;
            let to = parse_int(&args[1], "seq to")?;
            let step = parse_int(&args[2], "seq step")?;
            if step == 0 {
                return Err(ErrorKind::user_input("seq step must not be 0".to_string()));
            }
            if step < 0 {
                return Err(ErrorKind::user_input("seq step must be > 0".to_string()));
            }
            if from == to {
                return Ok(from.to_string());
            }
            let mut nums = Vec::new();
            if from <= to {
                let mut v = from;
                while v <= to {
                    nums.push(v);
                    v += step;
                }
            } else {
                let mut v = from;
                while v >= to {
                    nums.push(v);
                    v -= step;
                }
            }
            Ok(nums.iter().map(i64::to_string).collect::<Vec<_>>().join(" "))
        }
        _ => Err(ErrorKind::user_input(
            "seq takes 1, 2, or 3 arguments".to_string(),
        )),
    }
}

fn replace(args: &[String]) -> Result<String> {
    if args.len() != 3 {
        return Err(ErrorKind::user_input(
            "replace takes (string, from, to)".to_string(),
        ));
    }
    Ok(unquote(&args[0]).replace(&unquote(&args[1]), &unquote(&args[2])))
}

fn dump(args: &[String]) -> Result<String> {
    let values: Vec<String> = args.iter().map(|a| unquote(a)).collect();
    Ok(format!("{values:?}"))
}

fn assert_helper(args: &[String]) -> Result<String> {
    if args.is_empty() {
        return Err(ErrorKind::user_input("assert requires a condition".to_string()));
    }
    let cond = unquote(&args[0]);
    let truthy = !(cond.is_empty() || cond == "0" || cond.eq_ignore_ascii_case("false"));
    if !truthy {
        let msg = args
            .get(1)
            .map(|m| unquote(m))
            .unwrap_or_else(|| format!("assertion failed: {cond:?}"));
        return Err(ErrorKind::user_input(msg));
    }
    Ok(String::new())
}

fn json(args: &[String]) -> Result<String> {
    let raw = single(args, "json")?;
    let value: serde_json::Value = serde_json::from_str(raw.trim())
        .or_else(|_| serde_json::from_str(&format!("\"{}\"", unquote(raw))))
        .map_err(|e| ErrorKind::user_input(format!("json helper: invalid input: {e}")))?;
    serde_json::to_string(&value).map_err(|e| ErrorKind::user_input(format!("json helper: {e}")))
}

fn yaml(args: &[String]) -> Result<String> {
    let raw = single(args, "yaml")?;
    let value: serde_yaml::Value = serde_yaml::from_str(&unquote(raw))
        .map_err(|e| ErrorKind::user_input(format!("yaml helper: invalid input: {e}")))?;
    let json_value = serde_json::to_value(&value)
        .map_err(|e| ErrorKind::user_input(format!("yaml helper: {e}")))?;
    serde_json::to_string(&json_value).map_err(|e| ErrorKind::user_input(format!("yaml helper: {e}")))
}

/// Shell-safe single-quoted form; multi-line strings use `$'...\n...'`.
fn shell(args: &[String]) -> Result<String> {
    let raw = unquote(single(args, "shell")?);
    if raw.contains('\n') {
        let escaped = raw
            .replace('\\', "\\\\")
            .replace('\'', "\\'")
            .replace('\n', "\\n");
        return Ok(format!("$'{escaped}'"));
    }
    Ok(shell_escape::escape(raw.into()).to_string())
}

/// `image name [tag-or-digest]`: rewrites a reference against previously
/// produced artifacts, with semver wildcard matching on the tag.
fn image(args: &[String], ctx: &TemplateContext) -> Result<String> {
    if args.is_empty() || args.len() > 2 {
        return Err(ErrorKind::user_input(
            "image helper takes (name, [tag-or-digest])".to_string(),
        ));
    }
    let name = unquote(&args[0]);
    let want_tag = args.get(1).map(|a| unquote(a));

    let matched = ctx.artifacts.iter().find(|a| {
        if a.name != name {
            return false;
        }
        match &want_tag {
            None => true,
            Some(w) => tag_matches(&a.tag, w),
        }
    });

    match matched {
        Some(a) => Ok(format!("{}:{}", a.name, a.tag)),
        None if ctx.demand_artifacts => Err(ErrorKind::user_input(format!(
            "image helper: no produced artifact matches {name:?} (tag {want_tag:?})"
        ))),
        None => Ok(match want_tag {
            Some(t) => format!("{name}:{t}"),
            None => name,
        }),
    }
}

fn tag_matches(tag: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return tag == pattern;
    }
    if let (Ok(req), Ok(ver)) = (
        semver::VersionReq::parse(&pattern.replace('*', "x").replace("x", "*")),
        semver::Version::parse(tag),
    ) {
        if req.matches(&ver) {
            return true;
        }
    }
    glob_match(pattern, tag)
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut rest = text;
    for (idx, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if idx == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if idx == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}

fn split(args: &[String]) -> Result<String> {
    if args.len() != 2 {
        return Err(ErrorKind::user_input("split takes (string, sep)".to_string()));
    }
    let parts: Vec<String> = unquote(&args[0])
        .split(&unquote(&args[1]))
        .map(|s| s.to_string())
        .collect();
    serde_json::to_string(&parts).map_err(|e| ErrorKind::user_input(e.to_string()))
}

fn join(args: &[String]) -> Result<String> {
    if args.len() != 2 {
        return Err(ErrorKind::user_input("join takes (list, sep)".to_string()));
    }
    let list: Vec<String> = serde_json::from_str(&unquote(&args[0]))
        .map_err(|e| ErrorKind::user_input(format!("join: first argument must be a JSON array: {e}")))?;
    Ok(list.join(&unquote(&args[1])))
}

fn trim_prefix(args: &[String]) -> Result<String> {
    if args.len() != 2 {
        return Err(ErrorKind::user_input("trimPrefix takes (string, prefix)".to_string()));
    }
    let s = unquote(&args[0]);
    let p = unquote(&args[1]);
    Ok(s.strip_prefix(&p).unwrap_or(&s).to_string())
}

fn trim_suffix(args: &[String]) -> Result<String> {
    if args.len() != 2 {
        return Err(ErrorKind::user_input("trimSuffix takes (string, suffix)".to_string()));
    }
    let s = unquote(&args[0]);
    let p = unquote(&args[1]);
    Ok(s.strip_suffix(&p).unwrap_or(&s).to_string())
}

fn has_prefix(args: &[String]) -> Result<String> {
    if args.len() != 2 {
        return Err(ErrorKind::user_input("hasPrefix takes (string, prefix)".to_string()));
    }
    Ok(unquote(&args[0]).starts_with(&unquote(&args[1])).to_string())
}

fn has_suffix(args: &[String]) -> Result<String> {
    if args.len() != 2 {
        return Err(ErrorKind::user_input("hasSuffix takes (string, suffix)".to_string()));
    }
    Ok(unquote(&args[0]).ends_with(&unquote(&args[1])).to_string())
}

fn contains(args: &[String]) -> Result<String> {
    if args.len() != 2 {
        return Err(ErrorKind::user_input("contains takes (string, substr)".to_string()));
    }
    Ok(unquote(&args[0]).contains(&unquote(&args[1])).to_string())
}

fn index_of(args: &[String]) -> Result<String> {
    if args.len() != 2 {
        return Err(ErrorKind::user_input("indexOf takes (string, substr)".to_string()));
    }
    let s = unquote(&args[0]);
    let sub = unquote(&args[1]);
    Ok(match s.find(&sub) {
        Some(byte_pos) => s[..byte_pos].chars().count().to_string(),
        None => "-1".to_string(),
    })
}

fn repeat(args: &[String]) -> Result<String> {
    if args.len() != 2 {
        return Err(ErrorKind::user_input("repeat takes (string, count)".to_string()));
    }
    let n = parse_int(&args[1], "repeat count")?;
    if n < 0 {
        return Err(ErrorKind::user_input("repeat count must be >= 0".to_string()));
    }
    Ok(unquote(&args[0]).repeat(n as usize))
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_negative() {
        assert_eq!(seq(&["-3".to_string()]).unwrap(), "-1 -2 -3");
    }

    #[test]
    fn seq_step_zero_errors() {
        assert!(seq(&["1".to_string(), "10".to_string(), "0".to_string()]).is_err());
    }

    #[test]
    fn shell_multiline() {
        let out = shell(&["\"a\nb\"".to_string()]).unwrap();
        assert!(out.starts_with("$'"));
    }

    #[test]
    fn title_case_basic() {
        assert_eq!(title_case("hello world"), "Hello World");
    }

    #[test]
    fn image_exact_match() {
        let ctx = TemplateContext {
            artifacts: vec![super::super::ProducedArtifact {
                name: "myapp".to_string(),
                tag: "1.2.3".to_string(),
            }],
            ..Default::default()
        };
        let out = image(&["\"myapp\"".to_string(), "\"1.2.3\"".to_string()], &ctx).unwrap();
        assert_eq!(out, "myapp:1.2.3");
    }

    #[test]
    fn image_no_match_demand_errors() {
        let ctx = TemplateContext {
            demand_artifacts: true,
            ..Default::default()
        };
        assert!(image(&["\"nope\"".to_string()], &ctx).is_err());
    }
}
