//! The `Directive` node (spec §3).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One parsed line of a Rockerfile. Immutable once produced by
/// [`crate::parser::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub name: String,
    pub args: Vec<String>,
    pub flags: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, bool>,
    pub original: String,
    pub is_onbuild: bool,
}

impl Directive {
    pub fn new(name: impl Into<String>, args: Vec<String>, original: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args,
            flags: BTreeMap::new(),
            attributes: BTreeMap::new(),
            original: original.into(),
            is_onbuild: false,
        }
    }

    /// The `json` attribute distinguishes exec form (`["a", "b"]`) from shell
    /// form for CMD/ENTRYPOINT/RUN/HEALTHCHECK (spec §4.B).
    pub fn is_json(&self) -> bool {
        self.attributes.get("json").copied().unwrap_or(false)
    }

    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(String::as_str)
    }

    /// Renders this node back to Rockerfile text, used by the parser
    /// round-trip property (spec §8.1).
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.is_onbuild {
            out.push_str("ONBUILD ");
        }
        out.push_str(&self.name);
        for (flag, val) in &self.flags {
            out.push(' ');
            out.push_str("--");
            out.push_str(flag);
            if !val.is_empty() {
                out.push('=');
                out.push_str(val);
            }
        }
        if self.is_json() {
            out.push(' ');
            out.push('[');
            out.push_str(
                &self
                    .args
                    .iter()
                    .map(|a| format!("\"{}\"", a.replace('\\', "\\\\").replace('"', "\\\"")))
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            out.push(']');
        } else {
            for arg in &self.args {
                out.push(' ');
                out.push_str(arg);
            }
        }
        out
    }
}
