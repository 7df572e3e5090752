//! `{{ Name }}` substitution for gdb script templates.

use std::collections::BTreeMap;

use crate::{error::GdbError, result::Value};

/// Rendered in place of a placeholder that has no parameter.
pub const MISSING_VALUE: &str = "<no value>";

/// Named template parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Adds every parameter of `other` that is not already set.
    pub fn merge_missing(&mut self, other: Params) {
        for (name, value) in other.0 {
            self.0.entry(name).or_insert(value);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Replaces each `{{ Name }}` in `template` with its parameter.
///
/// Names are identifiers (`[A-Za-z_][A-Za-z0-9_]*`), optionally padded with
/// spaces. An unterminated placeholder or a non-identifier name is an error
/// attributed to `name`; a missing parameter renders as [`MISSING_VALUE`].
pub fn render(name: &str, template: &str, params: &Params) -> Result<String, GdbError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| {
            GdbError::template(name, format!("unterminated placeholder at byte {}", template.len() - rest.len() + open))
        })?;
        let key = after[..close].trim();
        if !is_identifier(key) {
            return Err(GdbError::template(name, format!("invalid placeholder {key:?}")));
        }
        match params.get(key) {
            Some(value) => out.push_str(&value.to_string()),
            None => out.push_str(MISSING_VALUE),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_parameters() {
        let params = Params::new().with("Host", "localhost").with("Port", 3333u32);
        let out = render("t", "target extended-remote {{Host}}:{{ Port }}\n", &params).unwrap();
        assert_eq!(out, "target extended-remote localhost:3333\n");
    }

    #[test]
    fn repeated_and_adjacent_placeholders() {
        let params = Params::new().with("A", "x").with("B", 1u32);
        assert_eq!(render("t", "{{A}}{{B}}{{A}}", &params).unwrap(), "x1x");
    }

    #[test]
    fn missing_parameter_renders_marker() {
        let out = render("t", "call {{Nope}}", &Params::new()).unwrap();
        assert_eq!(out, "call <no value>");
    }

    #[test]
    fn unterminated_placeholder_is_error() {
        let err = render("inject_certs", "x {{Host", &Params::new()).unwrap_err();
        assert!(matches!(err, GdbError::Template { ref template, .. } if template == "inject_certs"));
    }

    #[test]
    fn invalid_name_is_error() {
        assert!(render("t", "{{ .Host }}", &Params::new()).is_err());
        assert!(render("t", "{{}}", &Params::new()).is_err());
        assert!(render("t", "{{1abc}}", &Params::new()).is_err());
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let text = "set pagination off\nprintf \"{ not a placeholder }\\n\"\n";
        assert_eq!(render("t", text, &Params::new()).unwrap(), text);
    }

    #[test]
    fn merge_keeps_existing() {
        let mut params = Params::new().with("Host", "device");
        params.merge_missing(Params::new().with("Host", "localhost").with("Port", 3333u32));
        assert_eq!(params.get("Host"), Some(&Value::from("device")));
        assert_eq!(params.len(), 2);
    }
}
