//! Template rendering
//!
//! Placeholders have the form `{{ name }}` or `{{ a.b.c }}` and resolve
//! against a node's merged variables. Rendering is strict: an undefined
//! variable or an unterminated placeholder is an error, never an empty
//! string.

use keel_core::domain::Vars;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("placeholder pattern"));

static VARIABLE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)*$").expect("variable path pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("undefined variable '{0}'")]
    Undefined(String),

    #[error("malformed placeholder '{0}'")]
    Malformed(String),
}

/// Renders template text with variables
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, vars: &Vars) -> Result<String, TemplateError>;
}

/// `{{ var }}` renderer
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderRenderer;

impl TemplateRenderer for PlaceholderRenderer {
    fn render(&self, template: &str, vars: &Vars) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(template) {
            let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            check_literal(&template[last..whole.start()])?;
            out.push_str(&template[last..whole.start()]);

            let path = inner.as_str().trim();
            if !VARIABLE_PATH.is_match(path) {
                return Err(TemplateError::Malformed(whole.as_str().to_string()));
            }

            let value =
                lookup(vars, path).ok_or_else(|| TemplateError::Undefined(path.to_string()))?;
            out.push_str(&to_text(value));
            last = whole.end();
        }

        check_literal(&template[last..])?;
        out.push_str(&template[last..]);
        Ok(out)
    }
}

/// Literal text may not contain an opening brace pair without its close
fn check_literal(text: &str) -> Result<(), TemplateError> {
    match text.find("{{") {
        Some(pos) => {
            let snippet: String = text[pos..].chars().take(24).collect();
            Err(TemplateError::Malformed(snippet))
        }
        None => Ok(()),
    }
}

fn lookup<'a>(vars: &'a Vars, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = vars.get(parts.next()?)?;

    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => {
            // Lua numbers arrive as floats; keep whole numbers integral
            match n.as_f64() {
                Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => {
                    format!("{}", f as i64)
                }
                _ => n.to_string(),
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Vars {
        [
            ("greeting".to_string(), json!("hello")),
            ("port".to_string(), json!(8080)),
            ("ratio".to_string(), json!(2.0)),
            (
                "backend".to_string(),
                json!({ "servers": ["web1", "web2"], "check": true }),
            ),
        ]
        .into()
    }

    fn render(template: &str) -> Result<String, TemplateError> {
        PlaceholderRenderer.render(template, &vars())
    }

    #[test]
    fn test_renders_scalars_and_paths() {
        assert_eq!(render("<h1>{{ greeting }}</h1>").unwrap(), "<h1>hello</h1>");
        assert_eq!(render("listen {{port}};").unwrap(), "listen 8080;");
        assert_eq!(render("x{{ ratio }}").unwrap(), "x2");
        assert_eq!(
            render("{{ backend.servers.1 }} {{ backend.check }}").unwrap(),
            "web2 true"
        );
        assert_eq!(render("no placeholders").unwrap(), "no placeholders");
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        assert_eq!(
            render("{{ missing }}").unwrap_err(),
            TemplateError::Undefined("missing".into())
        );
        assert_eq!(
            render("{{ backend.weight }}").unwrap_err(),
            TemplateError::Undefined("backend.weight".into())
        );
    }

    #[test]
    fn test_malformed_placeholders() {
        assert!(matches!(
            render("{{ greeting | upper }}"),
            Err(TemplateError::Malformed(_))
        ));
        assert!(matches!(render("{{ }}"), Err(TemplateError::Malformed(_))));
        assert!(matches!(
            render("ok {{ greeting }} then {{ broken"),
            Err(TemplateError::Malformed(_))
        ));
    }
}
