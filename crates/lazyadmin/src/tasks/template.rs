//! Summary template rendering.
//!
//! Minimal handlebars-ish dialect over a JSON context:
//!
//! - `{{a.b.c}}` substitution with dot-path field access
//! - `{{#if a.b}} ... {{else}} ... {{/if}}`
//! - `{{#each a.b}} ... {{/each}}` over maps, binding `{{@key}}` and
//!   `{{this}}` / `{{this.field}}` inside the body
//!
//! Map iteration order is key-sorted, so rendering is deterministic.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed {0} tag")]
    Unclosed(&'static str),
    #[error("unexpected {0:?}")]
    Unexpected(String),
    #[error("unknown block helper {0:?}")]
    UnknownHelper(String),
}

#[derive(Debug)]
enum Node {
    Text(String),
    Var(String),
    If {
        path: String,
        then_body: Vec<Node>,
        else_body: Vec<Node>,
    },
    Each {
        path: String,
        body: Vec<Node>,
    },
}

/// Render `template` against `data`.
pub fn render(template: &str, data: &serde_json::Value) -> Result<String, TemplateError> {
    let tokens = tokenize(template)?;
    let mut iter = tokens.into_iter().peekable();
    let nodes = parse_nodes(&mut iter, None)?;
    if let Some(tok) = iter.next() {
        return Err(TemplateError::Unexpected(tok.describe()));
    }

    let mut out = String::with_capacity(template.len());
    render_nodes(&nodes, data, None, &mut out);
    Ok(out)
}

#[derive(Debug)]
enum Token {
    Text(String),
    Var(String),
    OpenIf(String),
    Else,
    CloseIf,
    OpenEach(String),
    CloseEach,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Text(_) => "text".to_string(),
            Token::Var(p) => format!("{{{{{p}}}}}"),
            Token::OpenIf(_) => "{{#if}}".to_string(),
            Token::Else => "{{else}}".to_string(),
            Token::CloseIf => "{{/if}}".to_string(),
            Token::OpenEach(_) => "{{#each}}".to_string(),
            Token::CloseEach => "{{/each}}".to_string(),
        }
    }
}

fn tokenize(template: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            tokens.push(Token::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(TemplateError::Unclosed("{{"))?;
        let tag = after[..end].trim();

        let token = if let Some(path) = tag.strip_prefix("#if") {
            Token::OpenIf(path.trim().to_string())
        } else if let Some(path) = tag.strip_prefix("#each") {
            Token::OpenEach(path.trim().to_string())
        } else if tag == "else" {
            Token::Else
        } else if tag == "/if" {
            Token::CloseIf
        } else if tag == "/each" {
            Token::CloseEach
        } else if let Some(helper) = tag.strip_prefix('#') {
            return Err(TemplateError::UnknownHelper(helper.to_string()));
        } else {
            Token::Var(tag.to_string())
        };
        tokens.push(token);
        rest = &after[end + 2..];
    }

    if !rest.is_empty() {
        tokens.push(Token::Text(rest.to_string()));
    }
    Ok(tokens)
}

/// Parse a node list until the closing token `until` (None at top level).
fn parse_nodes(
    iter: &mut std::iter::Peekable<std::vec::IntoIter<Token>>,
    until: Option<&str>,
) -> Result<Vec<Node>, TemplateError> {
    let mut nodes = Vec::new();

    while let Some(tok) = iter.peek() {
        match (tok, until) {
            (Token::CloseIf, Some("if")) | (Token::CloseEach, Some("each")) => {
                iter.next();
                return Ok(nodes);
            }
            (Token::Else, Some("if")) => return Ok(nodes),
            (Token::CloseIf | Token::CloseEach | Token::Else, _) => {
                return Err(TemplateError::Unexpected(tok.describe()));
            }
            _ => {}
        }

        let Some(tok) = iter.next() else { break };
        match tok {
            Token::Text(text) => nodes.push(Node::Text(text)),
            Token::Var(path) => nodes.push(Node::Var(path)),
            Token::OpenIf(path) => {
                let then_body = parse_nodes(iter, Some("if"))?;
                let else_body = if matches!(iter.peek(), Some(Token::Else)) {
                    iter.next();
                    parse_nodes(iter, Some("if"))?
                } else {
                    Vec::new()
                };
                nodes.push(Node::If {
                    path,
                    then_body,
                    else_body,
                });
            }
            Token::OpenEach(path) => {
                let body = parse_nodes(iter, Some("each"))?;
                nodes.push(Node::Each { path, body });
            }
            // Close tags are handled on the peek above.
            Token::Else | Token::CloseIf | Token::CloseEach => break,
        }
    }

    match until {
        Some("if") => Err(TemplateError::Unclosed("{{#if}}")),
        Some("each") => Err(TemplateError::Unclosed("{{#each}}")),
        _ => Ok(nodes),
    }
}

/// The innermost `each` scope: current key and value.
struct Scope<'a> {
    key: &'a str,
    value: &'a serde_json::Value,
}

fn render_nodes(
    nodes: &[Node],
    root: &serde_json::Value,
    scope: Option<&Scope<'_>>,
    out: &mut String,
) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var(path) => {
                if let Some(text) = resolve_text(root, scope, path) {
                    out.push_str(&text);
                }
            }
            Node::If {
                path,
                then_body,
                else_body,
            } => {
                let truthy = if path == "@key" {
                    scope.map(|s| !s.key.is_empty()).unwrap_or(false)
                } else {
                    resolve_value(root, scope, path)
                        .map(is_truthy)
                        .unwrap_or(false)
                };
                let body = if truthy { then_body } else { else_body };
                render_nodes(body, root, scope, out);
            }
            Node::Each { path, body } => {
                let Some(serde_json::Value::Object(map)) = resolve_value(root, scope, path) else {
                    continue;
                };
                for (key, value) in map {
                    let inner = Scope {
                        key: key.as_str(),
                        value,
                    };
                    render_nodes(body, root, Some(&inner), out);
                }
            }
        }
    }
}

fn resolve_text(
    root: &serde_json::Value,
    scope: Option<&Scope<'_>>,
    path: &str,
) -> Option<String> {
    if path == "@key" {
        return scope.map(|s| s.key.to_string());
    }
    resolve_value(root, scope, path).map(value_text)
}

/// Resolve a dot path. `this`/`this.x` resolve against the innermost `each`
/// value; anything else resolves against the root context.
fn resolve_value<'a>(
    root: &'a serde_json::Value,
    scope: Option<&Scope<'a>>,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let (mut current, rest) = if path == "this" {
        return scope.map(|s| s.value);
    } else if let Some(rest) = path.strip_prefix("this.") {
        (scope.map(|s| s.value)?, rest)
    } else {
        (root, path)
    };

    for part in rest.split('.').filter(|p| !p.is_empty()) {
        current = current.get(part)?;
    }
    Some(current)
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> serde_json::Value {
        json!({
            "Task": {"ID": "restart", "Label": "Restart backend", "RiskLevel": "high"},
            "Success": false,
            "Steps": {
                "stop": {"OK": true, "Output": "HTTP 200 OK", "Error": ""},
                "wait": {"OK": false, "Output": "", "Error": "cancelled"},
            },
        })
    }

    #[test]
    fn test_substitution_and_field_access() {
        let out = render("task {{Task.ID}} ({{Task.RiskLevel}})", &ctx()).unwrap();
        assert_eq!(out, "task restart (high)");
    }

    #[test]
    fn test_missing_path_renders_empty() {
        let out = render("[{{Task.Nope}}]", &ctx()).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn test_if_else() {
        let out = render("{{#if Success}}done{{else}}failed{{/if}}", &ctx()).unwrap();
        assert_eq!(out, "failed");

        let out = render("{{#if Task.Label}}labelled{{/if}}", &ctx()).unwrap();
        assert_eq!(out, "labelled");
    }

    #[test]
    fn test_each_binds_key_and_value() {
        let out = render(
            "{{#each Steps}}{{@key}}={{#if this.OK}}ok{{else}}{{this.Error}}{{/if}};{{/each}}",
            &ctx(),
        )
        .unwrap();
        // Map iteration is key-sorted.
        assert_eq!(out, "stop=ok;wait=cancelled;");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            render("{{#if Success}}never closed", &ctx()).unwrap_err(),
            TemplateError::Unclosed("{{#if}}")
        );
        assert_eq!(
            render("{{Task.ID", &ctx()).unwrap_err(),
            TemplateError::Unclosed("{{")
        );
        assert!(matches!(
            render("{{/each}}", &ctx()).unwrap_err(),
            TemplateError::Unexpected(_)
        ));
        assert!(matches!(
            render("{{#with Steps}}{{/with}}", &ctx()).unwrap_err(),
            TemplateError::UnknownHelper(_)
        ));
    }
}
