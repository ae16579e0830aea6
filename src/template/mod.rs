//! Template evaluation for `${...}` expressions.
//!
//! Workflow fields may embed expressions in `${...}` markers. A string that
//! consists of exactly one marker yields the evaluated value unchanged
//! (structured values included); markers embedded in a larger string
//! stringify scalars, and a structured value there is an error.
//!
//! Condition strings (`when`, the conditional node's `condition`) may mix
//! markers with surrounding expression text, e.g. `"${inputs.x} > 0"`; they
//! compile to a single expression with each marker parenthesized.

mod eval;
mod expr;

pub use eval::{eval, truthy, Environment};
pub use expr::{parse_expr, path_to_string, Expr, PathSeg};

use serde_json::Value;

use crate::error::TemplateError;

#[derive(Debug, PartialEq)]
enum Segment {
    Literal(String),
    Template(String),
}

/// Whether a string contains a `${...}` marker.
pub fn contains_template(s: &str) -> bool {
    s.contains("${")
}

/// Split a string into literal and `${...}` segments.
///
/// Braces inside quoted string literals do not terminate a marker.
fn split_segments(s: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = s.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c == '$' && chars.peek().map(|(_, n)| *n) == Some('{') {
            chars.next();
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            let mut inner = String::new();
            let mut quote: Option<char> = None;
            let mut closed = false;
            for (_, ch) in chars.by_ref() {
                match quote {
                    Some(q) => {
                        if ch == q {
                            quote = None;
                        }
                        inner.push(ch);
                    }
                    None => {
                        if ch == '}' {
                            closed = true;
                            break;
                        }
                        if ch == '\'' || ch == '"' {
                            quote = Some(ch);
                        }
                        inner.push(ch);
                    }
                }
            }
            if !closed {
                return Err(TemplateError::syntax(s, "unterminated '${' marker"));
            }
            segments.push(Segment::Template(inner));
        } else {
            literal.push(c);
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn stringify_scalar(value: &Value, expr: &str) -> Result<String, TemplateError> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        Value::Array(_) | Value::Object(_) => Err(TemplateError::StructuredInterpolation {
            expr: expr.to_string(),
        }),
    }
}

/// Render a possibly-templated string to a value.
///
/// Missing references are hard errors; use [`eval_condition`] for the
/// lenient `when` semantics.
pub fn render_str(input: &str, env: &Environment) -> Result<Value, TemplateError> {
    if !contains_template(input) {
        return Ok(Value::String(input.to_string()));
    }

    let segments = split_segments(input)?;

    // A string that is exactly one marker yields the value unchanged.
    if let [Segment::Template(src)] = segments.as_slice() {
        let expr = parse_expr(src)?;
        return eval(&expr, env, true);
    }

    let mut out = String::new();
    for segment in &segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Template(src) => {
                let expr = parse_expr(src)?;
                let value = eval(&expr, env, true)?;
                out.push_str(&stringify_scalar(&value, src)?);
            }
        }
    }
    Ok(Value::String(out))
}

/// Render a templated string, requiring a string result.
///
/// Whole-marker scalars are stringified; structured values are an error.
pub fn render_to_string(input: &str, env: &Environment) -> Result<String, TemplateError> {
    match render_str(input, env)? {
        Value::String(s) => Ok(s),
        other => stringify_scalar(&other, input),
    }
}

/// Recursively render every templated string inside a value.
pub fn render_value(value: &Value, env: &Environment) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => render_str(s, env),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_value(item, env)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, env)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Compile a condition string to a single expression.
///
/// Text outside markers is expression source; each `${...}` is inlined in
/// parentheses. A string with no marker parses as a bare expression.
pub fn compile_condition(input: &str) -> Result<Expr, TemplateError> {
    if !contains_template(input) {
        return parse_expr(input);
    }
    let mut src = String::new();
    for segment in split_segments(input)? {
        match segment {
            Segment::Literal(text) => src.push_str(&text),
            Segment::Template(inner) => {
                src.push('(');
                src.push_str(&inner);
                src.push(')');
            }
        }
    }
    parse_expr(&src).map_err(|e| match e {
        TemplateError::Syntax { message, .. } => TemplateError::syntax(input, message),
        other => other,
    })
}

/// Evaluate a `when` clause: missing references resolve to null, and null is
/// falsy.
pub fn eval_condition(input: &str, env: &Environment) -> Result<bool, TemplateError> {
    let expr = compile_condition(input)?;
    Ok(truthy(&eval(&expr, env, false)?))
}

/// Evaluate a conditional node's `condition` strictly.
pub fn eval_condition_strict(input: &str, env: &Environment) -> Result<bool, TemplateError> {
    let expr = compile_condition(input)?;
    Ok(truthy(&eval(&expr, env, true)?))
}

/// Parse every embedded expression without evaluating, for validate-time
/// syntax checks.
pub fn check_templates(input: &str) -> Result<(), TemplateError> {
    for segment in split_segments(input)? {
        if let Segment::Template(src) = segment {
            parse_expr(&src)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> Environment {
        Environment::new(
            json!({"x": 1, "name": "ada", "files": ["a.txt", "b.txt"]}),
            json!({"fetch": {"body": {"total": 7}, "stdout": "hi\n"}}),
            json!({}),
            json!({"id": "r-1"}),
        )
    }

    #[test]
    fn test_plain_string_passes_through() {
        assert_eq!(
            render_str("no templates here", &env()).unwrap(),
            json!("no templates here")
        );
    }

    #[test]
    fn test_whole_marker_keeps_structure() {
        assert_eq!(
            render_str("${outputs.fetch.body}", &env()).unwrap(),
            json!({"total": 7})
        );
        assert_eq!(render_str("${inputs.files}", &env()).unwrap(), json!(["a.txt", "b.txt"]));
    }

    #[test]
    fn test_embedded_scalars_stringify() {
        assert_eq!(
            render_str("hello ${inputs.name}, x=${inputs.x}", &env()).unwrap(),
            json!("hello ada, x=1")
        );
    }

    #[test]
    fn test_embedded_structured_is_error() {
        let err = render_str("body: ${outputs.fetch.body}", &env()).unwrap_err();
        assert!(matches!(err, TemplateError::StructuredInterpolation { .. }));
    }

    #[test]
    fn test_embedded_null_is_empty() {
        let env = Environment::new(json!({"v": null}), json!({}), json!({}), json!({}));
        assert_eq!(render_str("v=${inputs.v}!", &env).unwrap(), json!("v=!"));
    }

    #[test]
    fn test_missing_reference_is_error() {
        let err = render_str("${inputs.absent}", &env()).unwrap_err();
        assert!(matches!(err, TemplateError::MissingReference { .. }));
    }

    #[test]
    fn test_unterminated_marker() {
        assert!(render_str("${inputs.x", &env()).is_err());
    }

    #[test]
    fn test_brace_inside_string_literal() {
        assert_eq!(render_str("${'}'}", &env()).unwrap(), json!("}"));
    }

    #[test]
    fn test_condition_with_surrounding_text() {
        assert!(eval_condition("${inputs.x} > 0", &env()).unwrap());
        assert!(!eval_condition("${inputs.x} > 5", &env()).unwrap());
    }

    #[test]
    fn test_condition_missing_means_false() {
        assert!(!eval_condition("${inputs.absent}", &env()).unwrap());
        let err = eval_condition_strict("${inputs.absent}", &env()).unwrap_err();
        assert!(matches!(err, TemplateError::MissingReference { .. }));
    }

    #[test]
    fn test_render_value_recurses() {
        let input = json!({
            "url": "https://x/${inputs.name}",
            "nested": {"n": "${inputs.x}"},
            "list": ["${inputs.x}", 5],
        });
        assert_eq!(
            render_value(&input, &env()).unwrap(),
            json!({
                "url": "https://x/ada",
                "nested": {"n": 1},
                "list": [1, 5],
            })
        );
    }

    #[test]
    fn test_check_templates() {
        assert!(check_templates("ok ${inputs.x} tail").is_ok());
        assert!(check_templates("bad ${inputs.x +}").is_err());
        assert!(check_templates("no markers at all").is_ok());
    }
}
