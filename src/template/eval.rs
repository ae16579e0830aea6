//! Expression evaluation over JSON values.

use serde_json::Value;

use super::expr::{path_to_string, BinaryOp, Expr, PathSeg, UnaryOp};
use crate::error::TemplateError;

/// Layered lookup environment for expression evaluation.
///
/// The root is a JSON object with the standard layers (`inputs`, `outputs`,
/// `env`, `run`) plus `item`/`index` inside loop bodies. Evaluation is pure;
/// the environment is a snapshot taken before dispatch.
#[derive(Debug, Clone)]
pub struct Environment {
    root: Value,
}

impl Environment {
    pub fn new(inputs: Value, outputs: Value, env: Value, run: Value) -> Self {
        let root = serde_json::json!({
            "inputs": inputs,
            "outputs": outputs,
            "env": env,
            "run": run,
        });
        Self { root }
    }

    /// Environment with no bindings, for tests and standalone evaluation.
    pub fn empty() -> Self {
        Self::new(
            Value::Object(Default::default()),
            Value::Object(Default::default()),
            Value::Object(Default::default()),
            Value::Object(Default::default()),
        )
    }

    /// Derive a child environment with `item` and `index` bound, for one
    /// loop iteration.
    pub fn with_item(&self, item: Value, index: usize) -> Self {
        let mut root = self.root.clone();
        if let Value::Object(map) = &mut root {
            map.insert("item".to_string(), item);
            map.insert("index".to_string(), Value::from(index as u64));
        }
        Self { root }
    }

    /// Resolve a reference path. `None` means the reference is missing.
    pub fn lookup(&self, path: &[PathSeg]) -> Option<Value> {
        let mut current = &self.root;
        for seg in path {
            current = match seg {
                PathSeg::Field(name) => match current {
                    Value::Object(map) => map.get(name).or_else(|| {
                        // Node ids may contain hyphens, which the expression
                        // grammar cannot spell as bare identifiers. Underscore
                        // spellings alias to the hyphenated key.
                        if name.contains('_') {
                            map.get(&name.replace('_', "-"))
                        } else {
                            None
                        }
                    })?,
                    _ => return None,
                },
                PathSeg::Key(key) => match current {
                    Value::Object(map) => map.get(key)?,
                    _ => return None,
                },
                PathSeg::Index(idx) => match current {
                    Value::Array(items) => items.get(*idx)?,
                    _ => return None,
                },
            };
        }
        Some(current.clone())
    }
}

/// Truthiness: `null`, `false`, `0`, `0.0`, `""`, `[]` and `{}` are falsy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Evaluate an expression.
///
/// In strict mode a missing reference is an error; in lenient mode (used for
/// `when` clauses) it resolves to `null`.
pub fn eval(expr: &Expr, env: &Environment, strict: bool) -> Result<Value, TemplateError> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(i) => Ok(Value::from(*i)),
        Expr::Float(f) => float_value(*f),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Path(segs) => match env.lookup(segs) {
            Some(v) => Ok(v),
            None if strict => Err(TemplateError::MissingReference {
                path: path_to_string(segs),
            }),
            None => Ok(Value::Null),
        },
        Expr::Unary { op, operand } => {
            let v = eval(operand, env, strict)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                UnaryOp::Neg => match numeric(&v) {
                    Some(Num::Int(i)) => Ok(Value::from(-i)),
                    Some(Num::Float(f)) => float_value(-f),
                    None => Err(TemplateError::Type(format!(
                        "cannot negate {}",
                        type_name(&v)
                    ))),
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, env, strict),
        Expr::Ternary {
            value,
            cond,
            fallback,
        } => {
            let c = eval(cond, env, strict)?;
            if truthy(&c) {
                eval(value, env, strict)
            } else {
                eval(fallback, env, strict)
            }
        }
    }
}

enum Num {
    Int(i64),
    Float(f64),
}

fn numeric(v: &Value) -> Option<Num> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Num::Int(i))
            } else {
                n.as_f64().map(Num::Float)
            }
        }
        _ => None,
    }
}

fn float_value(f: f64) -> Result<Value, TemplateError> {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| TemplateError::Type("arithmetic produced a non-finite number".to_string()))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    env: &Environment,
    strict: bool,
) -> Result<Value, TemplateError> {
    // Logical operators short-circuit.
    match op {
        BinaryOp::And => {
            let l = eval(left, env, strict)?;
            if !truthy(&l) {
                return Ok(Value::Bool(false));
            }
            let r = eval(right, env, strict)?;
            return Ok(Value::Bool(truthy(&r)));
        }
        BinaryOp::Or => {
            let l = eval(left, env, strict)?;
            if truthy(&l) {
                return Ok(Value::Bool(true));
            }
            let r = eval(right, env, strict)?;
            return Ok(Value::Bool(truthy(&r)));
        }
        _ => {}
    }

    let l = eval(left, env, strict)?;
    let r = eval(right, env, strict)?;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
            let ord = compare(&l, &r)?;
            let result = match op {
                BinaryOp::Lt => ord == std::cmp::Ordering::Less,
                BinaryOp::Gt => ord == std::cmp::Ordering::Greater,
                BinaryOp::Le => ord != std::cmp::Ordering::Greater,
                BinaryOp::Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            _ => arith(&l, &r, "+", |a, b| a.checked_add(b), |a, b| a + b),
        },
        BinaryOp::Sub => arith(&l, &r, "-", |a, b| a.checked_sub(b), |a, b| a - b),
        BinaryOp::Mul => arith(&l, &r, "*", |a, b| a.checked_mul(b), |a, b| a * b),
        BinaryOp::Div => {
            let (a, b) = both_numeric(&l, &r, "/")?;
            if b == 0.0 {
                return Err(TemplateError::Type("division by zero".to_string()));
            }
            float_value(a / b)
        }
        BinaryOp::And | BinaryOp::Or => unreachable!(),
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    // Cross-type numeric equality (1 == 1.0).
    if let (Value::Number(a), Value::Number(b)) = (l, r) {
        if let (Some(fa), Some(fb)) = (a.as_f64(), b.as_f64()) {
            return fa == fb;
        }
    }
    l == r
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, TemplateError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            let (fa, fb) = (a.as_f64(), b.as_f64());
            match (fa, fb) {
                (Some(fa), Some(fb)) => fa.partial_cmp(&fb).ok_or_else(|| {
                    TemplateError::Type("cannot order non-finite numbers".to_string())
                }),
                _ => Err(TemplateError::Type("cannot order these numbers".to_string())),
            }
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(TemplateError::Type(format!(
            "cannot order {} and {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn both_numeric(l: &Value, r: &Value, op: &str) -> Result<(f64, f64), TemplateError> {
    match (numeric(l), numeric(r)) {
        (Some(a), Some(b)) => {
            let fa = match a {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            let fb = match b {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            Ok((fa, fb))
        }
        _ => Err(TemplateError::Type(format!(
            "'{}' requires numbers, got {} and {}",
            op,
            type_name(l),
            type_name(r)
        ))),
    }
}

fn arith(
    l: &Value,
    r: &Value,
    op: &str,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, TemplateError> {
    if let (Some(Num::Int(a)), Some(Num::Int(b))) = (numeric(l), numeric(r)) {
        if let Some(result) = int_op(a, b) {
            return Ok(Value::from(result));
        }
        // Integer overflow falls through to float arithmetic.
    }
    let (a, b) = both_numeric(l, r, op)?;
    float_value(float_op(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::expr::parse_expr;
    use serde_json::json;

    fn env() -> Environment {
        Environment::new(
            json!({"x": 3, "name": "ada", "flag": true}),
            json!({"fetch-orders": {"stdout": "ok\n", "exit_code": 0}, "nums": [10, 20, 30]}),
            json!({"HOME": "/root"}),
            json!({"id": "r-1", "workflow": "demo"}),
        )
    }

    fn ev(src: &str) -> Value {
        eval(&parse_expr(src).unwrap(), &env(), true).unwrap()
    }

    #[test]
    fn test_lookup_layers() {
        assert_eq!(ev("inputs.x"), json!(3));
        assert_eq!(ev("env.HOME"), json!("/root"));
        assert_eq!(ev("run.workflow"), json!("demo"));
        assert_eq!(ev("outputs.nums[1]"), json!(20));
    }

    #[test]
    fn test_hyphen_alias() {
        assert_eq!(ev("outputs.fetch_orders.stdout"), json!("ok\n"));
        assert_eq!(ev("outputs[\"fetch-orders\"].exit_code"), json!(0));
    }

    #[test]
    fn test_missing_strict_vs_lenient() {
        let expr = parse_expr("inputs.absent").unwrap();
        assert!(matches!(
            eval(&expr, &env(), true),
            Err(TemplateError::MissingReference { .. })
        ));
        assert_eq!(eval(&expr, &env(), false).unwrap(), Value::Null);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(ev("inputs.x > 0"), json!(true));
        assert_eq!(ev("inputs.x >= 3"), json!(true));
        assert_eq!(ev("inputs.x != 3"), json!(false));
        assert_eq!(ev("inputs.name == 'ada'"), json!(true));
        assert_eq!(ev("1 == 1.0"), json!(true));
        assert_eq!(ev("'abc' < 'abd'"), json!(true));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(ev("1 + 2 * 3"), json!(7));
        assert_eq!(ev("inputs.x - 5"), json!(-2));
        assert_eq!(ev("10 / 4"), json!(2.5));
        assert_eq!(ev("'a' + 'b'"), json!("ab"));
        assert!(matches!(
            eval(&parse_expr("1 / 0").unwrap(), &env(), true),
            Err(TemplateError::Type(_))
        ));
        assert!(matches!(
            eval(&parse_expr("'a' - 1").unwrap(), &env(), true),
            Err(TemplateError::Type(_))
        ));
    }

    #[test]
    fn test_logic_and_ternary() {
        assert_eq!(ev("inputs.flag and inputs.x > 0"), json!(true));
        assert_eq!(ev("not inputs.flag"), json!(false));
        assert_eq!(ev("false or inputs.flag"), json!(true));
        assert_eq!(ev("'yes' if inputs.x > 0 else 'no'"), json!("yes"));
        assert_eq!(ev("'yes' if inputs.x < 0 else 'no'"), json!("no"));
    }

    #[test]
    fn test_short_circuit_avoids_missing() {
        // Lenient mode: missing reference is null, null ordering never runs
        // because `and` short-circuits.
        let expr = parse_expr("inputs.absent and inputs.absent > 3").unwrap();
        assert_eq!(eval(&expr, &env(), false).unwrap(), json!(false));
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!(0.0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(!truthy(&json!({})));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!([0])));
    }

    #[test]
    fn test_with_item() {
        let child = env().with_item(json!("file.txt"), 2);
        let expr = parse_expr("item").unwrap();
        assert_eq!(eval(&expr, &child, true).unwrap(), json!("file.txt"));
        let expr = parse_expr("index").unwrap();
        assert_eq!(eval(&expr, &child, true).unwrap(), json!(2));
    }
}
