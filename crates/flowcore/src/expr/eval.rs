use super::functions::call;
use super::{BinaryOp, Expr, ExprError, UnaryOp};
use crate::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

const INPUTS_BINDING: &str = "inputs";

pub(crate) struct Evaluator<'a> {
    bindings: &'a BTreeMap<String, Value>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(bindings: &'a BTreeMap<String, Value>) -> Self {
        Self { bindings }
    }

    pub(crate) fn eval(&self, expr: &Expr) -> Result<Value, ExprError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Variable(name) => self.variable(name),
            Expr::Member(target, field) => member(self.eval(target)?, field),
            Expr::Index(target, index) => index_into(self.eval(target)?, self.eval(index)?),
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                call(name, args)
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOp::Neg => match value {
                        Value::Number(n) => Ok(Value::Number(-n)),
                        other => Err(type_error("negate", &other)),
                    },
                }
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                let left = self.eval(lhs)?;
                if left.is_truthy() {
                    self.eval(rhs)
                } else {
                    Ok(left)
                }
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                let left = self.eval(lhs)?;
                if left.is_truthy() {
                    Ok(left)
                } else {
                    self.eval(rhs)
                }
            }
            Expr::Binary(op, lhs, rhs) => binary(*op, self.eval(lhs)?, self.eval(rhs)?),
            Expr::Conditional(cond, then, otherwise) => {
                if self.eval(cond)?.is_truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Array(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Object(fields) => fields
                .iter()
                .map(|(key, value)| self.eval(value).map(|v| (key.clone(), v)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Object),
        }
    }

    fn variable(&self, name: &str) -> Result<Value, ExprError> {
        if let Some(value) = self.bindings.get(name) {
            return Ok(value.clone());
        }
        if name == INPUTS_BINDING {
            return Ok(Value::Object(self.bindings.clone()));
        }
        Err(ExprError::UnknownVariable(name.to_string()))
    }
}

fn member(target: Value, field: &str) -> Result<Value, ExprError> {
    match target {
        Value::Object(mut map) => Ok(map.remove(field).unwrap_or(Value::Null)),
        Value::Array(items) if field == "length" => Ok(Value::Number(items.len() as f64)),
        Value::String(s) if field == "length" => Ok(Value::Number(s.chars().count() as f64)),
        Value::Array(items) => Ok(field
            .parse::<usize>()
            .ok()
            .and_then(|i| items.into_iter().nth(i))
            .unwrap_or(Value::Null)),
        other => Err(ExprError::Type(format!(
            "cannot read field '{}' of {}",
            field,
            other.type_name()
        ))),
    }
}

fn index_into(target: Value, index: Value) -> Result<Value, ExprError> {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => {
            if n < 0.0 || n.fract() != 0.0 {
                return Ok(Value::Null);
            }
            Ok(items.into_iter().nth(n as usize).unwrap_or(Value::Null))
        }
        (Value::Object(mut map), Value::String(key)) => Ok(map.remove(&key).unwrap_or(Value::Null)),
        (Value::Object(mut map), Value::Number(n)) => Ok(map
            .remove(&Value::Number(n).to_display_string())
            .unwrap_or(Value::Null)),
        (target, index) => Err(ExprError::Type(format!(
            "cannot index {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExprError> {
    use BinaryOp::*;

    match op {
        Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Ok(Value::Array(a))
            }
            (l @ Value::String(_), r) | (l, r @ Value::String(_)) => Ok(Value::String(format!(
                "{}{}",
                l.to_display_string(),
                r.to_display_string()
            ))),
            (l, r) => Err(ExprError::Type(format!(
                "cannot add {} and {}",
                l.type_name(),
                r.type_name()
            ))),
        },
        Sub | Mul | Div | Rem => {
            let (a, b) = numbers(op, &left, &right)?;
            match op {
                Sub => Ok(Value::Number(a - b)),
                Mul => Ok(Value::Number(a * b)),
                Div | Rem if b == 0.0 => Err(ExprError::DivisionByZero),
                Div => Ok(Value::Number(a / b)),
                _ => Ok(Value::Number(a % b)),
            }
        }
        Eq => Ok(Value::Bool(left == right)),
        NotEq => Ok(Value::Bool(left != right)),
        Lt | Le | Gt | Ge => {
            let ordering = compare(&left, &right)?;
            Ok(Value::Bool(match op {
                Lt => ordering == Ordering::Less,
                Le => ordering != Ordering::Greater,
                Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        And | Or => unreachable!("short-circuit operators are handled by the evaluator"),
    }
}

fn numbers(op: BinaryOp, left: &Value, right: &Value) -> Result<(f64, f64), ExprError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => Ok((*a, *b)),
        _ => Err(ExprError::Type(format!(
            "{:?} needs numbers, got {} and {}",
            op,
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, ExprError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .partial_cmp(b)
            .ok_or_else(|| ExprError::Type("cannot compare NaN".to_string())),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ExprError::Type(format!(
            "cannot compare {} with {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn type_error(action: &str, value: &Value) -> ExprError {
    ExprError::Type(format!("cannot {} {}", action, value.type_name()))
}
