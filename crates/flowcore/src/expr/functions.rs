use super::ExprError;
use crate::Value;

/// Names of every helper callable from an expression.
pub const FUNCTIONS: &[&str] = &[
    "sum", "avg", "average", "min", "max", "round", "floor", "ceil", "abs", "len",
    "format_number", "percent", "upper", "lower", "trim", "concat", "join", "contains",
    "pluck", "keys", "values", "coalesce", "to_string", "to_number",
];

/// Largest number of decimal places `round`, `percent` and `format_number`
/// will honor.
const MAX_DECIMALS: f64 = 20.0;

pub(crate) fn call(name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
    match name {
        "sum" => Ok(Value::Number(numeric_args(name, &args)?.iter().sum())),
        "avg" | "average" => {
            let nums = numeric_args(name, &args)?;
            if nums.is_empty() {
                return Ok(Value::Null);
            }
            Ok(Value::Number(nums.iter().sum::<f64>() / nums.len() as f64))
        }
        "min" => Ok(numeric_args(name, &args)?
            .into_iter()
            .reduce(f64::min)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        "max" => Ok(numeric_args(name, &args)?
            .into_iter()
            .reduce(f64::max)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        "round" => {
            arity(name, &args, 1, 2)?;
            let n = number(name, &args[0])?;
            let digits = decimals(optional_number(name, args.get(1))?, 0.0, -MAX_DECIMALS);
            Ok(Value::Number(round_to(n, digits)))
        }
        "floor" => unary_number(name, &args, f64::floor),
        "ceil" => unary_number(name, &args, f64::ceil),
        "abs" => unary_number(name, &args, f64::abs),
        "len" => {
            arity(name, &args, 1, 1)?;
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => return Err(ExprError::Type(format!("len() of {}", other.type_name()))),
            };
            Ok(Value::Number(len as f64))
        }
        "format_number" => {
            arity(name, &args, 1, 2)?;
            let n = number(name, &args[0])?;
            let places = decimals(optional_number(name, args.get(1))?, 0.0, 0.0) as usize;
            Ok(Value::String(format_number(n, places)))
        }
        "percent" => {
            arity(name, &args, 2, 3)?;
            let part = number(name, &args[0])?;
            let whole = number(name, &args[1])?;
            if whole == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            let digits = decimals(optional_number(name, args.get(2))?, 1.0, -MAX_DECIMALS);
            Ok(Value::Number(round_to(part / whole * 100.0, digits)))
        }
        "upper" => unary_string(name, &args, |s| s.to_uppercase()),
        "lower" => unary_string(name, &args, |s| s.to_lowercase()),
        "trim" => unary_string(name, &args, |s| s.trim().to_string()),
        "concat" => Ok(Value::String(
            args.iter().map(Value::to_display_string).collect(),
        )),
        "join" => {
            arity(name, &args, 1, 2)?;
            let items = array(name, &args[0])?;
            let sep = match args.get(1) {
                Some(Value::String(s)) => s.as_str(),
                Some(other) => {
                    return Err(ExprError::Type(format!(
                        "join() separator must be a string, got {}",
                        other.type_name()
                    )))
                }
                None => ",",
            };
            Ok(Value::String(
                items
                    .iter()
                    .map(Value::to_display_string)
                    .collect::<Vec<_>>()
                    .join(sep),
            ))
        }
        "contains" => {
            arity(name, &args, 2, 2)?;
            let found = match (&args[0], &args[1]) {
                (Value::String(hay), needle) => hay.contains(&needle.to_display_string()),
                (Value::Array(items), needle) => items.contains(needle),
                (Value::Object(map), Value::String(key)) => map.contains_key(key),
                (other, _) => {
                    return Err(ExprError::Type(format!("contains() on {}", other.type_name())))
                }
            };
            Ok(Value::Bool(found))
        }
        "pluck" => {
            arity(name, &args, 2, 2)?;
            let items = array(name, &args[0])?;
            let field = args[1].to_display_string();
            Ok(Value::Array(
                items
                    .iter()
                    .map(|item| item.get_segment(&field).cloned().unwrap_or(Value::Null))
                    .collect(),
            ))
        }
        "keys" => {
            arity(name, &args, 1, 1)?;
            let map = object(name, &args[0])?;
            Ok(Value::Array(map.keys().cloned().map(Value::String).collect()))
        }
        "values" => {
            arity(name, &args, 1, 1)?;
            let map = object(name, &args[0])?;
            Ok(Value::Array(map.values().cloned().collect()))
        }
        "coalesce" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        "to_string" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(args[0].to_display_string()))
        }
        "to_number" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Number(n) => Ok(Value::Number(*n)),
                Value::Bool(b) => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
                Value::String(s) => s
                    .trim()
                    .replace(',', "")
                    .parse::<f64>()
                    .map(Value::Number)
                    .map_err(|_| ExprError::Type(format!("to_number(): '{}' is not a number", s))),
                other => Err(ExprError::Type(format!("to_number() of {}", other.type_name()))),
            }
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ExprError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{}-{}", min, max)
        };
        return Err(ExprError::Arity {
            function: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn number(name: &str, value: &Value) -> Result<f64, ExprError> {
    value.as_f64().ok_or_else(|| {
        ExprError::Type(format!("{}() expects a number, got {}", name, value.type_name()))
    })
}

fn optional_number(name: &str, value: Option<&Value>) -> Result<Option<f64>, ExprError> {
    value.map(|v| number(name, v)).transpose()
}

fn array<'v>(name: &str, value: &'v Value) -> Result<&'v Vec<Value>, ExprError> {
    value.as_array().ok_or_else(|| {
        ExprError::Type(format!("{}() expects an array, got {}", name, value.type_name()))
    })
}

fn object<'v>(
    name: &str,
    value: &'v Value,
) -> Result<&'v std::collections::BTreeMap<String, Value>, ExprError> {
    value.as_object().ok_or_else(|| {
        ExprError::Type(format!("{}() expects an object, got {}", name, value.type_name()))
    })
}

/// Numbers from either a single array argument or the argument list itself.
/// Nulls are ignored.
fn numeric_args(name: &str, args: &[Value]) -> Result<Vec<f64>, ExprError> {
    let items: &[Value] = match args {
        [Value::Array(items)] => items,
        _ => args,
    };
    items
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| number(name, v))
        .collect()
}

fn unary_number(name: &str, args: &[Value], f: fn(f64) -> f64) -> Result<Value, ExprError> {
    arity(name, args, 1, 1)?;
    Ok(Value::Number(f(number(name, &args[0])?)))
}

fn unary_string(
    name: &str,
    args: &[Value],
    f: impl Fn(&str) -> String,
) -> Result<Value, ExprError> {
    arity(name, args, 1, 1)?;
    match &args[0] {
        Value::String(s) => Ok(Value::String(f(s))),
        other => Err(ExprError::Type(format!(
            "{}() expects a string, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn decimals(requested: Option<f64>, default: f64, min: f64) -> i32 {
    requested.unwrap_or(default).clamp(min, MAX_DECIMALS) as i32
}

fn round_to(n: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    let scaled = n * factor;
    if !scaled.is_finite() {
        return n;
    }
    scaled.round() / factor
}

/// `1234567.891` with 2 decimals -> `1,234,567.89`.
fn format_number(n: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, n.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let sign = if n < 0.0 && formatted.chars().any(|c| c != '0' && c != '.') {
        "-"
    } else {
        ""
    };
    match frac_part {
        Some(frac) => format!("{}{}.{}", sign, grouped, frac),
        None => format!("{}{}", sign, grouped),
    }
}
