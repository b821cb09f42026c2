//! Built-in template functions (Go template builtins plus the commonly used
//! sprig subset). Piped values arrive as the last argument.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Go template truthiness: false, 0, nil and empty collections are false
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Text form of a value as written into template output
pub(crate) fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn as_i64(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| format!("{n} is not an integer")),
        Value::String(s) => s.trim().parse::<i64>().map_err(|e| format!("cannot convert {s:?} to int: {e}")),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Null => Ok(0),
        other => Err(format!("cannot convert {other} to int")),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<Ordering, String> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => as_f64(a)
            .zip(as_f64(b))
            .and_then(|(x, y)| x.partial_cmp(&y))
            .ok_or_else(|| "incomparable numbers".to_string()),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(format!("incompatible types for comparison: {a} and {b}")),
    }
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), String> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(format!("wrong number of args for {name}: want {expected} got {}", args.len()))
    }
}

fn string_arg(args: &[Value], index: usize) -> String {
    args.get(index).map(to_text).unwrap_or_default()
}

/// Prefixes every line of `text` with `width` spaces
fn indent(width: i64, text: &str) -> String {
    let pad = " ".repeat(usize::try_from(width).unwrap_or(0));
    format!("{pad}{}", text.replace('\n', &format!("\n{pad}")))
}

fn to_yaml(value: &Value) -> Result<String, String> {
    serde_yaml::to_string(value)
        .map(|s| s.trim_end_matches('\n').to_string())
        .map_err(|e| format!("toYaml: {e}"))
}

fn title(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for c in text.chars() {
        if at_word_start {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_word_start = c.is_whitespace();
    }
    out
}

/// `printf` with the verbs charts actually use: %s %v %d %q %f %t %%
pub(crate) fn sprintf(format: &str, args: &[Value]) -> String {
    let mut out = String::new();
    let mut chars = format.chars().peekable();
    let mut next_arg = args.iter();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut spec = String::new();
        while let Some(&f) = chars.peek() {
            if f == '-' || f == '+' || f == '.' || f.is_ascii_digit() {
                spec.push(f);
                chars.next();
            } else {
                break;
            }
        }
        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let Some(arg) = next_arg.next() else {
            out.push_str(&format!("%!{verb}(MISSING)"));
            continue;
        };
        let (width_spec, precision) = match spec.split_once('.') {
            Some((w, p)) => (w.to_string(), p.parse::<usize>().ok()),
            None => (spec.clone(), None),
        };
        let left_align = width_spec.starts_with('-');
        let width: usize = width_spec.trim_start_matches(['-', '+']).parse().unwrap_or(0);

        let formatted = match verb {
            'd' => as_i64(arg).map_or_else(|_| format!("%!d({})", to_text(arg)), |n| n.to_string()),
            'q' => serde_json::to_string(&to_text(arg)).unwrap_or_default(),
            'f' => as_f64(arg).map_or_else(
                || format!("%!f({})", to_text(arg)),
                |f| format!("{f:.prec$}", prec = precision.unwrap_or(6)),
            ),
            't' => truthy(arg).to_string(),
            _ => to_text(arg),
        };
        if formatted.chars().count() < width {
            let pad = " ".repeat(width - formatted.chars().count());
            if left_align {
                out.push_str(&formatted);
                out.push_str(&pad);
            } else {
                out.push_str(&pad);
                out.push_str(&formatted);
            }
        } else {
            out.push_str(&formatted);
        }
    }
    out
}

fn index(mut target: Value, keys: &[Value]) -> Result<Value, String> {
    for key in keys {
        target = match (&target, key) {
            (Value::Array(items), k) => {
                let i = as_i64(k)?;
                usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .ok_or_else(|| format!("index out of range: {i}"))?
            }
            (Value::Object(map), k) => map.get(&to_text(k)).cloned().unwrap_or(Value::Null),
            (Value::Null, _) => Value::Null,
            (other, _) => return Err(format!("can't index item of type {other}")),
        };
    }
    Ok(target)
}

/// Calls builtin `name`. Returns `None` when no such function exists.
pub(crate) fn call(name: &str, args: Vec<Value>) -> Option<Result<Value, String>> {
    Some(match name {
        // Logic and comparison
        "and" => Ok(args.iter().find(|v| !truthy(v)).or(args.last()).cloned().unwrap_or(Value::Null)),
        "or" => Ok(args.iter().find(|v| truthy(v)).or(args.last()).cloned().unwrap_or(Value::Null)),
        "not" => arity(name, &args, 1).map(|()| Value::Bool(!truthy(&args[0]))),
        "eq" => match args.split_first() {
            Some((first, rest)) if !rest.is_empty() => Ok(Value::Bool(rest.iter().any(|v| values_equal(first, v)))),
            _ => Err("missing argument for comparison".to_string()),
        },
        "ne" => arity(name, &args, 2).map(|()| Value::Bool(!values_equal(&args[0], &args[1]))),
        "lt" | "le" | "gt" | "ge" => arity(name, &args, 2)
            .and_then(|()| compare(&args[0], &args[1]))
            .map(|ord| {
                Value::Bool(match name {
                    "lt" => ord == Ordering::Less,
                    "le" => ord != Ordering::Greater,
                    "gt" => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                })
            }),
        "empty" => arity(name, &args, 1).map(|()| Value::Bool(!truthy(&args[0]))),
        "default" => arity(name, &args, 2).map(|()| {
            if truthy(&args[1]) {
                args[1].clone()
            } else {
                args[0].clone()
            }
        }),
        "coalesce" => Ok(args.iter().find(|v| truthy(v)).cloned().unwrap_or(Value::Null)),
        "ternary" => arity(name, &args, 3).map(|()| {
            if truthy(&args[2]) {
                args[0].clone()
            } else {
                args[1].clone()
            }
        }),
        "required" => arity(name, &args, 2).and_then(|()| match &args[1] {
            Value::Null => Err(to_text(&args[0])),
            Value::String(s) if s.is_empty() => Err(to_text(&args[0])),
            v => Ok(v.clone()),
        }),
        "fail" => Err(string_arg(&args, 0)),

        // Strings
        "print" => Ok(Value::String(args.iter().map(to_text).collect::<Vec<_>>().join(""))),
        "printf" => match args.split_first() {
            Some((format, rest)) => Ok(Value::String(sprintf(&to_text(format), rest))),
            None => Err("printf needs a format".to_string()),
        },
        "quote" => Ok(Value::String(
            args.iter()
                .filter(|v| !v.is_null())
                .map(|v| serde_json::to_string(&to_text(v)).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(" "),
        )),
        "squote" => Ok(Value::String(
            args.iter()
                .filter(|v| !v.is_null())
                .map(|v| format!("'{}'", to_text(v)))
                .collect::<Vec<_>>()
                .join(" "),
        )),
        "upper" => arity(name, &args, 1).map(|()| Value::String(to_text(&args[0]).to_uppercase())),
        "lower" => arity(name, &args, 1).map(|()| Value::String(to_text(&args[0]).to_lowercase())),
        "title" => arity(name, &args, 1).map(|()| Value::String(title(&to_text(&args[0])))),
        "trim" => arity(name, &args, 1).map(|()| Value::String(to_text(&args[0]).trim().to_string())),
        "trimSuffix" => arity(name, &args, 2).map(|()| {
            let (suffix, s) = (to_text(&args[0]), to_text(&args[1]));
            Value::String(s.strip_suffix(suffix.as_str()).unwrap_or(&s).to_string())
        }),
        "trimPrefix" => arity(name, &args, 2).map(|()| {
            let (prefix, s) = (to_text(&args[0]), to_text(&args[1]));
            Value::String(s.strip_prefix(prefix.as_str()).unwrap_or(&s).to_string())
        }),
        "replace" => arity(name, &args, 3).map(|()| {
            Value::String(to_text(&args[2]).replace(&to_text(&args[0]), &to_text(&args[1])))
        }),
        "contains" => arity(name, &args, 2).map(|()| Value::Bool(to_text(&args[1]).contains(&to_text(&args[0])))),
        "hasPrefix" => {
            arity(name, &args, 2).map(|()| Value::Bool(to_text(&args[1]).starts_with(&to_text(&args[0]))))
        }
        "hasSuffix" => arity(name, &args, 2).map(|()| Value::Bool(to_text(&args[1]).ends_with(&to_text(&args[0])))),
        "trunc" => arity(name, &args, 2).and_then(|()| {
            let n = usize::try_from(as_i64(&args[0])?).unwrap_or(0);
            Ok(Value::String(to_text(&args[1]).chars().take(n).collect()))
        }),
        "indent" => arity(name, &args, 2).and_then(|()| Ok(Value::String(indent(as_i64(&args[0])?, &to_text(&args[1]))))),
        "nindent" => arity(name, &args, 2)
            .and_then(|()| Ok(Value::String(format!("\n{}", indent(as_i64(&args[0])?, &to_text(&args[1])))))),
        "splitList" => arity(name, &args, 2).map(|()| {
            let sep = to_text(&args[0]);
            Value::Array(
                to_text(&args[1])
                    .split(sep.as_str())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            )
        }),
        "join" => arity(name, &args, 2).and_then(|()| match &args[1] {
            Value::Array(items) => Ok(Value::String(items.iter().map(to_text).collect::<Vec<_>>().join(&to_text(&args[0])))),
            Value::Null => Ok(Value::String(String::new())),
            other => Ok(Value::String(to_text(other))),
        }),
        "b64enc" => arity(name, &args, 1).map(|()| Value::String(STANDARD.encode(to_text(&args[0])))),
        "b64dec" => arity(name, &args, 1).and_then(|()| {
            let bytes = STANDARD.decode(to_text(&args[0])).map_err(|e| format!("b64dec: {e}"))?;
            String::from_utf8(bytes).map(Value::String).map_err(|e| format!("b64dec: {e}"))
        }),

        // Conversion and serialization
        "toString" => arity(name, &args, 1).map(|()| Value::String(to_text(&args[0]))),
        "int" | "int64" => arity(name, &args, 1).and_then(|()| as_i64(&args[0]).map(Value::from)),
        "float64" => arity(name, &args, 1)
            .and_then(|()| as_f64(&args[0]).ok_or_else(|| format!("cannot convert {} to float", args[0])))
            .map(|f| serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)),
        "toYaml" => arity(name, &args, 1).and_then(|()| to_yaml(&args[0]).map(Value::String)),
        "toJson" => arity(name, &args, 1)
            .and_then(|()| serde_json::to_string(&args[0]).map_err(|e| format!("toJson: {e}")))
            .map(Value::String),
        "fromYaml" => arity(name, &args, 1).map(|()| {
            serde_yaml::from_str::<Value>(&to_text(&args[0])).unwrap_or_else(|e| {
                let mut error = Map::new();
                error.insert("Error".to_string(), Value::String(e.to_string()));
                Value::Object(error)
            })
        }),

        // Collections
        "list" => Ok(Value::Array(args)),
        "dict" => {
            let mut map = Map::new();
            for pair in args.chunks(2) {
                map.insert(to_text(&pair[0]), pair.get(1).cloned().unwrap_or(Value::Null));
            }
            Ok(Value::Object(map))
        }
        "hasKey" => arity(name, &args, 2).map(|()| {
            Value::Bool(args[0].as_object().is_some_and(|m| m.contains_key(&to_text(&args[1]))))
        }),
        "keys" => Ok(Value::Array(
            args.iter()
                .filter_map(Value::as_object)
                .flat_map(|m| m.keys().cloned().map(Value::String))
                .collect(),
        )),
        "len" => arity(name, &args, 1).and_then(|()| match &args[0] {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::Object(o) => Ok(Value::from(o.len())),
            Value::Null => Ok(Value::from(0)),
            other => Err(format!("len of type {other}")),
        }),
        "index" => match args.split_first() {
            Some((target, keys)) => index(target.clone(), keys),
            None => Err("index needs a target".to_string()),
        },
        "first" => arity(name, &args, 1).map(|()| args[0].as_array().and_then(|a| a.first()).cloned().unwrap_or(Value::Null)),
        "last" => arity(name, &args, 1).map(|()| args[0].as_array().and_then(|a| a.last()).cloned().unwrap_or(Value::Null)),

        // Arithmetic
        "add" => args
            .iter()
            .map(|v| as_f64(v).ok_or_else(|| format!("add: {v} is not a number")))
            .sum::<Result<f64, String>>()
            .map(number),
        "add1" => arity(name, &args, 1).and_then(|()| as_i64(&args[0]).map(|n| Value::from(n + 1))),
        "sub" | "mul" | "div" | "mod" => arity(name, &args, 2).and_then(|()| {
            let a = as_i64(&args[0])?;
            let b = as_i64(&args[1])?;
            match name {
                "sub" => Ok(Value::from(a - b)),
                "mul" => Ok(Value::from(a * b)),
                _ if b == 0 => Err("division by zero".to_string()),
                "div" => Ok(Value::from(a / b)),
                _ => Ok(Value::from(a % b)),
            }
        }),

        _ => return None,
    })
}
