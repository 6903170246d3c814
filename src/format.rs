//! printf-style formatting over JSON values, used by `Response::text`.
//!
//! Supported verbs are `%v %s %d %f %q %t %x` and the `%%` escape, with
//! the `-` and `0` flags, a width and a precision. Mismatches are rendered
//! inline instead of failing: `%!d(MISSING)`, `%!d(string=abc)` and a
//! trailing `%!(EXTRA number=1)`.

use std::fmt::Write;

use serde_json::Value;

/// Widths and precisions above this render `%!(BADWIDTH)` / `%!(BADPREC)`.
const MAX_WIDTH: usize = 1_000_000;

#[derive(Debug, Default, Clone, Copy)]
struct Directive {
    left: bool,
    zero: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

pub fn sprintf(format: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut args = args.iter();
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let mut directive = Directive::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => directive.left = true,
                '0' => directive.zero = true,
                '+' | ' ' | '#' => {}
                _ => break,
            }
            chars.next();
        }
        directive.width = digits(&mut chars);
        if directive.width.is_some_and(|w| w > MAX_WIDTH) {
            out.push_str("%!(BADWIDTH)");
            directive.width = None;
        }
        if chars.peek() == Some(&'.') {
            chars.next();
            let precision = digits(&mut chars).unwrap_or(0);
            if precision > MAX_WIDTH {
                out.push_str("%!(BADPREC)");
            } else {
                directive.precision = Some(precision);
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

        match args.next() {
            Some(arg) => {
                let rendered = render(verb, directive, arg);
                pad(&mut out, &rendered, directive, verb);
            }
            None => {
                let _ = write!(out, "%!{}(MISSING)", verb);
            }
        }
    }

    let extra: Vec<String> = args.map(|arg| format!("{}={}", kind(arg), plain(arg))).collect();
    if !extra.is_empty() {
        let _ = write!(out, "%!(EXTRA {})", extra.join(", "));
    }

    out
}

fn digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut value: Option<usize> = None;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        value = Some(value.unwrap_or(0).saturating_mul(10).saturating_add(d as usize));
        chars.next();
    }
    value
}

fn render(verb: char, directive: Directive, arg: &Value) -> String {
    match (verb, arg) {
        ('v', Value::Number(n)) if directive.precision.is_some() && !is_integer(n) => {
            fixed(arg, directive.precision)
        }
        ('v', _) => truncate(plain(arg), directive.precision),
        ('s', Value::String(s)) => truncate(s.clone(), directive.precision),
        ('d', Value::Number(n)) if is_integer(n) => integer(n).to_string(),
        ('f', Value::Number(_)) => fixed(arg, directive.precision),
        ('q', Value::String(s)) => serde_json::to_string(s).unwrap_or_default(),
        ('t', Value::Bool(b)) => b.to_string(),
        ('x', Value::Number(n)) if is_integer(n) => {
            let v = integer(n);
            if v < 0 {
                format!("-{:x}", v.unsigned_abs())
            } else {
                format!("{:x}", v)
            }
        }
        ('x', Value::String(s)) => s.bytes().map(|b| format!("{:02x}", b)).collect(),
        _ => format!("%!{}({}={})", verb, kind(arg), plain(arg)),
    }
}

fn pad(out: &mut String, rendered: &str, directive: Directive, verb: char) {
    let len = rendered.chars().count();
    let width = directive.width.unwrap_or(0);
    if len >= width {
        out.push_str(rendered);
        return;
    }
    let fill = width - len;

    if directive.left {
        out.push_str(rendered);
        out.extend(std::iter::repeat(' ').take(fill));
    } else if directive.zero && matches!(verb, 'd' | 'f' | 'x' | 'v') && !rendered.starts_with("%!") {
        // Zeros go after the sign.
        let (sign, digits) = match rendered.strip_prefix('-') {
            Some(rest) => ("-", rest),
            None => ("", rendered),
        };
        out.push_str(sign);
        out.extend(std::iter::repeat('0').take(fill));
        out.push_str(digits);
    } else {
        out.extend(std::iter::repeat(' ').take(fill));
        out.push_str(rendered);
    }
}

fn is_integer(n: &serde_json::Number) -> bool {
    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15)
}

fn integer(n: &serde_json::Number) -> i128 {
    if let Some(v) = n.as_i64() {
        v as i128
    } else if let Some(v) = n.as_u64() {
        v as i128
    } else {
        n.as_f64().unwrap_or(0.0) as i128
    }
}

fn fixed(arg: &Value, precision: Option<usize>) -> String {
    let f = arg.as_f64().unwrap_or(0.0);
    format!("{:.*}", precision.unwrap_or(6), f)
}

fn truncate(s: String, precision: Option<usize>) -> String {
    match precision {
        Some(p) => s.chars().take(p).collect(),
        None => s,
    }
}

fn kind(arg: &Value) -> &'static str {
    match arg {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The `%v` rendering.
fn plain(arg: &Value) -> String {
    match arg {
        Value::Null => "<nil>".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(plain).collect();
            format!("[{}]", items.join(" "))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let items: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, plain(&map[k])))
                .collect();
            format!("map[{}]", items.join(" "))
        }
    }
}
