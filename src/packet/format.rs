//! Minimal printf style rendering for item format strings.
use crate::{Error, Result, Value};

#[derive(Debug, Default)]
struct Spec {
    left: bool,
    zero: bool,
    plus: bool,
    space: bool,
    alt: bool,
    width: usize,
    precision: Option<usize>,
    conv: char,
}

fn parse_spec(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, fmt: &str) -> Result<Spec> {
    let mut spec = Spec::default();
    while let Some(&c) = chars.peek() {
        match c {
            '-' => spec.left = true,
            '0' => spec.zero = true,
            '+' => spec.plus = true,
            ' ' => spec.space = true,
            '#' => spec.alt = true,
            _ => break,
        }
        chars.next();
    }
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        spec.width = spec.width * 10 + d as usize;
        chars.next();
    }
    if chars.peek() == Some(&'.') {
        chars.next();
        let mut p = 0usize;
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            p = p * 10 + d as usize;
            chars.next();
        }
        spec.precision = Some(p);
    }
    // length modifiers carry no meaning here
    while matches!(chars.peek(), Some('l' | 'h' | 'q' | 'L')) {
        chars.next();
    }
    spec.conv = chars
        .next()
        .ok_or_else(|| Error::Configuration(format!("incomplete format string {fmt:?}")))?;
    Ok(spec)
}

fn pad(spec: &Spec, body: String, numeric: bool) -> String {
    if body.len() >= spec.width {
        return body;
    }
    let fill = spec.width - body.len();
    if spec.left {
        format!("{body}{}", " ".repeat(fill))
    } else if spec.zero && numeric {
        // zeros go after any sign or radix prefix
        let split = body
            .find(|c: char| c.is_ascii_alphanumeric())
            .unwrap_or(0);
        let (prefix, digits) = body.split_at(split);
        let (prefix, digits) = if digits.starts_with("0x") || digits.starts_with("0X") {
            let (p, d) = digits.split_at(2);
            (format!("{prefix}{p}"), d.to_string())
        } else {
            (prefix.to_string(), digits.to_string())
        };
        format!("{prefix}{}{digits}", "0".repeat(fill))
    } else {
        format!("{}{body}", " ".repeat(fill))
    }
}

fn sign(spec: &Spec, negative: bool) -> &'static str {
    if negative {
        "-"
    } else if spec.plus {
        "+"
    } else if spec.space {
        " "
    } else {
        ""
    }
}

fn format_exp(v: f64, precision: usize, upper: bool) -> String {
    let s = format!("{v:.precision$e}");
    // rust renders 1.5e3, printf renders 1.5e+03
    let (mantissa, exp) = s.split_once('e').unwrap_or((&s, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let e = if upper { 'E' } else { 'e' };
    let exp_sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}{e}{exp_sign}{:02}", exp.abs())
}

#[allow(clippy::cast_possible_truncation)]
fn format_general(v: f64, precision: usize, alt: bool, upper: bool) -> String {
    let p = precision.max(1);
    if v == 0.0 {
        return "0".to_string();
    }
    let exp = v.abs().log10().floor() as i32;
    let s = if exp < -4 || exp >= i32::try_from(p).unwrap_or(i32::MAX) {
        format_exp(v, p - 1, upper)
    } else {
        let decimals = usize::try_from(i32::try_from(p).unwrap_or(0) - 1 - exp).unwrap_or(0);
        format!("{v:.decimals$}")
    };
    if alt {
        return s;
    }
    // strip trailing zeros from the fractional part
    match s.split_once(['e', 'E']) {
        Some((m, e)) if m.contains('.') => {
            let m = m.trim_end_matches('0').trim_end_matches('.');
            format!("{m}{}{e}", if upper { 'E' } else { 'e' })
        }
        None if s.contains('.') => s.trim_end_matches('0').trim_end_matches('.').to_string(),
        _ => s,
    }
}

fn render(spec: &Spec, value: &Value) -> Result<String> {
    let out = match spec.conv {
        'd' | 'i' | 'u' => {
            let v = value.to_i128()?;
            pad(spec, format!("{}{}", sign(spec, v < 0), v.unsigned_abs()), true)
        }
        'x' | 'X' | 'o' | 'b' => {
            let v = value.to_i128()?;
            let mag = v.unsigned_abs();
            let body = match spec.conv {
                'x' => format!("{mag:x}"),
                'X' => format!("{mag:X}"),
                'o' => format!("{mag:o}"),
                _ => format!("{mag:b}"),
            };
            let prefix = match (spec.alt, spec.conv) {
                (true, 'x') => "0x",
                (true, 'X') => "0X",
                (true, 'o') => "0",
                (true, _) => "0b",
                _ => "",
            };
            pad(spec, format!("{}{prefix}{body}", sign(spec, v < 0)), true)
        }
        'f' | 'F' => {
            let v = value.to_f64()?;
            let p = spec.precision.unwrap_or(6);
            pad(spec, format!("{}{:.p$}", sign(spec, v.is_sign_negative()), v.abs()), true)
        }
        'e' | 'E' => {
            let v = value.to_f64()?;
            let body = format_exp(v.abs(), spec.precision.unwrap_or(6), spec.conv == 'E');
            pad(spec, format!("{}{body}", sign(spec, v.is_sign_negative())), true)
        }
        'g' | 'G' => {
            let v = value.to_f64()?;
            let body = format_general(v.abs(), spec.precision.unwrap_or(6), spec.alt, spec.conv == 'G');
            pad(spec, format!("{}{body}", sign(spec, v.is_sign_negative())), true)
        }
        's' => {
            let mut s = value.to_string();
            if let Some(p) = spec.precision {
                s = s.chars().take(p).collect();
            }
            pad(spec, s, false)
        }
        'c' => {
            let c = u32::try_from(value.to_i128()?)
                .ok()
                .and_then(char::from_u32)
                .unwrap_or('?');
            pad(spec, c.to_string(), false)
        }
        other => {
            return Err(Error::Configuration(format!(
                "unsupported format conversion '%{other}'"
            )))
        }
    };
    Ok(out)
}

/// Render `value` with a printf style `fmt`. The first conversion consumes the value,
/// `%%` renders a literal percent.
///
/// # Errors
/// [Error::Configuration] for malformed format strings or values that do not fit the
/// conversion.
pub fn sprintf(fmt: &str, value: &Value) -> Result<String> {
    let mut out = String::with_capacity(fmt.len() + 8);
    let mut chars = fmt.chars().peekable();
    let mut used = false;
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let spec = parse_spec(&mut chars, fmt)?;
        if used {
            return Err(Error::Configuration(format!(
                "format string {fmt:?} has more than one conversion"
            )));
        }
        out.push_str(&render(&spec, value)?);
        used = true;
    }
    Ok(out)
}
