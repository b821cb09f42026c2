//! Splits template text into literal text and `{{ }}` actions, and tokenizes
//! action bodies.

use crate::error::TemplateError;
use serde_json::Value;

/// Literal text or the body of one action
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    Text(String),
    Action { body: String, line: usize },
}

/// Token inside an action
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    /// `.` on its own
    Dot,
    /// `.a.b.c`
    Field(Vec<String>),
    /// `$name.a.b` (`$` alone has an empty name)
    Var(String, Vec<String>),
    Literal(Value),
    Pipe,
    LParen,
    /// `)` optionally followed directly by a field chain: `(expr).a.b`
    RParen(Vec<String>),
    Declare,
    Assign,
    Comma,
}

/// Splits `source` into segments, applying `{{-` / `-}}` trim markers and
/// dropping `{{/* comments */}}`
pub(crate) fn scan(source: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut line = 1;
    let mut trim_next = false;

    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let trim_left = after_open.starts_with('-') && after_open[1..].starts_with(char::is_whitespace);

        let mut text = &rest[..start];
        if trim_next {
            text = text.trim_start();
        }
        if trim_left {
            text = text.trim_end();
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text.to_string()));
        }
        line += rest[..start].matches('\n').count();

        let inner = if trim_left { &after_open[1..] } else { after_open };
        let close = find_close(inner).ok_or_else(|| TemplateError::parse(line, "unclosed action"))?;
        let raw = &inner[..close];
        let trim_right = raw.ends_with('-') && raw[..raw.len() - 1].ends_with(char::is_whitespace);
        let body = if trim_right { &raw[..raw.len() - 1] } else { raw }.trim();

        if !(body.starts_with("/*") && body.ends_with("*/")) {
            segments.push(Segment::Action {
                body: body.to_string(),
                line,
            });
        }

        line += raw.matches('\n').count();
        rest = &inner[close + 2..];
        trim_next = trim_right;
    }

    let text = if trim_next { rest.trim_start() } else { rest };
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
    Ok(segments)
}

/// Byte offset of the `}}` closing the action, skipping quoted strings
fn find_close(inner: &str) -> Option<usize> {
    let bytes = inner.as_bytes();
    let mut i = 0;
    let mut quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(b'"') if b == b'\\' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'`' => quote = Some(b),
            None if b == b'}' && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Tokenizes one action body
pub(crate) fn tokenize(body: &str, line: usize) -> Result<Vec<Tok>, TemplateError> {
    let chars: Vec<char> = body.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;

    // Reads `.a.b.c` starting at a '.'; returns the segments
    let read_fields = |i: &mut usize| -> Vec<String> {
        let mut fields = Vec::new();
        while *i < chars.len() && chars[*i] == '.' && chars.get(*i + 1).is_some_and(|c| is_ident_start(*c)) {
            *i += 1;
            let start = *i;
            while *i < chars.len() && is_ident_char(chars[*i]) {
                *i += 1;
            }
            fields.push(chars[start..*i].iter().collect());
        }
        fields
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                toks.push(Tok::Pipe);
                i += 1;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                i += 1;
                toks.push(Tok::RParen(read_fields(&mut i)));
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&'=') => {
                toks.push(Tok::Declare);
                i += 2;
            }
            '=' => {
                toks.push(Tok::Assign);
                i += 1;
            }
            '.' => {
                let fields = read_fields(&mut i);
                if fields.is_empty() {
                    toks.push(Tok::Dot);
                    i += 1;
                } else {
                    toks.push(Tok::Field(fields));
                }
            }
            '$' => {
                i += 1;
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                toks.push(Tok::Var(name, read_fields(&mut i)));
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    let Some(&c) = chars.get(i) else {
                        return Err(TemplateError::parse(line, "unterminated quoted string"));
                    };
                    i += 1;
                    match c {
                        '"' => break,
                        '\\' => {
                            let escaped = chars
                                .get(i)
                                .ok_or_else(|| TemplateError::parse(line, "unterminated quoted string"))?;
                            i += 1;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => *other,
                            });
                        }
                        c => s.push(c),
                    }
                }
                toks.push(Tok::Literal(Value::String(s)));
            }
            '`' => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '`' {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(TemplateError::parse(line, "unterminated raw string"));
                }
                toks.push(Tok::Literal(Value::String(chars[start..i].iter().collect())));
                i += 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                toks.push(Tok::Literal(parse_number(&text, line)?));
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                toks.push(match word.as_str() {
                    "true" => Tok::Literal(Value::Bool(true)),
                    "false" => Tok::Literal(Value::Bool(false)),
                    "nil" => Tok::Literal(Value::Null),
                    _ => Tok::Ident(word),
                });
            }
            other => {
                return Err(TemplateError::parse(line, format!("unexpected character {other:?} in action")));
            }
        }
    }
    Ok(toks)
}

fn parse_number(text: &str, line: usize) -> Result<Value, TemplateError> {
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::from(n));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| TemplateError::parse(line, format!("bad number syntax: {text}")))
}
