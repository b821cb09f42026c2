//! Builds the node tree from scanned segments.

use super::lexer::{scan, tokenize, Segment, Tok};
use crate::error::TemplateError;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Text(String),
    /// Pipeline whose value is printed (or bound, when it declares a variable)
    Output(Pipeline),
    If {
        branches: Vec<(Pipeline, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
    Range {
        pipeline: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    With {
        pipeline: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    /// `{{ template "name" pipeline }}`
    Template { name: String, data: Option<Pipeline> },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Pipeline {
    /// Variables declared (`:=`) or assigned (`=`) by this pipeline
    pub decl: Vec<String>,
    pub assign: bool,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Command {
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Arg {
    Dot,
    Field(Vec<String>),
    Var(String, Vec<String>),
    Literal(Value),
    Func(String),
    Sub(Box<Pipeline>, Vec<String>),
}

/// A parsed template: its body plus the named templates it defines
#[derive(Debug, Clone, Default)]
pub(crate) struct Parsed {
    pub body: Vec<Node>,
    pub defines: HashMap<String, Vec<Node>>,
}

enum Stop {
    End,
    Else(Vec<Tok>, usize),
    Eof,
}

struct Parser {
    segments: Vec<Segment>,
    pos: usize,
    defines: HashMap<String, Vec<Node>>,
}

pub(crate) fn parse(source: &str) -> Result<Parsed, TemplateError> {
    let mut parser = Parser {
        segments: scan(source)?,
        pos: 0,
        defines: HashMap::new(),
    };
    let (body, stop) = parser.parse_list()?;
    match stop {
        Stop::Eof => Ok(Parsed {
            body,
            defines: parser.defines,
        }),
        Stop::End => Err(TemplateError::parse(parser.current_line(), "unexpected {{end}}")),
        Stop::Else(_, line) => Err(TemplateError::parse(line, "unexpected {{else}}")),
    }
}

impl Parser {
    fn current_line(&self) -> usize {
        self.segments[..self.pos.min(self.segments.len())]
            .iter()
            .rev()
            .find_map(|s| match s {
                Segment::Action { line, .. } => Some(*line),
                Segment::Text(_) => None,
            })
            .unwrap_or(1)
    }

    fn parse_list(&mut self) -> Result<(Vec<Node>, Stop), TemplateError> {
        let mut nodes = Vec::new();
        while let Some(segment) = self.segments.get(self.pos).cloned() {
            self.pos += 1;
            let (body, line) = match segment {
                Segment::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Segment::Action { body, line } => (body, line),
            };

            let toks = tokenize(&body, line)?;
            let keyword = match toks.first() {
                Some(Tok::Ident(word)) => word.as_str(),
                _ => "",
            };
            match keyword {
                "end" => return Ok((nodes, Stop::End)),
                "else" => return Ok((nodes, Stop::Else(toks[1..].to_vec(), line))),
                "if" => nodes.push(self.parse_if(&toks[1..], line)?),
                "range" => {
                    let pipeline = parse_pipeline(&toks[1..], line)?;
                    let (body, otherwise) = self.parse_block_body("range", line)?;
                    nodes.push(Node::Range {
                        pipeline,
                        body,
                        otherwise,
                    });
                }
                "with" => {
                    let pipeline = parse_pipeline(&toks[1..], line)?;
                    let (body, otherwise) = self.parse_block_body("with", line)?;
                    nodes.push(Node::With {
                        pipeline,
                        body,
                        otherwise,
                    });
                }
                "define" => {
                    let name = template_name(&toks, line)?;
                    let (body, stop) = self.parse_list()?;
                    if !matches!(stop, Stop::End) {
                        return Err(TemplateError::parse(line, format!("unclosed define {name:?}")));
                    }
                    self.defines.insert(name, body);
                }
                "template" => {
                    let name = template_name(&toks, line)?;
                    let data = if toks.len() > 2 {
                        Some(parse_pipeline(&toks[2..], line)?)
                    } else {
                        None
                    };
                    nodes.push(Node::Template { name, data });
                }
                _ => nodes.push(Node::Output(parse_pipeline(&toks, line)?)),
            }
        }
        Ok((nodes, Stop::Eof))
    }

    fn parse_if(&mut self, condition: &[Tok], line: usize) -> Result<Node, TemplateError> {
        let mut branches = Vec::new();
        let mut condition = parse_pipeline(condition, line)?;
        loop {
            let (body, stop) = self.parse_list()?;
            branches.push((condition, body));
            match stop {
                Stop::End => {
                    return Ok(Node::If {
                        branches,
                        otherwise: Vec::new(),
                    });
                }
                Stop::Else(rest, else_line) if rest.is_empty() => {
                    let otherwise = self.parse_until_end("if", else_line)?;
                    return Ok(Node::If { branches, otherwise });
                }
                Stop::Else(rest, else_line) if rest.first() == Some(&Tok::Ident("if".to_string())) => {
                    condition = parse_pipeline(&rest[1..], else_line)?;
                }
                Stop::Else(_, else_line) => {
                    return Err(TemplateError::parse(else_line, "unsupported else clause"));
                }
                Stop::Eof => return Err(TemplateError::parse(line, "unclosed if")),
            }
        }
    }

    fn parse_block_body(&mut self, keyword: &str, line: usize) -> Result<(Vec<Node>, Vec<Node>), TemplateError> {
        let (body, stop) = self.parse_list()?;
        match stop {
            Stop::End => Ok((body, Vec::new())),
            Stop::Else(rest, else_line) if rest.is_empty() => {
                let otherwise = self.parse_until_end(keyword, else_line)?;
                Ok((body, otherwise))
            }
            Stop::Else(_, else_line) => Err(TemplateError::parse(
                else_line,
                format!("unsupported else clause in {keyword}"),
            )),
            Stop::Eof => Err(TemplateError::parse(line, format!("unclosed {keyword}"))),
        }
    }

    fn parse_until_end(&mut self, keyword: &str, line: usize) -> Result<Vec<Node>, TemplateError> {
        let (nodes, stop) = self.parse_list()?;
        match stop {
            Stop::End => Ok(nodes),
            Stop::Else(_, else_line) => Err(TemplateError::parse(
                else_line,
                format!("else after else in {keyword}"),
            )),
            Stop::Eof => Err(TemplateError::parse(line, format!("unclosed {keyword}"))),
        }
    }
}

fn template_name(toks: &[Tok], line: usize) -> Result<String, TemplateError> {
    match toks.get(1) {
        Some(Tok::Literal(Value::String(name))) => Ok(name.clone()),
        _ => Err(TemplateError::parse(line, "expected quoted template name")),
    }
}

fn parse_pipeline(toks: &[Tok], line: usize) -> Result<Pipeline, TemplateError> {
    let mut stream = TokStream { toks, pos: 0, line };
    let pipeline = stream.pipeline()?;
    if stream.pos < toks.len() {
        return Err(TemplateError::parse(line, format!("unexpected {:?} in action", toks[stream.pos])));
    }
    Ok(pipeline)
}

struct TokStream<'a> {
    toks: &'a [Tok],
    pos: usize,
    line: usize,
}

impl TokStream<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn declarations(&mut self) -> (Vec<String>, bool) {
        // `$x :=`, `$x =` or `$i, $v :=`
        let rest = &self.toks[self.pos..];
        match rest {
            [Tok::Var(name, f), Tok::Declare, ..] if f.is_empty() => {
                self.pos += 2;
                (vec![name.clone()], false)
            }
            [Tok::Var(name, f), Tok::Assign, ..] if f.is_empty() => {
                self.pos += 2;
                (vec![name.clone()], true)
            }
            [Tok::Var(first, f1), Tok::Comma, Tok::Var(second, f2), Tok::Declare, ..]
                if f1.is_empty() && f2.is_empty() =>
            {
                self.pos += 4;
                (vec![first.clone(), second.clone()], false)
            }
            _ => (Vec::new(), false),
        }
    }

    fn pipeline(&mut self) -> Result<Pipeline, TemplateError> {
        let (decl, assign) = self.declarations();
        let mut commands = vec![self.command()?];
        while self.peek() == Some(&Tok::Pipe) {
            self.pos += 1;
            commands.push(self.command()?);
        }
        Ok(Pipeline {
            decl,
            assign,
            commands,
        })
    }

    fn command(&mut self) -> Result<Command, TemplateError> {
        let mut args = Vec::new();
        while let Some(tok) = self.peek() {
            if matches!(tok, Tok::Pipe | Tok::RParen(_)) {
                break;
            }
            args.push(self.operand()?);
        }
        if args.is_empty() {
            return Err(TemplateError::parse(self.line, "missing value for command"));
        }
        Ok(Command { args })
    }

    fn operand(&mut self) -> Result<Arg, TemplateError> {
        let Some(tok) = self.toks.get(self.pos).cloned() else {
            return Err(TemplateError::parse(self.line, "unexpected end of action"));
        };
        self.pos += 1;
        match tok {
            Tok::Dot => Ok(Arg::Dot),
            Tok::Field(fields) => Ok(Arg::Field(fields)),
            Tok::Var(name, fields) => Ok(Arg::Var(name, fields)),
            Tok::Literal(value) => Ok(Arg::Literal(value)),
            Tok::Ident(name) => Ok(Arg::Func(name)),
            Tok::LParen => {
                let inner = self.pipeline()?;
                match self.toks.get(self.pos) {
                    Some(Tok::RParen(fields)) => {
                        self.pos += 1;
                        Ok(Arg::Sub(Box::new(inner), fields.clone()))
                    }
                    _ => Err(TemplateError::parse(self.line, "unclosed left paren")),
                }
            }
            other => Err(TemplateError::parse(self.line, format!("unexpected {other:?} in operand"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_if_else_chain() {
        let parsed = parse("{{ if .a }}A{{ else if .b }}B{{ else }}C{{ end }}").unwrap();
        let [Node::If { branches, otherwise }] = parsed.body.as_slice() else {
            panic!("expected a single if node, got {:?}", parsed.body);
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(otherwise, &vec![Node::Text("C".into())]);
    }

    #[test]
    fn test_parse_collects_defines() {
        let parsed = parse(r#"{{ define "x.name" }}n{{ end }}body"#).unwrap();
        assert!(parsed.defines.contains_key("x.name"));
        assert_eq!(parsed.body, vec![Node::Text("body".into())]);
    }

    #[test]
    fn test_parse_range_declarations() {
        let parsed = parse("{{ range $i, $v := .items }}{{ $v }}{{ end }}").unwrap();
        let [Node::Range { pipeline, .. }] = parsed.body.as_slice() else {
            panic!("expected range");
        };
        assert_eq!(pipeline.decl, vec!["i".to_string(), "v".to_string()]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse("{{ if .a }}x"), Err(TemplateError::Parse { .. })));
        assert!(matches!(parse("{{ end }}"), Err(TemplateError::Parse { .. })));
        assert!(matches!(parse("{{ (.a }}"), Err(TemplateError::Parse { .. })));
        assert!(matches!(parse("{{ .a | }}"), Err(TemplateError::Parse { .. })));
    }
}
