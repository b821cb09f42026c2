//! Evaluates a parsed template against a JSON data tree.

use super::funcs::{self, to_text, truthy};
use super::parse::{Arg, Command, Node, Pipeline};
use crate::error::TemplateError;
use serde_json::Value;
use std::collections::HashMap;

const MAX_INCLUDE_DEPTH: usize = 64;

pub(crate) struct Exec<'a> {
    defines: &'a HashMap<String, Vec<Node>>,
    vars: Vec<(String, Value)>,
    depth: usize,
}

impl<'a> Exec<'a> {
    pub(crate) fn new(defines: &'a HashMap<String, Vec<Node>>) -> Self {
        Self {
            defines,
            vars: Vec::new(),
            depth: 0,
        }
    }

    /// Renders `nodes` with `data` as both `.` and `$`
    pub(crate) fn run(&mut self, nodes: &[Node], data: &Value) -> Result<String, TemplateError> {
        let saved = std::mem::take(&mut self.vars);
        self.vars.push((String::new(), data.clone()));
        let mut out = String::new();
        let result = self.render(nodes, data, &mut out);
        self.vars = saved;
        result.map(|()| out)
    }

    fn render(&mut self, nodes: &[Node], dot: &Value, out: &mut String) -> Result<(), TemplateError> {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Output(pipeline) => {
                    let value = self.pipeline(pipeline, dot)?;
                    if pipeline.decl.is_empty() {
                        out.push_str(&to_text(&value));
                    }
                }
                Node::If { branches, otherwise } => {
                    let scope = self.vars.len();
                    let mut taken = false;
                    for (condition, body) in branches {
                        if truthy(&self.pipeline(condition, dot)?) {
                            self.render(body, dot, out)?;
                            taken = true;
                            break;
                        }
                    }
                    if !taken {
                        self.render(otherwise, dot, out)?;
                    }
                    self.vars.truncate(scope);
                }
                Node::With {
                    pipeline,
                    body,
                    otherwise,
                } => {
                    let scope = self.vars.len();
                    let value = self.pipeline(pipeline, dot)?;
                    if truthy(&value) {
                        self.render(body, &value, out)?;
                    } else {
                        self.render(otherwise, dot, out)?;
                    }
                    self.vars.truncate(scope);
                }
                Node::Range {
                    pipeline,
                    body,
                    otherwise,
                } => self.range(pipeline, body, otherwise, dot, out)?,
                Node::Template { name, data } => {
                    let data = match data {
                        Some(pipeline) => self.pipeline(pipeline, dot)?,
                        None => Value::Null,
                    };
                    out.push_str(&self.include(name, &data)?);
                }
            }
        }
        Ok(())
    }

    fn range(
        &mut self,
        pipeline: &Pipeline,
        body: &[Node],
        otherwise: &[Node],
        dot: &Value,
        out: &mut String,
    ) -> Result<(), TemplateError> {
        let value = self.commands(&pipeline.commands, dot)?;
        let items: Vec<(Value, Value)> = match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| (Value::from(i), item))
                .collect(),
            Value::Object(map) => {
                let mut entries: Vec<(String, Value)> = map.into_iter().collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries.into_iter().map(|(k, v)| (Value::String(k), v)).collect()
            }
            Value::Null => Vec::new(),
            Value::Number(n) => match n.as_u64() {
                Some(count) => (0..count).map(|i| (Value::from(i), Value::from(i))).collect(),
                None => return Err(TemplateError::exec(format!("range can't iterate over {n}"))),
            },
            other => return Err(TemplateError::exec(format!("range can't iterate over {other}"))),
        };

        if items.is_empty() {
            return self.render(otherwise, dot, out);
        }
        for (key, item) in items {
            let scope = self.vars.len();
            match pipeline.decl.as_slice() {
                [index, element] => {
                    self.vars.push((index.clone(), key));
                    self.vars.push((element.clone(), item.clone()));
                }
                [element] => self.vars.push((element.clone(), item.clone())),
                _ => {}
            }
            let result = self.render(body, &item, out);
            self.vars.truncate(scope);
            result?;
        }
        Ok(())
    }

    fn include(&mut self, name: &str, data: &Value) -> Result<String, TemplateError> {
        let nodes = self
            .defines
            .get(name)
            .ok_or_else(|| TemplateError::exec(format!("no template {name:?} defined")))?;
        if self.depth >= MAX_INCLUDE_DEPTH {
            return Err(TemplateError::exec(format!("include of {name:?} exceeded maximum depth")));
        }
        self.depth += 1;
        let result = self.run(nodes, data);
        self.depth -= 1;
        result
    }

    fn pipeline(&mut self, pipeline: &Pipeline, dot: &Value) -> Result<Value, TemplateError> {
        let value = self.commands(&pipeline.commands, dot)?;
        if let Some(name) = pipeline.decl.first() {
            if pipeline.assign {
                let slot = self
                    .vars
                    .iter_mut()
                    .rev()
                    .find(|(n, _)| n == name)
                    .ok_or_else(|| TemplateError::exec(format!("undefined variable ${name}")))?;
                slot.1 = value.clone();
            } else {
                self.vars.push((name.clone(), value.clone()));
            }
        }
        Ok(value)
    }

    fn commands(&mut self, commands: &[Command], dot: &Value) -> Result<Value, TemplateError> {
        let mut piped: Option<Value> = None;
        for command in commands {
            piped = Some(self.command(command, dot, piped)?);
        }
        Ok(piped.unwrap_or(Value::Null))
    }

    fn command(&mut self, command: &Command, dot: &Value, piped: Option<Value>) -> Result<Value, TemplateError> {
        let Some((head, rest)) = command.args.split_first() else {
            return Err(TemplateError::exec("empty command"));
        };
        let Arg::Func(name) = head else {
            if !rest.is_empty() || piped.is_some() {
                return Err(TemplateError::exec("can't give argument to non-function"));
            }
            return self.arg(head, dot);
        };

        let mut args = rest
            .iter()
            .map(|arg| self.arg(arg, dot))
            .collect::<Result<Vec<_>, _>>()?;
        args.extend(piped);
        self.call(name, args)
    }

    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, TemplateError> {
        if name == "include" {
            let [template, data] = args.as_slice() else {
                return Err(TemplateError::exec("include needs a name and data"));
            };
            return self.include(&to_text(template), data).map(Value::String);
        }
        match funcs::call(name, args) {
            Some(result) => result.map_err(|message| TemplateError::exec(format!("{name}: {message}"))),
            None => Err(TemplateError::exec(format!("function {name:?} not defined"))),
        }
    }

    fn arg(&mut self, arg: &Arg, dot: &Value) -> Result<Value, TemplateError> {
        match arg {
            Arg::Dot => Ok(dot.clone()),
            Arg::Field(path) => lookup(dot, path),
            Arg::Var(name, path) => {
                let value = self
                    .vars
                    .iter()
                    .rev()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| TemplateError::exec(format!("undefined variable ${name}")))?;
                lookup(&value, path)
            }
            Arg::Literal(value) => Ok(value.clone()),
            Arg::Func(name) => self.call(name, Vec::new()),
            Arg::Sub(pipeline, path) => {
                let value = self.pipeline(pipeline, dot)?;
                lookup(&value, path)
            }
        }
    }
}

/// Walks `path` from `value`; missing keys and nil intermediates yield nil
fn lookup(value: &Value, path: &[String]) -> Result<Value, TemplateError> {
    let mut current = value;
    for field in path {
        current = match current {
            Value::Object(map) => match map.get(field) {
                Some(next) => next,
                None => return Ok(Value::Null),
            },
            Value::Null => return Ok(Value::Null),
            other => {
                return Err(TemplateError::exec(format!(
                    "can't evaluate field {field} in type {}",
                    type_name(other)
                )));
            }
        };
    }
    Ok(current.clone())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "slice",
        Value::Object(_) => "map",
    }
}
