use std::collections::HashMap;

use rust_lapper::{Interval, Lapper};

use crate::ast::{ExprPart, ExprPartKind, Node, Template};
use crate::scope::parameter_chain;
use crate::sections::SectionKind;
use crate::span::Span;

/// Maps expression-root references to the declaration that binds them:
/// parameter-declaration aliases, loop aliases, and `#let`/`#set` names.
/// Built once per parse; queried by definition and highlight requests.
#[derive(Debug)]
pub struct DefinitionIndex {
    references: Lapper<usize, Span>,
}

impl DefinitionIndex {
    pub fn build(template: &Template) -> Self {
        let mut intervals: Vec<Interval<usize, Span>> = Vec::new();
        let mut frames: Vec<HashMap<String, Span>> = Vec::new();

        let mut root = HashMap::new();
        for decl in template.param_declarations() {
            if let (Some(alias), Some(span)) = (&decl.alias, decl.alias_span) {
                root.insert(alias.clone(), span);
            }
        }
        frames.push(root);

        collect(&template.children, &mut frames, &mut intervals);
        Self {
            references: Lapper::new(intervals),
        }
    }

    /// The reference interval under `offset` and its declaration span.
    pub fn definition_at(&self, offset: usize) -> Option<(Span, Span)> {
        self.references
            .find(offset, offset + 1)
            .next()
            .map(|interval| (Span::new(interval.start, interval.stop), interval.val))
    }
}

fn lookup(frames: &[HashMap<String, Span>], name: &str) -> Option<Span> {
    frames.iter().rev().find_map(|frame| frame.get(name).copied())
}

fn reference(
    part: &ExprPart,
    frames: &[HashMap<String, Span>],
    intervals: &mut Vec<Interval<usize, Span>>,
) {
    if part.kind != ExprPartKind::Object || part.span.is_empty() {
        return;
    }
    if let Some(decl) = lookup(frames, &part.name) {
        intervals.push(Interval {
            start: part.span.start,
            stop: part.span.end,
            val: decl,
        });
    }
}

fn collect(
    nodes: &[Node],
    frames: &mut Vec<HashMap<String, Span>>,
    intervals: &mut Vec<Interval<usize, Span>>,
) {
    for node in nodes {
        match node {
            Node::Expression(expression) => {
                if let Some(part) = expression.parts.first() {
                    reference(part, frames, intervals);
                }
            }
            Node::Section(section) => {
                // Parameter expressions resolve in the outer scope, before
                // the section's own bindings exist.
                for parameter in &section.parameters {
                    if !parameter.can_have_expression {
                        continue;
                    }
                    if let Some((_, parts)) = parameter_chain(parameter) {
                        if let Some(part) = parts.first() {
                            reference(part, frames, intervals);
                        }
                    }
                }

                let mut frame = HashMap::new();
                if section.is_iterable() {
                    let decl = section
                        .alias_parameter()
                        .and_then(|parameter| parameter.name_span)
                        .unwrap_or(section.open_tag_span);
                    frame.insert(section.loop_alias().to_string(), decl);
                }
                if matches!(section.kind, SectionKind::Let | SectionKind::Set) {
                    for parameter in &section.parameters {
                        if let (Some(name), Some(span), true) =
                            (&parameter.name, parameter.name_span, parameter.is_named())
                        {
                            frame.insert(name.clone(), span);
                        }
                    }
                }
                frames.push(frame);
                collect(&section.children, frames, intervals);
                frames.pop();
            }
            _ => {}
        }
    }
}
