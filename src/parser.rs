use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::ast::{
    self, CommentNode, ExpressionNode, Node, OrphanEndTag, ParamDeclarationNode, Parameter,
    SectionNode, Template, TextNode,
};
use crate::condition;
use crate::scanner::{Scanner, Token, TokenKind};
use crate::sections::SectionKind;
use crate::span::Span;

/// Raised when a cancellation token trips mid-parse; the caller gets the
/// signal, never a partially committed tree.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("the operation was cancelled")]
pub struct Canceled;

/// Cooperative cancellation flag threaded through scan/parse/validate calls
/// and polled at statement boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), Canceled> {
        if self.is_cancelled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }
}

static NEXT_TEMPLATE_ID: AtomicU64 = AtomicU64::new(1);

fn next_template_id() -> u64 {
    NEXT_TEMPLATE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Parses template source into a [`Template`]. Never fails: structural
/// faults degrade to auto-closed or flagged nodes.
pub fn parse(text: &str) -> Template {
    match parse_with_cancel(text, &CancelToken::new()) {
        Ok(template) => template,
        // A fresh token cannot be tripped, but degrade defensibly anyway.
        Err(Canceled) => Template::new(next_template_id(), text.to_string(), Vec::new(), Vec::new()),
    }
}

pub fn parse_with_cancel(text: &str, cancel: &CancelToken) -> Result<Template, Canceled> {
    let tokens: Vec<Token> = Scanner::new(text).collect();
    let mut builder = Builder {
        text,
        root: Vec::new(),
        stack: Vec::new(),
        orphans: Vec::new(),
    };

    let mut index = 0usize;
    while index < tokens.len() {
        cancel.check()?;
        let token = tokens[index];
        match token.kind {
            TokenKind::Text => {
                builder.push_node(Node::Text(TextNode { span: token.span }));
                index += 1;
            }
            TokenKind::Comment => {
                builder.push_node(Node::Comment(CommentNode { span: token.span }));
                index += 1;
            }
            TokenKind::StartTagOpen => index = builder.open_tag(&tokens, index),
            TokenKind::EndTagOpen => index = builder.end_tag(&tokens, index),
            TokenKind::StartParamDecl => index = builder.param_declaration(&tokens, index),
            TokenKind::StartExpression => index = builder.expression(&tokens, index),
            TokenKind::Eos => break,
            // Parameter-region tokens are consumed by the grouped handlers
            // above; anything that leaks through is skipped.
            _ => index += 1,
        }
    }

    let end = text.len();
    while !builder.stack.is_empty() {
        builder.close_top(end, None, false);
    }

    Ok(Template::new(
        next_template_id(),
        text.to_string(),
        builder.root,
        builder.orphans,
    ))
}

struct OpenSection {
    tag: String,
    kind: SectionKind,
    parameters: Vec<Parameter>,
    children: Vec<Node>,
    start: usize,
    open_tag_end: usize,
}

struct Builder<'a> {
    text: &'a str,
    root: Vec<Node>,
    stack: Vec<OpenSection>,
    orphans: Vec<OrphanEndTag>,
}

impl<'a> Builder<'a> {
    fn push_node(&mut self, node: Node) {
        let target = match self.stack.last_mut() {
            Some(open) => &mut open.children,
            None => &mut self.root,
        };
        // Adjacent text runs merge into one node so node spans partition the
        // source cleanly.
        if let (Some(Node::Text(last)), Node::Text(text)) = (target.last_mut(), &node) {
            if last.span.end == text.span.start {
                last.span.end = text.span.end;
                return;
            }
        }
        target.push(node);
    }

    /// Closes the section on top of the stack at `end`. `closed` marks a
    /// legal close; implicit closes of block labels and
    /// unterminated-capable kinds are upgraded to legal automatically.
    fn close_top(&mut self, end: usize, close_tag_span: Option<Span>, closed: bool) {
        let Some(open) = self.stack.pop() else {
            return;
        };
        let legal = closed
            || open.kind.is_block_label()
            || open.kind.grammar().allows_unterminated;
        let node = SectionNode::new(
            open.tag,
            open.kind,
            open.parameters,
            open.children,
            Span::new(open.start, end),
            Span::new(open.start, open.open_tag_end),
            close_tag_span,
            false,
            legal,
        );
        self.push_node(Node::Section(node));
    }

    /// Handles `{#tag ...}` through its close brace; returns the next token
    /// index.
    fn open_tag(&mut self, tokens: &[Token], index: usize) -> usize {
        let start = tokens[index].span.start;
        let mut cursor = index + 1;
        let mut tag = String::new();
        if let Some(token) = tokens.get(cursor) {
            if token.kind == TokenKind::TagName {
                tag = token.text(self.text).to_string();
                cursor += 1;
            }
        }
        let kind = SectionKind::from_tag(&tag);

        let (mut parameters, open_tag_end, terminator) = self.collect_parameters(tokens, &mut cursor);
        initialize_parameters(kind, &mut parameters);

        if terminator == Some(TokenKind::StartTagSelfClose) {
            let node = SectionNode::new(
                tag,
                kind,
                parameters,
                Vec::new(),
                Span::new(start, open_tag_end),
                Span::new(start, open_tag_end),
                None,
                true,
                true,
            );
            self.push_node(Node::Section(node));
            return cursor;
        }

        if kind.is_block_label() {
            // A new label terminates a preceding sibling label; both hang
            // off the same control section.
            if self
                .stack
                .last()
                .is_some_and(|open| open.kind.is_block_label())
            {
                self.close_top(start, None, true);
            }
        }

        self.stack.push(OpenSection {
            tag,
            kind,
            parameters,
            children: Vec::new(),
            start,
            open_tag_end,
        });
        cursor
    }

    /// Handles `{/tag}` and the `{/}` shorthand.
    fn end_tag(&mut self, tokens: &[Token], index: usize) -> usize {
        let start = tokens[index].span.start;
        let mut cursor = index + 1;
        let mut tag = String::new();
        if let Some(token) = tokens.get(cursor) {
            if token.kind == TokenKind::EndTagName {
                tag = token.text(self.text).to_string();
                cursor += 1;
            }
        }
        let mut end = tokens[index].span.end;
        loop {
            match tokens.get(cursor) {
                Some(token)
                    if matches!(
                        token.kind,
                        TokenKind::EndTagClose | TokenKind::StartTagClose
                    ) =>
                {
                    end = token.span.end;
                    cursor += 1;
                    break;
                }
                Some(token) if token.kind == TokenKind::Eos => break,
                Some(token) => {
                    end = token.span.end;
                    cursor += 1;
                }
                None => break,
            }
        }
        let close_span = Span::new(start, end);

        if tag.is_empty() {
            // `{/}` closes the innermost section; labels in the way close
            // with it.
            while self
                .stack
                .last()
                .is_some_and(|open| open.kind.is_block_label())
            {
                self.close_top(start, None, true);
            }
            if self.stack.is_empty() {
                self.orphans.push(OrphanEndTag {
                    tag,
                    span: close_span,
                });
            } else {
                self.close_top(end, Some(close_span), true);
            }
            return cursor;
        }

        let matching = self.stack.iter().rposition(|open| open.tag == tag);
        match matching {
            Some(target) => {
                // Auto-close everything the end tag jumps over; only
                // sections that may legally stay open close silently.
                while self.stack.len() > target + 1 {
                    self.close_top(start, None, false);
                }
                self.close_top(end, Some(close_span), true);
            }
            None => self.orphans.push(OrphanEndTag {
                tag,
                span: close_span,
            }),
        }
        cursor
    }

    fn param_declaration(&mut self, tokens: &[Token], index: usize) -> usize {
        let start = tokens[index].span.start;
        let mut cursor = index + 1;
        let mut end = tokens[index].span.end;
        let mut runs: Vec<(Span, String)> = Vec::new();
        loop {
            match tokens.get(cursor) {
                Some(token) => match token.kind {
                    TokenKind::StartTagClose | TokenKind::StartTagSelfClose => {
                        end = token.span.end;
                        cursor += 1;
                        break;
                    }
                    TokenKind::Eos => break,
                    TokenKind::Whitespace | TokenKind::ParameterAssign => {
                        end = token.span.end;
                        cursor += 1;
                    }
                    _ => {
                        runs.push((token.span, token.text(self.text).to_string()));
                        end = token.span.end;
                        cursor += 1;
                    }
                },
                None => break,
            }
        }

        let mut runs = runs.into_iter();
        let (signature_span, signature) = runs
            .next()
            .unwrap_or((Span::new(start + 2, start + 2), String::new()));
        let alias = runs.next();
        self.push_node(Node::ParamDeclaration(ParamDeclarationNode {
            span: Span::new(start, end),
            signature,
            signature_span,
            alias: alias.as_ref().map(|(_, text)| text.clone()),
            alias_span: alias.map(|(span, _)| span),
        }));
        cursor
    }

    fn expression(&mut self, tokens: &[Token], index: usize) -> usize {
        let start = tokens[index].span.start;
        let mut cursor = index + 1;
        let mut content_span = Span::new(start + 1, start + 1);
        if let Some(token) = tokens.get(cursor) {
            if token.kind == TokenKind::ExpressionContent {
                content_span = token.span;
                cursor += 1;
            }
        }
        let mut end = content_span.end;
        if let Some(token) = tokens.get(cursor) {
            if token.kind == TokenKind::EndExpression {
                end = token.span.end;
                cursor += 1;
            }
        }
        let content = content_span.text(self.text);
        let (namespace, parts) = ast::parse_expression_parts(content, content_span.start);
        self.push_node(Node::Expression(ExpressionNode {
            span: Span::new(start, end),
            content_span,
            namespace,
            parts,
        }));
        cursor
    }

    /// Collects the parameter run of an opening tag. Returns the parameters,
    /// the offset just past the tag's terminator, and the terminator kind
    /// (`None` when the tag runs into end of input).
    fn collect_parameters(
        &self,
        tokens: &[Token],
        cursor: &mut usize,
    ) -> (Vec<Parameter>, usize, Option<TokenKind>) {
        let mut parameters = Vec::new();
        let mut end = tokens
            .get(*cursor)
            .map(|t| t.span.start)
            .unwrap_or(self.text.len());
        loop {
            let Some(token) = tokens.get(*cursor) else {
                return (parameters, end, None);
            };
            match token.kind {
                TokenKind::StartTagClose | TokenKind::StartTagSelfClose => {
                    *cursor += 1;
                    return (parameters, token.span.end, Some(token.kind));
                }
                TokenKind::Eos => return (parameters, end, None),
                TokenKind::Whitespace => {
                    end = token.span.end;
                    *cursor += 1;
                }
                TokenKind::ParameterName => {
                    let name_span = token.span;
                    let name = token.text(self.text).to_string();
                    *cursor += 1;
                    let assign = tokens
                        .get(*cursor)
                        .filter(|t| t.kind == TokenKind::ParameterAssign)
                        .copied();
                    if let Some(assign_token) = assign {
                        *cursor += 1;
                        let value = tokens.get(*cursor).filter(|t| {
                            matches!(t.kind, TokenKind::ParameterValue | TokenKind::String)
                        });
                        match value {
                            Some(value_token) => {
                                let value_span = value_token.span;
                                parameters.push(Parameter {
                                    name: Some(name),
                                    value: Some(value_token.text(self.text).to_string()),
                                    span: Span::new(name_span.start, value_span.end),
                                    name_span: Some(name_span),
                                    value_span: Some(value_span),
                                    can_have_expression: false,
                                });
                                end = value_span.end;
                                *cursor += 1;
                            }
                            None => {
                                // Dangling `name=`; keep the name so the
                                // missing value can be diagnosed.
                                parameters.push(Parameter {
                                    name: Some(name),
                                    value: None,
                                    span: Span::new(name_span.start, assign_token.span.end),
                                    name_span: Some(name_span),
                                    value_span: None,
                                    can_have_expression: false,
                                });
                                end = assign_token.span.end;
                            }
                        }
                    } else {
                        parameters.push(Parameter {
                            name: Some(name),
                            value: None,
                            span: name_span,
                            name_span: Some(name_span),
                            value_span: None,
                            can_have_expression: false,
                        });
                        end = name_span.end;
                    }
                }
                TokenKind::String | TokenKind::ParameterValue => {
                    parameters.push(Parameter {
                        name: Some(token.text(self.text).to_string()),
                        value: None,
                        span: token.span,
                        name_span: Some(token.span),
                        value_span: None,
                        can_have_expression: false,
                    });
                    end = token.span.end;
                    *cursor += 1;
                }
                _ => {
                    end = token.span.end;
                    *cursor += 1;
                }
            }
        }
    }
}

/// Assigns per-parameter expression eligibility. Deliberately a second pass
/// over the split parameters: condition-bearing kinds alternate operand and
/// operator classification, loop kinds exempt the alias and keyword slots.
fn initialize_parameters(kind: SectionKind, parameters: &mut Vec<Parameter>) {
    match kind {
        SectionKind::If => {
            let _ = condition::parse_if_condition(parameters);
        }
        SectionKind::Else => {
            // `{#else if ...}` re-enters condition classification after the
            // leading `if` keyword.
            if parameters.first().and_then(|p| p.effective_value()) == Some("if") {
                parameters[0].can_have_expression = false;
                let _ = condition::parse_if_condition(&mut parameters[1..]);
            }
        }
        SectionKind::Is | SectionKind::Case => {
            let _ = condition::parse_case_condition(parameters);
        }
        SectionKind::Each | SectionKind::For => {
            for parameter in parameters.iter_mut() {
                parameter.can_have_expression = true;
            }
            let explicit = parameters.len() >= 3
                && parameters[1].effective_value() == Some("in")
                && !parameters[1].is_named();
            if explicit {
                parameters[0].can_have_expression = false;
                parameters[1].can_have_expression = false;
            }
        }
        SectionKind::With | SectionKind::When | SectionKind::Switch => {
            if let Some(first) = parameters.first_mut() {
                first.can_have_expression = true;
            }
        }
        SectionKind::Set | SectionKind::Let => {
            for parameter in parameters.iter_mut() {
                parameter.can_have_expression = parameter.is_named();
            }
        }
        SectionKind::Include | SectionKind::Insert | SectionKind::Fragment => {}
        SectionKind::Custom => {
            for parameter in parameters.iter_mut() {
                parameter.can_have_expression = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ExprPartKind;

    fn single_section(template: &Template) -> &SectionNode {
        match template.children.first() {
            Some(Node::Section(section)) => section,
            other => panic!("expected a section, got {other:?}"),
        }
    }

    #[test]
    fn each_with_expression_child() {
        let template = parse("{#each items}{it.name}{/each}");
        let section = single_section(&template);
        assert_eq!(section.kind, SectionKind::Each);
        assert_eq!(section.loop_alias(), "it");
        assert_eq!(
            section.iterable_parameter().and_then(|p| p.effective_value()),
            Some("items")
        );
        assert_eq!(section.children.len(), 1);
        let Node::Expression(expr) = &section.children[0] else {
            panic!("expected expression child");
        };
        assert_eq!(template.node_text(expr.content_span), "it.name");
        assert_eq!(expr.parts[0].name, "it");
        assert_eq!(expr.parts[1].name, "name");
    }

    #[test]
    fn if_with_else_block() {
        let template = parse("{#if item.age > 10}old{#else}young{/if}");
        let section = single_section(&template);
        assert_eq!(section.kind, SectionKind::If);
        let (expression, issues) =
            condition::parse_if_condition(&mut section.parameters.clone());
        assert!(issues.is_empty());
        assert_eq!(expression.operands.len(), 2);
        assert_eq!(expression.operands[0].effective_value(), Some("item.age"));
        assert_eq!(expression.operands[1].effective_value(), Some("10"));
        assert_eq!(
            condition::if_operator(section.parameters[1].effective_value().unwrap())
                .map(|op| op.name),
            Some("gt")
        );

        let labels: Vec<&SectionNode> = section
            .children
            .iter()
            .filter_map(|node| match node {
                Node::Section(child) => Some(child),
                _ => None,
            })
            .collect();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].kind, SectionKind::Else);
        assert!(labels[0].closed);
        let Node::Text(text) = &labels[0].children[0] else {
            panic!("expected text in else block");
        };
        assert_eq!(template.node_text(text.span), "young");
    }

    #[test]
    fn unknown_tag_parses_as_custom() {
        let template = parse("{#unknown x=1}{/unknown}");
        let section = single_section(&template);
        assert_eq!(section.kind, SectionKind::Custom);
        assert_eq!(section.tag, "unknown");
        assert!(section.closed);
        assert!(section.parameters[0].can_have_expression);
        assert!(template.orphan_end_tags.is_empty());
    }

    #[test]
    fn when_with_is_and_else_labels() {
        let template = parse("{#when x}{#is gt 10}big{#else}small{/when}");
        let section = single_section(&template);
        assert_eq!(section.kind, SectionKind::When);
        let kinds: Vec<SectionKind> = section
            .children
            .iter()
            .filter_map(|node| match node {
                Node::Section(child) => Some(child.kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![SectionKind::Is, SectionKind::Else]);
    }

    #[test]
    fn else_if_chain_reuses_the_if_classifier() {
        let template = parse("{#if a}1{#else if b > 2}2{#else}3{/if}");
        let section = single_section(&template);
        let elses: Vec<&SectionNode> = section
            .children
            .iter()
            .filter_map(|node| match node {
                Node::Section(child) if child.kind == SectionKind::Else => Some(child),
                _ => None,
            })
            .collect();
        assert_eq!(elses.len(), 2);
        assert_eq!(elses[0].parameters[0].effective_value(), Some("if"));
        assert!(!elses[0].parameters[0].can_have_expression);
        assert!(elses[0].parameters[1].can_have_expression);
        assert!(!elses[0].parameters[2].can_have_expression);
        assert!(elses[1].parameters.is_empty());
    }

    #[test]
    fn empty_end_tag_closes_innermost() {
        let template = parse("{#each items}{#if ok}x{/}{/}");
        let section = single_section(&template);
        assert_eq!(section.kind, SectionKind::Each);
        assert!(section.closed);
        let Node::Section(inner) = &section.children[0] else {
            panic!("expected nested if");
        };
        assert_eq!(inner.kind, SectionKind::If);
        assert!(inner.closed);
    }

    #[test]
    fn set_stays_open_until_scope_end() {
        let template = parse("{#each x}{#set a=1}{name}{/each}done");
        let each = single_section(&template);
        let Node::Section(set) = &each.children[0] else {
            panic!("expected set child");
        };
        assert_eq!(set.kind, SectionKind::Set);
        assert!(set.closed);
        // The expression nests inside the still-open set scope.
        assert!(matches!(set.children[0], Node::Expression(_)));
        assert!(each.closed);
    }

    #[test]
    fn unexpected_end_tag_auto_closes_intervening() {
        let template = parse("{#each items}{#if ok}x{/each}");
        let each = single_section(&template);
        assert!(each.closed);
        let Node::Section(inner) = &each.children[0] else {
            panic!("expected nested if");
        };
        assert_eq!(inner.kind, SectionKind::If);
        assert!(!inner.closed);
    }

    #[test]
    fn orphan_end_tag_is_recorded_not_fatal() {
        let template = parse("text{/if}more");
        assert_eq!(template.orphan_end_tags.len(), 1);
        assert_eq!(template.orphan_end_tags[0].tag, "if");
        assert_eq!(template.children.len(), 2);
    }

    #[test]
    fn param_declaration_node() {
        let template = parse("{@java.util.List<org.acme.Item> items}{items.size}");
        let Node::ParamDeclaration(decl) = &template.children[0] else {
            panic!("expected param declaration");
        };
        assert_eq!(decl.signature, "java.util.List<org.acme.Item>");
        assert_eq!(decl.alias.as_deref(), Some("items"));
    }

    #[test]
    fn literal_expression_root() {
        let template = parse("{1}");
        let Node::Expression(expr) = &template.children[0] else {
            panic!("expected expression");
        };
        assert_eq!(expr.parts[0].kind, ExprPartKind::Literal);
    }

    #[test]
    fn root_spans_partition_the_source() {
        let sources = [
            "{#each items}{it.name}{/each}",
            "a{! c !}b{#if x}y{#else}z{/if}{name}",
            "{#when v}{#is 1}one{#case 2}two{/when}tail",
            "plain text only",
            "{#set a=1}trailing",
        ];
        for source in sources {
            let template = parse(source);
            let mut offset = 0;
            for node in &template.children {
                assert_eq!(node.span().start, offset, "gap in {source:?}");
                offset = node.span().end;
            }
            assert_eq!(offset, source.len(), "missing tail in {source:?}");
        }
    }

    #[test]
    fn nested_children_stay_inside_parents() {
        fn check(nodes: &[Node]) {
            for node in nodes {
                let span = node.span();
                let mut previous_end = span.start;
                for child in node.children() {
                    assert!(span.covers(&child.span()));
                    assert!(child.span().start >= previous_end, "sibling overlap");
                    previous_end = child.span().end;
                }
                check(node.children());
            }
        }
        let template =
            parse("{#each items}{#if it.ok}{it.name}{#else}-{/if}{/each}{#with x}{y}{/with}");
        check(&template.children);
    }

    #[test]
    fn cancellation_propagates() {
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(
            parse_with_cancel("{#if a}b{/if}", &token).err(),
            Some(Canceled)
        );
    }

    #[test]
    fn malformed_inputs_never_panic() {
        for source in [
            "{#",
            "{#if",
            "{#if a",
            "{/",
            "{/if",
            "{@",
            "{@Foo",
            "{!",
            "{#each x}{#each y}",
            "{#else}{/else}",
            "{}{{}}",
        ] {
            let _ = parse(source);
        }
    }
}
