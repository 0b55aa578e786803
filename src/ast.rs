use once_cell::sync::OnceCell;

use crate::loopdata::{self, PrefixStrategy};
use crate::sections::{SectionGrammar, SectionKind, DEFAULT_LOOP_ALIAS};
use crate::span::Span;

/// A parsed template: the root of the node forest plus the source it was
/// built from. Rebuilt from scratch on every edit; nodes are immutable once
/// built and dropped in bulk on the next parse.
#[derive(Debug)]
pub struct Template {
    /// Registry handle for the owning document; nodes never hold back
    /// references, lookups go through the template at hand.
    pub id: u64,
    text: String,
    pub children: Vec<Node>,
    /// End tags that matched no open section, kept for diagnostics.
    pub orphan_end_tags: Vec<OrphanEndTag>,
}

#[derive(Debug, Clone)]
pub struct OrphanEndTag {
    pub tag: String,
    pub span: Span,
}

impl Template {
    pub fn new(id: u64, text: String, children: Vec<Node>, orphan_end_tags: Vec<OrphanEndTag>) -> Self {
        Self {
            id,
            text,
            children,
            orphan_end_tags,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn node_text(&self, span: Span) -> &str {
        span.text(&self.text)
    }

    /// Ancestor chain of nodes containing `offset`, outermost first. Empty
    /// when the offset falls in root-level text that produced no node.
    pub fn path_at(&self, offset: usize) -> Vec<&Node> {
        let mut path = Vec::new();
        let mut nodes: &[Node] = &self.children;
        while let Some(child) = pick_node(nodes, offset) {
            path.push(child);
            nodes = child.children();
        }
        path
    }

    pub fn node_at(&self, offset: usize) -> Option<&Node> {
        self.path_at(offset).last().copied()
    }

    /// Top-level parameter declarations, in source order.
    pub fn param_declarations(&self) -> impl Iterator<Item = &ParamDeclarationNode> {
        self.children.iter().filter_map(|node| match node {
            Node::ParamDeclaration(decl) => Some(decl),
            _ => None,
        })
    }

    /// Distinct custom tag names used anywhere in the template.
    pub fn custom_tags(&self) -> Vec<&str> {
        let mut tags = Vec::new();
        collect_custom_tags(&self.children, &mut tags);
        tags.sort_unstable();
        tags.dedup();
        tags
    }
}

fn pick_node(nodes: &[Node], offset: usize) -> Option<&Node> {
    nodes
        .iter()
        .find(|node| node.span().contains(offset))
        .or_else(|| {
            // Cursor at the very end of a construct (end of document, or
            // right after an unterminated tag) still selects it.
            nodes
                .iter()
                .rev()
                .find(|node| node.span().contains_inclusive(offset))
        })
}

fn collect_custom_tags<'t>(nodes: &'t [Node], tags: &mut Vec<&'t str>) {
    for node in nodes {
        if let Node::Section(section) = node {
            if section.kind == SectionKind::Custom {
                tags.push(section.tag.as_str());
            }
            collect_custom_tags(&section.children, tags);
        }
    }
}

/// Tagged union of template constructs. Children are owned exclusively by
/// their parent; the tree has no cycles.
#[derive(Debug)]
pub enum Node {
    Text(TextNode),
    Comment(CommentNode),
    Expression(ExpressionNode),
    ParamDeclaration(ParamDeclarationNode),
    Section(SectionNode),
}

impl Node {
    pub fn span(&self) -> Span {
        match self {
            Node::Text(node) => node.span,
            Node::Comment(node) => node.span,
            Node::Expression(node) => node.span,
            Node::ParamDeclaration(node) => node.span,
            Node::Section(node) => node.span,
        }
    }

    pub fn children(&self) -> &[Node] {
        match self {
            Node::Section(section) => &section.children,
            _ => &[],
        }
    }
}

#[derive(Debug)]
pub struct TextNode {
    pub span: Span,
}

#[derive(Debug)]
pub struct CommentNode {
    pub span: Span,
}

/// A standalone `{...}` output expression.
#[derive(Debug)]
pub struct ExpressionNode {
    pub span: Span,
    /// The text between the braces.
    pub content_span: Span,
    pub namespace: Option<ExprSegment>,
    /// The dotted chain, root first. Empty for expressions the part parser
    /// could not shape (kept conservative rather than guessed).
    pub parts: Vec<ExprPart>,
}

impl ExpressionNode {
    pub fn part_at(&self, offset: usize) -> Option<(usize, &ExprPart)> {
        self.parts
            .iter()
            .enumerate()
            .find(|(_, part)| part.span.contains_inclusive(offset))
    }
}

#[derive(Debug, Clone)]
pub struct ExprSegment {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ExprPart {
    pub name: String,
    pub span: Span,
    pub kind: ExprPartKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprPartKind {
    /// The root of the chain, resolved against the surrounding scope.
    Object,
    /// A literal root (`{1}`, `{'s'}`, `{true}`); never validated.
    Literal,
    Property,
    /// A part written as a call, e.g. `getName()`.
    Method,
}

/// A `{@signature alias}` parameter declaration binding a template alias to
/// a host type.
#[derive(Debug)]
pub struct ParamDeclarationNode {
    pub span: Span,
    pub signature: String,
    pub signature_span: Span,
    pub alias: Option<String>,
    pub alias_span: Option<Span>,
}

/// A named or positional argument inside a section's opening tag.
#[derive(Debug, Clone)]
pub struct Parameter {
    /// For a positional parameter the bare token lands here.
    pub name: Option<String>,
    pub value: Option<String>,
    pub span: Span,
    pub name_span: Option<Span>,
    pub value_span: Option<Span>,
    pub can_have_expression: bool,
}

impl Parameter {
    pub fn is_named(&self) -> bool {
        self.name.is_some() && self.value.is_some()
    }

    /// The token validation treats as the parameter's value: the value of a
    /// named parameter, the bare token of a positional one.
    pub fn effective_value(&self) -> Option<&str> {
        self.value.as_deref().or(self.name.as_deref())
    }

    pub fn effective_span(&self) -> Span {
        self.value_span.or(self.name_span).unwrap_or(self.span)
    }
}

/// A `{#tag ...}...{/tag}` structural construct.
#[derive(Debug)]
pub struct SectionNode {
    pub tag: String,
    pub kind: SectionKind,
    pub parameters: Vec<Parameter>,
    pub children: Vec<Node>,
    /// Whole section range, open tag through close tag (or scope end).
    pub span: Span,
    pub open_tag_span: Span,
    pub close_tag_span: Option<Span>,
    pub self_closed: bool,
    /// True when the section was closed explicitly or by a rule that allows
    /// implicit closing (block labels, unterminated-capable kinds).
    pub closed: bool,
    metadata: OnceCell<Vec<String>>,
}

impl SectionNode {
    pub fn new(
        tag: String,
        kind: SectionKind,
        parameters: Vec<Parameter>,
        children: Vec<Node>,
        span: Span,
        open_tag_span: Span,
        close_tag_span: Option<Span>,
        self_closed: bool,
        closed: bool,
    ) -> Self {
        Self {
            tag,
            kind,
            parameters,
            children,
            span,
            open_tag_span,
            close_tag_span,
            self_closed,
            closed,
            metadata: OnceCell::new(),
        }
    }

    pub fn grammar(&self) -> &'static SectionGrammar {
        self.kind.grammar()
    }

    pub fn is_iterable(&self) -> bool {
        self.grammar().iterable
    }

    /// Whether the parameters use the explicit `alias in iterable` form.
    fn has_explicit_alias(&self) -> bool {
        self.parameters.len() >= 3
            && self.parameters[1].effective_value() == Some("in")
            && !self.parameters[1].is_named()
    }

    /// The loop variable bound inside an iterable section. Tolerates both
    /// the one-parameter shorthand and the explicit three-parameter form.
    pub fn loop_alias(&self) -> &str {
        if self.has_explicit_alias() {
            if let Some(alias) = self.parameters[0].effective_value() {
                return alias;
            }
        }
        DEFAULT_LOOP_ALIAS
    }

    /// The parameter declaring the alias, when the explicit form is used.
    pub fn alias_parameter(&self) -> Option<&Parameter> {
        if self.has_explicit_alias() {
            self.parameters.first()
        } else {
            None
        }
    }

    /// The parameter holding the iterated expression.
    pub fn iterable_parameter(&self) -> Option<&Parameter> {
        if self.has_explicit_alias() {
            self.parameters.get(2)
        } else {
            self.parameters.first()
        }
    }

    pub fn named_parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|param| param.is_named() && param.name.as_deref() == Some(name))
    }

    /// The synthetic per-iteration variable names exposed to children,
    /// computed once per section instance (first writer wins) since
    /// completion and validation may query concurrently.
    pub fn iteration_metadata(&self, strategy: &PrefixStrategy) -> &[String] {
        self.metadata
            .get_or_init(|| loopdata::metadata_keys(self.loop_alias(), strategy))
    }
}

/// Splits expression content into an optional namespace and a dotted part
/// chain. Depth and quote tracking keep `get('a.b')` or `items[0]` intact;
/// anything after a top-level space (infix operators, ternaries) is left
/// unvalidated rather than guessed at.
pub(crate) fn parse_expression_parts(
    content: &str,
    base: usize,
) -> (Option<ExprSegment>, Vec<ExprPart>) {
    let bytes = content.as_bytes();
    let mut chain_end = bytes.len();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut colon: Option<usize> = None;
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let ch = bytes[cursor];
        if let Some(q) = quote {
            if ch == b'\\' {
                cursor += 2;
                continue;
            }
            if ch == q {
                quote = None;
            }
            cursor += 1;
            continue;
        }
        match ch {
            b'"' | b'\'' => quote = Some(ch),
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b':' if depth == 0 && colon.is_none() && !content[..cursor].contains('.') => {
                colon = Some(cursor);
            }
            ch if ch.is_ascii_whitespace() && depth == 0 => {
                chain_end = cursor;
                break;
            }
            _ => {}
        }
        cursor += 1;
    }

    let namespace = colon.filter(|&c| c > 0 && c < chain_end).map(|c| ExprSegment {
        name: content[..c].to_string(),
        span: Span::new(base, base + c),
    });
    let chain_start = colon.filter(|&c| c < chain_end).map(|c| c + 1).unwrap_or(0);
    let chain = &content[chain_start..chain_end];

    let mut parts = Vec::new();
    let mut part_start = 0usize;
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let chain_bytes = chain.as_bytes();
    let mut cursor = 0usize;
    let push_part = |parts: &mut Vec<ExprPart>, start: usize, end: usize| {
        let name = chain[start..end].trim();
        if name.is_empty() {
            return;
        }
        let kind = if parts.is_empty() {
            if is_literal(name) {
                ExprPartKind::Literal
            } else {
                ExprPartKind::Object
            }
        } else if name.contains('(') {
            ExprPartKind::Method
        } else {
            ExprPartKind::Property
        };
        parts.push(ExprPart {
            name: name.to_string(),
            span: Span::new(base + chain_start + start, base + chain_start + end),
            kind,
        });
    };
    while cursor < chain_bytes.len() {
        let ch = chain_bytes[cursor];
        if let Some(q) = quote {
            if ch == b'\\' {
                cursor += 2;
                continue;
            }
            if ch == q {
                quote = None;
            }
            cursor += 1;
            continue;
        }
        match ch {
            b'"' | b'\'' => quote = Some(ch),
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            b'.' if depth == 0 => {
                push_part(&mut parts, part_start, cursor);
                part_start = cursor + 1;
            }
            _ => {}
        }
        cursor += 1;
    }
    push_part(&mut parts, part_start, chain.len());

    // A literal root has no members to validate; drop the tail so nothing
    // downstream reasons about `'str'.length` style chains.
    if parts
        .first()
        .is_some_and(|part| part.kind == ExprPartKind::Literal)
    {
        parts.truncate(1);
    }

    (namespace, parts)
}

fn is_literal(name: &str) -> bool {
    matches!(name, "true" | "false" | "null")
        || name.starts_with(|c: char| c.is_ascii_digit() || c == '\'' || c == '"' || c == '-')
}
