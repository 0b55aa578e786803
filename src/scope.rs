use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::ast::{
    self, ExprPart, ExprPartKind, ExprSegment, Node, Parameter, SectionNode, Template,
};
use crate::javatypes::{InvalidMethodReason, ResolvedJavaType};
use crate::loopdata::PrefixStrategy;
use crate::resolver::{CacheKey, CacheLookup, TypeResolutionCache};
use crate::sections::SectionKind;
use crate::span::Span;

/// What is known about a bound name's type.
#[derive(Debug, Clone)]
pub enum TypeState {
    Signature(String),
    /// Depends on a lookup still in flight.
    Pending,
    /// Bound, but no type information is derivable.
    Untyped,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub decl: Span,
    pub state: TypeState,
}

#[derive(Debug, Default)]
pub struct Frame {
    pub bindings: HashMap<String, Binding>,
    /// Iteration metadata names visible in this frame (loop sections).
    pub metadata_keys: Vec<String>,
    /// Types whose members are in scope (`#with`).
    pub with_types: Vec<String>,
    /// A `#with` whose object could not be typed: roots below it may be
    /// members we cannot see, so undefined-object reporting is suppressed.
    pub with_unresolved: bool,
}

/// Lexical scope assembled while walking the tree: template-level parameter
/// declarations at the bottom, one frame per enclosing section above.
#[derive(Debug, Default)]
pub struct Scope {
    frames: Vec<Frame>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.bindings.get(name))
    }

    pub fn is_metadata_key(&self, name: &str) -> bool {
        self.frames
            .iter()
            .any(|frame| frame.metadata_keys.iter().any(|key| key == name))
    }

    pub fn metadata_keys(&self) -> impl Iterator<Item = &String> {
        self.frames.iter().flat_map(|frame| frame.metadata_keys.iter())
    }

    pub fn with_types(&self) -> impl Iterator<Item = &String> {
        self.frames.iter().rev().flat_map(|frame| frame.with_types.iter())
    }

    fn any_with_unresolved(&self) -> bool {
        self.frames.iter().any(|frame| frame.with_unresolved)
    }

    /// Every visible binding, innermost shadowing outermost.
    pub fn visible_bindings(&self) -> HashMap<&str, &Binding> {
        let mut visible = HashMap::new();
        for frame in &self.frames {
            for (name, binding) in &frame.bindings {
                visible.insert(name.as_str(), binding);
            }
        }
        visible
    }
}

/// Outcome of resolving a dotted expression chain against the scope and the
/// type cache. Only the variants carrying spans produce diagnostics; the
/// rest degrade to silence or to a recorded pending key.
#[derive(Debug, Clone)]
pub enum ChainResolution {
    Resolved(Arc<ResolvedJavaType>),
    /// No information available; conservative silence.
    Unknown,
    /// One or more lookups are still in flight.
    Pending,
    UndefinedRoot { name: String, span: Span },
    UndefinedNamespace { name: String, span: Span },
    UnknownProperty { type_name: String, part: ExprPart },
    InvalidMethod { reason: InvalidMethodReason, part: ExprPart },
}

/// Namespaces the engine itself understands; `data:` addresses template
/// parameter declarations.
const KNOWN_NAMESPACES: &[&str] = &["data"];

pub struct ResolveCtx<'a> {
    pub project_uri: &'a str,
    pub cache: &'a TypeResolutionCache,
}

impl<'a> ResolveCtx<'a> {
    pub fn new(project_uri: &'a str, cache: &'a TypeResolutionCache) -> Self {
        Self { project_uri, cache }
    }

    /// Cache read recording the key as pending when unsettled.
    fn type_of(&self, signature: &str, pending: &mut HashSet<CacheKey>) -> CacheLookup {
        let key = CacheKey::new(self.project_uri, signature);
        let lookup = self.cache.lookup(&key);
        if matches!(lookup, CacheLookup::Pending) {
            pending.insert(key);
        }
        lookup
    }
}

/// Resolves `namespace:root.part...` left to right. When
/// `resolve_member_type` is set the final part's own type is resolved too
/// (needed for loop-element typing and hover); otherwise resolution stops
/// at membership checking, which is all validation needs.
pub fn resolve_chain(
    namespace: Option<&ExprSegment>,
    parts: &[ExprPart],
    scope: &Scope,
    ctx: &ResolveCtx<'_>,
    pending: &mut HashSet<CacheKey>,
    resolve_member_type: bool,
) -> ChainResolution {
    if let Some(segment) = namespace {
        if !KNOWN_NAMESPACES.contains(&segment.name.as_str()) {
            return ChainResolution::UndefinedNamespace {
                name: segment.name.clone(),
                span: segment.span,
            };
        }
    }
    let Some(root) = parts.first() else {
        return ChainResolution::Unknown;
    };
    if root.kind == ExprPartKind::Literal {
        return ChainResolution::Unknown;
    }

    let mut current: Arc<ResolvedJavaType> = match scope.lookup(&root.name) {
        Some(binding) => match &binding.state {
            TypeState::Untyped => return ChainResolution::Unknown,
            TypeState::Pending => return ChainResolution::Pending,
            TypeState::Signature(signature) => match ctx.type_of(signature, pending) {
                CacheLookup::Pending => return ChainResolution::Pending,
                CacheLookup::Resolved(None) => return ChainResolution::Unknown,
                CacheLookup::Resolved(Some(resolved)) => resolved,
            },
        },
        None => {
            if scope.is_metadata_key(&root.name) {
                return ChainResolution::Unknown;
            }
            match root_via_with(root, scope, ctx, pending) {
                WithLookup::Found(resolved) => resolved,
                WithLookup::Pending => return ChainResolution::Pending,
                WithLookup::Opaque => return ChainResolution::Unknown,
                WithLookup::Absent => {
                    if scope.any_with_unresolved() {
                        return ChainResolution::Unknown;
                    }
                    return ChainResolution::UndefinedRoot {
                        name: root.name.clone(),
                        span: root.span,
                    };
                }
            }
        }
    };

    let mut steps = parts.iter().skip(1).peekable();
    // Roots found through `#with` resume at the member itself; the member
    // type is already `current`, so the loop below starts at the next part.
    while let Some(part) = steps.next() {
        if let Some(reason) = current.invalid_method_reason(&part.name) {
            return ChainResolution::InvalidMethod {
                reason,
                part: part.clone(),
            };
        }
        let Some(member_signature) = current.member_type(&part.name).map(str::to_string) else {
            return ChainResolution::UnknownProperty {
                type_name: current.name.clone(),
                part: part.clone(),
            };
        };
        if steps.peek().is_none() && !resolve_member_type {
            return ChainResolution::Resolved(current);
        }
        match ctx.type_of(&member_signature, pending) {
            CacheLookup::Pending => return ChainResolution::Pending,
            CacheLookup::Resolved(None) => return ChainResolution::Unknown,
            CacheLookup::Resolved(Some(resolved)) => current = resolved,
        }
    }
    ChainResolution::Resolved(current)
}

enum WithLookup {
    Found(Arc<ResolvedJavaType>),
    Pending,
    /// A matching member exists but its type is unavailable.
    Opaque,
    Absent,
}

/// Tries to resolve a root name as a member of an enclosing `#with` object.
fn root_via_with(
    root: &ExprPart,
    scope: &Scope,
    ctx: &ResolveCtx<'_>,
    pending: &mut HashSet<CacheKey>,
) -> WithLookup {
    let mut saw_pending = false;
    for signature in scope.with_types() {
        match ctx.type_of(signature, pending) {
            CacheLookup::Pending => saw_pending = true,
            CacheLookup::Resolved(None) => {}
            CacheLookup::Resolved(Some(with_type)) => {
                if with_type.invalid_method_reason(&root.name).is_some() {
                    // Reported as a property of the with-object elsewhere;
                    // here it simply is not a usable root.
                    continue;
                }
                if let Some(member_signature) = with_type.member_type(&root.name) {
                    let member_signature = member_signature.to_string();
                    return match ctx.type_of(&member_signature, pending) {
                        CacheLookup::Pending => WithLookup::Pending,
                        CacheLookup::Resolved(None) => WithLookup::Opaque,
                        CacheLookup::Resolved(Some(resolved)) => WithLookup::Found(resolved),
                    };
                }
            }
        }
    }
    if saw_pending {
        WithLookup::Pending
    } else {
        WithLookup::Absent
    }
}

/// Builds the scope frame a section contributes to its children.
pub fn frame_for_section(
    section: &SectionNode,
    scope: &Scope,
    prefix: &PrefixStrategy,
    ctx: &ResolveCtx<'_>,
    pending: &mut HashSet<CacheKey>,
) -> Frame {
    let mut frame = Frame::default();
    if section.is_iterable() {
        let decl = section
            .alias_parameter()
            .or_else(|| section.iterable_parameter())
            .map(|parameter| parameter.effective_span())
            .unwrap_or(section.open_tag_span);
        let state = match element_type_of(section, scope, ctx, pending) {
            ElementType::Signature(signature) => TypeState::Signature(signature),
            ElementType::Pending => TypeState::Pending,
            ElementType::Unknown => TypeState::Untyped,
        };
        frame
            .bindings
            .insert(section.loop_alias().to_string(), Binding { decl, state });
        frame.metadata_keys = section.iteration_metadata(prefix).to_vec();
        return frame;
    }
    match section.kind {
        SectionKind::Let | SectionKind::Set => {
            for parameter in &section.parameters {
                let (Some(name), true) = (&parameter.name, parameter.is_named()) else {
                    continue;
                };
                let state = parameter
                    .value
                    .as_deref()
                    .map(|value| {
                        let base = parameter
                            .value_span
                            .map(|span| span.start)
                            .unwrap_or(parameter.span.start);
                        let (namespace, parts) = ast::parse_expression_parts(value, base);
                        match resolve_chain(namespace.as_ref(), &parts, scope, ctx, pending, true)
                        {
                            ChainResolution::Resolved(resolved) => {
                                TypeState::Signature(resolved.signature.clone())
                            }
                            ChainResolution::Pending => TypeState::Pending,
                            _ => TypeState::Untyped,
                        }
                    })
                    .unwrap_or(TypeState::Untyped);
                frame.bindings.insert(
                    name.clone(),
                    Binding {
                        decl: parameter.name_span.unwrap_or(parameter.span),
                        state,
                    },
                );
            }
        }
        SectionKind::With => {
            let object = section
                .parameters
                .first()
                .and_then(|parameter| parameter.effective_value().map(|v| (parameter, v)));
            match object {
                Some((parameter, value)) => {
                    let base = parameter.effective_span().start;
                    let (namespace, parts) = ast::parse_expression_parts(value, base);
                    match resolve_chain(namespace.as_ref(), &parts, scope, ctx, pending, true) {
                        ChainResolution::Resolved(resolved) => {
                            frame.with_types.push(resolved.signature.clone());
                        }
                        _ => frame.with_unresolved = true,
                    }
                }
                None => frame.with_unresolved = true,
            }
        }
        _ => {}
    }
    frame
}

enum ElementType {
    Signature(String),
    Pending,
    Unknown,
}

/// The element type an iterable section binds its alias to.
fn element_type_of(
    section: &SectionNode,
    scope: &Scope,
    ctx: &ResolveCtx<'_>,
    pending: &mut HashSet<CacheKey>,
) -> ElementType {
    let Some(parameter) = section.iterable_parameter() else {
        return ElementType::Unknown;
    };
    let Some(value) = parameter.effective_value() else {
        return ElementType::Unknown;
    };
    let (namespace, parts) =
        ast::parse_expression_parts(value, parameter.effective_span().start);
    match resolve_chain(namespace.as_ref(), &parts, scope, ctx, pending, true) {
        ChainResolution::Resolved(resolved) => match &resolved.iterable_of {
            Some(of) => ElementType::Signature(of.clone()),
            None => ElementType::Unknown,
        },
        ChainResolution::Pending => ElementType::Pending,
        _ => ElementType::Unknown,
    }
}

/// Root frame holding the template's parameter declarations.
pub fn template_frame(template: &Template) -> Frame {
    let mut frame = Frame::default();
    for decl in template.param_declarations() {
        let Some(alias) = &decl.alias else { continue };
        frame.bindings.insert(
            alias.clone(),
            Binding {
                decl: decl.alias_span.unwrap_or(decl.span),
                state: TypeState::Signature(decl.signature.clone()),
            },
        );
    }
    frame
}

/// Assembles the scope in effect at `offset` from the ancestor path — used
/// by completion, hover, and definition, which do not run a full walk.
pub fn scope_at(
    template: &Template,
    offset: usize,
    prefix: &PrefixStrategy,
    ctx: &ResolveCtx<'_>,
    pending: &mut HashSet<CacheKey>,
) -> Scope {
    let mut scope = Scope::new();
    scope.push(template_frame(template));
    for node in template.path_at(offset) {
        if let Node::Section(section) = node {
            let frame = frame_for_section(section, &scope, prefix, ctx, pending);
            scope.push(frame);
        }
    }
    scope
}

/// Convenience used by parameter validation and completion: parse a
/// parameter's value as an expression chain anchored at its span.
pub fn parameter_chain(parameter: &Parameter) -> Option<(Option<ExprSegment>, Vec<ExprPart>)> {
    let value = parameter.effective_value()?;
    Some(ast::parse_expression_parts(
        value,
        parameter.effective_span().start,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::javatypes::ResolvedJavaTypeData;
    use crate::parser::parse;
    use crate::resolver::{ProviderResponse, TypeResolutionProvider};
    use async_trait::async_trait;

    struct StaticProvider;

    #[async_trait]
    impl TypeResolutionProvider for StaticProvider {
        async fn resolved_java_type(
            &self,
            signature: &str,
            _project_uri: &str,
        ) -> ProviderResponse<ResolvedJavaTypeData> {
            match signature {
                "java.util.List<org.acme.Item>" => {
                    ProviderResponse::Resolved(Some(ResolvedJavaTypeData {
                        signature: signature.to_string(),
                        extended_types: vec!["java.lang.Iterable<org.acme.Item>".into()],
                        ..Default::default()
                    }))
                }
                _ => ProviderResponse::Resolved(None),
            }
        }

        async fn java_types(
            &self,
            _pattern: &str,
            _project_uri: &str,
        ) -> ProviderResponse<Vec<crate::javatypes::JavaTypeInfo>> {
            ProviderResponse::Resolved(Some(Vec::new()))
        }
    }

    #[tokio::test]
    async fn loop_alias_binds_the_element_type() {
        let cache = TypeResolutionCache::new(std::sync::Arc::new(StaticProvider));
        cache
            .resolve(CacheKey::new("p", "java.util.List<org.acme.Item>"))
            .await;
        let template =
            parse("{@java.util.List<org.acme.Item> items}{#each items}{it.name}{/each}");
        let ctx = ResolveCtx::new("p", &cache);
        let mut pending = HashSet::new();
        let offset = template.text().find("it.name").expect("offset");
        let scope = scope_at(
            &template,
            offset,
            &PrefixStrategy::AliasUnderscore,
            &ctx,
            &mut pending,
        );
        let binding = scope.lookup("it").expect("alias bound");
        assert!(
            matches!(&binding.state, TypeState::Signature(s) if s == "org.acme.Item"),
            "{:?}",
            binding.state
        );
        assert!(scope.is_metadata_key("it_hasNext"));
        assert!(!scope.is_metadata_key("hasNext"));
    }

    #[tokio::test]
    async fn unresolved_iterable_leaves_alias_untyped_not_undefined() {
        let cache = TypeResolutionCache::new(std::sync::Arc::new(StaticProvider));
        let template = parse("{#each mystery}{it.name}{/each}");
        let ctx = ResolveCtx::new("p", &cache);
        let mut pending = HashSet::new();
        let offset = template.text().find("it.name").expect("offset");
        let scope = scope_at(
            &template,
            offset,
            &PrefixStrategy::AliasUnderscore,
            &ctx,
            &mut pending,
        );
        assert!(matches!(
            scope.lookup("it").map(|b| &b.state),
            Some(TypeState::Untyped)
        ));
    }
}
