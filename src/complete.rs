use std::collections::{HashMap, HashSet};

use tower_lsp::lsp_types::{CompletionItem, CompletionItemKind};

use crate::ast::{self, Node, SectionNode, Template};
use crate::condition::{self, CASE_OPERATORS, IF_OPERATORS};
use crate::resolver::{CacheLookup, CacheKey, TypeResolutionCache};
use crate::scope::{self, ChainResolution, ResolveCtx};
use crate::sections::{SectionKind, DECLARED_KINDS};
use crate::settings::QuteSettings;

/// Computes completions for the cursor offset, purely from the AST and
/// whatever type data is already cached. In-flight lookups are never
/// awaited; they simply yield fewer suggestions this round.
pub fn complete(
    template: &Template,
    offset: usize,
    project_uri: &str,
    cache: &TypeResolutionCache,
    settings: &QuteSettings,
) -> Vec<CompletionItem> {
    let mut items: HashMap<String, CompletionItem> = HashMap::new();
    let path = template.path_at(offset);
    let ctx = ResolveCtx::new(project_uri, cache);

    // A just-typed `{` is still a text token until content follows; the
    // cursor right behind one is an expression-root position.
    let bytes = template.text().as_bytes();
    if offset >= 1
        && bytes.get(offset - 1) == Some(&b'{')
        && !matches!(
            bytes.get(offset).copied(),
            Some(b'{' | b'#' | b'/' | b'@' | b'!')
        )
    {
        add_scope_roots(&mut items, template, offset, &ctx, settings);
        let mut results: Vec<CompletionItem> = items.into_values().collect();
        results.sort_by(|a, b| a.label.cmp(&b.label));
        return results;
    }

    // Otherwise the innermost node decides the context.
    match path.last() {
        Some(Node::Section(section)) if section.open_tag_span.contains_inclusive(offset) => {
            let tag_name_end = section.open_tag_span.start + 2 + section.tag.len();
            if offset <= tag_name_end {
                add_tag_completions(&mut items, template);
            } else {
                add_parameter_completions(&mut items, template, section, offset, &ctx, settings);
            }
        }
        Some(Node::Expression(expression)) => {
            let content = template.node_text(expression.content_span);
            let relative = offset.saturating_sub(expression.content_span.start);
            add_expression_completions(
                &mut items,
                template,
                content,
                relative,
                expression.content_span.start,
                offset,
                &ctx,
                settings,
            );
        }
        Some(Node::ParamDeclaration(decl)) if decl.signature_span.contains_inclusive(offset) => {
            add_type_completions(&mut items, &decl.signature, project_uri, cache);
        }
        _ => {}
    }

    let mut results: Vec<CompletionItem> = items.into_values().collect();
    results.sort_by(|a, b| a.label.cmp(&b.label));
    results
}

fn insert(items: &mut HashMap<String, CompletionItem>, item: CompletionItem) {
    // Keyed by label: the same label is never emitted twice for one context.
    items.entry(item.label.clone()).or_insert(item);
}

fn simple(label: impl Into<String>, kind: CompletionItemKind, detail: &str) -> CompletionItem {
    CompletionItem {
        label: label.into(),
        kind: Some(kind),
        detail: Some(detail.to_string()),
        ..CompletionItem::default()
    }
}

/// All declared section tags plus user tags already used in this template.
fn add_tag_completions(items: &mut HashMap<String, CompletionItem>, template: &Template) {
    for kind in DECLARED_KINDS {
        let Some(tag) = kind.tag() else { continue };
        insert(
            items,
            simple(tag, CompletionItemKind::KEYWORD, kind.grammar().doc),
        );
    }
    for tag in template.custom_tags() {
        if tag.is_empty() {
            continue;
        }
        insert(items, simple(tag, CompletionItemKind::FUNCTION, "User tag"));
    }
}

fn add_parameter_completions(
    items: &mut HashMap<String, CompletionItem>,
    template: &Template,
    section: &SectionNode,
    offset: usize,
    ctx: &ResolveCtx<'_>,
    settings: &QuteSettings,
) {
    // A dotted chain under the cursor asks for members, whatever the slot.
    if let Some(parameter) = section
        .parameters
        .iter()
        .find(|parameter| parameter.span.contains_inclusive(offset))
    {
        if parameter.can_have_expression {
            let span = parameter.effective_span();
            if offset > span.start && offset <= span.end {
                let typed = &template.text()[span.start..offset];
                if let Some(dot) = typed.rfind('.') {
                    add_chain_members(items, template, &typed[..dot], span.start, offset, ctx, settings);
                    return;
                }
            }
        }
    }

    // Parameters fully typed before the cursor fix the position index.
    let position = section
        .parameters
        .iter()
        .filter(|parameter| parameter.span.end < offset)
        .count();

    match section.kind {
        SectionKind::If => {
            if position % 2 == 1 {
                add_if_operators(items);
            } else {
                add_scope_roots(items, template, offset, ctx, settings);
            }
        }
        SectionKind::Else => {
            // Operators only make sense in an `{#else if ...}` chain.
            if section.parameters.first().and_then(|p| p.effective_value()) == Some("if") {
                if position % 2 == 0 {
                    add_if_operators(items);
                } else {
                    add_scope_roots(items, template, offset, ctx, settings);
                }
            }
        }
        SectionKind::Is | SectionKind::Case => {
            if position == 0 {
                add_case_operators(items);
            }
            let before: Vec<_> = section
                .parameters
                .iter()
                .filter(|parameter| parameter.span.end < offset)
                .cloned()
                .collect();
            if condition::should_complete_case_section(&before) {
                add_scope_roots(items, template, offset, ctx, settings);
            }
        }
        SectionKind::For => match position {
            1 => insert(items, simple("in", CompletionItemKind::KEYWORD, "Loop keyword")),
            2 => add_scope_roots(items, template, offset, ctx, settings),
            _ => {}
        },
        SectionKind::Each
        | SectionKind::With
        | SectionKind::When
        | SectionKind::Switch
        | SectionKind::Custom => {
            add_scope_roots(items, template, offset, ctx, settings);
        }
        SectionKind::Set | SectionKind::Let => {}
        SectionKind::Include | SectionKind::Fragment => {}
        SectionKind::Insert => {
            for info in section.grammar().params {
                if section.named_parameter(info.name).is_none() {
                    insert(
                        items,
                        simple(
                            format!("{}=", info.name),
                            CompletionItemKind::PROPERTY,
                            "Section parameter",
                        ),
                    );
                }
            }
        }
    }
}

fn add_if_operators(items: &mut HashMap<String, CompletionItem>) {
    for operator in IF_OPERATORS {
        insert(
            items,
            simple(operator.name, CompletionItemKind::OPERATOR, "Operator"),
        );
        for alias in operator.aliases {
            insert(items, simple(*alias, CompletionItemKind::OPERATOR, "Operator"));
        }
    }
}

fn add_case_operators(items: &mut HashMap<String, CompletionItem>) {
    for operator in CASE_OPERATORS {
        let detail = if operator.is_multi {
            "Operator (accepts a value list)"
        } else {
            "Operator"
        };
        insert(items, simple(operator.name, CompletionItemKind::OPERATOR, detail));
        for alias in operator.aliases {
            insert(items, simple(*alias, CompletionItemKind::OPERATOR, detail));
        }
    }
}

/// Names usable as an expression root at this offset: bindings from
/// parameter declarations, loop aliases, `#let`/`#set` names, members of
/// enclosing `#with` objects, and iteration metadata keys.
fn add_scope_roots(
    items: &mut HashMap<String, CompletionItem>,
    template: &Template,
    offset: usize,
    ctx: &ResolveCtx<'_>,
    settings: &QuteSettings,
) {
    let mut pending = HashSet::new();
    let scope = scope::scope_at(template, offset, &settings.prefix_strategy(), ctx, &mut pending);

    for (name, binding) in scope.visible_bindings() {
        let detail = match &binding.state {
            scope::TypeState::Signature(signature) => signature.clone(),
            _ => "unknown type".to_string(),
        };
        insert(
            items,
            CompletionItem {
                label: name.to_string(),
                kind: Some(CompletionItemKind::VARIABLE),
                detail: Some(detail),
                ..CompletionItem::default()
            },
        );
    }
    for key in scope.metadata_keys() {
        insert(
            items,
            simple(key.clone(), CompletionItemKind::VALUE, "Iteration metadata"),
        );
    }
    for signature in scope.with_types() {
        if let CacheLookup::Resolved(Some(resolved)) =
            ctx.cache.lookup(&CacheKey::new(ctx.project_uri, signature))
        {
            add_member_items(items, &resolved);
        }
    }
}

fn add_member_items(
    items: &mut HashMap<String, CompletionItem>,
    resolved: &crate::javatypes::ResolvedJavaType,
) {
    for field in &resolved.fields {
        insert(
            items,
            simple(
                field.name.clone(),
                CompletionItemKind::FIELD,
                &field.type_signature,
            ),
        );
    }
    // `invalid_methods` never reach `methods`, so everything here is usable.
    for method in &resolved.methods {
        insert(
            items,
            simple(
                method.name.clone(),
                CompletionItemKind::METHOD,
                &method.return_type,
            ),
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn add_expression_completions(
    items: &mut HashMap<String, CompletionItem>,
    template: &Template,
    content: &str,
    relative: usize,
    content_base: usize,
    offset: usize,
    ctx: &ResolveCtx<'_>,
    settings: &QuteSettings,
) {
    let before = &content[..relative.min(content.len())];
    match before.rfind('.') {
        // Member completion for the chain left of the last dot.
        Some(dot) => {
            add_chain_members(items, template, &before[..dot], content_base, offset, ctx, settings)
        }
        None => add_scope_roots(items, template, offset, ctx, settings),
    }
}

/// Members of the type a (possibly partial) chain resolves to, from cached
/// data only.
fn add_chain_members(
    items: &mut HashMap<String, CompletionItem>,
    template: &Template,
    chain: &str,
    base: usize,
    offset: usize,
    ctx: &ResolveCtx<'_>,
    settings: &QuteSettings,
) {
    let (namespace, parts) = ast::parse_expression_parts(chain, base);
    let mut pending = HashSet::new();
    let scope = scope::scope_at(template, offset, &settings.prefix_strategy(), ctx, &mut pending);
    if let ChainResolution::Resolved(resolved) =
        scope::resolve_chain(namespace.as_ref(), &parts, &scope, ctx, &mut pending, true)
    {
        add_member_items(items, &resolved);
    }
}

/// Type-name completion inside a parameter declaration. Results come from
/// the provider's pattern search, fetched in the background: the first
/// request primes the cache, a later pass reads it.
fn add_type_completions(
    items: &mut HashMap<String, CompletionItem>,
    prefix: &str,
    project_uri: &str,
    cache: &TypeResolutionCache,
) {
    match cache.lookup_types(project_uri, prefix) {
        Some(types) => {
            for info in types.iter() {
                insert(
                    items,
                    simple(info.signature.clone(), CompletionItemKind::CLASS, "Java type"),
                );
            }
        }
        None => cache.request_types(project_uri, prefix),
    }
}
