use std::collections::HashSet;

use tower_lsp::lsp_types::{Diagnostic, NumberOrString};

use crate::ast::{Node, SectionNode, Template};
use crate::condition;
use crate::javatypes::InvalidMethodReason;
use crate::lineindex::LineIndex;
use crate::parser::{CancelToken, Canceled};
use crate::resolver::{CacheKey, TypeResolutionCache};
use crate::scope::{self, ChainResolution, ResolveCtx, Scope};
use crate::sections::SectionKind;
use crate::settings::QuteSettings;
use crate::span::Span;

pub mod codes {
    pub const UNKNOWN_SECTION_TAG: &str = "unknown-section-tag";
    pub const UNKNOWN_OBJECT: &str = "unknown-object";
    pub const UNKNOWN_PROPERTY: &str = "unknown-property";
    pub const UNKNOWN_NAMESPACE: &str = "unknown-namespace";
    pub const UNKNOWN_OPERATOR: &str = "unknown-operator";
    pub const DUPLICATE_PARAMETER: &str = "duplicate-parameter";
    pub const MISSING_REQUIRED_PARAMETER: &str = "missing-required-parameter";
    pub const UNTERMINATED_SECTION: &str = "unterminated-section";
    pub const UNMATCHED_END_TAG: &str = "unmatched-end-tag";
    pub const UNEXPECTED_BLOCK_LABEL: &str = "unexpected-block-label";
    pub const INVALID_METHOD: &str = "invalid-method";
    pub const INVALID_METHOD_VOID: &str = "invalid-method-void";
    pub const INVALID_METHOD_FROM_OBJECT: &str = "invalid-method-from-object";
    pub const INVALID_METHOD_STATIC: &str = "invalid-method-static";
}

/// Result of a validation pass: the diagnostics that could be computed now,
/// plus the type lookups that were still in flight. The caller awaits the
/// pending batch and re-invokes validation once it settles.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub diagnostics: Vec<Diagnostic>,
    pub pending: HashSet<CacheKey>,
}

/// Walks the tree and reports semantic and structural faults. Always
/// terminates, even with incomplete type information: unresolved lookups are
/// recorded and skipped, never waited on.
pub fn validate(
    template: &Template,
    line_index: &LineIndex,
    uri: &str,
    project_uri: &str,
    cache: &TypeResolutionCache,
    settings: &QuteSettings,
    cancel: &CancelToken,
) -> Result<ValidationOutcome, Canceled> {
    let mut outcome = ValidationOutcome::default();
    if !settings.validation.enabled {
        return Ok(outcome);
    }

    let mut validator = Validator {
        template,
        line_index,
        uri,
        settings,
        ctx: ResolveCtx::new(project_uri, cache),
        cancel,
        outcome: &mut outcome,
    };

    for orphan in &template.orphan_end_tags {
        let tag = if orphan.tag.is_empty() {
            "{/}".to_string()
        } else {
            format!("{{/{}}}", orphan.tag)
        };
        validator.report(
            codes::UNMATCHED_END_TAG,
            orphan.span,
            format!("`{tag}` has no matching opening tag."),
        );
    }

    for decl in template.param_declarations() {
        if decl.alias.is_none() {
            validator.report(
                codes::MISSING_REQUIRED_PARAMETER,
                decl.span,
                "Parameter declaration requires an alias.".to_string(),
            );
        }
        // Warm the cache so member validation can settle on the next pass.
        match resolve_for(&validator.ctx, &decl.signature, &mut validator.outcome.pending) {
            DeclLookup::Absent => {
                let span = decl.signature_span;
                let signature = decl.signature.clone();
                validator.report(
                    codes::UNKNOWN_OBJECT,
                    span,
                    format!("`{signature}` cannot be resolved to a type."),
                );
            }
            DeclLookup::Known | DeclLookup::Pending => {}
        }
    }

    let mut root_scope = Scope::new();
    root_scope.push(scope::template_frame(template));
    validator.walk(&template.children, &mut root_scope, &[])?;
    Ok(outcome)
}

enum DeclLookup {
    Known,
    Absent,
    Pending,
}

fn resolve_for(
    ctx: &ResolveCtx<'_>,
    signature: &str,
    pending: &mut HashSet<CacheKey>,
) -> DeclLookup {
    if signature.is_empty() {
        return DeclLookup::Known;
    }
    let key = CacheKey::new(ctx.project_uri, signature);
    match ctx.cache.lookup(&key) {
        crate::resolver::CacheLookup::Resolved(Some(_)) => DeclLookup::Known,
        crate::resolver::CacheLookup::Resolved(None) => DeclLookup::Absent,
        crate::resolver::CacheLookup::Pending => {
            pending.insert(key);
            DeclLookup::Pending
        }
    }
}

struct Validator<'a> {
    template: &'a Template,
    line_index: &'a LineIndex,
    uri: &'a str,
    settings: &'a QuteSettings,
    ctx: ResolveCtx<'a>,
    cancel: &'a CancelToken,
    outcome: &'a mut ValidationOutcome,
}

impl<'a> Validator<'a> {
    fn report(&mut self, code: &str, span: Span, message: String) {
        let Some(severity) = self.settings.severity_for(code, self.uri) else {
            return;
        };
        self.outcome.diagnostics.push(Diagnostic {
            range: self.line_index.range_at(span),
            severity: Some(severity),
            code: Some(NumberOrString::String(code.to_string())),
            source: Some("qute".to_string()),
            message,
            ..Diagnostic::default()
        });
    }

    fn walk(
        &mut self,
        nodes: &[Node],
        scope: &mut Scope,
        parent_labels: &[SectionKind],
    ) -> Result<(), Canceled> {
        for node in nodes {
            self.cancel.check()?;
            match node {
                Node::Section(section) => self.check_section(section, scope, parent_labels)?,
                Node::Expression(expression) => {
                    let resolution = scope::resolve_chain(
                        expression.namespace.as_ref(),
                        &expression.parts,
                        scope,
                        &self.ctx,
                        &mut self.outcome.pending,
                        false,
                    );
                    self.report_chain(resolution);
                }
                Node::Text(_) | Node::Comment(_) | Node::ParamDeclaration(_) => {}
            }
        }
        Ok(())
    }

    fn check_section(
        &mut self,
        section: &SectionNode,
        scope: &mut Scope,
        parent_labels: &[SectionKind],
    ) -> Result<(), Canceled> {
        let grammar = section.grammar();

        if section.kind == SectionKind::Custom {
            let tag = &section.tag;
            self.report(
                codes::UNKNOWN_SECTION_TAG,
                section.open_tag_span,
                format!("Unknown section tag `#{tag}`."),
            );
        }

        if section.kind.is_block_label() && !parent_labels.contains(&section.kind) {
            let tag = &section.tag;
            self.report(
                codes::UNEXPECTED_BLOCK_LABEL,
                section.open_tag_span,
                format!("`#{tag}` is not allowed in this section."),
            );
        }

        if !section.closed {
            let tag = &section.tag;
            self.report(
                codes::UNTERMINATED_SECTION,
                section.open_tag_span,
                format!("Section `#{tag}` is not terminated."),
            );
        }

        self.check_parameters(section);
        self.check_parameter_expressions(section, scope);

        let frame = scope::frame_for_section(
            section,
            scope,
            &self.settings.prefix_strategy(),
            &self.ctx,
            &mut self.outcome.pending,
        );
        scope.push(frame);
        let result = self.walk(&section.children, scope, grammar.block_labels);
        scope.pop();
        result
    }

    fn check_parameters(&mut self, section: &SectionNode) {
        let grammar = section.grammar();

        for (index, info) in grammar.params.iter().enumerate() {
            if !info.required {
                continue;
            }
            let satisfied = section.parameters.len() > index
                || section.named_parameter(info.name).is_some();
            if !satisfied {
                let tag = &section.tag;
                let name = info.name;
                self.report(
                    codes::MISSING_REQUIRED_PARAMETER,
                    section.open_tag_span,
                    format!("Section `#{tag}` requires parameter `{name}`."),
                );
            }
        }

        // A dangling `name=` lost its value to the tag close.
        for parameter in &section.parameters {
            if parameter.value.is_none() {
                if let Some(name_span) = parameter.name_span {
                    if parameter.span.end > name_span.end {
                        let name = parameter.name.clone().unwrap_or_default();
                        self.report(
                            codes::MISSING_REQUIRED_PARAMETER,
                            parameter.span,
                            format!("Parameter `{name}` requires a value."),
                        );
                    }
                }
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for parameter in &section.parameters {
            let (Some(name), true) = (parameter.name.as_deref(), parameter.is_named()) else {
                continue;
            };
            if !seen.insert(name) {
                self.report(
                    codes::DUPLICATE_PARAMETER,
                    parameter.name_span.unwrap_or(parameter.span),
                    format!("Duplicate parameter `{name}`."),
                );
            }
        }

        match section.kind {
            SectionKind::If => {
                let (_, issues) = condition::parse_if_condition(&mut section.parameters.clone());
                self.report_condition_issues(issues);
            }
            SectionKind::Else => {
                if section.parameters.first().and_then(|p| p.effective_value()) == Some("if") {
                    let mut chained = section.parameters[1..].to_vec();
                    let (_, issues) = condition::parse_if_condition(&mut chained);
                    self.report_condition_issues(issues);
                }
            }
            _ => {}
        }
    }

    fn report_condition_issues(&mut self, issues: Vec<condition::ConditionIssue>) {
        for issue in issues {
            let token = &issue.token;
            self.report(
                codes::UNKNOWN_OPERATOR,
                issue.span,
                format!("`{token}` is not a valid operator."),
            );
        }
    }

    fn check_parameter_expressions(&mut self, section: &SectionNode, scope: &Scope) {
        for parameter in &section.parameters {
            if !parameter.can_have_expression {
                continue;
            }
            let Some((namespace, parts)) = scope::parameter_chain(parameter) else {
                continue;
            };
            let resolution = scope::resolve_chain(
                namespace.as_ref(),
                &parts,
                scope,
                &self.ctx,
                &mut self.outcome.pending,
                false,
            );
            self.report_chain(resolution);
        }
    }

    fn report_chain(&mut self, resolution: ChainResolution) {
        match resolution {
            ChainResolution::Resolved(_)
            | ChainResolution::Unknown
            | ChainResolution::Pending => {}
            ChainResolution::UndefinedRoot { name, span } => {
                self.report(
                    codes::UNKNOWN_OBJECT,
                    span,
                    format!("`{name}` cannot be resolved to an object."),
                );
            }
            ChainResolution::UndefinedNamespace { name, span } => {
                self.report(
                    codes::UNKNOWN_NAMESPACE,
                    span,
                    format!("No namespace resolver registered for `{name}`."),
                );
            }
            ChainResolution::UnknownProperty { type_name, part } => {
                let name = &part.name;
                self.report(
                    codes::UNKNOWN_PROPERTY,
                    part.span,
                    format!("`{name}` cannot be resolved on type `{type_name}`."),
                );
            }
            ChainResolution::InvalidMethod { reason, part } => {
                let code = match reason {
                    InvalidMethodReason::Unknown => codes::INVALID_METHOD,
                    InvalidMethodReason::VoidReturn => codes::INVALID_METHOD_VOID,
                    InvalidMethodReason::FromObject => codes::INVALID_METHOD_FROM_OBJECT,
                    InvalidMethodReason::Static => codes::INVALID_METHOD_STATIC,
                };
                self.report(code, part.span, reason.message(&part.name));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::javatypes::{JavaFieldInfo, JavaMethodInfo, ResolvedJavaTypeData};
    use crate::parser::parse;
    use crate::resolver::{ProviderResponse, TypeResolutionProvider};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct ItemProvider;

    #[async_trait]
    impl TypeResolutionProvider for ItemProvider {
        async fn resolved_java_type(
            &self,
            signature: &str,
            _project_uri: &str,
        ) -> ProviderResponse<ResolvedJavaTypeData> {
            match signature {
                "org.acme.Item" => {
                    let mut invalid = HashMap::new();
                    invalid.insert("wait".to_string(), crate::javatypes::InvalidMethodReason::FromObject);
                    invalid.insert("dump".to_string(), crate::javatypes::InvalidMethodReason::VoidReturn);
                    ProviderResponse::Resolved(Some(ResolvedJavaTypeData {
                        signature: signature.to_string(),
                        fields: vec![JavaFieldInfo {
                            name: "name".into(),
                            type_signature: "java.lang.String".into(),
                        }],
                        methods: vec![JavaMethodInfo {
                            name: "getPrice".into(),
                            return_type: "java.math.BigDecimal".into(),
                            parameter_types: Vec::new(),
                        }],
                        invalid_methods: invalid,
                        ..Default::default()
                    }))
                }
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

    async fn validate_source(source: &str) -> ValidationOutcome {
        let cache = TypeResolutionCache::new(Arc::new(ItemProvider));
        let template = parse(source);
        let line_index = LineIndex::new(source);
        let settings = QuteSettings::default();
        let cancel = CancelToken::new();
        // First pass records pending lookups; settle them and run the pass
        // the caller would re-invoke.
        let outcome = validate(
            &template,
            &line_index,
            "file:///t.html",
            "p",
            &cache,
            &settings,
            &cancel,
        )
        .expect("not cancelled");
        if outcome.pending.is_empty() {
            return outcome;
        }
        cache.resolve_batch(outcome.pending.clone()).await;
        let second = validate(
            &template,
            &line_index,
            "file:///t.html",
            "p",
            &cache,
            &settings,
            &cancel,
        )
        .expect("not cancelled");
        if second.pending.is_empty() {
            return second;
        }
        cache.resolve_batch(second.pending.clone()).await;
        validate(
            &template,
            &line_index,
            "file:///t.html",
            "p",
            &cache,
            &settings,
            &cancel,
        )
        .expect("not cancelled")
    }

    fn codes_of(outcome: &ValidationOutcome) -> Vec<String> {
        outcome
            .diagnostics
            .iter()
            .filter_map(|d| match &d.code {
                Some(NumberOrString::String(code)) => Some(code.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn unknown_tag_yields_exactly_one_diagnostic() {
        let outcome = validate_source("{#unknown x=1}{/unknown}").await;
        assert_eq!(codes_of(&outcome), vec![codes::UNKNOWN_SECTION_TAG]);
    }

    #[tokio::test]
    async fn valid_template_is_clean() {
        let outcome = validate_source(
            "{@java.util.List<org.acme.Item> items}{#each items}{it.name}{it_hasNext}{/each}",
        )
        .await;
        assert!(outcome.diagnostics.is_empty(), "{:?}", outcome.diagnostics);
        assert!(outcome.pending.is_empty());
    }

    #[tokio::test]
    async fn undefined_root_is_flagged() {
        let outcome = validate_source("{nothing.here}").await;
        assert_eq!(codes_of(&outcome), vec![codes::UNKNOWN_OBJECT]);
    }

    #[tokio::test]
    async fn unknown_property_names_the_type() {
        let outcome =
            validate_source("{@org.acme.Item item}{item.name}{item.price}{item.missing}").await;
        assert_eq!(codes_of(&outcome), vec![codes::UNKNOWN_PROPERTY]);
        assert!(outcome.diagnostics[0].message.contains("missing"));
        assert!(outcome.diagnostics[0].message.contains("org.acme.Item"));
    }

    #[tokio::test]
    async fn object_methods_are_invalid_properties() {
        let outcome = validate_source("{@org.acme.Item item}{item.wait}{item.dump}").await;
        let codes = codes_of(&outcome);
        assert_eq!(
            codes,
            vec![codes::INVALID_METHOD_FROM_OBJECT, codes::INVALID_METHOD_VOID]
        );
        assert!(outcome.diagnostics[0]
            .message
            .contains("java.lang.Object"));
    }

    #[tokio::test]
    async fn unknown_namespace_is_flagged() {
        let outcome = validate_source("{weird:item.name}").await;
        assert_eq!(codes_of(&outcome), vec![codes::UNKNOWN_NAMESPACE]);
    }

    #[tokio::test]
    async fn structural_faults_surface_as_diagnostics() {
        let outcome = validate_source("{#each items}{#if x}y{/each}{/if}").await;
        let codes = codes_of(&outcome);
        assert!(codes.contains(&codes::UNTERMINATED_SECTION.to_string()));
        assert!(codes.contains(&codes::UNMATCHED_END_TAG.to_string()));
    }

    #[tokio::test]
    async fn condition_and_parameter_faults() {
        let outcome = validate_source("{#if a almost b}x{/if}").await;
        assert!(codes_of(&outcome).contains(&codes::UNKNOWN_OPERATOR.to_string()));

        let outcome = validate_source("{#let a=1 a=2}x{/let}").await;
        assert!(codes_of(&outcome).contains(&codes::DUPLICATE_PARAMETER.to_string()));

        let outcome = validate_source("{#include}{/include}").await;
        assert!(codes_of(&outcome).contains(&codes::MISSING_REQUIRED_PARAMETER.to_string()));
    }

    #[tokio::test]
    async fn misplaced_block_label_is_flagged_but_parsed() {
        let outcome = validate_source("{#with x}{#else}y{/with}").await;
        assert!(codes_of(&outcome).contains(&codes::UNEXPECTED_BLOCK_LABEL.to_string()));
    }

    #[tokio::test]
    async fn pending_types_degrade_to_silence() {
        // No settle pass: validate once against an empty cache.
        let cache = TypeResolutionCache::new(Arc::new(ItemProvider));
        let source = "{@org.acme.Item item}{item.missing}";
        let template = parse(source);
        let line_index = LineIndex::new(source);
        let outcome = validate(
            &template,
            &line_index,
            "file:///t.html",
            "p",
            &cache,
            &QuteSettings::default(),
            &CancelToken::new(),
        )
        .expect("not cancelled");
        assert!(outcome.diagnostics.is_empty());
        assert_eq!(outcome.pending.len(), 1);
    }

    #[tokio::test]
    async fn disabled_validation_reports_nothing() {
        let cache = TypeResolutionCache::new(Arc::new(ItemProvider));
        let source = "{#unknown}{/unknown}";
        let template = parse(source);
        let line_index = LineIndex::new(source);
        let mut settings = QuteSettings::default();
        settings.validation.enabled = false;
        let outcome = validate(
            &template,
            &line_index,
            "file:///t.html",
            "p",
            &cache,
            &settings,
            &CancelToken::new(),
        )
        .expect("not cancelled");
        assert!(outcome.diagnostics.is_empty());
    }
}
