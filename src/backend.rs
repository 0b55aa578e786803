use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use ropey::Rope;
use tokio::sync::RwLock;
use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::{
    CompletionOptions, CompletionParams, CompletionResponse, DidChangeConfigurationParams,
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DocumentSymbol, DocumentSymbolParams, DocumentSymbolResponse, GotoDefinitionParams,
    GotoDefinitionResponse, Hover, HoverContents, HoverParams, HoverProviderCapability,
    InitializeParams, InitializeResult, InitializedParams, LocationLink, MarkupContent,
    MarkupKind, MessageType, OneOf, ServerCapabilities, SymbolKind,
    TextDocumentContentChangeEvent, TextDocumentSyncCapability, TextDocumentSyncKind, Url,
};
use tower_lsp::{Client, LanguageServer};

use crate::ast::{Node, Template};
use crate::complete;
use crate::definition::DefinitionIndex;
use crate::lineindex::LineIndex;
use crate::parser::{self, CancelToken};
use crate::resolver::{CacheKey, ClientTypeProvider, TypeResolutionCache};
use crate::scope::{self, ChainResolution, ResolveCtx};
use crate::settings::QuteSettings;
use crate::span::Span;
use crate::validate::{self, ValidationOutcome};

struct StoredDocument {
    rope: Rope,
    version: i32,
    template: Arc<Template>,
    line_index: Arc<LineIndex>,
    definitions: Arc<DefinitionIndex>,
    cancel: CancelToken,
}

impl StoredDocument {
    fn new(text: &str, version: i32) -> Self {
        let template = parser::parse(text);
        let definitions = DefinitionIndex::build(&template);
        Self {
            rope: Rope::from_str(text),
            version,
            template: Arc::new(template),
            line_index: Arc::new(LineIndex::new(text)),
            definitions: Arc::new(definitions),
            cancel: CancelToken::new(),
        }
    }
}

pub struct Backend {
    client: Client,
    documents: Arc<DashMap<Url, StoredDocument>>,
    cache: TypeResolutionCache,
    settings: Arc<RwLock<QuteSettings>>,
    project_root: Arc<RwLock<Option<String>>>,
}

impl Backend {
    pub fn new(client: Client) -> Self {
        let provider = Arc::new(ClientTypeProvider::new(client.clone()));
        Self {
            client,
            documents: Arc::new(DashMap::new()),
            cache: TypeResolutionCache::new(provider),
            settings: Arc::new(RwLock::new(QuteSettings::default())),
            project_root: Arc::new(RwLock::new(None)),
        }
    }

    fn update_document(&self, uri: Url, text: &str, version: i32) {
        if let Some(previous) = self.documents.get(&uri) {
            // Abandon any validation pass still running against the old tree.
            previous.cancel.cancel();
        }
        self.documents
            .insert(uri, StoredDocument::new(text, version));
    }

    fn snapshot(&self, uri: &Url) -> Option<DocumentSnapshot> {
        self.documents.get(uri).map(DocumentSnapshot::of)
    }

    async fn project_uri(&self) -> String {
        self.project_root
            .read()
            .await
            .clone()
            .unwrap_or_default()
    }

    /// Kicks off validation for a document. Runs detached: the pass itself
    /// is synchronous, but unresolved type lookups are awaited as one
    /// settle-batch and validation re-runs once per batch until it makes no
    /// further progress.
    fn spawn_validation(&self, uri: Url) {
        let client = self.client.clone();
        let documents = self.documents.clone();
        let cache = self.cache.clone();
        let settings = self.settings.clone();
        let project_root = self.project_root.clone();
        tokio::spawn(async move {
            let settings = settings.read().await.clone();
            let project_uri = project_root.read().await.clone().unwrap_or_default();
            let Some(snapshot) = documents.get(&uri).map(DocumentSnapshot::of) else {
                return;
            };

            let mut last_pending: HashSet<CacheKey> = HashSet::new();
            loop {
                let outcome = match validate::validate(
                    &snapshot.template,
                    &snapshot.line_index,
                    uri.as_str(),
                    &project_uri,
                    &cache,
                    &settings,
                    &snapshot.cancel,
                ) {
                    Ok(outcome) => outcome,
                    Err(_) => return, // cancelled: a newer pass owns the document
                };
                let stale = documents
                    .get(&uri)
                    .map(|doc| doc.version != snapshot.version)
                    .unwrap_or(true);
                if stale {
                    return;
                }
                let ValidationOutcome {
                    diagnostics,
                    pending,
                } = outcome;
                debug!(
                    "published {} diagnostics for {uri} ({} lookups pending)",
                    diagnostics.len(),
                    pending.len()
                );
                client
                    .publish_diagnostics(uri.clone(), diagnostics, Some(snapshot.version))
                    .await;
                if pending.is_empty() || pending == last_pending {
                    // Settled, or the provider cannot answer these yet;
                    // either way another round would change nothing.
                    return;
                }
                last_pending = pending.clone();
                cache.resolve_batch(pending).await;
            }
        });
    }

    fn hover_content(
        &self,
        snapshot: &DocumentSnapshot,
        offset: usize,
        project_uri: &str,
        settings: &QuteSettings,
    ) -> Option<(String, Span)> {
        let ctx = ResolveCtx::new(project_uri, &self.cache);
        match snapshot.template.path_at(offset).last()? {
            Node::Expression(expression) => {
                let (index, part) = expression.part_at(offset)?;
                let mut pending = HashSet::new();
                let scope = scope::scope_at(
                    &snapshot.template,
                    offset,
                    &settings.prefix_strategy(),
                    &ctx,
                    &mut pending,
                );
                match scope::resolve_chain(
                    expression.namespace.as_ref(),
                    &expression.parts[..=index],
                    &scope,
                    &ctx,
                    &mut pending,
                    true,
                ) {
                    ChainResolution::Resolved(resolved) => {
                        let name = &part.name;
                        let signature = &resolved.signature;
                        Some((
                            format!("`{name}`\n\n```java\n{signature}\n```"),
                            part.span,
                        ))
                    }
                    _ => None,
                }
            }
            Node::Section(section) if section.open_tag_span.contains_inclusive(offset) => {
                let grammar = section.grammar();
                let tag = &section.tag;
                Some((
                    format!("`#{tag}`\n\n{}", grammar.doc),
                    section.open_tag_span,
                ))
            }
            Node::ParamDeclaration(decl) => {
                let signature = &decl.signature;
                Some((format!("```java\n{signature}\n```"), decl.span))
            }
            _ => None,
        }
    }
}

struct DocumentSnapshot {
    version: i32,
    template: Arc<Template>,
    line_index: Arc<LineIndex>,
    definitions: Arc<DefinitionIndex>,
    cancel: CancelToken,
}

impl DocumentSnapshot {
    fn of(doc: impl std::ops::Deref<Target = StoredDocument>) -> Self {
        Self {
            version: doc.version,
            template: doc.template.clone(),
            line_index: doc.line_index.clone(),
            definitions: doc.definitions.clone(),
            cancel: doc.cancel.clone(),
        }
    }
}

fn apply_change(rope: &mut Rope, change: &TextDocumentContentChangeEvent) {
    let Some(range) = change.range else {
        *rope = Rope::from_str(&change.text);
        return;
    };
    let start = rope
        .try_line_to_char(range.start.line as usize)
        .map(|line| line + range.start.character as usize);
    let end = rope
        .try_line_to_char(range.end.line as usize)
        .map(|line| line + range.end.character as usize);
    match (start, end) {
        (Ok(start), Ok(end)) if start <= end && end <= rope.len_chars() => {
            rope.remove(start..end);
            rope.insert(start, &change.text);
        }
        _ => *rope = Rope::from_str(&change.text),
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        let root = params
            .workspace_folders
            .as_ref()
            .and_then(|folders| folders.first())
            .map(|folder| folder.uri.to_string());
        #[allow(deprecated)]
        let root = root.or_else(|| params.root_uri.as_ref().map(Url::to_string));
        *self.project_root.write().await = root;

        Ok(InitializeResult {
            server_info: None,
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::INCREMENTAL,
                )),
                completion_provider: Some(CompletionOptions {
                    resolve_provider: Some(false),
                    trigger_characters: Some(vec![
                        ".".to_string(),
                        "{".to_string(),
                        "#".to_string(),
                        ":".to_string(),
                    ]),
                    ..CompletionOptions::default()
                }),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                definition_provider: Some(OneOf::Left(true)),
                document_symbol_provider: Some(OneOf::Left(true)),
                ..ServerCapabilities::default()
            },
            ..InitializeResult::default()
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        debug!("qute language server initialized");
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri;
        self.update_document(
            uri.clone(),
            &params.text_document.text,
            params.text_document.version,
        );
        self.spawn_validation(uri);
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let version = params.text_document.version;

        let text = match self.documents.get(&uri) {
            Some(doc) => {
                let mut rope = doc.rope.clone();
                drop(doc);
                for change in &params.content_changes {
                    apply_change(&mut rope, change);
                }
                rope.to_string()
            }
            None => {
                // An unopened document can only be recovered from a full
                // replacement change.
                match params.content_changes.into_iter().last() {
                    Some(change) if change.range.is_none() => change.text,
                    _ => {
                        self.client
                            .log_message(
                                MessageType::WARNING,
                                format!("incremental change for unopened document {uri}"),
                            )
                            .await;
                        return;
                    }
                }
            }
        };

        self.update_document(uri.clone(), &text, version);
        self.spawn_validation(uri);
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        if let Some((_, doc)) = self.documents.remove(&uri) {
            doc.cancel.cancel();
        }
        self.client.publish_diagnostics(uri, Vec::new(), None).await;
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        *self.settings.write().await = QuteSettings::from_json(&params.settings);
        debug!("configuration changed, revalidating open documents");
        let uris: Vec<Url> = self
            .documents
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for uri in uris {
            self.spawn_validation(uri);
        }
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let uri = params.text_document_position.text_document.uri;
        let position = params.text_document_position.position;
        let Some(snapshot) = self.snapshot(&uri) else {
            return Ok(None);
        };
        let Some(offset) = snapshot.line_index.offset_at(&position) else {
            return Ok(None);
        };
        let settings = self.settings.read().await.clone();
        let project_uri = self.project_uri().await;
        let items = complete::complete(
            &snapshot.template,
            offset,
            &project_uri,
            &self.cache,
            &settings,
        );
        if items.is_empty() {
            Ok(None)
        } else {
            Ok(Some(CompletionResponse::Array(items)))
        }
    }

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let Some(snapshot) = self.snapshot(&uri) else {
            return Ok(None);
        };
        let Some(offset) = snapshot.line_index.offset_at(&position) else {
            return Ok(None);
        };
        let settings = self.settings.read().await.clone();
        let project_uri = self.project_uri().await;
        let hover = self
            .hover_content(&snapshot, offset, &project_uri, &settings)
            .map(|(value, span)| Hover {
                contents: HoverContents::Markup(MarkupContent {
                    kind: MarkupKind::Markdown,
                    value,
                }),
                range: Some(snapshot.line_index.range_at(span)),
            });
        Ok(hover)
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let Some(snapshot) = self.snapshot(&uri) else {
            return Ok(None);
        };
        let Some(offset) = snapshot.line_index.offset_at(&position) else {
            return Ok(None);
        };
        let link = snapshot
            .definitions
            .definition_at(offset)
            .map(|(reference, declaration)| {
                let target = snapshot.line_index.range_at(declaration);
                LocationLink {
                    origin_selection_range: Some(snapshot.line_index.range_at(reference)),
                    target_uri: uri.clone(),
                    target_range: target,
                    target_selection_range: target,
                }
            });
        Ok(link.map(|link| GotoDefinitionResponse::Link(vec![link])))
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        let uri = params.text_document.uri;
        let Some(snapshot) = self.snapshot(&uri) else {
            return Ok(None);
        };
        let symbols = collect_symbols(&snapshot.template.children, &snapshot.line_index);
        Ok(Some(DocumentSymbolResponse::Nested(symbols)))
    }
}

#[allow(deprecated)]
fn collect_symbols(nodes: &[Node], line_index: &LineIndex) -> Vec<DocumentSymbol> {
    let mut symbols = Vec::new();
    for node in nodes {
        match node {
            Node::Section(section) => {
                let detail = section
                    .parameters
                    .first()
                    .and_then(|parameter| parameter.effective_value())
                    .map(str::to_string);
                let children = collect_symbols(&section.children, line_index);
                symbols.push(DocumentSymbol {
                    name: format!("#{}", section.tag),
                    detail,
                    kind: SymbolKind::MODULE,
                    tags: None,
                    deprecated: None,
                    range: line_index.range_at(section.span),
                    selection_range: line_index.range_at(section.open_tag_span),
                    children: if children.is_empty() {
                        None
                    } else {
                        Some(children)
                    },
                });
            }
            Node::ParamDeclaration(decl) => {
                let name = decl.alias.clone().unwrap_or_else(|| "?".to_string());
                symbols.push(DocumentSymbol {
                    name,
                    detail: Some(decl.signature.clone()),
                    kind: SymbolKind::VARIABLE,
                    tags: None,
                    deprecated: None,
                    range: line_index.range_at(decl.span),
                    selection_range: line_index
                        .range_at(decl.alias_span.unwrap_or(decl.span)),
                    children: None,
                });
            }
            _ => {}
        }
    }
    symbols
}
