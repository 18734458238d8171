use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::{
    clamp_to_char_boundary, element_at_path, inline_text_content, node_at_path, Document, Editor,
    ElementKind, ElementNode, ListKind, Marks, Node, NodeKind, NoticeSeverity, Point,
    RangeSelection, Selection, TextNode, TextRole, VoidKind, VoidNode,
};
use crate::matcher::{DelimiterPair, DelimiterSet};
use crate::ops::{Op, Path, Transaction};

pub const MAX_INDENT_LEVEL: u8 = 8;

#[derive(Debug, Clone)]
pub struct CommandError {
    message: String,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone)]
pub struct QueryError {
    message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Clone)]
pub struct CommandSpec {
    pub id: String,
    pub label: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub args_example: Option<Value>,
    pub handler: Arc<dyn Fn(&mut Editor, Option<Value>) -> Result<(), CommandError> + Send + Sync>,
}

impl CommandSpec {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        handler: impl Fn(&mut Editor, Option<Value>) -> Result<(), CommandError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: None,
            keywords: Vec::new(),
            args_example: None,
            handler: Arc::new(handler),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn args_example(mut self, args_example: Value) -> Self {
        self.args_example = Some(args_example);
        self
    }
}

#[derive(Clone)]
pub struct QuerySpec {
    pub id: String,
    pub handler: Arc<dyn Fn(&Editor, Option<Value>) -> Result<Value, QueryError> + Send + Sync>,
}

/// Handler priority levels; within one event, higher-priority handlers run
/// first and a handler returning `true` suppresses the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SelectionChange,
    Blur,
    KeyEnter,
    KeyBackspace,
    KeyTab,
    KeyArrowRight,
    Paste,
}

#[derive(Debug, Clone)]
pub enum EditorEvent {
    SelectionChange,
    Blur,
    KeyEnter,
    KeyBackspace,
    KeyTab { shift: bool },
    KeyArrowRight,
    Paste(ClipboardPayload),
}

impl EditorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EditorEvent::SelectionChange => EventKind::SelectionChange,
            EditorEvent::Blur => EventKind::Blur,
            EditorEvent::KeyEnter => EventKind::KeyEnter,
            EditorEvent::KeyBackspace => EventKind::KeyBackspace,
            EditorEvent::KeyTab { .. } => EventKind::KeyTab,
            EditorEvent::KeyArrowRight => EventKind::KeyArrowRight,
            EditorEvent::Paste(_) => EventKind::Paste,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClipboardPayload {
    pub files: Vec<ClipboardFile>,
}

#[derive(Debug, Clone)]
pub struct ClipboardFile {
    pub mime: String,
    /// The file resolved to a `src` (object URL, data URI) by the embedder,
    /// or the error it hit reading the file.
    pub src: Result<String, FileReadError>,
}

impl ClipboardFile {
    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }
}

#[derive(Debug, Clone, Error)]
#[error("failed to read pasted file: {0}")]
pub struct FileReadError(pub String);

#[derive(Clone)]
pub struct EventHandlerSpec {
    pub id: &'static str,
    pub event: EventKind,
    pub priority: Priority,
    pub run: Arc<dyn Fn(&mut Editor, &EditorEvent) -> Result<bool, CommandError> + Send + Sync>,
}

impl EventHandlerSpec {
    pub fn new(
        id: &'static str,
        event: EventKind,
        priority: Priority,
        run: impl Fn(&mut Editor, &EditorEvent) -> Result<bool, CommandError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            event,
            priority,
            run: Arc::new(run),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Block,
    Inline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub kind: NodeKind,
    pub role: NodeRole,
    pub is_void: bool,
}

/// Phases of the node transform engine; for any given text run, block
/// triggers are tried before list prefixes, which are tried before
/// delimiter matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransformPhase {
    BlockTrigger,
    ListPrefix,
    Delimiter,
}

pub struct TransformOutcome {
    pub ops: Vec<Op>,
    pub selection_after: Option<Selection>,
}

pub struct FiredTransform {
    pub id: &'static str,
    pub ops: Vec<Op>,
    pub selection_after: Option<Selection>,
}

/// A reaction to text-content mutations of a plain text run. Runs that are
/// editable, or sit inside an editable block, are never offered to
/// transforms. Transforms must be idempotent: a run they already converted
/// must not fire again.
pub trait TextRunTransform: Send + Sync {
    fn id(&self) -> &'static str;
    fn phase(&self) -> TransformPhase;
    fn transform(
        &self,
        doc: &Document,
        path: &[usize],
        run: &TextNode,
        selection: &Selection,
    ) -> Option<TransformOutcome>;
}

pub trait NormalizePass: Send + Sync {
    fn id(&self) -> &'static str;
    fn run(&self, doc: &Document) -> Vec<Op>;
}

pub trait EditorPlugin: Send + Sync {
    fn id(&self) -> &'static str;
    fn node_specs(&self) -> Vec<NodeSpec> {
        Vec::new()
    }
    /// Node kinds this plugin depends on without registering them itself.
    /// A missing kind is a fatal configuration error at registry build time.
    fn required_kinds(&self) -> Vec<NodeKind> {
        Vec::new()
    }
    fn text_transforms(&self) -> Vec<Box<dyn TextRunTransform>> {
        Vec::new()
    }
    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        Vec::new()
    }
    fn event_handlers(&self) -> Vec<EventHandlerSpec> {
        Vec::new()
    }
    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }
    fn queries(&self) -> Vec<QuerySpec> {
        Vec::new()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate node kind registration: {0:?}")]
    DuplicateNodeKind(NodeKind),
    #[error("plugin {plugin} requires node kind {kind:?}, which no plugin registers")]
    MissingNodeKind { plugin: String, kind: NodeKind },
    #[error("duplicate command id: {0}")]
    DuplicateCommand(String),
    #[error("duplicate query id: {0}")]
    DuplicateQuery(String),
    #[error("invalid delimiter configuration: {0}")]
    InvalidDelimiters(#[from] regex::Error),
}

#[derive(Default)]
pub struct PluginRegistry {
    node_specs: HashMap<NodeKind, NodeSpec>,
    transforms: Vec<Box<dyn TextRunTransform>>,
    normalize_passes: Vec<Box<dyn NormalizePass>>,
    handlers: Vec<EventHandlerSpec>,
    commands: HashMap<String, CommandSpec>,
    queries: HashMap<String, QuerySpec>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("node_specs", &self.node_specs.keys().collect::<Vec<_>>())
            .field("transforms", &self.transforms.len())
            .field("normalize_passes", &self.normalize_passes.len())
            .field("handlers", &self.handlers.len())
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .field("queries", &self.queries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new(
        plugins: impl IntoIterator<Item = Box<dyn EditorPlugin>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        let mut required: Vec<(&'static str, NodeKind)> = Vec::new();

        for plugin in plugins {
            for spec in plugin.node_specs() {
                if registry.node_specs.contains_key(&spec.kind) {
                    return Err(RegistryError::DuplicateNodeKind(spec.kind));
                }
                registry.node_specs.insert(spec.kind, spec);
            }
            for kind in plugin.required_kinds() {
                required.push((plugin.id(), kind));
            }
            registry.transforms.extend(plugin.text_transforms());
            registry.normalize_passes.extend(plugin.normalize_passes());
            registry.handlers.extend(plugin.event_handlers());
            for cmd in plugin.commands() {
                if registry.commands.contains_key(&cmd.id) {
                    return Err(RegistryError::DuplicateCommand(cmd.id));
                }
                registry.commands.insert(cmd.id.clone(), cmd);
            }
            for query in plugin.queries() {
                if registry.queries.contains_key(&query.id) {
                    return Err(RegistryError::DuplicateQuery(query.id));
                }
                registry.queries.insert(query.id.clone(), query);
            }
        }

        for (plugin, kind) in required {
            if !registry.node_specs.contains_key(&kind) {
                return Err(RegistryError::MissingNodeKind {
                    plugin: plugin.to_string(),
                    kind,
                });
            }
        }

        // Stable sorts: registration order breaks ties within a phase or
        // priority level.
        registry.transforms.sort_by_key(|t| t.phase());
        registry.handlers.sort_by(|a, b| b.priority.cmp(&a.priority));

        Ok(registry)
    }

    pub fn standard() -> Self {
        let plugins: Vec<Box<dyn EditorPlugin>> = vec![
            Box::new(CoreBlocksPlugin),
            Box::new(DividerPlugin),
            Box::new(HeadingPlugin),
            Box::new(QuotePlugin),
            Box::new(MarksPlugin),
            Box::new(MathInlinePlugin::new()),
            Box::new(MathBlockPlugin::new()),
            Box::new(CodeBlockPlugin),
            Box::new(ListPlugin),
            Box::new(ImagePlugin),
        ];
        Self::new(plugins).expect("standard registry must be valid")
    }

    pub fn node_specs(&self) -> &HashMap<NodeKind, NodeSpec> {
        &self.node_specs
    }

    pub fn is_registered(&self, kind: NodeKind) -> bool {
        self.node_specs.contains_key(&kind)
    }

    pub fn commands(&self) -> &HashMap<String, CommandSpec> {
        &self.commands
    }

    pub fn command(&self, id: &str) -> Option<CommandSpec> {
        self.commands.get(id).cloned()
    }

    pub fn queries(&self) -> &HashMap<String, QuerySpec> {
        &self.queries
    }

    pub fn query(&self, id: &str) -> Option<QuerySpec> {
        self.queries.get(id).cloned()
    }

    pub fn handlers_for(&self, kind: EventKind) -> Vec<EventHandlerSpec> {
        self.handlers
            .iter()
            .filter(|h| h.event == kind)
            .cloned()
            .collect()
    }

    pub fn normalize(&self, doc: &Document) -> Vec<Op> {
        let mut ops: Vec<Op> = Vec::new();
        for pass in &self.normalize_passes {
            ops.extend(pass.run(doc));
        }
        ops
    }

    /// Offers each plain text run, in document order, to the registered
    /// transforms and returns the first firing. Runs inside editable nodes
    /// are skipped so editing raw source never re-triggers recognition.
    pub fn next_transform(&self, doc: &Document, selection: &Selection) -> Option<FiredTransform> {
        let runs = plain_text_runs(doc);
        for (path, run) in &runs {
            for transform in &self.transforms {
                if let Some(outcome) = transform.transform(doc, path, run, selection) {
                    return Some(FiredTransform {
                        id: transform.id(),
                        ops: outcome.ops,
                        selection_after: outcome.selection_after,
                    });
                }
            }
        }
        None
    }
}

fn plain_text_runs(doc: &Document) -> Vec<(Path, TextNode)> {
    fn walk(children: &[Node], path: &mut Vec<usize>, out: &mut Vec<(Path, TextNode)>) {
        for (ix, node) in children.iter().enumerate() {
            path.push(ix);
            match node {
                Node::Text(t) => {
                    if t.role == TextRole::Plain {
                        out.push((path.clone(), t.clone()));
                    }
                }
                Node::Element(el) => {
                    if !el.kind.is_editable_block() {
                        walk(&el.children, path, out);
                    }
                }
                Node::Void(_) => {}
            }
            path.pop();
        }
    }

    let mut out = Vec::new();
    walk(&doc.children, &mut Vec::new(), &mut out);
    out
}

fn child_path(base: &[usize], ix: usize) -> Path {
    let mut path = base.to_vec();
    path.push(ix);
    path
}

fn apply_error(err: crate::core::ApplyError) -> CommandError {
    CommandError::new(format!("Failed to apply transaction: {err}"))
}

// ---------------------------------------------------------------------------
// Core blocks and normalize passes
// ---------------------------------------------------------------------------

struct CoreBlocksPlugin;

impl EditorPlugin for CoreBlocksPlugin {
    fn id(&self) -> &'static str {
        "core.blocks"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![
            NodeSpec {
                kind: NodeKind::Paragraph,
                role: NodeRole::Block,
                is_void: false,
            },
            NodeSpec {
                kind: NodeKind::Text,
                role: NodeRole::Inline,
                is_void: false,
            },
            NodeSpec {
                kind: NodeKind::LineBreak,
                role: NodeRole::Inline,
                is_void: true,
            },
        ]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![
            Box::new(EnsureNonEmptyDocument),
            Box::new(EnsureTextBlockHasTextLeaf),
            Box::new(MergeAdjacentTextRuns),
        ]
    }
}

struct EnsureNonEmptyDocument;

impl NormalizePass for EnsureNonEmptyDocument {
    fn id(&self) -> &'static str {
        "core.ensure_non_empty_document"
    }

    fn run(&self, doc: &Document) -> Vec<Op> {
        if doc.children.is_empty() {
            return vec![Op::InsertNode {
                path: vec![0],
                node: Node::paragraph(""),
            }];
        }
        Vec::new()
    }
}

struct EnsureTextBlockHasTextLeaf;

impl NormalizePass for EnsureTextBlockHasTextLeaf {
    fn id(&self) -> &'static str {
        "core.ensure_text_blocks_have_text_leaf"
    }

    fn run(&self, doc: &Document) -> Vec<Op> {
        let mut ops = Vec::new();

        fn walk(children: &[Node], path: &mut Vec<usize>, ops: &mut Vec<Op>) {
            for (ix, node) in children.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };
                path.push(ix);
                if el.kind.is_text_block()
                    && !el.children.iter().any(|n| matches!(n, Node::Text(_)))
                {
                    ops.push(Op::InsertNode {
                        path: child_path(path, 0),
                        node: Node::text(""),
                    });
                }
                walk(&el.children, path, ops);
                path.pop();
            }
        }

        walk(&doc.children, &mut Vec::new(), &mut ops);
        ops
    }
}

struct MergeAdjacentTextRuns;

impl NormalizePass for MergeAdjacentTextRuns {
    fn id(&self) -> &'static str {
        "core.merge_adjacent_text_runs"
    }

    fn run(&self, doc: &Document) -> Vec<Op> {
        let mut ops = Vec::new();

        fn walk(children: &[Node], path: &mut Vec<usize>, ops: &mut Vec<Op>) {
            for (ix, node) in children.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };
                path.push(ix);

                if el.children.len() >= 2 {
                    let mut ix = el.children.len();
                    while ix > 0 {
                        ix -= 1;
                        let Node::Text(right) = &el.children[ix] else {
                            continue;
                        };

                        let mut start = ix;
                        while start > 0 {
                            let Some(Node::Text(left)) = el.children.get(start - 1) else {
                                break;
                            };
                            if left.marks != right.marks || left.role != right.role {
                                break;
                            }
                            start -= 1;
                        }

                        if start == ix {
                            continue;
                        }

                        let Some(Node::Text(first)) = el.children.get(start) else {
                            continue;
                        };
                        let mut appended = String::new();
                        for node in el.children.iter().take(ix + 1).skip(start + 1) {
                            if let Node::Text(t) = node {
                                appended.push_str(&t.text);
                            }
                        }

                        if !appended.is_empty() {
                            ops.push(Op::InsertText {
                                path: child_path(path, start),
                                offset: first.text.len(),
                                text: appended,
                            });
                        }

                        for remove_ix in (start + 1..=ix).rev() {
                            ops.push(Op::RemoveNode {
                                path: child_path(path, remove_ix),
                            });
                        }

                        ix = start;
                    }
                }

                walk(&el.children, path, ops);
                path.pop();
            }
        }

        walk(&doc.children, &mut Vec::new(), &mut ops);
        ops
    }
}

// ---------------------------------------------------------------------------
// Divider
// ---------------------------------------------------------------------------

struct DividerPlugin;

impl EditorPlugin for DividerPlugin {
    fn id(&self) -> &'static str {
        "divider"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: NodeKind::Divider,
            role: NodeRole::Block,
            is_void: true,
        }]
    }

    fn required_kinds(&self) -> Vec<NodeKind> {
        vec![NodeKind::Paragraph]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("divider.insert", "Insert divider", |editor, _args| {
                let Some(range) = editor.prev_selection().range().cloned() else {
                    tracing::debug!("divider.insert: no previous range selection");
                    return Ok(());
                };
                let (ops, _, following) =
                    insert_block_after_range(editor.doc(), &range, Node::divider());
                let caret = Point::new(child_path(&following, 0), 0);
                let tx = Transaction::new(ops)
                    .selection_after(Selection::caret(caret))
                    .source("divider.insert");
                editor.apply(tx).map_err(apply_error)
            })
            .description("Insert a horizontal divider after the active block.")
            .keywords(["divider", "rule", "hr", "separator"]),
        ]
    }
}

/// Inserts `node` as a top-level block after the block containing the
/// range's focus. If nothing follows the new node, a fresh empty paragraph
/// is appended so the document never ends without a writable position.
/// Returns the ops, the inserted node's path, and the path following it.
fn insert_block_after_range(
    doc: &Document,
    range: &RangeSelection,
    node: Node,
) -> (Vec<Op>, Path, Path) {
    let top_ix = range
        .focus
        .path
        .first()
        .copied()
        .unwrap_or_else(|| doc.children.len().saturating_sub(1));
    let insert_ix = (top_ix + 1).min(doc.children.len());
    let mut ops = vec![Op::InsertNode {
        path: vec![insert_ix],
        node,
    }];
    let following = vec![insert_ix + 1];
    if insert_ix >= doc.children.len() {
        ops.push(Op::InsertNode {
            path: following.clone(),
            node: Node::paragraph(""),
        });
    }
    (ops, vec![insert_ix], following)
}

// ---------------------------------------------------------------------------
// Heading and quote block styles
// ---------------------------------------------------------------------------

struct HeadingPlugin;

impl EditorPlugin for HeadingPlugin {
    fn id(&self) -> &'static str {
        "heading"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: NodeKind::Heading,
            role: NodeRole::Block,
            is_void: false,
        }]
    }

    fn required_kinds(&self) -> Vec<NodeKind> {
        vec![NodeKind::Paragraph, NodeKind::Text]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![Box::new(ClampHeadingLevels), Box::new(PromoteLeadingHeading)]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("block.toggle_heading", "Toggle heading", |editor, _args| {
                toggle_heading(editor)
            })
            .description("Cycle the active block(s) through the heading levels.")
            .keywords(["heading", "title", "h1", "h2", "h3"]),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec {
            id: "block.heading_level".to_string(),
            handler: Arc::new(|editor, _args| {
                Ok(match active_heading_level(editor) {
                    Some(level) => Value::Number(u64::from(level).into()),
                    None => Value::Null,
                })
            }),
        }]
    }
}

struct ClampHeadingLevels;

impl NormalizePass for ClampHeadingLevels {
    fn id(&self) -> &'static str {
        "heading.clamp_levels"
    }

    fn run(&self, doc: &Document) -> Vec<Op> {
        let mut ops = Vec::new();

        fn walk(children: &[Node], path: &mut Vec<usize>, ops: &mut Vec<Op>) {
            for (ix, node) in children.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };
                path.push(ix);
                if let ElementKind::Heading { level } = el.kind {
                    let clamped = level.clamp(1, 6);
                    if clamped != level {
                        ops.push(Op::SetElementKind {
                            path: path.clone(),
                            kind: ElementKind::Heading { level: clamped },
                        });
                    }
                }
                walk(&el.children, path, ops);
                path.pop();
            }
        }

        walk(&doc.children, &mut Vec::new(), &mut ops);
        ops
    }
}

/// A level-two heading at the very start of the document is promoted to
/// level one.
struct PromoteLeadingHeading;

impl NormalizePass for PromoteLeadingHeading {
    fn id(&self) -> &'static str {
        "heading.promote_leading"
    }

    fn run(&self, doc: &Document) -> Vec<Op> {
        if let Some(Node::Element(el)) = doc.children.first() {
            if el.kind == (ElementKind::Heading { level: 2 }) {
                return vec![Op::SetElementKind {
                    path: vec![0],
                    kind: ElementKind::Heading { level: 1 },
                }];
            }
        }
        Vec::new()
    }
}

fn toggle_heading(editor: &mut Editor) -> Result<(), CommandError> {
    let blocks = selected_style_block_paths(editor);
    if blocks.is_empty() {
        return Ok(());
    }

    let levels: Vec<Option<u8>> = blocks
        .iter()
        .map(|path| match element_at_path(editor.doc(), path) {
            Some(ElementNode {
                kind: ElementKind::Heading { level },
                ..
            }) => Some(*level),
            _ => None,
        })
        .collect();
    let uniform = levels
        .first()
        .copied()
        .flatten()
        .filter(|level| levels.iter().all(|l| *l == Some(*level)));

    let target = match uniform {
        Some(1) | Some(2) => Some(3),
        Some(3) => None,
        Some(_) => Some(2),
        None => Some(2),
    };

    let ops = blocks
        .into_iter()
        .map(|path| Op::SetElementKind {
            path,
            kind: match target {
                Some(level) => ElementKind::Heading { level },
                None => ElementKind::Paragraph,
            },
        })
        .collect();
    editor
        .apply(Transaction::new(ops).source("block.toggle_heading"))
        .map_err(apply_error)
}

fn active_heading_level(editor: &Editor) -> Option<u8> {
    let focus = match editor.selection() {
        Selection::Range(range) => &range.focus.path,
        _ => return None,
    };
    let (_, el) = enclosing_element(editor.doc(), focus, |kind| {
        matches!(kind, ElementKind::Heading { .. })
    })?;
    match el.kind {
        ElementKind::Heading { level } => Some(level),
        _ => None,
    }
}

struct QuotePlugin;

impl EditorPlugin for QuotePlugin {
    fn id(&self) -> &'static str {
        "quote"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: NodeKind::Quote,
            role: NodeRole::Block,
            is_void: false,
        }]
    }

    fn required_kinds(&self) -> Vec<NodeKind> {
        vec![NodeKind::Paragraph, NodeKind::Text]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("block.toggle_quote", "Toggle quote", |editor, _args| {
                let blocks = selected_style_block_paths(editor);
                if blocks.is_empty() {
                    return Ok(());
                }
                let all_quotes = blocks.iter().all(|path| {
                    matches!(
                        element_at_path(editor.doc(), path),
                        Some(ElementNode {
                            kind: ElementKind::Quote,
                            ..
                        })
                    )
                });
                let target = if all_quotes {
                    ElementKind::Paragraph
                } else {
                    ElementKind::Quote
                };
                let ops = blocks
                    .into_iter()
                    .map(|path| Op::SetElementKind {
                        path,
                        kind: target.clone(),
                    })
                    .collect();
                editor
                    .apply(Transaction::new(ops).source("block.toggle_quote"))
                    .map_err(apply_error)
            })
            .description("Toggle quote styling on the active block(s).")
            .keywords(["quote", "blockquote", "citation"]),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec {
            id: "block.is_quote".to_string(),
            handler: Arc::new(|editor, _args| {
                let blocks = selected_style_block_paths(editor);
                let active = !blocks.is_empty()
                    && blocks.iter().all(|path| {
                        matches!(
                            element_at_path(editor.doc(), path),
                            Some(ElementNode {
                                kind: ElementKind::Quote,
                                ..
                            })
                        )
                    });
                Ok(Value::Bool(active))
            }),
        }]
    }
}

// ---------------------------------------------------------------------------
// Text format marks
// ---------------------------------------------------------------------------

struct MarksPlugin;

impl EditorPlugin for MarksPlugin {
    fn id(&self) -> &'static str {
        "marks"
    }

    fn required_kinds(&self) -> Vec<NodeKind> {
        vec![NodeKind::Text]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("marks.toggle_bold", "Toggle bold", |editor, _args| {
                toggle_bool_mark(editor, |m| m.bold, |m, v| m.bold = v, "marks.toggle_bold")
            })
            .description("Toggle bold on the current selection.")
            .keywords(["bold", "strong", "mark"]),
            CommandSpec::new("marks.toggle_italic", "Toggle italic", |editor, _args| {
                toggle_bool_mark(
                    editor,
                    |m| m.italic,
                    |m, v| m.italic = v,
                    "marks.toggle_italic",
                )
            })
            .description("Toggle italic on the current selection.")
            .keywords(["italic", "emphasis", "mark"]),
            CommandSpec::new("marks.toggle_code", "Toggle code", |editor, _args| {
                toggle_bool_mark(editor, |m| m.code, |m, v| m.code = v, "marks.toggle_code")
            })
            .description("Toggle code mark on the current selection.")
            .keywords(["code", "monospace", "mark"]),
            CommandSpec::new("marks.set_link", "Set link", |editor, args| {
                let url = args
                    .as_ref()
                    .and_then(|v| v.get("url"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CommandError::new("Missing args.url"))?
                    .to_string();
                apply_link(editor, Some(url), "marks.set_link")
            })
            .description("Set a link mark on the current selection.")
            .keywords(["link", "url", "hyperlink"])
            .args_example(serde_json::json!({ "url": "https://example.com" })),
            CommandSpec::new("marks.unset_link", "Unset link", |editor, _args| {
                apply_link(editor, None, "marks.unset_link")
            })
            .description("Remove the link mark from the current selection.")
            .keywords(["link", "unlink", "url"]),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![
            QuerySpec {
                id: "marks.active".to_string(),
                handler: Arc::new(|editor, _args| {
                    serde_json::to_value(active_marks(editor))
                        .map_err(|err| QueryError::new(format!("Failed to encode marks: {err}")))
                }),
            },
            QuerySpec {
                id: "marks.has_link".to_string(),
                handler: Arc::new(|editor, _args| {
                    Ok(Value::Bool(active_marks(editor).link.is_some()))
                }),
            },
        ]
    }
}

fn active_marks(editor: &Editor) -> Marks {
    let Selection::Range(range) = editor.selection() else {
        return Marks::default();
    };
    match node_at_path(editor.doc(), &range.focus.path) {
        Some(Node::Text(text)) => text.marks.clone(),
        _ => Marks::default(),
    }
}

fn toggle_bool_mark(
    editor: &mut Editor,
    get: fn(&Marks) -> bool,
    set: fn(&mut Marks, bool),
    source: &'static str,
) -> Result<(), CommandError> {
    let Some(range) = editor.selection().range().cloned() else {
        return Ok(());
    };
    if range.is_collapsed() {
        return Ok(());
    }

    let all_set = all_selected_have_mark(editor, &range, get).map_err(CommandError::new)?;
    let target = !all_set;
    let apply = move |mut marks: Marks| {
        set(&mut marks, target);
        marks
    };
    let Some(tx) =
        mark_range_transaction(editor, &range, &apply, source).map_err(CommandError::new)?
    else {
        return Ok(());
    };
    editor.apply(tx).map_err(apply_error)
}

fn apply_link(
    editor: &mut Editor,
    url: Option<String>,
    source: &'static str,
) -> Result<(), CommandError> {
    let Some(range) = editor.selection().range().cloned() else {
        return Ok(());
    };
    if range.is_collapsed() {
        return Ok(());
    }
    let apply = move |mut marks: Marks| {
        marks.link = url.clone();
        marks
    };
    let Some(tx) =
        mark_range_transaction(editor, &range, &apply, source).map_err(CommandError::new)?
    else {
        return Ok(());
    };
    editor.apply(tx).map_err(apply_error)
}

// ---------------------------------------------------------------------------
// Inline math
// ---------------------------------------------------------------------------

pub struct MathInlinePlugin {
    delimiters: DelimiterSet,
}

impl MathInlinePlugin {
    pub fn new() -> Self {
        Self {
            delimiters: DelimiterSet::inline(),
        }
    }

    pub fn with_delimiters(pairs: &[DelimiterPair]) -> Result<Self, RegistryError> {
        Ok(Self {
            delimiters: DelimiterSet::new(pairs)?,
        })
    }
}

impl Default for MathInlinePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl EditorPlugin for MathInlinePlugin {
    fn id(&self) -> &'static str {
        "math.inline"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: NodeKind::Math,
            role: NodeRole::Inline,
            is_void: true,
        }]
    }

    fn required_kinds(&self) -> Vec<NodeKind> {
        vec![NodeKind::Paragraph, NodeKind::Text]
    }

    fn text_transforms(&self) -> Vec<Box<dyn TextRunTransform>> {
        vec![Box::new(DelimiterMathTransform {
            id: "math.inline.delimiters",
            delimiters: self.delimiters.clone(),
            inline: true,
        })]
    }

    fn event_handlers(&self) -> Vec<EventHandlerSpec> {
        vec![
            EventHandlerSpec::new(
                "math.inline.mode_switch",
                EventKind::SelectionChange,
                Priority::High,
                |editor, _event| inline_mode_switch(editor),
            ),
            EventHandlerSpec::new(
                "math.inline.escape_space",
                EventKind::SelectionChange,
                Priority::Normal,
                |editor, _event| inline_escape_space(editor),
            ),
            EventHandlerSpec::new(
                "math.inline.render_on_blur",
                EventKind::Blur,
                Priority::High,
                |editor, _event| {
                    render_inline_sources(editor, &[])?;
                    editor.select(Selection::None);
                    Ok(false)
                },
            ),
            EventHandlerSpec::new(
                "math.inline.enter_from_left",
                EventKind::KeyArrowRight,
                Priority::High,
                |editor, _event| inline_enter_adjacent(editor, AdjacentSide::After),
            ),
            EventHandlerSpec::new(
                "math.inline.enter_from_right",
                EventKind::KeyBackspace,
                Priority::High,
                |editor, _event| inline_enter_adjacent(editor, AdjacentSide::Before),
            ),
        ]
    }
}

fn strip_inline_delimiters(equation: &str) -> String {
    if equation.len() >= 2 && equation.starts_with('$') && equation.ends_with('$') {
        equation[1..equation.len() - 1].to_string()
    } else if equation.len() >= 4 && equation.starts_with("\\(") && equation.ends_with("\\)") {
        equation[2..equation.len() - 2].to_string()
    } else {
        equation.to_string()
    }
}

fn strip_display_delimiters(equation: &str) -> String {
    if equation.len() >= 4
        && ((equation.starts_with("$$") && equation.ends_with("$$"))
            || (equation.starts_with("\\[") && equation.ends_with("\\]")))
    {
        equation[2..equation.len() - 2].to_string()
    } else {
        equation.to_string()
    }
}

/// Re-renders an inline editable's raw text. A source the user wrapped in an
/// extra `$...$` pair is promoted to display math; everything else becomes
/// inline math again.
pub(crate) fn rendered_inline_from_source(source: &str) -> Node {
    if source.len() >= 2 && source.starts_with('$') && source.ends_with('$') {
        let inner = &source[1..source.len() - 1];
        Node::math(format!("$${inner}$$"), false)
    } else {
        Node::math(format!("${source}$"), true)
    }
}

fn rendered_block_from_source(source: &str) -> Node {
    Node::math(format!("$${source}$$"), false)
}

fn inline_mode_switch(editor: &mut Editor) -> Result<bool, CommandError> {
    if let Selection::Node { path } = editor.selection().clone() {
        if let Some(Node::Void(VoidNode {
            kind: VoidKind::Math {
                equation,
                inline: true,
            },
        })) = node_at_path(editor.doc(), &path)
        {
            let source = strip_inline_delimiters(equation);
            let caret = Point::new(path.clone(), source.len());
            let tx = Transaction::new(vec![
                Op::RemoveNode { path: path.clone() },
                Op::InsertNode {
                    path,
                    node: Node::math_source(source),
                },
            ])
            .selection_after(Selection::caret(caret))
            .source("math.inline.edit");
            editor.apply(tx).map_err(apply_error)?;
            return Ok(true);
        }
    }

    let excluded = covered_leaf_paths(editor.doc(), editor.selection());
    render_inline_sources(editor, &excluded)?;
    Ok(false)
}

/// Converts every inline editable run outside `excluded` back to a rendered
/// math node; runs whose content became empty are removed instead.
fn render_inline_sources(editor: &mut Editor, excluded: &[Path]) -> Result<bool, CommandError> {
    let mut targets: Vec<(Path, String)> = Vec::new();
    collect_nodes(editor.doc(), &mut |path, node| {
        if let Node::Text(t) = node {
            if t.role == TextRole::MathSource && !excluded.iter().any(|p| p.as_slice() == path) {
                targets.push((path.to_vec(), t.text.clone()));
            }
        }
    });

    if targets.is_empty() {
        return Ok(false);
    }

    let mut ops = Vec::new();
    for (path, text) in targets.into_iter().rev() {
        if text.is_empty() {
            ops.push(Op::RemoveNode { path });
        } else {
            ops.push(Op::RemoveNode { path: path.clone() });
            ops.push(Op::InsertNode {
                path,
                node: rendered_inline_from_source(&text),
            });
        }
    }
    editor
        .apply(Transaction::new(ops).source("math.inline.render"))
        .map_err(apply_error)?;
    Ok(true)
}

/// While the caret sits in an inline editable with nothing after it, a
/// plain space is appended so the user can escape to the right.
fn inline_escape_space(editor: &mut Editor) -> Result<bool, CommandError> {
    let Some(point) = editor.selection().collapsed_point().cloned() else {
        return Ok(false);
    };
    let Some(Node::Text(run)) = node_at_path(editor.doc(), &point.path) else {
        return Ok(false);
    };
    if run.role != TextRole::MathSource {
        return Ok(false);
    }
    let Some((&run_ix, parent_path)) = point.path.split_last() else {
        return Ok(false);
    };
    let sibling_count = if parent_path.is_empty() {
        editor.doc().children.len()
    } else {
        match element_at_path(editor.doc(), parent_path) {
            Some(el) => el.children.len(),
            None => return Ok(false),
        }
    };
    if run_ix + 1 < sibling_count {
        return Ok(false);
    }
    let tx = Transaction::new(vec![Op::InsertNode {
        path: child_path(parent_path, run_ix + 1),
        node: Node::text(" "),
    }])
    .source("math.inline.escape_space");
    editor.apply(tx).map_err(apply_error)?;
    Ok(false)
}

enum AdjacentSide {
    Before,
    After,
}

/// Arrow-right immediately before an inline rendered math enters it at the
/// start; backspace immediately after enters it at the end.
fn inline_enter_adjacent(editor: &mut Editor, side: AdjacentSide) -> Result<bool, CommandError> {
    let Some(point) = editor.selection().collapsed_point().cloned() else {
        return Ok(false);
    };
    let Some(Node::Text(run)) = node_at_path(editor.doc(), &point.path) else {
        return Ok(false);
    };
    let Some((&run_ix, parent_path)) = point.path.split_last() else {
        return Ok(false);
    };

    let adjacent_ix = match side {
        AdjacentSide::After => {
            if point.offset != run.text.len() {
                return Ok(false);
            }
            run_ix + 1
        }
        AdjacentSide::Before => {
            if point.offset != 0 || run_ix == 0 {
                return Ok(false);
            }
            run_ix - 1
        }
    };

    let adjacent_path = child_path(parent_path, adjacent_ix);
    let Some(Node::Void(VoidNode {
        kind: VoidKind::Math {
            equation,
            inline: true,
        },
    })) = node_at_path(editor.doc(), &adjacent_path)
    else {
        return Ok(false);
    };

    let source = strip_inline_delimiters(equation);
    let caret_offset = match side {
        AdjacentSide::After => 0,
        AdjacentSide::Before => source.len(),
    };
    let caret = Point::new(adjacent_path.clone(), caret_offset);
    let tx = Transaction::new(vec![
        Op::RemoveNode {
            path: adjacent_path.clone(),
        },
        Op::InsertNode {
            path: adjacent_path,
            node: Node::math_source(source),
        },
    ])
    .selection_after(Selection::caret(caret))
    .source("math.inline.edit");
    editor.apply(tx).map_err(apply_error)?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Block math
// ---------------------------------------------------------------------------

pub struct MathBlockPlugin {
    delimiters: DelimiterSet,
}

impl MathBlockPlugin {
    pub fn new() -> Self {
        Self {
            delimiters: DelimiterSet::display(),
        }
    }

    pub fn with_delimiters(pairs: &[DelimiterPair]) -> Result<Self, RegistryError> {
        Ok(Self {
            delimiters: DelimiterSet::new(pairs)?,
        })
    }
}

impl Default for MathBlockPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl EditorPlugin for MathBlockPlugin {
    fn id(&self) -> &'static str {
        "math.block"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: NodeKind::MathSourceBlock,
            role: NodeRole::Block,
            is_void: false,
        }]
    }

    fn required_kinds(&self) -> Vec<NodeKind> {
        vec![
            NodeKind::Math,
            NodeKind::Paragraph,
            NodeKind::Text,
            NodeKind::LineBreak,
        ]
    }

    fn text_transforms(&self) -> Vec<Box<dyn TextRunTransform>> {
        vec![
            Box::new(BlockTriggerTransform {
                id: "math.block.trigger",
                token: "$$ ",
                build: empty_math_block,
            }),
            Box::new(DelimiterMathTransform {
                id: "math.block.delimiters",
                delimiters: self.delimiters.clone(),
                inline: false,
            }),
        ]
    }

    fn event_handlers(&self) -> Vec<EventHandlerSpec> {
        vec![
            EventHandlerSpec::new(
                "math.block.mode_switch",
                EventKind::SelectionChange,
                Priority::High,
                |editor, _event| block_mode_switch(editor),
            ),
            EventHandlerSpec::new(
                "math.block.render_on_blur",
                EventKind::Blur,
                Priority::High,
                |editor, _event| {
                    render_block_sources(editor, &[])?;
                    editor.select(Selection::None);
                    Ok(false)
                },
            ),
            EventHandlerSpec::new(
                "math.block.enter",
                EventKind::KeyEnter,
                Priority::High,
                |editor, _event| {
                    editable_block_enter(editor, |kind| {
                        matches!(kind, ElementKind::MathSourceBlock)
                    })
                },
            ),
            EventHandlerSpec::new(
                "math.block.enter_from_right",
                EventKind::KeyBackspace,
                Priority::High,
                |editor, _event| block_enter_from_right(editor),
            ),
        ]
    }
}

fn empty_math_block() -> Node {
    Node::Element(ElementNode {
        kind: ElementKind::MathSourceBlock,
        children: vec![Node::text("")],
    })
}

fn empty_code_block() -> Node {
    Node::Element(ElementNode {
        kind: ElementKind::CodeBlock { language: None },
        children: vec![Node::text("")],
    })
}

fn math_block_with_source(source: &str) -> (Node, usize) {
    let node = Node::Element(ElementNode {
        kind: ElementKind::MathSourceBlock,
        children: vec![Node::text(source)],
    });
    (node, source.len())
}

fn block_mode_switch(editor: &mut Editor) -> Result<bool, CommandError> {
    if let Selection::Node { path } = editor.selection().clone() {
        if let Some(Node::Void(VoidNode {
            kind: VoidKind::Math {
                equation,
                inline: false,
            },
        })) = node_at_path(editor.doc(), &path)
        {
            let source = strip_display_delimiters(equation);
            let (node, caret_offset) = math_block_with_source(&source);
            let caret = Point::new(child_path(&path, 0), caret_offset);
            let tx = Transaction::new(vec![
                Op::RemoveNode { path: path.clone() },
                Op::InsertNode { path, node },
            ])
            .selection_after(Selection::caret(caret))
            .source("math.block.edit");
            editor.apply(tx).map_err(apply_error)?;
            return Ok(true);
        }
    }

    let excluded = covered_leaf_paths(editor.doc(), editor.selection());
    render_block_sources(editor, &excluded)?;
    Ok(false)
}

/// Converts every block editable outside `excluded` back to rendered display
/// math; blocks whose content became empty are removed instead. A block is
/// excluded when any covered path lies inside it, which keeps a block under
/// partial selection from being force-rendered.
fn render_block_sources(editor: &mut Editor, excluded: &[Path]) -> Result<bool, CommandError> {
    let mut targets: Vec<(Path, String)> = Vec::new();
    collect_nodes(editor.doc(), &mut |path, node| {
        if let Node::Element(el) = node {
            if matches!(el.kind, ElementKind::MathSourceBlock)
                && !excluded.iter().any(|p| p.starts_with(path))
            {
                targets.push((path.to_vec(), inline_text_content(&el.children)));
            }
        }
    });

    if targets.is_empty() {
        return Ok(false);
    }

    let mut ops = Vec::new();
    for (path, content) in targets.into_iter().rev() {
        if content.is_empty() {
            ops.push(Op::RemoveNode { path });
        } else {
            ops.push(Op::RemoveNode { path: path.clone() });
            ops.push(Op::InsertNode {
                path,
                node: rendered_block_from_source(&content),
            });
        }
    }
    editor
        .apply(Transaction::new(ops).source("math.block.render"))
        .map_err(apply_error)?;
    Ok(true)
}

fn block_enter_from_right(editor: &mut Editor) -> Result<bool, CommandError> {
    let Some(point) = editor.selection().collapsed_point().cloned() else {
        return Ok(false);
    };
    if point.offset != 0 {
        return Ok(false);
    }
    let Some((&run_ix, parent_path)) = point.path.split_last() else {
        return Ok(false);
    };
    if run_ix == 0 {
        return Ok(false);
    }
    let adjacent_path = child_path(parent_path, run_ix - 1);
    let Some(Node::Void(VoidNode {
        kind: VoidKind::Math {
            equation,
            inline: false,
        },
    })) = node_at_path(editor.doc(), &adjacent_path)
    else {
        return Ok(false);
    };

    let source = strip_display_delimiters(equation);
    let (node, caret_offset) = math_block_with_source(&source);
    let caret = Point::new(child_path(&adjacent_path, 0), caret_offset);
    let tx = Transaction::new(vec![
        Op::RemoveNode {
            path: adjacent_path.clone(),
        },
        Op::InsertNode {
            path: adjacent_path,
            node,
        },
    ])
    .selection_after(Selection::caret(caret))
    .source("math.block.edit");
    editor.apply(tx).map_err(apply_error)?;
    Ok(true)
}

/// Enter inside an editable block. One consistent rule: with the caret at
/// the very end, an empty block or an empty trailing line exits the block
/// (a paragraph is inserted after it and selected); anywhere else a line
/// break is inserted.
fn editable_block_enter(
    editor: &mut Editor,
    is_kind: fn(&ElementKind) -> bool,
) -> Result<bool, CommandError> {
    let Some(point) = editor.selection().collapsed_point().cloned() else {
        return Ok(false);
    };
    let Some((block_path, block)) = enclosing_element(editor.doc(), &point.path, is_kind) else {
        return Ok(false);
    };
    if block_path.len() + 1 != point.path.len() {
        return Ok(false);
    }
    let children = block.children.clone();
    let child_ix = point.path[block_path.len()];
    let Some(Node::Text(run)) = children.get(child_ix) else {
        return Ok(false);
    };
    let offset = clamp_to_char_boundary(&run.text, point.offset);

    let at_block_end = child_ix == children.len() - 1 && offset == run.text.len();
    if at_block_end {
        let content = inline_text_content(&children);
        let empty_block = content.is_empty();
        let trailing_empty_line = run.text.is_empty()
            && child_ix >= 1
            && children
                .get(child_ix - 1)
                .is_some_and(Node::is_line_break);

        if empty_block || trailing_empty_line {
            let mut ops = Vec::new();
            if trailing_empty_line && !empty_block {
                ops.push(Op::RemoveNode {
                    path: child_path(&block_path, child_ix),
                });
                ops.push(Op::RemoveNode {
                    path: child_path(&block_path, child_ix - 1),
                });
            }

            // The block may live inline in a paragraph; the fresh paragraph
            // goes after that paragraph, or after the block itself when it
            // is top-level.
            let (parent_path, after_ix) = match enclosing_element(
                editor.doc(),
                &block_path,
                |kind| matches!(kind, ElementKind::Paragraph),
            ) {
                Some((paragraph_path, _)) => {
                    let ix = paragraph_path.last().copied().unwrap_or(0);
                    let parent = paragraph_path[..paragraph_path.len() - 1].to_vec();
                    (parent, ix + 1)
                }
                None => {
                    let ix = block_path.last().copied().unwrap_or(0);
                    let parent = block_path[..block_path.len() - 1].to_vec();
                    (parent, ix + 1)
                }
            };
            let paragraph_path = child_path(&parent_path, after_ix);
            ops.push(Op::InsertNode {
                path: paragraph_path.clone(),
                node: Node::paragraph(""),
            });
            let caret = Point::new(child_path(&paragraph_path, 0), 0);
            let tx = Transaction::new(ops)
                .selection_after(Selection::caret(caret))
                .source("editable_block.exit");
            editor.apply(tx).map_err(apply_error)?;
            return Ok(true);
        }

        // Fresh empty line at the end.
        let ops = vec![
            Op::InsertNode {
                path: child_path(&block_path, child_ix + 1),
                node: Node::line_break(),
            },
            Op::InsertNode {
                path: child_path(&block_path, child_ix + 2),
                node: Node::text(""),
            },
        ];
        let caret = Point::new(child_path(&block_path, child_ix + 2), 0);
        let tx = Transaction::new(ops)
            .selection_after(Selection::caret(caret))
            .source("editable_block.line_break");
        editor.apply(tx).map_err(apply_error)?;
        return Ok(true);
    }

    // Split the current run at the caret and insert a line break.
    let mut ops = Vec::new();
    let caret;
    if offset < run.text.len() {
        let tail = run.text[offset..].to_string();
        ops.push(Op::RemoveText {
            path: point.path.clone(),
            range: offset..run.text.len(),
        });
        ops.push(Op::InsertNode {
            path: child_path(&block_path, child_ix + 1),
            node: Node::line_break(),
        });
        ops.push(Op::InsertNode {
            path: child_path(&block_path, child_ix + 2),
            node: Node::Text(TextNode {
                text: tail,
                marks: run.marks.clone(),
                role: run.role,
            }),
        });
        caret = Point::new(child_path(&block_path, child_ix + 2), 0);
    } else {
        ops.push(Op::InsertNode {
            path: child_path(&block_path, child_ix + 1),
            node: Node::line_break(),
        });
        if matches!(children.get(child_ix + 1), Some(Node::Text(_))) {
            caret = Point::new(child_path(&block_path, child_ix + 2), 0);
        } else {
            ops.push(Op::InsertNode {
                path: child_path(&block_path, child_ix + 2),
                node: Node::text(""),
            });
            caret = Point::new(child_path(&block_path, child_ix + 2), 0);
        }
    }
    let tx = Transaction::new(ops)
        .selection_after(Selection::caret(caret))
        .source("editable_block.line_break");
    editor.apply(tx).map_err(apply_error)?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Code block
// ---------------------------------------------------------------------------

struct CodeBlockPlugin;

impl EditorPlugin for CodeBlockPlugin {
    fn id(&self) -> &'static str {
        "code_block"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: NodeKind::CodeBlock,
            role: NodeRole::Block,
            is_void: false,
        }]
    }

    fn required_kinds(&self) -> Vec<NodeKind> {
        vec![NodeKind::Paragraph, NodeKind::Text, NodeKind::LineBreak]
    }

    fn text_transforms(&self) -> Vec<Box<dyn TextRunTransform>> {
        vec![Box::new(BlockTriggerTransform {
            id: "code_block.trigger",
            token: "``` ",
            build: empty_code_block,
        })]
    }

    fn event_handlers(&self) -> Vec<EventHandlerSpec> {
        vec![
            EventHandlerSpec::new(
                "code_block.delete_empty",
                EventKind::KeyBackspace,
                Priority::High,
                |editor, _event| code_block_delete_empty(editor),
            ),
            EventHandlerSpec::new(
                "code_block.enter",
                EventKind::KeyEnter,
                Priority::High,
                |editor, _event| {
                    editable_block_enter(editor, |kind| {
                        matches!(kind, ElementKind::CodeBlock { .. })
                    })
                },
            ),
        ]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("code_block.insert", "Insert code block", |editor, _args| {
                let Some(range) = editor.prev_selection().range().cloned() else {
                    tracing::debug!("code_block.insert: no previous range selection");
                    return Ok(());
                };
                let (ops, code_path, _) =
                    insert_block_after_range(editor.doc(), &range, empty_code_block());
                let caret = Point::new(child_path(&code_path, 0), 0);
                let tx = Transaction::new(ops)
                    .selection_after(Selection::caret(caret))
                    .source("code_block.insert");
                editor.apply(tx).map_err(apply_error)
            })
            .description("Insert an empty code block after the active block.")
            .keywords(["code", "code block", "pre", "monospace"]),
            CommandSpec::new(
                "code_block.set_language",
                "Set code language",
                |editor, args| {
                    let language = args
                        .as_ref()
                        .and_then(|v| v.get("language"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    let Some(focus_path) = selection_focus_path(editor.selection()) else {
                        return Ok(());
                    };
                    let Some((block_path, _)) =
                        enclosing_element(editor.doc(), &focus_path, |kind| {
                            matches!(kind, ElementKind::CodeBlock { .. })
                        })
                    else {
                        tracing::debug!("code_block.set_language: no active code block");
                        return Ok(());
                    };
                    let tx = Transaction::new(vec![Op::SetElementKind {
                        path: block_path,
                        kind: ElementKind::CodeBlock { language },
                    }])
                    .source("code_block.set_language");
                    editor.apply(tx).map_err(apply_error)
                },
            )
            .description("Set the highlight language of the active code block.")
            .keywords(["code", "language", "syntax", "highlight"])
            .args_example(serde_json::json!({ "language": "rust" })),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![
            QuerySpec {
                id: "code_block.is_active".to_string(),
                handler: Arc::new(|editor, _args| {
                    Ok(Value::Bool(active_code_block(editor).is_some()))
                }),
            },
            QuerySpec {
                id: "code_block.language".to_string(),
                handler: Arc::new(|editor, _args| {
                    Ok(match active_code_block(editor) {
                        Some((_, Some(language))) => Value::String(language),
                        _ => Value::Null,
                    })
                }),
            },
        ]
    }
}

fn selection_focus_path(selection: &Selection) -> Option<Path> {
    match selection {
        Selection::Range(range) => Some(range.focus.path.clone()),
        Selection::Node { path } => Some(path.clone()),
        Selection::None => None,
    }
}

fn active_code_block(editor: &Editor) -> Option<(Path, Option<String>)> {
    let focus_path = selection_focus_path(editor.selection())?;
    let (path, el) = enclosing_element(editor.doc(), &focus_path, |kind| {
        matches!(kind, ElementKind::CodeBlock { .. })
    })?;
    match &el.kind {
        ElementKind::CodeBlock { language } => Some((path, language.clone())),
        _ => None,
    }
}

/// Backspace with the caret at offset 0 of an empty code block deletes the
/// block.
fn code_block_delete_empty(editor: &mut Editor) -> Result<bool, CommandError> {
    let Some(point) = editor.selection().collapsed_point().cloned() else {
        return Ok(false);
    };
    if point.offset != 0 {
        return Ok(false);
    }
    let Some((block_path, block)) = enclosing_element(editor.doc(), &point.path, |kind| {
        matches!(kind, ElementKind::CodeBlock { .. })
    }) else {
        return Ok(false);
    };
    if !inline_text_content(&block.children).is_empty() {
        return Ok(false);
    }
    let tx = Transaction::new(vec![Op::RemoveNode { path: block_path }])
        .source("code_block.delete_empty");
    editor.apply(tx).map_err(apply_error)?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Lists
// ---------------------------------------------------------------------------

struct ListPlugin;

impl EditorPlugin for ListPlugin {
    fn id(&self) -> &'static str {
        "list"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![
            NodeSpec {
                kind: NodeKind::List,
                role: NodeRole::Block,
                is_void: false,
            },
            NodeSpec {
                kind: NodeKind::ListItem,
                role: NodeRole::Block,
                is_void: false,
            },
        ]
    }

    fn required_kinds(&self) -> Vec<NodeKind> {
        vec![NodeKind::Paragraph, NodeKind::Text]
    }

    fn text_transforms(&self) -> Vec<Box<dyn TextRunTransform>> {
        vec![Box::new(ListPrefixTransform)]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![Box::new(ClampListIndent), Box::new(RemoveEmptyLists)]
    }

    fn event_handlers(&self) -> Vec<EventHandlerSpec> {
        vec![EventHandlerSpec::new(
            "list.indent",
            EventKind::KeyTab,
            Priority::High,
            |editor, event| {
                let EditorEvent::KeyTab { shift } = event else {
                    return Ok(false);
                };
                list_adjust_indent(editor, *shift)
            },
        )]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec {
            id: "list.active_kind".to_string(),
            handler: Arc::new(|editor, _args| {
                Ok(match active_list_kind(editor) {
                    Some(ListKind::Bulleted) => Value::String("bulleted".to_string()),
                    Some(ListKind::Ordered) => Value::String("ordered".to_string()),
                    None => Value::Null,
                })
            }),
        }]
    }
}

struct ListPrefixTransform;

impl TextRunTransform for ListPrefixTransform {
    fn id(&self) -> &'static str {
        "list.prefix"
    }

    fn phase(&self) -> TransformPhase {
        TransformPhase::ListPrefix
    }

    fn transform(
        &self,
        doc: &Document,
        path: &[usize],
        run: &TextNode,
        selection: &Selection,
    ) -> Option<TransformOutcome> {
        let point = selection.collapsed_point()?;
        if point.path != path {
            return None;
        }
        let kind = match run.text.as_str() {
            "1. " if point.offset == 3 => ListKind::Ordered,
            "- " if point.offset == 2 => ListKind::Bulleted,
            _ => return None,
        };

        let (&run_ix, parent_path) = path.split_last()?;
        if run_ix != 0 {
            return None;
        }
        let parent = element_at_path(doc, parent_path)?;
        if !matches!(parent.kind, ElementKind::Paragraph) {
            return None;
        }

        // The trigger text is cleared; the paragraph's remaining children
        // move into the first item.
        let mut item_children = vec![Node::text("")];
        item_children.extend(parent.children.iter().skip(1).cloned());
        let list = Node::Element(ElementNode {
            kind: ElementKind::List { list: kind },
            children: vec![Node::Element(ElementNode {
                kind: ElementKind::ListItem { indent: 0 },
                children: item_children,
            })],
        });

        let ops = vec![
            Op::RemoveNode {
                path: parent_path.to_vec(),
            },
            Op::InsertNode {
                path: parent_path.to_vec(),
                node: list,
            },
        ];
        let mut caret_path = parent_path.to_vec();
        caret_path.extend([0, 0]);
        Some(TransformOutcome {
            ops,
            selection_after: Some(Selection::caret(Point::new(caret_path, 0))),
        })
    }
}

struct ClampListIndent;

impl NormalizePass for ClampListIndent {
    fn id(&self) -> &'static str {
        "list.clamp_indent"
    }

    fn run(&self, doc: &Document) -> Vec<Op> {
        let mut ops = Vec::new();

        fn walk(children: &[Node], path: &mut Vec<usize>, ops: &mut Vec<Op>) {
            for (ix, node) in children.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };
                path.push(ix);
                if let ElementKind::ListItem { indent } = el.kind {
                    if indent > MAX_INDENT_LEVEL {
                        ops.push(Op::SetElementKind {
                            path: path.clone(),
                            kind: ElementKind::ListItem {
                                indent: MAX_INDENT_LEVEL,
                            },
                        });
                    }
                }
                walk(&el.children, path, ops);
                path.pop();
            }
        }

        walk(&doc.children, &mut Vec::new(), &mut ops);
        ops
    }
}

struct RemoveEmptyLists;

impl NormalizePass for RemoveEmptyLists {
    fn id(&self) -> &'static str {
        "list.remove_empty"
    }

    fn run(&self, doc: &Document) -> Vec<Op> {
        let mut ops = Vec::new();

        fn walk(children: &[Node], path: &mut Vec<usize>, ops: &mut Vec<Op>) {
            for (ix, node) in children.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };
                path.push(ix);
                if matches!(el.kind, ElementKind::List { .. })
                    && !el
                        .children
                        .iter()
                        .any(|n| matches!(n, Node::Element(_)))
                {
                    ops.push(Op::RemoveNode { path: path.clone() });
                } else {
                    walk(&el.children, path, ops);
                }
                path.pop();
            }
        }

        walk(&doc.children, &mut Vec::new(), &mut ops);
        ops
    }
}

/// Tab / Shift-Tab inside a list item. Out-of-range requests are no-ops that
/// do not consume the key event.
fn list_adjust_indent(editor: &mut Editor, shift: bool) -> Result<bool, CommandError> {
    let Some(focus_path) = selection_focus_path(editor.selection()) else {
        return Ok(false);
    };
    let Some((item_path, item)) = enclosing_element(editor.doc(), &focus_path, |kind| {
        matches!(kind, ElementKind::ListItem { .. })
    }) else {
        return Ok(false);
    };
    let ElementKind::ListItem { indent } = item.kind else {
        return Ok(false);
    };

    let next = if shift {
        indent.checked_sub(1)
    } else if indent < MAX_INDENT_LEVEL {
        Some(indent + 1)
    } else {
        None
    };
    let Some(next) = next else {
        return Ok(false);
    };

    let tx = Transaction::new(vec![Op::SetElementKind {
        path: item_path,
        kind: ElementKind::ListItem { indent: next },
    }])
    .source("list.indent");
    editor.apply(tx).map_err(apply_error)?;
    Ok(true)
}

fn active_list_kind(editor: &Editor) -> Option<ListKind> {
    let focus_path = selection_focus_path(editor.selection())?;
    let (item_path, _) = enclosing_element(editor.doc(), &focus_path, |kind| {
        matches!(kind, ElementKind::ListItem { .. })
    })?;
    let (_, list) = enclosing_element(editor.doc(), &item_path, |kind| {
        matches!(kind, ElementKind::List { .. })
    })?;
    match list.kind {
        ElementKind::List { list } => Some(list),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

struct ImagePlugin;

impl EditorPlugin for ImagePlugin {
    fn id(&self) -> &'static str {
        "image"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: NodeKind::Image,
            role: NodeRole::Block,
            is_void: true,
        }]
    }

    fn required_kinds(&self) -> Vec<NodeKind> {
        vec![NodeKind::Paragraph]
    }

    fn event_handlers(&self) -> Vec<EventHandlerSpec> {
        vec![
            EventHandlerSpec::new(
                "image.paste",
                EventKind::Paste,
                Priority::High,
                |editor, event| {
                    let EditorEvent::Paste(payload) = event else {
                        return Ok(false);
                    };
                    image_paste(editor, payload)
                },
            ),
            EventHandlerSpec::new(
                "image.track_selected",
                EventKind::SelectionChange,
                Priority::Low,
                |editor, _event| image_track_selected(editor),
            ),
        ]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("image.insert", "Insert image", |editor, args| {
                let src = args
                    .as_ref()
                    .and_then(|v| v.get("src"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| CommandError::new("Missing args.src"))?
                    .to_string();
                let Some(range) = editor.prev_selection().range().cloned() else {
                    tracing::debug!("image.insert: no previous range selection");
                    return Ok(());
                };
                let (ops, image_path, _) =
                    insert_block_after_range(editor.doc(), &range, Node::image(src));
                let tx = Transaction::new(ops)
                    .selection_after(Selection::node(image_path))
                    .source("image.insert");
                editor.apply(tx).map_err(apply_error)
            })
            .description("Insert an image block after the active block.")
            .keywords(["image", "img", "picture", "media"])
            .args_example(serde_json::json!({ "src": "https://example.com/image.png" })),
        ]
    }
}

/// Paste of exactly one image file: insert a rendered image node at the
/// active selection. A failed file read raises a user-visible notice and
/// abandons the edit with nothing inserted.
fn image_paste(editor: &mut Editor, payload: &ClipboardPayload) -> Result<bool, CommandError> {
    let images: Vec<&ClipboardFile> = payload.files.iter().filter(|f| f.is_image()).collect();
    if images.len() != 1 {
        return Ok(false);
    }

    let src = match &images[0].src {
        Ok(src) => src.clone(),
        Err(err) => {
            tracing::warn!(error = %err, "image paste failed");
            editor.push_notice(
                NoticeSeverity::Error,
                format!("Could not paste image: {err}"),
            );
            return Ok(true);
        }
    };

    let range = editor
        .selection()
        .range()
        .or_else(|| editor.prev_selection().range())
        .cloned();
    let Some(range) = range else {
        return Ok(false);
    };

    let (ops, image_path, _) = insert_block_after_range(editor.doc(), &range, Node::image(src));
    let tx = Transaction::new(ops)
        .selection_after(Selection::node(image_path))
        .source("image.paste");
    editor.apply(tx).map_err(apply_error)?;
    Ok(true)
}

/// Keeps the tree-stored `selected` flag of image nodes in sync with the
/// node selection, instead of mutating presentation state out of band.
fn image_track_selected(editor: &mut Editor) -> Result<bool, CommandError> {
    let selected_path = match editor.selection() {
        Selection::Node { path }
            if matches!(
                node_at_path(editor.doc(), path),
                Some(Node::Void(VoidNode {
                    kind: VoidKind::Image { .. }
                }))
            ) =>
        {
            Some(path.clone())
        }
        _ => None,
    };

    let mut ops = Vec::new();
    collect_nodes(editor.doc(), &mut |path, node| {
        if let Node::Void(VoidNode {
            kind: VoidKind::Image { src, selected },
        }) = node
        {
            let want = selected_path.as_deref() == Some(path);
            if *selected != want {
                ops.push(Op::SetVoidKind {
                    path: path.to_vec(),
                    kind: VoidKind::Image {
                        src: src.clone(),
                        selected: want,
                    },
                });
            }
        }
    });

    if ops.is_empty() {
        return Ok(false);
    }
    editor
        .apply(Transaction::new(ops).source("image.track_selected"))
        .map_err(apply_error)?;
    Ok(false)
}

// ---------------------------------------------------------------------------
// Shared transforms
// ---------------------------------------------------------------------------

/// An exact block-opener token (`"$$ "`, "``` ") typed as the sole content
/// of a paragraph line converts the line into an empty editable block.
struct BlockTriggerTransform {
    id: &'static str,
    token: &'static str,
    build: fn() -> Node,
}

impl TextRunTransform for BlockTriggerTransform {
    fn id(&self) -> &'static str {
        self.id
    }

    fn phase(&self) -> TransformPhase {
        TransformPhase::BlockTrigger
    }

    fn transform(
        &self,
        doc: &Document,
        path: &[usize],
        run: &TextNode,
        _selection: &Selection,
    ) -> Option<TransformOutcome> {
        // Trailing content beyond the trigger means the token was typed
        // mid-line; leave it alone.
        if run.text != self.token {
            return None;
        }
        let (&run_ix, parent_path) = path.split_last()?;
        let parent = element_at_path(doc, parent_path)?;
        if !matches!(parent.kind, ElementKind::Paragraph) {
            return None;
        }
        let sole_child = parent.children.len() == 1;
        let after_break = run_ix > 0
            && parent
                .children
                .get(run_ix - 1)
                .is_some_and(Node::is_line_break);
        if !sole_child && !after_break {
            return None;
        }

        let mut ops = vec![
            Op::RemoveNode {
                path: path.to_vec(),
            },
            Op::InsertNode {
                path: path.to_vec(),
                node: (self.build)(),
            },
        ];
        if parent
            .children
            .get(run_ix + 1)
            .is_some_and(Node::is_line_break)
        {
            ops.push(Op::RemoveNode {
                path: child_path(parent_path, run_ix + 1),
            });
        }

        let caret = Point::new(child_path(path, 0), 0);
        Some(TransformOutcome {
            ops,
            selection_after: Some(Selection::caret(caret)),
        })
    }
}

/// Splits a text run around the earliest delimited span and replaces the
/// span with a rendered math node, keeping the unmatched prefix and suffix
/// as sibling runs.
struct DelimiterMathTransform {
    id: &'static str,
    delimiters: DelimiterSet,
    inline: bool,
}

impl TextRunTransform for DelimiterMathTransform {
    fn id(&self) -> &'static str {
        self.id
    }

    fn phase(&self) -> TransformPhase {
        TransformPhase::Delimiter
    }

    fn transform(
        &self,
        _doc: &Document,
        path: &[usize],
        run: &TextNode,
        selection: &Selection,
    ) -> Option<TransformOutcome> {
        let m = self.delimiters.find_earliest_match(&run.text)?;
        let (&run_ix, parent_path) = path.split_last()?;

        let prefix = &run.text[..m.start];
        let suffix = &run.text[m.end..];
        let caret_offset = selection
            .collapsed_point()
            .filter(|p| p.path == path)
            .map(|p| clamp_to_char_boundary(&run.text, p.offset));

        let mut ops = vec![Op::RemoveNode {
            path: path.to_vec(),
        }];
        let prefix_ix = run_ix;
        let mut next_ix = run_ix;
        if !prefix.is_empty() {
            ops.push(Op::InsertNode {
                path: child_path(parent_path, next_ix),
                node: Node::Text(TextNode {
                    text: prefix.to_string(),
                    marks: run.marks.clone(),
                    role: TextRole::Plain,
                }),
            });
            next_ix += 1;
        }
        ops.push(Op::InsertNode {
            path: child_path(parent_path, next_ix),
            node: Node::math(m.source.clone(), self.inline),
        });
        next_ix += 1;
        let suffix_ix = next_ix;

        // A suffix run is kept even when empty if the caret needs a home
        // after the new node.
        let needs_suffix = !suffix.is_empty() || caret_offset.is_some_and(|o| o > m.start);
        if needs_suffix {
            ops.push(Op::InsertNode {
                path: child_path(parent_path, suffix_ix),
                node: Node::Text(TextNode {
                    text: suffix.to_string(),
                    marks: run.marks.clone(),
                    role: TextRole::Plain,
                }),
            });
        }

        let selection_after = caret_offset.map(|offset| {
            let point = if offset >= m.end && needs_suffix {
                Point::new(child_path(parent_path, suffix_ix), offset - m.end)
            } else if offset <= m.start && !prefix.is_empty() {
                Point::new(child_path(parent_path, prefix_ix), offset)
            } else if needs_suffix {
                Point::new(child_path(parent_path, suffix_ix), 0)
            } else {
                Point::new(child_path(parent_path, prefix_ix), 0)
            };
            Selection::caret(point)
        });

        Some(TransformOutcome {
            ops,
            selection_after,
        })
    }
}

// ---------------------------------------------------------------------------
// Shared selection and tree helpers
// ---------------------------------------------------------------------------

fn collect_nodes(doc: &Document, visit: &mut dyn FnMut(&[usize], &Node)) {
    fn walk(children: &[Node], path: &mut Vec<usize>, visit: &mut dyn FnMut(&[usize], &Node)) {
        for (ix, node) in children.iter().enumerate() {
            path.push(ix);
            visit(path, node);
            if let Node::Element(el) = node {
                walk(&el.children, path, visit);
            }
            path.pop();
        }
    }
    walk(&doc.children, &mut Vec::new(), visit);
}

/// The element at `path`, or its nearest ancestor, matching `pred`.
fn enclosing_element<'a>(
    doc: &'a Document,
    path: &[usize],
    pred: fn(&ElementKind) -> bool,
) -> Option<(Path, &'a ElementNode)> {
    for len in (1..=path.len()).rev() {
        let prefix = &path[..len];
        if let Some(Node::Element(el)) = node_at_path(doc, prefix) {
            if pred(&el.kind) {
                return Some((prefix.to_vec(), el));
            }
        }
    }
    None
}

fn ordered_points(range: &RangeSelection) -> (Point, Point) {
    let mut start = range.anchor.clone();
    let mut end = range.focus.clone();

    if start.path == end.path {
        if end.offset < start.offset {
            std::mem::swap(&mut start, &mut end);
        }
        return (start, end);
    }
    if end.path < start.path {
        std::mem::swap(&mut start, &mut end);
    }
    (start, end)
}

/// The leaf paths a selection covers: the selected node for a node
/// selection, every leaf between the endpoints for a range. Block-construct
/// membership is decided by prefix tests against these paths.
fn covered_leaf_paths(doc: &Document, selection: &Selection) -> Vec<Path> {
    match selection {
        Selection::None => Vec::new(),
        Selection::Node { path } => vec![path.clone()],
        Selection::Range(range) => {
            let (start, end) = ordered_points(range);
            let mut out = Vec::new();
            collect_nodes(doc, &mut |path, node| {
                if matches!(node, Node::Element(_)) {
                    return;
                }
                if path >= start.path.as_slice() && path <= end.path.as_slice() {
                    out.push(path.to_vec());
                }
            });
            out
        }
    }
}

/// Blocks that style commands target, in document order.
fn style_blocks_in_order(doc: &Document) -> Vec<Path> {
    fn is_style_block(kind: &ElementKind) -> bool {
        matches!(
            kind,
            ElementKind::Paragraph | ElementKind::Heading { .. } | ElementKind::Quote
        )
    }

    fn walk(children: &[Node], path: &mut Vec<usize>, out: &mut Vec<Path>) {
        for (ix, node) in children.iter().enumerate() {
            let Node::Element(el) = node else {
                continue;
            };
            path.push(ix);
            if is_style_block(&el.kind) {
                out.push(path.clone());
            } else {
                walk(&el.children, path, out);
            }
            path.pop();
        }
    }

    let mut out = Vec::new();
    walk(&doc.children, &mut Vec::new(), &mut out);
    out
}

fn selected_style_block_paths(editor: &Editor) -> Vec<Path> {
    let Some(range) = editor.selection().range() else {
        return Vec::new();
    };
    let (start, end) = ordered_points(range);
    let blocks = style_blocks_in_order(editor.doc());

    let start_ix = blocks.iter().position(|p| start.path.starts_with(p));
    let end_ix = blocks.iter().rposition(|p| end.path.starts_with(p));
    let (Some(start_ix), Some(end_ix)) = (start_ix, end_ix) else {
        return Vec::new();
    };
    let (start_ix, end_ix) = if start_ix <= end_ix {
        (start_ix, end_ix)
    } else {
        (end_ix, start_ix)
    };
    blocks[start_ix..=end_ix].to_vec()
}

/// Text blocks (inline-children elements) in document order, with paths.
fn text_blocks_in_order(doc: &Document) -> Vec<(Path, &ElementNode)> {
    fn walk<'a>(children: &'a [Node], path: &mut Vec<usize>, out: &mut Vec<(Path, &'a ElementNode)>) {
        for (ix, node) in children.iter().enumerate() {
            let Node::Element(el) = node else {
                continue;
            };
            path.push(ix);
            if el.kind.is_text_block() {
                out.push((path.clone(), el));
            } else {
                walk(&el.children, path, out);
            }
            path.pop();
        }
    }

    let mut out = Vec::new();
    walk(&doc.children, &mut Vec::new(), &mut out);
    out
}

fn total_inline_text_len(children: &[Node]) -> usize {
    children
        .iter()
        .map(|n| match n {
            Node::Text(t) => t.text.len(),
            Node::Void(v) => v.inline_text_len(),
            Node::Element(_) => 0,
        })
        .sum()
}

fn point_global_offset(children: &[Node], child_ix: usize, offset: usize) -> usize {
    let mut global = 0usize;
    for (ix, node) in children.iter().enumerate() {
        match node {
            Node::Text(t) => {
                if ix < child_ix {
                    global += t.text.len();
                    continue;
                }
                if ix == child_ix {
                    global += clamp_to_char_boundary(&t.text, offset);
                }
                break;
            }
            Node::Void(v) => {
                if ix < child_ix {
                    global += v.inline_text_len();
                    continue;
                }
                if ix == child_ix {
                    global += offset.min(v.inline_text_len());
                }
                break;
            }
            Node::Element(_) => {}
        }
    }
    global
}

fn point_for_global_offset(block_path: &[usize], children: &[Node], global_offset: usize) -> Point {
    let mut remaining = global_offset;
    for (child_ix, node) in children.iter().enumerate() {
        match node {
            Node::Text(t) => {
                if remaining < t.text.len() {
                    return Point::new(
                        child_path(block_path, child_ix),
                        clamp_to_char_boundary(&t.text, remaining),
                    );
                }
                if remaining == t.text.len() {
                    if matches!(children.get(child_ix + 1), Some(Node::Text(_))) {
                        return Point::new(child_path(block_path, child_ix + 1), 0);
                    }
                    return Point::new(child_path(block_path, child_ix), t.text.len());
                }
                remaining = remaining.saturating_sub(t.text.len());
            }
            Node::Void(v) => {
                let len = v.inline_text_len();
                if remaining <= len {
                    for (ix, prev) in children.iter().enumerate().take(child_ix).rev() {
                        if let Node::Text(t) = prev {
                            return Point::new(child_path(block_path, ix), t.text.len());
                        }
                    }
                    for (ix, next) in children.iter().enumerate().skip(child_ix + 1) {
                        if matches!(next, Node::Text(_)) {
                            return Point::new(child_path(block_path, ix), 0);
                        }
                    }
                    break;
                }
                remaining = remaining.saturating_sub(len);
            }
            Node::Element(_) => {}
        }
    }

    for (child_ix, node) in children.iter().enumerate().rev() {
        if let Node::Text(t) = node {
            return Point::new(child_path(block_path, child_ix), t.text.len());
        }
    }
    Point::new(child_path(block_path, 0), 0)
}

fn apply_marks_in_block(
    children: &[Node],
    start_global: usize,
    end_global: usize,
    apply: &dyn Fn(Marks) -> Marks,
) -> Vec<Node> {
    if start_global >= end_global {
        return children.to_vec();
    }

    let mut out: Vec<Node> = Vec::new();
    let mut cursor = 0usize;

    for node in children {
        let (node_start, node_end) = match node {
            Node::Text(t) => {
                let start = cursor;
                let end = cursor + t.text.len();
                cursor = end;
                (start, end)
            }
            Node::Void(v) => {
                cursor += v.inline_text_len();
                out.push(node.clone());
                continue;
            }
            Node::Element(_) => {
                out.push(node.clone());
                continue;
            }
        };

        if end_global <= node_start || start_global >= node_end {
            out.push(node.clone());
            continue;
        }

        let Node::Text(t) = node else {
            out.push(node.clone());
            continue;
        };

        // Marks never apply to editable math runs.
        if t.role != TextRole::Plain {
            out.push(node.clone());
            continue;
        }

        let sel_start = clamp_to_char_boundary(
            &t.text,
            start_global.saturating_sub(node_start).min(t.text.len()),
        );
        let sel_end = clamp_to_char_boundary(
            &t.text,
            end_global.saturating_sub(node_start).min(t.text.len()),
        );

        if sel_start == 0 && sel_end == t.text.len() {
            let mut next = t.clone();
            next.marks = apply(next.marks);
            out.push(Node::Text(next));
            continue;
        }

        let prefix = t.text.get(..sel_start).unwrap_or("").to_string();
        let middle = t.text.get(sel_start..sel_end).unwrap_or("").to_string();
        let suffix = t.text.get(sel_end..).unwrap_or("").to_string();

        if !prefix.is_empty() {
            out.push(Node::Text(TextNode {
                text: prefix,
                marks: t.marks.clone(),
                role: t.role,
            }));
        }
        if !middle.is_empty() {
            out.push(Node::Text(TextNode {
                text: middle,
                marks: apply(t.marks.clone()),
                role: t.role,
            }));
        }
        if !suffix.is_empty() {
            out.push(Node::Text(TextNode {
                text: suffix,
                marks: t.marks.clone(),
                role: t.role,
            }));
        }
    }

    if out.is_empty() {
        out.push(Node::text(""));
    }

    out
}

fn locate_inline_point(blocks: &[(Path, &ElementNode)], point: &Point) -> Option<(usize, usize)> {
    let (&child_ix, block_path) = point.path.split_last()?;
    let block_ix = blocks.iter().position(|(p, _)| p.as_slice() == block_path)?;
    let global = point_global_offset(&blocks[block_ix].1.children, child_ix, point.offset);
    Some((block_ix, global))
}

fn all_selected_have_mark(
    editor: &Editor,
    range: &RangeSelection,
    get: fn(&Marks) -> bool,
) -> Result<bool, String> {
    let (start, end) = ordered_points(range);
    let blocks = text_blocks_in_order(editor.doc());
    let (start_ix, start_global) =
        locate_inline_point(&blocks, &start).ok_or("Selection start is not in a text block")?;
    let (end_ix, end_global) =
        locate_inline_point(&blocks, &end).ok_or("Selection end is not in a text block")?;

    for (block_ix, (_, el)) in blocks
        .iter()
        .enumerate()
        .take(end_ix + 1)
        .skip(start_ix)
    {
        let children = el.children.as_slice();
        let total = total_inline_text_len(children);
        if total == 0 {
            continue;
        }
        let sg = if block_ix == start_ix { start_global } else { 0 };
        let eg = if block_ix == end_ix { end_global } else { total };
        if sg >= eg {
            continue;
        }

        let mut cursor = 0usize;
        for node in children {
            let (node_start, node_end) = match node {
                Node::Text(t) => {
                    let start = cursor;
                    let end = cursor + t.text.len();
                    cursor = end;
                    (start, end)
                }
                Node::Void(v) => {
                    let start = cursor;
                    let end = cursor + v.inline_text_len();
                    cursor = end;
                    (start, end)
                }
                Node::Element(_) => continue,
            };
            if eg <= node_start || sg >= node_end {
                continue;
            }
            if let Node::Text(t) = node {
                if t.role == TextRole::Plain && !get(&t.marks) {
                    return Ok(false);
                }
            }
        }
    }

    Ok(true)
}

fn mark_range_transaction(
    editor: &Editor,
    range: &RangeSelection,
    apply: &dyn Fn(Marks) -> Marks,
    source: &'static str,
) -> Result<Option<Transaction>, String> {
    let (start, end) = ordered_points(range);
    let blocks = text_blocks_in_order(editor.doc());
    let (start_ix, start_global) =
        locate_inline_point(&blocks, &start).ok_or("Selection start is not in a text block")?;
    let (end_ix, end_global) =
        locate_inline_point(&blocks, &end).ok_or("Selection end is not in a text block")?;

    let mut rewritten: HashMap<usize, Vec<Node>> = HashMap::new();
    let mut ops = Vec::new();
    for block_ix in start_ix..=end_ix {
        let (path, el) = &blocks[block_ix];
        let total = total_inline_text_len(&el.children);
        let sg = if block_ix == start_ix { start_global } else { 0 };
        let eg = if block_ix == end_ix { end_global } else { total };
        if sg >= eg {
            continue;
        }
        let new_children = apply_marks_in_block(&el.children, sg, eg, apply);
        if new_children != el.children {
            ops.push(Op::RemoveNode { path: path.clone() });
            ops.push(Op::InsertNode {
                path: path.clone(),
                node: Node::Element(ElementNode {
                    kind: el.kind.clone(),
                    children: new_children.clone(),
                }),
            });
            rewritten.insert(block_ix, new_children);
        }
    }

    if ops.is_empty() {
        return Ok(None);
    }

    // Re-derive the selection from global offsets against the rewritten
    // children, preserving its direction.
    let map_point = |point: &Point| -> Option<Point> {
        let (block_ix, global) = locate_inline_point(&blocks, point)?;
        let children = rewritten
            .get(&block_ix)
            .map(|c| c.as_slice())
            .unwrap_or(blocks[block_ix].1.children.as_slice());
        Some(point_for_global_offset(&blocks[block_ix].0, children, global))
    };
    let anchor = map_point(&range.anchor).ok_or("Selection anchor is not in a text block")?;
    let focus = map_point(&range.focus).ok_or("Selection focus is not in a text block")?;

    Ok(Some(
        Transaction::new(ops)
            .selection_after(Selection::Range(RangeSelection { anchor, focus }))
            .source(source),
    ))
}
