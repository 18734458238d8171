use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ops::{Op, Path, Transaction};
use crate::plugin::{CommandError, EditorEvent, EventKind, PluginRegistry, QueryError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Document {
    #[serde(default)]
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Element(ElementNode),
    Text(TextNode),
    Void(VoidNode),
}

impl Node {
    pub fn paragraph(text: impl Into<String>) -> Self {
        Node::Element(ElementNode {
            kind: ElementKind::Paragraph,
            children: vec![Node::text(text)],
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(TextNode {
            text: text.into(),
            marks: Marks::default(),
            role: TextRole::Plain,
        })
    }

    pub fn math_source(text: impl Into<String>) -> Self {
        Node::Text(TextNode {
            text: text.into(),
            marks: Marks::default(),
            role: TextRole::MathSource,
        })
    }

    pub fn math(equation: impl Into<String>, inline: bool) -> Self {
        Node::Void(VoidNode {
            kind: VoidKind::Math {
                equation: equation.into(),
                inline,
            },
        })
    }

    pub fn image(src: impl Into<String>) -> Self {
        Node::Void(VoidNode {
            kind: VoidKind::Image {
                src: src.into(),
                selected: false,
            },
        })
    }

    pub fn divider() -> Self {
        Node::Void(VoidNode {
            kind: VoidKind::Divider,
        })
    }

    pub fn line_break() -> Self {
        Node::Void(VoidNode {
            kind: VoidKind::LineBreak,
        })
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Element(el) => el.kind.kind(),
            Node::Text(_) => NodeKind::Text,
            Node::Void(v) => v.kind.kind(),
        }
    }

    pub fn is_line_break(&self) -> bool {
        matches!(
            self,
            Node::Void(VoidNode {
                kind: VoidKind::LineBreak
            })
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    #[serde(flatten)]
    pub kind: ElementKind,
    #[serde(default)]
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    Paragraph,
    Heading {
        level: u8,
    },
    Quote,
    List {
        list: ListKind,
    },
    ListItem {
        #[serde(default)]
        indent: u8,
    },
    CodeBlock {
        #[serde(default)]
        language: Option<String>,
    },
    MathSourceBlock,
}

impl ElementKind {
    pub fn kind(&self) -> NodeKind {
        match self {
            ElementKind::Paragraph => NodeKind::Paragraph,
            ElementKind::Heading { .. } => NodeKind::Heading,
            ElementKind::Quote => NodeKind::Quote,
            ElementKind::List { .. } => NodeKind::List,
            ElementKind::ListItem { .. } => NodeKind::ListItem,
            ElementKind::CodeBlock { .. } => NodeKind::CodeBlock,
            ElementKind::MathSourceBlock => NodeKind::MathSourceBlock,
        }
    }

    /// Blocks whose children are inline content (text runs, line breaks,
    /// inline voids) rather than further blocks.
    pub fn is_text_block(&self) -> bool {
        !matches!(self, ElementKind::List { .. })
    }

    /// Blocks holding the raw source form of a construct while it is edited.
    pub fn is_editable_block(&self) -> bool {
        matches!(
            self,
            ElementKind::CodeBlock { .. } | ElementKind::MathSourceBlock
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    Bulleted,
    Ordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Paragraph,
    Heading,
    Quote,
    List,
    ListItem,
    CodeBlock,
    MathSourceBlock,
    Text,
    Math,
    Image,
    Divider,
    LineBreak,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    pub text: String,
    #[serde(default)]
    pub marks: Marks,
    #[serde(default)]
    pub role: TextRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextRole {
    #[default]
    Plain,
    /// The editable form of an inline math node: the raw equation with its
    /// delimiters stripped.
    MathSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Marks {
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default)]
    pub code: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoidNode {
    #[serde(flatten)]
    pub kind: VoidKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoidKind {
    Math {
        equation: String,
        inline: bool,
    },
    Image {
        src: String,
        #[serde(default, skip_serializing_if = "is_false")]
        selected: bool,
    },
    Divider,
    LineBreak,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl VoidKind {
    pub fn kind(&self) -> NodeKind {
        match self {
            VoidKind::Math { .. } => NodeKind::Math,
            VoidKind::Image { .. } => NodeKind::Image,
            VoidKind::Divider => NodeKind::Divider,
            VoidKind::LineBreak => NodeKind::LineBreak,
        }
    }
}

impl VoidNode {
    pub fn is_inline(&self) -> bool {
        match &self.kind {
            VoidKind::Math { inline, .. } => *inline,
            VoidKind::LineBreak => true,
            VoidKind::Image { .. } | VoidKind::Divider => false,
        }
    }

    pub fn inline_text(&self) -> String {
        match &self.kind {
            VoidKind::Math { equation, .. } => equation.clone(),
            VoidKind::LineBreak => "\n".to_string(),
            VoidKind::Image { .. } | VoidKind::Divider => String::new(),
        }
    }

    pub fn inline_text_len(&self) -> usize {
        match &self.kind {
            VoidKind::Math { equation, .. } => equation.len(),
            VoidKind::LineBreak => 1,
            VoidKind::Image { .. } | VoidKind::Divider => 1,
        }
    }
}

/// The inline text content of a block's children: text runs joined with
/// line breaks rendered as `\n`. Rendered voids contribute their source.
pub fn inline_text_content(children: &[Node]) -> String {
    let mut out = String::new();
    for child in children {
        match child {
            Node::Text(t) => out.push_str(&t.text),
            Node::Void(v) => out.push_str(&v.inline_text()),
            Node::Element(el) => out.push_str(&inline_text_content(&el.children)),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub path: Path,
    pub offset: usize,
}

impl Point {
    pub fn new(path: Path, offset: usize) -> Self {
        Self { path, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSelection {
    pub anchor: Point,
    pub focus: Point,
}

impl RangeSelection {
    pub fn collapsed(point: Point) -> Self {
        Self {
            anchor: point.clone(),
            focus: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Selection {
    #[default]
    None,
    Range(RangeSelection),
    /// A caret-less selection of a single node, as produced by clicking a
    /// rendered construct.
    Node {
        #[serde(default)]
        path: Path,
    },
}

impl Selection {
    pub fn caret(point: Point) -> Self {
        Selection::Range(RangeSelection::collapsed(point))
    }

    pub fn node(path: Path) -> Self {
        Selection::Node { path }
    }

    pub fn range(&self) -> Option<&RangeSelection> {
        match self {
            Selection::Range(range) => Some(range),
            _ => None,
        }
    }

    pub fn collapsed_point(&self) -> Option<&Point> {
        match self {
            Selection::Range(range) if range.is_collapsed() => Some(&range.focus),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Selection::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeSeverity {
    Info,
    Error,
}

/// A user-visible notification raised by the core; the presentation layer
/// drains these with [`Editor::take_notices`].
#[derive(Debug, Clone)]
pub struct Notice {
    pub severity: NoticeSeverity,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct EditorConfig {
    pub max_transform_iterations: usize,
    pub max_normalize_iterations: usize,
    pub max_settle_iterations: usize,
}

impl EditorConfig {
    fn with_defaults(mut self) -> Self {
        if self.max_transform_iterations == 0 {
            self.max_transform_iterations = 100;
        }
        if self.max_normalize_iterations == 0 {
            self.max_normalize_iterations = 100;
        }
        if self.max_settle_iterations == 0 {
            self.max_settle_iterations = 100;
        }
        self
    }
}

pub struct Editor {
    doc: Document,
    selection: Selection,
    prev_selection: Selection,
    registry: PluginRegistry,
    config: EditorConfig,
    notices: Vec<Notice>,
}

impl Editor {
    pub fn new(doc: Document, selection: Selection, registry: PluginRegistry) -> Self {
        let config = EditorConfig::default().with_defaults();
        let prev_selection = selection.clone();
        let mut editor = Self {
            doc,
            selection,
            prev_selection,
            registry,
            config,
            notices: Vec::new(),
        };
        editor.settle_document();
        editor
    }

    pub fn with_standard_plugins() -> Self {
        let registry = PluginRegistry::standard();
        let doc = Document {
            children: vec![Node::paragraph("")],
        };
        let selection = Selection::caret(Point::new(vec![0, 0], 0));
        Self::new(doc, selection, registry)
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// The selection as it was before the most recent host-driven selection
    /// change. Insert commands operate on this snapshot because the UI
    /// action that dispatched them may itself have moved the live selection.
    pub fn prev_selection(&self) -> &Selection {
        &self.prev_selection
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn push_notice(&mut self, severity: NoticeSeverity, message: impl Into<String>) {
        self.notices.push(Notice {
            severity,
            message: message.into(),
        });
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Host entry point for selection changes. Snapshots the previous
    /// selection, installs the new one, and runs selection-change handlers
    /// until the document settles.
    pub fn set_selection(&mut self, selection: Selection) {
        self.prev_selection = std::mem::replace(&mut self.selection, selection);
        self.clamp_selection();
        self.settle_selection();
    }

    /// Installs a selection without dispatching selection-change handlers.
    /// For use inside event handlers and commands.
    pub fn select(&mut self, selection: Selection) {
        self.selection = selection;
        self.clamp_selection();
    }

    /// Routes an event through the registered handlers in priority order and
    /// reports whether any handler consumed it.
    pub fn dispatch(&mut self, event: EditorEvent) -> bool {
        if event.kind() == EventKind::Blur {
            self.prev_selection = self.selection.clone();
        }
        let handled = self.run_handlers_once(&event);
        self.settle_selection();
        handled
    }

    pub fn apply(&mut self, tx: Transaction) -> Result<(), ApplyError> {
        for op in tx.ops {
            self.apply_op(op)?;
        }
        if let Some(sel) = tx.selection_after {
            self.selection = sel;
        }
        self.run_transforms_to_fixpoint()?;
        self.run_normalize_to_fixpoint()?;
        self.clamp_selection();
        Ok(())
    }

    pub fn run_command(&mut self, id: &str, args: Option<Value>) -> Result<(), CommandError> {
        let Some(command) = self.registry.command(id) else {
            return Err(CommandError::new(format!("Unknown command: {id}")));
        };
        tracing::debug!(command = id, "run command");
        (command.handler)(self, args)
    }

    pub fn run_query_json(&self, id: &str, args: Option<Value>) -> Result<Value, QueryError> {
        let Some(query) = self.registry.query(id) else {
            return Err(QueryError::new(format!("Unknown query: {id}")));
        };
        (query.handler)(self, args)
    }

    pub fn run_query<T>(&self, id: &str, args: Option<Value>) -> Result<T, QueryError>
    where
        T: DeserializeOwned,
    {
        let value = self.run_query_json(id, args)?;
        serde_json::from_value(value)
            .map_err(|err| QueryError::new(format!("Failed to decode query result: {err}")))
    }

    fn settle_document(&mut self) {
        if let Err(err) = self
            .run_transforms_to_fixpoint()
            .and_then(|()| self.run_normalize_to_fixpoint())
        {
            tracing::warn!(error = ?err, "initial document did not settle");
        }
        self.clamp_selection();
    }

    fn run_handlers_once(&mut self, event: &EditorEvent) -> bool {
        let handlers = self.registry.handlers_for(event.kind());
        for handler in handlers {
            match (handler.run)(self, event) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        handler = handler.id,
                        error = err.message(),
                        "event handler failed"
                    );
                }
            }
        }
        false
    }

    fn settle_selection(&mut self) {
        for _ in 0..self.config.max_settle_iterations {
            let doc_before = self.doc.clone();
            let selection_before = self.selection.clone();
            self.run_handlers_once(&EditorEvent::SelectionChange);
            if self.doc == doc_before && self.selection == selection_before {
                return;
            }
        }
        tracing::warn!("selection-change handlers did not settle");
    }

    fn run_transforms_to_fixpoint(&mut self) -> Result<(), ApplyError> {
        for _ in 0..self.config.max_transform_iterations {
            let Some(outcome) = self.registry.next_transform(&self.doc, &self.selection) else {
                return Ok(());
            };
            tracing::debug!(transform = outcome.id, "text transform fired");
            for op in outcome.ops {
                self.apply_op(op)?;
            }
            if let Some(sel) = outcome.selection_after {
                self.selection = sel;
            }
        }
        Err(ApplyError::TransformDidNotConverge)
    }

    fn run_normalize_to_fixpoint(&mut self) -> Result<(), ApplyError> {
        for _ in 0..self.config.max_normalize_iterations {
            let ops = self.registry.normalize(&self.doc);
            if ops.is_empty() {
                return Ok(());
            }
            for op in ops {
                self.apply_op(op)?;
            }
        }
        Err(ApplyError::NormalizeDidNotConverge)
    }

    fn clamp_selection(&mut self) {
        self.selection = normalize_selection(&self.doc, &self.selection);
    }

    fn apply_op(&mut self, op: Op) -> Result<(), ApplyError> {
        apply_op_to(
            &mut self.doc,
            &mut self.selection,
            &mut self.prev_selection,
            op,
        )
    }
}

fn apply_op_to(
    doc: &mut Document,
    selection: &mut Selection,
    prev_selection: &mut Selection,
    op: Op,
) -> Result<(), ApplyError> {
    match op {
        Op::InsertText { path, offset, text } => {
            let text_node = node_text_mut(doc, &path)?;
            let offset = clamp_to_char_boundary(&text_node.text, offset);
            text_node.text.insert_str(offset, &text);
            for sel in [selection, prev_selection] {
                transform_selection_insert_text(sel, &path, offset, text.len());
            }
            Ok(())
        }
        Op::RemoveText { path, range } => {
            let text_node = node_text_mut(doc, &path)?;
            let start =
                clamp_to_char_boundary(&text_node.text, range.start.min(text_node.text.len()));
            let end = clamp_to_char_boundary(&text_node.text, range.end.min(text_node.text.len()));
            if start >= end {
                return Ok(());
            }
            text_node.text.replace_range(start..end, "");
            for sel in [selection, prev_selection] {
                transform_selection_remove_text(sel, &path, start..end);
            }
            Ok(())
        }
        Op::InsertNode { path, node } => {
            insert_node(doc, &path, node)?;
            for sel in [selection, prev_selection] {
                transform_selection_insert_node(sel, &path);
            }
            Ok(())
        }
        Op::RemoveNode { path } => {
            let removed = remove_node(doc, &path)?;
            for sel in [selection, prev_selection] {
                transform_selection_remove_node(sel, &path, &removed, doc);
            }
            Ok(())
        }
        Op::SetElementKind { path, kind } => {
            match node_mut(doc, &path)? {
                Node::Element(el) => el.kind = kind,
                _ => return Err(ApplyError::InvalidPath("Expected element node".into())),
            }
            Ok(())
        }
        Op::SetTextMarks { path, marks } => {
            let text_node = node_text_mut(doc, &path)?;
            text_node.marks = marks;
            Ok(())
        }
        Op::SetVoidKind { path, kind } => {
            match node_mut(doc, &path)? {
                Node::Void(v) => v.kind = kind,
                _ => return Err(ApplyError::InvalidPath("Expected void node".into())),
            }
            Ok(())
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("text transforms did not converge")]
    TransformDidNotConverge,
    #[error("normalize passes did not converge")]
    NormalizeDidNotConverge,
}

impl From<PathError> for ApplyError {
    fn from(value: PathError) -> Self {
        ApplyError::InvalidPath(value.0)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PathError(pub String);

pub(crate) fn clamp_to_char_boundary(s: &str, mut ix: usize) -> usize {
    ix = ix.min(s.len());
    while ix > 0 && !s.is_char_boundary(ix) {
        ix -= 1;
    }
    ix
}

fn transform_selection_insert_text(
    selection: &mut Selection,
    path: &[usize],
    offset: usize,
    len: usize,
) {
    let Selection::Range(range) = selection else {
        return;
    };
    for point in [&mut range.anchor, &mut range.focus] {
        if point.path == path && point.offset >= offset {
            point.offset = point.offset.saturating_add(len);
        }
    }
}

fn transform_selection_remove_text(
    selection: &mut Selection,
    path: &[usize],
    range: std::ops::Range<usize>,
) {
    let Selection::Range(sel) = selection else {
        return;
    };
    let removed_len = range.end.saturating_sub(range.start);
    for point in [&mut sel.anchor, &mut sel.focus] {
        if point.path != path {
            continue;
        }
        if point.offset <= range.start {
            continue;
        }
        if point.offset >= range.end {
            point.offset = point.offset.saturating_sub(removed_len);
        } else {
            point.offset = range.start;
        }
    }
}

fn map_path_insert(target: &mut Path, inserted: &[usize]) {
    let Some((&index, parent_path)) = inserted.split_last() else {
        return;
    };
    if target.len() <= parent_path.len() {
        return;
    }
    if !target.starts_with(parent_path) {
        return;
    }
    let depth = parent_path.len();
    if target[depth] >= index {
        target[depth] += 1;
    }
}

fn transform_selection_insert_node(selection: &mut Selection, path: &[usize]) {
    match selection {
        Selection::None => {}
        Selection::Range(range) => {
            for point in [&mut range.anchor, &mut range.focus] {
                map_path_insert(&mut point.path, path);
            }
        }
        Selection::Node { path: target } => map_path_insert(target, path),
    }
}

fn transform_selection_remove_node(
    selection: &mut Selection,
    path: &[usize],
    removed: &Node,
    doc_after_remove: &Document,
) {
    let Some((&index, parent_path)) = path.split_last() else {
        return;
    };

    if let Selection::Node { path: target } = selection {
        if target.starts_with(path) {
            *selection = Selection::None;
            return;
        }
        if target.len() > parent_path.len() && target.starts_with(parent_path) {
            let depth = parent_path.len();
            if target[depth] > index {
                target[depth] -= 1;
            }
        }
        return;
    }

    let Selection::Range(range) = selection else {
        return;
    };

    // A removed text run that the merge pass folded into its left sibling:
    // points inside it can keep their position relative to the merged text.
    let merge_prefix_len = match (removed, index.checked_sub(1)) {
        (Node::Text(removed_text), Some(left_index)) => {
            let mut left_path = parent_path.to_vec();
            left_path.push(left_index);
            match node_at_path(doc_after_remove, &left_path) {
                Some(Node::Text(left_text))
                    if left_text.marks == removed_text.marks
                        && left_text.role == removed_text.role
                        && left_text.text.ends_with(&removed_text.text) =>
                {
                    Some(left_text.text.len().saturating_sub(removed_text.text.len()))
                }
                _ => None,
            }
        }
        _ => None,
    };

    for point in [&mut range.anchor, &mut range.focus] {
        if point.path.len() <= parent_path.len() {
            continue;
        }
        if !point.path.starts_with(parent_path) {
            continue;
        }
        let depth = parent_path.len();
        let ix = point.path[depth];
        if ix > index {
            point.path[depth] = ix - 1;
            continue;
        }
        if ix < index {
            continue;
        }

        // Point was inside the removed subtree. Map it to a nearby point.
        if let (Some(prefix), Node::Text(removed_text), Some(left_index)) =
            (merge_prefix_len, removed, index.checked_sub(1))
        {
            point.path.truncate(depth + 1);
            point.path[depth] = left_index;
            point.offset = (prefix + point.offset).min(prefix + removed_text.text.len());
        } else {
            point.path.truncate(depth + 1);
            point.path[depth] = index.saturating_sub(1);
            point.offset = 0;
        }
    }
}

pub fn node_at_path<'a>(doc: &'a Document, path: &[usize]) -> Option<&'a Node> {
    let (&first, rest) = path.split_first()?;
    let mut node = doc.children.get(first)?;
    for &ix in rest {
        node = match node {
            Node::Element(el) => el.children.get(ix)?,
            Node::Void(_) | Node::Text(_) => return None,
        };
    }
    Some(node)
}

pub fn element_at_path<'a>(doc: &'a Document, path: &[usize]) -> Option<&'a ElementNode> {
    match node_at_path(doc, path)? {
        Node::Element(el) => Some(el),
        _ => None,
    }
}

fn node_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut Node, PathError> {
    let Some((&first, rest)) = path.split_first() else {
        return Err(PathError("Empty path".into()));
    };
    let len = doc.children.len();
    let mut node = doc
        .children
        .get_mut(first)
        .ok_or_else(|| PathError(format!("Path out of bounds at depth 0: {first} >= {len}")))?;
    for (depth, &ix) in rest.iter().enumerate() {
        node = match node {
            Node::Element(el) => {
                let len = el.children.len();
                el.children.get_mut(ix).ok_or_else(|| {
                    PathError(format!(
                        "Path out of bounds at depth {}: {ix} >= {len}",
                        depth + 1
                    ))
                })?
            }
            Node::Void(_) | Node::Text(_) => {
                return Err(PathError(format!("Non-container node at depth {depth}")));
            }
        };
    }
    Ok(node)
}

fn node_text_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut TextNode, PathError> {
    match node_mut(doc, path)? {
        Node::Text(t) => Ok(t),
        _ => Err(PathError("Expected text node".into())),
    }
}

fn insert_node(doc: &mut Document, path: &[usize], node: Node) -> Result<(), PathError> {
    let Some((&index, parent_path)) = path.split_last() else {
        return Err(PathError("Empty insert path".into()));
    };

    let children = if parent_path.is_empty() {
        &mut doc.children
    } else {
        match node_mut(doc, parent_path)? {
            Node::Element(el) => &mut el.children,
            Node::Void(_) | Node::Text(_) => {
                return Err(PathError("Insert parent is not a container".into()));
            }
        }
    };

    if index > children.len() {
        return Err(PathError(format!(
            "Insert index out of bounds: {index} > {}",
            children.len()
        )));
    }
    children.insert(index, node);
    Ok(())
}

fn remove_node(doc: &mut Document, path: &[usize]) -> Result<Node, PathError> {
    let Some((&index, parent_path)) = path.split_last() else {
        return Err(PathError("Empty remove path".into()));
    };

    let children = if parent_path.is_empty() {
        &mut doc.children
    } else {
        match node_mut(doc, parent_path)? {
            Node::Element(el) => &mut el.children,
            Node::Void(_) | Node::Text(_) => {
                return Err(PathError("Remove parent is not a container".into()));
            }
        }
    };

    if index >= children.len() {
        return Err(PathError(format!(
            "Remove index out of bounds: {index} >= {}",
            children.len()
        )));
    }
    Ok(children.remove(index))
}

pub fn first_text_point(doc: &Document) -> Option<Point> {
    fn walk(children: &[Node], path: &mut Vec<usize>) -> Option<Point> {
        for (ix, node) in children.iter().enumerate() {
            path.push(ix);
            match node {
                Node::Text(_) => {
                    let point = Point {
                        path: path.clone(),
                        offset: 0,
                    };
                    path.pop();
                    return Some(point);
                }
                Node::Element(el) => {
                    if let Some(point) = walk(&el.children, path) {
                        path.pop();
                        return Some(point);
                    }
                }
                Node::Void(_) => {}
            }
            path.pop();
        }
        None
    }

    walk(&doc.children, &mut Vec::new())
}

fn normalize_point_to_existing_text(doc: &Document, point: &Point) -> Option<Point> {
    if point.path.is_empty() || doc.children.is_empty() {
        return None;
    }

    fn first_text_descendant(children: &[Node], path: &mut Vec<usize>) -> Option<Point> {
        for (ix, node) in children.iter().enumerate() {
            path.push(ix);
            match node {
                Node::Text(_) => {
                    let point = Point {
                        path: path.clone(),
                        offset: 0,
                    };
                    path.pop();
                    return Some(point);
                }
                Node::Element(el) => {
                    if let Some(point) = first_text_descendant(&el.children, path) {
                        path.pop();
                        return Some(point);
                    }
                }
                Node::Void(_) => {}
            }
            path.pop();
        }
        None
    }

    let mut resolved_path: Vec<usize> = Vec::new();
    let mut children: &[Node] = &doc.children;

    for &wanted in &point.path {
        if children.is_empty() {
            break;
        }
        let ix = wanted.min(children.len() - 1);
        resolved_path.push(ix);
        let node = &children[ix];
        match node {
            Node::Text(t) => {
                return Some(Point {
                    path: resolved_path,
                    offset: point.offset.min(t.text.len()),
                });
            }
            Node::Element(el) => {
                children = &el.children;
            }
            Node::Void(_) => {
                break;
            }
        }
    }

    let node = node_at_path(doc, &resolved_path)?;
    match node {
        Node::Text(t) => Some(Point {
            path: resolved_path,
            offset: point.offset.min(t.text.len()),
        }),
        Node::Element(el) => first_text_descendant(&el.children, &mut resolved_path),
        Node::Void(_) => None,
    }
}

/// Clamps a selection to the current tree: range points resolve to the
/// nearest existing text run, node selections must reference a live node.
pub fn normalize_selection(doc: &Document, selection: &Selection) -> Selection {
    match selection {
        Selection::None => Selection::None,
        Selection::Node { path } => {
            if node_at_path(doc, path).is_some() {
                selection.clone()
            } else {
                first_text_point(doc)
                    .map(Selection::caret)
                    .unwrap_or(Selection::None)
            }
        }
        Selection::Range(range) => {
            let anchor = normalize_point_to_existing_text(doc, &range.anchor)
                .or_else(|| normalize_point_to_existing_text(doc, &range.focus))
                .or_else(|| first_text_point(doc));
            let Some(anchor) = anchor else {
                return Selection::None;
            };
            let focus =
                normalize_point_to_existing_text(doc, &range.focus).unwrap_or_else(|| anchor.clone());
            Selection::Range(RangeSelection { anchor, focus })
        }
    }
}
