use mathdown_core::{
    ClipboardFile, ClipboardPayload, Document, Editor, EditorEvent, ElementKind, FileReadError,
    Marks, Node, NoticeSeverity, Point, PluginRegistry, RangeSelection, Selection, TextNode,
    TextRole, VoidKind, VoidNode,
};

fn editor_with_text(text: &str) -> Editor {
    let doc = Document {
        children: vec![Node::paragraph(text)],
    };
    Editor::new(
        doc,
        Selection::caret(Point::new(vec![0, 0], 0)),
        PluginRegistry::standard(),
    )
}

fn select_range(editor: &mut Editor, anchor: (Vec<usize>, usize), focus: (Vec<usize>, usize)) {
    editor.set_selection(Selection::Range(RangeSelection {
        anchor: Point::new(anchor.0, anchor.1),
        focus: Point::new(focus.0, focus.1),
    }));
}

#[test]
fn insert_divider_appends_trailing_paragraph_and_selects_it() {
    let mut editor = editor_with_text("hello");
    editor.run_command("divider.insert", None).unwrap();

    assert_eq!(editor.doc().children.len(), 3);
    assert_eq!(editor.doc().children[1], Node::divider());
    assert!(matches!(
        &editor.doc().children[2],
        Node::Element(el) if el.kind == ElementKind::Paragraph
    ));
    assert_eq!(
        editor.selection(),
        &Selection::caret(Point::new(vec![2, 0], 0))
    );
}

#[test]
fn insert_divider_between_blocks_reuses_following_block() {
    let doc = Document {
        children: vec![Node::paragraph("one"), Node::paragraph("two")],
    };
    let mut editor = Editor::new(
        doc,
        Selection::caret(Point::new(vec![0, 0], 1)),
        PluginRegistry::standard(),
    );
    editor.run_command("divider.insert", None).unwrap();

    assert_eq!(editor.doc().children.len(), 3);
    assert_eq!(editor.doc().children[1], Node::divider());
    // No extra paragraph: the caret moves into the block that already
    // followed.
    assert_eq!(
        editor.selection(),
        &Selection::caret(Point::new(vec![2, 0], 0))
    );
}

#[test]
fn insert_image_selects_the_image_node() {
    let mut editor = editor_with_text("hello");
    editor
        .run_command(
            "image.insert",
            Some(serde_json::json!({ "src": "blob:abc123" })),
        )
        .unwrap();

    assert_eq!(editor.doc().children.len(), 3);
    assert!(matches!(
        &editor.doc().children[1],
        Node::Void(VoidNode { kind: VoidKind::Image { src, .. } }) if src == "blob:abc123"
    ));
    assert_eq!(editor.selection(), &Selection::node(vec![1]));

    // The tree-stored selected flag follows the node selection.
    editor.dispatch(EditorEvent::SelectionChange);
    assert!(matches!(
        &editor.doc().children[1],
        Node::Void(VoidNode { kind: VoidKind::Image { selected: true, .. } })
    ));

    editor.set_selection(Selection::caret(Point::new(vec![0, 0], 0)));
    assert!(matches!(
        &editor.doc().children[1],
        Node::Void(VoidNode { kind: VoidKind::Image { selected: false, .. } })
    ));
}

#[test]
fn insert_image_without_src_is_an_error() {
    let mut editor = editor_with_text("hello");
    let err = editor
        .run_command("image.insert", Some(serde_json::json!({})))
        .unwrap_err();
    assert!(err.message().contains("src"));
}

#[test]
fn paste_of_single_image_file_inserts_image() {
    let mut editor = editor_with_text("hello");
    let payload = ClipboardPayload {
        files: vec![ClipboardFile {
            mime: "image/png".to_string(),
            src: Ok("blob:pasted".to_string()),
        }],
    };

    assert!(editor.dispatch(EditorEvent::Paste(payload)));

    assert!(matches!(
        &editor.doc().children[1],
        Node::Void(VoidNode { kind: VoidKind::Image { src, .. } }) if src == "blob:pasted"
    ));
    assert!(matches!(
        &editor.doc().children[2],
        Node::Element(el) if el.kind == ElementKind::Paragraph
    ));
}

#[test]
fn paste_of_multiple_images_is_not_intercepted() {
    let mut editor = editor_with_text("hello");
    let file = ClipboardFile {
        mime: "image/png".to_string(),
        src: Ok("blob:one".to_string()),
    };
    let payload = ClipboardPayload {
        files: vec![file.clone(), file],
    };

    assert!(!editor.dispatch(EditorEvent::Paste(payload)));
    assert_eq!(editor.doc().children.len(), 1);
}

#[test]
fn failed_image_read_raises_notice_and_inserts_nothing() {
    let mut editor = editor_with_text("hello");
    let payload = ClipboardPayload {
        files: vec![ClipboardFile {
            mime: "image/png".to_string(),
            src: Err(FileReadError("permission denied".to_string())),
        }],
    };

    // The paste is consumed, the edit is abandoned cleanly.
    assert!(editor.dispatch(EditorEvent::Paste(payload)));
    assert_eq!(editor.doc().children.len(), 1);

    let notices = editor.take_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].severity, NoticeSeverity::Error);
    assert!(notices[0].message.contains("permission denied"));
    assert!(editor.take_notices().is_empty());
}

#[test]
fn toggle_heading_cycles_through_levels() {
    let doc = Document {
        children: vec![Node::paragraph("intro"), Node::paragraph("section")],
    };
    let mut editor = Editor::new(
        doc,
        Selection::caret(Point::new(vec![0, 0], 0)),
        PluginRegistry::standard(),
    );

    // Second block: none -> h2 -> h3 -> paragraph.
    select_range(&mut editor, (vec![1, 0], 0), (vec![1, 0], 3));
    editor.run_command("block.toggle_heading", None).unwrap();
    assert!(matches!(
        &editor.doc().children[1],
        Node::Element(el) if el.kind == (ElementKind::Heading { level: 2 })
    ));
    assert_eq!(
        editor
            .run_query::<Option<u8>>("block.heading_level", None)
            .unwrap(),
        Some(2)
    );

    editor.run_command("block.toggle_heading", None).unwrap();
    assert!(matches!(
        &editor.doc().children[1],
        Node::Element(el) if el.kind == (ElementKind::Heading { level: 3 })
    ));

    editor.run_command("block.toggle_heading", None).unwrap();
    assert!(matches!(
        &editor.doc().children[1],
        Node::Element(el) if el.kind == ElementKind::Paragraph
    ));
}

#[test]
fn leading_h2_is_promoted_to_h1() {
    let mut editor = editor_with_text("title");
    select_range(&mut editor, (vec![0, 0], 0), (vec![0, 0], 5));
    editor.run_command("block.toggle_heading", None).unwrap();

    assert!(matches!(
        &editor.doc().children[0],
        Node::Element(el) if el.kind == (ElementKind::Heading { level: 1 })
    ));
}

#[test]
fn toggle_quote_round_trips() {
    let doc = Document {
        children: vec![Node::paragraph("intro"), Node::paragraph("quoted")],
    };
    let mut editor = Editor::new(
        doc,
        Selection::caret(Point::new(vec![0, 0], 0)),
        PluginRegistry::standard(),
    );

    select_range(&mut editor, (vec![1, 0], 0), (vec![1, 0], 6));
    editor.run_command("block.toggle_quote", None).unwrap();
    assert!(matches!(
        &editor.doc().children[1],
        Node::Element(el) if el.kind == ElementKind::Quote
    ));
    assert!(editor.run_query::<bool>("block.is_quote", None).unwrap());

    editor.run_command("block.toggle_quote", None).unwrap();
    assert!(matches!(
        &editor.doc().children[1],
        Node::Element(el) if el.kind == ElementKind::Paragraph
    ));
}

#[test]
fn toggle_bold_splits_runs_and_preserves_selection() {
    let mut editor = editor_with_text("hello world");
    select_range(&mut editor, (vec![0, 0], 0), (vec![0, 0], 5));

    editor.run_command("marks.toggle_bold", None).unwrap();

    let Node::Element(el) = &editor.doc().children[0] else {
        panic!("expected paragraph");
    };
    assert_eq!(
        el.children,
        vec![
            Node::Text(TextNode {
                text: "hello".to_string(),
                marks: Marks {
                    bold: true,
                    ..Marks::default()
                },
                role: TextRole::Plain,
            }),
            Node::Text(TextNode {
                text: " world".to_string(),
                marks: Marks::default(),
                role: TextRole::Plain,
            }),
        ]
    );

    // The selection still covers "hello", so toggling again unbolds and the
    // runs merge back together.
    editor.run_command("marks.toggle_bold", None).unwrap();
    let Node::Element(el) = &editor.doc().children[0] else {
        panic!("expected paragraph");
    };
    assert_eq!(el.children, vec![Node::text("hello world")]);
}

#[test]
fn toggle_bold_at_caret_is_a_no_op() {
    let mut editor = editor_with_text("hello");
    editor.run_command("marks.toggle_bold", None).unwrap();
    assert_eq!(editor.doc().children[0], Node::paragraph("hello"));
}

#[test]
fn link_set_and_unset() {
    let mut editor = editor_with_text("go here now");
    select_range(&mut editor, (vec![0, 0], 3), (vec![0, 0], 7));

    editor
        .run_command(
            "marks.set_link",
            Some(serde_json::json!({ "url": "https://example.com" })),
        )
        .unwrap();

    let Node::Element(el) = &editor.doc().children[0] else {
        panic!("expected paragraph");
    };
    assert_eq!(el.children.len(), 3);
    let Node::Text(linked) = &el.children[1] else {
        panic!("expected linked run");
    };
    assert_eq!(linked.text, "here");
    assert_eq!(linked.marks.link.as_deref(), Some("https://example.com"));

    editor.set_selection(Selection::caret(Point::new(vec![0, 1], 2)));
    assert!(editor.run_query::<bool>("marks.has_link", None).unwrap());

    select_range(&mut editor, (vec![0, 1], 0), (vec![0, 1], 4));
    editor.run_command("marks.unset_link", None).unwrap();
    let Node::Element(el) = &editor.doc().children[0] else {
        panic!("expected paragraph");
    };
    assert_eq!(el.children, vec![Node::text("go here now")]);
}

#[test]
fn commands_without_applicable_selection_are_silent_no_ops() {
    let doc = Document {
        children: vec![Node::paragraph("hello")],
    };
    let mut editor = Editor::new(doc, Selection::None, PluginRegistry::standard());

    editor.run_command("divider.insert", None).unwrap();
    editor
        .run_command(
            "image.insert",
            Some(serde_json::json!({ "src": "blob:x" })),
        )
        .unwrap();
    editor.run_command("code_block.insert", None).unwrap();
    assert_eq!(editor.doc().children.len(), 1);
}

#[test]
fn insert_commands_use_selection_snapshot_from_before_the_change() {
    let doc = Document {
        children: vec![Node::paragraph("one"), Node::paragraph("two")],
    };
    let mut editor = Editor::new(
        doc,
        Selection::caret(Point::new(vec![0, 0], 0)),
        PluginRegistry::standard(),
    );

    // The toolbar click steals the selection before the command lands; the
    // divider must go where the editing selection was.
    editor.set_selection(Selection::None);
    editor.run_command("divider.insert", None).unwrap();

    assert_eq!(editor.doc().children[1], Node::divider());
}
