use mathdown_core::{
    Editor, EditorEvent, ElementKind, ListKind, Node, Op, Point, Selection, Transaction,
    MAX_INDENT_LEVEL,
};

fn list_item_kind(editor: &Editor) -> Option<ElementKind> {
    let Node::Element(list) = &editor.doc().children[0] else {
        return None;
    };
    if !matches!(list.kind, ElementKind::List { .. }) {
        return None;
    }
    let Node::Element(item) = &list.children[0] else {
        return None;
    };
    Some(item.kind.clone())
}

#[test]
fn numbered_prefix_converts_paragraph_into_ordered_list() {
    let mut editor = Editor::with_standard_plugins();
    editor
        .apply(Transaction::new(vec![Op::InsertText {
            path: vec![0, 0],
            offset: 0,
            text: "1. ".to_string(),
        }]))
        .unwrap();

    let Node::Element(list) = &editor.doc().children[0] else {
        panic!("expected list");
    };
    assert_eq!(
        list.kind,
        ElementKind::List {
            list: ListKind::Ordered
        }
    );
    let Node::Element(item) = &list.children[0] else {
        panic!("expected list item");
    };
    assert_eq!(item.kind, ElementKind::ListItem { indent: 0 });
    assert_eq!(item.children, vec![Node::text("")], "prefix text cleared");

    assert_eq!(
        editor.selection(),
        &Selection::caret(Point::new(vec![0, 0, 0], 0))
    );
}

#[test]
fn dash_prefix_converts_paragraph_into_bulleted_list() {
    let mut editor = Editor::with_standard_plugins();
    editor
        .apply(Transaction::new(vec![Op::InsertText {
            path: vec![0, 0],
            offset: 0,
            text: "- ".to_string(),
        }]))
        .unwrap();

    let Node::Element(list) = &editor.doc().children[0] else {
        panic!("expected list");
    };
    assert_eq!(
        list.kind,
        ElementKind::List {
            list: ListKind::Bulleted
        }
    );
}

#[test]
fn prefix_without_caret_at_trigger_end_does_not_convert() {
    let mut editor = Editor::with_standard_plugins();
    editor
        .apply(
            Transaction::new(vec![Op::InsertText {
                path: vec![0, 0],
                offset: 0,
                text: "1. ".to_string(),
            }])
            .selection_after(Selection::caret(Point::new(vec![0, 0], 1))),
        )
        .unwrap();

    assert!(matches!(
        &editor.doc().children[0],
        Node::Element(el) if el.kind == ElementKind::Paragraph
    ));
}

#[test]
fn prefix_mid_text_does_not_convert() {
    let mut editor = Editor::with_standard_plugins();
    editor
        .apply(Transaction::new(vec![Op::InsertText {
            path: vec![0, 0],
            offset: 0,
            text: "x- ".to_string(),
        }]))
        .unwrap();

    assert!(matches!(
        &editor.doc().children[0],
        Node::Element(el) if el.kind == ElementKind::Paragraph
    ));
}

#[test]
fn tab_adjusts_indent_clamped_to_range() {
    let mut editor = Editor::with_standard_plugins();
    editor
        .apply(Transaction::new(vec![Op::InsertText {
            path: vec![0, 0],
            offset: 0,
            text: "- ".to_string(),
        }]))
        .unwrap();

    // Shift-tab at level zero is a no-op that leaves the event unconsumed.
    assert!(!editor.dispatch(EditorEvent::KeyTab { shift: true }));
    assert_eq!(list_item_kind(&editor), Some(ElementKind::ListItem { indent: 0 }));

    assert!(editor.dispatch(EditorEvent::KeyTab { shift: false }));
    assert_eq!(list_item_kind(&editor), Some(ElementKind::ListItem { indent: 1 }));

    for _ in 0..MAX_INDENT_LEVEL {
        editor.dispatch(EditorEvent::KeyTab { shift: false });
    }
    assert_eq!(
        list_item_kind(&editor),
        Some(ElementKind::ListItem {
            indent: MAX_INDENT_LEVEL
        })
    );
    assert!(
        !editor.dispatch(EditorEvent::KeyTab { shift: false }),
        "indent past the maximum does not consume the key"
    );

    assert!(editor.dispatch(EditorEvent::KeyTab { shift: true }));
    assert_eq!(
        list_item_kind(&editor),
        Some(ElementKind::ListItem {
            indent: MAX_INDENT_LEVEL - 1
        })
    );
}

#[test]
fn tab_outside_list_is_not_handled() {
    let mut editor = Editor::with_standard_plugins();
    assert!(!editor.dispatch(EditorEvent::KeyTab { shift: false }));
}

#[test]
fn active_list_kind_query() {
    let mut editor = Editor::with_standard_plugins();
    assert_eq!(
        editor
            .run_query::<Option<String>>("list.active_kind", None)
            .unwrap(),
        None
    );

    editor
        .apply(Transaction::new(vec![Op::InsertText {
            path: vec![0, 0],
            offset: 0,
            text: "1. ".to_string(),
        }]))
        .unwrap();

    assert_eq!(
        editor
            .run_query::<Option<String>>("list.active_kind", None)
            .unwrap(),
        Some("ordered".to_string())
    );
}

#[test]
fn trailing_paragraph_content_moves_into_the_item() {
    let mut editor = Editor::with_standard_plugins();
    // A paragraph whose first run is exactly the trigger, with more inline
    // content after it.
    editor
        .apply(Transaction::new(vec![
            Op::InsertText {
                path: vec![0, 0],
                offset: 0,
                text: "1. ".to_string(),
            },
            Op::InsertNode {
                path: vec![0, 1],
                node: Node::math("$x$", true),
            },
        ]))
        .unwrap();

    let Node::Element(list) = &editor.doc().children[0] else {
        panic!("expected list");
    };
    let Node::Element(item) = &list.children[0] else {
        panic!("expected list item");
    };
    assert!(item.children.contains(&Node::math("$x$", true)));
}
