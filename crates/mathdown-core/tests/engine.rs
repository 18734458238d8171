use mathdown_core::{
    node_at_path, Document, Editor, EditorPlugin, ElementKind, ElementNode, Node, NodeKind, Op,
    Point, PluginRegistry, RegistryError, Selection, TextRole, Transaction,
};

fn standard_editor(children: Vec<Node>, selection: Selection) -> Editor {
    Editor::new(
        Document { children },
        selection,
        PluginRegistry::standard(),
    )
}

fn collect_editable_paths(editor: &Editor) -> Vec<Vec<usize>> {
    fn walk(children: &[Node], path: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        for (ix, node) in children.iter().enumerate() {
            path.push(ix);
            match node {
                Node::Text(t) if t.role == TextRole::MathSource => out.push(path.clone()),
                Node::Element(el) => {
                    if matches!(el.kind, ElementKind::MathSourceBlock) {
                        out.push(path.clone());
                    }
                    walk(&el.children, path, out);
                }
                _ => {}
            }
            path.pop();
        }
    }
    let mut out = Vec::new();
    walk(&editor.doc().children, &mut Vec::new(), &mut out);
    out
}

#[test]
fn only_nodes_under_the_selection_stay_editable() {
    let mut editor = standard_editor(
        vec![Node::Element(ElementNode {
            kind: ElementKind::Paragraph,
            children: vec![
                Node::text("a"),
                Node::math("$x$", true),
                Node::text("b"),
                Node::math("$y$", true),
                Node::text("c"),
            ],
        })],
        Selection::caret(Point::new(vec![0, 0], 0)),
    );

    // Click the first construct, then the second: after each settle, only
    // the clicked one is editable.
    editor.set_selection(Selection::node(vec![0, 1]));
    assert_eq!(collect_editable_paths(&editor), vec![vec![0, 1]]);

    editor.set_selection(Selection::node(vec![0, 3]));
    assert_eq!(collect_editable_paths(&editor), vec![vec![0, 3]]);
    assert_eq!(node_at_path(editor.doc(), &[0, 1]), Some(&Node::math("$x$", true)));

    editor.set_selection(Selection::caret(Point::new(vec![0, 0], 0)));
    assert_eq!(collect_editable_paths(&editor), Vec::<Vec<usize>>::new());
}

#[test]
fn transforms_run_to_fixpoint_within_one_transaction() {
    // Two separate matches in one inserted run settle in a single apply.
    let mut editor = Editor::with_standard_plugins();
    editor
        .apply(Transaction::new(vec![Op::InsertText {
            path: vec![0, 0],
            offset: 0,
            text: "$a$ mid $b$".to_string(),
        }]))
        .unwrap();

    let Node::Element(el) = &editor.doc().children[0] else {
        panic!("expected paragraph");
    };
    let math: Vec<&Node> = el
        .children
        .iter()
        .filter(|n| matches!(n, Node::Void(_)))
        .collect();
    assert_eq!(math.len(), 2);
    assert_eq!(math[0], &Node::math("$a$", true));
    assert_eq!(math[1], &Node::math("$b$", true));
}

#[test]
fn complete_match_is_never_left_unconverted() {
    let mut editor = Editor::with_standard_plugins();
    editor
        .apply(Transaction::new(vec![Op::InsertText {
            path: vec![0, 0],
            offset: 0,
            text: "prefix $E=mc^2$ suffix $$display$$ tail \\(inline\\)".to_string(),
        }]))
        .unwrap();

    let Node::Element(el) = &editor.doc().children[0] else {
        panic!("expected paragraph");
    };
    for child in &el.children {
        if let Node::Text(t) = child {
            assert!(
                mathdown_core::DelimiterSet::inline()
                    .find_earliest_match(&t.text)
                    .is_none(),
                "unconverted inline match left in {:?}",
                t.text
            );
            assert!(
                mathdown_core::DelimiterSet::display()
                    .find_earliest_match(&t.text)
                    .is_none(),
                "unconverted display match left in {:?}",
                t.text
            );
        }
    }
}

#[test]
fn editable_inline_source_is_skipped_by_the_engine() {
    let editor = standard_editor(
        vec![Node::Element(ElementNode {
            kind: ElementKind::Paragraph,
            children: vec![Node::math_source("$x$ and $y$")],
        })],
        Selection::caret(Point::new(vec![0, 0], 0)),
    );

    let Node::Element(el) = &editor.doc().children[0] else {
        panic!("expected paragraph");
    };
    let Node::Text(t) = &el.children[0] else {
        panic!("expected text run");
    };
    assert_eq!(t.role, TextRole::MathSource);
    assert_eq!(t.text, "$x$ and $y$");
}

#[test]
fn math_block_content_is_skipped_by_the_engine() {
    let editor = standard_editor(
        vec![Node::Element(ElementNode {
            kind: ElementKind::MathSourceBlock,
            children: vec![Node::text("$inner$")],
        })],
        Selection::caret(Point::new(vec![0, 0], 0)),
    );

    let Node::Element(el) = &editor.doc().children[0] else {
        panic!("expected math block");
    };
    assert_eq!(el.children, vec![Node::text("$inner$")]);
}

#[test]
fn empty_document_normalizes_to_one_paragraph() {
    let editor = standard_editor(Vec::new(), Selection::None);
    assert_eq!(editor.doc().children, vec![Node::paragraph("")]);
}

#[test]
fn adjacent_runs_with_equal_marks_merge() {
    let editor = standard_editor(
        vec![Node::Element(ElementNode {
            kind: ElementKind::Paragraph,
            children: vec![Node::text("ab"), Node::text("cd")],
        })],
        Selection::caret(Point::new(vec![0, 1], 1)),
    );

    let Node::Element(el) = &editor.doc().children[0] else {
        panic!("expected paragraph");
    };
    assert_eq!(el.children, vec![Node::text("abcd")]);
    // Caret keeps its logical position across the merge.
    assert_eq!(
        editor.selection(),
        &Selection::caret(Point::new(vec![0, 0], 3))
    );
}

#[test]
fn missing_required_node_kind_fails_registry_construction() {
    struct NeedsMath;

    impl EditorPlugin for NeedsMath {
        fn id(&self) -> &'static str {
            "test.needs_math"
        }

        fn required_kinds(&self) -> Vec<NodeKind> {
            vec![NodeKind::Math]
        }
    }

    let err = PluginRegistry::new(vec![Box::new(NeedsMath) as Box<dyn EditorPlugin>]).unwrap_err();
    assert!(matches!(
        err,
        RegistryError::MissingNodeKind {
            kind: NodeKind::Math,
            ..
        }
    ));
}

#[test]
fn selection_is_clamped_to_existing_text() {
    let mut editor = Editor::with_standard_plugins();
    editor.set_selection(Selection::caret(Point::new(vec![7, 3], 42)));

    let Selection::Range(range) = editor.selection() else {
        panic!("expected range selection");
    };
    assert_eq!(range.focus.path, vec![0, 0]);
    assert_eq!(range.focus.offset, 0);
}
