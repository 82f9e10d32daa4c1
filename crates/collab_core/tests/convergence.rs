//! Replicas converge regardless of delivery order.

use collab_core::crdt::{ReplicaId, ReplicaState, encode_changes};
use collab_core::model::{AttrValue, DocumentNode, Mark, Operation, Position};
use collab_core::test_utils::{HubPeer, LoopbackHub, test_editor};

fn base() -> DocumentNode {
    DocumentNode::doc(vec![
        DocumentNode::heading(1, vec![DocumentNode::text("Title")]),
        DocumentNode::paragraph(vec![DocumentNode::text("abcdef")]),
    ])
}

fn seeded(id: u64) -> ReplicaState {
    let mut replica = ReplicaState::new(ReplicaId(id));
    let seed = ReplicaState::seed_changes(&base()).unwrap();
    replica.apply_remote(seed);
    replica
}

#[test]
fn test_three_replicas_converge_in_any_order() {
    let mut a = seeded(1);
    let mut b = seeded(2);
    let mut c = seeded(3);

    // Each replica makes two dependent batches.
    let mut batches = Vec::new();
    let a1 = a
        .apply_local(&[Operation::insert_text(Position::new(vec![1], 3), "XY")])
        .unwrap();
    let a2 = a
        .apply_local(&[Operation::insert_text(Position::new(vec![1], 4), "-")])
        .unwrap();
    batches.push(encode_changes(&a1));
    batches.push(encode_changes(&a2));

    let doc = b.document();
    let b1 = b
        .apply_local(&[Operation::delete(&doc, Position::new(vec![1], 1), 3).unwrap()])
        .unwrap();
    let b2 = b
        .apply_local(&[Operation::AddMark {
            at: Position::new(vec![1], 0),
            len: 2,
            mark: Mark::bold(),
        }])
        .unwrap();
    batches.push(encode_changes(&b1));
    batches.push(encode_changes(&b2));

    let doc = c.document();
    let c1 = c
        .apply_local(&[Operation::set_attr(&doc, vec![0], "level", Some(AttrValue::Int(2))).unwrap()])
        .unwrap();
    let c2 = c
        .apply_local(&[Operation::insert_text(Position::new(vec![0], 5), "!")])
        .unwrap();
    batches.push(encode_changes(&c1));
    batches.push(encode_changes(&c2));

    // a receives in order, b in reverse, c interleaved.
    for batch in &batches {
        a.apply_update(batch).unwrap();
    }
    for batch in batches.iter().rev() {
        b.apply_update(batch).unwrap();
    }
    for i in [5, 0, 3, 1, 4, 2] {
        c.apply_update(&batches[i]).unwrap();
    }

    assert_eq!(a.pending_len(), 0);
    assert_eq!(b.pending_len(), 0);
    assert_eq!(c.pending_len(), 0);
    assert_eq!(a.document(), b.document());
    assert_eq!(b.document(), c.document());

    let doc = a.document();
    assert_eq!(doc.children[0].attrs.get("level"), Some(&AttrValue::Int(2)));
    assert_eq!(doc.plain_text(), "Title!\naX-Yef\n");
}

#[test]
fn test_concurrent_seeds_deduplicate() {
    let mut a = seeded(1);
    let b = seeded(2);
    let report = a.apply_update(&b.encode_state()).unwrap();
    assert!(report.integrated.is_empty());
    assert_eq!(a.document(), b.document());
    assert_eq!(a.document().plain_text(), "Title\nabcdef\n");
}

fn open(editor: &collab_core::EditorSession) {
    editor
        .with_session(|s| {
            s.begin_connect();
            s.on_open();
        })
        .unwrap();
}

#[test]
fn test_editors_converge_through_service() {
    let a = test_editor("u1");
    let b = test_editor("u2");
    let mut hub = LoopbackHub::new();
    open(&a);
    open(&b);
    {
        let (mut pa, mut pb) = (&a, &b);
        hub.pump(&mut [&mut pa as &mut dyn HubPeer, &mut pb]);
    }
    // Both found the document empty; their seeds are identical.
    assert_eq!(a.document().unwrap(), b.document().unwrap());
    assert_eq!(a.document().unwrap().plain_text(), "Untitled\n");

    a.apply(&[Operation::insert_text(Position::new(vec![1], 0), "Hello")])
        .unwrap();
    b.apply(&[Operation::insert_text(Position::new(vec![1], 0), "World")])
        .unwrap();
    {
        let (mut pa, mut pb) = (&a, &b);
        hub.pump(&mut [&mut pa as &mut dyn HubPeer, &mut pb]);
    }

    let doc = a.document().unwrap();
    assert_eq!(doc, b.document().unwrap());
    assert_eq!(doc, hub.replica.document());
    let text = doc.plain_text();
    assert!(text.contains("Hello") && text.contains("World"));
    assert_eq!(text.len(), "Untitled\nHelloWorld\n".len());
}

#[test]
fn test_cursors_follow_concurrent_edits() {
    let a = test_editor("u1");
    let b = test_editor("u2");
    let mut hub = LoopbackHub::new();
    open(&a);
    open(&b);
    {
        let (mut pa, mut pb) = (&a, &b);
        hub.pump(&mut [&mut pa as &mut dyn HubPeer, &mut pb]);
    }

    // Cursor after "Unti".
    a.set_cursor(&Position::new(vec![0], 4), &Position::new(vec![0], 4))
        .unwrap();
    hub.now_ms = 1_000;
    a.tick(hub.now_ms).unwrap();
    b.apply(&[Operation::insert_text(Position::new(vec![0], 0), ">> ")])
        .unwrap();
    {
        let (mut pa, mut pb) = (&a, &b);
        hub.pump(&mut [&mut pa as &mut dyn HubPeer, &mut pb]);
    }

    let cursors = b.remote_cursors().unwrap();
    assert_eq!(cursors.len(), 1);
    let (entry, selection) = &cursors[0];
    assert_eq!(entry.state.user.id, "u1");
    let (anchor, head) = selection.clone().unwrap();
    assert_eq!(anchor, Position::new(vec![0], 7));
    assert_eq!(head, anchor);
}
