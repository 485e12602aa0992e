//! Two- and three-peer sync drills: quiescence, loss tolerance, tiny
//! Bloom filters, and the DocSet/Connection multiplex.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;

use plait_core::{ActorId, Document, Limits, ObjId, ScalarValue, Value};
use plait_sync::{
    generate_sync_message, receive_sync_message, sync_to_quiescence, Connection, DocId, DocSet,
    SyncState,
};

fn doc(byte: u8) -> Document {
    init_logging();
    Document::with_actor(ActorId::from_bytes(vec![byte]).unwrap())
}

/// `RUST_LOG=plait_sync=debug cargo test` shows the message flow.
fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn assert_converged(a: &Document, b: &Document) {
    assert_eq!(a.get_heads(), b.get_heads());
    assert_eq!(a.save(), b.save());
}

#[test]
fn offline_bidirectional_edits_converge() {
    let mut l = doc(1);
    let mut r = doc(2);
    let mut l_state = SyncState::new();
    let mut r_state = SyncState::new();

    l.change(None, |tx| tx.set(&ObjId::Root, "swallows", 1i64))
        .unwrap();
    sync_to_quiescence(&mut l, &mut l_state, &mut r, &mut r_state).unwrap();
    assert_converged(&l, &r);

    // Disconnected: fresh sync states model the reconnect.
    l.change(None, |tx| tx.set(&ObjId::Root, "wrens", 1i64))
        .unwrap();
    r.change(None, |tx| tx.set(&ObjId::Root, "robins", 1i64))
        .unwrap();

    let mut l_state = SyncState::new();
    let mut r_state = SyncState::new();
    sync_to_quiescence(&mut l, &mut l_state, &mut r, &mut r_state).unwrap();

    assert_converged(&l, &r);
    for doc in [&l, &r] {
        for key in ["swallows", "wrens", "robins"] {
            assert_eq!(
                doc.get(&ObjId::Root, key),
                Some(Value::Scalar(ScalarValue::Int(1)))
            );
        }
    }
}

#[test]
fn same_key_conflict_converges_to_one_winner() {
    let mut l = doc(1);
    let mut r = doc(2);
    let mut l_state = SyncState::new();
    let mut r_state = SyncState::new();

    l.change(None, |tx| tx.set(&ObjId::Root, "swallows", 1i64))
        .unwrap();
    sync_to_quiescence(&mut l, &mut l_state, &mut r, &mut r_state).unwrap();

    l.change(None, |tx| tx.set(&ObjId::Root, "swallows", 13i64))
        .unwrap();
    r.change(None, |tx| tx.set(&ObjId::Root, "swallows", 42i64))
        .unwrap();
    let mut l_state = SyncState::new();
    let mut r_state = SyncState::new();
    sync_to_quiescence(&mut l, &mut l_state, &mut r, &mut r_state).unwrap();

    assert_converged(&l, &r);
    assert_eq!(
        l.get(&ObjId::Root, "swallows"),
        r.get(&ObjId::Root, "swallows")
    );
    assert_eq!(l.get_conflicts(&ObjId::Root, "swallows").len(), 2);
}

#[test]
fn a_lost_changes_message_is_recovered_through_need() {
    let mut a = doc(1);
    let mut b = doc(2);
    let mut a_state = SyncState::new();
    let mut b_state = SyncState::new();

    a.change(None, |tx| tx.set(&ObjId::Root, "bird", "magpie"))
        .unwrap();

    // b advertises, a answers with the change, and the answer is lost.
    let b_msg = generate_sync_message(&b, &mut b_state).unwrap();
    receive_sync_message(&mut a, &mut a_state, b_msg).unwrap();
    let lost = generate_sync_message(&a, &mut a_state).unwrap();
    assert_eq!(lost.changes.len(), 1);
    drop(lost);

    // The normal loop still converges: b asks for the head it can see in
    // a's advertisement, which clears the sent-hashes dedup.
    sync_to_quiescence(&mut a, &mut a_state, &mut b, &mut b_state).unwrap();
    assert_converged(&a, &b);
    assert_eq!(
        b.get(&ObjId::Root, "bird"),
        Some(Value::Scalar(ScalarValue::Str("magpie".into())))
    );
}

#[test]
fn aggressive_bloom_false_positives_do_not_block_convergence() {
    // One bit per entry forces heavy false-positive traffic; the explicit
    // need path has to carry the sync.
    let limits = Limits {
        bloom_bits_per_entry: 1,
        ..Limits::default()
    };
    let mut a = Document::with_limits(ActorId::from_bytes(vec![1]).unwrap(), limits.clone());
    let mut b = Document::with_limits(ActorId::from_bytes(vec![2]).unwrap(), limits);

    for i in 0..30i64 {
        a.change(None, |tx| tx.set(&ObjId::Root, "a-key", i)).unwrap();
        b.change(None, |tx| tx.set(&ObjId::Root, "b-key", i)).unwrap();
    }

    let mut a_state = SyncState::new();
    let mut b_state = SyncState::new();
    sync_to_quiescence(&mut a, &mut a_state, &mut b, &mut b_state).unwrap();
    assert_converged(&a, &b);
}

#[test]
fn small_message_cap_syncs_over_multiple_rounds() {
    let limits = Limits {
        max_changes_per_message: 3,
        ..Limits::default()
    };
    let mut a = Document::with_limits(ActorId::from_bytes(vec![1]).unwrap(), limits.clone());
    let mut b = Document::with_limits(ActorId::from_bytes(vec![2]).unwrap(), limits);

    for i in 0..20i64 {
        a.change(None, |tx| tx.set(&ObjId::Root, "k", i)).unwrap();
    }

    let mut a_state = SyncState::new();
    let mut b_state = SyncState::new();
    sync_to_quiescence(&mut a, &mut a_state, &mut b, &mut b_state).unwrap();
    assert_converged(&a, &b);
}

#[test]
fn three_peers_converge_pairwise() {
    let mut docs = [doc(1), doc(2), doc(3)];
    docs[0]
        .change(None, |tx| tx.set(&ObjId::Root, "origin", true))
        .unwrap();
    docs[1]
        .change(None, |tx| tx.set(&ObjId::Root, "second", 2i64))
        .unwrap();
    docs[2]
        .change(None, |tx| tx.set(&ObjId::Root, "third", 3i64))
        .unwrap();

    // Ring: 0<->1, 1<->2, 0<->1 again to flood everything everywhere.
    for (i, j) in [(0, 1), (1, 2), (0, 1)] {
        let (left, right) = docs.split_at_mut(j);
        let mut li = SyncState::new();
        let mut ri = SyncState::new();
        sync_to_quiescence(&mut left[i], &mut li, &mut right[0], &mut ri).unwrap();
    }

    assert_converged(&docs[0], &docs[1]);
    assert_converged(&docs[1], &docs[2]);
}

// ----------------------------------------------------------------------
// DocSet + Connection
// ----------------------------------------------------------------------

type Queue = Rc<RefCell<VecDeque<Bytes>>>;

fn pump(
    a: &mut Connection,
    a_docs: &mut DocSet,
    a_inbox: &Queue,
    b: &mut Connection,
    b_docs: &mut DocSet,
    b_inbox: &Queue,
) {
    loop {
        let from_b = a_inbox.borrow_mut().pop_front();
        if let Some(bytes) = from_b {
            a.receive(a_docs, &bytes).unwrap();
            continue;
        }
        let from_a = b_inbox.borrow_mut().pop_front();
        if let Some(bytes) = from_a {
            b.receive(b_docs, &bytes).unwrap();
            continue;
        }
        break;
    }
}

fn queue_pair() -> (Queue, Queue) {
    (
        Rc::new(RefCell::new(VecDeque::new())),
        Rc::new(RefCell::new(VecDeque::new())),
    )
}

#[test]
fn connection_syncs_documents_by_id() {
    let notes = DocId::new("notes").unwrap();
    let todo = DocId::new("todo").unwrap();

    let mut a_docs = DocSet::new();
    let mut note_doc = doc(1);
    note_doc
        .change(None, |tx| tx.set(&ObjId::Root, "bird", "magpie"))
        .unwrap();
    a_docs.set_doc(notes.clone(), note_doc);
    let mut todo_doc = doc(1);
    todo_doc
        .change(None, |tx| tx.set(&ObjId::Root, "item", "feed the birds"))
        .unwrap();
    a_docs.set_doc(todo.clone(), todo_doc);

    let mut b_docs = DocSet::new();
    b_docs.set_doc(notes.clone(), doc(2));
    b_docs.set_doc(todo.clone(), doc(2));

    // a_inbox receives what b sends and vice versa.
    let (a_inbox, b_inbox) = queue_pair();
    let mut a_conn = Connection::new({
        let outbox = b_inbox.clone();
        move |bytes| outbox.borrow_mut().push_back(bytes)
    });
    let mut b_conn = Connection::new({
        let outbox = a_inbox.clone();
        move |bytes| outbox.borrow_mut().push_back(bytes)
    });

    a_conn.open(&a_docs);
    b_conn.open(&b_docs);
    pump(
        &mut a_conn, &mut a_docs, &a_inbox, &mut b_conn, &mut b_docs, &b_inbox,
    );

    for id in [&notes, &todo] {
        let in_a = a_docs.get_doc(id).unwrap();
        let in_b = b_docs.get_doc(id).unwrap();
        assert_converged(in_a, in_b);
    }
    assert_eq!(
        b_docs.get_doc(&notes).unwrap().get(&ObjId::Root, "bird"),
        Some(Value::Scalar(ScalarValue::Str("magpie".into())))
    );

    // A later local edit flows through doc_changed.
    a_docs
        .get_doc_mut(&notes)
        .unwrap()
        .change(None, |tx| tx.set(&ObjId::Root, "bird", "blackbird"))
        .unwrap();
    a_conn.doc_changed(&a_docs, &notes);
    pump(
        &mut a_conn, &mut a_docs, &a_inbox, &mut b_conn, &mut b_docs, &b_inbox,
    );
    assert_eq!(
        b_docs.get_doc(&notes).unwrap().get(&ObjId::Root, "bird"),
        Some(Value::Scalar(ScalarValue::Str("blackbird".into())))
    );
}

#[test]
fn messages_for_unknown_documents_are_ignored() {
    let secret = DocId::new("secret").unwrap();

    let mut a_docs = DocSet::new();
    let mut secret_doc = doc(1);
    secret_doc
        .change(None, |tx| tx.set(&ObjId::Root, "k", 1i64))
        .unwrap();
    a_docs.set_doc(secret.clone(), secret_doc);

    // b does not hold `secret`; everything a says about it is dropped.
    let mut b_docs = DocSet::new();
    let (a_inbox, b_inbox) = queue_pair();
    let mut a_conn = Connection::new({
        let outbox = b_inbox.clone();
        move |bytes| outbox.borrow_mut().push_back(bytes)
    });
    let mut b_conn = Connection::new({
        let outbox = a_inbox.clone();
        move |bytes| outbox.borrow_mut().push_back(bytes)
    });

    a_conn.open(&a_docs);
    pump(
        &mut a_conn, &mut a_docs, &a_inbox, &mut b_conn, &mut b_docs, &b_inbox,
    );
    assert!(b_docs.is_empty());

    // Once b registers an (empty) document under the id, requesting pulls
    // the content across.
    b_docs.set_doc(secret.clone(), doc(2));
    b_conn.doc_changed(&b_docs, &secret);
    pump(
        &mut a_conn, &mut a_docs, &a_inbox, &mut b_conn, &mut b_docs, &b_inbox,
    );
    assert_converged(
        a_docs.get_doc(&secret).unwrap(),
        b_docs.get_doc(&secret).unwrap(),
    );
}
