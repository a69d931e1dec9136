use mergetree_core::identity::Identity;
use mergetree_core::node::NodeKind;
use mergetree_core::secure::SecureTree;
use serde_json::{json, Value};

const PRV_KEY: &str = "d6eb959e9aec2e6fdc44b5862b269e987b8a4d6f2baca542d8acaa97ee5e74f6";
const PRV_KEY_OTHER: &str = "ed26531bac1838e519c2c6562ac717b22aac041730f0d753d3ad35b76b5f4924";

fn assert_not_allowed<T: std::fmt::Debug>(result: Result<T, mergetree_core::TreeError>) {
    let err = result.expect_err("operation with a foreign key must be rejected");
    assert!(
        err.to_string().contains("not allowed"),
        "unexpected error: {err}"
    );
}

#[test]
fn fresh_secure_tree_verifies() {
    let tree = SecureTree::new(PRV_KEY).expect("secure tree should build");
    tree.verify().expect("fresh secure tree should verify");
}

#[test]
fn set_literal_rejects_foreign_keys_then_accepts_the_owner() {
    let mut tree = SecureTree::new(PRV_KEY).expect("secure tree should build");
    tree.import_json(br#"["A", "B", "B"]"#, PRV_KEY)
        .expect("import should work");

    let first = tree.node_by_path("/0").expect("path should resolve");
    assert_not_allowed(tree.set_literal(&first, json!("AA"), PRV_KEY_OTHER));

    tree.set_literal(&first, json!("AA"), PRV_KEY)
        .expect("owner update should work");

    let node = tree.get_node(&first).expect("node should exist");
    assert!(!node.nonce.is_empty());
    assert!(!node.signature.is_empty());

    let exported: Value =
        serde_json::from_str(&tree.export_json().expect("export should work")).expect("json");
    assert_eq!(exported, json!(["AA", "B", "B"]));
    tree.verify().expect("tree should still verify");
}

#[test]
fn denied_mutations_leave_the_tree_unchanged() {
    let mut tree = SecureTree::new(PRV_KEY).expect("secure tree should build");
    tree.import_json(br#"{"foo": "bar"}"#, PRV_KEY)
        .expect("import should work");
    let before = tree.export_json().expect("export should work");

    let foo = tree.node_by_path("/foo").expect("path should resolve");
    assert_not_allowed(tree.set_literal(&foo, json!("hacked"), PRV_KEY_OTHER));
    let map = tree.node_by_path("/").expect("path should resolve");
    assert_not_allowed(tree.set_key_value(&map, "new", json!(1), PRV_KEY_OTHER));
    assert_not_allowed(tree.remove_key_value(&map, "foo", PRV_KEY_OTHER));

    assert_eq!(tree.export_json().expect("export should work"), before);
    tree.verify().expect("tree should still verify");
}

#[test]
fn create_map_node_is_policy_gated() {
    let mut tree = SecureTree::new(PRV_KEY).expect("secure tree should build");
    let root = tree.node_by_path("/").expect("path should resolve");

    assert_not_allowed(tree.create_map_node(&root, PRV_KEY_OTHER));
    tree.create_map_node(&root, PRV_KEY)
        .expect("owner should create map nodes");
    tree.verify().expect("tree should verify");
}

#[test]
fn set_and_remove_key_value_are_policy_gated() {
    let mut tree = SecureTree::new(PRV_KEY).expect("secure tree should build");
    let root = tree.node_by_path("/").expect("path should resolve");
    let map = tree
        .create_map_node(&root, PRV_KEY)
        .expect("map should attach");

    assert_not_allowed(tree.set_key_value(&map, "someKey", json!("someValue"), PRV_KEY_OTHER));
    let value_id = tree
        .set_key_value(&map, "someKey", json!("someValue"), PRV_KEY)
        .expect("owner set should work");
    assert!(!value_id.is_empty());
    tree.node_by_path("/someKey").expect("key should resolve");

    assert_not_allowed(tree.remove_key_value(&map, "someKey", PRV_KEY_OTHER));
    tree.remove_key_value(&map, "someKey", PRV_KEY)
        .expect("owner remove should work");
    assert!(tree.node_by_path("/someKey").is_err());
}

#[test]
fn create_attached_node_is_policy_gated() {
    let mut tree = SecureTree::new(PRV_KEY).expect("secure tree should build");
    let root = tree.node_by_path("/").expect("path should resolve");
    let parent = tree
        .create_map_node(&root, PRV_KEY)
        .expect("map should attach");

    assert_not_allowed(tree.create_attached_node("child", NodeKind::Literal, &parent, PRV_KEY_OTHER));
    tree.create_attached_node("child", NodeKind::Map, &parent, PRV_KEY)
        .expect("owner attach should work");
}

#[test]
fn detached_create_node_needs_no_authorization() {
    let mut tree = SecureTree::new(PRV_KEY).expect("secure tree should build");
    // A detached node is not part of the tree yet, so any valid identity
    // may allocate one.
    tree.create_node("myNode", NodeKind::Map, PRV_KEY_OTHER)
        .expect("detached create should work");
    tree.create_node("myNode", NodeKind::Map, PRV_KEY)
        .expect("detached create should work");
}

#[test]
fn edge_operations_are_policy_gated() {
    let mut tree = SecureTree::new(PRV_KEY).expect("secure tree should build");
    let root = tree.node_by_path("/").expect("path should resolve");
    let from = tree
        .create_map_node(&root, PRV_KEY)
        .expect("map should attach");
    let to = tree
        .create_node("detachedNode", NodeKind::Map, PRV_KEY)
        .expect("detached create should work");

    assert_not_allowed(tree.add_edge(&from, &to, "edgeLabel", PRV_KEY_OTHER));
    tree.add_edge(&from, &to, "edgeLabel", PRV_KEY)
        .expect("owner add edge should work");

    assert_not_allowed(tree.remove_edge(&from, &to, PRV_KEY_OTHER));
    tree.remove_edge(&from, &to, PRV_KEY)
        .expect("owner remove edge should work");
}

#[test]
fn ordered_edge_operations_are_policy_gated() {
    let mut tree = SecureTree::new(PRV_KEY).expect("secure tree should build");
    let root = tree.node_by_path("/").expect("path should resolve");
    let from = tree
        .create_map_node(&root, PRV_KEY)
        .expect("map should attach");
    let sibling = tree
        .create_node("siblingNode", NodeKind::Map, PRV_KEY)
        .expect("detached create should work");

    assert_not_allowed(tree.append_edge(&from, &sibling, "edgeLabel", PRV_KEY_OTHER));
    tree.append_edge(&from, &sibling, "edgeLabel", PRV_KEY)
        .expect("owner append should work");

    let before = tree
        .create_node("beforeNode", NodeKind::Map, PRV_KEY)
        .expect("detached create should work");
    assert_not_allowed(tree.insert_edge_left(&from, &before, "edgeLabel", &sibling, PRV_KEY_OTHER));
    tree.insert_edge_left(&from, &before, "edgeLabel", &sibling, PRV_KEY)
        .expect("owner insert left should work");

    let after = tree
        .create_node("afterNode", NodeKind::Map, PRV_KEY)
        .expect("detached create should work");
    assert_not_allowed(tree.insert_edge_right(&from, &after, "edgeLabel", &sibling, PRV_KEY_OTHER));
    tree.insert_edge_right(&from, &after, "edgeLabel", &sibling, PRV_KEY)
        .expect("owner insert right should work");

    let prefix = tree
        .create_node("prefixNode", NodeKind::Map, PRV_KEY)
        .expect("detached create should work");
    assert_not_allowed(tree.prepend_edge(&from, &prefix, "edgeLabel", PRV_KEY_OTHER));
    tree.prepend_edge(&from, &prefix, "edgeLabel", PRV_KEY)
        .expect("owner prepend should work");
}

#[test]
fn import_json_is_policy_gated() {
    let mut tree = SecureTree::new(PRV_KEY).expect("secure tree should build");
    let data = br#"{"foo": "bar", "baz": 123}"#;

    assert_not_allowed(tree.import_json(data, PRV_KEY_OTHER));

    let id = tree.import_json(data, PRV_KEY).expect("import should work");
    assert!(!id.is_empty());
    tree.node_by_path("/foo").expect("foo should resolve");
    tree.node_by_path("/baz").expect("baz should resolve");
    tree.verify().expect("imported tree should verify");
}

#[test]
fn import_json_to_map_is_policy_gated() {
    let mut tree = SecureTree::new(PRV_KEY).expect("secure tree should build");
    let root = tree.node_by_path("/").expect("path should resolve");
    let parent = tree
        .create_map_node(&root, PRV_KEY)
        .expect("map should attach");
    let data = br#"{"nestedFoo": "value1", "nestedBar": 42}"#;

    assert_not_allowed(tree.import_json_to_map(data, &parent, "childKey", PRV_KEY_OTHER));
    let id = tree
        .import_json_to_map(data, &parent, "childKey", PRV_KEY)
        .expect("import should work");
    assert!(!id.is_empty());
    tree.verify().expect("tree should verify");
}

#[test]
fn import_json_to_array_is_policy_gated() {
    let mut tree = SecureTree::new(PRV_KEY).expect("secure tree should build");
    let root = tree.node_by_path("/").expect("path should resolve");
    let parent = tree
        .create_map_node(&root, PRV_KEY)
        .expect("map should attach");
    let array = tree
        .create_node("arrayKey", NodeKind::Array, PRV_KEY)
        .expect("detached create should work");
    tree.append_edge(&parent, &array, "arrayKey", PRV_KEY)
        .expect("append should work");
    let data = br#"["elem1", "elem2", "elem3"]"#;

    assert_not_allowed(tree.import_json_to_array(data, &array, PRV_KEY_OTHER));
    let id = tree
        .import_json_to_array(data, &array, PRV_KEY)
        .expect("import should work");
    assert!(!id.is_empty());
    tree.verify().expect("tree should verify");
}

#[test]
fn merge_rejects_tampered_remote_signatures() {
    let mut c1 = SecureTree::new(PRV_KEY).expect("secure tree should build");
    c1.import_json(br#"{"foo": "bar", "baz": 123}"#, PRV_KEY)
        .expect("import should work");

    let mut c2 = c1.clone_tree();
    let map = c2.node_by_path("/").expect("path should resolve");
    let value_id = c2
        .set_key_value(&map, "newKey", json!("newValue"), PRV_KEY)
        .expect("set should work");

    let original = c2
        .get_node(&value_id)
        .expect("node should exist")
        .signature
        .clone();
    let bogus = "e713a1bb015fecabb5a084b0fe6d6e7271fca6f79525a634183cfdb175fe69241f4da161779d8e6b761200e1cf93766010a19072fa778f9643363e2cfadd640900";
    if let Some(node) = c2.tree_mut().nodes.get_mut(&value_id) {
        node.signature = bogus.to_owned();
    }

    assert!(
        c1.merge(&c2, PRV_KEY).is_err(),
        "merge must reject a remote node with a tampered signature"
    );

    if let Some(node) = c2.tree_mut().nodes.get_mut(&value_id) {
        node.signature = original;
    }
    c1.merge(&c2, PRV_KEY)
        .expect("merge should work once the signature is restored");
    c1.verify().expect("merged tree should verify");
}

#[test]
fn merge_is_gated_until_the_remote_writer_is_allowed() {
    let identity_other = Identity::from_hex(PRV_KEY_OTHER).expect("identity should parse");

    let mut c1 = SecureTree::new(PRV_KEY).expect("secure tree should build");
    c1.import_json(br#"{"foo": "bar", "baz": 123}"#, PRV_KEY)
        .expect("import should work");

    let mut c2 = c1.clone_tree();
    let map = c2.node_by_path("/").expect("path should resolve");

    assert_not_allowed(c2.set_key_value(&map, "newKey", json!("newValue"), PRV_KEY_OTHER));

    c2.policy_mut()
        .expect("policy should exist")
        .allow(
            identity_other.client_id(),
            mergetree_core::AbacAction::Modify,
            "root",
            true,
        )
        .expect("allow should work");

    c2.set_key_value(&map, "newKey", json!("newValue"), PRV_KEY_OTHER)
        .expect("set should work once allowed");

    assert!(
        c1.merge(&c2, PRV_KEY).is_err(),
        "merge must fail while the second writer is unknown to the local policy"
    );

    c1.policy_mut()
        .expect("policy should exist")
        .allow(
            identity_other.client_id(),
            mergetree_core::AbacAction::Modify,
            "root",
            true,
        )
        .expect("allow should work");

    c1.merge(&c2, PRV_KEY).expect("merge should work once allowed");
    c1.verify().expect("merged tree should verify");

    let new_key = c1.node_by_path("/newKey").expect("merged key should resolve");
    assert_eq!(
        c1.get_literal(&new_key).expect("literal"),
        json!("newValue")
    );
}

#[test]
fn independently_imported_replicas_merge_after_a_recursive_grant() {
    let doc = br#"{
        "1": [
            {"2": "3"},
            {"4": [{"5": "6"}]}
        ]
    }"#;
    let identity_other = Identity::from_hex(PRV_KEY_OTHER).expect("identity should parse");

    let mut c1 = SecureTree::new(PRV_KEY).expect("secure tree should build");
    c1.import_json(doc, PRV_KEY).expect("import should work");

    let mut c2 = SecureTree::new(PRV_KEY_OTHER).expect("secure tree should build");
    c2.import_json(doc, PRV_KEY_OTHER).expect("import should work");

    assert!(
        c1.merge(&c2, PRV_KEY).is_err(),
        "merge must fail before the second identity is granted access"
    );

    c1.policy_mut()
        .expect("policy should exist")
        .allow(
            identity_other.client_id(),
            mergetree_core::AbacAction::Modify,
            "root",
            true,
        )
        .expect("allow should work");

    c1.merge(&c2, PRV_KEY).expect("merge should work once allowed");
    c1.verify().expect("merged tree should verify");

    // The two independently imported containers now live side by side under
    // a promoted array.
    let root = c1.tree().root();
    assert_eq!(root.edges.len(), 1);
    let array = c1
        .get_node(&root.edges[0].to)
        .expect("promoted array should exist");
    assert!(array.is_array && array.is_promoted);
    assert_eq!(array.edges.len(), 2);
}

#[test]
fn cross_replica_literal_edit_merges_back_with_its_signature() {
    let prv = "b24b6cf725a6d0e12955ff35a470c823eaac6dbbe0feb5503a097ed5baca5328";
    let doc = br#"{
        "uid": "user_1",
        "name": "Alice",
        "friends": [
            {"uid": "user_2", "name": "Bob"},
            {"uid": "user_3", "name": "Charlie", "friends": [
                {"uid": "user_4", "name": "Dana"}
            ]}
        ]
    }"#;

    let mut original = SecureTree::new(prv).expect("secure tree should build");
    original.import_json(doc, prv).expect("import should work");

    let mut fork = original.clone_tree();
    let name = fork
        .node_by_path("/friends/0/name")
        .expect("path should resolve");
    fork.set_literal(&name, json!("Johan2"), prv)
        .expect("set should work");
    let fork_signature = fork
        .get_node(&name)
        .expect("node should exist")
        .signature
        .clone();

    original.merge(&fork, prv).expect("merge should work");
    original.verify().expect("merged tree should verify");

    let merged = original
        .node_by_path("/friends/0/name")
        .expect("path should resolve");
    assert_eq!(
        original.get_literal(&merged).expect("literal"),
        json!("Johan2")
    );
    assert_eq!(
        original.get_node(&merged).expect("node").signature,
        fork_signature,
        "the winning literal must keep the signature of its writer"
    );
}
