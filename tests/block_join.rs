//! # Block Nested-Loop Join Integration Tests
//!
//! Join completeness and no-duplication under shrunken page budgets (to
//! force right-refill and left-advance passes), empty inputs, eager type
//! checking, post-done idempotence, pin accounting, and composition over
//! heap scans and over other joins.

use tempfile::TempDir;

use heapdb::{
    BlockNestedLoopJoin, BufferPool, ColumnMeta, ColumnRef, CompareOp, Executor, FileManager,
    HeapFile, JoinCondition, MaterializedExecutor, SeqScanExecutor, StorageError,
};

fn make_pool() -> BufferPool {
    BufferPool::with_default_capacity(FileManager::new()).expect("failed to build pool")
}

/// Tuple layout used by most tests: [id: i32 le][tag: 4 chars].
fn id_tag_tuple(id: i32, tag: &[u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(tag);
    out
}

fn id_tag_columns(table: &str) -> Vec<ColumnMeta> {
    vec![
        ColumnMeta::int(table, "id", 0),
        ColumnMeta::char(table, "tag", 4, 4),
    ]
}

fn id_tag_relation(table: &str, rows: &[(i32, &[u8; 4])]) -> MaterializedExecutor {
    let tuples = rows.iter().map(|&(id, tag)| id_tag_tuple(id, tag)).collect();
    MaterializedExecutor::new(id_tag_columns(table), tuples).unwrap()
}

fn eq_on_id(left_table: &str, right_table: &str) -> Vec<JoinCondition> {
    vec![JoinCondition::new(
        ColumnRef::new(left_table, "id"),
        CompareOp::Eq,
        ColumnRef::new(right_table, "id"),
    )]
}

fn drain(join: &mut BlockNestedLoopJoin<'_>) -> Vec<Vec<u8>> {
    join.open().unwrap();
    let mut out = Vec::new();
    while !join.done() {
        out.push(join.current().expect("not done but no tuple").to_vec());
        join.advance().unwrap();
    }
    out
}

#[test]
fn equality_join_yields_exactly_the_matching_pairs() {
    let left = id_tag_relation("l", &[(1, b"aaaa"), (2, b"bbbb")]);
    let right = id_tag_relation("r", &[(1, b"xxxx"), (2, b"yyyy"), (3, b"zzzz")]);

    let mut join = BlockNestedLoopJoin::new(
        Box::new(left),
        Box::new(right),
        eq_on_id("l", "r"),
        make_pool(),
    )
    .unwrap();

    let mut rows = drain(&mut join);
    rows.sort();

    let mut expected = vec![
        [id_tag_tuple(1, b"aaaa"), id_tag_tuple(1, b"xxxx")].concat(),
        [id_tag_tuple(2, b"bbbb"), id_tag_tuple(2, b"yyyy")].concat(),
    ];
    expected.sort();

    assert_eq!(rows, expected);
}

#[test]
fn result_is_independent_of_the_page_budget() {
    // wide tuples so a block page holds only a handful of them, forcing
    // several refill passes per side even with modest relations
    const PAD: usize = 1024;
    let columns = |table: &str| {
        vec![
            ColumnMeta::int(table, "id", 0),
            ColumnMeta::char(table, "pad", PAD, 4),
        ]
    };
    let tuple = |id: i32| {
        let mut out = id.to_le_bytes().to_vec();
        out.resize(4 + PAD, 0xCD);
        out
    };

    let left_ids: Vec<i32> = (0..40).collect();
    let right_ids: Vec<i32> = (20..70).collect();

    let mut results = Vec::new();
    for pool_pages in [2, 4, 8] {
        let left = MaterializedExecutor::new(
            columns("l"),
            left_ids.iter().map(|&id| tuple(id)).collect(),
        )
        .unwrap();
        let right = MaterializedExecutor::new(
            columns("r"),
            right_ids.iter().map(|&id| tuple(id)).collect(),
        )
        .unwrap();

        let mut join = BlockNestedLoopJoin::with_pool_pages(
            Box::new(left),
            Box::new(right),
            eq_on_id("l", "r"),
            make_pool(),
            pool_pages,
        )
        .unwrap();

        let mut pairs: Vec<(i32, i32)> = drain(&mut join)
            .iter()
            .map(|row| {
                let l = i32::from_le_bytes(row[0..4].try_into().unwrap());
                let r = i32::from_le_bytes(row[4 + PAD..8 + PAD].try_into().unwrap());
                (l, r)
            })
            .collect();
        pairs.sort();
        results.push(pairs);
    }

    let expected: Vec<(i32, i32)> = (20..40).map(|id| (id, id)).collect();
    for pairs in &results {
        assert_eq!(pairs, &expected, "join output must not depend on the budget");
    }
}

#[test]
fn empty_right_relation_yields_no_rows_and_terminates() {
    let left = id_tag_relation("l", &[(1, b"aaaa"), (2, b"bbbb")]);
    let right = id_tag_relation("r", &[]);

    let mut join = BlockNestedLoopJoin::new(
        Box::new(left),
        Box::new(right),
        eq_on_id("l", "r"),
        make_pool(),
    )
    .unwrap();

    assert!(drain(&mut join).is_empty());
    assert!(join.done());
    assert!(join.current().is_none());
}

#[test]
fn empty_left_relation_yields_no_rows_and_terminates() {
    let left = id_tag_relation("l", &[]);
    let right = id_tag_relation("r", &[(1, b"xxxx")]);

    let mut join = BlockNestedLoopJoin::new(
        Box::new(left),
        Box::new(right),
        eq_on_id("l", "r"),
        make_pool(),
    )
    .unwrap();

    assert!(drain(&mut join).is_empty());
}

#[test]
fn mismatched_condition_types_fail_at_construction() {
    let left = id_tag_relation("l", &[(1, b"aaaa")]);
    let right = id_tag_relation("r", &[(1, b"xxxx")]);

    let conditions = vec![JoinCondition::new(
        ColumnRef::new("l", "id"),
        CompareOp::Eq,
        ColumnRef::new("r", "tag"),
    )];

    let err = BlockNestedLoopJoin::new(Box::new(left), Box::new(right), conditions, make_pool())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::IncompatibleType { .. })
    ));
}

#[test]
fn unknown_condition_column_fails_at_construction() {
    let left = id_tag_relation("l", &[(1, b"aaaa")]);
    let right = id_tag_relation("r", &[(1, b"xxxx")]);

    let conditions = vec![JoinCondition::new(
        ColumnRef::new("l", "missing"),
        CompareOp::Eq,
        ColumnRef::new("r", "id"),
    )];

    assert!(
        BlockNestedLoopJoin::new(Box::new(left), Box::new(right), conditions, make_pool())
            .is_err()
    );
}

#[test]
fn advance_after_done_stays_done() {
    let left = id_tag_relation("l", &[(1, b"aaaa")]);
    let right = id_tag_relation("r", &[(1, b"xxxx")]);

    let mut join = BlockNestedLoopJoin::new(
        Box::new(left),
        Box::new(right),
        eq_on_id("l", "r"),
        make_pool(),
    )
    .unwrap();

    assert_eq!(drain(&mut join).len(), 1);
    assert!(join.done());

    join.advance().unwrap();
    join.advance().unwrap();
    assert!(join.done());
    assert!(join.current().is_none());
}

#[test]
fn temporary_pages_are_released_on_the_done_transition() {
    let pool = make_pool();
    let left = id_tag_relation("l", &[(1, b"aaaa"), (2, b"bbbb")]);
    let right = id_tag_relation("r", &[(1, b"xxxx"), (2, b"yyyy")]);

    let mut join = BlockNestedLoopJoin::new(
        Box::new(left),
        Box::new(right),
        eq_on_id("l", "r"),
        pool.clone(),
    )
    .unwrap();

    join.open().unwrap();
    assert!(pool.pinned_pages() > 0, "block pages should be pinned mid-join");

    while !join.done() {
        join.advance().unwrap();
    }
    assert_eq!(pool.pinned_pages(), 0, "done() transition must unpin everything");
}

#[test]
fn dropping_a_half_consumed_join_releases_its_pins() {
    let pool = make_pool();
    let left = id_tag_relation("l", &[(1, b"aaaa"), (2, b"bbbb")]);
    let right = id_tag_relation("r", &[(1, b"xxxx"), (2, b"yyyy")]);

    let mut join = BlockNestedLoopJoin::new(
        Box::new(left),
        Box::new(right),
        eq_on_id("l", "r"),
        pool.clone(),
    )
    .unwrap();

    join.open().unwrap();
    assert!(join.current().is_some());
    assert!(pool.pinned_pages() > 0);

    drop(join);
    assert_eq!(pool.pinned_pages(), 0, "teardown must free still-pinned pages");
}

#[test]
fn comparison_join_honors_the_operator() {
    let left = id_tag_relation("l", &[(1, b"aaaa"), (2, b"bbbb"), (3, b"cccc")]);
    let right = id_tag_relation("r", &[(2, b"xxxx"), (3, b"yyyy")]);

    let conditions = vec![JoinCondition::new(
        ColumnRef::new("l", "id"),
        CompareOp::Lt,
        ColumnRef::new("r", "id"),
    )];

    let mut join =
        BlockNestedLoopJoin::new(Box::new(left), Box::new(right), conditions, make_pool())
            .unwrap();

    let mut pairs: Vec<(i32, i32)> = drain(&mut join)
        .iter()
        .map(|row| {
            let l = i32::from_le_bytes(row[0..4].try_into().unwrap());
            let r = i32::from_le_bytes(row[8..12].try_into().unwrap());
            (l, r)
        })
        .collect();
    pairs.sort();

    assert_eq!(pairs, vec![(1, 2), (1, 3), (2, 3)]);
}

#[test]
fn condition_conjunction_requires_every_comparison() {
    let left = id_tag_relation("l", &[(1, b"same"), (2, b"same")]);
    let right = id_tag_relation("r", &[(1, b"same"), (2, b"diff")]);

    let conditions = vec![
        JoinCondition::new(
            ColumnRef::new("l", "id"),
            CompareOp::Eq,
            ColumnRef::new("r", "id"),
        ),
        JoinCondition::new(
            ColumnRef::new("l", "tag"),
            CompareOp::Eq,
            ColumnRef::new("r", "tag"),
        ),
    ];

    let mut join =
        BlockNestedLoopJoin::new(Box::new(left), Box::new(right), conditions, make_pool())
            .unwrap();

    let rows = drain(&mut join);
    assert_eq!(rows.len(), 1, "only (1, same) matches both conditions");
    assert_eq!(i32::from_le_bytes(rows[0][0..4].try_into().unwrap()), 1);
}

#[test]
fn join_runs_over_heap_file_scans() {
    let dir = TempDir::new().unwrap();
    let pool = make_pool();

    // record layout on both tables: [id: i32][tag: 4 chars]
    let mut users = HeapFile::create(pool.clone(), dir.path().join("users.hpf"), 8).unwrap();
    let mut orders = HeapFile::create(pool.clone(), dir.path().join("orders.hpf"), 8).unwrap();

    for (id, tag) in [(1, b"ann\0"), (2, b"bob\0"), (3, b"cat\0")] {
        users.insert(&id_tag_tuple(id, tag)).unwrap();
    }
    for (id, tag) in [(2, b"pen\0"), (3, b"ink\0"), (3, b"pad\0"), (9, b"---\0")] {
        orders.insert(&id_tag_tuple(id, tag)).unwrap();
    }

    let left = SeqScanExecutor::new(&users, id_tag_columns("users")).unwrap();
    let right = SeqScanExecutor::new(&orders, id_tag_columns("orders")).unwrap();

    let mut join = BlockNestedLoopJoin::new(
        Box::new(left),
        Box::new(right),
        eq_on_id("users", "orders"),
        pool.clone(),
    )
    .unwrap();

    let mut pairs: Vec<(i32, [u8; 4])> = drain(&mut join)
        .iter()
        .map(|row| {
            let id = i32::from_le_bytes(row[0..4].try_into().unwrap());
            let tag: [u8; 4] = row[12..16].try_into().unwrap();
            (id, tag)
        })
        .collect();
    pairs.sort();

    assert_eq!(
        pairs,
        vec![(2, *b"pen\0"), (3, *b"ink\0"), (3, *b"pad\0")]
    );
    assert_eq!(pool.pinned_pages(), 0);
}

#[test]
fn joins_compose_over_joins() {
    let pool = make_pool();
    let a = id_tag_relation("a", &[(1, b"a111"), (2, b"a222")]);
    let b = id_tag_relation("b", &[(1, b"b111"), (3, b"b333")]);
    let c = id_tag_relation("c", &[(1, b"c111"), (2, b"c222")]);

    let inner = BlockNestedLoopJoin::new(
        Box::new(a),
        Box::new(b),
        eq_on_id("a", "b"),
        pool.clone(),
    )
    .unwrap();

    // the outer join's left schema is the inner join's concatenation, so
    // "a".id is still addressable
    let mut outer = BlockNestedLoopJoin::new(
        Box::new(inner),
        Box::new(c),
        eq_on_id("a", "c"),
        pool.clone(),
    )
    .unwrap();

    let rows = drain(&mut outer);
    assert_eq!(rows.len(), 1);

    let row = &rows[0];
    assert_eq!(row.len(), 24);
    assert_eq!(i32::from_le_bytes(row[0..4].try_into().unwrap()), 1);
    assert_eq!(&row[4..8], b"a111");
    assert_eq!(&row[12..16], b"b111");
    assert_eq!(&row[20..24], b"c111");
    assert_eq!(pool.pinned_pages(), 0);
}
