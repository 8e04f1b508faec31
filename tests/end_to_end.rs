//! End-to-end scenarios: init/commit/checkout round trips, patch splitting,
//! diffs, imports, cloning and pushing between stores.

use std::collections::BTreeMap;
use std::sync::Arc;

use tablepack::core::diff::DiffResult;
use tablepack::core::engine::Engine;
use tablepack::core::object::ObjectFormat;
use tablepack::core::repository::{CommitOptions, ImportOptions, Repository};
use tablepack::core::schema::{Column, Row, TableSchema};
use tablepack::core::sync::clone_repository;
use tablepack::core::value::{ColumnType, Value};
use tablepack::core::{CancelToken, HEAD};
use tablepack::errors::StoreError;
use tablepack::hash::ObjectHash;

fn kv_schema() -> TableSchema {
    TableSchema::new(vec![
        Column::new("k", ColumnType::Integer, true),
        Column::new("v", ColumnType::Text, false),
    ])
}

fn row(k: i64, v: &str) -> Row {
    vec![Value::Integer(k), Value::Text(v.into())]
}

fn init_repo(engine: &Arc<Engine>) -> Repository {
    let repo = Repository::new("ns", "r", engine.clone());
    repo.init().unwrap();
    repo
}

/// Set up the repository of scenario S2: table `t` with three rows,
/// committed with a chunk size of 2. Returns the commit.
fn setup_s2(repo: &Repository) -> tablepack::core::image::Image {
    let schema = repo.to_schema();
    repo.engine.create_table(&schema, "t", kv_schema()).unwrap();
    for r in [row(1, "a"), row(2, "b"), row(3, "c")] {
        repo.engine.insert_row(&schema, "t", r).unwrap();
    }
    repo.commit(&CommitOptions {
        chunk_size: Some(2),
        ..Default::default()
    })
    .unwrap()
}

/// Apply the S3 changeset (update 1, delete 3, insert 4) and commit with
/// changeset splitting.
fn setup_s3(repo: &Repository) -> tablepack::core::image::Image {
    let schema = repo.to_schema();
    repo.engine
        .update_row(&schema, "t", &[Value::Integer(1)], row(1, "A"))
        .unwrap();
    repo.engine
        .delete_row(&schema, "t", &[Value::Integer(3)])
        .unwrap();
    repo.engine.insert_row(&schema, "t", row(4, "d")).unwrap();
    repo.commit(&CommitOptions {
        split_changeset: true,
        ..Default::default()
    })
    .unwrap()
}

fn materialized_rows(repo: &Repository, table: &str, image: &ObjectHash) -> Vec<Row> {
    let handle = repo.materialized_table(table, Some(image), None).unwrap();
    let (_, rows) = repo
        .engine
        .read_table(handle.schema(), handle.table())
        .unwrap();
    rows
}

/// S1: init creates the all-zeros image with HEAD on it; an empty commit
/// produces a child of it with no tables.
#[test]
fn test_init_and_commit_empty() {
    let engine = Arc::new(Engine::new("local"));
    let repo = init_repo(&engine);

    let zero = ObjectHash::zero();
    assert!(repo.images().by_hash(&zero).is_ok());
    assert_eq!(repo.head().unwrap().unwrap().image_hash, zero);

    let image = repo.commit(&CommitOptions::default()).unwrap();
    assert_eq!(image.parent_id, Some(zero));
    assert!(repo.images().get_tables(&image.image_hash).is_empty());
    assert_eq!(repo.head().unwrap().unwrap().image_hash, image.image_hash);
}

/// S2: a chunked base snapshot commit produces two BASE fragments over
/// [1..2] and [3..3], and materializes back to the same rows.
#[test]
fn test_base_snapshot_commit() {
    let engine = Arc::new(Engine::new("local"));
    let repo = init_repo(&engine);
    let i1 = setup_s2(&repo);

    let table = repo.images().get_table(&i1.image_hash, "t").unwrap();
    assert_eq!(table.objects.len(), 2);
    let metas = repo.objects().get_object_metas(&table.objects).unwrap();
    assert!(metas.iter().all(|m| m.format == ObjectFormat::Base));
    assert_eq!(
        metas[0].index.bounds.get("k"),
        Some(&(Value::Integer(1), Value::Integer(2)))
    );
    assert_eq!(
        metas[1].index.bounds.get("k"),
        Some(&(Value::Integer(3), Value::Integer(3)))
    );

    assert_eq!(
        materialized_rows(&repo, "t", &i1.image_hash),
        vec![row(1, "a"), row(2, "b"), row(3, "c")]
    );
}

/// S3: a split patch commit parents one patch on each prior base and adds
/// a new base for the inserted key outside both ranges.
#[test]
fn test_patch_commit_with_split() {
    let engine = Arc::new(Engine::new("local"));
    let repo = init_repo(&engine);
    let i1 = setup_s2(&repo);
    let i2 = setup_s3(&repo);

    let base_objects = repo.images().get_table(&i1.image_hash, "t").unwrap().objects;
    let table = repo.images().get_table(&i2.image_hash, "t").unwrap();
    assert_eq!(table.objects.len(), 5);
    let metas = repo.objects().get_object_metas(&table.objects).unwrap();
    let patches: Vec<_> = metas
        .iter()
        .filter(|m| m.format == ObjectFormat::Patch)
        .collect();
    assert_eq!(patches.len(), 2);
    assert_eq!(patches[0].parent_object_ids, vec![base_objects[0]]);
    assert_eq!(patches[1].parent_object_ids, vec![base_objects[1]]);
    let new_bases: Vec<_> = metas
        .iter()
        .filter(|m| m.format == ObjectFormat::Base && !base_objects.contains(&m.object_id))
        .collect();
    assert_eq!(new_bases.len(), 1);

    assert_eq!(
        materialized_rows(&repo, "t", &i2.image_hash),
        vec![row(1, "A"), row(2, "b"), row(4, "d")]
    );
}

/// S4: diff between HEAD and staging with aggregation comes out of the
/// audit log as (added, removed, updated).
#[test]
fn test_diff_aggregate_against_staging() {
    let engine = Arc::new(Engine::new("local"));
    let repo = init_repo(&engine);
    let i1 = setup_s2(&repo);

    let schema = repo.to_schema();
    repo.engine
        .update_row(&schema, "t", &[Value::Integer(2)], row(2, "B"))
        .unwrap();
    repo.engine.insert_row(&schema, "t", row(5, "e")).unwrap();

    let result = repo
        .diff("t", Some(&i1.image_hash), None, true)
        .unwrap();
    match result {
        DiffResult::Aggregate(agg) => assert_eq!(agg.as_tuple(), (1, 0, 1)),
        other => panic!("expected an aggregate, got {other:?}"),
    }
}

/// S5: an import based on an image without `t` produces an image where
/// `t` reads as removed.
#[test]
fn test_diff_table_removed_after_import() {
    let engine = Arc::new(Engine::new("local"));
    let repo = init_repo(&engine);
    let i1 = setup_s2(&repo);

    let other = Repository::new("ns", "other", engine.clone());
    other.init().unwrap();
    other
        .engine
        .create_table(&other.to_schema(), "u", kv_schema())
        .unwrap();
    other
        .engine
        .insert_row(&other.to_schema(), "u", row(1, "x"))
        .unwrap();
    other.commit(&CommitOptions::default()).unwrap();

    let i3 = repo
        .import_tables(
            &other,
            &ImportOptions {
                tables: vec!["u".to_string()],
                source_tables: vec!["u".to_string()],
                parent_hash: Some(ObjectHash::zero()),
                do_checkout: false,
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(
        repo.diff("t", Some(&i1.image_hash), Some(&i3), false).unwrap(),
        DiffResult::Removed
    );
}

/// S6: a metadata-only clone transfers no payloads; checking out I2 on the
/// local store fetches exactly the objects of I2's chain and yields the
/// same rows as on the remote.
#[test]
fn test_clone_then_checkout() {
    let remote_engine = Arc::new(Engine::new("origin"));
    let remote = init_repo(&remote_engine);
    setup_s2(&remote);
    let i2 = setup_s3(&remote);

    let local_engine = Arc::new(Engine::new("local"));
    let local = clone_repository(&remote, None, Some(local_engine.clone()), false, None).unwrap();
    assert!(local_engine.payload_ids().is_empty(), "metadata-only clone");
    assert!(local.head().unwrap().is_none(), "clone leaves HEAD unset");

    local
        .checkout(&i2.image_hash, false, Some(remote_engine.as_ref()))
        .unwrap();
    let (_, rows) = local_engine.read_table(&local.to_schema(), "t").unwrap();
    assert_eq!(rows, vec![row(1, "A"), row(2, "b"), row(4, "d")]);

    let mut fetched = local_engine.payload_ids();
    fetched.sort();
    let mut expected = local.images().get_table(&i2.image_hash, "t").unwrap().objects;
    expected.sort();
    assert_eq!(fetched, expected, "only I2's chain was downloaded");
}

/// Property 1: commit then checkout round-trips the working table under
/// different encodings.
#[test]
fn test_commit_checkout_round_trip_variants() {
    for (snap_only, chunk_size, split) in [
        (false, None, false),
        (true, Some(1), false),
        (false, Some(2), true),
    ] {
        let engine = Arc::new(Engine::new("local"));
        let repo = init_repo(&engine);
        let schema = repo.to_schema();
        repo.engine.create_table(&schema, "t", kv_schema()).unwrap();
        for r in [row(1, "a"), row(2, "b"), row(3, "c")] {
            repo.engine.insert_row(&schema, "t", r).unwrap();
        }
        repo.commit(&CommitOptions {
            chunk_size,
            ..Default::default()
        })
        .unwrap();

        repo.engine
            .update_row(&schema, "t", &[Value::Integer(2)], row(2, "B"))
            .unwrap();
        repo.engine.insert_row(&schema, "t", row(4, "d")).unwrap();
        let image = repo
            .commit(&CommitOptions {
                snap_only,
                chunk_size,
                split_changeset: split,
                ..Default::default()
            })
            .unwrap();

        let expected = {
            let (_, rows) = repo.engine.read_table(&schema, "t").unwrap();
            rows
        };
        repo.engine
            .update_row(&schema, "t", &[Value::Integer(1)], row(1, "z"))
            .unwrap();
        repo.checkout(&image.image_hash, true, None).unwrap();
        let (_, rows) = repo.engine.read_table(&schema, "t").unwrap();
        assert_eq!(rows, expected, "snap_only={snap_only} chunk={chunk_size:?} split={split}");
    }
}

/// Property 2: a commit with no intervening writes reuses the parent's
/// object chains verbatim.
#[test]
fn test_idempotent_commit_reuses_objects() {
    let engine = Arc::new(Engine::new("local"));
    let repo = init_repo(&engine);
    let i1 = setup_s2(&repo);

    let i2 = repo.commit(&CommitOptions::default()).unwrap();
    assert_eq!(i2.parent_id, Some(i1.image_hash));
    assert_eq!(
        repo.images().get_table(&i1.image_hash, "t").unwrap().objects,
        repo.images().get_table(&i2.image_hash, "t").unwrap().objects,
    );
}

/// Property 6: a metadata-only clone carries every image, tag, descriptor,
/// object record and location.
#[test]
fn test_clone_is_metadata_complete() {
    let remote_engine = Arc::new(Engine::new("origin"));
    let remote = init_repo(&remote_engine);
    let i1 = setup_s2(&remote);
    setup_s3(&remote);
    remote.images().tag(&i1.image_hash, "v1").unwrap();

    let local_engine = Arc::new(Engine::new("local"));
    let local = clone_repository(&remote, None, Some(local_engine.clone()), false, None).unwrap();

    let remote_images: Vec<_> = remote
        .images()
        .all_images()
        .into_iter()
        .map(|image| image.image_hash)
        .collect();
    let local_images: Vec<_> = local
        .images()
        .all_images()
        .into_iter()
        .map(|image| image.image_hash)
        .collect();
    assert_eq!(remote_images, local_images);

    for image in remote.images().all_images() {
        for table in remote.images().get_tables(&image.image_hash) {
            let remote_table = remote.images().get_table(&image.image_hash, &table).unwrap();
            let local_table = local.images().get_table(&image.image_hash, &table).unwrap();
            assert_eq!(remote_table.objects, local_table.objects);
            assert_eq!(remote_table.table_schema, local_table.table_schema);
            assert!(local.objects().get_object_metas(&local_table.objects).is_ok());
        }
    }

    let mut remote_tags = remote.images().all_tags();
    remote_tags.remove(HEAD);
    assert_eq!(local.images().all_tags().get("v1"), remote_tags.get("v1"));
    assert!(!local.images().all_tags().contains_key(HEAD));
}

/// Property 7: clone with payloads then checkout equals checkout on the
/// remote.
#[test]
fn test_clone_download_all_checkout_equivalence() {
    let remote_engine = Arc::new(Engine::new("origin"));
    let remote = init_repo(&remote_engine);
    setup_s2(&remote);
    let i2 = setup_s3(&remote);

    let local_engine = Arc::new(Engine::new("local"));
    let local = clone_repository(&remote, None, Some(local_engine.clone()), true, None).unwrap();
    // No access to the remote at checkout time.
    local.checkout(&i2.image_hash, false, None).unwrap();

    let (_, local_rows) = local_engine.read_table(&local.to_schema(), "t").unwrap();
    let (_, remote_rows) = remote_engine.read_table(&remote.to_schema(), "t").unwrap();
    assert_eq!(local_rows, remote_rows);
}

/// Property 8: importing a clashing table fails and leaves the target
/// repository unchanged.
#[test]
fn test_import_clash_leaves_repository_unchanged() {
    let engine = Arc::new(Engine::new("local"));
    let repo = init_repo(&engine);
    setup_s2(&repo);

    let other = Repository::new("ns", "other", engine.clone());
    other.init().unwrap();
    other
        .engine
        .create_table(&other.to_schema(), "t", kv_schema())
        .unwrap();
    other.commit(&CommitOptions::default()).unwrap();

    let images_before = repo.images().all_images().len();
    let result = repo.import_tables(
        &other,
        &ImportOptions {
            tables: vec!["t".to_string()],
            source_tables: vec!["t".to_string()],
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(StoreError::TableClash(..))));
    assert_eq!(repo.images().all_images().len(), images_before);
}

/// Query imports snapshot the filtered result as a new BASE.
#[test]
fn test_import_query() {
    let engine = Arc::new(Engine::new("local"));
    let repo = init_repo(&engine);
    setup_s2(&repo);

    let target = Repository::new("ns", "filtered", engine.clone());
    target.init().unwrap();
    let image = target
        .import_tables(
            &repo,
            &ImportOptions {
                tables: vec!["big".to_string()],
                source_tables: vec!["SELECT * FROM t WHERE k > 1".to_string()],
                table_queries: vec![true],
                ..Default::default()
            },
        )
        .unwrap();

    let (_, rows) = engine.read_table(&target.to_schema(), "big").unwrap();
    assert_eq!(rows, vec![row(2, "b"), row(3, "c")]);
    assert_eq!(target.head().unwrap().unwrap().image_hash, image);
    // The previous tables of the parent image (none here) plus the new one.
    assert_eq!(target.images().get_tables(&image), vec!["big".to_string()]);
}

/// Push transfers payloads through the FILE handler, recording locations
/// on both ends; a later clone can fetch payloads from the files alone.
#[test]
fn test_push_with_file_handler_and_lazy_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let local_engine = Arc::new(Engine::new("local"));
    let local = init_repo(&local_engine);
    setup_s2(&local);
    let i2 = setup_s3(&local);

    let remote_engine = Arc::new(Engine::new("origin"));
    let remote = Repository::new("ns", "r", remote_engine.clone());
    let params = serde_json::json!({ "path": dir.path() });
    local.push_to(&remote, "FILE", &params, None).unwrap();

    assert!(remote_engine.payload_ids().is_empty(), "payloads went to files");
    let remote_table = remote.images().get_table(&i2.image_hash, "t").unwrap();
    let locations = remote.objects().get_object_locations(&remote_table.objects);
    assert_eq!(locations.len(), remote_table.objects.len());
    assert_eq!(
        local.objects().get_object_locations(&remote_table.objects).len(),
        remote_table.objects.len(),
        "the source records the new locations too"
    );
    assert_eq!(local.get_upstream().unwrap().remote_name, "origin");

    // A third store can now check the table out from the files alone.
    let other_engine = Arc::new(Engine::new("elsewhere"));
    let other = clone_repository(&remote, None, Some(other_engine.clone()), false, None).unwrap();
    other.checkout(&i2.image_hash, false, None).unwrap();
    let (_, rows) = other_engine.read_table(&other.to_schema(), "t").unwrap();
    assert_eq!(rows, vec![row(1, "A"), row(2, "b"), row(4, "d")]);
}

/// Push with the DB handler lands payloads in the remote store itself.
#[test]
fn test_push_db_handler() {
    let local_engine = Arc::new(Engine::new("local"));
    let local = init_repo(&local_engine);
    let i1 = setup_s2(&local);

    let remote_engine = Arc::new(Engine::new_bare("origin"));
    let remote = Repository::new("ns", "r", remote_engine.clone());
    local
        .push_to(&remote, "DB", &serde_json::Value::Null, None)
        .unwrap();

    let table = remote.images().get_table(&i1.image_hash, "t").unwrap();
    assert!(table.objects.iter().all(|id| remote_engine.has_payload(id)));

    // A second push has nothing to do and succeeds.
    local
        .push_to(&remote, "DB", &serde_json::Value::Null, None)
        .unwrap();
}

/// Cancellation during commit rolls the metadata back; nothing of the new
/// image remains.
#[test]
fn test_cancelled_commit_rolls_back() {
    let engine = Arc::new(Engine::new("local"));
    let repo = init_repo(&engine);
    setup_s2(&repo);
    let schema = repo.to_schema();
    repo.engine.insert_row(&schema, "t", row(9, "z")).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let images_before = repo.images().all_images().len();
    let payloads_before = repo.engine.payload_ids().len();
    let result = repo.commit(&CommitOptions {
        cancel: Some(cancel),
        ..Default::default()
    });
    assert!(matches!(result, Err(StoreError::Cancelled)));
    assert_eq!(repo.images().all_images().len(), images_before);
    assert_eq!(repo.engine.payload_ids().len(), payloads_before);
    // The pending change survives for a later commit.
    assert!(repo.has_pending_changes().unwrap());
}

/// Uncheckout refuses on pending changes unless forced, then drops the
/// schema and the HEAD tag.
#[test]
fn test_uncheckout_conflict_and_force() {
    let engine = Arc::new(Engine::new("local"));
    let repo = init_repo(&engine);
    setup_s2(&repo);
    let schema = repo.to_schema();
    repo.engine.insert_row(&schema, "t", row(9, "z")).unwrap();

    assert!(matches!(
        repo.uncheckout(false),
        Err(StoreError::CheckoutConflict(_))
    ));
    repo.uncheckout(true).unwrap();
    assert!(repo.head().unwrap().is_none());
    assert!(!repo.engine.schema_exists(&schema));
    // The history survives.
    assert!(!repo.images().all_images().is_empty());
}

/// The dump stream carries its sections in registration order and leaves
/// HEAD out.
#[test]
fn test_dump_sections() {
    let engine = Arc::new(Engine::new("local"));
    let repo = init_repo(&engine);
    let i1 = setup_s2(&repo);
    repo.images().tag(&i1.image_hash, "v1").unwrap();

    let mut out = Vec::new();
    repo.dump(&mut out, false).unwrap();
    let dump = String::from_utf8(out).unwrap();

    let sections = [
        "-- Images --",
        "-- Objects --",
        "-- Tables --",
        "-- Tags --",
        "-- Object contents --",
    ];
    let mut last = 0;
    for section in sections {
        let position = dump[last..]
            .find(section)
            .unwrap_or_else(|| panic!("missing section {section}"));
        last += position;
    }
    assert!(dump.contains("'v1'"));
    assert!(!dump.contains("'HEAD'"));
    assert!(dump.contains("DROP FOREIGN TABLE IF EXISTS"));

    let mut without_contents = Vec::new();
    repo.dump(&mut without_contents, true).unwrap();
    assert!(!String::from_utf8(without_contents)
        .unwrap()
        .contains("-- Object contents --"));
}

/// Cleanup drops payloads no descriptor references while keeping their
/// metadata.
#[test]
fn test_cleanup_preserves_metadata() {
    let engine = Arc::new(Engine::new("local"));
    let repo = init_repo(&engine);
    let i1 = setup_s2(&repo);
    let objects = repo.images().get_table(&i1.image_hash, "t").unwrap().objects;

    // Unregister the repository: its objects become unreferenced.
    repo.delete(true, true).unwrap();
    let removed = repo.objects().cleanup().unwrap();
    assert_eq!(removed.len(), objects.len());
    for id in &objects {
        assert!(!engine.has_payload(id));
        assert!(
            repo.objects().get_object_metas(&[*id]).is_ok(),
            "metadata survives payload eviction"
        );
    }
}

/// Publishing a pushed tag records the catalog entry on the remote.
#[test]
fn test_publish() {
    let local_engine = Arc::new(Engine::new("local"));
    let local = init_repo(&local_engine);
    let i1 = setup_s2(&local);
    local.images().tag(&i1.image_hash, "v1").unwrap();

    let remote_engine = Arc::new(Engine::new_bare("origin"));
    let remote = Repository::new("ns", "r", remote_engine.clone());
    local
        .push_to(&remote, "DB", &serde_json::Value::Null, None)
        .unwrap();
    local.publish("v1", &remote, "a readme", true, true).unwrap();

    let info = remote.get_publication("v1").unwrap();
    assert_eq!(info.image_hash, i1.image_hash);
    assert_eq!(info.readme, "a readme");
    assert_eq!(
        info.previews.unwrap().get("t").unwrap().len(),
        3,
        "previews carry the table rows"
    );

    assert!(matches!(
        local.publish("nope", &remote, "", true, false),
        Err(StoreError::TagNotFound(..))
    ));
}

/// Deterministic object ids: identical rows and chunking produce identical
/// chains across stores (quickcheck over arbitrary row sets).
#[test]
fn test_deterministic_ids_property() {
    fn prop(entries: Vec<(i64, String)>) -> bool {
        let unique: BTreeMap<i64, String> = entries.into_iter().collect();
        let build = || {
            let engine = Arc::new(Engine::new("store"));
            let repo = Repository::new("ns", "r", engine.clone());
            repo.init().unwrap();
            let schema = repo.to_schema();
            engine.create_table(&schema, "t", kv_schema()).unwrap();
            for (k, v) in &unique {
                engine.insert_row(&schema, "t", row(*k, v)).unwrap();
            }
            let image = repo
                .commit(&CommitOptions {
                    chunk_size: Some(2),
                    ..Default::default()
                })
                .unwrap();
            repo.images().get_table(&image.image_hash, "t").unwrap().objects
        };
        build() == build()
    }
    quickcheck::quickcheck(prop as fn(Vec<(i64, String)>) -> bool);
}
