mod common;

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Booth, NonNegativeTotals, booth, memory_db};
use doc_entity::{
    CollectionRepository, Error, Filter, FilterAndSort, IndexSpec, Page, Projection,
    RequestContext, Sort, Value, doc,
};

fn at(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap()
}

#[tokio::test]
async fn insert_then_get_returns_the_model_with_key_and_timestamp() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();

    let inserted = booths.insert(&booth("north")).await.unwrap();
    let fetched = booths.get_by_primary_key(&inserted.key).await.unwrap();

    assert_eq!(fetched.data, booth("north"));
    assert_eq!(fetched.key, inserted.key);
    assert!(fetched.created_on.is_some());
    assert_eq!(fetched.created_on, inserted.created_on);
}

#[tokio::test]
async fn invalid_insert_writes_nothing() {
    let (db, _) = memory_db();
    let booths = CollectionRepository::<Booth>::with_validator(&db, NonNegativeTotals::new());
    let before = booths.get_count_by_field(&Filter::All).await.unwrap();

    let mut bad = booth("south");
    bad.total_passed = -1;
    let err = booths.insert(&bad).await.unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(booths.get_count_by_field(&Filter::All).await.unwrap(), before);
}

#[tokio::test]
async fn insert_many_aborts_on_first_invalid_item() {
    let (db, _) = memory_db();
    let booths = CollectionRepository::<Booth>::with_validator(&db, NonNegativeTotals::new());

    let mut bad = booth("b");
    bad.total_passed = -5;
    let err = booths
        .insert_many(&[booth("a"), bad, booth("c")])
        .await
        .unwrap_err();

    match err {
        Error::BatchAbort { index, errors } => {
            assert_eq!(index, 1);
            assert_eq!(errors.errors()[0].path, "totalPassed");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(booths.get_count_by_field(&Filter::All).await.unwrap(), 0);

    assert_eq!(booths.insert_many(&[booth("a"), booth("c")]).await.unwrap(), 2);
    assert_eq!(booths.insert_many(&[]).await.unwrap(), 0);
}

#[tokio::test]
async fn upsert_sets_creation_time_once() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();
    let key = uuid::Uuid::new_v4().to_string();

    let created = booths
        .update_by_key(
            &key,
            &doc! {
                "name" => "west",
                "totalPassed" => 0,
                "location" => doc! { "city" => "Goa", "lane" => 2 },
            },
            true,
        )
        .await
        .unwrap();
    assert!(created);
    let first = booths.get_by_primary_key(&key).await.unwrap();
    assert!(first.created_on.is_some());

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(booths.update_by_key(&key, &doc! { "x" => 7 }, true).await.unwrap());

    let second = booths.get_by_primary_key(&key).await.unwrap();
    assert_eq!(second.created_on, first.created_on);
    assert_eq!(second.data.x, Some(7));
    assert_eq!(second.data.name, "west");
}

#[tokio::test]
async fn nested_update_keeps_sibling_fields() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();
    let key = booths.insert(&booth("east")).await.unwrap().key;

    booths
        .update_by_key(&key, &doc! { "location" => doc! { "lane" => 4 } }, false)
        .await
        .unwrap();

    let location = booths.get_by_primary_key(&key).await.unwrap().data.location;
    assert_eq!(location.lane, 4);
    assert_eq!(location.city, "Pune");
}

#[tokio::test]
async fn update_without_upsert_reports_no_match() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();

    let changed = booths
        .update_by_key("missing", &doc! { "x" => 1 }, false)
        .await
        .unwrap();
    assert!(!changed);
    assert_eq!(booths.get_count_by_field(&Filter::All).await.unwrap(), 0);
}

#[tokio::test]
async fn update_ignores_key_and_keeps_created_on() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();
    let record = booths.insert(&booth("east")).await.unwrap();

    booths
        .update_one(
            &Filter::eq("name", "east"),
            &doc! { "_id" => "hijack", "createdOn" => at(0), "y" => 3 },
            false,
        )
        .await
        .unwrap();

    let stored = booths.get_by_primary_key(&record.key).await.unwrap();
    assert_eq!(stored.created_on, record.created_on);
    assert_eq!(stored.data.y, Some(3));
}

#[tokio::test]
async fn update_many_touches_every_match() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();
    booths
        .insert_many(&[booth("a"), booth("b"), booth("c")])
        .await
        .unwrap();

    let changed = booths
        .update_many(&Filter::is_in("name", ["a", "b"]), &doc! { "z" => 1 }, false)
        .await
        .unwrap();
    assert!(changed);
    assert_eq!(booths.get_count_by_field(&Filter::eq("z", 1)).await.unwrap(), 2);
}

#[tokio::test]
async fn filter_and_sort_combines_or_clauses() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();
    let rows = [
        ("a", 3, Some(1), None, 100),
        ("b", 3, None, Some(2), 300),
        ("c", 3, None, None, 200),
        ("d", 4, Some(1), None, 400),
        ("e", 3, Some(1), Some(2), 200),
    ];
    for (name, z, x, y, created) in rows {
        let mut partial = doc! {
            "name" => name,
            "totalPassed" => 0,
            "location" => doc! { "city" => "Pune", "lane" => 1 },
            "z" => z,
            "createdOn" => at(created),
        };
        if let Some(x) = x {
            partial.insert("x", x);
        }
        if let Some(y) = y {
            partial.insert("y", y);
        }
        booths
            .update_by_key(&uuid::Uuid::new_v4().to_string(), &partial, true)
            .await
            .unwrap();
    }

    let found = booths
        .filter_and_sort(&FilterAndSort {
            filter: Filter::eq("z", 3),
            or: vec![Filter::eq("x", 1), Filter::eq("y", 2)],
            sort: Sort::desc("createdOn"),
            page: Page::all(),
        })
        .await
        .unwrap();

    let names: Vec<_> = found.iter().map(|record| record.data.name.as_str()).collect();
    assert_eq!(names, ["b", "e", "a"]);
}

#[tokio::test]
async fn paging_and_map_reads_keep_query_order() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();
    let mut keys = Vec::new();
    for name in ["a", "b", "c", "d"] {
        keys.push(booths.insert(&booth(name)).await.unwrap().key);
    }

    let page = booths.get_all(Page::new(2, 1)).await.unwrap();
    let names: Vec<_> = page.iter().map(|record| record.data.name.as_str()).collect();
    assert_eq!(names, ["b", "c"]);

    let map = booths.get_by_filter_as_map(&Filter::All, Page::all()).await.unwrap();
    assert_eq!(map.keys().cloned().collect::<Vec<_>>(), keys);
    assert_eq!(map[&keys[2]].data.name, "c");
}

#[tokio::test]
async fn list_reads_skip_documents_that_no_longer_validate() {
    let (db, store) = memory_db();
    let booths = db.collection::<Booth>();
    booths.insert(&booth("good")).await.unwrap();
    doc_entity::DocumentStore::insert_one(&store, "booths", doc! { "name" => 42 })
        .await
        .unwrap();

    let all = booths.get_all(Page::all()).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].data.name, "good");
}

#[tokio::test]
async fn single_reads_distinguish_missing_and_malformed_keys() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();

    assert!(matches!(
        booths.get_by_primary_key("not-a-uuid").await,
        Err(Error::InvalidKey(_))
    ));
    assert!(matches!(
        booths.get_by_primary_key(&uuid::Uuid::new_v4().to_string()).await,
        Err(Error::DoesNotExist)
    ));
    assert!(matches!(
        booths.get_by_custom_key("booth-7").await,
        Err(Error::DoesNotExist)
    ));

    booths.insert_with_key("booth-7", &booth("seven")).await.unwrap();
    assert_eq!(booths.get_by_custom_key("booth-7").await.unwrap().data.name, "seven");
    assert!(booths.exists_by_key("booth-7").await.unwrap());
    assert!(!booths.exists_by_key("booth-8").await.unwrap());
}

#[tokio::test]
async fn projection_limits_returned_fields() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();
    let key = booths.insert(&booth("north")).await.unwrap().key;

    let docs = booths
        .get_by_filter_projected(
            &Filter::All,
            &Projection::new().include("name").include("location.city"),
            Page::all(),
        )
        .await
        .unwrap();
    assert_eq!(
        docs,
        vec![doc! {
            "_id" => key.as_str(),
            "name" => "north",
            "location" => doc! { "city" => "Pune" },
        }]
    );

    let mixed = booths
        .get_by_filter_projected(
            &Filter::All,
            &Projection::new().include("name").exclude("location"),
            Page::all(),
        )
        .await;
    assert!(matches!(mixed, Err(Error::InvalidPath(_))));
}

#[tokio::test]
async fn unknown_paths_never_reach_the_store() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();

    assert!(matches!(
        booths.get_by_filter(&Filter::eq("colour", "red"), Page::all()).await,
        Err(Error::InvalidPath(_))
    ));
    assert!(matches!(
        booths.get_count_by_field(&Filter::gt("location.floor", 1)).await,
        Err(Error::InvalidPath(_))
    ));
}

#[tokio::test]
async fn increment_adds_numeric_deltas() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();
    let key = booths.insert(&booth("toll")).await.unwrap().key;

    assert!(booths
        .increment_one(&key, &doc! { "totalPassed" => 2, "_id" => "ignored" }, false)
        .await
        .unwrap());
    assert!(booths.increment_one(&key, &doc! { "totalPassed" => 3 }, false).await.unwrap());
    assert_eq!(booths.get_by_primary_key(&key).await.unwrap().data.total_passed, 5);

    let err = booths
        .increment_one(&key, &doc! { "name" => "x" }, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn deletes_report_whether_anything_was_removed() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();
    let key = booths.insert(&booth("a")).await.unwrap().key;
    booths.insert_many(&[booth("b"), booth("b")]).await.unwrap();

    assert!(booths.delete_by_key(&key).await.unwrap());
    assert!(!booths.delete_by_key(&key).await.unwrap());
    assert!(booths.delete_many(&Filter::eq("name", "b")).await.unwrap());
    assert!(!booths.delete_many(&Filter::eq("name", "b")).await.unwrap());
}

#[tokio::test]
async fn create_indexes_skips_failures() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>().with_context(RequestContext::new("req-1"));

    let names = booths
        .create_indexes(&[
            IndexSpec::ascending("totalPassed"),
            IndexSpec::ascending("doesNotExist"),
            IndexSpec::ascending("name").unique(),
        ])
        .await
        .unwrap();
    assert_eq!(names, ["totalPassed_1", "name_1"]);

    booths.insert(&booth("only")).await.unwrap();
    assert!(matches!(
        booths.insert(&booth("only")).await,
        Err(Error::DuplicateKey(_))
    ));
}

#[tokio::test]
async fn records_serialize_with_meta_fields() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();
    let record = booths.insert(&booth("json")).await.unwrap();

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["_id"], record.key.as_str());
    assert_eq!(json["name"], "json");
    assert_eq!(json["location"]["lane"], 1);
    assert!(json.get("createdOn").is_some());
    assert!(json.get("x").is_none());
    assert_eq!(record.to_document().get("totalPassed"), Some(&Value::Int(0)));
}
