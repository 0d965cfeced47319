mod common;

use common::{Booth, booth, memory_db};
use doc_entity::{IntoApiResponse, http::StatusCode};

#[tokio::test]
async fn repository_results_translate_to_responses() {
    let (db, _) = memory_db();
    let booths = db.collection::<Booth>();

    let created = booths.insert(&booth("api")).await.api_response();
    assert_eq!(created.status, StatusCode::OK);
    assert_eq!(created.message, "Successful Request");
    assert_eq!(created.body["name"], "api");

    let missing = booths
        .get_by_custom_key("nope")
        .await
        .api_response_or(StatusCode::NOT_FOUND);
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.message, "DoesNotExist");

    let failed = booths.get_by_custom_key("nope").await.api_response();
    assert_eq!(failed.status, StatusCode::INTERNAL_SERVER_ERROR);
}
