use doc_entity::{DB, Error, Filter, Model, Page, StoreConfig, doc};

#[derive(Debug, Clone, PartialEq, Model)]
#[model(collection = "users", rename_all = "camelCase")]
pub struct UserInfo {
    pub name: String,
    pub age: i32,
    pub email: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    let db = DB::connect(&StoreConfig::from_env()?).await?;
    let users = db.collection::<UserInfo>();

    let alice = users
        .insert(&UserInfo {
            name: "Alice".to_string(),
            age: 25,
            email: "alice@example.com".to_string(),
        })
        .await?;
    println!("{:?}", alice);

    users.update_by_key(&alice.key, &doc! { "age" => 26 }, false).await?;

    let adults = users.get_by_filter(&Filter::gte("age", 18), Page::all()).await?;
    println!("{:?}", adults);

    users.delete_by_key(&alice.key).await?;
    db.close().await?;

    Ok(())
}
