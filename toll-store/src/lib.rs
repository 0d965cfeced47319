//! Toll service collections.

mod models;

use doc_entity::{
    CollectionRepository, DB, FilterAndSort, IndexSpec, Page, Record, RepoResult, Sort,
};
use log::info;

pub use models::{PassType, PaymentStatus, TollBooth, TollCompany, TollPass, User};

/// Booth ranking criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leaderboard {
    Collection,
    VehiclesPassed,
}

/// One repository per collection, all on the same database.
#[derive(Clone)]
pub struct Repositories {
    pub users: CollectionRepository<User>,
    pub companies: CollectionRepository<TollCompany>,
    pub booths: CollectionRepository<TollBooth>,
    pub passes: CollectionRepository<TollPass>,
}

impl Repositories {
    pub fn open(db: &DB) -> Self {
        Self {
            users: db.collection(),
            companies: db.collection(),
            booths: db.collection(),
            passes: db.collection(),
        }
    }

    /// Startup indexes. Failures are logged by the repositories.
    pub async fn create_indexes(&self) -> RepoResult<Vec<String>> {
        let mut names = self
            .booths
            .create_indexes(&[
                IndexSpec::ascending("totalCollection"),
                IndexSpec::ascending("totalVehiclePassed"),
            ])
            .await?;
        names.extend(
            self.passes
                .create_indexes(&[IndexSpec::ascending("uid")])
                .await?,
        );
        info!("indexes ready: {names:?}");
        Ok(names)
    }

    /// Booths ranked highest first.
    pub async fn leaderboard(&self, by: Leaderboard, page: Page) -> RepoResult<Vec<Record<TollBooth>>> {
        let sort = match by {
            Leaderboard::Collection => Sort::desc("totalCollection"),
            Leaderboard::VehiclesPassed => Sort::desc("totalVehiclePassed"),
        };
        self.booths
            .filter_and_sort(&FilterAndSort {
                sort,
                page,
                ..Default::default()
            })
            .await
    }
}
