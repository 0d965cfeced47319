use chrono::{DateTime, Utc};
use doc_entity::{Model, string_enum};

#[derive(Debug, Clone, PartialEq, Model)]
#[model(collection = "users", rename_all = "camelCase")]
pub struct User {
    pub name: String,
    pub phone_number: String,
}

#[derive(Debug, Clone, PartialEq, Model)]
#[model(collection = "toll_company")]
pub struct TollCompany {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Model)]
#[model(collection = "toll_booth", rename_all = "camelCase")]
pub struct TollBooth {
    pub company_id: String,
    pub total_collection: f64,
    pub total_vehicle_passed: i64,
    pub location: String,
}

impl TollBooth {
    /// A booth with zeroed counters.
    pub fn new(company_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            company_id: company_id.into(),
            total_collection: 0.0,
            total_vehicle_passed: 0,
            location: location.into(),
        }
    }
}

string_enum! {
    pub enum PassType {
        Single => "single",
        Return => "return",
        SevenDay => "7day",
    }
}

string_enum! {
    pub enum PaymentStatus {
        Pending => "pending",
        Failed => "failed",
        Success => "success",
    }
}

#[derive(Debug, Clone, PartialEq, Model)]
#[model(collection = "toll_pass", rename_all = "camelCase")]
pub struct TollPass {
    pub booth_id: String,
    pub uid: String,
    #[model(rename = "type")]
    pub pass_type: PassType,
    pub expire_at: Option<DateTime<Utc>>,
    pub usage: i64,
    pub payment_status: PaymentStatus,
}
