//! Transaction records produced by voice commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Income,
    Expense,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Account {
    #[serde(rename = "PJ")]
    Pj,
    #[default]
    #[serde(rename = "PF")]
    Pf,
    #[serde(rename = "Bonus", alias = "Premiação")]
    Bonus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Provisioned,
    Pending,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    None,
    Weekly,
    Monthly,
    Annual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub title: String,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub category: String,
    pub date: DateTime<Utc>,
    pub status: TransactionStatus,
    pub account_origin: Account,
    pub recurrence: Recurrence,
}

impl Transaction {
    /// A completed, non-recurring transaction dated now.
    pub fn completed_now(title: String, amount: f64, kind: TransactionType, account: Account) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            amount,
            kind,
            category: default_category(kind).to_string(),
            date: Utc::now(),
            status: TransactionStatus::Completed,
            account_origin: account,
            recurrence: Recurrence::None,
        }
    }
}

/// Voice-created entries land in the generic personal-account categories.
pub fn default_category(kind: TransactionType) -> &'static str {
    match kind {
        TransactionType::Income => "cat_pf_input",
        TransactionType::Expense => "cat_pf_misc",
    }
}
