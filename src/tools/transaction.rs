use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::Tool;
use crate::error::VoiceError;
use crate::ledger::{Account, Transaction, TransactionType};

pub const CREATE_TRANSACTION: &str = "createTransaction";

/// Receives each transaction the moment it is created. Runs on the dispatch
/// path, so it must return promptly.
type CommitFn = Arc<dyn Fn(Transaction) + Send + Sync>;

#[derive(Debug, Deserialize)]
struct CreateTransactionArgs {
    title: String,
    amount: f64,
    #[serde(rename = "type")]
    kind: TransactionType,
    #[serde(default)]
    account: Option<Account>,
}

impl CreateTransactionArgs {
    fn parse(arguments: &Map<String, Value>) -> Result<Self, VoiceError> {
        let args: Self = serde_json::from_value(Value::Object(arguments.clone()))
            .map_err(|e| VoiceError::InvalidToolArguments(e.to_string()))?;
        if args.title.trim().is_empty() {
            return Err(VoiceError::InvalidToolArguments("`title` is empty".to_string()));
        }
        if !args.amount.is_finite() {
            return Err(VoiceError::InvalidToolArguments(
                "`amount` is not a finite number".to_string(),
            ));
        }
        Ok(args)
    }
}

/// Records an income or expense dictated by the user.
pub struct CreateTransactionTool {
    commit: CommitFn,
}

impl CreateTransactionTool {
    pub fn new<F>(commit: F) -> Self
    where
        F: Fn(Transaction) + Send + Sync + 'static,
    {
        Self {
            commit: Arc::new(commit),
        }
    }
}

#[async_trait]
impl Tool for CreateTransactionTool {
    fn name(&self) -> &str {
        CREATE_TRANSACTION
    }

    fn description(&self) -> &str {
        "Adds a new financial transaction (income or expense) from the user's voice command."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "title": {
                    "type": "STRING",
                    "description": "Short description of the transaction (e.g. Lunch, Client X)"
                },
                "amount": {
                    "type": "NUMBER",
                    "description": "Numeric value of the transaction"
                },
                "type": {
                    "type": "STRING",
                    "enum": ["income", "expense"],
                    "description": "income for money in, expense for money out"
                },
                "account": {
                    "type": "STRING",
                    "enum": ["PJ", "PF", "Bonus"],
                    "description": "Source/destination account. Assume PF when not stated."
                }
            },
            "required": ["title", "amount", "type"]
        })
    }

    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value, VoiceError> {
        let args = CreateTransactionArgs::parse(arguments)?;
        let tx = Transaction::completed_now(
            args.title,
            args.amount,
            args.kind,
            args.account.unwrap_or_default(),
        );
        let id = tx.id;
        (self.commit)(tx);
        Ok(json!({ "transactionId": id.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn account_defaults_to_pf() {
        let parsed = CreateTransactionArgs::parse(&args(
            json!({"title": "Uber", "amount": 40, "type": "expense"}),
        ))
        .unwrap();
        assert_eq!(parsed.account.unwrap_or_default(), Account::Pf);

        let parsed = CreateTransactionArgs::parse(&args(
            json!({"title": "Uber", "amount": 40, "type": "expense", "account": null}),
        ))
        .unwrap();
        assert_eq!(parsed.account, None);
    }

    #[test]
    fn explicit_account_is_kept() {
        let parsed = CreateTransactionArgs::parse(&args(
            json!({"title": "Cliente X", "amount": 2000, "type": "income", "account": "PJ"}),
        ))
        .unwrap();
        assert_eq!(parsed.account, Some(Account::Pj));
        assert_eq!(parsed.kind, TransactionType::Income);
    }

    #[test]
    fn mistyped_fields_are_rejected() {
        let cases = [
            json!({"title": "Uber", "amount": "40", "type": "expense"}),
            json!({"title": "Uber", "amount": 40, "type": "transfer"}),
            json!({"title": 7, "amount": 40, "type": "expense"}),
            json!({"title": "Uber", "amount": 40, "type": "expense", "account": "Master"}),
            json!({"title": "   ", "amount": 40, "type": "expense"}),
            json!({"amount": 40, "type": "expense"}),
        ];
        for case in cases {
            let err = CreateTransactionArgs::parse(&args(case.clone())).unwrap_err();
            assert!(
                matches!(err, VoiceError::InvalidToolArguments(_)),
                "expected rejection for {}",
                case
            );
        }
    }

    #[tokio::test]
    async fn call_commits_exactly_once() {
        let committed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = committed.clone();
        let tool = CreateTransactionTool::new(move |tx| sink.lock().unwrap().push(tx));

        let output = tool
            .call(&args(json!({"title": "Farmácia", "amount": 30, "type": "expense", "account": "Premiação"})))
            .await
            .unwrap();

        let committed = committed.lock().unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].title, "Farmácia");
        assert_eq!(committed[0].account_origin, Account::Bonus);
        assert_eq!(output["transactionId"], committed[0].id.to_string());
    }
}
