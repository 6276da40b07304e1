//! Contoso Bank tools: a balance lookup that runs freely and a payment
//! submission that always needs approval. Both work against a [`Ledger`]
//! injected through the agent's dependencies.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::error::ToolError;
use crate::tools::{ToolOutput, ToolSpec};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub amount: f64,
    pub recipient: String,
    pub reference: String,
}

#[derive(Debug)]
struct LedgerState {
    balance: f64,
    payments: Vec<Payment>,
}

#[derive(Debug)]
pub struct Ledger {
    currency: String,
    state: Mutex<LedgerState>,
}

impl Ledger {
    pub fn new(opening_balance: f64, currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            state: Mutex::new(LedgerState {
                balance: opening_balance,
                payments: Vec::new(),
            }),
        }
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn balance(&self) -> f64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).balance
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .payments
            .clone()
    }

    pub fn submit(&self, payment: Payment) -> Result<f64, ToolError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if payment.amount > state.balance {
            return Err(ToolError::Execution(format!(
                "insufficient funds: balance is {:.2} {}, payment needs {:.2}",
                state.balance, self.currency, payment.amount
            )));
        }
        state.balance -= payment.amount;
        state.payments.push(payment);
        Ok(state.balance)
    }
}

pub fn bank_tools() -> Vec<ToolSpec> {
    vec![get_account_balance_tool(), submit_payment_tool()]
}

pub fn get_account_balance_tool() -> ToolSpec {
    ToolSpec::new(
        "get_account_balance",
        "Return the current balance of the customer's account",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {},
        "required": [],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .with_handler(|_args, deps| {
        let ledger = deps.require::<Ledger>();
        async move {
            let ledger = ledger?;
            Ok(ToolOutput::Text(format!(
                "Current balance: {:.2} {}",
                ledger.balance(),
                ledger.currency()
            )))
        }
    })
}

pub fn submit_payment_tool() -> ToolSpec {
    ToolSpec::new(
        "submit_payment",
        "Submit a payment of the given amount to a recipient with a reference",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "amount": {"type": "number", "exclusiveMinimum": 0, "description": "Amount to transfer"},
            "recipient": {"type": "string", "description": "Name of the recipient"},
            "reference": {"type": "string", "description": "Payment reference"}
        },
        "required": ["amount", "recipient", "reference"],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .requires_approval(true)
    .with_handler(|args, deps| {
        let ledger = deps.require::<Ledger>();
        async move {
            let ledger = ledger?;
            let payment = Payment {
                amount: args.get("amount").and_then(Value::as_f64).unwrap_or_default(),
                recipient: string_arg(&args, "recipient"),
                reference: string_arg(&args, "reference"),
            };
            let remaining = ledger.submit(payment.clone())?;
            info!(
                amount = payment.amount,
                recipient = %payment.recipient,
                reference = %payment.reference,
                "payment submitted"
            );
            Ok(ToolOutput::Text(format!(
                "Payment of {:.2} {currency} to {} submitted (reference {}). Remaining balance: {remaining:.2} {currency}.",
                payment.amount,
                payment.recipient,
                payment.reference,
                currency = ledger.currency(),
            )))
        }
    })
}

fn string_arg(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
