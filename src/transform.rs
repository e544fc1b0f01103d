use std::collections::HashMap;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use uuid::Uuid;

use crate::batch::{ExcludedTransaction, RawBatch, RawTransaction, Transaction, TransformedBatch};
use crate::error::TransformError;

/// Clean and enrich a raw batch into the form all algorithms assume.
/// Allocates a new batch; the raw input is retained unmodified for audit.
///
/// Per-row repairs: a missing transaction identifier is synthesized
/// deterministically from the batch position, a missing account identifier
/// falls back to "unknown". Rows missing amount or timestamp are excluded
/// and reported. Only a field absent on every row is a batch-level error.
pub fn transform_batch(raw: &RawBatch) -> Result<TransformedBatch, TransformError> {
    if raw.transactions.is_empty() {
        return Err(TransformError::EmptyBatch);
    }

    if raw.transactions.iter().all(|t| t.amount.is_none()) {
        return Err(TransformError::MissingEverywhere {
            field: "amount",
            ids: all_ids(raw),
        });
    }
    if raw.transactions.iter().all(|t| t.occurred_at.is_none()) {
        return Err(TransformError::MissingEverywhere {
            field: "occurred_at",
            ids: all_ids(raw),
        });
    }

    let mut transactions = Vec::with_capacity(raw.transactions.len());
    let mut excluded = Vec::new();

    for (index, row) in raw.transactions.iter().enumerate() {
        let id = transaction_id(row, index);

        let Some(amount) = row.amount else {
            excluded.push(ExcludedTransaction {
                id,
                reason: "missing amount".to_string(),
            });
            continue;
        };
        if !amount.is_finite() {
            excluded.push(ExcludedTransaction {
                id,
                reason: "non-finite amount".to_string(),
            });
            continue;
        }
        let Some(occurred_at) = row.occurred_at else {
            excluded.push(ExcludedTransaction {
                id,
                reason: "missing timestamp".to_string(),
            });
            continue;
        };

        let day_of_week = occurred_at.weekday();
        transactions.push(Transaction {
            id,
            account_id: row
                .account_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            amount,
            magnitude: amount.abs(),
            currency: row.currency.clone(),
            occurred_at,
            day_of_week,
            hour_of_day: occurred_at.hour() as u8,
            is_weekend: matches!(day_of_week, Weekday::Sat | Weekday::Sun),
            account_sequence: 0,
            hours_since_prev: None,
            payload: row.payload.clone(),
        });
    }

    add_sequence_features(&mut transactions);

    Ok(TransformedBatch {
        batch_id: raw.id,
        transactions,
        excluded,
    })
}

/// Per-account sequence position and inter-transaction gap, ordered by
/// timestamp with batch order breaking ties. Time-series algorithms read
/// these instead of re-deriving account timelines per pass.
fn add_sequence_features(transactions: &mut [Transaction]) {
    let mut by_account: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, tx) in transactions.iter().enumerate() {
        by_account.entry(tx.account_id.clone()).or_default().push(index);
    }

    for indices in by_account.values_mut() {
        indices.sort_by_key(|&i| transactions[i].occurred_at);

        let mut prev: Option<DateTime<Utc>> = None;
        for (position, &i) in indices.iter().enumerate() {
            let tx = &mut transactions[i];
            tx.account_sequence = (position + 1) as u32;
            tx.hours_since_prev =
                prev.map(|p| (tx.occurred_at - p).num_milliseconds() as f64 / 3_600_000.0);
            prev = Some(tx.occurred_at);
        }
    }
}

/// Stable identifier for a row: the upstream one if present, otherwise
/// derived from the batch position so re-runs see identical ids.
fn transaction_id(row: &RawTransaction, index: usize) -> String {
    row.external_id
        .clone()
        .unwrap_or_else(|| format!("row-{:06}", index))
}

fn all_ids(raw: &RawBatch) -> Vec<String> {
    raw.transactions
        .iter()
        .enumerate()
        .map(|(i, t)| transaction_id(t, i))
        .collect()
}
