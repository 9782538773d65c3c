//! In-process stand-in for the item engine, used by tests.
//!
//! Mirrors the engine semantics the store depends on: puts replace by primary
//! key, queries need an exact partition match, index queries only see items
//! carrying the index's key attributes, numeric sort keys compare by value,
//! and numbers outside the engine's magnitude range are rejected.

use super::{attr, Index, Item, ItemTables, KeyQuery, Table, TableError};
use crate::validation::validate_storable_score;
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryTables {
    sessions: Mutex<BTreeMap<String, Item>>,
    detections: Mutex<BTreeMap<(String, String), Item>>,
    session_reads: AtomicU64,
}

impl MemoryTables {
    /// Number of session point reads served so far
    pub fn session_reads(&self) -> u64 {
        self.session_reads.load(AtomicOrdering::Relaxed)
    }
}

fn key_string(item: &Item, name: &str, table: Table) -> Result<String, TableError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| TableError {
            operation: "put_item",
            table,
            message: format!("missing key attribute {name}"),
        })
}

fn check_number(
    value: &AttributeValue,
    operation: &'static str,
    table: Table,
) -> Result<(), TableError> {
    let AttributeValue::N(text) = value else {
        return Ok(());
    };
    text.parse::<f64>()
        .ok()
        .and_then(|number| validate_storable_score(number).ok())
        .map(|_| ())
        .ok_or_else(|| TableError {
            operation,
            table,
            message: format!("number {text} is outside the supported range"),
        })
}

fn compare(left: &AttributeValue, right: &AttributeValue) -> Option<Ordering> {
    match (left, right) {
        (AttributeValue::N(l), AttributeValue::N(r)) => {
            let l: f64 = l.parse().ok()?;
            let r: f64 = r.parse().ok()?;
            l.partial_cmp(&r)
        }
        (AttributeValue::S(l), AttributeValue::S(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn satisfies(item: &Item, query: &KeyQuery) -> bool {
    if item.get(query.partition_key) != Some(&query.partition_value) {
        return false;
    }
    match &query.sort_at_least {
        Some((key, floor)) => item
            .get(*key)
            .and_then(|value| compare(value, floor))
            .map(|ordering| ordering != Ordering::Less)
            .unwrap_or(false),
        None => true,
    }
}

fn sort_value(item: &Item, index: Option<Index>) -> Option<&AttributeValue> {
    match index {
        Some(_) => item.get(attr::SCORE),
        None => item.get(attr::LABEL_SCORE),
    }
}

#[async_trait]
impl ItemTables for MemoryTables {
    async fn put_item(&self, table: Table, item: Item) -> Result<(), TableError> {
        for value in item.values() {
            check_number(value, "put_item", table)?;
        }

        match table {
            Table::Sessions => {
                let uid = key_string(&item, attr::UID, table)?;
                self.sessions.lock().unwrap().insert(uid, item);
            }
            Table::Detections => {
                let partition = key_string(&item, attr::PREDICTION_UID, table)?;
                let sort = key_string(&item, attr::LABEL_SCORE, table)?;
                self.detections
                    .lock()
                    .unwrap()
                    .insert((partition, sort), item);
            }
        }
        Ok(())
    }

    async fn get_item(&self, table: Table, key: Item) -> Result<Option<Item>, TableError> {
        match table {
            Table::Sessions => {
                self.session_reads.fetch_add(1, AtomicOrdering::Relaxed);
                let uid = key_string(&key, attr::UID, table)?;
                Ok(self.sessions.lock().unwrap().get(&uid).cloned())
            }
            Table::Detections => Err(TableError {
                operation: "get_item",
                table,
                message: "point reads need the full composite key".to_string(),
            }),
        }
    }

    async fn query(&self, query: KeyQuery) -> Result<Vec<Item>, TableError> {
        if query.consistent && query.index.is_some() {
            return Err(TableError {
                operation: "query",
                table: query.table,
                message: "consistent reads are not supported on global secondary indexes"
                    .to_string(),
            });
        }
        if let Some((_, floor)) = &query.sort_at_least {
            check_number(floor, "query", query.table)?;
        }

        let mut items: Vec<Item> = match query.table {
            Table::Sessions => self
                .sessions
                .lock()
                .unwrap()
                .values()
                .filter(|item| satisfies(item, &query))
                .cloned()
                .collect(),
            Table::Detections => self
                .detections
                .lock()
                .unwrap()
                .values()
                .filter(|item| satisfies(item, &query))
                .cloned()
                .collect(),
        };

        items.sort_by(|a, b| {
            match (sort_value(a, query.index), sort_value(b, query.index)) {
                (Some(a), Some(b)) => compare(a, b).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            }
        });

        Ok(items)
    }

    async fn ping(&self) -> Result<(), TableError> {
        Ok(())
    }
}
