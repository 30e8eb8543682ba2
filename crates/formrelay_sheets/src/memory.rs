use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use formrelay_contract::AppendRecord;
use tracing::info;

use crate::writer::{AppendReceipt, SheetWriter, WriteError};

#[derive(Debug, Default)]
pub struct InMemorySheetWriter {
    rows: Mutex<Vec<AppendRecord>>,
    scripted_failures: Mutex<VecDeque<WriteError>>,
}

impl InMemorySheetWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: WriteError) {
        lock(&self.scripted_failures).push_back(error);
    }

    pub fn rows(&self) -> Vec<AppendRecord> {
        lock(&self.rows).clone()
    }
}

#[async_trait]
impl SheetWriter for InMemorySheetWriter {
    async fn append(&self, record: &AppendRecord) -> Result<AppendReceipt, WriteError> {
        if let Some(error) = lock(&self.scripted_failures).pop_front() {
            return Err(error);
        }

        let mut rows = lock(&self.rows);
        rows.push(record.clone());
        let row_number = rows.len() + 1;
        info!(name = %record.name, row = row_number, "row kept in memory");

        Ok(AppendReceipt {
            updated_range: Some(format!("A{row_number}:D{row_number}")),
            updated_rows: 1,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
