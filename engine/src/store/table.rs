//! Typed record table with one lock per row

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use uuid::Uuid;

use crate::errors::FleetError;

/// A record that can live in a [`Table`]
pub trait Record: Clone + Send + 'static {
    fn id(&self) -> Uuid;

    /// Called after every successful update
    fn touch(&mut self) {}
}

struct Row<V> {
    order: u64,
    value: Arc<Mutex<V>>,
}

/// In-memory table.
///
/// The map lock is only held to look a row up; mutations run under the row's
/// own mutex, so concurrent writers to one record are serialized while writers
/// to different records never contend.
pub struct Table<V> {
    name: &'static str,
    rows: RwLock<HashMap<Uuid, Row<V>>>,
    next_order: AtomicU64,
}

impl<V: Record> Table<V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: RwLock::new(HashMap::new()),
            next_order: AtomicU64::new(0),
        }
    }

    /// Insert (or replace) a record and return its id
    pub fn insert(&self, value: V) -> Uuid {
        let id = value.id();
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        rows.insert(
            id,
            Row {
                order,
                value: Arc::new(Mutex::new(value)),
            },
        );
        id
    }

    fn row(&self, id: &Uuid) -> Option<Arc<Mutex<V>>> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        rows.get(id).map(|row| row.value.clone())
    }

    /// Current copy of a record
    pub fn get(&self, id: &Uuid) -> Option<V> {
        self.row(id)
            .map(|row| row.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    /// Like [`Table::get`] but missing records are an error
    pub fn require(&self, id: &Uuid) -> Result<V, FleetError> {
        self.get(id)
            .ok_or_else(|| FleetError::NotFound(format!("{} {}", self.name, id)))
    }

    /// Read-modify-write a record under its row lock
    pub fn update<R>(&self, id: &Uuid, f: impl FnOnce(&mut V) -> R) -> Result<R, FleetError> {
        let row = self
            .row(id)
            .ok_or_else(|| FleetError::NotFound(format!("{} {}", self.name, id)))?;
        let mut value = row.lock().unwrap_or_else(|e| e.into_inner());
        let result = f(&mut value);
        value.touch();
        Ok(result)
    }

    /// Apply `f` to every record matching `predicate`, returning how many matched
    pub fn update_where(&self, predicate: impl Fn(&V) -> bool, f: impl Fn(&mut V)) -> usize {
        let rows: Vec<Arc<Mutex<V>>> = {
            let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
            rows.values().map(|row| row.value.clone()).collect()
        };

        let mut count = 0;
        for row in rows {
            let mut value = row.lock().unwrap_or_else(|e| e.into_inner());
            if predicate(&value) {
                f(&mut value);
                value.touch();
                count += 1;
            }
        }
        count
    }

    pub fn remove(&self, id: &Uuid) -> Option<V> {
        let row = {
            let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
            rows.remove(id)?
        };
        let value = row.value.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Some(value)
    }

    /// Records for an id set, in the order of `ids`; unknown ids are skipped
    pub fn filter(&self, ids: &[Uuid]) -> Vec<V> {
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Records matching `predicate`, in insertion order
    pub fn find(&self, predicate: impl Fn(&V) -> bool) -> Vec<V> {
        self.list().into_iter().filter(|v| predicate(v)).collect()
    }

    /// All records in insertion order
    pub fn list(&self) -> Vec<V> {
        let mut rows: Vec<(u64, Arc<Mutex<V>>)> = {
            let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
            rows.values()
                .map(|row| (row.order, row.value.clone()))
                .collect()
        };
        rows.sort_by_key(|(order, _)| *order);
        rows.into_iter()
            .map(|(_, row)| row.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
