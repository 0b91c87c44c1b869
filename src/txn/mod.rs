//! Fixed-size transaction slot table.
//!
//! Slot 0 is the main timeline: it always exists and its buffer is the
//! current (unsealed) layer. Slots `1..TRANSACTION_COUNT` are handed out by
//! [`TransactionTable::allocate`] and returned by [`TransactionTable::finish`].
//!
//! Lock order, outermost first: main slot, table, transaction slot, WAL.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::layer::Layer;

pub const TRANSACTION_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u32);

impl TxnId {
    /// The implicit transaction every non-transactional call runs in.
    pub const MAIN: TxnId = TxnId(0);

    pub fn is_main(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn index(self) -> Option<usize> {
        let idx = self.0 as usize;
        (idx < TRANSACTION_COUNT).then_some(idx)
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TxnId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[derive(Debug, Default)]
pub(crate) struct SlotState {
    pub layer: Layer,
    /// Set once the slot has been committed or rolled back. A caller that
    /// fetched the slot before that point must not write into it.
    pub released: bool,
}

#[derive(Debug, Default)]
pub(crate) struct TxnSlot {
    state: RwLock<SlotState>,
}

impl TxnSlot {
    fn with_layer(layer: Layer) -> Self {
        Self {
            state: RwLock::new(SlotState {
                layer,
                released: false,
            }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SlotState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SlotState> {
        self.state.write()
    }
}

#[derive(Debug)]
pub(crate) struct TransactionTable {
    main: Arc<TxnSlot>,
    slots: RwLock<Vec<Option<Arc<TxnSlot>>>>,
}

impl TransactionTable {
    pub fn new(current: Layer) -> Self {
        let main = Arc::new(TxnSlot::with_layer(current));
        let mut slots = vec![None; TRANSACTION_COUNT];
        slots[0] = Some(main.clone());
        Self {
            main,
            slots: RwLock::new(slots),
        }
    }

    pub fn main(&self) -> &Arc<TxnSlot> {
        &self.main
    }

    /// Resolves an allocated slot. Fails for ids out of range or not in use.
    pub fn slot(&self, id: TxnId) -> Result<Arc<TxnSlot>> {
        let idx = id.index().ok_or_else(|| Error::invalid_txn(id))?;
        self.slots.read()[idx]
            .clone()
            .ok_or_else(|| Error::invalid_txn(id))
    }

    /// Claims the lowest free slot. `log` runs with the table locked, before
    /// the slot becomes visible; if it fails nothing is allocated.
    pub fn allocate<F>(&self, log: F) -> Result<TxnId>
    where
        F: FnOnce(TxnId) -> Result<()>,
    {
        let mut slots = self.slots.write();
        let idx = slots
            .iter()
            .skip(1)
            .position(Option::is_none)
            .map(|pos| pos + 1)
            .ok_or(Error::NoFreeTransaction)?;
        let id = TxnId(idx as u32);
        log(id)?;
        slots[idx] = Some(Arc::new(TxnSlot::default()));
        Ok(id)
    }

    /// Ends a transaction: marks it released, runs `f` on its state and frees
    /// the id. `f` runs with both the table and the slot write-locked, so
    /// nothing can reuse the id or write into the slot until it returns.
    pub fn finish<R>(&self, id: TxnId, f: impl FnOnce(&mut SlotState) -> R) -> Result<R> {
        let idx = id
            .index()
            .filter(|_| !id.is_main())
            .ok_or_else(|| Error::invalid_txn(id))?;
        let mut slots = self.slots.write();
        let slot = slots[idx].take().ok_or_else(|| Error::invalid_txn(id))?;
        let mut state = slot.write();
        state.released = true;
        Ok(f(&mut state))
    }

    /// Runs `f` over every active transaction's buffer while holding the
    /// table and each slot read-locked: no transaction can start, end or
    /// write until `f` returns.
    pub fn with_active<R>(&self, f: impl FnOnce(&[(TxnId, &Layer)]) -> R) -> R {
        let slots = self.slots.read();
        let guards: Vec<(TxnId, RwLockReadGuard<'_, SlotState>)> = slots
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(idx, slot)| slot.as_ref().map(|slot| (TxnId(idx as u32), slot.read())))
            .collect();
        let views: Vec<(TxnId, &Layer)> = guards.iter().map(|(id, g)| (*id, &g.layer)).collect();
        f(&views)
    }

    pub fn active_ids(&self) -> Vec<TxnId> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, slot)| slot.is_some())
            .map(|(idx, _)| TxnId(idx as u32))
            .collect()
    }
}
