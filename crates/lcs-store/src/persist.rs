//! Writing cell graphs into stores.
//!
//! The novelty handler passed to these functions fires once for each hash
//! that the call wrote into the store for the first time. Cells already in
//! the store, whoever wrote them, never fire it again.

use std::collections::HashSet;

use lcs_types::Hash;
use tracing::debug;

use crate::cell::Cell;
use crate::error::{StoreError, StoreResult};
use crate::reference::{Ref, RefStatus};
use crate::traits::CellStore;

/// Callback receiving each ref whose cell was newly written.
pub type Novelty<'a> = Option<&'a mut dyn FnMut(&Ref)>;

/// Write this ref's own encoding into `store`, leaving children untouched.
///
/// No-op if the ref is already at least [`RefStatus::Stored`] in `store`.
pub fn persist_shallow<S: CellStore + ?Sized>(
    store: &S,
    r: &Ref,
    mut novelty: Novelty<'_>,
) -> StoreResult<Ref> {
    store_one(store, r, &mut novelty)?;
    Ok(r.clone())
}

/// Write this ref's cell and every non-embedded cell reachable from it.
///
/// The top cell is written even when embedded, so it can serve as a root.
/// Subtrees already [`RefStatus::Persisted`] in `store` are skipped. Fails
/// with `MissingData` if some reachable cell is neither in memory nor in
/// `store`; everything written before the failure stays written.
pub fn persist<S: CellStore + ?Sized>(
    store: &S,
    r: &Ref,
    mut novelty: Novelty<'_>,
) -> StoreResult<Ref> {
    persist_graph(store, r, RefStatus::Persisted, &mut novelty)?;
    Ok(r.clone())
}

/// Persist `cell` and mark it announced.
///
/// Announcing a cell that is already in `store` fires no novelty, so
/// re-announcing the same value is silent.
pub fn announce<S: CellStore + ?Sized>(
    store: &S,
    cell: &Cell,
    mut novelty: Novelty<'_>,
) -> StoreResult<Ref> {
    let r = Ref::new(cell.clone());
    persist_graph(store, &r, RefStatus::Announced, &mut novelty)?;
    Ok(r)
}

fn store_one<S: CellStore + ?Sized>(
    store: &S,
    r: &Ref,
    novelty: &mut Novelty<'_>,
) -> StoreResult<()> {
    let id = store.id();
    if r.status_in(id) >= RefStatus::Stored {
        return Ok(());
    }
    let fresh = match r.cell() {
        Some(cell) => store.write_cell(cell)?,
        None if store.contains(&r.hash())? => false,
        None => return Err(StoreError::MissingData(r.hash())),
    };
    r.advance(id, RefStatus::Stored);
    if fresh {
        debug!(hash = %r.hash().short_hex(), "novel cell");
        if let Some(handler) = novelty.as_mut() {
            handler(r);
        }
    }
    Ok(())
}

fn persist_graph<S: CellStore + ?Sized>(
    store: &S,
    top: &Ref,
    target: RefStatus,
    novelty: &mut Novelty<'_>,
) -> StoreResult<()> {
    let id = store.id();
    // (ref, is top, children already pushed)
    let mut stack = vec![(top.clone(), true, false)];
    while let Some((r, is_top, expanded)) = stack.pop() {
        if expanded {
            r.advance(id, target);
            continue;
        }
        if r.status_in(id) >= target {
            continue;
        }
        let cell = r.value_in(store)?;
        if is_top || !cell.is_embedded() {
            store_one(store, &r, novelty)?;
        }
        stack.push((r, is_top, true));
        stack.extend(cell.refs().iter().rev().map(|child| (child.clone(), false, false)));
    }
    Ok(())
}

/// Copy the cell stored under `hash` in `src`, with everything reachable
/// from it, into `dst`. Returns the hashes that were new to `dst`.
pub fn copy_cell<S, D>(src: &S, dst: &D, hash: &Hash) -> StoreResult<Vec<Hash>>
where
    S: CellStore + ?Sized,
    D: CellStore + ?Sized,
{
    let root = src
        .read_cell(hash)?
        .ok_or(StoreError::MissingData(*hash))?;
    resolve_all(src, &root)?;

    let mut written = Vec::new();
    let mut record = |r: &Ref| written.push(r.hash());
    persist(dst, &Ref::new(root), Some(&mut record))?;
    Ok(written)
}

// Attach every reachable cell from `store` to its ref.
fn resolve_all<S: CellStore + ?Sized>(store: &S, cell: &Cell) -> StoreResult<()> {
    let mut seen = HashSet::new();
    let mut stack = vec![cell.clone()];
    while let Some(cell) = stack.pop() {
        for child in cell.refs() {
            let value = child.value_in(store)?;
            if seen.insert(value.hash()) {
                stack.push(value);
            }
        }
    }
    Ok(())
}

/// Hashes of non-embedded descendants of `cell` that are neither in memory
/// nor in `store`. Stored descendants are read so their own children are
/// checked too.
pub fn missing_children<S: CellStore + ?Sized>(store: &S, cell: &Cell) -> StoreResult<Vec<Hash>> {
    let mut missing = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![cell.clone()];
    while let Some(cell) = stack.pop() {
        for child in cell.refs() {
            if !seen.insert(child.hash()) {
                continue;
            }
            match child.cell() {
                Some(value) => stack.push(value.clone()),
                None => match store.read_cell(&child.hash())? {
                    Some(value) => {
                        child.resolve(value.clone())?;
                        stack.push(value);
                    }
                    None => missing.push(child.hash()),
                },
            }
        }
    }
    Ok(missing)
}
