//! Clock variables & unification.
//!
//! A `ClockVariable` is a union-find cell: either *unknown* or
//! *known(clock)*. Freshly created sources hold an unknown variable
//! until the collector unifies it with a concrete clock; scripts/tests
//! that already know which clock they want unify two variables
//! directly. Path compression keeps repeated `find()` calls cheap.

use super::base::Clock;
use crate::error::{ClockError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

enum Cell {
    Unknown,
    Known(Arc<Clock>),
    Redirect(ClockVariable),
}

/// A clock unification variable. Cloning a `ClockVariable` clones the
/// handle, not the cell — all clones observe the same binding.
#[derive(Clone)]
pub struct ClockVariable(Arc<Mutex<Cell>>);

impl ClockVariable {
    pub fn unknown() -> Self {
        Self(Arc::new(Mutex::new(Cell::Unknown)))
    }

    pub fn known(clock: Arc<Clock>) -> Self {
        Self(Arc::new(Mutex::new(Cell::Known(clock))))
    }

    fn ptr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Identity comparison of the variable handle itself (not its
    /// union-find representative) — used by `Clock::detach_clock` to
    /// find the exact handle that was attached.
    pub fn same_as(&self, other: &ClockVariable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Resolve to the representative variable for this equivalence
    /// class, compressing the path as it goes.
    fn find(&self) -> ClockVariable {
        let next = {
            let cell = self.0.lock();
            match &*cell {
                Cell::Redirect(other) => other.clone(),
                _ => return self.clone(),
            }
        };
        let root = next.find();
        if root.ptr() != next.ptr() {
            *self.0.lock() = Cell::Redirect(root.clone());
        }
        root
    }

    pub fn is_known(&self) -> bool {
        matches!(&*self.find().0.lock(), Cell::Known(_))
    }

    pub fn known_clock(&self) -> Option<Arc<Clock>> {
        match &*self.find().0.lock() {
            Cell::Known(c) => Some(c.clone()),
            _ => None,
        }
    }

    /// Merge the equivalence classes of `a` and `b`. A no-op if they
    /// are already the same class (including `unify(v, v)`, invariant
    /// 6). Fails with [`ClockError::ClockConflict`] if both sides are
    /// known and resolve to different clocks.
    pub fn unify(a: &ClockVariable, b: &ClockVariable) -> Result<()> {
        let ra = a.find();
        let rb = b.find();
        if ra.ptr() == rb.ptr() {
            return Ok(());
        }

        // Lock in a fixed order (by allocation address) so two
        // concurrent unifications of the same pair never deadlock.
        let (first, second) = if ra.ptr() < rb.ptr() {
            (&ra, &rb)
        } else {
            (&rb, &ra)
        };
        let mut first_cell = first.0.lock();
        let mut second_cell = second.0.lock();

        match (&*first_cell, &*second_cell) {
            (Cell::Known(c1), Cell::Known(c2)) => {
                if Arc::ptr_eq(c1, c2) {
                    Ok(())
                } else {
                    Err(ClockError::ClockConflict(c1.id.clone(), c2.id.clone()))
                }
            }
            (Cell::Known(_), _) => {
                *second_cell = Cell::Redirect(first.clone());
                Ok(())
            }
            (_, Cell::Known(_)) => {
                *first_cell = Cell::Redirect(second.clone());
                Ok(())
            }
            _ => {
                *second_cell = Cell::Redirect(first.clone());
                Ok(())
            }
        }
    }
}
