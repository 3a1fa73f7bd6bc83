use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Resident for the lifetime of a weight resource.
    Static,
    /// Scratch planned during resize.
    Dynamic,
}

/// Host-side buffer accounting. A `false` from `acquire` means the buffer
/// cannot be provided and the caller must fail.
pub trait BufferPool: Send + Sync + std::fmt::Debug {
    fn acquire(&self, bytes: usize, lifetime: Lifetime) -> bool;
    fn release(&self, bytes: usize, lifetime: Lifetime);
}

/// Unbounded pool; every request succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapPool;

impl BufferPool for HeapPool {
    fn acquire(&self, _bytes: usize, _lifetime: Lifetime) -> bool { true }
    fn release(&self, _bytes: usize, _lifetime: Lifetime) {}
}

/// Pool with a fixed byte budget shared by both lifetimes.
#[derive(Debug)]
pub struct BudgetPool {
    budget: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl BudgetPool {
    pub fn new(budget: usize) -> Self { Self { budget, used: AtomicUsize::new(0), peak: AtomicUsize::new(0) } }
    pub fn used(&self) -> usize { self.used.load(Ordering::Relaxed) }
    pub fn peak(&self) -> usize { self.peak.load(Ordering::Relaxed) }
}

impl BufferPool for BudgetPool {
    fn acquire(&self, bytes: usize, _lifetime: Lifetime) -> bool {
        let res = self.used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            let next = cur.checked_add(bytes)?;
            if next > self.budget { None } else { Some(next) }
        });
        match res {
            Ok(prev) => { self.peak.fetch_max(prev + bytes, Ordering::Relaxed); true }
            Err(_) => false,
        }
    }

    fn release(&self, bytes: usize, _lifetime: Lifetime) {
        let _ = self.used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| Some(cur.saturating_sub(bytes)));
    }
}

/// Acquires a list of named buffers in order; on the first failure every
/// buffer taken so far is returned and the failing name is reported.
pub(crate) fn acquire_all(pool: &dyn BufferPool, lifetime: Lifetime, requests: &[(&str, usize)]) -> Result<(), String> {
    for (i, &(name, bytes)) in requests.iter().enumerate() {
        if !pool.acquire(bytes, lifetime) {
            for &(_, taken) in &requests[..i] { pool.release(taken, lifetime); }
            return Err(format!("{} ({} bytes)", name, bytes));
        }
    }
    Ok(())
}

pub(crate) fn release_all(pool: &dyn BufferPool, lifetime: Lifetime, requests: &[(&str, usize)]) {
    for &(_, bytes) in requests { pool.release(bytes, lifetime); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_pool_refuses_past_budget() {
        let pool = BudgetPool::new(100);
        assert!(pool.acquire(60, Lifetime::Static));
        assert!(!pool.acquire(60, Lifetime::Dynamic));
        pool.release(60, Lifetime::Static);
        assert!(pool.acquire(100, Lifetime::Dynamic));
        assert_eq!(pool.peak(), 100);
    }

    #[test]
    fn acquire_all_rolls_back_on_failure() {
        let pool = BudgetPool::new(50);
        let err = acquire_all(&pool, Lifetime::Dynamic, &[("a", 20), ("b", 20), ("c", 20)]).unwrap_err();
        assert!(err.starts_with("c"), "unexpected failing buffer: {}", err);
        assert_eq!(pool.used(), 0);
    }
}
