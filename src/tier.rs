//! Byte-budgeted LRU tiers.
//!
//! A [`LruTier`] tracks the set of pages currently residing in one storage
//! tier, keeps them in recency order, and enforces a total-bytes budget at
//! epoch boundaries. The tier never moves a page itself; when over budget it
//! invokes the page's [`LruPage::evict_lru`] hook, which may comply by
//! withdrawing and demoting, refuse (the page is retried next epoch), or
//! requeue itself at the MRU end to defer far into the future.

use ahash::AHashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Weak;
use tracing::debug;

/// Eviction capability of a page enrolled in a tier.
///
/// The tier holds pages through this trait so it never needs to know what a
/// page is; the hook is invoked with no tier lock held and is free to call
/// back into any tier.
pub trait LruPage: Send + Sync {
    /// Demote one tier, or refuse and stay put.
    fn evict_lru(&self);
}

/// Identity of a page within a tier, derived from the page's address.
///
/// Stable for the lifetime of the owning allocation, which is exactly the
/// window during which the page can be enrolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(usize);

impl PageId {
    /// The identity of the given page.
    pub fn of<P: LruPage>(page: &std::sync::Arc<P>) -> Self {
        Self(std::sync::Arc::as_ptr(page) as *const () as usize)
    }

    pub(crate) fn new(addr: usize) -> Self {
        Self(addr)
    }
}

struct Entry {
    page: Weak<dyn LruPage>,
    size: usize,
    used: u64,
    enrolled: u64,
}

struct TierInner {
    budget: Option<usize>,
    total: usize,
    clock: u64,
    entries: AHashMap<PageId, Entry>,
    // Recency order: (last-used tick, enrollment tick) -> page. The
    // enrollment tick breaks ties so equal-recency pages evict in
    // enrollment order.
    order: BTreeMap<(u64, u64), PageId>,
}

/// An ordered set of pages with a total byte budget.
///
/// `budget` of `None` disables eviction entirely; `Some(0)` makes every
/// enrollment immediately eligible, which callers use to bypass a tier.
pub struct LruTier {
    name: &'static str,
    inner: Mutex<TierInner>,
}

impl LruTier {
    /// Create a tier with the given display name and byte budget.
    pub fn new(name: &'static str, budget: Option<usize>) -> Self {
        Self {
            name,
            inner: Mutex::new(TierInner {
                budget,
                total: 0,
                clock: 0,
                entries: AHashMap::new(),
                order: BTreeMap::new(),
            }),
        }
    }

    /// The tier's display name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The tier's byte budget; `None` means unlimited.
    pub fn budget(&self) -> Option<usize> {
        self.inner.lock().budget
    }

    /// Sum of the enrolled pages' byte sizes.
    pub fn total_size(&self) -> usize {
        self.inner.lock().total
    }

    /// Number of enrolled pages.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no pages are enrolled.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Whether the page is currently enrolled.
    pub fn contains(&self, id: PageId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    /// Add a page at the MRU end with the given byte size.
    ///
    /// Re-enrolling an already-present page refreshes its recency and size.
    pub fn enroll(&self, id: PageId, page: Weak<dyn LruPage>, size: usize) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(&id) {
            inner.order.remove(&(old.used, old.enrolled));
            inner.total -= old.size;
        }
        inner.clock += 1;
        let tick = inner.clock;
        inner.total += size;
        inner.order.insert((tick, tick), id);
        inner.entries.insert(
            id,
            Entry {
                page,
                size,
                used: tick,
                enrolled: tick,
            },
        );
    }

    /// Remove a page. Returns whether it was enrolled.
    pub fn withdraw(&self, id: PageId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(&id) {
            Some(entry) => {
                inner.order.remove(&(entry.used, entry.enrolled));
                inner.total -= entry.size;
                true
            }
            None => false,
        }
    }

    /// Move a page to the MRU end.
    pub fn touch(&self, id: PageId) {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let tick = inner.clock;
        if let Some(entry) = inner.entries.get_mut(&id) {
            let key = (entry.used, entry.enrolled);
            entry.used = tick;
            let new_key = (entry.used, entry.enrolled);
            inner.order.remove(&key);
            inner.order.insert(new_key, id);
        }
    }

    /// Update a page's budget contribution without changing its recency.
    pub fn resize(&self, id: PageId, new_size: usize) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&id) {
            let old = entry.size;
            entry.size = new_size;
            inner.total = inner.total - old + new_size;
        }
    }

    /// Consider evictions for this epoch.
    ///
    /// Walks a snapshot of the LRU order, invoking each page's evict hook
    /// while the tier is over budget. A page that refuses (or requeues
    /// itself) is not revisited this epoch, so the loop always terminates
    /// after one full pass.
    pub fn begin_epoch(&self) {
        let candidates: Vec<(PageId, Weak<dyn LruPage>)> = {
            let inner = self.inner.lock();
            let Some(budget) = inner.budget else {
                return;
            };
            if inner.total <= budget {
                return;
            }
            inner
                .order
                .values()
                .map(|id| (*id, inner.entries[id].page.clone()))
                .collect()
        };

        for (id, weak) in candidates {
            {
                let inner = self.inner.lock();
                let over = matches!(inner.budget, Some(budget) if inner.total > budget);
                if !over {
                    break;
                }
                if !inner.entries.contains_key(&id) {
                    continue;
                }
            }
            match weak.upgrade() {
                Some(page) => page.evict_lru(),
                None => {
                    // Owner went away without withdrawing; drop the entry.
                    debug!(tier = self.name, "dropping dead page from lru");
                    self.withdraw(id);
                }
            }
        }
    }

    /// The page ids currently enrolled, in LRU-to-MRU order.
    #[cfg(test)]
    fn order(&self) -> Vec<PageId> {
        self.inner.lock().order.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A page that complies with eviction by withdrawing itself.
    struct Compliant {
        tier: Arc<LruTier>,
        evictions: AtomicUsize,
    }

    impl Compliant {
        fn id(self: &Arc<Self>) -> PageId {
            PageId::of(self)
        }

        fn enroll(self: &Arc<Self>, size: usize) {
            let weak: Weak<dyn LruPage> = Arc::downgrade(&(self.clone() as Arc<dyn LruPage>));
            self.tier.enroll(self.id(), weak, size);
        }
    }

    impl LruPage for Compliant {
        fn evict_lru(&self) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            let id = PageId::new(self as *const Self as usize);
            self.tier.withdraw(id);
        }
    }

    /// A page that refuses every eviction request.
    struct Stubborn;

    impl LruPage for Stubborn {
        fn evict_lru(&self) {}
    }

    fn compliant(tier: &Arc<LruTier>) -> Arc<Compliant> {
        Arc::new(Compliant {
            tier: tier.clone(),
            evictions: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_enroll_withdraw_accounting() {
        let tier = Arc::new(LruTier::new("test", None));
        let a = compliant(&tier);
        let b = compliant(&tier);
        a.enroll(100);
        b.enroll(50);
        assert_eq!(tier.total_size(), 150);
        assert_eq!(tier.len(), 2);
        assert!(tier.withdraw(a.id()));
        assert_eq!(tier.total_size(), 50);
        assert!(!tier.withdraw(a.id()));
    }

    #[test]
    fn test_touch_moves_to_mru() {
        let tier = Arc::new(LruTier::new("test", None));
        let a = compliant(&tier);
        let b = compliant(&tier);
        a.enroll(10);
        b.enroll(10);
        assert_eq!(tier.order(), vec![a.id(), b.id()]);
        tier.touch(a.id());
        assert_eq!(tier.order(), vec![b.id(), a.id()]);
    }

    #[test]
    fn test_resize_updates_total() {
        let tier = Arc::new(LruTier::new("test", None));
        let a = compliant(&tier);
        a.enroll(10);
        tier.resize(a.id(), 300);
        assert_eq!(tier.total_size(), 300);
    }

    #[test]
    fn test_epoch_evicts_lru_first() {
        let tier = Arc::new(LruTier::new("test", Some(100)));
        let a = compliant(&tier);
        let b = compliant(&tier);
        let c = compliant(&tier);
        a.enroll(60);
        b.enroll(60);
        c.enroll(60);
        tier.touch(a.id());
        tier.begin_epoch();
        // b and c (least recent) go; a stays within budget.
        assert_eq!(b.evictions.load(Ordering::Relaxed), 1);
        assert_eq!(c.evictions.load(Ordering::Relaxed), 1);
        assert_eq!(a.evictions.load(Ordering::Relaxed), 0);
        assert_eq!(tier.total_size(), 60);
    }

    #[test]
    fn test_epoch_unlimited_budget_never_evicts() {
        let tier = Arc::new(LruTier::new("test", None));
        let a = compliant(&tier);
        a.enroll(usize::MAX / 2);
        tier.begin_epoch();
        assert_eq!(a.evictions.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_epoch_zero_budget_evicts_everything() {
        let tier = Arc::new(LruTier::new("test", Some(0)));
        let a = compliant(&tier);
        let b = compliant(&tier);
        a.enroll(1);
        b.enroll(1);
        tier.begin_epoch();
        assert!(tier.is_empty());
    }

    #[test]
    fn test_epoch_terminates_on_refusal() {
        let tier = Arc::new(LruTier::new("test", Some(0)));
        let page = Arc::new(Stubborn);
        let weak: Weak<dyn LruPage> = Arc::downgrade(&(page.clone() as Arc<dyn LruPage>));
        let id = PageId::of(&page);
        tier.enroll(id, weak, 10);
        // One pass, page refuses, loop ends; page stays enrolled.
        tier.begin_epoch();
        assert!(tier.contains(id));
        assert_eq!(tier.total_size(), 10);
    }

    #[test]
    fn test_epoch_drops_dead_pages() {
        let tier = Arc::new(LruTier::new("test", Some(0)));
        let id = {
            let page = Arc::new(Stubborn);
            let weak: Weak<dyn LruPage> = Arc::downgrade(&(page.clone() as Arc<dyn LruPage>));
            let id = PageId::of(&page);
            tier.enroll(id, weak, 10);
            id
        };
        tier.begin_epoch();
        assert!(!tier.contains(id));
        assert_eq!(tier.total_size(), 0);
    }

    #[test]
    fn test_reenroll_refreshes_size_and_recency() {
        let tier = Arc::new(LruTier::new("test", None));
        let a = compliant(&tier);
        let b = compliant(&tier);
        a.enroll(10);
        b.enroll(10);
        a.enroll(25);
        assert_eq!(tier.total_size(), 35);
        assert_eq!(tier.order(), vec![b.id(), a.id()]);
    }
}
