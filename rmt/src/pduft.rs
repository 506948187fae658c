use addr::Addr;
use channel::{Channel, ChannelId};
use slab::Slab;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

struct Entry {
    address: Addr,
    flow: Arc<dyn Channel>,
}

#[derive(Default)]
struct Inner {
    entries: Slab<Entry>,
    by_addr: HashMap<Addr, usize>,
    by_flow: HashMap<ChannelId, HashSet<usize>>,
}

impl Inner {
    fn link(&mut self, id: ChannelId, key: usize) {
        self.by_flow.entry(id).or_insert_with(HashSet::new).insert(key);
    }

    fn unlink(&mut self, id: ChannelId, key: usize) {
        let mut empty = false;
        if let Some(keys) = self.by_flow.get_mut(&id) {
            keys.remove(&key);
            empty = keys.is_empty();
        }
        if empty {
            self.by_flow.remove(&id);
        }
    }
}

/// The PDU forwarding table: destination address to lower flow.
///
/// Entries live in an arena and are indexed twice, by destination address
/// for lookup and by lower flow for teardown. One mutex protects the
/// table and both indexes; it is a leaf lock.
pub struct Pduft {
    inner: Mutex<Inner>,
}

impl Pduft {
    /// Creates an empty table.
    pub fn new() -> Pduft {
        Pduft {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Inserts or replaces the entry for `address`.
    ///
    /// Replacement moves the entry from the old flow's index to the new
    /// flow's, so teardown of either flow stays correct.
    pub fn set(&self, address: Addr, flow: Arc<dyn Channel>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&key) = inner.by_addr.get(&address) {
            let old = inner.entries[key].flow.id();
            inner.unlink(old, key);
            inner.link(flow.id(), key);
            inner.entries[key].flow = flow;
        } else {
            let id = flow.id();
            let key = inner.entries.insert(Entry { address, flow });
            inner.by_addr.insert(address, key);
            inner.link(id, key);
        }
    }

    /// Removes the entry for `address`. False when there is none.
    pub fn del(&self, address: Addr) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let key = match inner.by_addr.remove(&address) {
            Some(key) => key,
            None => return false,
        };
        let entry = inner.entries.remove(key);
        inner.unlink(entry.flow.id(), key);
        true
    }

    /// Drops every entry.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.by_addr.clear();
        inner.by_flow.clear();
    }

    /// Resolves a destination address to a lower flow.
    pub fn lookup(&self, address: Addr) -> Option<Arc<dyn Channel>> {
        let inner = self.inner.lock().unwrap();
        let key = *inner.by_addr.get(&address)?;
        Some(inner.entries[key].flow.clone())
    }

    /// Removes every entry referencing `id`, part of flow teardown.
    /// Returns how many entries went away.
    pub fn del_for_flow(&self, id: ChannelId) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let keys = match inner.by_flow.remove(&id) {
            Some(keys) => keys,
            None => return 0,
        };
        let mut count = 0;
        for key in keys {
            let entry = inner.entries.remove(key);
            inner.by_addr.remove(&entry.address);
            count += 1;
        }
        count
    }

    /// Number of installed entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// True when no entry is installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Pduft {
    fn default() -> Pduft {
        Pduft::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel::Loopback;

    #[test]
    fn test_set_lookup_del() {
        let pduft = Pduft::new();
        let fa = Arc::new(Loopback::new(4));
        assert!(pduft.lookup(5.into()).is_none());

        pduft.set(5.into(), fa.clone());
        assert_eq!(pduft.lookup(5.into()).unwrap().id(), fa.id());
        assert_eq!(pduft.len(), 1);

        assert!(pduft.del(5.into()));
        assert!(!pduft.del(5.into()));
        assert!(pduft.is_empty());
    }

    #[test]
    fn test_replace_relinks() {
        let pduft = Pduft::new();
        let fa = Arc::new(Loopback::new(4));
        let fb = Arc::new(Loopback::new(4));

        pduft.set(5.into(), fa.clone());
        pduft.set(5.into(), fb.clone());
        assert_eq!(pduft.len(), 1);
        assert_eq!(pduft.lookup(5.into()).unwrap().id(), fb.id());

        // The entry now belongs to fb; tearing fa down removes nothing.
        assert_eq!(pduft.del_for_flow(fa.id()), 0);
        assert_eq!(pduft.len(), 1);
        assert_eq!(pduft.del_for_flow(fb.id()), 1);
        assert!(pduft.is_empty());
    }

    #[test]
    fn test_del_for_flow() {
        let pduft = Pduft::new();
        let fa = Arc::new(Loopback::new(4));
        let fb = Arc::new(Loopback::new(4));
        for address in 1..=3u64 {
            pduft.set(address.into(), fa.clone());
        }
        pduft.set(9.into(), fb.clone());

        assert_eq!(pduft.del_for_flow(fa.id()), 3);
        assert_eq!(pduft.len(), 1);
        assert!(pduft.lookup(1.into()).is_none());
        assert_eq!(pduft.lookup(9.into()).unwrap().id(), fb.id());
    }

    #[test]
    fn test_flush() {
        let pduft = Pduft::new();
        let fa = Arc::new(Loopback::new(4));
        for address in 1..=4u64 {
            pduft.set(address.into(), fa.clone());
        }
        pduft.flush();
        assert!(pduft.is_empty());
        assert_eq!(pduft.del_for_flow(fa.id()), 0);
    }
}
