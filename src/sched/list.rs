use slab::Slab;

/// Identifies one connection entry inside a scheduler's shared arena.
///
/// Keys stay valid until the entry is removed from the arena; the scheduler
/// never hands a key to callers after removal.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConnKey(pub(crate) usize);

/// One arena slot: a connection plus its intrusive list links.
///
/// An entry belongs to at most one [`ConnectionList`] at a time. The links are
/// slab indices rather than pointers, which keeps relinking O(1) without any
/// allocation or unsafe code.
pub struct Entry<C> {
    pub conn: C,
    prev: Option<ConnKey>,
    next: Option<ConnKey>,
}

impl<C> Entry<C> {
    fn new(conn: C) -> Self {
        Self {
            conn,
            prev: None,
            next: None,
        }
    }
}

/// An intrusive doubly-linked list over entries in a shared `Slab` arena.
///
/// The list itself only stores `head`, `tail` and a length counter; every
/// operation takes the arena so that two lists (active and idle) can exchange
/// entries without moving the connections they wrap. All operations other than
/// [`ConnectionList::remove_by`] are O(1).
///
/// Callers must only pass keys that belong to this list; the arena makes a
/// violation a logic error rather than memory unsafety.
pub struct ConnectionList {
    head: Option<ConnKey>,
    tail: Option<ConnKey>,
    len: usize,
}

impl ConnectionList {
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Option<ConnKey> {
        self.head
    }

    /// Key of the entry after `key`, in head-to-tail order.
    pub fn next<C>(&self, arena: &Slab<Entry<C>>, key: ConnKey) -> Option<ConnKey> {
        arena[key.0].next
    }

    /// Allocates a new entry for `conn` and appends it to the tail.
    pub fn add<C>(&mut self, arena: &mut Slab<Entry<C>>, conn: C) -> ConnKey {
        let key = ConnKey(arena.insert(Entry::new(conn)));
        self.add_to_end(arena, key);
        key
    }

    /// Links an already-allocated, currently unlinked entry at the head.
    pub fn add_to_start<C>(&mut self, arena: &mut Slab<Entry<C>>, key: ConnKey) {
        let old_head = self.head;
        {
            let entry = &mut arena[key.0];
            entry.prev = None;
            entry.next = old_head;
        }
        match old_head {
            Some(h) => arena[h.0].prev = Some(key),
            None => self.tail = Some(key),
        }
        self.head = Some(key);
        self.len += 1;
    }

    /// Links an already-allocated, currently unlinked entry at the tail.
    pub fn add_to_end<C>(&mut self, arena: &mut Slab<Entry<C>>, key: ConnKey) {
        let old_tail = self.tail;
        {
            let entry = &mut arena[key.0];
            entry.prev = old_tail;
            entry.next = None;
        }
        match old_tail {
            Some(t) => arena[t.0].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        self.len += 1;
    }

    /// Unlinks `key` from this list without freeing its arena slot.
    pub fn unlink<C>(&mut self, arena: &mut Slab<Entry<C>>, key: ConnKey) {
        let (prev, next) = {
            let entry = &mut arena[key.0];
            (entry.prev.take(), entry.next.take())
        };
        match prev {
            Some(p) => arena[p.0].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena[n.0].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Unlinks `key` and frees its arena slot, returning the connection.
    pub fn remove<C>(&mut self, arena: &mut Slab<Entry<C>>, key: ConnKey) -> C {
        self.unlink(arena, key);
        arena.remove(key.0).conn
    }

    /// Relinks `key` at the tail. Used after servicing a connection so that it
    /// goes to the back of the round-robin queue.
    pub fn move_to_end<C>(&mut self, arena: &mut Slab<Entry<C>>, key: ConnKey) {
        if self.tail == Some(key) {
            return;
        }
        self.unlink(arena, key);
        self.add_to_end(arena, key);
    }

    /// Linear scan for the entry whose connection matches `pred`. Only used
    /// for external deregistration by identity.
    pub fn find_by<C>(
        &self,
        arena: &Slab<Entry<C>>,
        mut pred: impl FnMut(&C) -> bool,
    ) -> Option<ConnKey> {
        let mut cur = self.head;
        while let Some(key) = cur {
            if pred(&arena[key.0].conn) {
                return Some(key);
            }
            cur = arena[key.0].next;
        }
        None
    }

    /// Removes the first entry matching `pred`, if any.
    pub fn remove_by<C>(
        &mut self,
        arena: &mut Slab<Entry<C>>,
        pred: impl FnMut(&C) -> bool,
    ) -> Option<C> {
        let key = self.find_by(arena, pred)?;
        Some(self.remove(arena, key))
    }
}

impl Default for ConnectionList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_forward(list: &ConnectionList, arena: &Slab<Entry<u32>>) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = list.head();
        while let Some(key) = cur {
            out.push(arena[key.0].conn);
            cur = list.next(arena, key);
        }
        out
    }

    fn collect_backward(list: &ConnectionList, arena: &Slab<Entry<u32>>) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = list.tail;
        while let Some(key) = cur {
            out.push(arena[key.0].conn);
            cur = arena[key.0].prev;
        }
        out
    }

    #[test]
    fn append_and_walk_both_directions() {
        let mut arena = Slab::new();
        let mut list = ConnectionList::new();
        for v in [1u32, 2, 3, 4] {
            list.add(&mut arena, v);
        }
        assert_eq!(list.len(), 4);
        assert_eq!(collect_forward(&list, &arena), vec![1, 2, 3, 4]);
        assert_eq!(collect_backward(&list, &arena), vec![4, 3, 2, 1]);
    }

    #[test]
    fn walk_visits_exactly_len_entries_after_mutations() {
        let mut arena = Slab::new();
        let mut list = ConnectionList::new();
        let a = list.add(&mut arena, 1u32);
        let b = list.add(&mut arena, 2);
        let c = list.add(&mut arena, 3);
        list.move_to_end(&mut arena, a);
        list.remove(&mut arena, b);
        list.move_to_end(&mut arena, c);
        assert_eq!(list.len(), 2);
        let fwd = collect_forward(&list, &arena);
        assert_eq!(fwd.len(), list.len());
        let mut back = collect_backward(&list, &arena);
        back.reverse();
        assert_eq!(fwd, back);
        assert_eq!(fwd, vec![1, 3]);
    }

    #[test]
    fn move_to_end_rotates() {
        let mut arena = Slab::new();
        let mut list = ConnectionList::new();
        let a = list.add(&mut arena, 1u32);
        list.add(&mut arena, 2);
        list.add(&mut arena, 3);
        list.move_to_end(&mut arena, a);
        assert_eq!(collect_forward(&list, &arena), vec![2, 3, 1]);
        // moving the tail is a no-op
        list.move_to_end(&mut arena, a);
        assert_eq!(collect_forward(&list, &arena), vec![2, 3, 1]);
    }

    #[test]
    fn entries_migrate_between_lists_without_reallocation() {
        let mut arena = Slab::new();
        let mut active = ConnectionList::new();
        let mut idle = ConnectionList::new();
        let a = active.add(&mut arena, 10u32);
        let b = active.add(&mut arena, 20);
        active.unlink(&mut arena, a);
        idle.add_to_end(&mut arena, a);
        assert_eq!(active.len(), 1);
        assert_eq!(idle.len(), 1);
        idle.unlink(&mut arena, a);
        active.add_to_start(&mut arena, a);
        assert_eq!(collect_forward(&active, &arena), vec![10, 20]);
        assert_eq!(idle.len(), 0);
        // slot identity survived the round trip
        assert_eq!(active.next(&arena, a), Some(b));
    }

    #[test]
    fn remove_by_identity_scans() {
        let mut arena = Slab::new();
        let mut list = ConnectionList::new();
        list.add(&mut arena, 5u32);
        list.add(&mut arena, 6);
        list.add(&mut arena, 7);
        assert_eq!(list.remove_by(&mut arena, |c| *c == 6), Some(6));
        assert_eq!(list.remove_by(&mut arena, |c| *c == 99), None);
        assert_eq!(collect_forward(&list, &arena), vec![5, 7]);
    }

    #[test]
    fn empty_list_invariants() {
        let mut arena: Slab<Entry<u32>> = Slab::new();
        let mut list = ConnectionList::new();
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
        let k = list.add(&mut arena, 1);
        list.remove(&mut arena, k);
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
        assert_eq!(list.tail, None);
    }
}
