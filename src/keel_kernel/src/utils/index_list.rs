//! Intrusive doubly-linked lists over pool indices.
//!
//! Control blocks live in fixed pools and carry their link words inline, so
//! a block can sit on several lists at once (a task is on a state list via
//! one link and on an event wait list via another). A list is manipulated
//! through a [`ListAccessor`], which couples the list head with a borrow of
//! the pool and a projection selecting which embedded link to use.
//!
//! A `None` link word means "not on the list this link belongs to"; every
//! operation asserts the expected linkage.

use super::Init;

/// Index of an element within its pool.
pub(crate) trait PoolIndex: Copy + PartialEq {
    fn as_index(self) -> usize;
}

/// Link word embedded in a pooled element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Link<I> {
    pub prev: Option<I>,
    pub next: Option<I>,
}

/// Head of an intrusive list.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ListHead<I> {
    pub first: Option<I>,
    pub last: Option<I>,
}

impl<I> Init for ListHead<I> {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

impl<I: Copy> ListHead<I> {
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn front(&self) -> Option<I> {
        self.first
    }
}

/// Couples a list head, the element pool, and a link projection.
pub(crate) struct ListAccessor<'a, I, T, F> {
    head: &'a mut ListHead<I>,
    pool: &'a mut [T],
    map_link: F,
}

impl<'a, I, T, F> ListAccessor<'a, I, T, F>
where
    I: PoolIndex,
    F: for<'b> FnMut(&'b mut T) -> &'b mut Option<Link<I>>,
{
    pub fn new(head: &'a mut ListHead<I>, pool: &'a mut [T], map_link: F) -> Self {
        Self {
            head,
            pool,
            map_link,
        }
    }

    fn link(&mut self, i: I) -> &mut Option<Link<I>> {
        (self.map_link)(&mut self.pool[i.as_index()])
    }

    /// Access the element behind `i` (for e.g. priority comparisons while
    /// walking the list).
    pub fn node(&mut self, i: I) -> &mut T {
        &mut self.pool[i.as_index()]
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    pub fn front(&self) -> Option<I> {
        self.head.first
    }

    pub fn next(&mut self, i: I) -> Option<I> {
        self.link(i).expect("element not linked").next
    }

    /// Append `i` at the tail.
    pub fn push_back(&mut self, i: I) {
        debug_assert!(self.link(i).is_none(), "element already linked");
        let old_last = self.head.last;
        *self.link(i) = Some(Link {
            prev: old_last,
            next: None,
        });
        match old_last {
            Some(l) => self.link(l).as_mut().unwrap().next = Some(i),
            None => self.head.first = Some(i),
        }
        self.head.last = Some(i);
    }

    /// Insert `i` immediately before `at`.
    pub fn insert_before(&mut self, i: I, at: I) {
        debug_assert!(self.link(i).is_none(), "element already linked");
        let at_link = self.link(at).expect("insertion point not linked");
        *self.link(i) = Some(Link {
            prev: at_link.prev,
            next: Some(at),
        });
        match at_link.prev {
            Some(p) => self.link(p).as_mut().unwrap().next = Some(i),
            None => self.head.first = Some(i),
        }
        self.link(at).as_mut().unwrap().prev = Some(i);
    }

    /// Unlink `i` from the list.
    pub fn remove(&mut self, i: I) {
        let l = self.link(i).take().expect("element not linked");
        match l.prev {
            Some(p) => self.link(p).as_mut().unwrap().next = l.next,
            None => self.head.first = l.next,
        }
        match l.next {
            Some(n) => self.link(n).as_mut().unwrap().prev = l.prev,
            None => self.head.last = l.prev,
        }
    }

    pub fn pop_front(&mut self) -> Option<I> {
        let i = self.head.first?;
        self.remove(i);
        Some(i)
    }

    /// Move an already-linked `i` to the tail (round-robin rotation).
    pub fn move_to_back(&mut self, i: I) {
        self.remove(i);
        self.push_back(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    impl PoolIndex for usize {
        fn as_index(self) -> usize {
            self
        }
    }

    #[derive(Clone, Copy)]
    struct Node {
        link: Option<Link<usize>>,
    }

    const POOL_LEN: usize = 16;

    fn pool() -> [Node; POOL_LEN] {
        [Node { link: None }; POOL_LEN]
    }

    fn collect(head: &mut ListHead<usize>, pool: &mut [Node]) -> Vec<usize> {
        let mut acc = ListAccessor::new(head, pool, |n: &mut Node| &mut n.link);
        let mut out = Vec::new();
        let mut cur = acc.front();
        while let Some(i) = cur {
            out.push(i);
            cur = acc.next(i);
        }
        out
    }

    #[quickcheck]
    fn matches_vecdeque_model(ops: Vec<(u8, u8)>) {
        let mut head = ListHead::INIT;
        let mut pool = pool();
        let mut model: VecDeque<usize> = VecDeque::new();

        for (op, arg) in ops {
            let i = arg as usize % POOL_LEN;
            let linked = model.contains(&i);
            let mut acc = ListAccessor::new(&mut head, &mut pool, |n: &mut Node| &mut n.link);
            match op % 5 {
                0 if !linked => {
                    acc.push_back(i);
                    model.push_back(i);
                }
                1 if linked => {
                    acc.remove(i);
                    model.retain(|&x| x != i);
                }
                2 => {
                    assert_eq!(acc.pop_front(), model.pop_front());
                }
                3 if linked => {
                    acc.move_to_back(i);
                    model.retain(|&x| x != i);
                    model.push_back(i);
                }
                4 if !linked && !model.is_empty() => {
                    let at = model[arg as usize % model.len()];
                    acc.insert_before(i, at);
                    let pos = model.iter().position(|&x| x == at).unwrap();
                    model.insert(pos, i);
                }
                _ => {}
            }
            drop(acc);
            assert_eq!(collect(&mut head, &mut pool), Vec::from(model.clone()));
        }
    }

    #[test]
    fn single_element() {
        let mut head = ListHead::INIT;
        let mut pool = pool();
        let mut acc = ListAccessor::new(&mut head, &mut pool, |n: &mut Node| &mut n.link);
        assert!(acc.is_empty());
        acc.push_back(3);
        assert_eq!(acc.front(), Some(3));
        acc.remove(3);
        assert!(acc.is_empty());
        drop(acc);
        assert!(head.first.is_none() && head.last.is_none());
    }
}
