//! Intrusive circular doubly linked list whose elements live in an arena
//! (a slice) and are addressed by their indices.
use core::fmt;

/// Circular linked list header.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct ListHead {
    pub first: Option<usize>,
}

impl fmt::Debug for ListHead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl ListHead {
    pub const fn new() -> Self {
        Self { first: None }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link {
    pub prev: usize,
    pub next: usize,
}

/// An error type indicating inconsistency in a linked list structure.
#[derive(Debug, Clone, Copy)]
pub struct InconsistentError;

#[derive(Debug, Clone, Copy)]
pub enum InsertError {
    AlreadyLinked,
    Inconsistent(InconsistentError),
}

impl From<InconsistentError> for InsertError {
    #[inline(always)]
    fn from(x: InconsistentError) -> Self {
        Self::Inconsistent(x)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ItemError {
    NotLinked,
    Inconsistent(InconsistentError),
}

impl From<InconsistentError> for ItemError {
    #[inline(always)]
    fn from(x: InconsistentError) -> Self {
        Self::Inconsistent(x)
    }
}

/// Unwraps the result of a list operation whose failure would mean the
/// kernel's bookkeeping has been corrupted.
pub trait ExpectConsistent<T> {
    fn consistent(self) -> T;
}

impl<T, E: fmt::Debug> ExpectConsistent<T> for Result<T, E> {
    #[inline]
    #[track_caller]
    fn consistent(self) -> T {
        match self {
            Ok(x) => x,
            Err(e) => panic!("linked list is inconsistent: {:?}", e),
        }
    }
}

/// Accessor to a linked list. `map_link` projects an element of `pool` to
/// the link field that this list uses.
pub struct ListAccessor<'a, Element, MapLink> {
    head: &'a mut ListHead,
    pool: &'a mut [Element],
    map_link: MapLink,
}

impl<'a, Element, MapLink> ListAccessor<'a, Element, MapLink>
where
    MapLink: Fn(&mut Element) -> &mut Option<Link>,
{
    pub fn new(head: &'a mut ListHead, pool: &'a mut [Element], map_link: MapLink) -> Self {
        ListAccessor {
            head,
            pool,
            map_link,
        }
    }

    #[inline]
    fn link(&mut self, i: usize) -> &mut Option<Link> {
        (self.map_link)(&mut self.pool[i])
    }

    pub fn pool(&mut self) -> &mut [Element] {
        &mut *self.pool
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    #[inline]
    pub fn front(&self) -> Option<usize> {
        self.head.first
    }

    #[inline]
    pub fn back(&mut self) -> Result<Option<usize>, InconsistentError> {
        match self.head.first {
            Some(p) => Ok(Some(self.link(p).ok_or(InconsistentError)?.prev)),
            None => Ok(None),
        }
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or to the
    /// the list's back (if `at` is `None`).
    pub fn insert(&mut self, item: usize, at: Option<usize>) -> Result<(), InsertError> {
        if self.link(item).is_some() {
            return Err(InsertError::AlreadyLinked);
        }

        if let Some(first) = self.head.first {
            let (next, update_first) = match at {
                Some(at) => (at, at == first),
                None => (first, false),
            };

            let prev = self.link(next).ok_or(InconsistentError)?.prev;
            self.link(prev).as_mut().ok_or(InconsistentError)?.next = item;
            self.link(next).as_mut().ok_or(InconsistentError)?.prev = item;
            *self.link(item) = Some(Link { prev, next });

            if update_first {
                self.head.first = Some(item);
            }
        } else {
            debug_assert!(at.is_none());

            *self.link(item) = Some(Link {
                prev: item,
                next: item,
            });
            self.head.first = Some(item);
        }

        Ok(())
    }

    #[inline]
    pub fn push_back(&mut self, item: usize) -> Result<(), InsertError> {
        self.insert(item, None)
    }

    #[cfg(test)]
    #[inline]
    pub fn push_front(&mut self, item: usize) -> Result<(), InsertError> {
        let at = self.front();
        self.insert(item, at)
    }

    /// Remove `item` from the list. Returns `item`.
    pub fn remove(&mut self, item: usize) -> Result<usize, ItemError> {
        let link = self.link(item).ok_or(ItemError::NotLinked)?;

        if self.head.first == Some(item) {
            if link.next == item {
                // The list just became empty
                self.head.first = None;
                *self.link(item) = None;
                return Ok(item);
            }

            // Move the head pointer
            self.head.first = Some(link.next);
        }

        self.link(link.prev).as_mut().ok_or(InconsistentError)?.next = link.next;
        self.link(link.next).as_mut().ok_or(InconsistentError)?.prev = link.prev;
        *self.link(item) = None;

        Ok(item)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Result<Option<usize>, InconsistentError> {
        match self.front() {
            // `ItemError::NotLinked` would be unexpected here, so convert
            // it to `InconsistentError`
            Some(item) => self.remove(item).map(Some).map_err(|_| InconsistentError),
            None => Ok(None),
        }
    }

    /// Get the next element of the specified element.
    #[inline]
    pub fn next(&mut self, i: usize) -> Result<Option<usize>, ItemError> {
        let next = self.link(i).ok_or(ItemError::NotLinked)?.next;
        Ok(if Some(next) == self.head.first {
            None
        } else {
            Some(next)
        })
    }

    /// Get the previous element of the specified element.
    #[inline]
    pub fn prev(&mut self, i: usize) -> Result<Option<usize>, ItemError> {
        let prev = self.link(i).ok_or(ItemError::NotLinked)?.prev;
        Ok(if Some(i) == self.head.first {
            None
        } else {
            Some(prev)
        })
    }
}
