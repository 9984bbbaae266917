//! Node arena
//!
//! Wait-list nodes live in pages of fixed size and are recycled through
//! an intrusive free list. Firing a node never frees memory, and pages
//! are only added, up to a fixed limit.

use gfxhost_core::error::ResourceError;

pub(crate) const NIL: u32 = u32::MAX;

pub(crate) struct Node<A> {
    pub thresh: u32,
    pub next: u32,
    pub action: Option<A>,
}

pub(crate) struct NodeArena<A> {
    pages: Vec<Vec<Node<A>>>,
    per_page: usize,
    max_pages: usize,
    free: u32,
    live: usize,
}

impl<A> NodeArena<A> {
    pub fn new(per_page: usize, max_pages: usize) -> Self {
        Self {
            pages: Vec::new(),
            per_page,
            max_pages,
            free: NIL,
            live: 0,
        }
    }

    fn grow(&mut self) -> Result<(), ResourceError> {
        if self.pages.len() >= self.max_pages {
            return Err(ResourceError::WaitListFull);
        }
        let base = (self.pages.len() * self.per_page) as u32;
        let mut page = Vec::with_capacity(self.per_page);
        for i in 0..self.per_page as u32 {
            let next = if i + 1 == self.per_page as u32 { self.free } else { base + i + 1 };
            page.push(Node { thresh: 0, next, action: None });
        }
        self.pages.push(page);
        self.free = base;
        Ok(())
    }

    pub fn alloc(&mut self, thresh: u32, action: A) -> Result<u32, ResourceError> {
        if self.free == NIL {
            self.grow()?;
        }
        let idx = self.free;
        let node = self.get_mut(idx);
        let next_free = node.next;
        node.thresh = thresh;
        node.next = NIL;
        node.action = Some(action);
        self.free = next_free;
        self.live += 1;
        Ok(idx)
    }

    /// Return a node to the free list, handing back its action.
    pub fn release(&mut self, idx: u32) -> Option<A> {
        let free = self.free;
        let node = self.get_mut(idx);
        let action = node.action.take();
        debug_assert!(action.is_some(), "wait node {} released twice", idx);
        node.next = free;
        self.free = idx;
        self.live -= 1;
        action
    }

    pub fn get(&self, idx: u32) -> &Node<A> {
        let i = idx as usize;
        &self.pages[i / self.per_page][i % self.per_page]
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut Node<A> {
        let i = idx as usize;
        &mut self.pages[i / self.per_page][i % self.per_page]
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn pages(&self) -> usize {
        self.pages.len()
    }
}
