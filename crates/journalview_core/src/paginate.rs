use serde::Serialize;

pub const DEFAULT_PAGE_SIZE: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    /// Clamp against a known total and return `(page, total_pages, offset)`.
    pub fn resolve(&self, total: usize) -> (usize, usize, usize) {
        let page_size = self.page_size.max(1);
        let total_pages = total.div_ceil(page_size);
        let page = self.page.clamp(1, total_pages.max(1));
        (page, total_pages, (page - 1) * page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSlice<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub total_pages: usize,
    pub offset: usize,
}

impl<T> PageSlice<T> {
    pub fn empty(request: PageRequest) -> Self {
        Self {
            items: Vec::new(),
            page: 1,
            page_size: request.page_size.max(1),
            total: 0,
            total_pages: 0,
            offset: 0,
        }
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    pub fn has_next(&self) -> bool {
        self.offset + self.items.len() < self.total
    }

    pub fn map<U, F>(self, f: F) -> PageSlice<U>
    where
        F: FnMut(T) -> U,
    {
        PageSlice {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            page_size: self.page_size,
            total: self.total,
            total_pages: self.total_pages,
            offset: self.offset,
        }
    }
}

pub fn paginate<T: Clone>(subset: &[T], request: PageRequest) -> PageSlice<T> {
    let total = subset.len();
    let (page, total_pages, offset) = request.resolve(total);
    let page_size = request.page_size.max(1);
    let end = offset.saturating_add(page_size).min(total);
    let items = if offset < total {
        subset[offset..end].to_vec()
    } else {
        Vec::new()
    };
    PageSlice {
        items,
        page,
        page_size,
        total,
        total_pages,
        offset,
    }
}
