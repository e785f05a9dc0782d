use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page_number: usize,
    pub page_size: usize,
}

impl PageRequest {
    pub fn new(page_number: usize, page_size: usize) -> Self {
        Self {
            page_number,
            page_size: page_size.max(1),
        }
    }

    pub fn offset(&self) -> usize {
        self.page_number.saturating_mul(self.page_size)
    }

    pub fn next(&self) -> Self {
        Self::new(self.page_number.saturating_add(1), self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageResult<T> {
    pub page_number: usize,
    pub page_size: usize,
    pub result_list: Vec<T>,
}

impl<T> PageResult<T> {
    pub fn new(request: PageRequest, result_list: Vec<T>) -> Self {
        Self {
            page_number: request.page_number,
            page_size: request.page_size,
            result_list,
        }
    }

    /// A short page means there is nothing past it.
    pub fn is_last(&self) -> bool {
        self.result_list.len() < self.page_size
    }
}
