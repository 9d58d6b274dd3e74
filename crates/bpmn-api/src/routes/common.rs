//! DTOs shared across route modules (§6 "List/get operations").

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub total: usize,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>, total: usize) -> Self {
        Self { data, total }
    }
}

/// `page`+`limit` takes priority over a bare `limit` when both are present
/// (resolved Open Question, see DESIGN.md).
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl PageQuery {
    /// Returns `(skip, take)` into a fully materialized result set, capped at
    /// `max_limit`.
    pub fn window(&self, default_limit: u32, max_limit: u32) -> (usize, usize) {
        let limit = self.limit.unwrap_or(default_limit).min(max_limit).max(1);
        match self.page {
            Some(page) => ((page.saturating_sub(1) as usize) * limit as usize, limit as usize),
            None => (0, limit as usize),
        }
    }
}

pub fn paginate<T>(mut items: Vec<T>, query: &PageQuery, default_limit: u32, max_limit: u32) -> ListResponse<T> {
    let total = items.len();
    let (skip, take) = query.window(default_limit, max_limit);
    if skip >= items.len() {
        return ListResponse::new(Vec::new(), total);
    }
    let end = (skip + take).min(items.len());
    items.truncate(end);
    let data = items.split_off(skip);
    ListResponse::new(data, total)
}
