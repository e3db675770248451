//! Infinite query pagination state (§4.5 "Infinite queries").

use qcache_common::PathParam;
use serde_json::Value;
use std::collections::BTreeMap;

/// `{ pages: T[], nextPageParams? }`, plus an in-flight flag for
/// `isFetchingMore`.
#[derive(Clone, Debug, Default)]
pub struct InfiniteState {
    pub pages: Vec<Value>,
    pub next_page_params: Option<BTreeMap<String, PathParam>>,
    pub is_fetching_more: bool,
}

impl InfiniteState {
    /// The pages concatenated into one ordered value, the shape exposed to
    /// a consumer reading this query's result.
    pub fn combined(&self) -> Value {
        Value::Array(self.pages.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_concatenates_pages_in_order() {
        let state = InfiniteState {
            pages: vec![serde_json::json!([1, 2]), serde_json::json!([3, 4])],
            next_page_params: None,
            is_fetching_more: false,
        };
        assert_eq!(state.combined(), serde_json::json!([[1, 2], [3, 4]]));
    }
}
