//! Shared models used across domains

use serde::{Deserialize, Serialize};

/// Standard response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Role carried in the identity token. Token issuance is external; the core
/// only cares whether the caller books services or performs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Customer,
    Provider,
}

/// Pagination query parameters shared by list endpoints
#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub page: Option<i32>,
    pub limit: Option<i32>,
}

impl Pagination {
    /// Clamp to sane bounds and return (limit, offset)
    pub fn limit_offset(&self) -> (i64, i64) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self.limit.unwrap_or(20).clamp(1, 100);
        (limit as i64, ((page - 1) * limit) as i64)
    }
}
