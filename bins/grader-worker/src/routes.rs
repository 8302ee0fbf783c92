// Route definitions for the grader HTTP surface

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::engine::ContainerRuntime;
use crate::{handlers, AppState};

/// Headroom over the raw archive limit for base64 inflation and hidden tests
const BODY_OVERHEAD: usize = 1024 * 1024;

pub fn body_limit(max_archive_bytes: usize) -> usize {
    max_archive_bytes
        .saturating_mul(4)
        .saturating_div(3)
        .saturating_add(BODY_OVERHEAD)
}

pub fn routes<R: ContainerRuntime>(max_archive_bytes: usize) -> Router<Arc<AppState<R>>> {
    Router::new()
        .route("/submissions", post(handlers::submit::<R>))
        .route("/submissions/:id", get(handlers::get_submission::<R>))
        .route("/submissions/:id/stream", get(handlers::stream_submission::<R>))
        .route("/internal/grade", post(handlers::grade_sync::<R>))
        .layer(DefaultBodyLimit::max(body_limit(max_archive_bytes)))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_limit_covers_base64() {
        let limit = body_limit(3 * 1024 * 1024);
        assert!(limit >= 4 * 1024 * 1024);
        assert!(body_limit(usize::MAX) > usize::MAX / 3);
    }
}
