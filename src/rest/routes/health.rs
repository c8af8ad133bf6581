use axum::extract::State;
use std::sync::Arc;

use crate::AppContext;

pub async fn health(State(_ctx): State<Arc<AppContext>>) -> &'static str {
    "OK"
}
