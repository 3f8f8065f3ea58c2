//! Accident History Routes

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use storage::{ClassifiedRecord, RecordQuery, Severity};

use crate::{ApiError, SharedState};

/// Query parameters for the history endpoint
#[derive(Debug, Deserialize)]
pub struct AccidentQuery {
    /// Maximum number of records
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Filter by severity (`HIGH`, `LOW`)
    pub severity: Option<Severity>,
    /// Filter by source id
    pub source: Option<String>,
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Serialize)]
pub struct AccidentMeta {
    pub count: usize,
    pub limit: usize,
    pub total: usize,
}

/// Response for the history endpoint
#[derive(Debug, Serialize)]
pub struct AccidentResponse {
    pub data: Vec<ClassifiedRecord>,
    pub meta: AccidentMeta,
}

/// Classified records, newest first
pub async fn get_accidents(
    State(state): State<SharedState>,
    Query(params): Query<AccidentQuery>,
) -> Result<Json<AccidentResponse>, ApiError> {
    let limit = params.limit.min(1000);
    let query = RecordQuery {
        limit,
        severity: params.severity,
        source_id: params.source.filter(|s| !s.is_empty()),
    };

    let log = state.router.log();
    let data = log.recent(&query).await?;
    let total = log.count().await?;

    Ok(Json(AccidentResponse {
        meta: AccidentMeta {
            count: data.len(),
            limit,
            total,
        },
        data,
    }))
}
