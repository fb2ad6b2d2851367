//! Read-only currency queries: exchange rates and mint metadata.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use warp::http::StatusCode;

use crate::data::currency::MintMetadata;
use crate::data::StoreError;

use super::{ApiResponse, TransactionServer};

#[derive(Debug, Clone, Deserialize)]
pub struct GetRatesQuery {
    /// Unix timestamp to read historical rates at; latest when absent
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRatesResponse {
    pub rates: HashMap<String, f64>,
    /// Unix timestamp the returned rates were observed at
    pub as_of: u64,
}

pub async fn get_all_rates_handler(
    query: GetRatesQuery,
    server: Arc<TransactionServer>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let at = query
        .timestamp
        .map(|seconds| UNIX_EPOCH + Duration::from_secs(seconds));

    let (status, response) = match server.data.currencies.get_rates(at) {
        Ok(record) => {
            let as_of = record
                .time
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            (
                StatusCode::OK,
                ApiResponse::ok(GetRatesResponse {
                    rates: record.rates,
                    as_of,
                }),
            )
        }
        Err(StoreError::NotFound) => (StatusCode::NOT_FOUND, ApiResponse::err("no rates available")),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiResponse::err(err.to_string()),
        ),
    };

    Ok(warp::reply::with_status(warp::reply::json(&response), status))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMintsRequest {
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMintsResponse {
    pub mints: Vec<MintMetadata>,
}

pub async fn get_mints_handler(
    request: GetMintsRequest,
    server: Arc<TransactionServer>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let (status, response) = match server.data.currencies.get_mints(&request.addresses) {
        Ok(mints) => (StatusCode::OK, ApiResponse::ok(GetMintsResponse { mints })),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiResponse::err(err.to_string()),
        ),
    };

    Ok(warp::reply::with_status(warp::reply::json(&response), status))
}
