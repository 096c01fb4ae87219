// Address-lookup proxy for location autocomplete in the review UI.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{OtError, Result};

use super::{ApiState, Staff};

#[derive(Debug, Deserialize)]
pub struct GeocodeQuery {
    pub q: String,
}

/// Proxy address lookup to OpenStreetMap Nominatim.
pub async fn geocode_search(
    Staff(_user): Staff,
    State(state): State<ApiState>,
    Query(query): Query<GeocodeQuery>,
) -> Result<Json<Value>> {
    let q = query.q.trim();
    if q.len() < 3 {
        return Ok(Json(json!({ "results": [] })));
    }

    let mut params = vec![
        ("q".to_string(), q.to_string()),
        ("format".to_string(), "jsonv2".to_string()),
        ("addressdetails".to_string(), "1".to_string()),
        ("limit".to_string(), "6".to_string()),
    ];
    if let Some(ref codes) = state.settings.geocode_country_codes {
        params.push(("countrycodes".to_string(), codes.clone()));
    }

    let response = state
        .webhook_client
        .get("https://nominatim.openstreetmap.org/search")
        .query(&params)
        .header("User-Agent", "OpenTestimony/1.0")
        .header("Accept-Language", "en")
        .send()
        .await
        .map_err(|e| OtError::Internal(format!("geocode lookup failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(OtError::Internal(format!(
            "geocode lookup returned {}",
            response.status()
        )));
    }

    let data: Vec<Value> = response
        .json()
        .await
        .map_err(|e| OtError::Internal(format!("geocode response unreadable: {}", e)))?;

    let results: Vec<Value> = data
        .iter()
        .filter_map(|item| {
            let display_name = item.get("display_name")?.as_str()?;
            let lat: f64 = item.get("lat")?.as_str()?.parse().ok()?;
            let lon: f64 = item.get("lon")?.as_str()?.parse().ok()?;
            Some(json!({
                "display_name": display_name,
                "lat": lat,
                "lon": lon,
                "type": item.get("type").and_then(Value::as_str).unwrap_or(""),
                "importance": item.get("importance").and_then(Value::as_f64).unwrap_or(0.0),
            }))
        })
        .collect();

    Ok(Json(json!({ "results": results })))
}
