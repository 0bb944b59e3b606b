use crate::{errors::AppError, models::statistic::DailyStatistic, state::AppState};
use axum::{
    Json,
    extract::{Path, State},
};
use chrono::NaiveDate;

/// `GET /statistics/{date}`: counters for one UTC day, zeros when the day
/// saw no traffic.
pub async fn daily_statistic(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<DailyStatistic>, AppError> {
    NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| AppError::bad_request(format!("`{date}` is not a YYYY-MM-DD date")))?;
    Ok(Json(state.cache.statistic(&date).await?))
}
