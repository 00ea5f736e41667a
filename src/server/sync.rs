//! Sync endpoints: change feed, batch apply, status, conflicts, devices.

use super::{bearer_user, fail, ok, AppState};
use crate::error::Error;
use crate::protocol::{
    BatchOutcome, BatchRequest, BatchResponse, BatchStatus, ChangesRequest, ChangesResponse,
    ConflictDto, ConflictListResponse, DeviceDto, DeviceListResponse, ResolveRequest,
    ResolveResponse, StatusResponse,
};
use crate::server::store::BatchItemOutcome;
use crate::util::epoch_ms;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use base64::Engine as _;
use serde::Deserialize;
use std::time::Instant;

/// POST /api/sync/changes: records modified after the client's cursor,
/// soft-deleted included, ascending by `last_modified`.
pub async fn handle_changes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChangesRequest>,
) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };

    let limit = if req.limit == 0 {
        state.batch_size
    } else {
        req.limit.min(state.max_batch_size)
    };

    if let Err(e) = state
        .store
        .upsert_device(user_id, &req.device_id, &req.device_name, "client")
    {
        tracing::warn!("device upsert failed: {e}");
    }

    let (records, has_more) =
        match state
            .store
            .modified_since(user_id, req.last_sync_time, limit, req.offset)
        {
            Ok(page) => page,
            Err(e) => return fail(e),
        };

    if let Err(e) = state.store.note_downloads(user_id, records.len() as i64) {
        tracing::warn!("stats update failed: {e}");
    }

    let sync_version = state.store.sync_version(user_id).unwrap_or(0);
    let stats = state.store.sync_stats(user_id).unwrap_or_default();

    tracing::debug!(
        user_id,
        since = req.last_sync_time,
        returned = records.len(),
        has_more,
        "change feed served"
    );

    ok(ChangesResponse {
        records: records.iter().map(|r| r.to_wire()).collect(),
        has_more,
        server_time: epoch_ms(),
        sync_version,
        stats,
    })
}

/// POST /api/sync/batch: apply client uploads. Quota excess fails the
/// whole batch; per-record staleness opens conflicts and counts as failed.
pub async fn handle_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BatchRequest>,
) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    let started = Instant::now();

    if let Err(e) = state
        .store
        .upsert_device(user_id, &req.device_id, &req.device_name, "client")
    {
        tracing::warn!("device upsert failed: {e}");
    }

    let outcomes = match state.store.apply_batch(user_id, req.records, &req.device_id) {
        Ok(outcomes) => outcomes,
        Err(e) => return fail(e),
    };

    let mut results = Vec::with_capacity(outcomes.len());
    let mut errors = Vec::new();
    let mut processed = 0u32;
    let mut failed = 0u32;
    for (temp_id, outcome) in outcomes {
        match outcome {
            BatchItemOutcome::Applied { server_id, version } => {
                processed += 1;
                results.push(BatchOutcome {
                    temp_id,
                    server_id,
                    version,
                    status: BatchStatus::Applied,
                    message: None,
                });
            }
            BatchItemOutcome::Conflict {
                server_id,
                stored_version,
            } => {
                failed += 1;
                let message = format!(
                    "record {server_id}: version mismatch (server holds v{stored_version})"
                );
                errors.push(message.clone());
                results.push(BatchOutcome {
                    temp_id,
                    server_id,
                    version: stored_version,
                    status: BatchStatus::Conflict,
                    message: Some(message),
                });
            }
            BatchItemOutcome::Failed { message } => {
                failed += 1;
                errors.push(format!("record {temp_id}: {message}"));
                results.push(BatchOutcome {
                    temp_id,
                    server_id: 0,
                    version: 0,
                    status: BatchStatus::Failed,
                    message: Some(message),
                });
            }
        }
    }

    let duration_ms = started.elapsed().as_millis() as i64;
    if let Err(e) = state.store.note_sync(
        user_id,
        i64::from(processed),
        0,
        i64::from(failed),
        duration_ms,
    ) {
        tracing::warn!("stats update failed: {e}");
    }

    tracing::info!(user_id, processed, failed, "batch applied");
    ok(BatchResponse {
        processed,
        failed,
        results,
        errors,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub device_id: Option<String>,
}

/// GET /api/sync/status
pub async fn handle_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };

    let last_sync_time = match &query.device_id {
        Some(device_id) => state.store.device_last_sync(user_id, device_id).unwrap_or(0),
        None => state
            .store
            .list_devices(user_id)
            .map(|devices| devices.first().map(|d| d.last_sync_time).unwrap_or(0))
            .unwrap_or(0),
    };

    let records_by_kind = state
        .store
        .record_kind_counts(user_id)
        .unwrap_or_default()
        .into_iter()
        .collect();

    ok(StatusResponse {
        last_sync_time,
        sync_version: state.store.sync_version(user_id).unwrap_or(0),
        records_count: state.store.count_records(user_id).unwrap_or(0),
        open_conflicts: state.store.open_conflict_count(user_id).unwrap_or(0),
        records_by_kind,
        stats: state.store.sync_stats(user_id).unwrap_or_default(),
    })
}

/// GET /api/sync/conflicts: open conflicts only.
pub async fn handle_conflicts(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    match state.store.open_conflicts(user_id) {
        Ok(rows) => ok(ConflictListResponse {
            conflicts: rows
                .into_iter()
                .map(|row| ConflictDto {
                    id: row.id,
                    record_id: row.record_id,
                    device_id: row.device_id,
                    local_data: row.local_data,
                    server_data: row.server_data,
                    conflict_type: row.conflict_type,
                    resolved: row.resolved,
                    resolution: row.resolution,
                    created_at: row.created_at,
                    resolved_at: row.resolved_at,
                })
                .collect(),
        }),
        Err(e) => fail(e),
    }
}

/// POST /api/sync/conflicts/{id}/resolve
pub async fn handle_resolve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conflict_id): Path<i64>,
    Json(req): Json<ResolveRequest>,
) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };

    let (ciphertext, meta) = match req.resolved_data {
        Some(data) => {
            let bytes = match base64::engine::general_purpose::STANDARD.decode(&data.ciphertext) {
                Ok(bytes) => bytes,
                Err(e) => {
                    return fail(Error::Unprocessable(format!(
                        "resolved ciphertext is not base64: {e}"
                    )))
                }
            };
            (Some(bytes), Some(data.meta))
        }
        None => (None, None),
    };

    match state
        .store
        .resolve_conflict(user_id, conflict_id, req.resolution, ciphertext, meta)
    {
        Ok((record_id, version)) => {
            tracing::info!(user_id, conflict_id, record_id, version, "conflict resolved");
            ok(ResolveResponse { record_id, version })
        }
        Err(e) => fail(e),
    }
}

/// GET /api/sync/devices
pub async fn handle_devices(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    match state.store.list_devices(user_id) {
        Ok(devices) => ok(DeviceListResponse {
            devices: devices
                .into_iter()
                .map(|d| DeviceDto {
                    id: d.id,
                    name: d.name,
                    device_type: d.device_type,
                    last_sync_time: d.last_sync_time,
                    created_at: d.created_at,
                })
                .collect(),
        }),
        Err(e) => fail(e),
    }
}

/// DELETE /api/sync/devices/{id}: refuses devices owned by other users.
pub async fn handle_device_remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    match state.store.remove_device(user_id, &device_id) {
        Ok(()) => ok(serde_json::json!({ "removed": device_id })),
        Err(e) => fail(e),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::server::router;
    use crate::server::tests::{call, register_and_login, test_state};
    use axum::http::StatusCode;
    use base64::Engine as _;
    use serde_json::json;

    fn b64(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    fn upload(temp_id: i64, server_id: i64, version: i64, lm: i64, data: &[u8]) -> serde_json::Value {
        json!({
            "server_id": server_id,
            "temp_id": temp_id,
            "kind": "login",
            "ciphertext": b64(data),
            "meta": {"title": "rec"},
            "version": version,
            "last_modified": lm,
            "deleted_at": null,
            "checksum": "",
            "device_id": "dev-1"
        })
    }

    #[tokio::test]
    async fn batch_then_changes_roundtrip() {
        let app = router(test_state(u64::MAX));
        let token = register_and_login(&app, "alice").await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/sync/batch",
            Some(&token),
            Some(json!({
                "records": [upload(7, 0, 1, 1000, b"cipher-a")],
                "device_id": "dev-1",
                "device_name": "Laptop"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processed"], 1);
        assert_eq!(body["failed"], 0);
        let server_id = body["results"][0]["server_id"].as_i64().unwrap();
        assert_eq!(body["results"][0]["temp_id"], 7);
        assert!(server_id > 0);

        // The uploading device sees its record in the change feed
        let (status, body) = call(
            &app,
            "POST",
            "/api/sync/changes",
            Some(&token),
            Some(json!({"last_sync_time": 0, "device_id": "dev-2", "device_name": "Phone"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records"].as_array().unwrap().len(), 1);
        assert_eq!(body["records"][0]["server_id"], server_id);
        assert_eq!(body["records"][0]["ciphertext"], b64(b"cipher-a"));
        assert_eq!(body["has_more"], false);
        assert!(body["server_time"].as_i64().unwrap() > 0);

        // Cursor past the record's timestamp → empty feed
        let since = body["records"][0]["last_modified"].as_i64().unwrap();
        let (_, body) = call(
            &app,
            "POST",
            "/api/sync/changes",
            Some(&token),
            Some(json!({"last_sync_time": since})),
        )
        .await;
        assert_eq!(body["records"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn changes_pagination_sets_has_more() {
        let app = router(test_state(u64::MAX));
        let token = register_and_login(&app, "alice").await;

        let records: Vec<_> = (0..3)
            .map(|i| upload(i, 0, 1, 1000 + i, format!("r{i}").as_bytes()))
            .collect();
        call(
            &app,
            "POST",
            "/api/sync/batch",
            Some(&token),
            Some(json!({"records": records, "device_id": "dev-1", "device_name": "L"})),
        )
        .await;

        let (_, body) = call(
            &app,
            "POST",
            "/api/sync/changes",
            Some(&token),
            Some(json!({"last_sync_time": 0, "limit": 2})),
        )
        .await;
        assert_eq!(body["records"].as_array().unwrap().len(), 2);
        assert_eq!(body["has_more"], true);

        let (_, body) = call(
            &app,
            "POST",
            "/api/sync/changes",
            Some(&token),
            Some(json!({"last_sync_time": 0, "limit": 2, "offset": 2})),
        )
        .await;
        assert_eq!(body["records"].as_array().unwrap().len(), 1);
        assert_eq!(body["has_more"], false);
    }

    #[tokio::test]
    async fn stale_upload_opens_conflict_then_resolve_client() {
        let app = router(test_state(u64::MAX));
        let token = register_and_login(&app, "alice").await;

        // Seed a record at v1, then push v2 from device 1
        let (_, body) = call(
            &app,
            "POST",
            "/api/sync/batch",
            Some(&token),
            Some(json!({"records": [upload(1, 0, 1, 1000, b"base")], "device_id": "d1", "device_name": "A"})),
        )
        .await;
        let server_id = body["results"][0]["server_id"].as_i64().unwrap();
        call(
            &app,
            "POST",
            "/api/sync/batch",
            Some(&token),
            Some(json!({"records": [upload(1, server_id, 2, 2000, b"from-d1")], "device_id": "d1", "device_name": "A"})),
        )
        .await;

        // Device 2 pushes a stale v2 → conflict
        let (status, body) = call(
            &app,
            "POST",
            "/api/sync/batch",
            Some(&token),
            Some(json!({"records": [upload(9, server_id, 2, 3000, b"from-d2")], "device_id": "d2", "device_name": "B"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["results"][0]["status"], "conflict");

        // Conflict is listed
        let (_, body) = call(&app, "GET", "/api/sync/conflicts", Some(&token), None).await;
        let conflicts = body["conflicts"].as_array().unwrap();
        assert_eq!(conflicts.len(), 1);
        let conflict_id = conflicts[0]["id"].as_i64().unwrap();
        assert_eq!(conflicts[0]["conflict_type"], "version_mismatch");
        assert_eq!(conflicts[0]["local_data"]["ciphertext"], b64(b"from-d2"));
        assert_eq!(conflicts[0]["server_data"]["ciphertext"], b64(b"from-d1"));

        // Resolve in favor of the client copy
        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/sync/conflicts/{conflict_id}/resolve"),
            Some(&token),
            Some(json!({"resolution": "client"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 3); // exactly one bump past v2

        let (_, body) = call(
            &app,
            "GET",
            &format!("/api/records/{server_id}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(body["record"]["ciphertext"], b64(b"from-d2"));

        // Conflict set is empty again
        let (_, body) = call(&app, "GET", "/api/sync/conflicts", Some(&token), None).await;
        assert_eq!(body["conflicts"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn resolve_merged_requires_payload() {
        let app = router(test_state(u64::MAX));
        let token = register_and_login(&app, "alice").await;

        let (_, body) = call(
            &app,
            "POST",
            "/api/sync/batch",
            Some(&token),
            Some(json!({"records": [upload(1, 0, 1, 1000, b"base")], "device_id": "d1", "device_name": "A"})),
        )
        .await;
        let server_id = body["results"][0]["server_id"].as_i64().unwrap();
        call(
            &app,
            "POST",
            "/api/sync/batch",
            Some(&token),
            Some(json!({"records": [upload(2, server_id, 1, 2000, b"stale")], "device_id": "d2", "device_name": "B"})),
        )
        .await;
        let (_, body) = call(&app, "GET", "/api/sync/conflicts", Some(&token), None).await;
        let conflict_id = body["conflicts"][0]["id"].as_i64().unwrap();

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/sync/conflicts/{conflict_id}/resolve"),
            Some(&token),
            Some(json!({"resolution": "merged"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/sync/conflicts/{conflict_id}/resolve"),
            Some(&token),
            Some(json!({
                "resolution": "merged",
                "resolved_data": {"ciphertext": b64(b"merged-copy"), "meta": {"title": "m"}}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(
            &app,
            "GET",
            &format!("/api/records/{server_id}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(body["record"]["ciphertext"], b64(b"merged-copy"));
        assert_eq!(body["record"]["meta"]["title"], "m");
    }

    #[tokio::test]
    async fn quota_excess_fails_whole_batch() {
        let app = router(test_state(1024)); // 1 KiB quota
        let token = register_and_login(&app, "alice").await;

        let big = vec![0u8; 2048];
        let (status, body) = call(
            &app,
            "POST",
            "/api/sync/batch",
            Some(&token),
            Some(json!({"records": [upload(1, 0, 1, 1000, &big)], "device_id": "d1", "device_name": "A"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "quota_exceeded");

        // No partial writes
        let (_, body) = call(
            &app,
            "POST",
            "/api/sync/changes",
            Some(&token),
            Some(json!({"last_sync_time": 0})),
        )
        .await;
        assert_eq!(body["records"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn status_reports_counts_and_stats() {
        let app = router(test_state(u64::MAX));
        let token = register_and_login(&app, "alice").await;

        call(
            &app,
            "POST",
            "/api/sync/batch",
            Some(&token),
            Some(json!({"records": [upload(1, 0, 1, 1000, b"one")], "device_id": "d1", "device_name": "Laptop"})),
        )
        .await;

        let (status, body) = call(&app, "GET", "/api/sync/status?device_id=d1", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records_count"], 1);
        assert_eq!(body["records_by_kind"]["login"], 1);
        assert_eq!(body["open_conflicts"], 0);
        assert_eq!(body["sync_version"], 1);
        assert!(body["last_sync_time"].as_i64().unwrap() > 0);
        assert_eq!(body["stats"]["syncs"], 1);
        assert_eq!(body["stats"]["uploads"], 1);
    }

    #[tokio::test]
    async fn devices_list_and_foreign_removal_refused() {
        let app = router(test_state(u64::MAX));
        let alice = register_and_login(&app, "alice").await;
        let mallory = register_and_login(&app, "mallory").await;

        call(
            &app,
            "POST",
            "/api/sync/changes",
            Some(&alice),
            Some(json!({"last_sync_time": 0, "device_id": "dev-a", "device_name": "Laptop"})),
        )
        .await;

        let (_, body) = call(&app, "GET", "/api/sync/devices", Some(&alice), None).await;
        let devices = body["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["id"], "dev-a");
        assert_eq!(devices[0]["name"], "Laptop");

        // Mallory cannot remove Alice's device
        let (status, _) =
            call(&app, "DELETE", "/api/sync/devices/dev-a", Some(&mallory), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            call(&app, "DELETE", "/api/sync/devices/dev-a", Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, "GET", "/api/sync/devices", Some(&alice), None).await;
        assert_eq!(body["devices"].as_array().unwrap().len(), 0);
    }
}
