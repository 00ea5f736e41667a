//! Record CRUD and the typed creation endpoints.
//!
//! The generic endpoints treat record payloads as opaque base64; that is
//! the zero-knowledge path the bundled client uses. The typed endpoints
//! accept structured plaintext field sets for convenience; they validate
//! server-side and store the serialized payload as the record body. A
//! zero-knowledge deployment should prefer the generic path.

use super::{bearer_user, device_id_from, fail, ok, AppState};
use crate::error::Error;
use crate::protocol::{
    BinaryCreateRequest, CardCreateRequest, LoginCreateRequest, RecordCreateRequest,
    RecordCreateResponse, RecordGetResponse, RecordListResponse, RecordSummary,
    RecordUpdateRequest, RecordUpdateResponse, TextCreateRequest,
};
use crate::store::record::{Meta, RecordPayload};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use base64::Engine as _;
use serde_json::json;

/// GET /api/records: summaries, no ciphertext.
pub async fn handle_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    match state.store.list_records(user_id) {
        Ok(records) => ok(RecordListResponse {
            records: records
                .iter()
                .map(|r| RecordSummary {
                    id: r.id,
                    kind: r.kind,
                    meta: r.meta.clone(),
                    version: r.version,
                    last_modified: r.last_modified,
                    checksum: r.checksum.clone(),
                })
                .collect(),
        }),
        Err(e) => fail(e),
    }
}

/// POST /api/records: create from an opaque base64 payload.
pub async fn handle_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecordCreateRequest>,
) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    let ciphertext = match base64::engine::general_purpose::STANDARD.decode(&req.data) {
        Ok(bytes) => bytes,
        Err(e) => return fail(Error::Unprocessable(format!("data is not base64: {e}"))),
    };
    let device_id = device_id_from(&headers);
    match state
        .store
        .create_record(user_id, req.kind, ciphertext, req.meta, &device_id)
    {
        Ok(record) => ok(RecordCreateResponse {
            id: record.id,
            version: record.version,
            last_modified: record.last_modified,
        }),
        Err(e) => fail(e),
    }
}

/// GET /api/records/{id}: full record.
pub async fn handle_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    match state.store.find_record(user_id, id) {
        Ok(record) => ok(RecordGetResponse {
            record: record.to_wire(),
        }),
        Err(e) => fail(e),
    }
}

/// PUT /api/records/{id}: conditional update; 409 when stale.
pub async fn handle_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<RecordUpdateRequest>,
) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    let ciphertext = match base64::engine::general_purpose::STANDARD.decode(&req.data) {
        Ok(bytes) => bytes,
        Err(e) => return fail(Error::Unprocessable(format!("data is not base64: {e}"))),
    };
    let device_id = device_id_from(&headers);
    match state.store.update_record(
        user_id,
        id,
        req.kind,
        ciphertext,
        req.meta,
        req.expected_version,
        &device_id,
    ) {
        Ok((version, last_modified)) => ok(RecordUpdateResponse {
            version,
            last_modified,
        }),
        Err(e) => fail(e),
    }
}

/// DELETE /api/records/{id}: soft-delete, idempotent.
pub async fn handle_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    let device_id = device_id_from(&headers);
    match state.store.soft_delete_record(user_id, id, &device_id) {
        Ok(version) => ok(json!({ "id": id, "version": version })),
        Err(e) => fail(e),
    }
}

// ── Typed creation ──────────────────────────────────────────────────

/// POST /api/records/login
pub async fn handle_create_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginCreateRequest>,
) -> Response {
    let payload = RecordPayload::Login {
        username: req.username,
        password: req.password,
        url: req.url,
        notes: req.notes,
    };
    create_typed(state, headers, payload, req.title, Meta::new()).await
}

/// POST /api/records/text
pub async fn handle_create_text(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TextCreateRequest>,
) -> Response {
    let payload = RecordPayload::Text {
        content: req.content,
    };
    create_typed(state, headers, payload, req.title, Meta::new()).await
}

/// POST /api/records/card
pub async fn handle_create_card(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CardCreateRequest>,
) -> Response {
    let payload = RecordPayload::Card {
        number: req.number,
        holder: req.holder,
        expiry: req.expiry,
        cvv: req.cvv,
    };
    create_typed(state, headers, payload, req.title, Meta::new()).await
}

/// POST /api/records/binary
pub async fn handle_create_binary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BinaryCreateRequest>,
) -> Response {
    let data = match base64::engine::general_purpose::STANDARD.decode(&req.data) {
        Ok(bytes) => bytes,
        Err(e) => return fail(Error::Unprocessable(format!("data is not base64: {e}"))),
    };
    let mut extra = Meta::new();
    extra.insert("filename".into(), req.filename.clone());
    let payload = RecordPayload::Binary {
        filename: req.filename,
        data,
    };
    create_typed(state, headers, payload, req.title, extra).await
}

/// Shared tail of the typed endpoints: validate, serialize, store.
async fn create_typed(
    state: AppState,
    headers: HeaderMap,
    payload: RecordPayload,
    title: String,
    mut meta: Meta,
) -> Response {
    let user_id = match bearer_user(&state, &headers) {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    if let Err(e) = payload.validate() {
        return fail(e);
    }
    let body = match payload.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => return fail(e),
    };
    if !title.is_empty() {
        meta.insert("title".into(), title);
    }
    let device_id = device_id_from(&headers);
    match state
        .store
        .create_record(user_id, payload.kind(), body, meta, &device_id)
    {
        Ok(record) => ok(RecordCreateResponse {
            id: record.id,
            version: record.version,
            last_modified: record.last_modified,
        }),
        Err(e) => fail(e),
    }
}

// ── Tests ───────────────────────────────────────────────────────────
