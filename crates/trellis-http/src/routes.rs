use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use trellis::health;
use trellis::services::{attributes, events, items, relations};
use trellis::Store;
use trellis_api::{actor, Attribute, Error, Item, Relation};

pub fn router(store: Store) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/v1/items",
            post(create_item).get(list_items).patch(update_item).put(upsert_item),
        )
        .route("/api/v1/items/batch", post(create_items))
        .route("/api/v1/items/count", get(count_items))
        .route("/api/v1/items/find", get(find_items))
        .route("/api/v1/items/by-name/:name", get(get_item_by_name))
        .route("/api/v1/items/by-type/:kind", get(get_items_by_kind))
        .route("/api/v1/items/:id", get(get_item).delete(delete_item))
        .route("/api/v1/items/:id/version", get(get_item_version))
        .route("/api/v1/items/:id/attributes", get(get_item_attributes))
        .route("/api/v1/items/:id/children", get(get_item_children))
        .route("/api/v1/items/:id/parents", get(get_item_parents))
        .route("/api/v1/items/:id/relations", get(get_item_relations))
        .route(
            "/api/v1/attributes",
            post(create_attribute)
                .get(list_attributes)
                .patch(update_attribute)
                .put(upsert_attribute),
        )
        .route("/api/v1/attributes/batch", post(create_attributes))
        .route("/api/v1/attributes/count", get(count_attributes))
        .route("/api/v1/attributes/find", get(find_attributes))
        .route("/api/v1/attributes/by-type/:kind", get(get_attributes_by_kind))
        .route(
            "/api/v1/attributes/:id",
            get(get_attribute).delete(delete_attribute),
        )
        .route("/api/v1/attributes/:id/value", get(get_attribute_value))
        .route("/api/v1/attributes/:id/version", get(get_attribute_version))
        .route("/api/v1/relations", post(create_relation).get(list_relations))
        .route("/api/v1/relations/count", get(count_relations))
        .route("/api/v1/relations/move", post(move_relation))
        .route(
            "/api/v1/relations/:parent_id/:child_id",
            get(get_relation).delete(delete_relation),
        )
        .route("/api/v1/events", get(list_events))
        .route("/api/v1/events/count", get(count_events))
        .with_state(store)
}

/// Error wrapper translating the shared taxonomy into HTTP statuses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.root() {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidData(_)
            | Error::InvalidField { .. }
            | Error::MissingId
            | Error::InvalidPagination { .. }
            | Error::Uniqueness(_)
            | Error::InvalidEntityType(_)
            | Error::InvalidAction(_)
            | Error::DeserializationFailed(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    #[serde(default)]
    page: i64,
    #[serde(default)]
    page_size: i64,
}

#[derive(Debug, Default, Deserialize)]
struct FindQuery {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    page: i64,
    #[serde(default)]
    page_size: i64,
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    hard: bool,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    count: i64,
    #[serde(default)]
    newest: bool,
}

#[derive(Debug, Deserialize)]
struct MoveRequest {
    parent_id: String,
    child_id: String,
    new_parent_id: String,
}

async fn health_check(State(store): State<Store>) -> Response {
    let report = health::check(&store).await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

// ---------------------------------------------------------------------------
// Items

async fn create_item(State(store): State<Store>, Json(item): Json<Item>) -> ApiResult<StatusCode> {
    items::create(&store, &[item], actor::HTTP_API)?;
    Ok(StatusCode::CREATED)
}

async fn create_items(
    State(store): State<Store>,
    Json(batch): Json<Vec<Item>>,
) -> ApiResult<StatusCode> {
    items::create(&store, &batch, actor::HTTP_API)?;
    Ok(StatusCode::CREATED)
}

async fn list_items(
    State(store): State<Store>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Item>>> {
    Ok(Json(items::get_all(&store, page.page, page.page_size)?))
}

async fn count_items(State(store): State<Store>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "count": items::count(&store)? })))
}

async fn find_items(
    State(store): State<Store>,
    Query(query): Query<FindQuery>,
) -> ApiResult<Json<Vec<Item>>> {
    let found = match (&query.name, &query.kind) {
        (Some(name), _) => items::find_by_name(&store, name, query.page, query.page_size)?,
        (None, Some(kind)) => items::find_by_kind(&store, kind, query.page, query.page_size)?,
        (None, None) => {
            return Err(Error::InvalidData("find requires a name or type filter".into()).into())
        }
    };
    Ok(Json(found))
}

async fn get_item(State(store): State<Store>, Path(id): Path<String>) -> ApiResult<Json<Item>> {
    Ok(Json(items::get_by_id(&store, &id)?))
}

async fn get_item_by_name(
    State(store): State<Store>,
    Path(name): Path<String>,
) -> ApiResult<Json<Item>> {
    Ok(Json(items::get_by_name(&store, &name)?))
}

async fn get_items_by_kind(
    State(store): State<Store>,
    Path(kind): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Item>>> {
    Ok(Json(items::get_by_kind(&store, &kind, page.page, page.page_size)?))
}

async fn get_item_version(
    State(store): State<Store>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "version": items::version_of(&store, &id)? })))
}

async fn get_item_attributes(
    State(store): State<Store>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Attribute>>> {
    Ok(Json(items::attributes_of(&store, &id)?))
}

async fn get_item_children(
    State(store): State<Store>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Item>>> {
    Ok(Json(items::children_of(&store, &id)?))
}

async fn get_item_parents(
    State(store): State<Store>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Item>>> {
    Ok(Json(items::parents_of(&store, &id)?))
}

async fn get_item_relations(
    State(store): State<Store>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Relation>>> {
    Ok(Json(items::relations_of(&store, &id)?))
}

async fn update_item(
    State(store): State<Store>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult<StatusCode> {
    items::update(&store, &patch, actor::HTTP_API)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upsert_item(
    State(store): State<Store>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult<StatusCode> {
    items::upsert(&store, &patch, actor::HTTP_API)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_item(
    State(store): State<Store>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    if query.hard {
        items::hard_delete(&store, &id, actor::HTTP_API)?;
    } else {
        items::delete(&store, &id, actor::HTTP_API)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Attributes

async fn create_attribute(
    State(store): State<Store>,
    Json(attribute): Json<Attribute>,
) -> ApiResult<StatusCode> {
    attributes::create(&store, &[attribute], actor::HTTP_API)?;
    Ok(StatusCode::CREATED)
}

async fn create_attributes(
    State(store): State<Store>,
    Json(batch): Json<Vec<Attribute>>,
) -> ApiResult<StatusCode> {
    attributes::create(&store, &batch, actor::HTTP_API)?;
    Ok(StatusCode::CREATED)
}

async fn list_attributes(
    State(store): State<Store>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Attribute>>> {
    Ok(Json(attributes::get_all(&store, page.page, page.page_size)?))
}

async fn count_attributes(State(store): State<Store>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "count": attributes::count(&store)? })))
}

async fn find_attributes(
    State(store): State<Store>,
    Query(query): Query<FindQuery>,
) -> ApiResult<Json<Vec<Attribute>>> {
    let found = match (&query.name, &query.kind) {
        (Some(name), _) => attributes::find_by_name(&store, name, query.page, query.page_size)?,
        (None, Some(kind)) => attributes::find_by_kind(&store, kind, query.page, query.page_size)?,
        (None, None) => {
            return Err(Error::InvalidData("find requires a name or type filter".into()).into())
        }
    };
    Ok(Json(found))
}

async fn get_attributes_by_kind(
    State(store): State<Store>,
    Path(kind): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Attribute>>> {
    Ok(Json(attributes::get_by_kind(
        &store,
        &kind,
        page.page,
        page.page_size,
    )?))
}

async fn get_attribute(
    State(store): State<Store>,
    Path(id): Path<String>,
) -> ApiResult<Json<Attribute>> {
    Ok(Json(attributes::get_by_id(&store, &id)?))
}

async fn get_attribute_value(
    State(store): State<Store>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let attribute = attributes::get_by_id(&store, &id)?;
    Ok(Json(json!({
        "value": attribute.value,
        "value_type": attribute.value_type,
    })))
}

async fn get_attribute_version(
    State(store): State<Store>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "version": attributes::version_of(&store, &id)? })))
}

async fn update_attribute(
    State(store): State<Store>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult<StatusCode> {
    attributes::update(&store, &patch, actor::HTTP_API)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upsert_attribute(
    State(store): State<Store>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult<StatusCode> {
    attributes::upsert(&store, &patch, actor::HTTP_API)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_attribute(
    State(store): State<Store>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    if query.hard {
        attributes::hard_delete(&store, &id, actor::HTTP_API)?;
    } else {
        attributes::delete(&store, &id, actor::HTTP_API)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Relations

async fn create_relation(
    State(store): State<Store>,
    Json(relation): Json<Relation>,
) -> ApiResult<StatusCode> {
    relations::create(&store, &[relation], actor::HTTP_API)?;
    Ok(StatusCode::CREATED)
}

async fn list_relations(
    State(store): State<Store>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Relation>>> {
    Ok(Json(relations::get_all(&store, page.page, page.page_size)?))
}

async fn count_relations(State(store): State<Store>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "count": relations::count(&store)? })))
}

async fn get_relation(
    State(store): State<Store>,
    Path((parent_id, child_id)): Path<(String, String)>,
) -> ApiResult<Json<Relation>> {
    Ok(Json(relations::get(&store, &parent_id, &child_id)?))
}

async fn delete_relation(
    State(store): State<Store>,
    Path((parent_id, child_id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    if query.hard {
        relations::hard_delete(&store, &parent_id, &child_id, actor::HTTP_API)?;
    } else {
        relations::delete(&store, &parent_id, &child_id, actor::HTTP_API)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn move_relation(
    State(store): State<Store>,
    Json(request): Json<MoveRequest>,
) -> ApiResult<StatusCode> {
    relations::reparent(
        &store,
        &request.parent_id,
        &request.child_id,
        &request.new_parent_id,
        actor::HTTP_API,
    )?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Events

async fn list_events(
    State(store): State<Store>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<trellis_api::Event>>> {
    let count = if query.count <= 0 { 10 } else { query.count };
    let found = if query.newest {
        events::last(&store, count)?
    } else {
        events::first(&store, count)?
    };
    Ok(Json(found))
}

async fn count_events(State(store): State<Store>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "count": events::count(&store)? })))
}
