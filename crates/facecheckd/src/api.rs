//! HTTP surface: event administration, face registration and identification.
//!
//! Domain outcomes that are not failures ("no face", "no match") are
//! answered with 200 and `match: false`; caller mistakes map to 4xx and
//! infrastructure failures to 5xx.

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use facecheck_core::{
    EngineError, ExtractError, FaceService, IdentifyOutcome, MissReason, RegistryError,
    ServiceError, Tolerance,
};
use serde::Deserialize;
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub struct AppState {
    pub service: FaceService,
    /// Used when an identify request carries no `tolerance` field.
    pub default_tolerance: Tolerance,
}

pub fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .route("/health", get(health))
        .route("/admin/events", get(list_events).post(create_event))
        .route("/admin/events/:id", delete(delete_event))
        .route("/admin/faces", get(list_faces))
        .route("/register", post(register))
        .route("/identify", post(identify))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal error".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Registry(RegistryError::UnknownGroup(_)) => Self {
                status: StatusCode::NOT_FOUND,
                message: "Unknown event".into(),
            },
            ServiceError::Registry(RegistryError::DuplicateGroup(_)) => {
                Self::bad_request("Event already exists")
            }
            ServiceError::Registry(RegistryError::EmptyGroupName) => {
                Self::bad_request("Event name required")
            }
            ServiceError::Engine(EngineError::Timeout(_)) => Self {
                status: StatusCode::GATEWAY_TIMEOUT,
                message: "Face extraction timed out".into(),
            },
            ServiceError::Engine(EngineError::Extract(ExtractError::InvalidImage(_))) => {
                Self::bad_request("Invalid image file")
            }
            ServiceError::NoFaceDetected => Self::bad_request("No face detected"),
            ServiceError::EmptyDisplayName => Self::bad_request("Name, event and image required"),
            ServiceError::MultipleFaces(err) => Self::bad_request(err.to_string()),
            other => {
                tracing::error!(error = %other, "request failed");
                Self::internal()
            }
        }
    }
}

type ApiResult = Result<Response, ApiError>;

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "dimension": state.service.registry().dimension(),
        "tolerance": state.default_tolerance.get(),
        "face_policy": format!("{:?}", state.service.policy()),
    }))
}

async fn list_events(State(state): State<Arc<AppState>>) -> ApiResult {
    let groups = state.service.list_groups().await?;
    let body: Vec<_> = groups
        .into_iter()
        .map(|g| json!({ "id": g.id, "name": g.name }))
        .collect();
    Ok(Json(body).into_response())
}

#[derive(Deserialize)]
struct CreateEvent {
    name: Option<String>,
}

async fn create_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateEvent>,
) -> ApiResult {
    let name = req.name.unwrap_or_default();
    let group = state.service.create_group(&name).await?;
    Ok(Json(json!({ "message": "Event created", "id": group.id, "name": group.name })).into_response())
}

async fn delete_event(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    let removed = state.service.delete_group(id).await?;
    tracing::info!(event_id = id, faces = removed, "event deleted via API");
    Ok(Json(json!({ "message": "Event deleted" })).into_response())
}

async fn list_faces(State(state): State<Arc<AppState>>) -> ApiResult {
    let entries = state.service.list_entries().await?;
    let body: Vec<_> = entries
        .into_iter()
        .map(|e| {
            json!({
                "id": e.id,
                "name": e.display_name,
                "event_id": e.group_id,
                "event_name": e.group_name,
                "image_path": e.image_reference.unwrap_or_default(),
            })
        })
        .collect();
    Ok(Json(body).into_response())
}

/// Text fields and the uploaded image of a multipart form.
#[derive(Default)]
struct UploadForm {
    name: Option<String>,
    event_id: Option<String>,
    tolerance: Option<String>,
    image: Option<Vec<u8>>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?
        {
            let key = field.name().unwrap_or_default().to_string();
            if key == "image" {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                if !bytes.is_empty() {
                    form.image = Some(bytes.to_vec());
                }
                continue;
            }

            let text = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(e.body_text()))?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            match key.as_str() {
                "name" => form.name = Some(text.to_string()),
                "event_id" => form.event_id = Some(text.to_string()),
                "tolerance" => form.tolerance = Some(text.to_string()),
                _ => {}
            }
        }
        Ok(form)
    }
}

/// The upload must carry a recognizable image header before it reaches the
/// extractor. Only the header is read; full decoding happens once, there.
fn validate_image(image: &[u8]) -> Result<(), ApiError> {
    let invalid = || ApiError::bad_request("Invalid image file");
    let (width, height) = image::ImageReader::new(Cursor::new(image))
        .with_guessed_format()
        .map_err(|_| invalid())?
        .into_dimensions()
        .map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok(())
}

async fn register(State(state): State<Arc<AppState>>, multipart: Multipart) -> ApiResult {
    let form = UploadForm::read(multipart).await?;
    let (Some(name), Some(event_id), Some(image)) = (form.name, form.event_id, form.image) else {
        return Err(ApiError::bad_request("Name, event and image required"));
    };
    let event_id: i64 = event_id
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid event"))?;

    let group = state
        .service
        .registry()
        .get_group(event_id)
        .await
        .map_err(ServiceError::from)?
        .ok_or_else(|| ApiError::bad_request("Invalid event"))?;

    validate_image(&image)?;

    let entry = match state.service.register(group.id, &name, image).await {
        Ok(entry) => entry,
        // Deleted between the lookup and the insert.
        Err(ServiceError::Registry(RegistryError::UnknownGroup(_))) => {
            return Err(ApiError::bad_request("Invalid event"));
        }
        Err(err) => return Err(err.into()),
    };

    Ok(Json(json!({
        "id": entry.id,
        "name": entry.display_name,
        "event_name": group.name,
    }))
    .into_response())
}

fn no_match(message: &str) -> Response {
    Json(json!({ "match": false, "message": message })).into_response()
}

async fn identify(State(state): State<Arc<AppState>>, multipart: Multipart) -> ApiResult {
    let form = UploadForm::read(multipart).await?;
    let (Some(image), Some(event_id)) = (form.image, form.event_id) else {
        return Err(ApiError::bad_request("Image and event required"));
    };
    let event_id: i64 = event_id
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid event"))?;

    let tolerance = match form.tolerance {
        Some(raw) => {
            let value: f32 = raw
                .parse()
                .map_err(|_| ApiError::bad_request(format!("invalid tolerance: {raw}")))?;
            Tolerance::new(value).map_err(|e| ApiError::bad_request(e.to_string()))?
        }
        None => state.default_tolerance,
    };

    validate_image(&image)?;

    let outcome = state
        .service
        .identify_from_image(event_id, image, tolerance)
        .await?;

    let response = match outcome {
        IdentifyOutcome::NoFaceDetected => no_match("No face detected"),
        IdentifyOutcome::UnknownGroup => no_match("Unknown event"),
        IdentifyOutcome::NotRecognized(MissReason::NothingRegistered) => {
            no_match("No registered faces in this event")
        }
        IdentifyOutcome::NotRecognized(MissReason::NoMatch) => no_match("No match"),
        IdentifyOutcome::Recognized { entry, distance } => {
            let event_name = state
                .service
                .registry()
                .get_group(entry.group_id)
                .await
                .map_err(ServiceError::from)?
                .map(|g| g.name)
                .unwrap_or_default();
            Json(json!({
                "match": true,
                "user": {
                    "id": entry.id,
                    "name": entry.display_name,
                    "event_name": event_name,
                },
                "distance": distance,
            }))
            .into_response()
        }
    };
    Ok(response)
}
