use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::{auth::extractors::AuthUser, state::AppState};

use super::dto::{CreatePostRequest, Pagination, PostListItem, UpdatePostRequest};
use super::repo::Post;

pub fn read_routes() -> Router<AppState> {
    Router::new()
        .route("/post", get(list_posts))
        .route("/post/:id", get(get_post))
}

pub fn write_routes() -> Router<AppState> {
    Router::new()
        .route("/post", post(create_post))
        .route("/post/:id", put(update_post).delete(delete_post))
}

#[instrument(skip(state))]
async fn list_posts(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(p): Query<Pagination>,
) -> Result<Json<Vec<PostListItem>>, (StatusCode, String)> {
    let posts = Post::list_by_user(&state.db, user_id, p.limit, p.offset)
        .await
        .map_err(internal)?;
    let items = posts
        .into_iter()
        .map(|p| PostListItem {
            id: p.id,
            title: p.title,
            created_at: p.created_at,
        })
        .collect();
    Ok(Json(items))
}

#[instrument(skip(state))]
async fn get_post(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Post>, (StatusCode, String)> {
    match Post::find(&state.db, user_id, id).await.map_err(internal)? {
        Some(post) => Ok(Json(post)),
        None => Err((StatusCode::NOT_FOUND, "Post not found".into())),
    }
}

#[instrument(skip(state, payload))]
async fn create_post(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<CreatePostRequest>,
) -> Result<(StatusCode, HeaderMap, Json<Post>), (StatusCode, String)> {
    if payload.title.trim().is_empty() {
        warn!("post with empty title");
        return Err((StatusCode::BAD_REQUEST, "title is required".into()));
    }

    let post = Post::create(&state.db, user_id, payload.title.trim(), &payload.content)
        .await
        .map_err(internal)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::LOCATION,
        format!("/api/post/{}", post.id).parse().expect("valid header"),
    );

    Ok((StatusCode::CREATED, headers, Json(post)))
}

#[instrument(skip(state, payload))]
async fn update_post(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdatePostRequest>,
) -> Result<Json<Post>, (StatusCode, String)> {
    if payload.title.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "title is required".into()));
    }

    match Post::update(&state.db, user_id, id, payload.title.trim(), &payload.content)
        .await
        .map_err(internal)?
    {
        Some(post) => Ok(Json(post)),
        None => Err((StatusCode::NOT_FOUND, "Post not found".into())),
    }
}

#[instrument(skip(state))]
async fn delete_post(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let removed = Post::delete(&state.db, user_id, id).await.map_err(internal)?;
    if !removed {
        return Err((StatusCode::NOT_FOUND, "Post not found".into()));
    }
    Ok(StatusCode::NO_CONTENT)
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    error!(error = %e, "post handler failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
