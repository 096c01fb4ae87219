// Login sessions and user management.

use axum::extract::{Path, State};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::audit::{self, EventRefs};
use crate::auth::{create_access_token, hash_password, verify_password};
use crate::constants::ACCESS_TOKEN_COOKIE;
use crate::db::schema::{self, User};
use crate::error::{OtError, Result};

use super::{Admin, ApiState, CurrentUser};

fn user_json(user: &User) -> Value {
    json!({
        "id": user.id,
        "username": user.username,
        "display_name": user.display_name,
        "role": user.role,
    })
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Login with username and password; the session token lands in an HTTP-only
/// cookie.
pub async fn login(
    State(state): State<ApiState>,
    jar: CookieJar,
    Json(body): Json<LoginRequest>,
) -> Result<(CookieJar, Json<Value>)> {
    let username = body.username.clone();
    let user = state
        .db
        .call(move |conn| schema::get_user_by_username(conn, &username))
        .await?;

    let user = match user {
        Some(u) if verify_password(&body.password, &u.password_hash) => u,
        _ => {
            return Err(OtError::Unauthenticated);
        }
    };
    if !user.is_active {
        return Err(OtError::Unauthenticated);
    }

    // Token expiry bounds the session; the cookie itself needs no max-age
    let token = create_access_token(&user.username, &state.settings.jwt_secret_key)?;
    let cookie = Cookie::build((ACCESS_TOKEN_COOKIE, token))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .build();

    let user_id = user.id.clone();
    state
        .db
        .call(move |conn| schema::touch_user_last_login(conn, &user_id))
        .await?;

    Ok((
        jar.add(cookie),
        Json(json!({ "status": "success", "user": user_json(&user) })),
    ))
}

/// Clear the auth cookie.
pub async fn logout(jar: CookieJar) -> (CookieJar, Json<Value>) {
    let cookie = Cookie::build((ACCESS_TOKEN_COOKIE, "")).path("/").build();
    (jar.remove(cookie), Json(json!({ "status": "success" })))
}

/// The currently authenticated user.
pub async fn get_me(CurrentUser(user): CurrentUser) -> Json<Value> {
    Json(user_json(&user))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "staff".to_string()
}

/// Admin creates a new user.
pub async fn create_user(
    Admin(admin): Admin,
    State(state): State<ApiState>,
    Json(body): Json<CreateUserRequest>,
) -> Result<Json<Value>> {
    if body.role != "admin" && body.role != "staff" {
        return Err(OtError::Validation(
            "Role must be 'admin' or 'staff'".to_string(),
        ));
    }

    let password_hash = hash_password(&body.password)?;
    let admin_id = admin.id.clone();
    let user = state
        .db
        .call(move |conn| {
            if schema::get_user_by_username(conn, &body.username)?.is_some() {
                return Err(OtError::Conflict("Username already exists".to_string()));
            }
            let display_name = body.display_name.clone().unwrap_or_else(|| body.username.clone());
            let user = schema::insert_user(conn, &body.username, &password_hash, &display_name, &body.role)?;
            audit::log_event(
                conn,
                "user_created",
                json!({ "username": user.username, "role": user.role }),
                EventRefs {
                    user_id: Some(&admin_id),
                    ..Default::default()
                },
            )?;
            Ok(user)
        })
        .await?;

    Ok(Json(json!({ "status": "success", "user": user_json(&user) })))
}

/// Admin lists all users.
pub async fn list_users(
    Admin(_admin): Admin,
    State(state): State<ApiState>,
) -> Result<Json<Value>> {
    let users = state.db.call(|conn| schema::list_users(conn)).await?;
    Ok(Json(json!({
        "users": users
            .iter()
            .map(|u| {
                json!({
                    "id": u.id,
                    "username": u.username,
                    "display_name": u.display_name,
                    "role": u.role,
                    "is_active": u.is_active,
                    "created_at": u.created_at,
                    "last_login_at": u.last_login_at,
                })
            })
            .collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

/// Admin updates a user's role, display name, or active flag.
pub async fn update_user(
    Admin(admin): Admin,
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(body): Json<UpdateUserRequest>,
) -> Result<Json<Value>> {
    if let Some(ref role) = body.role {
        if role != "admin" && role != "staff" {
            return Err(OtError::Validation(
                "Role must be 'admin' or 'staff'".to_string(),
            ));
        }
    }

    let admin_id = admin.id.clone();
    let user = state
        .db
        .call(move |conn| {
            let user = schema::get_user(conn, &user_id)?
                .ok_or_else(|| OtError::NotFound("User not found".to_string()))?;

            schema::update_user_fields(
                conn,
                &user_id,
                body.display_name.as_deref(),
                body.role.as_deref(),
                body.is_active,
            )?;

            let mut changes = serde_json::Map::new();
            if let Some(ref v) = body.display_name {
                changes.insert("display_name".into(), json!(v));
            }
            if let Some(ref v) = body.role {
                changes.insert("role".into(), json!(v));
            }
            if let Some(v) = body.is_active {
                changes.insert("is_active".into(), json!(v));
            }
            audit::log_event(
                conn,
                "user_updated",
                json!({ "target_user": user.username, "changes": changes }),
                EventRefs {
                    user_id: Some(&admin_id),
                    ..Default::default()
                },
            )?;

            Ok(schema::get_user(conn, &user_id)?.expect("row still present"))
        })
        .await?;

    Ok(Json(json!({
        "status": "success",
        "user": {
            "id": user.id,
            "username": user.username,
            "display_name": user.display_name,
            "role": user.role,
            "is_active": user.is_active,
        },
    })))
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub password: String,
}

/// Admin resets a user's password.
pub async fn reset_user_password(
    Admin(admin): Admin,
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(body): Json<ResetPasswordRequest>,
) -> Result<Json<Value>> {
    let password_hash = hash_password(&body.password)?;
    let admin_id = admin.id.clone();
    let username = state
        .db
        .call(move |conn| {
            let user = schema::get_user(conn, &user_id)?
                .ok_or_else(|| OtError::NotFound("User not found".to_string()))?;
            schema::set_user_password(conn, &user_id, &password_hash)?;
            audit::log_event(
                conn,
                "password_reset",
                json!({ "target_user": user.username }),
                EventRefs {
                    user_id: Some(&admin_id),
                    ..Default::default()
                },
            )?;
            Ok(user.username)
        })
        .await?;

    Ok(Json(json!({
        "status": "success",
        "message": format!("Password reset for {}", username),
    })))
}
