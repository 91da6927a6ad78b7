use super::error::{err, fail};
use super::handlers;
use super::types::{AppState, Request};
use crate::auth;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    if let Err(e) = auth::authorize(&req.method, state.session.as_ref()) {
        tracing::warn!(method = %req.method, code = e.code(), "request denied");
        return fail(&req.id, e);
    }

    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::admin::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::hod::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::staff::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
