use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

use crate::config::Config;
use crate::error::BookingError;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Maximum clock skew between the gateway and this server (5 minutes).
const MAX_SKEW_SECS: u64 = 300;

/// The user on whose behalf the chat gateway is calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    pub privileged: bool,
}

fn mac_for(secret: &str, actor: i64, timestamp: i64) -> Result<HmacSha256, BookingError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BookingError::Configuration("unusable GATEWAY_SECRET".into()))?;
    mac.update(format!("{actor}:{timestamp}").as_bytes());
    Ok(mac)
}

/// Hex signature the gateway attaches for `actor` at `timestamp`.
#[cfg(test)]
pub fn sign(secret: &str, actor: i64, timestamp: i64) -> Result<String, BookingError> {
    Ok(hex::encode(mac_for(secret, actor, timestamp)?.finalize().into_bytes()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, BookingError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .ok_or(BookingError::Unauthorized)
}

/// Validate the gateway headers against `config` at unix time `now`.
pub fn verify_headers(headers: &HeaderMap, config: &Config, now: i64) -> Result<Actor, BookingError> {
    let actor: i64 = header_str(headers, ACTOR_HEADER)?
        .parse()
        .map_err(|_| BookingError::Unauthorized)?;
    let timestamp: i64 = header_str(headers, TIMESTAMP_HEADER)?
        .parse()
        .map_err(|_| BookingError::Unauthorized)?;

    let skew = now.abs_diff(timestamp);
    if skew > MAX_SKEW_SECS {
        tracing::warn!("Gateway request for actor {} rejected: timestamp skew {}s", actor, skew);
        return Err(BookingError::Unauthorized);
    }

    let signature = hex::decode(header_str(headers, SIGNATURE_HEADER)?)
        .map_err(|_| BookingError::Unauthorized)?;
    if mac_for(&config.gateway_secret, actor, timestamp)?
        .verify_slice(&signature)
        .is_err()
    {
        tracing::warn!("Gateway signature mismatch for actor {}", actor);
        return Err(BookingError::Unauthorized);
    }

    Ok(Actor {
        user_id: actor,
        privileged: config.is_coach(actor),
    })
}

/// Axum middleware that authenticates the gateway on every request.
/// Stores the `Actor` in request extensions.
pub async fn require_gateway(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, BookingError> {
    let actor = verify_headers(req.headers(), &state.config, chrono::Utc::now().timestamp())?;
    req.extensions_mut().insert(actor);
    Ok(next.run(req).await)
}

/// Coach-only commands.
pub fn require_coach(actor: &Actor) -> Result<(), BookingError> {
    if actor.privileged {
        Ok(())
    } else {
        Err(BookingError::Forbidden)
    }
}
