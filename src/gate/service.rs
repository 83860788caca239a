//! Request admission: token lookup, decoding, path and expiry checks, and
//! rate limiting.

use chrono::Utc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use super::request::GateRequest;
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::ratelimit::{AdmissionLimiter, Scheduler, TokioScheduler};
use crate::token::{Principal, TokenCodec};

/// Why a request was turned away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("no token found on request")]
    MissingToken,
    #[error("unable to decode token")]
    InvalidToken,
    #[error("token has expired")]
    Expired,
    #[error("principal {id} has not been granted access to {path}")]
    PathForbidden { id: String, path: String },
    #[error("rate limit exceeded for {id}")]
    RateLimited { id: String, wait_ms: u64 },
    #[error("request was dropped before admission")]
    Unavailable,
}

impl Rejection {
    /// HTTP status code for this rejection.
    pub fn status_code(&self) -> u16 {
        match self {
            Rejection::MissingToken | Rejection::Expired => 401,
            Rejection::InvalidToken | Rejection::PathForbidden { .. } => 403,
            Rejection::RateLimited { .. } => 429,
            Rejection::Unavailable => 503,
        }
    }
}

/// Authenticates requests with sealed tokens and admits them through the
/// per-principal limiter.
pub struct Gate<S: Scheduler = TokioScheduler> {
    param: String,
    codec: TokenCodec,
    limiter: AdmissionLimiter<S>,
}

impl Gate<TokioScheduler> {
    /// Create a gate whose limiter runs on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails with [`GuardError::Config`] on invalid configuration or when
    /// called outside a runtime.
    pub fn new(config: &GuardConfig) -> Result<Self> {
        config.validate()?;
        let limiter = AdmissionLimiter::new(config.limiter.clone())?;
        Self::with_limiter(config, limiter)
    }
}

impl<S: Scheduler> Gate<S> {
    /// Create a gate around an existing limiter.
    pub fn with_limiter(config: &GuardConfig, limiter: AdmissionLimiter<S>) -> Result<Self> {
        let codec = TokenCodec::from_config(&config.auth)?;
        Ok(Self {
            param: config.auth.param.clone(),
            codec,
            limiter,
        })
    }

    /// Issue a token for `principal`.
    pub fn issue(&self, principal: &Principal) -> Result<String> {
        self.codec.encode(principal)
    }

    /// The token codec.
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// The admission limiter.
    pub fn limiter(&self) -> &AdmissionLimiter<S> {
        &self.limiter
    }

    /// Record `count` requests of `principal` served elsewhere.
    pub fn notify(&self, principal: &Principal, count: usize) -> Result<()> {
        self.limiter.notify(principal, count)
    }

    /// Update the node-count multiplier.
    pub fn set_nodes(&self, nodes: u32) -> Result<()> {
        self.limiter.set_nodes(nodes)
    }

    /// Resolve the request's principal without consuming rate capacity.
    pub fn authenticate(&self, request: &GateRequest) -> std::result::Result<Principal, Rejection> {
        let token = match request.token(&self.param) {
            Some(token) if !token.trim().is_empty() => token,
            _ => {
                debug!(path = %request.path, "No token found on request");
                return Err(Rejection::MissingToken);
            }
        };

        let principal = self.codec.decode(token).map_err(|_| {
            debug!(path = %request.path, "Unable to decode token on request");
            Rejection::InvalidToken
        })?;

        if principal.is_expired_at(Utc::now().timestamp_millis()) {
            debug!(id = %principal.id, "Token has expired");
            return Err(Rejection::Expired);
        }

        if !principal.allows_path(&request.path) {
            debug!(
                id = %principal.id,
                path = %request.path,
                "Principal has not been granted access to this endpoint"
            );
            return Err(Rejection::PathForbidden {
                id: principal.id,
                path: request.path.clone(),
            });
        }

        Ok(principal)
    }

    /// Authenticate the request and wait for the limiter to release it.
    ///
    /// Resolves with the principal once the request may proceed.
    #[instrument(skip(self, request), fields(path = %request.path))]
    pub async fn admit(&self, request: &GateRequest) -> std::result::Result<Principal, Rejection> {
        let principal = self.authenticate(request)?;

        let (released, on_release) = oneshot::channel();
        match self.limiter.check(&principal, move || {
            let _ = released.send(());
        }) {
            Ok(()) => {}
            Err(GuardError::AdmissionRejected { id, wait_ms, .. }) => {
                return Err(Rejection::RateLimited { id, wait_ms });
            }
            Err(e) => {
                debug!(id = %principal.id, error = %e, "Token carries an unusable rate");
                return Err(Rejection::InvalidToken);
            }
        }

        on_release.await.map_err(|_| Rejection::Unavailable)?;
        debug!(id = %principal.id, "Request admitted");
        Ok(principal)
    }
}
