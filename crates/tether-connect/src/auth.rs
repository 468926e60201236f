//! Credential cache: exchanges username/password for a token on first use.

use crate::errors::ClientError;
use crate::options::{AuthOptions, HostOptions};
use crate::transport::{CallContext, Connector};
use std::sync::Arc;
use tether_proto::{methods, AuthenticateRequest, AuthenticateResponse, Service};
use tokio::sync::Mutex;
use tracing::debug;

/// Retrieves and caches the auth token attached to every call. Clients call
/// [`Authenticator::invalidate`] when they detect the token is no longer
/// valid.
pub struct Authenticator {
    auth: Option<AuthOptions>,
    addresses: Vec<String>,
    connector: Arc<dyn Connector>,
    host_options: HostOptions,
    // tokio mutex: held across the fetch so concurrent callers share one
    // authenticate round instead of racing their own.
    cached: Mutex<Option<String>>,
}

impl Authenticator {
    pub fn new(
        auth: Option<AuthOptions>,
        addresses: Vec<String>,
        connector: Arc<dyn Connector>,
        host_options: HostOptions,
    ) -> Self {
        Self {
            auth,
            addresses,
            connector,
            host_options,
            cached: Mutex::new(None),
        }
    }

    /// Drops the cached token so the next call re-authenticates.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    /// Returns the token to attach to calls, `None` when no credentials are
    /// configured. Tries each host in order until one authenticates.
    pub async fn token(&self) -> Result<Option<String>, ClientError> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(Some(token.clone()));
        }

        let payload = serde_json::to_value(AuthenticateRequest {
            name: auth.username.clone(),
            password: auth.password.clone(),
        })
        .map_err(|e| ClientError::ClientRuntime(format!("failed to encode credentials: {e}")))?;

        let mut last_error: Option<ClientError> = None;
        for address in &self.addresses {
            let client = match self
                .connector
                .connect(address, Service::Auth, &self.host_options)
                .await
            {
                Ok(client) => client,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };

            match client
                .exec(methods::AUTHENTICATE, payload.clone(), &CallContext::default())
                .await
            {
                Ok(value) => {
                    let response: AuthenticateResponse = serde_json::from_value(value).map_err(
                        |e| ClientError::ClientRuntime(format!("malformed auth response: {e}")),
                    )?;
                    debug!(address, "authenticated");
                    *cached = Some(response.token.clone());
                    return Ok(Some(response.token));
                }
                Err(e) => {
                    debug!(address, error = %e, "authentication attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ClientError::ClientRuntime("no hosts available to authenticate against".into())
        }))
    }
}
