use base64::Engine;
use reqwest::{header, StatusCode, Url};
use sec::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::PushError,
    image::ImageReference,
    sources::{CredentialProvider, RegistryCredentials},
};

use super::{
    client::RegistryClient,
    www_authenticate::{self, Challenge},
};

/// An authorization for one repository, obtained once per push and fed
/// to every uploader. Not persisted beyond the invocation.
#[derive(Clone, Debug)]
pub struct Authorization {
    scheme: Scheme,
    host: String,
    /// The scope the registry actually granted; an upload refused with
    /// `403` is reported against this.
    scope: String,
}

#[derive(Clone, Debug)]
enum Scheme {
    Anonymous,
    /// Base64-encoded `user:password`.
    Basic(Secret<String>),
    Bearer(Secret<String>),
}

impl Authorization {
    pub(crate) fn anonymous(host: &str, scope: &str) -> Self {
        Self {
            scheme: Scheme::Anonymous,
            host: host.to_owned(),
            scope: scope.to_owned(),
        }
    }

    fn basic(host: &str, scope: &str, credentials: &RegistryCredentials) -> Self {
        let encoded = base64::prelude::BASE64_STANDARD.encode(format!(
            "{}:{}",
            credentials.username,
            credentials.password.as_str()
        ));

        Self {
            scheme: Scheme::Basic(Secret::new(encoded)),
            host: host.to_owned(),
            scope: scope.to_owned(),
        }
    }

    fn bearer(host: &str, scope: &str, token: String) -> Self {
        Self {
            scheme: Scheme::Bearer(Secret::new(token)),
            host: host.to_owned(),
            scope: scope.to_owned(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.scheme, Scheme::Anonymous)
    }

    #[inline(always)]
    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    #[inline(always)]
    pub(crate) fn scope(&self) -> &str {
        &self.scope
    }

    /// Attach the matching `Authorization` header, if any.
    pub(crate) fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.scheme {
            Scheme::Anonymous => request,
            Scheme::Basic(encoded) => request.header(
                header::AUTHORIZATION,
                format!("Basic {}", encoded.as_str()),
            ),
            Scheme::Bearer(token) => request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.as_str()),
            ),
        }
    }
}

/// Token endpoint response per the distribution token auth spec. Some
/// registries (GitLab, older Harbor) use the OAuth2 field name.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    scope: Option<String>,
}

/// Obtain an authorization for `push,pull` on the target repository.
///
/// Probes `GET /v2/` for the auth challenge. No challenge means the
/// registry is anonymous and uploads proceed without credentials.
pub(crate) async fn authenticate(
    client: &RegistryClient,
    target: &ImageReference,
    provider: &dyn CredentialProvider,
) -> Result<Authorization, PushError> {
    let host = target.registry();
    let scope = format!("repository:{}:push,pull", target.repository());

    let probe_url = format!("{}/v2/", client.base_url(host));
    let response = client
        .send_retrying(|| client.http().get(&probe_url))
        .await?;

    let Some(challenge_header) = response.headers().get(header::WWW_AUTHENTICATE) else {
        debug!(%host, "registry advertises no auth challenge");
        return Ok(Authorization::anonymous(host, &scope));
    };

    let challenge = www_authenticate::parse(challenge_header.as_bytes()).ok_or_else(|| {
        PushError::Internal(format!("unparseable WWW-Authenticate challenge from {host}"))
    })?;

    let credentials = provider.lookup(host);

    match challenge {
        Challenge::Basic { .. } => {
            let credentials = credentials.ok_or_else(|| PushError::AuthRequired {
                host: host.to_owned(),
                scope: scope.clone(),
            })?;

            debug!(%host, "using basic credentials");
            Ok(Authorization::basic(host, &scope, &credentials))
        }
        Challenge::Bearer { realm, service, .. } => {
            exchange_token(client, host, &scope, &realm, service.as_deref(), credentials).await
        }
    }
}

/// `GET realm?service=…&scope=repository:<repo>:push,pull`, with basic
/// credentials attached when available. Anonymous exchange is valid;
/// public registries issue tokens without credentials.
async fn exchange_token(
    client: &RegistryClient,
    host: &str,
    scope: &str,
    realm: &str,
    service: Option<&str>,
    credentials: Option<RegistryCredentials>,
) -> Result<Authorization, PushError> {
    let mut token_url = Url::parse(realm)
        .map_err(|err| PushError::Internal(format!("invalid token realm {realm:?}: {err}")))?;

    {
        let mut pairs = token_url.query_pairs_mut();
        if let Some(service) = service {
            pairs.append_pair("service", service);
        }
        pairs.append_pair("scope", scope);
    }

    let response = client
        .send_retrying(|| {
            let mut request = client.http().get(token_url.clone());
            if let Some(credentials) = &credentials {
                request = request.basic_auth(
                    &credentials.username,
                    Some(credentials.password.as_str()),
                );
            }
            request
        })
        .await?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(if credentials.is_some() {
            PushError::AuthInsufficient {
                host: host.to_owned(),
                scope: scope.to_owned(),
            }
        } else {
            PushError::AuthRequired {
                host: host.to_owned(),
                scope: scope.to_owned(),
            }
        });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(PushError::RegistryRefused {
            status: status.as_u16(),
            body,
        });
    }

    let raw = response
        .bytes()
        .await
        .map_err(|err| PushError::Internal(format!("could not read token response: {err}")))?;
    let token: TokenResponse = serde_json::from_slice(&raw)
        .map_err(|err| PushError::Internal(format!("malformed token response: {err}")))?;

    let secret = token
        .token
        .or(token.access_token)
        .ok_or_else(|| PushError::Internal("token response carries no token".to_owned()))?;

    // The registry may grant less than we asked for; remember what it
    // actually said so a later 403 names the effective scope.
    let effective_scope = token.scope.unwrap_or_else(|| scope.to_owned());
    debug!(%host, %effective_scope, "bearer token obtained");

    Ok(Authorization::bearer(host, &effective_scope, secret))
}
