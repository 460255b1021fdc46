//! reqwest-backed [`Transport`].

use std::error::Error as StdError;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE as CONTENT_TYPE_HEADER, HOST};
use reqwest::{Client, ClientBuilder, Response};
use tracing::{debug, info, warn};
use url::Url;

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::pake::Psk;
use crate::transport::fingerprint::Fingerprint;
use crate::transport::profile::{ConnectionProfile, Protocol, UrlPolicy};
use crate::transport::{tls, Transport, CONTENT_TYPE};
use crate::MAX_ENVELOPE_SIZE;

/// HTTP transport built from a validated [`ConnectionProfile`].
pub struct HttpTransport {
    client: Client,
    urls: Vec<Url>,
    cursor: AtomicUsize,
    profile: ConnectionProfile,
    fingerprint: Option<Fingerprint>,
    secret: RwLock<Option<Psk>>,
}

impl HttpTransport {
    /// Validate `profile` and construct the connection stack.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for any invalid or incompatible setting. Nothing is
    /// sent on the network.
    pub fn build(profile: ConnectionProfile) -> Result<Self> {
        let fingerprint = profile.validate()?;
        let urls = profile.parsed_urls()?;

        let mut builder = Client::builder()
            .user_agent(profile.user_agent.clone())
            .timeout(profile.timeout)
            .connect_timeout(profile.timeout);

        if let Some(host) = &profile.host {
            let mut headers = HeaderMap::new();
            let value = HeaderValue::from_str(host)
                .map_err(|e| Error::config(format!("invalid Host override: {e}")))?;
            headers.insert(HOST, value);
            builder = builder.default_headers(headers);
        }

        // Environment proxies are ignored: only the profile decides
        builder = match profile.parsed_proxy()? {
            Some(proxy) => builder.proxy(
                reqwest::Proxy::all(proxy.as_str())
                    .map_err(|e| Error::config(format!("invalid proxy: {e}")))?,
            ),
            None => builder.no_proxy(),
        };

        builder = configure_protocol(builder, &profile, fingerprint.as_ref())?;

        let client = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", chain(&e))))?;

        info!(
            protocol = %profile.protocol,
            urls = urls.len(),
            fingerprint = ?fingerprint,
            proxy = profile.proxy.is_some(),
            "transport ready"
        );

        Ok(Self {
            client,
            urls,
            cursor: AtomicUsize::new(0),
            profile,
            fingerprint,
            secret: RwLock::new(None),
        })
    }

    /// The profile this transport was built from.
    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    /// The resolved fingerprint, if one is configured.
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    /// URL the next request will use (without advancing).
    pub fn current_url(&self) -> &Url {
        &self.urls[self.cursor.load(Ordering::Relaxed) % self.urls.len()]
    }

    fn next_url(&self) -> &Url {
        let index = match self.profile.url_policy {
            UrlPolicy::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed),
            UrlPolicy::Failover => self.cursor.load(Ordering::Relaxed),
        };
        &self.urls[index % self.urls.len()]
    }

    fn on_failure(&self) {
        if self.profile.url_policy == UrlPolicy::Failover && self.urls.len() > 1 {
            self.cursor.fetch_add(1, Ordering::Relaxed);
            debug!(next = %self.current_url(), "failing over");
        }
    }

    /// Read a response body, refusing anything past [`MAX_ENVELOPE_SIZE`].
    ///
    /// Chunked and HTTP/2 bodies carry no length up front, so the limit is
    /// enforced while streaming.
    async fn read_body(&self, mut response: Response) -> Result<Bytes> {
        let too_large = |len: u64| {
            Error::InvalidMessage(format!("response of {len} bytes exceeds limit"))
        };

        let declared = response.content_length();
        if let Some(len) = declared {
            if len > MAX_ENVELOPE_SIZE as u64 {
                return Err(too_large(len));
            }
        }

        let mut body = BytesMut::with_capacity(declared.unwrap_or(0) as usize);
        loop {
            let chunk = response.chunk().await.map_err(|e| {
                self.on_failure();
                self.map_error(e)
            })?;
            let Some(chunk) = chunk else { break };
            if body.len() + chunk.len() > MAX_ENVELOPE_SIZE {
                return Err(too_large((body.len() + chunk.len()) as u64));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    fn map_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(self.profile.timeout.as_millis() as u64)
        } else {
            Error::transport(chain(&err))
        }
    }
}

fn configure_protocol(
    builder: ClientBuilder,
    profile: &ConnectionProfile,
    fingerprint: Option<&Fingerprint>,
) -> Result<ClientBuilder> {
    let shaped = |protocol| tls::client_config(protocol, fingerprint, profile.tls_verification);

    Ok(match profile.protocol {
        Protocol::Http => builder.http1_only(),
        Protocol::H2c => builder.http2_prior_knowledge(),
        Protocol::Https => builder
            .http1_only()
            .use_preconfigured_tls(shaped(Protocol::Https)?),
        Protocol::H2 => builder
            .http2_prior_knowledge()
            .use_preconfigured_tls(shaped(Protocol::H2)?),
        Protocol::Http3 => http3(builder, shaped(Protocol::Http3)?)?,
    })
}

#[cfg(all(feature = "http3", reqwest_unstable))]
fn http3(builder: ClientBuilder, tls: rustls::ClientConfig) -> Result<ClientBuilder> {
    Ok(builder.http3_prior_knowledge().use_preconfigured_tls(tls))
}

#[cfg(not(all(feature = "http3", reqwest_unstable)))]
fn http3(_builder: ClientBuilder, _tls: rustls::ClientConfig) -> Result<ClientBuilder> {
    Err(Error::config(
        "http3 support is not compiled in (enable the `http3` feature)",
    ))
}

/// Render an error with its source chain.
fn chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, envelope: &Envelope) -> Result<Envelope> {
        let url = self.next_url().clone();
        debug!(%url, kind = ?envelope.message_type, bytes = envelope.wire_size(), "sending envelope");

        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE_HEADER, CONTENT_TYPE)
            .body(envelope.encode())
            .send()
            .await
            .map_err(|e| {
                self.on_failure();
                self.map_error(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(%url, status = status.as_u16(), "server rejected request");
            self.on_failure();
            return Err(Error::Rejected(status.as_u16()));
        }

        let body = self.read_body(response).await?;
        Envelope::decode(body)
    }

    fn set_secret(&self, secret: Psk) {
        *self.secret.write() = Some(secret);
    }

    fn secret(&self) -> Option<Psk> {
        self.secret.read().clone()
    }

    fn rotate(&self) {
        if self.urls.len() > 1 {
            self.cursor.fetch_add(1, Ordering::Relaxed);
            info!(next = %self.current_url(), "rotating endpoint");
        }
    }
}
