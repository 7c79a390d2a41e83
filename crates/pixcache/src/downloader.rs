use std::sync::Arc;

use reqwest::Client;
use rustls::{ClientConfig, crypto::aws_lc_rs};
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::debug;

use crate::TransferConfig;
use crate::error::TransferError;

/// Create a reqwest Client with the provided configuration.
///
/// The read timeout is enforced per chunk by [`crate::transfer::ResumableTransfer`],
/// so the client itself only carries the connect timeout.
pub fn create_client(config: &TransferConfig) -> Result<Client, TransferError> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransferError::Tls(e.to_string()))?
        .with_platform_verifier()
        .map_err(|e| TransferError::Tls(e.to_string()))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.use_system_proxy {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled for transfers");
    }

    client_builder.build().map_err(TransferError::from)
}

/// Plain client for talking to local mock servers in tests
#[cfg(test)]
pub(crate) fn test_client() -> Client {
    let tls_config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    Client::builder()
        .use_preconfigured_tls(tls_config)
        .no_proxy()
        .build()
        .unwrap()
}
