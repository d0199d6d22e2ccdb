// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Images gRPC client over mutual TLS.

use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};

use crate::application::discovery::ClientIdentity;

use super::images_v1::images_client::ImagesClient;

/// TLS settings presenting the client leaf and trusting only the builder CA.
pub fn client_tls_config(identity: &ClientIdentity) -> ClientTlsConfig {
    ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(&identity.ca_pem))
        .identity(Identity::from_pem(&identity.cert_pem, &identity.key_pem))
        .domain_name(identity.domain.clone())
}

/// Connect to the agent at `address` (`host:port`). Without an identity the
/// channel is plaintext.
pub async fn connect(
    address: &str,
    identity: Option<&ClientIdentity>,
) -> Result<ImagesClient<Channel>, tonic::transport::Error> {
    let endpoint = match identity {
        Some(identity) => Endpoint::from_shared(format!("https://{}", address))?
            .tls_config(client_tls_config(identity))?,
        None => Endpoint::from_shared(format!("http://{}", address))?,
    };
    tracing::debug!(address = %address, tls = identity.is_some(), "Connecting to builder");
    let channel = endpoint.connect().await?;
    Ok(ImagesClient::new(channel))
}
