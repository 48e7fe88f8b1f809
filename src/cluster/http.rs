//! Kubernetes REST implementation of [`OrchestratorClient`].
//!
//! Plain JSON calls over `reqwest`; pod watches stream the chunked
//! `?watch=true` response line by line; pod exec speaks the
//! `v4.channel.k8s.io` WebSocket subprotocol over `tokio-tungstenite`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tracing::{debug, warn};
use url::Url;

use super::types::{
    ConfigMap, ExecOutput, Namespace, NetworkPolicy, ObjectMeta, Pod, PodEvent, RoleBinding,
    Secret, ServiceAccount,
};
use super::{ClusterError, ClusterResult, OrchestratorClient};

const EXEC_SUBPROTOCOL: &str = "v4.channel.k8s.io";

const STDOUT_CHANNEL: u8 = 1;
const STDERR_CHANNEL: u8 = 2;
const ERROR_CHANNEL: u8 = 3;

/// Connection settings for the cluster API server.
#[derive(Debug, Clone)]
pub struct ClusterAuth {
    pub api_url: Url,
    pub token: String,
    pub ca_bundle: Option<PathBuf>,
    pub insecure_skip_tls_verify: bool,
}

impl ClusterAuth {
    /// Builds auth from the in-cluster service account mount, the standard
    /// environment for pods running inside the cluster.
    pub fn in_cluster() -> ClusterResult<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ClusterError::Unauthorized("KUBERNETES_SERVICE_HOST not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let token =
            std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/token")
                .map_err(|e| {
                    ClusterError::Unauthorized(format!("unable to read service account token: {e}"))
                })?;
        let api_url = Url::parse(&format!("https://{host}:{port}"))
            .map_err(|e| ClusterError::Transient(format!("invalid api server url: {e}")))?;
        Ok(Self {
            api_url,
            token: token.trim().to_string(),
            ca_bundle: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
            )),
            insecure_skip_tls_verify: false,
        })
    }
}

/// [`OrchestratorClient`] backed by the Kubernetes API server.
pub struct KubeClient {
    http: reqwest::Client,
    auth: ClusterAuth,
    tls: Arc<rustls::ClientConfig>,
}

impl KubeClient {
    pub fn new(auth: ClusterAuth) -> ClusterResult<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if auth.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca) = &auth.ca_bundle {
            let pem = std::fs::read(ca).map_err(|e| {
                ClusterError::Unauthorized(format!("unable to read ca bundle {}: {e}", ca.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ClusterError::Unauthorized(format!("invalid ca bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| ClusterError::Transient(format!("unable to build http client: {e}")))?;
        let tls = Arc::new(build_tls_config(&auth)?);
        Ok(Self { http, auth, tls })
    }

    fn url(&self, path: &str) -> ClusterResult<Url> {
        self.auth
            .api_url
            .join(path)
            .map_err(|e| ClusterError::Transient(format!("invalid api path {path}: {e}")))
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.auth.token)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ClusterResult<T> {
        let resp = self
            .authorized(self.http.get(self.url(path)?))
            .send()
            .await
            .map_err(transport_error)?;
        Self::read_json(resp).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ClusterResult<T> {
        let resp = self
            .authorized(self.http.post(self.url(path)?))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        Self::read_json(resp).await
    }

    async fn put_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ClusterResult<T> {
        let resp = self
            .authorized(self.http.put(self.url(path)?))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        Self::read_json(resp).await
    }

    async fn delete(&self, path: &str) -> ClusterResult<()> {
        let resp = self
            .authorized(self.http.delete(self.url(path)?))
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }

    async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> ClusterResult<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }
        resp.json()
            .await
            .map_err(|e| ClusterError::Transient(format!("invalid api response: {e}")))
    }
}

fn transport_error(e: reqwest::Error) -> ClusterError {
    ClusterError::Transient(format!("cluster api request failed: {e}"))
}

fn classify(status: StatusCode, body: &str) -> ClusterError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status {
        StatusCode::NOT_FOUND => ClusterError::NotFound(detail),
        StatusCode::CONFLICT => ClusterError::Conflict(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClusterError::Unauthorized(detail),
        _ => ClusterError::Transient(detail),
    }
}

fn build_tls_config(auth: &ClusterAuth) -> ClusterResult<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(ca) = &auth.ca_bundle {
        use rustls_pki_types::pem::PemObject;
        for cert in rustls_pki_types::CertificateDer::pem_file_iter(ca)
            .map_err(|e| ClusterError::Unauthorized(format!("invalid ca bundle: {e}")))?
        {
            let cert = cert
                .map_err(|e| ClusterError::Unauthorized(format!("invalid ca bundle: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| ClusterError::Unauthorized(format!("invalid ca certificate: {e}")))?;
        }
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Parsed `Status` object from the exec error channel.
#[derive(serde::Deserialize)]
struct ExecStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

#[async_trait]
impl OrchestratorClient for KubeClient {
    async fn create_namespace(
        &self,
        labels: &BTreeMap<String, String>,
        generate_name_prefix: &str,
    ) -> ClusterResult<String> {
        let body = Namespace {
            metadata: ObjectMeta {
                generate_name: generate_name_prefix.to_string(),
                labels: labels.clone(),
                ..ObjectMeta::default()
            },
        };
        let created: Namespace = self.post_json("/api/v1/namespaces", &body).await?;
        debug!(namespace = %created.metadata.name, "created namespace");
        Ok(created.metadata.name)
    }

    async fn get_namespace(&self, name: &str) -> ClusterResult<Namespace> {
        self.get_json(&format!("/api/v1/namespaces/{name}")).await
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        self.delete(&format!("/api/v1/namespaces/{name}")).await
    }

    async fn annotate_namespace(&self, name: &str, key: &str, value: &str) -> ClusterResult<()> {
        let mut ns: Namespace = self.get_namespace(name).await?;
        if value.is_empty() {
            ns.metadata.annotations.remove(key);
        } else {
            ns.metadata
                .annotations
                .insert(key.to_string(), value.to_string());
        }
        let _: Namespace = self
            .put_json(&format!("/api/v1/namespaces/{name}"), &ns)
            .await?;
        Ok(())
    }

    async fn create_service_account(&self, name: &str, namespace: &str) -> ClusterResult<()> {
        let body = ServiceAccount {
            metadata: ObjectMeta::named(name),
        };
        let _: ServiceAccount = self
            .post_json(
                &format!("/api/v1/namespaces/{namespace}/serviceaccounts"),
                &body,
            )
            .await?;
        Ok(())
    }

    async fn create_role_binding(
        &self,
        binding: &RoleBinding,
        namespace: &str,
    ) -> ClusterResult<()> {
        let _: RoleBinding = self
            .post_json(
                &format!(
                    "/apis/rbac.authorization.k8s.io/v1/namespaces/{namespace}/rolebindings"
                ),
                binding,
            )
            .await?;
        Ok(())
    }

    async fn delete_role_binding(&self, name: &str, namespace: &str) -> ClusterResult<()> {
        self.delete(&format!(
            "/apis/rbac.authorization.k8s.io/v1/namespaces/{namespace}/rolebindings/{name}"
        ))
        .await
    }

    async fn create_network_policy(
        &self,
        policy: &NetworkPolicy,
        namespace: &str,
    ) -> ClusterResult<()> {
        let _: NetworkPolicy = self
            .post_json(
                &format!("/apis/networking.k8s.io/v1/namespaces/{namespace}/networkpolicies"),
                policy,
            )
            .await?;
        Ok(())
    }

    async fn delete_network_policy(&self, name: &str, namespace: &str) -> ClusterResult<()> {
        self.delete(&format!(
            "/apis/networking.k8s.io/v1/namespaces/{namespace}/networkpolicies/{name}"
        ))
        .await
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> ClusterResult<()> {
        let _: Pod = self
            .post_json(&format!("/api/v1/namespaces/{namespace}/pods"), pod)
            .await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> ClusterResult<Pod> {
        self.get_json(&format!("/api/v1/namespaces/{namespace}/pods/{name}"))
            .await
    }

    async fn watch_pods(&self, namespace: &str) -> ClusterResult<mpsc::Receiver<PodEvent>> {
        let mut url = self.url(&format!("/api/v1/namespaces/{namespace}/pods"))?;
        url.query_pairs_mut().append_pair("watch", "true");

        let resp = self
            .authorized(self.http.get(url))
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        let (tx, rx) = mpsc::channel(32);
        let namespace = namespace.to_string();
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(namespace = %namespace, error = %e, "pod watch stream error");
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<PodEvent>(line) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(namespace = %namespace, error = %e, "skipping unparseable watch line");
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn exec_pod(
        &self,
        namespace: &str,
        name: &str,
        command: &[String],
    ) -> ClusterResult<ExecOutput> {
        let mut url = self.url(&format!("/api/v1/namespaces/{namespace}/pods/{name}/exec"))?;
        {
            let mut pairs = url.query_pairs_mut();
            for arg in command {
                pairs.append_pair("command", arg);
            }
            pairs.append_pair("stdout", "true");
            pairs.append_pair("stderr", "true");
            pairs.append_pair("stdin", "false");
            pairs.append_pair("tty", "false");
        }
        let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
        url.set_scheme(scheme)
            .map_err(|_| ClusterError::Transient("unable to build exec url".into()))?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ClusterError::Transient(format!("invalid exec request: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.auth.token))
            .map_err(|e| ClusterError::Unauthorized(format!("invalid bearer token: {e}")))?;
        request.headers_mut().insert("Authorization", bearer);
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(EXEC_SUBPROTOCOL),
        );

        let connector = Connector::Rustls(self.tls.clone());
        let (mut socket, _) = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            Some(connector),
        )
        .await
        .map_err(|e| ClusterError::Transient(format!("exec connection failed: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut error_channel = Vec::new();
        while let Some(frame) = socket.next().await {
            let frame =
                frame.map_err(|e| ClusterError::Transient(format!("exec stream failed: {e}")))?;
            match frame {
                Message::Binary(data) if !data.is_empty() => match data[0] {
                    STDOUT_CHANNEL => stdout.extend_from_slice(&data[1..]),
                    STDERR_CHANNEL => stderr.extend_from_slice(&data[1..]),
                    ERROR_CHANNEL => error_channel.extend_from_slice(&data[1..]),
                    _ => {}
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        if !error_channel.is_empty() {
            if let Ok(status) = serde_json::from_slice::<ExecStatus>(&error_channel) {
                if status.status != "Success" {
                    return Err(ClusterError::Transient(format!(
                        "exec failed: {}",
                        status.message
                    )));
                }
            }
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> ClusterResult<Secret> {
        self.get_json(&format!("/api/v1/namespaces/{namespace}/secrets/{name}"))
            .await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()> {
        let _: Secret = self
            .post_json(&format!("/api/v1/namespaces/{namespace}/secrets"), secret)
            .await?;
        Ok(())
    }

    async fn update_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()> {
        let name = &secret.metadata.name;
        let _: Secret = self
            .put_json(
                &format!("/api/v1/namespaces/{namespace}/secrets/{name}"),
                secret,
            )
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.delete(&format!("/api/v1/namespaces/{namespace}/secrets/{name}"))
            .await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> ClusterResult<ConfigMap> {
        self.get_json(&format!("/api/v1/namespaces/{namespace}/configmaps/{name}"))
            .await
    }

    async fn create_config_map(&self, namespace: &str, map: &ConfigMap) -> ClusterResult<()> {
        let _: ConfigMap = self
            .post_json(&format!("/api/v1/namespaces/{namespace}/configmaps"), map)
            .await?;
        Ok(())
    }

    async fn update_config_map(&self, namespace: &str, map: &ConfigMap) -> ClusterResult<()> {
        let name = &map.metadata.name;
        let _: ConfigMap = self
            .put_json(
                &format!("/api/v1/namespaces/{namespace}/configmaps/{name}"),
                map,
            )
            .await?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.delete(&format!("/api/v1/namespaces/{namespace}/configmaps/{name}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_status_codes() {
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, ""),
            ClusterError::NotFound(_)
        ));
        assert!(matches!(
            classify(StatusCode::CONFLICT, "exists"),
            ClusterError::Conflict(_)
        ));
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, ""),
            ClusterError::Unauthorized(_)
        ));
        assert!(matches!(
            classify(StatusCode::INTERNAL_SERVER_ERROR, ""),
            ClusterError::Transient(_)
        ));
    }
}
