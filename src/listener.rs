//! Module for the HTTP listener receiving the Monnit webhooks and dispatching every contained
//! sensor reading to the publisher.
//!
//! The caller never gets feedback: every request is answered with an empty `200 OK`, whatever
//! happened to its readings.
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::Router;
use axum_server::tls_openssl::OpenSSLConfig;
use axum_server::Handle;
use futures::future::join_all;
use openssl::ssl::{SslAcceptor, SslAcceptorBuilder, SslFiletype, SslMethod};

use crate::config::{ReceiverParameters, ReceiverTlsParams};
use crate::error::ListenerError;
use crate::mqtt::Publisher;
use crate::record::{time_received_now, InboundWebhook};
use crate::topic::{sensor_id, TopicTemplate};

/// QoS of every publish, the strongest delivery guarantee MQTT offers.
pub const PUBLISH_QOS: i32 = 2;

#[derive(Clone)]
/// Immutable state shared by all request handlers.
pub struct AdapterState {
    pub publisher: Arc<dyn Publisher>,
    pub topic_template: Arc<TopicTemplate>,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
/// A serialized normalized message together with its topic.
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl AdapterState {
    pub fn new(publisher: Arc<dyn Publisher>, topic_template: TopicTemplate, max_body_bytes: usize) -> Self {
        AdapterState {
            publisher,
            topic_template: Arc::new(topic_template),
            max_body_bytes,
        }
    }
}

/// Router accepting every path and method.
pub fn create_router(state: AdapterState) -> Router {
    Router::new()
        .fallback(handle_webhook)
        .with_state(state)
}

/// Handles one webhook call: decode, normalize, route and publish.
pub async fn handle_webhook(State(state): State<AdapterState>, body: Body) {
    let time_received = time_received_now();
    log::info!(target: "monnit_adapter::http", "Received a http request!");

    let body = match to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => {
            log::error!(target: "monnit_adapter::http", "Error reading body of request: \'{}\'", err);
            return;
        }
    };

    let webhook = match InboundWebhook::decode(&body) {
        Ok(webhook) => webhook,
        Err(err) => {
            log::error!(target: "monnit_adapter::http", "{}", err);
            return;
        }
    };

    let publications = prepare_publications(&webhook, &time_received, &state.topic_template);
    let published = dispatch(state.publisher.as_ref(), publications).await;
    log::debug!(target: "monnit_adapter::http", "Published \'{}\' of \'{}\' sensor messages",
                published, webhook.sensor_messages.len());
}

/// Serializes and routes every sensor reading of a webhook.
///
/// Readings that cannot be serialized or have no usable sensor id are logged and skipped, the
/// remaining readings are kept in their original order.
pub fn prepare_publications(webhook: &InboundWebhook, time_received: &str, topic_template: &TopicTemplate) -> Vec<Publication> {
    let mut publications = Vec::with_capacity(webhook.sensor_messages.len());

    for (index, message) in webhook.normalize(time_received).into_iter().enumerate() {
        let payload = match message.to_payload() {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!(target: "monnit_adapter::http", "Failed to convert sensor message \'{}\' into JSON: \'{}\'", index, err);
                continue;
            }
        };

        let sensor_id = match sensor_id(message.sensor_message) {
            Ok(sensor_id) => sensor_id,
            Err(err) => {
                log::warn!(target: "monnit_adapter::http", "Skipping sensor message \'{}\': \'{}\'", index, err);
                continue;
            }
        };

        publications.push(Publication {
            topic: topic_template.route(sensor_id),
            payload,
        });
    }

    publications
}

/// Publishes all publications concurrently and waits for every one of them.
///
/// Failures are logged per message. Returns the number of successful publishes.
pub async fn dispatch(publisher: &dyn Publisher, publications: Vec<Publication>) -> usize {
    let results = join_all(publications.into_iter().map(|publication| async move {
        let result = publisher.publish(&publication.topic, publication.payload, PUBLISH_QOS).await;
        (publication.topic, result)
    })).await;

    results.into_iter()
        .filter(|(topic, result)| match result {
            Ok(_) => {
                log::debug!(target: "monnit_adapter::http", "Message published on \'{}\'", topic);
                true
            }
            Err(err) => {
                log::error!(target: "monnit_adapter::http", "Unable to publish on \'{}\': \'{}\'", topic, err);
                false
            }
        })
        .count()
}

/// Builds the OpenSSL acceptor of the HTTPS listener and checks that key and certificate match.
pub fn tls_acceptor(params: &ReceiverTlsParams) -> Result<SslAcceptorBuilder, ListenerError> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
    acceptor.set_certificate_chain_file(&params.cert_path)?;
    acceptor.set_private_key_file(&params.key_path, SslFiletype::PEM)?;
    acceptor.check_private_key()?;
    Ok(acceptor)
}

/// Address the listener binds to.
pub fn listen_address(params: &ReceiverParameters) -> Result<SocketAddr, ListenerError> {
    let ip = params.address.trim_start_matches('[').trim_end_matches(']')
        .parse::<IpAddr>()
        .map_err(|_| ListenerError::Address(params.address.clone()))?;
    Ok(SocketAddr::new(ip, params.port))
}

/// Serves webhooks until `handle` is shut down.
pub async fn serve(params: &ReceiverParameters, state: AdapterState, handle: Handle) -> Result<(), ListenerError> {
    let address = listen_address(params)?;
    let app = create_router(state);

    match &params.tls_params {
        Some(tls_params) => {
            let config = OpenSSLConfig::try_from(tls_acceptor(tls_params)?)
                .map_err(|err| ListenerError::Acceptor(err.to_string()))?;
            log::info!(target: "monnit_adapter::http", "Listening for webhooks on https://{}", address);
            axum_server::bind_openssl(address, config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            log::info!(target: "monnit_adapter::http", "Listening for webhooks on http://{}", address);
            axum_server::bind(address)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use async_trait::async_trait;
    use axum::http::{Method, Request, StatusCode};
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::x509::{X509, X509Builder, X509NameBuilder};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, Vec<u8>, i32)>>,
        failing_topics: Vec<String>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Vec<u8>, qos: i32) -> Result<(), PublishError> {
            if self.failing_topics.iter().any(|t| t == topic) {
                return Err(PublishError::Mqtt(paho_mqtt::Error::General("broker gone")));
            }
            self.published.lock().push((topic.to_string(), payload, qos));
            Ok(())
        }
    }

    fn state(publisher: Arc<RecordingPublisher>, template: &str) -> AdapterState {
        AdapterState::new(publisher, TopicTemplate::new(template), 1024 * 1024)
    }

    async fn post(publisher: &Arc<RecordingPublisher>, template: &str, body: &str) -> StatusCode {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/monnit/webhook")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = create_router(state(Arc::clone(publisher), template))
            .oneshot(request)
            .await
            .unwrap();
        response.status()
    }

    fn payloads(publisher: &RecordingPublisher) -> Vec<(String, Value)> {
        publisher.published.lock().iter()
            .map(|(topic, payload, _)| (topic.clone(), serde_json::from_slice(payload).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn publishes_single_reading() {
        let publisher = Arc::new(RecordingPublisher::default());
        let body = r#"{"sensorMessages":[{"sensorID":"42","value":7}],"gatewayMessage":{"gw":"A"}}"#;

        assert_eq!(post(&publisher, "topic/<sensor_id>", body).await, StatusCode::OK);

        let published = payloads(&publisher);
        assert_eq!(published.len(), 1);
        let (topic, payload) = &published[0];
        assert_eq!(topic, "topic/42");
        assert_eq!(payload["sensor_message"], json!({"sensorID": "42", "value": 7}));
        assert_eq!(payload["gateway_message"], json!({"gw": "A"}));
        let time_received = payload["time_received"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(time_received).is_ok());
        assert!(time_received.ends_with('Z'));
        assert_eq!(publisher.published.lock()[0].2, PUBLISH_QOS);
    }

    #[tokio::test]
    async fn readings_share_gateway_and_timestamp() {
        let publisher = Arc::new(RecordingPublisher::default());
        let body = r#"{"sensorMessages":[{"sensorID":"1"},{"sensorID":"2"},{"sensorID":"3"},{"sensorID":"4"}],"gatewayMessage":{"gw":"B"}}"#;

        post(&publisher, "s/<sensor_id>", body).await;

        let published = payloads(&publisher);
        assert_eq!(published.len(), 4);
        let first = &published[0].1;
        for (_, payload) in &published {
            assert_eq!(payload["gateway_message"], first["gateway_message"]);
            assert_eq!(payload["time_received"], first["time_received"]);
        }
    }

    #[tokio::test]
    async fn invalid_sensor_id_skips_only_that_reading() {
        let publisher = Arc::new(RecordingPublisher::default());
        let body = r#"{"sensorMessages":[{"sensorID":"1"},{"sensorID":2},{"sensorID":"3"}],"gatewayMessage":{}}"#;

        assert_eq!(post(&publisher, "s/<sensor_id>", body).await, StatusCode::OK);

        let mut topics: Vec<String> = payloads(&publisher).into_iter().map(|(topic, _)| topic).collect();
        topics.sort();
        assert_eq!(topics, vec!["s/1", "s/3"]);
    }

    #[tokio::test]
    async fn malformed_body_publishes_nothing() {
        let publisher = Arc::new(RecordingPublisher::default());
        assert_eq!(post(&publisher, "s/<sensor_id>", "{\"sensorMessages\": [").await, StatusCode::OK);
        assert_eq!(post(&publisher, "s/<sensor_id>", "[]").await, StatusCode::OK);
        assert!(publisher.published.lock().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_publishes_nothing() {
        let publisher = Arc::new(RecordingPublisher::default());
        let body = r#"{"sensorMessages":[],"gatewayMessage":{"gw":"A"}}"#;
        assert_eq!(post(&publisher, "s/<sensor_id>", body).await, StatusCode::OK);
        assert!(publisher.published.lock().is_empty());
    }

    #[tokio::test]
    async fn any_method_and_path_is_accepted() {
        let publisher = Arc::new(RecordingPublisher::default());
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/")
            .body(Body::from(r#"{"sensorMessages":[{"sensorID":"9"}]}"#))
            .unwrap();
        let response = create_router(state(Arc::clone(&publisher), "<sensor_id>"))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(publisher.published.lock()[0].0, "9");
    }

    #[tokio::test]
    async fn oversized_body_is_dropped() {
        let publisher = Arc::new(RecordingPublisher::default());
        let shared: Arc<dyn Publisher> = publisher.clone();
        let router = create_router(AdapterState::new(shared, TopicTemplate::default(), 16));
        let request = Request::builder()
            .uri("/")
            .body(Body::from(r#"{"sensorMessages":[{"sensorID":"1"}],"gatewayMessage":{}}"#))
            .unwrap();

        assert_eq!(router.oneshot(request).await.unwrap().status(), StatusCode::OK);
        assert!(publisher.published.lock().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_does_not_stop_the_batch() {
        let publisher = RecordingPublisher {
            failing_topics: vec![String::from("s/2")],
            ..Default::default()
        };
        let publications = ["1", "2", "3"].iter()
            .map(|id| Publication { topic: format!("s/{}", id), payload: b"{}".to_vec() })
            .collect();

        assert_eq!(dispatch(&publisher, publications).await, 2);
        assert_eq!(publisher.published.lock().len(), 2);
    }

    #[test]
    fn publications_keep_input_order() {
        let webhook = InboundWebhook::decode(
            br#"{"sensorMessages":[{"sensorID":"b"},{"value":1},{"sensorID":"a"}],"gatewayMessage":{"gw":"A"}}"#
        ).unwrap();
        let publications = prepare_publications(&webhook, "2019-07-01T12:30:00Z", &TopicTemplate::new("x/<sensor_id>"));

        let topics: Vec<&str> = publications.iter().map(|p| p.topic.as_str()).collect();
        assert_eq!(topics, vec!["x/b", "x/a"]);
    }

    #[test]
    fn listen_address_from_parameters() {
        let params = ReceiverParameters {
            address: String::from("127.0.0.1"),
            port: 8080,
            tls_params: None,
            max_body_bytes: 1024,
        };
        assert_eq!(listen_address(&params).unwrap(), "127.0.0.1:8080".parse::<SocketAddr>().unwrap());

        let ipv6 = ReceiverParameters { address: String::from("::"), ..params.clone() };
        assert_eq!(listen_address(&ipv6).unwrap(), "[::]:8080".parse::<SocketAddr>().unwrap());

        let ipv6 = ReceiverParameters { address: String::from("[::1]"), ..params.clone() };
        assert_eq!(listen_address(&ipv6).unwrap(), "[::1]:8080".parse::<SocketAddr>().unwrap());

        let params = ReceiverParameters { address: String::from("not an address"), ..params };
        assert!(matches!(listen_address(&params), Err(ListenerError::Address(_))));
    }

    fn self_signed_certificate(key: &PKey<Private>) -> X509 {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        builder.sign(key, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    fn private_key() -> PKey<Private> {
        PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
    }

    fn pem_file(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    fn tls_params(cert: &NamedTempFile, key: &NamedTempFile) -> ReceiverTlsParams {
        ReceiverTlsParams {
            cert_path: cert.path().to_str().unwrap().to_string(),
            key_path: key.path().to_str().unwrap().to_string(),
        }
    }

    #[test]
    fn tls_acceptor_from_matching_certificate_and_key() {
        let key = private_key();
        let cert_file = pem_file(&self_signed_certificate(&key).to_pem().unwrap());
        let key_file = pem_file(&key.private_key_to_pem_pkcs8().unwrap());

        let acceptor = tls_acceptor(&tls_params(&cert_file, &key_file)).unwrap();
        assert!(OpenSSLConfig::try_from(acceptor).is_ok());
    }

    #[test]
    fn tls_acceptor_rejects_key_of_other_certificate() {
        let cert_file = pem_file(&self_signed_certificate(&private_key()).to_pem().unwrap());
        let key_file = pem_file(&private_key().private_key_to_pem_pkcs8().unwrap());

        assert!(matches!(tls_acceptor(&tls_params(&cert_file, &key_file)), Err(ListenerError::Tls(_))));
    }

    #[test]
    fn tls_acceptor_requires_readable_files() {
        let params = ReceiverTlsParams {
            cert_path: String::from("/does/not/exist.crt"),
            key_path: String::from("/does/not/exist.key"),
        };
        assert!(matches!(tls_acceptor(&params), Err(ListenerError::Tls(_))));
    }
}
