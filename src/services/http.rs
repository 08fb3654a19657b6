//! HTTP collaborators.
//!
//! Every client shares one blocking `ureq` agent with a bounded timeout; a
//! slow service costs one worker at most that long per call.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io;
use std::time::Duration;

use super::{
    FaceEmbeddingService, FaceScan, FacialArea, FacialAttributes, NotificationSink,
    ObjectDetectionService, TextEmbeddingService,
};
use crate::error::{NotifyError, ServiceError};
use crate::region::BBox;
use crate::Detection;

pub const OBJECT_DETECTION_PROMPT: &str = "<OD>";
pub const DETAILED_CAPTION_PROMPT: &str = "<DETAILED_CAPTION>";

fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

fn data_url(jpeg: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", BASE64.encode(jpeg))
}

fn map_error(service: &'static str, err: ureq::Error) -> ServiceError {
    match err {
        ureq::Error::Status(status, _) => ServiceError::Status { service, status },
        ureq::Error::Transport(transport) if is_timeout(&transport) => {
            ServiceError::Timeout { service }
        }
        ureq::Error::Transport(transport) => ServiceError::Request {
            service,
            reason: transport.to_string(),
        },
    }
}

// ureq reports an elapsed deadline as an io error somewhere in the source chain.
fn is_timeout(transport: &ureq::Transport) -> bool {
    let mut source = std::error::Error::source(transport);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            return matches!(io.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock);
        }
        source = err.source();
    }
    false
}

fn post_json<T: DeserializeOwned>(
    agent: &ureq::Agent,
    service: &'static str,
    url: &str,
    body: Value,
) -> Result<T, ServiceError> {
    let response = agent
        .post(url)
        .send_json(body)
        .map_err(|err| map_error(service, err))?;
    response.into_json::<T>().map_err(|err| ServiceError::Decode {
        service,
        reason: err.to_string(),
    })
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

// -------------------- Vision (detection + caption) --------------------

/// Vision-language model behind an OpenAI-compatible chat completions API.
/// Detection uses the `<OD>` task prompt, captions `<DETAILED_CAPTION>`.
pub struct HttpVisionService {
    agent: ureq::Agent,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct ObjectDetections {
    #[serde(default)]
    bboxes: Vec<[f32; 4]>,
    #[serde(default)]
    labels: Vec<String>,
}

impl HttpVisionService {
    const SERVICE: &'static str = "vision";

    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent: agent(timeout),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn prompt(&self, prompt: &str, image: &[u8]) -> Result<String, ServiceError> {
        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": data_url(image)}},
                ],
            }],
            "max_tokens": 300,
        });
        let url = endpoint(&self.base_url, "/v1/chat/completions");
        let response: ChatResponse = post_json(&self.agent, Self::SERVICE, &url, body)?;
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ServiceError::Decode {
                service: Self::SERVICE,
                reason: "no choices in response".to_string(),
            })
    }
}

/// Parse the `<OD>` answer. The model emits a Python-style dict with single
/// quotes, optionally keyed by the task prompt.
pub fn parse_object_detections(content: &str) -> Result<Vec<Detection>, ServiceError> {
    let normalized = content.trim().replace('\'', "\"");
    let value: Value = serde_json::from_str(&normalized).map_err(|err| ServiceError::Decode {
        service: HttpVisionService::SERVICE,
        reason: err.to_string(),
    })?;
    let value = match value.get(OBJECT_DETECTION_PROMPT) {
        Some(inner) => inner.clone(),
        None => value,
    };
    let parsed: ObjectDetections =
        serde_json::from_value(value).map_err(|err| ServiceError::Decode {
            service: HttpVisionService::SERVICE,
            reason: err.to_string(),
        })?;
    if parsed.bboxes.len() != parsed.labels.len() {
        return Err(ServiceError::Decode {
            service: HttpVisionService::SERVICE,
            reason: format!(
                "{} boxes for {} labels",
                parsed.bboxes.len(),
                parsed.labels.len()
            ),
        });
    }
    let mut detections = Vec::with_capacity(parsed.labels.len());
    for (label, coords) in parsed.labels.into_iter().zip(parsed.bboxes) {
        match BBox::from_f32(coords) {
            Ok(bbox) => detections.push(Detection::new(label, bbox)),
            Err(err) => log::warn!("skipping detection '{}': {}", label, err),
        }
    }
    Ok(detections)
}

impl ObjectDetectionService for HttpVisionService {
    fn detect(&self, image: &[u8]) -> Result<Vec<Detection>, ServiceError> {
        let content = self.prompt(OBJECT_DETECTION_PROMPT, image)?;
        parse_object_detections(&content)
    }

    fn caption(&self, image: &[u8]) -> Result<String, ServiceError> {
        self.prompt(DETAILED_CAPTION_PROMPT, image)
    }

    fn caption_model(&self) -> &str {
        &self.model
    }
}

// -------------------- Faces --------------------

/// Face service exposing `/represent` (embeddings) and `/analyze`
/// (demographic attributes). Attributes are matched to faces by index.
pub struct HttpFaceService {
    agent: ureq::Agent,
    base_url: String,
    model_name: String,
    detector_backend: String,
}

#[derive(Deserialize)]
struct Represented {
    results: Vec<RepresentedFace>,
}

#[derive(Deserialize)]
struct RepresentedFace {
    embedding: Vec<f32>,
    #[serde(default)]
    facial_area: FacialArea,
}

#[derive(Deserialize)]
struct Analyzed {
    results: Vec<FacialAttributes>,
}

impl HttpFaceService {
    const SERVICE: &'static str = "faces";

    pub fn new(
        base_url: impl Into<String>,
        model_name: impl Into<String>,
        detector_backend: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            agent: agent(timeout),
            base_url: base_url.into(),
            model_name: model_name.into(),
            detector_backend: detector_backend.into(),
        }
    }

    fn analyze(&self, image_url: &str) -> Result<Vec<FacialAttributes>, ServiceError> {
        let body = json!({
            "img_path": image_url,
            "detector_backend": self.detector_backend,
            "actions": ["age", "gender", "emotion", "race"],
        });
        let url = endpoint(&self.base_url, "/analyze");
        let analyzed: Analyzed = post_json(&self.agent, Self::SERVICE, &url, body)?;
        Ok(analyzed.results)
    }
}

impl FaceEmbeddingService for HttpFaceService {
    fn scan(&self, image: &[u8]) -> Result<Option<Vec<FaceScan>>, ServiceError> {
        let image_url = data_url(image);
        let body = json!({
            "img_path": image_url,
            "model_name": self.model_name,
            "detector_backend": self.detector_backend,
        });
        let url = endpoint(&self.base_url, "/represent");
        let represented: Represented = match post_json(&self.agent, Self::SERVICE, &url, body) {
            Ok(represented) => represented,
            // The service answers 400 when it cannot find a face.
            Err(ServiceError::Status { status: 400, .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        if represented.results.is_empty() {
            return Ok(None);
        }

        let mut attributes: Vec<Option<FacialAttributes>> = match self.analyze(&image_url) {
            Ok(found) => found.into_iter().map(Some).collect(),
            Err(err) => {
                log::warn!("face attribute analysis failed: {}", err);
                Vec::new()
            }
        };
        attributes.resize(represented.results.len(), None);

        let scans = represented
            .results
            .into_iter()
            .zip(attributes)
            .map(|(face, attributes)| FaceScan {
                embedding: face.embedding,
                facial_area: face.facial_area,
                attributes,
            })
            .collect();
        Ok(Some(scans))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn detector_name(&self) -> &str {
        &self.detector_backend
    }
}

// -------------------- Text embeddings --------------------

/// Embedding endpoint taking `{model, prompt}` and answering `{embedding}`.
pub struct HttpEmbeddingService {
    agent: ureq::Agent,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl HttpEmbeddingService {
    const SERVICE: &'static str = "embeddings";

    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent: agent(timeout),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

impl TextEmbeddingService for HttpEmbeddingService {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let body = json!({ "model": self.model, "prompt": text });
        let url = endpoint(&self.base_url, "/api/embeddings");
        let response: EmbeddingResponse = post_json(&self.agent, Self::SERVICE, &url, body)?;
        if response.embedding.is_empty() {
            return Err(ServiceError::Decode {
                service: Self::SERVICE,
                reason: "empty embedding".to_string(),
            });
        }
        Ok(response.embedding)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// -------------------- Webhook --------------------

/// Chat webhook taking `{"text": ...}`. Images are not uploaded; their count
/// is appended to the text.
pub struct WebhookSink {
    agent: ureq::Agent,
    url: String,
}

impl WebhookSink {
    const SERVICE: &'static str = "webhook";

    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent: agent(timeout),
            url: url.into(),
        }
    }
}

impl NotificationSink for WebhookSink {
    fn send(&self, text: &str, images: &[Vec<u8>]) -> Result<(), NotifyError> {
        let text = if images.is_empty() {
            text.to_string()
        } else {
            format!("{} ({} image(s) captured)", text, images.len())
        };
        self.agent
            .post(&self.url)
            .send_json(json!({ "text": text }))
            .map_err(|err| map_error(Self::SERVICE, err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_quoted_detections() {
        let content = "{'bboxes': [[10.4, 20.0, 50.2, 90.0], [0.0, 0.0, 5.0, 5.0]], 'labels': ['person', 'car']}";
        let detections = parse_object_detections(content).unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].label, "person");
        assert_eq!(detections[0].bbox, BBox::new(10, 20, 50, 90).unwrap());
        assert_eq!(detections[1].label, "car");
    }

    #[test]
    fn parses_prompt_keyed_detections() {
        let content = "{'<OD>': {'bboxes': [[1, 2, 30, 40]], 'labels': ['person']}}";
        let detections = parse_object_detections(content).unwrap();
        assert_eq!(detections.len(), 1);
    }

    #[test]
    fn skips_degenerate_boxes() {
        let content = "{'bboxes': [[5, 5, 5, 9], [1, 1, 4, 4]], 'labels': ['person', 'person']}";
        let detections = parse_object_detections(content).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bbox, BBox::new(1, 1, 4, 4).unwrap());
    }

    #[test]
    fn skips_boxes_outside_pixel_range() {
        let content = "{'bboxes': [[0, -3e9, 10, 3e9], [1, 1, 4, 4]], 'labels': ['person', 'person']}";
        let detections = parse_object_detections(content).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bbox, BBox::new(1, 1, 4, 4).unwrap());
    }

    #[test]
    fn rejects_mismatched_lengths_and_garbage() {
        assert!(parse_object_detections("{'bboxes': [[1, 1, 4, 4]], 'labels': []}").is_err());
        assert!(matches!(
            parse_object_detections("no objects"),
            Err(ServiceError::Decode { .. })
        ));
    }

    #[test]
    fn unreachable_service_is_a_request_error() {
        let service = HttpEmbeddingService::new(
            "http://127.0.0.1:9",
            "nomic-embed-text",
            Duration::from_millis(300),
        );
        assert!(matches!(
            service.embed("hello"),
            Err(ServiceError::Request { .. } | ServiceError::Timeout { .. })
        ));
    }

    #[test]
    fn silent_service_is_a_timeout() {
        // Accepted by the kernel backlog but never answered.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let service = HttpEmbeddingService::new(url, "nomic-embed-text", Duration::from_millis(200));
        assert!(matches!(
            service.embed("hello"),
            Err(ServiceError::Timeout { service: "embeddings" })
        ));
        drop(listener);
    }

    #[test]
    fn data_url_is_base64_jpeg() {
        assert_eq!(data_url(&[0xff, 0xd8, 0xff]), "data:image/jpeg;base64,/9j/");
    }
}
