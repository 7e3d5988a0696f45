use async_trait::async_trait;
use flowcore::{
    contains_unresolved_variables, node_types, ExecutionContext, Map, NodeError, NodeHandler, NodeMetadata,
    NodeResult, NodeSpec, Resolver, Value,
};
use reqwest::multipart::Form;
use reqwest::{Method, Url};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound HTTP call. With `waitForCallback` the node pauses the run
/// until a reply is delivered for the generated callback key.
pub struct ApiNode {
    client: reqwest::Client,
}

impl ApiNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ApiNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Credentials from `authConfig`
#[derive(Debug, Clone, PartialEq)]
enum Auth {
    None,
    Header(String, String),
    Basic(String, String),
}

/// Request body as built from `bodyType`
#[derive(Debug, Clone, PartialEq)]
enum Body {
    /// JSON object or document; `none` is an empty object
    Json(Value),
    Raw(String),
    UrlEncoded(Vec<(String, String)>),
    Multipart(Vec<(String, String)>),
}

/// Where the reply is expected to arrive
struct CallbackInfo {
    key: String,
    kind: String,
    url: String,
    kafka: Option<KafkaReply>,
}

/// Reply published to a topic instead of posted back over HTTP
struct KafkaReply {
    topic: String,
    key_field: String,
}

impl CallbackInfo {
    fn for_node(node: &NodeSpec) -> Result<Self, NodeError> {
        let key = Uuid::new_v4().simple().to_string();
        let kind = node.config_str("callbackType").unwrap_or("http").to_string();
        let kafka = match kind.as_str() {
            "kafka" => {
                let topic = node
                    .config_str("callbackTopic")
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| NodeError::Configuration("kafka callbacks need a callbackTopic".to_string()))?;
                let key_field = node
                    .config_str("callbackKeyField")
                    .filter(|f| !f.is_empty())
                    .unwrap_or("callbackKey");
                Some(KafkaReply {
                    topic: topic.to_string(),
                    key_field: key_field.to_string(),
                })
            }
            _ => None,
        };
        Ok(Self {
            url: format!("/api/callback/{}", key),
            kind,
            key,
            kafka,
        })
    }

    /// Fields naming the reply channel: the HTTP callback URL, or the topic
    /// and key field for kafka replies
    fn channel(&self) -> Vec<(&'static str, String)> {
        match &self.kafka {
            Some(kafka) => vec![
                ("callbackTopic", kafka.topic.clone()),
                ("callbackKeyField", kafka.key_field.clone()),
            ],
            None => vec![("httpCallbackUrl", self.url.clone())],
        }
    }

    /// Everything the remote side needs to reply, with `_`-prefixed names
    fn request_params(&self, execution_id: &str, node_id: &str) -> Vec<(String, String)> {
        let mut params = vec![
            ("_callbackKey".to_string(), self.key.clone()),
            ("_executionId".to_string(), execution_id.to_string()),
            ("_nodeId".to_string(), node_id.to_string()),
            ("_callbackType".to_string(), self.kind.clone()),
        ];
        params.extend(self.channel().into_iter().map(|(name, value)| (format!("_{}", name), value)));
        params
    }
}

#[async_trait]
impl NodeHandler for ApiNode {
    fn node_type(&self) -> &str {
        node_types::API
    }

    async fn execute(&self, node: &NodeSpec, ctx: &mut ExecutionContext) -> Result<NodeResult, NodeError> {
        let url_template = node.require_config_str("url")?;
        let method_name = node.config_str("method").unwrap_or("GET").to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| NodeError::Configuration(format!("Unsupported method: {}", method_name)))?;
        let wait_for_callback = node.config_bool("waitForCallback");

        let callback = match wait_for_callback {
            true => Some(CallbackInfo::for_node(node)?),
            false => None,
        };

        // Everything that reads the context is resolved before the request
        let (url, headers, auth, body) = {
            let resolver = ctx.resolver();
            let mut url = build_url(&resolver.render(url_template), node.config("params"), &resolver);
            let headers = resolve_headers(node.config("headers"), &resolver);
            let auth = parse_auth(node.config("authConfig"));
            let mut body = build_body(node, &resolver);
            if let Some(callback) = &callback {
                attach_callback(&mut body, callback, &ctx.execution_id().to_string(), &node.id);
                if method == Method::GET || method == Method::DELETE {
                    url = append_callback_params(&url, callback, &ctx.execution_id().to_string(), &node.id);
                }
            }
            (url, headers, auth, body)
        };

        let request_details = Value::object([
            ("originalUrl", Value::from(url_template)),
            ("resolvedUrl", Value::from(url.as_str())),
            ("method", Value::from(method_name.as_str())),
            (
                "headers",
                Value::Object(headers.iter().map(|(k, v)| (k.clone(), Value::from(v.as_str()))).collect()),
            ),
            ("body", body_value(&body)),
        ]);

        ctx.info(format!("{} {}", method_name, url));
        let mut request = self
            .client
            .request(method.clone(), url.as_str())
            .timeout(timeout(node.config("timeout")));
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match auth {
            Auth::None => request,
            Auth::Header(name, value) => request.header(name.as_str(), value.as_str()),
            Auth::Basic(user, password) => request.basic_auth(user, Some(password)),
        };
        if method != Method::GET && method != Method::HEAD {
            request = match &body {
                Body::Json(Value::Object(map)) if map.is_empty() => request,
                Body::Json(json) => request.json(json),
                Body::Raw(text) => request.body(text.clone()),
                Body::UrlEncoded(pairs) => request.form(pairs),
                Body::Multipart(pairs) => request.multipart(
                    pairs
                        .iter()
                        .fold(Form::new(), |form, (name, value)| form.text(name.clone(), value.clone())),
                ),
            };
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(node_id = %node.id, url = %url, error = %e, "API call failed");
                return Ok(NodeResult::fail(format!("API call failed: {}", e)));
            }
        };

        let status = response.status().as_u16();
        let response_headers: Map = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(v.to_str().unwrap_or(""))))
            .collect();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return Ok(NodeResult::fail(format!("API call failed: could not read response: {}", e))),
        };
        let response_body = Value::from_json_str(&text).unwrap_or(Value::String(text));
        tracing::info!(node_id = %node.id, url = %url, status, "API call completed");
        ctx.info(format!("Response status: {}", status));

        let response = Value::object([
            ("statusCode", Value::from(status as i64)),
            ("headers", Value::Object(response_headers.clone())),
            ("body", response_body.clone()),
        ]);
        let mut execution_data = Map::from([
            ("request".to_string(), request_details.clone()),
            ("response".to_string(), response),
            ("timestamp".to_string(), Value::from(chrono::Utc::now().timestamp_millis())),
        ]);

        let mut output = Map::from([
            ("statusCode".to_string(), Value::from(status as i64)),
            ("body".to_string(), response_body),
            ("headers".to_string(), Value::Object(response_headers)),
            ("url".to_string(), Value::from(url.as_str())),
            ("method".to_string(), Value::from(method_name.as_str())),
            ("request".to_string(), request_details),
        ]);

        match callback {
            Some(callback) => {
                // Kept for the resumed node as `syncResponse`; the reply
                // proper arrives as `callbackData`
                if let Some(response) = execution_data.remove("response") {
                    execution_data.insert("syncResponse".to_string(), response);
                }
                let channel = callback.channel();
                let channel_field = |name: &str| {
                    channel
                        .iter()
                        .find(|(field, _)| *field == name)
                        .map(|(_, value)| Value::from(value.as_str()))
                        .unwrap_or_else(|| Value::from(""))
                };
                execution_data.insert(
                    "callbackInfo".to_string(),
                    Value::object([
                        ("callbackKey", Value::from(callback.key.as_str())),
                        ("callbackType", Value::from(callback.kind.as_str())),
                        ("httpCallbackUrl", channel_field("httpCallbackUrl")),
                        ("callbackTopic", channel_field("callbackTopic")),
                    ]),
                );
                execution_data.insert("callbackKey".to_string(), Value::from(callback.key.as_str()));
                execution_data.insert("callbackType".to_string(), Value::from(callback.kind.as_str()));
                for (name, value) in channel {
                    execution_data.insert(name.to_string(), Value::from(value));
                }
                execution_data.extend(output);
                tracing::info!(node_id = %node.id, callback_key = %callback.key, "API node waiting for callback");
                Ok(NodeResult::pause(callback.key, execution_data))
            }
            None => {
                output.insert("_executionData".to_string(), Value::Object(execution_data));
                Ok(NodeResult::success(output))
            }
        }
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Call an HTTP endpoint, optionally waiting for an async reply", "http")
    }
}

/// Append `params` to the query string. Parameters whose value still
/// holds a placeholder after rendering are dropped.
fn build_url(url: &str, params: Option<&Value>, resolver: &Resolver<'_>) -> String {
    let resolved = render_pairs(template_pairs(params), resolver, "query");
    if resolved.is_empty() {
        return url.to_string();
    }

    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().extend_pairs(&resolved);
            parsed.to_string()
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "Cannot append parameters to unparseable URL");
            url.to_string()
        }
    }
}

/// Name/value templates from a list of `{key, value}` entries (or
/// single-entry maps), or from the entries of a map
fn template_pairs(config: Option<&Value>) -> Vec<(String, String)> {
    match config {
        Some(Value::Array(items)) => items.iter().flat_map(item_pairs).collect(),
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.to_string())).collect(),
        _ => Vec::new(),
    }
}

fn item_pairs(item: &Value) -> Vec<(String, String)> {
    let Some(map) = item.as_object() else {
        return Vec::new();
    };
    if map.contains_key("key") {
        let key = map.get("key").and_then(Value::as_str).filter(|k| !k.is_empty());
        let value = map.get("value").filter(|v| !v.is_null());
        return match (key, value) {
            (Some(key), Some(value)) => vec![(key.to_string(), value.to_string())],
            _ => Vec::new(),
        };
    }
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect()
}

/// Render each value; entries left with a placeholder are dropped
fn render_pairs(pairs: Vec<(String, String)>, resolver: &Resolver<'_>, kind: &str) -> Vec<(String, String)> {
    pairs
        .into_iter()
        .filter_map(|(key, template)| {
            let value = resolver.render(&template);
            if contains_unresolved_variables(&value) {
                tracing::debug!(param = %key, kind, "Dropping unresolved parameter");
                None
            } else {
                Some((key, value))
            }
        })
        .collect()
}

/// Headers from a map, a `{key, value}` list or JSON text, with
/// placeholders rendered
fn resolve_headers(config: Option<&Value>, resolver: &Resolver<'_>) -> BTreeMap<String, String> {
    let parsed;
    let config = match config {
        Some(Value::String(text)) if !text.trim().is_empty() => {
            parsed = Value::from_json_str(text).unwrap_or_default();
            Some(&parsed)
        }
        other => other,
    };
    let mut headers = BTreeMap::new();
    match config {
        Some(Value::Object(map)) => {
            for (key, value) in map {
                headers.insert(key.clone(), resolver.render(&value.to_string()));
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                let key = item.get("key").and_then(Value::as_str).filter(|k| !k.is_empty());
                let value = item.get("value").filter(|v| !v.is_null());
                if let (Some(key), Some(value)) = (key, value) {
                    headers.insert(key.to_string(), resolver.render(&value.to_string()));
                }
            }
        }
        _ => {}
    }
    headers
}

fn parse_auth(config: Option<&Value>) -> Auth {
    let parsed;
    let config = match config {
        Some(Value::String(text)) => {
            parsed = Value::from_json_str(text).unwrap_or_default();
            &parsed
        }
        Some(other) => other,
        None => return Auth::None,
    };
    let field = |key: &str| config.get(key).and_then(Value::as_str).filter(|s| !s.is_empty());

    match field("type") {
        Some("api-key") => match field("apiKey") {
            Some(key) => Auth::Header(field("headerName").unwrap_or("X-API-Key").to_string(), key.to_string()),
            None => Auth::None,
        },
        Some("bearer") => match field("token") {
            Some(token) => Auth::Header("Authorization".to_string(), format!("Bearer {}", token)),
            None => Auth::None,
        },
        Some("basic") => match (field("username"), config.get("password").and_then(Value::as_str)) {
            (Some(user), Some(password)) => Auth::Basic(user.to_string(), password.to_string()),
            _ => Auth::None,
        },
        Some("custom") => match (field("headerName"), field("headerValue")) {
            (Some(name), Some(value)) => Auth::Header(name.to_string(), value.to_string()),
            _ => Auth::None,
        },
        _ => Auth::None,
    }
}

/// `bodyType` none → empty object, json → parsed `jsonBody` (unparseable
/// text is kept under `_rawContent`), raw → rendered `rawBody`, form-data
/// and x-www-form-urlencoded → rendered `formData` / `urlEncodedData`
fn build_body(node: &NodeSpec, resolver: &Resolver<'_>) -> Body {
    match node.config_str("bodyType").unwrap_or("none") {
        "json" => json_body(node, resolver),
        "raw" => Body::Raw(node.config_str("rawBody").map(|b| resolver.render(b)).unwrap_or_default()),
        "form-data" => Body::Multipart(render_pairs(template_pairs(node.config("formData")), resolver, "form-data")),
        "x-www-form-urlencoded" => Body::UrlEncoded(render_pairs(
            template_pairs(node.config("urlEncodedData")),
            resolver,
            "x-www-form-urlencoded",
        )),
        _ => Body::Json(Value::Object(Map::new())),
    }
}

fn json_body(node: &NodeSpec, resolver: &Resolver<'_>) -> Body {
    let mut body = match node.config_str("jsonBody").filter(|t| !t.is_empty()) {
        Some(template) => {
            let rendered = resolver.render(template);
            match Value::from_json_str(&rendered) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(node_id = %node.id, error = %e, "jsonBody is not valid JSON; sending raw content");
                    Value::object([("_rawContent", Value::from(rendered))])
                }
            }
        }
        None => Value::Object(Map::new()),
    };

    // Older definitions carry the body in `bodyTemplate`
    if body.as_object().is_some_and(Map::is_empty) {
        if let Some(template) = node.config_str("bodyTemplate").filter(|t| !t.is_empty()) {
            match Value::from_json_str(&resolver.render(template)) {
                Ok(json) => body = json,
                Err(e) => tracing::warn!(node_id = %node.id, error = %e, "bodyTemplate is not valid JSON; ignoring it"),
            }
        }
    }
    Body::Json(body)
}

fn body_value(body: &Body) -> Value {
    match body {
        Body::Json(json) => json.clone(),
        Body::Raw(text) => Value::from(text.as_str()),
        Body::UrlEncoded(pairs) | Body::Multipart(pairs) => Value::Object(
            pairs
                .iter()
                .map(|(name, value)| (name.clone(), Value::from(value.as_str())))
                .collect(),
        ),
    }
}

/// Tell the remote side how to reply. JSON object and form bodies carry
/// the fields; raw bodies are sent untouched.
fn attach_callback(body: &mut Body, callback: &CallbackInfo, execution_id: &str, node_id: &str) {
    let params = callback.request_params(execution_id, node_id);
    match body {
        Body::Json(Value::Object(map)) => {
            map.extend(params.into_iter().map(|(name, value)| (name, Value::from(value))));
        }
        Body::UrlEncoded(pairs) | Body::Multipart(pairs) => pairs.extend(params),
        _ => {}
    }
}

fn append_callback_params(url: &str, callback: &CallbackInfo, execution_id: &str, node_id: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed
                .query_pairs_mut()
                .extend_pairs(callback.request_params(execution_id, node_id));
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// `timeout` in milliseconds, either a number or `{read}`
fn timeout(config: Option<&Value>) -> Duration {
    let millis = match config {
        Some(Value::Object(map)) => map.get("read").and_then(Value::to_number),
        Some(other) => other.to_number(),
        None => None,
    };
    millis
        .filter(|ms| *ms > 0.0)
        .map(|ms| Duration::from_millis(ms as u64))
        .unwrap_or(DEFAULT_TIMEOUT)
}
