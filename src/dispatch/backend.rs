//! Backend 工具的 HTTP 调用
//!
//! GET：把参数 JSON 的字段按 `{field}` 填入 URL 模板；POST：参数 JSON 原样作为请求体（空参数为 `{}`）。
//! 调用方 token 通过配置的请求头透传。网络失败与非 2xx 响应都是 TransportError。

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::core::RelayError;
use crate::tools::{CallMethod, ToolDefinition};

pub const MISSING_URL: &str = "[FUNC FAILED] 方法的调用URL未配置";

/// 错误信息中保留的响应体长度
const ERROR_BODY_PREVIEW: usize = 500;

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    auth_header: String,
    raw_result_field: String,
}

impl BackendClient {
    pub fn new(
        timeout: Duration,
        auth_header: impl Into<String>,
        raw_result_field: impl Into<String>,
    ) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("backend http client: {}", e)))?;
        Ok(Self::with_client(http, auth_header, raw_result_field))
    }

    pub fn with_client(
        http: reqwest::Client,
        auth_header: impl Into<String>,
        raw_result_field: impl Into<String>,
    ) -> Self {
        Self {
            http,
            auth_header: auth_header.into(),
            raw_result_field: raw_result_field.into(),
        }
    }

    /// 调用后端，返回响应体文本
    pub async fn invoke(
        &self,
        def: &ToolDefinition,
        arguments: &str,
        auth_token: Option<&str>,
    ) -> Result<String, RelayError> {
        let url = def
            .call_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| RelayError::Lookup(MISSING_URL.to_string()))?;

        let request = match def.call_method {
            CallMethod::Get => self.http.get(expand_url(url, arguments)),
            CallMethod::Post => {
                let body = if arguments.trim().is_empty() { "{}" } else { arguments };
                self.http
                    .post(url)
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.to_string())
            }
        };
        let request = match auth_token.filter(|t| !t.is_empty()) {
            Some(token) => request.header(self.auth_header.as_str(), token),
            None => request,
        };

        tracing::info!(tool = %def.name, method = ?def.call_method, "backend tool call");
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("[FUNC FAILED] {}: {}", def.name, e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Transport(format!("[FUNC FAILED] {}: {}", def.name, e)))?;

        if !status.is_success() {
            let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
            tracing::warn!(tool = %def.name, status = status.as_u16(), "backend tool returned error status");
            return Err(RelayError::Transport(format!(
                "[FUNC FAILED] {} HTTP {}: {}",
                def.name,
                status.as_u16(),
                preview
            )));
        }
        Ok(body)
    }

    /// return_raw 工具：取响应 JSON 中的指定字段；不是 JSON 或没有该字段时返回原文
    pub fn extract_raw(&self, body: &str) -> String {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => match value.get(&self.raw_result_field) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => body.to_string(),
            },
            Err(_) => body.to_string(),
        }
    }
}

/// `{field}` 占位替换；参数不是 JSON 对象时原样返回模板
pub fn expand_url(template: &str, arguments: &str) -> String {
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(arguments) else {
        return template.to_string();
    };
    fields.iter().fold(template.to_string(), |url, (name, value)| {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        url.replace(&format!("{{{}}}", name), &text)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ExecutorKind;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> BackendClient {
        BackendClient::new(Duration::from_secs(5), "x-access-token", "body").unwrap()
    }

    #[test]
    fn test_expand_url_fields() {
        let url = expand_url("http://h/w?city={city}&days={days}", r#"{"city":"北京","days":3}"#);
        assert_eq!(url, "http://h/w?city=北京&days=3");
        assert_eq!(expand_url("http://h/{x}", "not json"), "http://h/{x}");
    }

    #[test]
    fn test_extract_raw_field() {
        let c = client();
        assert_eq!(c.extract_raw(r#"{"body":"直接给用户","code":0}"#), "直接给用户");
        assert_eq!(c.extract_raw("plain"), "plain");
    }

    #[tokio::test]
    async fn test_get_with_template_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .and(query_param("city", "北京"))
            .and(header("x-access-token", "tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("晴 25°C"))
            .expect(1)
            .mount(&server)
            .await;

        let def = ToolDefinition::new("Weather", ExecutorKind::Backend)
            .with_url(CallMethod::Get, format!("{}/weather?city={{city}}", server.uri()));
        let body = client()
            .invoke(&def, r#"{"city":"北京"}"#, Some("tok-1"))
            .await
            .unwrap();
        assert_eq!(body, "晴 25°C");
    }

    #[tokio::test]
    async fn test_post_sends_arguments_as_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(body_json(serde_json::json!({"id": 7})))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/empty"))
            .and(body_json(serde_json::json!({})))
            .respond_with(ResponseTemplate::new(200).set_body_string("empty ok"))
            .mount(&server)
            .await;

        let c = client();
        let def = ToolDefinition::new("Order", ExecutorKind::Backend)
            .with_url(CallMethod::Post, format!("{}/orders", server.uri()));
        assert_eq!(c.invoke(&def, r#"{"id":7}"#, None).await.unwrap(), "ok");

        let def = ToolDefinition::new("Empty", ExecutorKind::Backend)
            .with_url(CallMethod::Post, format!("{}/empty", server.uri()));
        assert_eq!(c.invoke(&def, "", None).await.unwrap(), "empty ok");
    }

    #[tokio::test]
    async fn test_error_status_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;
        let def = ToolDefinition::new("Down", ExecutorKind::Backend).with_url(CallMethod::Get, server.uri());
        let err = client().invoke(&def, "{}", None).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
        assert!(err.detail().contains("502"));
    }

    #[tokio::test]
    async fn test_missing_url_is_lookup_error() {
        let def = ToolDefinition::new("NoUrl", ExecutorKind::Backend);
        let err = client().invoke(&def, "{}", None).await.unwrap_err();
        assert_eq!(err.detail(), MISSING_URL);
    }
}
