use crate::error::ProviderError;
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

/// POST JSON 并解析响应；失败按瞬时 / 致命归类
pub async fn post<Req, Resp>(
    client: Arc<Client>,
    provider: &str,
    request_body: &Req,
    header_map: HeaderMap,
    url: &str,
) -> Result<Resp, ProviderError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let response = client
        .post(url)
        .headers(header_map)
        .json(request_body)
        .send()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, e))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ProviderError::from_status(provider, status, error_text));
    }

    let parsed = response
        .json::<Resp>()
        .await
        .map_err(|e| ProviderError::fatal(provider, format!("Invalid response: {}", e)))?;

    debug!(provider, url, "Post completed");

    Ok(parsed)
}
