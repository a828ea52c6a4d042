//! Image-remix integration: upload the source image, let the vendor
//! caption it (unless the caller supplied a prompt), sample variations,
//! then poll the metadata endpoint and download each finished PNG.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::runtime::poll::PollSettings;
use crate::runtime::session::SessionHandle;
use crate::runtime::{
    AdmissionError, ArtifactPayload, CompletionCheck, FlowContext, GenerateRequest,
    GenerationPlan, VendorAction, VendorError,
};
use crate::vendors::support::{
    decode_base64, fetch_base64_bearer_script, fetch_json_script, parse_fetch_result,
    upload_image_script,
};
use crate::vendors::{FlowFactory, Integration};

const CAPTION_SETTLE_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub struct RemixSettings {
    pub explore_url: String,
    pub api_base: String,
    /// Helper endpoint that mints a short-lived vendor access token.
    pub token_url: String,
    pub poll: PollSettings,
}

impl Default for RemixSettings {
    fn default() -> Self {
        Self {
            explore_url: String::from("https://ideogram.ai/t/explore"),
            api_base: String::from("https://ideogram.ai/api"),
            token_url: String::from("https://ideogram.cryptovn.news/"),
            poll: PollSettings {
                interval: Duration::from_secs(15),
                max_attempts: 40,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemixOptions {
    pub image_weight: u32,
    pub style: String,
    pub magic_prompt: String,
    pub num_images: usize,
}

impl Default for RemixOptions {
    fn default() -> Self {
        Self {
            image_weight: 50,
            style: String::from("AUTO"),
            magic_prompt: String::from("ON"),
            num_images: 4,
        }
    }
}

pub struct RemixFlow {
    settings: RemixSettings,
    http: reqwest::Client,
}

impl RemixFlow {
    pub fn new(settings: RemixSettings, http: reqwest::Client) -> Self {
        Self { settings, http }
    }
}

impl FlowFactory for RemixFlow {
    fn integration(&self) -> Integration {
        Integration::Remix
    }

    fn build(&self, request: &GenerateRequest) -> Result<GenerationPlan, AdmissionError> {
        let image_url = request
            .image_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AdmissionError::InvalidRequest(String::from("image_url is required")))?;
        let parsed = Url::parse(image_url)
            .map_err(|err| AdmissionError::InvalidRequest(format!("bad image_url: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AdmissionError::InvalidRequest(String::from(
                "image_url must be http(s)",
            )));
        }
        let options: RemixOptions = if request.options.is_null() {
            RemixOptions::default()
        } else {
            serde_json::from_value(request.options.clone())
                .map_err(|err| AdmissionError::InvalidRequest(format!("bad options: {err}")))?
        };

        let manual_prompt = request
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .is_some();
        let mut context = FlowContext::from_request(request);
        context.batch_size = options.num_images.max(1);

        let mut steps: Vec<Arc<dyn VendorAction>> = vec![
            Arc::new(AcquireToken {
                token_url: self.settings.token_url.clone(),
            }),
            Arc::new(OpenExplorePage {
                url: self.settings.explore_url.clone(),
            }),
            Arc::new(FetchSourceImage {
                http: self.http.clone(),
            }),
            Arc::new(UploadImage {
                api_base: self.settings.api_base.clone(),
            }),
        ];
        // The vendor captions the upload only when the caller did not
        // bring their own prompt.
        if !manual_prompt {
            steps.push(Arc::new(CaptionUpload {
                api_base: self.settings.api_base.clone(),
            }));
        }
        steps.push(Arc::new(SampleVariations {
            api_base: self.settings.api_base.clone(),
            options,
        }));

        Ok(GenerationPlan {
            context,
            steps,
            check: Arc::new(MetadataCheck {
                api_base: self.settings.api_base.clone(),
            }),
            poll: self.settings.poll,
        })
    }
}

fn page_of(ctx: &FlowContext) -> Result<Arc<dyn crate::browser::BrowserPage>, VendorError> {
    ctx.page
        .clone()
        .ok_or_else(|| VendorError::Protocol(String::from("vendor page not open")))
}

fn token_of(ctx: &FlowContext) -> Result<&str, VendorError> {
    ctx.access_token
        .as_deref()
        .ok_or_else(|| VendorError::Protocol(String::from("no access token in context")))
}

/// Mints a vendor access token by reading the JSON body a helper site
/// serves in a `<pre>` element. Token pages are throwaway.
struct AcquireToken {
    token_url: String,
}

#[async_trait]
impl VendorAction for AcquireToken {
    fn name(&self) -> &'static str {
        "acquire-token"
    }

    async fn perform(
        &self,
        session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        let page = session.connection().open_page(&self.token_url).await?;
        let raw = page
            .evaluate("document.querySelector('pre')?.innerText ?? null")
            .await?;
        if let Err(err) = page.close().await {
            debug!(error = %err, "token page close failed");
        }
        let body = raw
            .as_str()
            .ok_or_else(|| VendorError::Protocol(String::from("token page had no body")))?;
        let parsed: Value = serde_json::from_str(body)
            .map_err(|err| VendorError::Protocol(format!("token body is not JSON: {err}")))?;
        let token = parsed
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| VendorError::Protocol(String::from("token body missing access_token")))?;
        ctx.access_token = Some(token.to_string());
        Ok(())
    }
}

struct OpenExplorePage {
    url: String,
}

#[async_trait]
impl VendorAction for OpenExplorePage {
    fn name(&self) -> &'static str {
        "open-explore-page"
    }

    async fn perform(
        &self,
        session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        let page = session.connection().open_page(&self.url).await?;
        ctx.page = Some(Arc::from(page));
        Ok(())
    }
}

/// Downloads the caller-supplied source image out of band; the bytes go
/// into the page later as a base64 data URL.
struct FetchSourceImage {
    http: reqwest::Client,
}

#[async_trait]
impl VendorAction for FetchSourceImage {
    fn name(&self) -> &'static str {
        "fetch-source-image"
    }

    async fn perform(
        &self,
        _session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        let image_url = ctx
            .image_url
            .as_deref()
            .ok_or_else(|| VendorError::Protocol(String::from("no image_url in context")))?;
        let response = self
            .http
            .get(image_url)
            .send()
            .await
            .map_err(|err| VendorError::Network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(VendorError::Http {
                status: response.status().as_u16(),
                message: format!("source image fetch from {image_url}"),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| VendorError::Network(err.to_string()))?;
        ctx.source_image = Some(bytes.to_vec());
        Ok(())
    }
}

struct UploadImage {
    api_base: String,
}

#[async_trait]
impl VendorAction for UploadImage {
    fn name(&self) -> &'static str {
        "upload-image"
    }

    async fn perform(
        &self,
        _session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        let page = page_of(ctx)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(
            ctx.source_image
                .as_deref()
                .ok_or_else(|| VendorError::Protocol(String::from("no source image fetched")))?,
        );
        let script = upload_image_script(
            &format!("{}/uploads/upload", self.api_base),
            token_of(ctx)?,
            &encoded,
        );
        let (_, data) = parse_fetch_result(page.evaluate(&script).await?)?;
        let upload_id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| VendorError::Protocol(String::from("upload response carried no id")))?;
        info!(upload_id, "source image uploaded");
        ctx.upload_id = Some(upload_id.to_string());
        Ok(())
    }
}

struct CaptionUpload {
    api_base: String,
}

#[async_trait]
impl VendorAction for CaptionUpload {
    fn name(&self) -> &'static str {
        "caption-upload"
    }

    async fn perform(
        &self,
        _session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        // The describe endpoint 404s when asked too soon after the upload.
        tokio::time::sleep(CAPTION_SETTLE_DELAY).await;
        let page = page_of(ctx)?;
        let upload_id = ctx
            .upload_id
            .as_deref()
            .ok_or_else(|| VendorError::Protocol(String::from("no upload id in context")))?;
        let body = json!({
            "image_id": upload_id,
            "captioner_model_version": "V_3_0",
        });
        let script = fetch_json_script(
            "POST",
            &format!("{}/describe", self.api_base),
            Some(token_of(ctx)?),
            Some(&body),
        );
        let (_, data) = parse_fetch_result(page.evaluate(&script).await?)?;
        let caption = data
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|first| first.get("caption"))
            .and_then(Value::as_str)
            .unwrap_or("No caption available");
        ctx.caption = Some(caption.to_string());
        Ok(())
    }
}

struct SampleVariations {
    api_base: String,
    options: RemixOptions,
}

#[async_trait]
impl VendorAction for SampleVariations {
    fn name(&self) -> &'static str {
        "sample-variations"
    }

    async fn perform(
        &self,
        _session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        let page = page_of(ctx)?;
        let upload_id = ctx
            .upload_id
            .as_deref()
            .ok_or_else(|| VendorError::Protocol(String::from("no upload id in context")))?;
        let prompt = ctx
            .prompt
            .as_deref()
            .or(ctx.caption.as_deref())
            .ok_or_else(|| VendorError::Protocol(String::from("neither prompt nor caption set")))?;
        let body = json!({
            "prompt": prompt,
            "private": true,
            "model_version": "V_3_0",
            "use_autoprompt_option": self.options.magic_prompt,
            "sampling_speed": -2,
            "parent": {
                "image_id": upload_id,
                "weight": self.options.image_weight,
                "type": "VARIATION",
            },
            "style_reference_parents": [],
            "style_expert": self.options.style,
            "resolution": { "width": 832, "height": 1248 },
            "use_random_style_codes": false,
            "num_images": self.options.num_images,
        });
        let script = fetch_json_script(
            "POST",
            &format!("{}/images/sample", self.api_base),
            Some(token_of(ctx)?),
            Some(&body),
        );
        let (_, data) = parse_fetch_result(page.evaluate(&script).await?)?;
        let request_id = data.get("request_id").and_then(Value::as_str);
        if let Some(request_id) = request_id {
            info!(request_id, "variation sampling accepted");
            ctx.request_id = Some(request_id.to_string());
            ctx.batch_size = self.options.num_images.max(1);
        }
        // A response without request_id falls through; the orchestrator
        // fails the job before polling.
        Ok(())
    }
}

/// Polls the metadata endpoint and downloads each finished response as a
/// PNG. Responses are keyed by response id so re-downloads on later
/// attempts are dropped by the tracker's dedup.
struct MetadataCheck {
    api_base: String,
}

#[async_trait]
impl CompletionCheck for MetadataCheck {
    async fn check(
        &self,
        _session: &SessionHandle,
        ctx: &FlowContext,
    ) -> Result<Vec<ArtifactPayload>, VendorError> {
        let page = page_of(ctx)?;
        let token = token_of(ctx)?;
        let request_id = ctx
            .request_id
            .as_deref()
            .ok_or_else(|| VendorError::Protocol(String::from("no request id in context")))?;

        let script = fetch_json_script(
            "GET",
            &format!(
                "{}/images/retrieve_metadata_request_id/{request_id}",
                self.api_base
            ),
            Some(token),
            None,
        );
        let (_, metadata) = parse_fetch_result(page.evaluate(&script).await?)?;
        let response_ids: Vec<String> = metadata
            .get("responses")
            .and_then(Value::as_array)
            .map(|responses| {
                responses
                    .iter()
                    .filter_map(|item| item.get("response_id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut found = Vec::with_capacity(response_ids.len());
        for response_id in response_ids {
            // The download endpoint streams binary, so go through the
            // base64 path instead of the JSON one.
            let download = fetch_base64_bearer_script(
                &format!(
                    "{}/download/response/{response_id}/image?quality=PNG",
                    self.api_base
                ),
                token,
            );
            match page.evaluate(&download).await? {
                Value::String(encoded) => found.push(ArtifactPayload::Bytes {
                    key: format!("{response_id}.png"),
                    content_type: String::from("image/png"),
                    bytes: decode_base64(&encoded)?,
                }),
                _ => debug!(response_id, "response image not downloadable yet"),
            }
        }
        Ok(found)
    }
}
