//! Prompt-to-image integration: submit a CLI-flagged prompt through the
//! vendor's imagine page, then probe its CDN for each image of the batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::runtime::poll::PollSettings;
use crate::runtime::session::SessionHandle;
use crate::runtime::{
    AdmissionError, ArtifactPayload, CompletionCheck, FlowContext, GenerateRequest,
    GenerationPlan, VendorAction, VendorError,
};
use crate::vendors::support::{
    decode_base64, fetch_base64_script, fetch_json_script, parse_fetch_result,
};
use crate::vendors::{FlowFactory, Integration};

const PROMPT_INPUT_SELECTOR: &str = "textarea#desktop_input_bar";
const SUBMIT_MAX_RETRIES: u32 = 3;
const DEFAULT_BATCH_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct PromptImageSettings {
    pub imagine_url: String,
    pub cdn_base: String,
    /// Base delay of the linear submit backoff (attempt n waits n times this).
    pub retry_delay: Duration,
    pub poll: PollSettings,
}

impl Default for PromptImageSettings {
    fn default() -> Self {
        Self {
            imagine_url: String::from("https://www.midjourney.com/imagine"),
            cdn_base: String::from("https://cdn.midjourney.com"),
            retry_delay: Duration::from_secs(2),
            poll: PollSettings {
                interval: Duration::from_secs(15),
                max_attempts: 24,
            },
        }
    }
}

/// Tuning flags appended to the prompt in the vendor's CLI syntax.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PromptFlags {
    pub chaos: u32,
    pub ar: String,
    pub stylize: u32,
    pub weird: u32,
    pub version: u32,
    pub quality: Option<String>,
    pub stop: Option<u32>,
    pub tile: bool,
    pub niji: bool,
}

impl Default for PromptFlags {
    fn default() -> Self {
        Self {
            chaos: 5,
            ar: String::from("4:3"),
            stylize: 150,
            weird: 200,
            version: 7,
            quality: None,
            stop: None,
            tile: false,
            niji: false,
        }
    }
}

/// Strips quote characters and backslashes that the vendor's CLI-style
/// parser would misread as parameter flags, then collapses whitespace.
pub fn sanitize_prompt(description: &str) -> String {
    let stripped: String = description
        .chars()
        .filter(|c| !matches!(c, '\u{201C}' | '\u{201D}' | '\u{2018}' | '\u{2019}' | '"' | '\'' | '`' | '\\'))
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn build_full_prompt(description: &str, flags: &PromptFlags) -> String {
    let mut prompt = sanitize_prompt(description);
    prompt.push_str(&format!(" --chaos {}", flags.chaos));
    prompt.push_str(&format!(" --ar {}", flags.ar));
    prompt.push_str(&format!(" --stylize {}", flags.stylize));
    prompt.push_str(&format!(" --weird {}", flags.weird));
    prompt.push_str(&format!(" --v {}", flags.version));
    if let Some(quality) = &flags.quality {
        prompt.push_str(&format!(" --q {quality}"));
    }
    if let Some(stop) = flags.stop {
        prompt.push_str(&format!(" --stop {stop}"));
    }
    if flags.tile {
        prompt.push_str(" --tile");
    }
    if flags.niji {
        prompt.push_str(" --niji");
    }
    prompt
}

pub struct PromptImageFlow {
    settings: PromptImageSettings,
}

impl PromptImageFlow {
    pub fn new(settings: PromptImageSettings) -> Self {
        Self { settings }
    }
}

impl FlowFactory for PromptImageFlow {
    fn integration(&self) -> Integration {
        Integration::PromptImage
    }

    fn build(&self, request: &GenerateRequest) -> Result<GenerationPlan, AdmissionError> {
        let description = request
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AdmissionError::InvalidRequest(String::from("prompt is required")))?;
        let flags: PromptFlags = if request.options.is_null() {
            PromptFlags::default()
        } else {
            serde_json::from_value(request.options.clone())
                .map_err(|err| AdmissionError::InvalidRequest(format!("bad options: {err}")))?
        };

        let mut context = FlowContext::from_request(request);
        context.prompt = Some(build_full_prompt(description, &flags));
        context.batch_size = DEFAULT_BATCH_SIZE;

        Ok(GenerationPlan {
            context,
            steps: vec![
                Arc::new(OpenImaginePage {
                    url: self.settings.imagine_url.clone(),
                }),
                Arc::new(SubmitJob {
                    retry_delay: self.settings.retry_delay,
                }),
            ],
            check: Arc::new(CdnProbe {
                cdn_base: self.settings.cdn_base.clone(),
            }),
            poll: self.settings.poll,
        })
    }
}

struct OpenImaginePage {
    url: String,
}

#[async_trait]
impl VendorAction for OpenImaginePage {
    fn name(&self) -> &'static str {
        "open-imagine-page"
    }

    async fn perform(
        &self,
        session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        let page = session.connection().open_page(&self.url).await?;
        page.wait_for_selector(PROMPT_INPUT_SELECTOR, Duration::from_secs(10))
            .await?;
        ctx.page = Some(Arc::from(page));
        Ok(())
    }
}

/// Submits the prompt through the page's own jobs API. Server-side 5xx
/// responses are retried with a linear backoff; the first 2xx wins.
struct SubmitJob {
    retry_delay: Duration,
}

impl SubmitJob {
    fn submit_body(prompt: &str) -> Value {
        json!({
            "t": "imagine",
            "prompt": prompt,
            "metadata": {
                "imagePrompts": 1,
                "imageReferences": 0,
                "characterReferences": 0,
            },
        })
    }

    fn extract_job(data: &Value) -> Option<(String, usize)> {
        if let Some(job_id) = data.get("jobId").and_then(Value::as_str) {
            return Some((job_id.to_string(), DEFAULT_BATCH_SIZE));
        }
        let first = data.get("data")?.get("success")?.get(0)?;
        let job_id = first.get("job_id")?.as_str()?.to_string();
        let batch = first
            .get("meta")
            .and_then(|meta| meta.get("batch_size"))
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        Some((job_id, batch))
    }
}

#[async_trait]
impl VendorAction for SubmitJob {
    fn name(&self) -> &'static str {
        "submit-job"
    }

    async fn perform(
        &self,
        _session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        let page = ctx
            .page
            .as_ref()
            .ok_or_else(|| VendorError::Protocol(String::from("imagine page not open")))?
            .clone();
        let prompt = ctx
            .prompt
            .as_deref()
            .ok_or_else(|| VendorError::Protocol(String::from("no prompt in context")))?;
        let script =
            fetch_json_script("POST", "/api/submit-jobs", None, Some(&Self::submit_body(prompt)));

        let mut last_error = None;
        for attempt in 1..=SUBMIT_MAX_RETRIES {
            match parse_fetch_result(page.evaluate(&script).await?) {
                Ok((_, data)) => {
                    let (job_id, batch) = Self::extract_job(&data).ok_or_else(|| {
                        VendorError::Protocol(String::from("submit response carried no job id"))
                    })?;
                    info!(vendor_job = job_id, batch, attempt, "prompt submitted");
                    ctx.request_id = Some(job_id);
                    ctx.batch_size = batch;
                    return Ok(());
                }
                Err(err @ VendorError::Http { status, .. }) if status >= 500 => {
                    warn!(attempt, status, "submit rejected; backing off");
                    last_error = Some(err);
                }
                Err(err @ VendorError::Network(_)) => {
                    warn!(attempt, error = %err, "submit fetch failed; backing off");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
            if attempt < SUBMIT_MAX_RETRIES {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
        }
        Err(last_error
            .unwrap_or_else(|| VendorError::Protocol(String::from("submit retries exhausted"))))
    }
}

/// The vendor exposes finished images on a predictable CDN path per batch
/// index; an index that 404s simply is not ready yet.
struct CdnProbe {
    cdn_base: String,
}

#[async_trait]
impl CompletionCheck for CdnProbe {
    async fn check(
        &self,
        _session: &SessionHandle,
        ctx: &FlowContext,
    ) -> Result<Vec<ArtifactPayload>, VendorError> {
        let page = ctx
            .page
            .as_ref()
            .ok_or_else(|| VendorError::Protocol(String::from("imagine page not open")))?;
        let vendor_job = ctx
            .request_id
            .as_deref()
            .ok_or_else(|| VendorError::Protocol(String::from("no vendor job id")))?;

        let mut found = Vec::new();
        for idx in 0..ctx.batch_size.max(1) {
            let file_name = format!("0_{idx}.png");
            let url = format!("{}/{vendor_job}/{file_name}", self.cdn_base);
            match page.evaluate(&fetch_base64_script(&url)).await? {
                Value::String(encoded) => {
                    found.push(ArtifactPayload::Bytes {
                        key: file_name,
                        content_type: String::from("image/png"),
                        bytes: decode_base64(&encoded)?,
                    });
                }
                _ => debug!(vendor_job, idx, "image not on the cdn yet"),
            }
        }
        Ok(found)
    }
}
