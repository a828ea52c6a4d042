//! Chat-assistant integration: paste an optional source image into the
//! conversation composer, type the prompt, submit, then watch the asset
//! pointers the page's patched `fetch` collects from the SSE stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use tracing::{debug, info};

use crate::runtime::poll::PollSettings;
use crate::runtime::session::SessionHandle;
use crate::runtime::{
    AdmissionError, ArtifactPayload, CompletionCheck, FlowContext, GenerateRequest,
    GenerationPlan, VendorAction, VendorError,
};
use crate::vendors::{FlowFactory, Integration};

const PROMPT_SELECTOR: &str = "#prompt-textarea[contenteditable=\"true\"]";

/// Runs before any document load: patches `fetch` so conversation id and
/// generated asset pointers are scraped out of the streamed response and
/// parked on `window` for later evaluation.
const CAPTURE_HOOK: &str = r#"
const _origFetch = window.fetch.bind(window);
window.__conversationId = null;
window.__assetPointers = [];
window.fetch = async (...args) => {
  const response = await _origFetch(...args);
  if (typeof args[0] === 'string' && args[0].includes('/backend-api/conversation')) {
    try {
      const reader = response.clone().body.getReader();
      const decoder = new TextDecoder('utf-8');
      let buffer = '';
      let done = false;
      while (!done) {
        const { value, done: rd } = await reader.read();
        if (value) {
          buffer += decoder.decode(value, { stream: true });
          if (!window.__conversationId) {
            const m = /"conversation_id"\s*:\s*"([^"]+)"/.exec(buffer);
            if (m) window.__conversationId = m[1];
          }
          const directRe = /"asset_pointer"\s*:\s*"([^"]+)"/g;
          let dm;
          while ((dm = directRe.exec(buffer))) {
            if (!window.__assetPointers.includes(dm[1])) {
              window.__assetPointers.push(dm[1]);
            }
          }
        }
        done = rd;
      }
    } catch (e) {}
  }
  return response;
};
"#;

#[derive(Debug, Clone)]
pub struct ChatImageSettings {
    pub target_url: String,
    /// How long the composer needs to ingest a pasted image before the
    /// prompt can be submitted.
    pub paste_settle: Duration,
    pub poll: PollSettings,
}

impl Default for ChatImageSettings {
    fn default() -> Self {
        Self {
            target_url: String::from("https://chatgpt.com"),
            paste_settle: Duration::from_secs(12),
            poll: PollSettings {
                interval: Duration::from_millis(1500),
                max_attempts: 30,
            },
        }
    }
}

pub struct ChatImageFlow {
    settings: ChatImageSettings,
    http: reqwest::Client,
}

impl ChatImageFlow {
    pub fn new(settings: ChatImageSettings, http: reqwest::Client) -> Self {
        Self { settings, http }
    }
}

impl FlowFactory for ChatImageFlow {
    fn integration(&self) -> Integration {
        Integration::ChatImage
    }

    fn build(&self, request: &GenerateRequest) -> Result<GenerationPlan, AdmissionError> {
        let has_prompt = request
            .prompt
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty());
        let has_image = request
            .image_url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty());
        if !has_prompt && !has_image {
            return Err(AdmissionError::InvalidRequest(String::from(
                "prompt or image_url is required",
            )));
        }

        let mut context = FlowContext::from_request(request);
        context.batch_size = 1;

        let mut steps: Vec<Arc<dyn VendorAction>> = vec![Arc::new(OpenConversation {
            url: self.settings.target_url.clone(),
        })];
        if has_image {
            steps.push(Arc::new(PasteImage {
                http: self.http.clone(),
                settle: self.settings.paste_settle,
            }));
        }
        steps.push(Arc::new(SubmitPrompt));

        Ok(GenerationPlan {
            context,
            steps,
            check: Arc::new(AssetPointerCheck),
            poll: self.settings.poll,
        })
    }
}

struct OpenConversation {
    url: String,
}

#[async_trait]
impl VendorAction for OpenConversation {
    fn name(&self) -> &'static str {
        "open-conversation"
    }

    async fn perform(
        &self,
        session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        // The capture hook must be in place before the app loads.
        let page = session.connection().open_page("about:blank").await?;
        page.evaluate_on_new_document(CAPTURE_HOOK).await?;
        page.goto(&self.url).await?;
        page.wait_for_selector(PROMPT_SELECTOR, Duration::from_secs(30))
            .await?;
        ctx.page = Some(Arc::from(page));
        Ok(())
    }
}

/// Downloads the source image and replays it into the composer as a
/// synthetic clipboard paste.
struct PasteImage {
    http: reqwest::Client,
    settle: Duration,
}

impl PasteImage {
    fn paste_script(base64_png: &str, mime: &str) -> String {
        format!(
            r#"(() => {{
  const byteString = atob({base64});
  const bytes = new Uint8Array(byteString.length);
  for (let i = 0; i < byteString.length; i++) bytes[i] = byteString.charCodeAt(i);
  const file = new File([new Blob([bytes], {{ type: {mime} }})], 'pasted-image.png', {{ type: {mime} }});
  const dataTransfer = new DataTransfer();
  dataTransfer.items.add(file);
  const editable = document.querySelector({selector});
  if (!editable) return false;
  editable.dispatchEvent(new ClipboardEvent('paste', {{
    clipboardData: dataTransfer,
    bubbles: true,
    cancelable: true,
  }}));
  return true;
}})()"#,
            base64 = Value::String(base64_png.to_string()),
            mime = Value::String(mime.to_string()),
            selector = Value::String(PROMPT_SELECTOR.to_string()),
        )
    }
}

#[async_trait]
impl VendorAction for PasteImage {
    fn name(&self) -> &'static str {
        "paste-image"
    }

    async fn perform(
        &self,
        _session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        let page = ctx
            .page
            .clone()
            .ok_or_else(|| VendorError::Protocol(String::from("conversation page not open")))?;
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
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| VendorError::Network(err.to_string()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);

        let pasted = page
            .evaluate(&Self::paste_script(&encoded, &mime))
            .await?;
        if pasted != Value::Bool(true) {
            return Err(VendorError::Protocol(String::from(
                "composer rejected the pasted image",
            )));
        }
        // Let the upload attach before submitting.
        tokio::time::sleep(self.settle).await;
        Ok(())
    }
}

/// Types the prompt, presses Enter, then waits for the capture hook to
/// surface the conversation id the poll loop keys on.
struct SubmitPrompt;

const CONVERSATION_ID_WAIT: &str = r#"new Promise((resolve) => {
  const started = Date.now();
  const check = () => {
    if (window.__conversationId) return resolve(window.__conversationId);
    if (Date.now() - started > 30000) return resolve(null);
    setTimeout(check, 100);
  };
  check();
})"#;

#[async_trait]
impl VendorAction for SubmitPrompt {
    fn name(&self) -> &'static str {
        "submit-prompt"
    }

    async fn perform(
        &self,
        _session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        let page = ctx
            .page
            .clone()
            .ok_or_else(|| VendorError::Protocol(String::from("conversation page not open")))?;
        if let Some(prompt) = ctx.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            page.type_text(PROMPT_SELECTOR, prompt).await?;
        }
        page.press_key(PROMPT_SELECTOR, "Enter").await?;

        match page.evaluate(CONVERSATION_ID_WAIT).await? {
            Value::String(conversation_id) => {
                info!(conversation_id, "conversation started");
                ctx.request_id = Some(conversation_id);
            }
            other => debug!(?other, "no conversation id surfaced"),
        }
        Ok(())
    }
}

/// Reads whatever asset pointers the capture hook has collected so far.
struct AssetPointerCheck;

#[async_trait]
impl CompletionCheck for AssetPointerCheck {
    async fn check(
        &self,
        _session: &SessionHandle,
        ctx: &FlowContext,
    ) -> Result<Vec<ArtifactPayload>, VendorError> {
        let page = ctx
            .page
            .clone()
            .ok_or_else(|| VendorError::Protocol(String::from("conversation page not open")))?;
        let pointers = page.evaluate("window.__assetPointers || []").await?;
        Ok(pointers
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|pointer| ArtifactPayload::Reference(pointer.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
