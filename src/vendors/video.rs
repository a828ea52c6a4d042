//! Video-generation integration: drive the assistant's video tool by
//! clicking through its button UI, submit the prompt, then wait for a
//! `<video>` element to carry a playable source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::runtime::poll::PollSettings;
use crate::runtime::session::SessionHandle;
use crate::runtime::{
    AdmissionError, ArtifactPayload, CompletionCheck, FlowContext, GenerateRequest,
    GenerationPlan, VendorAction, VendorError,
};
use crate::vendors::{FlowFactory, Integration};

const PROMPT_SELECTOR: &str = "[role=\"textbox\"], textarea, input[type=\"text\"]";

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub assistant_url: String,
    /// Visible label of the tools menu button.
    pub tools_label: String,
    /// Visible label of the video tool inside the menu.
    pub tool_label: String,
    pub poll: PollSettings,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            assistant_url: String::from("https://gemini.google.com/app"),
            tools_label: String::from("Tools"),
            tool_label: String::from("Veo"),
            poll: PollSettings {
                interval: Duration::from_secs(10),
                max_attempts: 60,
            },
        }
    }
}

pub struct VideoFlow {
    settings: VideoSettings,
}

impl VideoFlow {
    pub fn new(settings: VideoSettings) -> Self {
        Self { settings }
    }
}

impl FlowFactory for VideoFlow {
    fn integration(&self) -> Integration {
        Integration::Video
    }

    fn build(&self, request: &GenerateRequest) -> Result<GenerationPlan, AdmissionError> {
        if !request
            .prompt
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty())
        {
            return Err(AdmissionError::InvalidRequest(String::from(
                "prompt is required",
            )));
        }

        let mut context = FlowContext::from_request(request);
        context.batch_size = 1;

        Ok(GenerationPlan {
            context,
            steps: vec![
                Arc::new(OpenAssistant {
                    url: self.settings.assistant_url.clone(),
                }),
                Arc::new(SelectVideoTool {
                    tools_label: self.settings.tools_label.clone(),
                    tool_label: self.settings.tool_label.clone(),
                }),
                Arc::new(SubmitVideoPrompt),
            ],
            check: Arc::new(VideoElementCheck),
            poll: self.settings.poll,
        })
    }
}

fn click_by_text_script(label: &str) -> String {
    format!(
        r#"(() => {{
  const target = Array.from(document.querySelectorAll('button'))
    .find(b => (b.textContent || '').includes({label}));
  if (!target) return false;
  target.click();
  return true;
}})()"#,
        label = Value::String(label.to_string()),
    )
}

struct OpenAssistant {
    url: String,
}

#[async_trait]
impl VendorAction for OpenAssistant {
    fn name(&self) -> &'static str {
        "open-assistant"
    }

    async fn perform(
        &self,
        session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        // Login rides the persistent browser profile.
        let page = session.connection().open_page(&self.url).await?;
        ctx.page = Some(Arc::from(page));
        Ok(())
    }
}

struct SelectVideoTool {
    tools_label: String,
    tool_label: String,
}

#[async_trait]
impl VendorAction for SelectVideoTool {
    fn name(&self) -> &'static str {
        "select-video-tool"
    }

    async fn perform(
        &self,
        _session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        let page = ctx
            .page
            .clone()
            .ok_or_else(|| VendorError::Protocol(String::from("assistant page not open")))?;

        for label in [&self.tools_label, &self.tool_label] {
            let clicked = page.evaluate(&click_by_text_script(label)).await?;
            if clicked != Value::Bool(true) {
                return Err(VendorError::Protocol(format!(
                    "button {label:?} not found on the page"
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        page.wait_for_selector(PROMPT_SELECTOR, Duration::from_secs(60))
            .await?;
        Ok(())
    }
}

/// Submits the prompt. The vendor never hands back an id for the run, so
/// a synthetic one marks the submission as accepted; completion is
/// observed on the page itself.
struct SubmitVideoPrompt;

#[async_trait]
impl VendorAction for SubmitVideoPrompt {
    fn name(&self) -> &'static str {
        "submit-video-prompt"
    }

    async fn perform(
        &self,
        _session: &SessionHandle,
        ctx: &mut FlowContext,
    ) -> Result<(), VendorError> {
        let page = ctx
            .page
            .clone()
            .ok_or_else(|| VendorError::Protocol(String::from("assistant page not open")))?;
        let prompt = ctx
            .prompt
            .as_deref()
            .ok_or_else(|| VendorError::Protocol(String::from("no prompt in context")))?;

        page.type_text(PROMPT_SELECTOR, prompt).await?;
        page.press_key(PROMPT_SELECTOR, "Enter").await?;

        let submission_id = format!("submission-{}", Uuid::new_v4());
        info!(submission_id, "video prompt submitted");
        ctx.request_id = Some(submission_id);
        Ok(())
    }
}

/// A finished run surfaces as a `<video>` element with a resolvable
/// source URL.
struct VideoElementCheck;

const VIDEO_SRC_PROBE: &str = r#"(() => {
  const video = document.querySelector('video');
  if (!video) return null;
  return video.currentSrc || video.src || null;
})()"#;

#[async_trait]
impl CompletionCheck for VideoElementCheck {
    async fn check(
        &self,
        _session: &SessionHandle,
        ctx: &FlowContext,
    ) -> Result<Vec<ArtifactPayload>, VendorError> {
        let page = ctx
            .page
            .clone()
            .ok_or_else(|| VendorError::Protocol(String::from("assistant page not open")))?;
        match page.evaluate(VIDEO_SRC_PROBE).await? {
            Value::String(src) if !src.is_empty() => {
                Ok(vec![ArtifactPayload::Reference(src)])
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::browser::{BrowserPage, BrowserSession};
    use crate::runtime::session::{LaunchedSession, SessionBackend, SessionError, SessionManager};

    #[test]
    fn build_requires_a_prompt() {
        let flow = VideoFlow::new(VideoSettings::default());
        assert!(matches!(
            flow.build(&GenerateRequest::default()),
            Err(AdmissionError::InvalidRequest(_))
        ));
        assert!(flow
            .build(&GenerateRequest {
                prompt: Some(String::from("a drone shot of a fjord")),
                ..GenerateRequest::default()
            })
            .is_ok());
    }

    #[test]
    fn click_script_embeds_the_label_as_json() {
        let script = click_by_text_script("Tạo video");
        assert!(script.contains(r#".includes("Tạo video")"#));
    }

    struct ScriptedPage {
        evaluations: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl BrowserPage for ScriptedPage {
        async fn goto(&self, _url: &str) -> Result<(), VendorError> {
            Ok(())
        }

        async fn type_text(&self, _selector: &str, _text: &str) -> Result<(), VendorError> {
            Ok(())
        }

        async fn press_key(&self, _selector: &str, _key: &str) -> Result<(), VendorError> {
            Ok(())
        }

        async fn evaluate(&self, _expression: &str) -> Result<Value, VendorError> {
            let mut evaluations = self.evaluations.lock().expect("evaluations lock");
            if evaluations.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(evaluations.remove(0))
            }
        }

        async fn evaluate_on_new_document(&self, _script: &str) -> Result<(), VendorError> {
            Ok(())
        }

        async fn wait_for_selector(
            &self,
            _selector: &str,
            _timeout: Duration,
        ) -> Result<(), VendorError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), VendorError> {
            Ok(())
        }
    }

    struct NoPages;

    #[async_trait]
    impl BrowserSession for NoPages {
        async fn open_page(&self, _url: &str) -> Result<Box<dyn BrowserPage>, VendorError> {
            Err(VendorError::Protocol(String::from("no pages in tests")))
        }
    }

    struct InstantBackend;

    #[async_trait]
    impl SessionBackend for InstantBackend {
        async fn launch(&self) -> Result<LaunchedSession, SessionError> {
            Ok(LaunchedSession {
                connection: Arc::new(NoPages),
                alive: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            })
        }
    }

    async fn session() -> Arc<SessionHandle> {
        SessionManager::new("test", Arc::new(InstantBackend))
            .acquire()
            .await
            .expect("session")
    }

    fn ctx_with(evaluations: Vec<Value>) -> FlowContext {
        FlowContext {
            prompt: Some(String::from("a drone shot of a fjord")),
            page: Some(Arc::new(ScriptedPage {
                evaluations: Mutex::new(evaluations),
            })),
            batch_size: 1,
            ..FlowContext::default()
        }
    }

    #[tokio::test]
    async fn tool_selection_fails_when_a_button_is_missing() {
        let mut ctx = ctx_with(vec![Value::Bool(true), Value::Bool(false)]);
        let step = SelectVideoTool {
            tools_label: String::from("Tools"),
            tool_label: String::from("Veo"),
        };

        assert!(matches!(
            step.perform(&*session().await, &mut ctx).await,
            Err(VendorError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn submit_always_sets_a_submission_marker() {
        let mut ctx = ctx_with(Vec::new());
        SubmitVideoPrompt
            .perform(&*session().await, &mut ctx)
            .await
            .expect("submit");
        assert!(ctx
            .request_id
            .as_deref()
            .is_some_and(|id| id.starts_with("submission-")));
    }

    #[tokio::test]
    async fn check_reports_the_video_source_once_present() {
        let ctx = ctx_with(vec![Value::String(String::from(
            "https://cdn.example/video.mp4",
        ))]);
        let found = VideoElementCheck
            .check(&*session().await, &ctx)
            .await
            .expect("check");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key(), "https://cdn.example/video.mp4");
    }

    #[tokio::test]
    async fn check_is_empty_while_the_video_renders() {
        let ctx = ctx_with(vec![Value::Null]);
        let found = VideoElementCheck
            .check(&*session().await, &ctx)
            .await
            .expect("check");
        assert!(found.is_empty());
    }
}
