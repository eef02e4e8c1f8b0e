//! Brief analyzer: request + chat history -> creative brief.

use crate::error::StageError;
use crate::llm::SharedGenerator;
use crate::task::{CreativeBrief, InitialRequest};

use super::{complete_json, prompts};

pub struct BriefAnalyzer {
    generator: SharedGenerator,
}

impl BriefAnalyzer {
    pub fn new(generator: SharedGenerator) -> Self {
        Self { generator }
    }

    pub async fn analyze(&self, request: &InitialRequest) -> Result<CreativeBrief, StageError> {
        if request.request.trim().is_empty() && request.chat_history.trim().is_empty() {
            return Err(StageError::Content("request is empty".to_string()));
        }

        let prompt = prompts::brief(request);
        let mut brief: CreativeBrief =
            complete_json(self.generator.as_ref(), &prompt, CreativeBrief::validate).await?;

        brief.project_name = brief.project_name.trim().to_string();
        if brief.project_name.is_empty() {
            tracing::debug!("Brief has no projectName; retrieval will be unscoped");
        }
        Ok(brief)
    }
}
