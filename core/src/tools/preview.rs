//! Preview tools. `start-dev-server` reaches here only after the policy
//! gate has confirmed the review state is `Passed`; any port the model
//! passed in the input is never consulted.

use super::ToolContext;
use super::ToolOutput;

pub(super) fn get_preview_url(ctx: &ToolContext) -> ToolOutput {
    match ctx.supervisor.preview_url() {
        Some(url) => ToolOutput {
            output: url.clone(),
            exit_code: None,
            url: Some(url),
            is_error: false,
        },
        None => ToolOutput::error("no preview server is running; start it with start-dev-server"),
    }
}

pub(super) async fn start_dev_server(ctx: &ToolContext) -> ToolOutput {
    match ctx.supervisor.start_dev_server().await {
        Ok(url) => {
            ctx.state.note_dev_server_started();
            ToolOutput {
                output: format!("dev server ready at {url}"),
                exit_code: None,
                url: Some(url),
                is_error: false,
            }
        }
        Err(e) => ToolOutput::error(format!("failed to start dev server: {e}")),
    }
}
