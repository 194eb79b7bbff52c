use std::sync::Arc;

use crate::archive::{compress_async, expand_selection, DEFAULT_OUTPUTS};
use crate::error::{Error, Result};
use crate::process::ProcessCommand;
use crate::task::{Task, ARCHIVE_NAME};


const OUTPUT_FILE: &str = "task_output.txt";


impl Task {
    /// Steps run after the engine exits cleanly: the optional post-processing
    /// script, the saved log, the results archive and the bucket upload.
    pub(super) async fn post_process(self: &Arc<Self>, run: u64) -> Result<()> {
        let project = self.project_path();
        let (skip_post_processing, outputs) = {
            let state = self.state.lock().await;
            (state.skip_post_processing, state.outputs.clone())
        };
        let config = self.ctx.config.clone();

        if let (false, Some(script)) = (skip_post_processing, &config.post_processing_script) {
            let Some(process) = self.attach_process(run).await else {
                return Err(Error::Process("Task is no longer running".to_string()));
            };
            let command = ProcessCommand::new(script)
                .args([project.to_string_lossy().into_owned()]);
            tracing::info!(task_id = %self.id, command = %command.command_line(), "Post-processing");

            let code = self.run_logged(run, process, &command).await?;
            if code != 0 {
                return Err(Error::Process(format!("Postprocessing failed ({})", code)));
            }
        }

        if !self.is_current_run(run).await {
            return Err(Error::Process("Task is no longer running".to_string()));
        }

        let log = self.state.lock().await.output.join("\n");
        tokio::fs::write(project.join(OUTPUT_FILE), log).await?;

        let selection: Vec<String> = match outputs {
            Some(outputs) => outputs,
            None => DEFAULT_OUTPUTS.iter().map(|path| path.to_string()).collect(),
        };
        let selected = {
            let project = project.clone();
            tokio::task::spawn_blocking(move || expand_selection(&project, &selection)).await??
        };
        tracing::debug!(task_id = %self.id, entries = selected.len(), "Archiving results");
        compress_async(project.clone(), selected.clone(), project.join(ARCHIVE_NAME)).await?;

        let uploader = &self.ctx.uploader;
        if uploader.enabled() {
            let mut paths = vec![ARCHIVE_NAME.to_string()];
            if config.s3.upload_everything {
                paths.extend(selected);
            }

            let (lines, sink) = self.output_sink(run);
            let on_output = move |line: String| {
                let _ = lines.send(line);
            };
            let result = uploader
                .upload_paths(&project, uploader.bucket(), &self.id, &paths, &on_output)
                .await;
            drop(on_output);
            let _ = sink.await;
            result?;
        }

        Ok(())
    }
}
