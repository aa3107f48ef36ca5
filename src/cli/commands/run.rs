//! CLI command implementation for `flashpipe run`

use anyhow::{bail, Result};
use std::io::Write;
use std::sync::Arc;

use crate::cli::output::{create_run_bar, status, OutputConfig};
use crate::core::orchestrator::FlashRequest;
use crate::core::progress::{PipelineEvent, TerminalEvent};
use crate::core::registry::InFlightDevices;

use super::AppContext;

/// Options for `flashpipe run`
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub device: String,
    pub image: String,
    pub label: Option<String>,
    pub sha256: Option<String>,
    /// Print push-event frames
    pub sse: bool,
}

/// How events reach the terminal
enum Renderer {
    Bar(indicatif::ProgressBar),
    Lines { sse: bool },
}

impl Renderer {
    fn render(&self, event: &PipelineEvent) -> std::io::Result<()> {
        match self {
            Self::Bar(pb) => {
                if let PipelineEvent::Progress(progress) = event {
                    pb.set_prefix(progress.stage.to_string());
                    pb.set_message(progress.message.clone());
                    if let Some(percent) = progress.percent {
                        pb.set_position(percent.round().clamp(0.0, 100.0) as u64);
                    }
                }
                Ok(())
            }
            Self::Lines { sse } => {
                let mut stdout = std::io::stdout().lock();
                if *sse {
                    write!(stdout, "{}", event.to_sse_frame())?;
                } else {
                    writeln!(stdout, "{}", event.to_json())?;
                }
                stdout.flush()
            }
        }
    }
}

/// Execute the run command
pub async fn execute(ctx: &AppContext, options: RunOptions) -> Result<()> {
    let output = OutputConfig::global();
    let orchestrator = ctx.orchestrator(Arc::new(InFlightDevices::new()))?;

    let mut handle = orchestrator.start(FlashRequest {
        device: options.device.clone(),
        image: options.image,
        label: options.label,
        sha256: options.sha256,
    })?;

    let renderer = if options.sse || output.json {
        Renderer::Lines { sse: options.sse }
    } else {
        Renderer::Bar(create_run_bar())
    };

    let mut terminal: Option<TerminalEvent> = None;
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(event) => {
                    renderer.render(&event)?;
                    if let PipelineEvent::Finished(t) = event {
                        terminal = Some(t);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, cancelling run {}", handle.id);
                handle.cancel();
            }
        }
    }

    if let Renderer::Bar(pb) = &renderer {
        pb.finish_and_clear();
    }

    match terminal {
        Some(t) if t.success => {
            if !output.quiet && matches!(renderer, Renderer::Bar(_)) {
                println!(
                    "{} {}",
                    status::SUCCESS,
                    t.message.unwrap_or_else(|| "Done".to_string())
                );
            }
            Ok(())
        }
        Some(t) => {
            if let (Some(detail), Renderer::Bar(_)) = (&t.detail, &renderer) {
                eprintln!("{detail}");
            }
            bail!(
                "{}",
                t.error.unwrap_or_else(|| "Run failed".to_string())
            )
        }
        None => bail!(
            "Run on {} ended without an outcome: verify the target device manually",
            options.device
        ),
    }
}
