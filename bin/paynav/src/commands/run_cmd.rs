use paynav_agent::{spawn_navigation_agent, AgentEvent, NavigationRequest, StatusLevel};
use paynav_core::Paths;
use paynav_providers::OpenAIProvider;
use paynav_tools::ChromeLauncher;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RunArgs {
    pub goal: String,
    pub url: Option<String>,
    pub site: Option<String>,
    pub target: String,
    pub synonyms: Vec<String>,
}

/// Run the navigation agent once and print its verdict.
pub async fn run(override_path: Option<&Path>, args: RunArgs) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = super::load_config(&paths, override_path)?;

    let start_url = match (args.url, args.site) {
        (Some(url), _) => url,
        (None, Some(site)) => config.seed_url(&site)?.to_string(),
        (None, None) => anyhow::bail!("Either --url or --site is required"),
    };

    let api_key = config.api_key().ok_or_else(|| {
        anyhow::anyhow!("No API key. Set provider.apiKey in the config or PAYNAV_API_KEY.")
    })?;
    let provider = Arc::new(OpenAIProvider::from_config(&config.provider, &api_key));
    let launcher = Arc::new(ChromeLauncher::new(
        config.browser.clone(),
        paths.browser_profiles_dir(),
    ));

    let request = NavigationRequest {
        goal: args.goal,
        start_url,
        target: args.target,
        synonyms: args.synonyms,
    };
    info!(model = %config.provider.model, start_url = %request.start_url, "Starting run");

    let mut handle = spawn_navigation_agent(config, provider, launcher, request);

    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let mut mid_line = false;
    while let Some(event) = handle.events.recv().await {
        match event {
            AgentEvent::TextDelta { text } => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
                mid_line = !text.ends_with('\n');
            }
            other => {
                if mid_line {
                    println!();
                    mid_line = false;
                }
                print_event(&other);
            }
        }
    }

    let report = handle.join.await?;
    println!();
    println!("{}", serde_json::to_string_pretty(&report.verdict)?);
    if !report.verdict.reached {
        std::process::exit(2);
    }
    Ok(())
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::Status(status) => {
            let icon = match status.level {
                StatusLevel::Info => "•",
                StatusLevel::Success => "✓",
                StatusLevel::Warning => "!",
                StatusLevel::Error => "✗",
            };
            println!("{} {}", icon, status.message);
        }
        AgentEvent::ToolStarted { name, arguments, .. } => {
            println!("  → {} {}", name, arguments);
        }
        // Tool results are summarized by their status line.
        AgentEvent::ToolFinished { .. } | AgentEvent::TextDelta { .. } | AgentEvent::Finished(_) => {}
    }
}
